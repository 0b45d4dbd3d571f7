//! Lua workload scripts for Stormweaver
//!
//! Implements the core sandbox traits on top of an embedded Lua 5.4
//! interpreter, one interpreter per worker.

pub mod api;
pub mod sandbox;
pub mod values;

pub use sandbox::{LuaFactory, LuaSandbox, LuaScript, DEFAULT_INSTRUCTION_BUDGET};
