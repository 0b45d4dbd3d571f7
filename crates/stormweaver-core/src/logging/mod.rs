//! JSONL logging.
//!
//! The binary installs [`JsonlLayer`] next to the console formatter when a
//! logs directory is configured. Every `tracing` event then lands as one JSON
//! object per line:
//!
//! ```text
//! logs/
//! ├── raw/                          # one file per workload per day
//! │   └── 2026-01-21_nightly.jsonl
//! └── runs/                         # run metadata (seed, workers, backends)
//!     └── 01JABCDEF....json
//! ```
//!
//! ## Querying logs with jq
//!
//! ```bash
//! # Every failed worker
//! jq 'select(.fields.event == "worker_failed")' logs/raw/*.jsonl
//!
//! # Actions of worker 3, in order
//! jq 'select(.fields.event == "action_dispatched" and .fields.worker == 3)' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::{JsonLogEntry, RunMetadata};
pub use layer::JsonlLayer;
pub use writer::{write_run_metadata, RunLogWriter};
