//! Lua sandboxes.
//!
//! Every worker gets its own interpreter with a restricted standard library:
//! `table`, `string`, `math` and `utf8` plus the base functions, minus
//! `load`, `loadfile`, `dofile`, `collectgarbage`, `math.random` and
//! `math.randomseed`. A script defines a global `step(ctx)` and optionally
//! `setup(ctx)`, and may declare invariants with `invariant{}` while it loads.
//!
//! ```lua
//! invariant{ name = "inserted == selected", kind = "balance", left = "insert", right = "select" }
//!
//! function setup(ctx)
//!     ctx.query("CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, v TEXT)")
//! end
//!
//! function step(ctx)
//!     if ctx.iteration > 100 then return nil end
//!     return { sql = "INSERT INTO t (v) VALUES (?)", params = { ctx.random_string(8) }, tag = "insert" }
//! end
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, Table, Value, VmState};
use parking_lot::Mutex;
use stormweaver_core::{
    ActionRequest, ActionsConfig, Invariant, QueryPort, QueryResult, RandomGenerator, Sandbox,
    SandboxFactory, SessionContext, Step, WeaverError, WeaverResult, WorkloadRng,
};
use tokio_util::sync::CancellationToken;

use crate::api::{self, Bindings, FatalSlot, InvariantRegistry, RngSlot};
use crate::values::step_from_lua;

/// Instructions a single `setup` or `step` call may execute
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 50_000_000;

/// The hook fires every this many VM instructions
const HOOK_INTERVAL: u32 = 10_000;

/// One script's source and the name it is reported under.
#[derive(Debug, Clone)]
pub struct LuaScript {
    pub name: String,
    pub source: String,
}

impl LuaScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn from_path(path: &Path) -> WeaverResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            WeaverError::ScriptLoadFailed(format!("cannot read {}: {}", path.display(), e))
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, source })
    }
}

/// Creates one [`LuaSandbox`] per worker. Workers are assigned to the scripts
/// round-robin.
#[derive(Debug, Clone)]
pub struct LuaFactory {
    scripts: Arc<Vec<LuaScript>>,
    instruction_budget: u64,
    actions: Arc<RandomGenerator>,
}

impl LuaFactory {
    pub fn new(scripts: Vec<LuaScript>) -> WeaverResult<Self> {
        if scripts.is_empty() {
            return Err(WeaverError::Config("at least one script is required".into()));
        }
        Ok(Self {
            scripts: Arc::new(scripts),
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
            actions: Arc::new(RandomGenerator::new(ActionsConfig::default())?),
        })
    }

    pub fn from_paths(paths: &[PathBuf]) -> WeaverResult<Self> {
        let scripts = paths
            .iter()
            .map(|p| LuaScript::from_path(p))
            .collect::<WeaverResult<Vec<_>>>()?;
        Self::new(scripts)
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = budget;
        self
    }

    /// Replace the random action settings. Every sandbox of this factory
    /// shares one generator and therefore one table registry.
    pub fn with_actions(mut self, config: ActionsConfig) -> WeaverResult<Self> {
        self.actions = Arc::new(RandomGenerator::new(config)?);
        Ok(self)
    }

    pub fn script_names(&self) -> Vec<String> {
        self.scripts.iter().map(|s| s.name.clone()).collect()
    }

    /// Load every script without running it and collect the invariants they
    /// declare. Used to re-check a persisted outcome stream offline.
    pub fn declared_invariants(&self) -> WeaverResult<Vec<Invariant>> {
        let mut all: Vec<Invariant> = Vec::new();
        for variant in 0..self.scripts.len() {
            let session = SessionContext {
                worker: 0,
                variant,
                queries: Arc::new(OfflinePort),
                cancel: CancellationToken::new(),
            };
            for invariant in self.load(session)?.invariants() {
                if !all.iter().any(|i| i.name == invariant.name) {
                    all.push(invariant);
                }
            }
        }
        Ok(all)
    }
}

impl SandboxFactory for LuaFactory {
    type Sandbox = LuaSandbox;

    fn variants(&self) -> usize {
        self.scripts.len()
    }

    fn load(&self, session: SessionContext) -> WeaverResult<LuaSandbox> {
        let script = &self.scripts[session.variant % self.scripts.len()];
        LuaSandbox::load(script, session, self.instruction_budget, Arc::clone(&self.actions))
    }
}

/// Query port for sandboxes that are loaded but never stepped.
struct OfflinePort;

impl QueryPort for OfflinePort {
    fn query(&self, _request: ActionRequest) -> WeaverResult<QueryResult> {
        Err(WeaverError::Config("queries are not available offline".into()))
    }
}

/// One worker's interpreter.
pub struct LuaSandbox {
    lua: Lua,
    ctx: RegistryKey,
    script: Arc<str>,
    rng: RngSlot,
    fatal: FatalSlot,
    spent: Arc<AtomicU64>,
    invariants: Vec<Invariant>,
    iteration: u64,
}

impl LuaSandbox {
    fn load(
        script: &LuaScript,
        session: SessionContext,
        budget: u64,
        actions: Arc<RandomGenerator>,
    ) -> WeaverResult<Self> {
        let name: Arc<str> = Arc::from(script.name.as_str());
        let load_failed = |e: mlua::Error| WeaverError::ScriptLoadFailed(format!("{}: {}", name, e));

        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(load_failed)?;
        restrict_globals(&lua).map_err(load_failed)?;

        let rng: RngSlot = Arc::new(Mutex::new(WorkloadRng::new(0)));
        let fatal: FatalSlot = Arc::default();
        let spent = Arc::new(AtomicU64::new(0));
        install_hook(&lua, session.cancel.clone(), Arc::clone(&spent), budget, Arc::clone(&fatal));

        let registry: InvariantRegistry = Arc::new(Mutex::new(Some(Vec::new())));
        api::install_invariant_fn(&lua, Arc::clone(&registry)).map_err(load_failed)?;
        api::install_print(&lua, session.worker, Arc::clone(&name)).map_err(load_failed)?;

        let bindings = Bindings {
            worker: session.worker,
            script: Arc::clone(&name),
            queries: Arc::clone(&session.queries),
            rng: Arc::clone(&rng),
            fatal: Arc::clone(&fatal),
            actions,
        };
        let ctx = api::create_context_table(&lua, &bindings).map_err(load_failed)?;
        let ctx = lua.create_registry_value(ctx).map_err(load_failed)?;

        if let Err(e) = lua.load(script.source.as_str()).set_name(script.name.as_str()).exec() {
            if let Some(cause) = fatal.lock().take() {
                return Err(cause);
            }
            return Err(load_failed(e));
        }

        let has_step = lua
            .globals()
            .get::<Option<Function>>("step")
            .map_err(load_failed)?
            .is_some();
        if !has_step {
            return Err(WeaverError::ScriptLoadFailed(format!(
                "{}: script defines no global step function",
                name
            )));
        }

        let invariants = registry.lock().take().unwrap_or_default();
        tracing::debug!(
            worker = session.worker,
            script = %name,
            invariants = invariants.len(),
            "Script loaded"
        );

        Ok(Self {
            lua,
            ctx,
            script: name,
            rng,
            fatal,
            spent,
            invariants,
            iteration: 0,
        })
    }

    /// Run `f` with the worker's generator in the slot the bindings read.
    fn with_rng<T>(&self, rng: &mut WorkloadRng, f: impl FnOnce() -> T) -> T {
        std::mem::swap(&mut *self.rng.lock(), rng);
        self.spent.store(0, Ordering::Relaxed);
        let out = f();
        std::mem::swap(&mut *self.rng.lock(), rng);
        out
    }

    /// A fatal host failure wins over whatever the script made of it.
    fn settle<T>(&self, result: mlua::Result<T>) -> WeaverResult<T> {
        if let Some(cause) = self.fatal.lock().take() {
            return Err(cause);
        }
        result.map_err(|e| self.runtime_failed(e))
    }

    fn runtime_failed(&self, e: mlua::Error) -> WeaverError {
        WeaverError::ScriptRuntimeFailed(format!("{}: {}", self.script, e))
    }

    fn context(&self, iteration: u64) -> WeaverResult<Table> {
        let ctx: Table = self
            .lua
            .registry_value(&self.ctx)
            .map_err(|e| self.runtime_failed(e))?;
        ctx.set("iteration", iteration).map_err(|e| self.runtime_failed(e))?;
        Ok(ctx)
    }
}

impl Sandbox for LuaSandbox {
    fn setup(&mut self, rng: &mut WorkloadRng) -> WeaverResult<()> {
        let setup: Option<Function> = self
            .lua
            .globals()
            .get("setup")
            .map_err(|e| self.runtime_failed(e))?;
        let Some(setup) = setup else {
            return Ok(());
        };

        let ctx = self.context(0)?;
        let result = self.with_rng(rng, || setup.call::<()>(ctx));
        self.settle(result)
    }

    fn step(&mut self, rng: &mut WorkloadRng) -> WeaverResult<Step> {
        self.iteration += 1;
        let ctx = self.context(self.iteration)?;
        let step: Function = self
            .lua
            .globals()
            .get("step")
            .map_err(|e| self.runtime_failed(e))?;

        let result = self.with_rng(rng, || step.call::<Value>(ctx));
        let value = self.settle(result)?;
        step_from_lua(value).map_err(|e| self.runtime_failed(e))
    }

    fn invariants(&self) -> Vec<Invariant> {
        self.invariants.clone()
    }
}

fn restrict_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in ["load", "loadfile", "dofile", "collectgarbage"] {
        globals.set(name, Value::Nil)?;
    }
    let math: Table = globals.get("math")?;
    math.set("random", Value::Nil)?;
    math.set("randomseed", Value::Nil)?;
    Ok(())
}

/// Abort script code once the run is cancelled or the call's instruction
/// budget is spent. The hook keeps firing, so `pcall` cannot swallow it.
fn install_hook(
    lua: &Lua,
    cancel: CancellationToken,
    spent: Arc<AtomicU64>,
    budget: u64,
    fatal: FatalSlot,
) {
    let triggers = HookTriggers::new().every_nth_instruction(HOOK_INTERVAL);
    lua.set_hook(triggers, move |_lua, _debug| {
        if cancel.is_cancelled() {
            fatal.lock().get_or_insert(WeaverError::Cancelled);
            return Err(mlua::Error::runtime("run cancelled"));
        }
        let total = spent.fetch_add(u64::from(HOOK_INTERVAL), Ordering::Relaxed)
            + u64::from(HOOK_INTERVAL);
        if total > budget {
            return Err(mlua::Error::runtime(format!(
                "instruction budget of {} exhausted",
                budget
            )));
        }
        Ok(VmState::Continue)
    });
}
