//! Lua API bindings for workload scripts.
//!
//! Exposes the `ctx` table passed to `setup(ctx)` and `step(ctx)`, and the
//! load-time `invariant{}` registration function. Nothing here hands a
//! script a connection, a file or a process; queries go through the worker's
//! [`QueryPort`] and randomness comes from the worker's seeded generator.

use std::sync::Arc;

use mlua::{Lua, Result as LuaResult, Table, Value};
use parking_lot::Mutex;
use stormweaver_core::random::MAX_STRING_LEN;
use stormweaver_core::generator::{ActionKind, ActionReport, ActionStatus, RandomGenerator};
use stormweaver_core::{
    ActionRequest, Invariant, InvariantRule, QueryPort, WeaverError, WeaverResult, WorkloadRng,
};
use tracing::info;

use crate::values::{params_from_lua, query_result_to_lua, to_json};

/// The worker's generator, swapped in for the duration of a script call.
pub type RngSlot = Arc<Mutex<WorkloadRng>>;

/// First pool, timeout or cancellation failure raised inside a script call.
pub type FatalSlot = Arc<Mutex<Option<WeaverError>>>;

/// Invariants registered while a script loads; `None` once loading ended.
pub type InvariantRegistry = Arc<Mutex<Option<Vec<Invariant>>>>;

/// Host state the bindings close over.
#[derive(Clone)]
pub struct Bindings {
    pub worker: u32,
    pub script: Arc<str>,
    pub queries: Arc<dyn QueryPort>,
    pub rng: RngSlot,
    pub fatal: FatalSlot,
    /// Random DDL/DML generator shared by every worker of the run
    pub actions: Arc<RandomGenerator>,
}

/// Hand a host result to the script. Pool, timeout and cancellation failures
/// are parked in the fatal slot so `pcall` cannot hide them.
fn settle_host<T>(fatal: &FatalSlot, result: WeaverResult<T>) -> LuaResult<T> {
    result.map_err(|cause| {
        let message = cause.to_string();
        fatal.lock().get_or_insert(cause);
        mlua::Error::runtime(message)
    })
}

fn check_fatal(fatal: &FatalSlot) -> LuaResult<()> {
    match fatal.lock().as_ref() {
        Some(cause) => Err(mlua::Error::runtime(cause.to_string())),
        None => Ok(()),
    }
}

/// The table `ctx.random_action` returns: `{ action, ok, skipped, table, error }`.
fn action_report_to_lua(lua: &Lua, report: &ActionReport) -> LuaResult<Table> {
    let table = lua.create_table()?;
    table.set("action", report.kind.name())?;
    table.set("ok", report.is_applied())?;
    table.set("skipped", matches!(report.status, ActionStatus::Skipped(_)))?;
    table.set("table", report.table.as_deref())?;
    match &report.status {
        ActionStatus::Rejected(error) | ActionStatus::Skipped(error) => {
            table.set("error", error.as_str())?
        }
        ActionStatus::Applied => {}
    }
    Ok(table)
}

/// Create the `ctx` table that gets passed to `setup` and `step`
pub fn create_context_table(lua: &Lua, bindings: &Bindings) -> LuaResult<Table> {
    let ctx = lua.create_table()?;
    ctx.set("worker", bindings.worker)?;
    ctx.set("script", bindings.script.as_ref())?;
    ctx.set("iteration", 0)?;

    // ctx.random(min, max) - integer in [min, max]
    let rng = Arc::clone(&bindings.rng);
    let random_fn = lua.create_function(move |_, (min, max): (i64, i64)| {
        Ok(rng.lock().int_range(min, max))
    })?;
    ctx.set("random", random_fn)?;

    // ctx.random_float() - float in [0, 1)
    let rng = Arc::clone(&bindings.rng);
    let random_float_fn = lua.create_function(move |_, ()| Ok(rng.lock().float()))?;
    ctx.set("random_float", random_float_fn)?;

    // ctx.random_string(min, max?) - alphanumeric string of at most MAX_STRING_LEN bytes
    let rng = Arc::clone(&bindings.rng);
    let random_string_fn = lua.create_function(move |_, (min, max): (usize, Option<usize>)| {
        let max = max.unwrap_or(min);
        if min.max(max) > MAX_STRING_LEN {
            return Err(mlua::Error::runtime(format!(
                "random_string length is limited to {} characters",
                MAX_STRING_LEN
            )));
        }
        Ok(rng.lock().alphanumeric(min, max))
    })?;
    ctx.set("random_string", random_string_fn)?;

    // ctx.pick(list) - one element of an array, nil when empty
    let rng = Arc::clone(&bindings.rng);
    let pick_fn = lua.create_function(move |_, list: Table| {
        let picked = rng.lock().index(list.raw_len());
        match picked {
            Some(i) => list.raw_get::<Value>(i + 1),
            None => Ok(Value::Nil),
        }
    })?;
    ctx.set("pick", pick_fn)?;

    // ctx.pick_weighted({ name = weight, ... }) - a key, proportionally to its weight.
    // Keys are sorted first; table iteration order is not stable across runs.
    let rng = Arc::clone(&bindings.rng);
    let pick_weighted_fn = lua.create_function(move |_, choices: Table| {
        let mut entries = Vec::new();
        for pair in choices.pairs::<String, u64>() {
            entries.push(pair?);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let weights: Vec<u64> = entries.iter().map(|(_, w)| *w).collect();
        let picked = rng
            .lock()
            .weighted_index(&weights)
            .map_err(|e| mlua::Error::runtime(format!("pick_weighted: {}", e)))?;
        Ok(picked.map(|i| entries[i].0.clone()))
    })?;
    ctx.set("pick_weighted", pick_weighted_fn)?;

    // ctx.query(sql, params?, { backend=, tag= }?) - runs through the pool.
    // Backend errors come back as data; anything else ends the step.
    let queries = Arc::clone(&bindings.queries);
    let fatal = Arc::clone(&bindings.fatal);
    let query_fn = lua.create_function(
        move |lua, (sql, params, opts): (String, Option<Value>, Option<Table>)| {
            check_fatal(&fatal)?;

            let mut request = ActionRequest::new(sql).with_params(params_from_lua(params)?);
            if let Some(opts) = opts {
                if let Some(backend) = opts.get::<Option<String>>("backend")? {
                    request = request.with_backend(backend);
                }
                if let Some(tag) = opts.get::<Option<String>>("tag")? {
                    request = request.with_tag(tag);
                }
            }

            let result = settle_host(&fatal, queries.query(request))?;
            query_result_to_lua(lua, &result)
        },
    )?;
    ctx.set("query", query_fn)?;

    // ctx.random_action(name?) - one generated DDL/DML action, weighted when
    // no name is given. Rejections are data, like ctx.query.
    let (queries, fatal, rng) = (
        Arc::clone(&bindings.queries),
        Arc::clone(&bindings.fatal),
        Arc::clone(&bindings.rng),
    );
    let actions = Arc::clone(&bindings.actions);
    let random_action_fn = lua.create_function(move |lua, name: Option<String>| {
        check_fatal(&fatal)?;
        let kind = match name.as_deref() {
            Some(name) => Some(
                ActionKind::from_name(name)
                    .ok_or_else(|| mlua::Error::runtime(format!("unknown action '{}'", name)))?,
            ),
            None => None,
        };
        let mut rng = rng.lock();
        let report = match kind {
            Some(kind) => actions.run(kind, &mut rng, queries.as_ref()),
            None => actions.random_action(&mut rng, queries.as_ref()),
        };
        action_report_to_lua(lua, &settle_host(&fatal, report)?)
    })?;
    ctx.set("random_action", random_action_fn)?;

    // ctx.create_random_tables(n) - number of tables created
    let (queries, fatal, rng) = (
        Arc::clone(&bindings.queries),
        Arc::clone(&bindings.fatal),
        Arc::clone(&bindings.rng),
    );
    let actions = Arc::clone(&bindings.actions);
    let create_tables_fn = lua.create_function(move |_, count: usize| {
        check_fatal(&fatal)?;
        let created = actions.create_random_tables(count, &mut rng.lock(), queries.as_ref());
        settle_host(&fatal, created)
    })?;
    ctx.set("create_random_tables", create_tables_fn)?;

    // ctx.generate_initial_data() - number of accepted INSERT batches
    let (queries, fatal, rng) = (
        Arc::clone(&bindings.queries),
        Arc::clone(&bindings.fatal),
        Arc::clone(&bindings.rng),
    );
    let actions = Arc::clone(&bindings.actions);
    let initial_data_fn = lua.create_function(move |_, ()| {
        check_fatal(&fatal)?;
        let batches = actions.generate_initial_data(&mut rng.lock(), queries.as_ref());
        settle_host(&fatal, batches)
    })?;
    ctx.set("generate_initial_data", initial_data_fn)?;

    // ctx.log(msg)
    let worker = bindings.worker;
    let script = Arc::clone(&bindings.script);
    let log_fn = lua.create_function(move |_, msg: String| {
        info!(target: "stormweaver::script", worker, script = %script, "{}", msg);
        Ok(())
    })?;
    ctx.set("log", log_fn)?;

    Ok(ctx)
}

/// Install the global `invariant{ name=, kind=, ... }` function.
///
/// Only legal while the script loads: declarations are fixed before the
/// first step runs.
pub fn install_invariant_fn(lua: &Lua, registry: InvariantRegistry) -> LuaResult<()> {
    let invariant_fn = lua.create_function(move |_, decl: Table| {
        let mut guard = registry.lock();
        let declared = guard
            .as_mut()
            .ok_or_else(|| mlua::Error::runtime("invariant() may only be called while the script loads"))?;

        let invariant = parse_invariant(&decl)?;
        if declared.iter().any(|i| i.name == invariant.name) {
            return Err(mlua::Error::runtime(format!(
                "invariant '{}' is declared twice",
                invariant.name
            )));
        }
        declared.push(invariant);
        Ok(())
    })?;
    lua.globals().set("invariant", invariant_fn)
}

fn parse_invariant(decl: &Table) -> LuaResult<Invariant> {
    let mut json = to_json(&Value::Table(decl.clone()))?;
    let name = json
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .ok_or_else(|| mlua::Error::runtime("invariant needs a string 'name'"))?;
    if let Some(fields) = json.as_object_mut() {
        fields.remove("name");
    }
    let rule: InvariantRule = serde_json::from_value(json)
        .map_err(|e| mlua::Error::runtime(format!("invariant '{}': {}", name, e)))?;
    Invariant::new(name, rule).map_err(|e| mlua::Error::runtime(e.to_string()))
}

/// Replace `print` so stray output lands in the structured log.
pub fn install_print(lua: &Lua, worker: u32, script: Arc<str>) -> LuaResult<()> {
    let print_fn = lua.create_function(move |_, args: mlua::Variadic<Value>| {
        let parts: Vec<String> = args
            .iter()
            .map(|v| match v {
                Value::String(s) => s.to_string_lossy().to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Boolean(b) => b.to_string(),
                Value::Nil => "nil".to_string(),
                other => other.type_name().to_string(),
            })
            .collect();
        info!(target: "stormweaver::script", worker, script = %script, "{}", parts.join("\t"));
        Ok(())
    })?;
    lua.globals().set("print", print_fn)
}
