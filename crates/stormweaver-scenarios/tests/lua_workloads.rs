//! Lua workload integration tests
//!
//! Runs Lua scripts through the full scheduler against the simulated and
//! SQLite backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stormweaver_core::{
    BackendConfig, Driver, DriverConfig, DriverSession, FinishReason, OutcomeStatus, Scheduler, SqlValue,
    SqliteDriver, WeaverError, WorkerState, WorkloadConfig,
};
use stormweaver_scenarios::{LuaFactory, LuaScript};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Utilities
// ============================================================================

fn sim_backend(pool_size: usize) -> BackendConfig {
    BackendConfig::new(
        "main",
        DriverConfig::Sim {
            latency_ms: 0,
            refuse_connections: false,
        },
    )
    .with_pool_size(pool_size)
}

fn factory(source: &str) -> LuaFactory {
    LuaFactory::new(vec![LuaScript::new("test.lua", source)]).unwrap()
}

fn bank_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../scenarios/bank.lua")
}

fn schema_fuzz_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../scenarios/schema-fuzz.lua")
}

// ============================================================================
// Scenario Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bank_scenario_on_sqlite_keeps_total() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("bank.db").to_string_lossy().to_string();

    let backend = BackendConfig::new("main", DriverConfig::Sqlite { path: db.clone() })
        .with_pool_size(4)
        .with_init_sql("PRAGMA journal_mode = WAL");
    let config = WorkloadConfig::new(vec![backend])
        .with_workers(6)
        .with_iterations(40)
        .with_seed(42);
    let factory = LuaFactory::from_paths(&[bank_script()]).unwrap();

    let summary = Scheduler::new(config).unwrap().run(Arc::new(factory)).await.unwrap();

    assert!(
        summary.is_success(),
        "violations: {:?}, failed: {:?}",
        summary.violations,
        summary.failed_workers().map(|w| w.error().cloned()).collect::<Vec<_>>()
    );
    assert_eq!(summary.setup.as_ref().map(|s| s.actions), Some(22));
    assert!(summary.invariants.iter().any(|n| n == "debits == credits"));

    let mut session = SqliteDriver::new(db).connect().unwrap();
    let rows = session
        .execute("SELECT SUM(balance) FROM accounts", &[])
        .unwrap();
    assert_eq!(rows.rows[0][0], SqlValue::Integer(20_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_schema_fuzz_scenario_on_sqlite() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("fuzz.db").to_string_lossy().to_string();

    let backend = BackendConfig::new("main", DriverConfig::Sqlite { path: db.clone() })
        .with_pool_size(2)
        .with_init_sql("PRAGMA journal_mode = WAL");
    let config = WorkloadConfig::new(vec![backend])
        .with_workers(4)
        .with_iterations(25)
        .with_seed(17);
    let factory = LuaFactory::from_paths(&[schema_fuzz_script()])
        .unwrap()
        .with_actions(config.actions.clone())
        .unwrap();

    let summary = Scheduler::new(config).unwrap().run(Arc::new(factory)).await.unwrap();

    // Conflicting DDL is rejected by the database, never a worker failure.
    assert!(summary.failed_workers().next().is_none(), "{:?}", summary.failure_causes());
    for worker in &summary.workers {
        assert_eq!(worker.terminal, WorkerState::Finished(FinishReason::IterationLimit));
    }
    let setup_creates = summary
        .outcomes
        .iter()
        .filter(|o| o.worker == 0 && o.tag.as_deref() == Some("create_normal_table"))
        .count();
    assert_eq!(setup_creates, 5);
    assert!(summary
        .outcomes
        .iter()
        .any(|o| o.worker > 0 && o.tag.as_deref() == Some("insert_some_data") && o.status == OutcomeStatus::Success));

    let mut session = SqliteDriver::new(db).connect().unwrap();
    let rows = session
        .execute("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'foo%'", &[])
        .unwrap();
    assert!(matches!(rows.rows[0][0], SqlValue::Integer(n) if n > 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_seed_same_workload() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let config = WorkloadConfig::new(vec![sim_backend(2)])
            .with_workers(3)
            .with_iterations(15)
            .with_seed(1234);
        let factory = LuaFactory::from_paths(&[bank_script()]).unwrap();
        let summary = Scheduler::new(config).unwrap().run(Arc::new(factory)).await.unwrap();

        let mut actions: Vec<_> = summary
            .outcomes
            .iter()
            .map(|o| (o.worker, o.sequence, o.sql.clone(), o.params.clone()))
            .collect();
        actions.sort_by_key(|(w, s, _, _)| (*w, *s));
        runs.push(actions);
    }
    assert!(!runs[0].is_empty());
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lua_balance_violation() {
    let source = r#"
        invariant{ name = "inserted == selected", kind = "balance", left = "insert", right = "select" }

        function step(ctx)
            if ctx.worker == 1 and ctx.iteration <= 10 then
                return { sql = "INSERT INTO t VALUES (1)", tag = "insert" }
            end
            if ctx.worker == 2 and ctx.iteration <= 9 then
                return { sql = "SELECT 1", tag = "select" }
            end
            return nil
        end
    "#;
    let config = WorkloadConfig::new(vec![sim_backend(2)]).with_workers(2);

    let summary = Scheduler::new(config)
        .unwrap()
        .run(Arc::new(factory(source)))
        .await
        .unwrap();

    assert_eq!(summary.violations.len(), 1);
    assert_eq!(summary.violations[0].invariant, "inserted == selected");
    for worker in &summary.workers {
        assert_eq!(worker.terminal, WorkerState::Finished(FinishReason::ScriptDone));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_errors_do_not_fail_worker() {
    let source = r#"
        function step(ctx)
            if ctx.iteration > 3 then return nil end
            local r = ctx.query("FAIL on purpose", nil, { tag = "check" })
            assert(not r.ok)
            return "SELECT 1"
        end
    "#;
    let config = WorkloadConfig::new(vec![sim_backend(1)]).with_workers(1);

    let summary = Scheduler::new(config)
        .unwrap()
        .run(Arc::new(factory(source)))
        .await
        .unwrap();

    assert!(summary.failed_workers().next().is_none());
    assert_eq!(summary.workers[0].actions, 6);
    assert_eq!(summary.workers[0].errors, 3);
    let sequences: Vec<u64> = summary.outcomes.iter().map(|o| o.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=6).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_script_failure_isolated_between_scripts() {
    let good = LuaScript::new("good.lua", "function step(ctx) if ctx.iteration > 2 then return nil end return 'SELECT 1' end");
    let bad = LuaScript::new("bad.lua", "function step(ctx) error('boom') end");
    let config = WorkloadConfig::new(vec![sim_backend(2)]).with_workers(4);

    let summary = Scheduler::new(config)
        .unwrap()
        .run(Arc::new(LuaFactory::new(vec![good, bad]).unwrap()))
        .await
        .unwrap();

    for worker in &summary.workers {
        if worker.variant == 1 {
            let cause = worker.error().unwrap();
            assert!(matches!(cause, WeaverError::ScriptRuntimeFailed(m) if m.contains("boom")));
        } else {
            assert_eq!(worker.terminal, WorkerState::Finished(FinishReason::ScriptDone));
            assert_eq!(worker.actions, 2);
        }
    }
    assert_eq!(summary.failed_workers().count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_failure_keeps_its_cause() {
    let backend = BackendConfig::new(
        "down",
        DriverConfig::Sim {
            latency_ms: 0,
            refuse_connections: true,
        },
    )
    .with_retry_budget(1);
    let config = WorkloadConfig::new(vec![backend])
        .with_workers(1)
        .with_acquire_timeout(Duration::from_millis(50));
    let source = r#"
        function step(ctx)
            local ok = pcall(ctx.query, "SELECT 1")
            return "SELECT 2"
        end
    "#;

    let summary = Scheduler::new(config)
        .unwrap()
        .run(Arc::new(factory(source)))
        .await
        .unwrap();

    let cause = summary.workers[0].error().cloned();
    assert!(
        matches!(
            cause,
            Some(WeaverError::BackendUnavailable { .. }) | Some(WeaverError::PoolExhausted { .. })
        ),
        "got {cause:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_stops_lua_workers() {
    let cancel = CancellationToken::new();
    let config = WorkloadConfig::new(vec![sim_backend(4)])
        .with_workers(3)
        .with_grace_period(Duration::from_millis(100));
    let scheduler = Scheduler::new(config).unwrap().with_cancellation(cancel.clone());
    let source = r#"
        function step(ctx)
            ctx.query("SLEEP 20")
            return "SLEEP 20"
        end
    "#;

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let summary = scheduler.run(Arc::new(factory(source))).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(summary.cancelled);
    assert!(summary.workers.iter().all(|w| w.terminal.is_terminal()));
    assert!(summary
        .outcomes
        .iter()
        .all(|o| o.status != OutcomeStatus::Timeout));
}
