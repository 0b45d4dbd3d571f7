//! Built-in random DDL/DML actions.
//!
//! A [`RandomGenerator`] picks weighted actions (create, drop and alter
//! tables, insert, delete and update rows), builds their statements from the
//! shared [`Schema`] and runs them through a worker's [`QueryPort`]. The
//! schema is updated only after the backend accepted a statement.
//!
//! Backend rejections are ordinary results ([`ActionStatus::Rejected`]);
//! only pool, timeout and cancellation errors are returned as `Err`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::ActionRequest;
use crate::backend::SqlValue;
use crate::config::ActionsConfig;
use crate::error::{WeaverError, WeaverResult};
use crate::random::WorkloadRng;
use crate::sandbox::QueryPort;
use crate::schema::{Column, ColumnType, Schema, Table};

/// Attempts at drawing an unused table or column name
const NAME_ATTEMPTS: usize = 16;

/// Upper bound of generated table and column name suffixes
const NAME_SPACE: i64 = 1_000_000;

/// Length range of generated TEXT and BYTEA values
const LONG_VALUE_LEN: (usize, usize) = (50, 1_000);

/// Every action the generator can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateNormalTable,
    DropTable,
    AlterTable,
    InsertSomeData,
    DeleteSomeData,
    UpdateOneRow,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::CreateNormalTable,
        ActionKind::DropTable,
        ActionKind::AlterTable,
        ActionKind::InsertSomeData,
        ActionKind::DeleteSomeData,
        ActionKind::UpdateOneRow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::CreateNormalTable => "create_normal_table",
            ActionKind::DropTable => "drop_table",
            ActionKind::AlterTable => "alter_table",
            ActionKind::InsertSomeData => "insert_some_data",
            ActionKind::DeleteSomeData => "delete_some_data",
            ActionKind::UpdateOneRow => "update_one_row",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Weight used when the configuration doesn't override it. Delete and
    /// update only run when asked for.
    pub fn default_weight(self) -> u64 {
        match self {
            ActionKind::CreateNormalTable | ActionKind::DropTable | ActionKind::AlterTable => 100,
            ActionKind::InsertSomeData => 1_000,
            ActionKind::DeleteSomeData | ActionKind::UpdateOneRow => 0,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Weighted set of actions.
#[derive(Debug, Clone)]
pub struct ActionLibrary {
    kinds: Vec<ActionKind>,
    weights: Vec<u64>,
}

impl ActionLibrary {
    /// Default weights with the configured overrides applied.
    pub fn from_config(config: &ActionsConfig) -> WeaverResult<Self> {
        for name in config.weights.keys() {
            if ActionKind::from_name(name).is_none() {
                return Err(WeaverError::Config(format!("unknown action '{}'", name)));
            }
        }

        let kinds = ActionKind::ALL.to_vec();
        let weights: Vec<u64> = kinds
            .iter()
            .map(|kind| {
                config
                    .weights
                    .get(kind.name())
                    .copied()
                    .unwrap_or_else(|| kind.default_weight())
            })
            .collect();

        let total = weights
            .iter()
            .try_fold(0u64, |sum, w| sum.checked_add(*w))
            .ok_or_else(|| WeaverError::Config("action weights overflow".into()))?;
        if total == 0 {
            return Err(WeaverError::Config("every action weight is zero".into()));
        }
        Ok(Self { kinds, weights })
    }

    pub fn weight(&self, kind: ActionKind) -> u64 {
        self.kinds
            .iter()
            .position(|k| *k == kind)
            .map_or(0, |idx| self.weights[idx])
    }

    pub fn pick(&self, rng: &mut WorkloadRng) -> Option<ActionKind> {
        // The total was checked when the library was built
        match rng.weighted_index(&self.weights) {
            Ok(idx) => idx.map(|idx| self.kinds[idx]),
            Err(_) => None,
        }
    }
}

/// How one action ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Every statement was accepted
    Applied,
    /// The backend rejected a statement; its error
    Rejected(String),
    /// Nothing was executed; why
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub kind: ActionKind,
    /// Target table, when one was chosen
    pub table: Option<String>,
    pub status: ActionStatus,
}

impl ActionReport {
    fn new(kind: ActionKind, table: Option<&str>, status: ActionStatus) -> Self {
        Self {
            kind,
            table: table.map(String::from),
            status,
        }
    }

    fn skipped(kind: ActionKind, reason: &str) -> Self {
        Self::new(kind, None, ActionStatus::Skipped(reason.to_string()))
    }

    pub fn is_applied(&self) -> bool {
        self.status == ActionStatus::Applied
    }
}

/// Weighted random DDL/DML over a shared [`Schema`].
///
/// One generator is shared by every worker of a run; all per-call state
/// lives in the worker's rng and query port.
#[derive(Debug)]
pub struct RandomGenerator {
    schema: Arc<Schema>,
    library: ActionLibrary,
    config: ActionsConfig,
}

impl RandomGenerator {
    pub fn new(config: ActionsConfig) -> WeaverResult<Self> {
        Self::with_schema(config, Arc::new(Schema::default()))
    }

    pub fn with_schema(config: ActionsConfig, schema: Arc<Schema>) -> WeaverResult<Self> {
        config.validate()?;
        Ok(Self {
            schema,
            library: ActionLibrary::from_config(&config)?,
            config,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &ActionsConfig {
        &self.config
    }

    /// Run one action chosen by weight.
    pub fn random_action(
        &self,
        rng: &mut WorkloadRng,
        port: &dyn QueryPort,
    ) -> WeaverResult<ActionReport> {
        match self.library.pick(rng) {
            Some(kind) => self.run(kind, rng, port),
            None => Err(WeaverError::Config("every action weight is zero".into())),
        }
    }

    /// Run one action of the given kind, regardless of its weight.
    pub fn run(
        &self,
        kind: ActionKind,
        rng: &mut WorkloadRng,
        port: &dyn QueryPort,
    ) -> WeaverResult<ActionReport> {
        let report = match kind {
            ActionKind::CreateNormalTable => self.create_table(rng, port)?,
            ActionKind::DropTable => self.drop_table(rng, port)?,
            ActionKind::AlterTable => self.alter_table(rng, port)?,
            ActionKind::InsertSomeData => match self.schema.pick(rng) {
                Some(table) => self.insert_rows(&table, self.config.dml.insert_rows, rng, port)?,
                None => ActionReport::skipped(kind, "no tables"),
            },
            ActionKind::DeleteSomeData => self.delete_rows(rng, port)?,
            ActionKind::UpdateOneRow => self.update_row(rng, port)?,
        };
        debug!(
            action = %report.kind,
            table = report.table.as_deref().unwrap_or(""),
            status = ?report.status,
            "Random action"
        );
        Ok(report)
    }

    /// Create up to `count` tables, stopping early at the table limit.
    /// Returns how many were created.
    pub fn create_random_tables(
        &self,
        count: usize,
        rng: &mut WorkloadRng,
        port: &dyn QueryPort,
    ) -> WeaverResult<usize> {
        let mut created = 0;
        for _ in 0..count {
            let report = self.create_table(rng, port)?;
            match report.status {
                ActionStatus::Applied => created += 1,
                ActionStatus::Skipped(_) => break,
                ActionStatus::Rejected(_) => {}
            }
        }
        Ok(created)
    }

    /// Fill every known table with the configured number of INSERT batches.
    /// Returns how many batches were accepted.
    pub fn generate_initial_data(
        &self,
        rng: &mut WorkloadRng,
        port: &dyn QueryPort,
    ) -> WeaverResult<usize> {
        let dml = &self.config.dml;
        let mut accepted = 0;
        for table in self.schema.tables() {
            for _ in 0..dml.initial_batches {
                if self.insert_rows(&table, dml.initial_batch_rows, rng, port)?.is_applied() {
                    accepted += 1;
                }
            }
        }
        Ok(accepted)
    }

    fn create_table(&self, rng: &mut WorkloadRng, port: &dyn QueryPort) -> WeaverResult<ActionReport> {
        let kind = ActionKind::CreateNormalTable;
        if self.schema.len() >= self.config.ddl.max_table_count {
            return Ok(ActionReport::skipped(kind, "table limit reached"));
        }
        let slot = (0..NAME_ATTEMPTS)
            .find_map(|_| self.schema.reserve(&format!("foo{}", rng.int_range(1, NAME_SPACE))));
        let Some(slot) = slot else {
            return Ok(ActionReport::skipped(kind, "no free table slot"));
        };

        let column_count = rng.int_range(2, self.config.ddl.max_column_count as i64) as usize;
        let mut table = Table {
            name: slot.name().to_string(),
            columns: Vec::with_capacity(column_count),
        };
        table.columns.push(Column::serial(column_name(rng)));
        while table.columns.len() < column_count {
            match random_column(rng, &table.columns) {
                Some(column) => table.columns.push(column),
                None => break,
            }
        }

        let name = table.name.clone();
        let status = execute(port, ActionRequest::new(table.create_sql()), kind)?;
        if status == ActionStatus::Applied {
            slot.complete(table);
        }
        Ok(ActionReport::new(kind, Some(&name), status))
    }

    fn drop_table(&self, rng: &mut WorkloadRng, port: &dyn QueryPort) -> WeaverResult<ActionReport> {
        let kind = ActionKind::DropTable;
        if self.schema.len() <= self.config.ddl.min_table_count {
            return Ok(ActionReport::skipped(kind, "table minimum reached"));
        }
        let Some(table) = self.schema.pick(rng) else {
            return Ok(ActionReport::skipped(kind, "no tables"));
        };

        let status = execute(port, ActionRequest::new(format!("DROP TABLE {}", table.name)), kind)?;
        if status == ActionStatus::Applied {
            self.schema.remove(&table.name);
        }
        Ok(ActionReport::new(kind, Some(&table.name), status))
    }

    /// One ALTER TABLE statement per clause; the schema follows each accepted
    /// clause and the action stops at the first rejected one.
    fn alter_table(&self, rng: &mut WorkloadRng, port: &dyn QueryPort) -> WeaverResult<ActionReport> {
        let kind = ActionKind::AlterTable;
        let Some(table) = self.schema.pick(rng) else {
            return Ok(ActionReport::skipped(kind, "no tables"));
        };

        let clauses = rng.int_range(1, self.config.ddl.max_alter_clauses as i64);
        let mut columns = table.columns.clone();
        let mut added: HashSet<String> = HashSet::new();
        let mut applied = 0;

        for _ in 0..clauses {
            let droppable: Vec<usize> = if columns.len() >= 3 {
                (1..columns.len())
                    .filter(|&idx| !columns[idx].primary_key && !added.contains(&columns[idx].name))
                    .collect()
            } else {
                Vec::new()
            };

            if rng.int_range(0, 1) == 0 {
                let Some(column) = random_column(rng, &columns) else {
                    continue;
                };
                let sql = format!("ALTER TABLE {} ADD COLUMN {}", table.name, column.definition());
                match execute(port, ActionRequest::new(sql), kind)? {
                    ActionStatus::Applied => {
                        let tracked = column.clone();
                        self.schema.alter(&table.name, |t| t.columns.push(tracked));
                        added.insert(column.name.clone());
                        columns.push(column);
                        applied += 1;
                    }
                    status => return Ok(ActionReport::new(kind, Some(&table.name), status)),
                }
            } else {
                let Some(idx) = rng.index(droppable.len()).map(|i| droppable[i]) else {
                    continue;
                };
                let dropped = columns[idx].name.clone();
                let sql = format!("ALTER TABLE {} DROP COLUMN {}", table.name, dropped);
                match execute(port, ActionRequest::new(sql), kind)? {
                    ActionStatus::Applied => {
                        self.schema
                            .alter(&table.name, |t| t.columns.retain(|c| c.name != dropped));
                        columns.remove(idx);
                        applied += 1;
                    }
                    status => return Ok(ActionReport::new(kind, Some(&table.name), status)),
                }
            }
        }

        let status = if applied > 0 {
            ActionStatus::Applied
        } else {
            ActionStatus::Skipped("no applicable alter clause".into())
        };
        Ok(ActionReport::new(kind, Some(&table.name), status))
    }

    fn insert_rows(
        &self,
        table: &Table,
        rows: usize,
        rng: &mut WorkloadRng,
        port: &dyn QueryPort,
    ) -> WeaverResult<ActionReport> {
        let kind = ActionKind::InsertSomeData;
        let columns: Vec<&Column> = table.insertable_columns().collect();
        if columns.is_empty() {
            return Ok(ActionReport::new(
                kind,
                Some(&table.name),
                ActionStatus::Skipped("no insertable columns".into()),
            ));
        }

        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let mut params = Vec::with_capacity(rows * columns.len());
        for _ in 0..rows {
            params.extend(columns.iter().map(|c| random_value(c, rng)));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table.name,
            names.join(", "),
            vec![placeholders; rows].join(", ")
        );

        let status = execute(port, ActionRequest::new(sql).with_params(params), kind)?;
        Ok(ActionReport::new(kind, Some(&table.name), status))
    }

    fn delete_rows(&self, rng: &mut WorkloadRng, port: &dyn QueryPort) -> WeaverResult<ActionReport> {
        let kind = ActionKind::DeleteSomeData;
        let Some(table) = self.schema.pick(rng) else {
            return Ok(ActionReport::skipped(kind, "no tables"));
        };
        let Some(pk) = table.primary_key() else {
            return Ok(ActionReport::new(
                kind,
                Some(&table.name),
                ActionStatus::Skipped("no primary key".into()),
            ));
        };

        let dml = &self.config.dml;
        let rows = rng.int_range(dml.delete_min as i64, dml.delete_max as i64);
        let sql = format!(
            "DELETE FROM {t} WHERE {pk} IN (SELECT {pk} FROM {t} ORDER BY random() LIMIT {rows})",
            t = table.name,
            pk = pk.name,
        );
        let status = execute(port, ActionRequest::new(sql), kind)?;
        Ok(ActionReport::new(kind, Some(&table.name), status))
    }

    fn update_row(&self, rng: &mut WorkloadRng, port: &dyn QueryPort) -> WeaverResult<ActionReport> {
        let kind = ActionKind::UpdateOneRow;
        let Some(table) = self.schema.pick(rng) else {
            return Ok(ActionReport::skipped(kind, "no tables"));
        };
        let (Some(pk), true) = (table.primary_key(), table.insertable_columns().next().is_some())
        else {
            return Ok(ActionReport::new(
                kind,
                Some(&table.name),
                ActionStatus::Skipped("nothing to update".into()),
            ));
        };

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in table.insertable_columns() {
            assignments.push(format!("{} = ?", column.name));
            params.push(random_value(column, rng));
        }
        let sql = format!(
            "UPDATE {t} SET {set} WHERE {pk} IN (SELECT {pk} FROM {t} ORDER BY random() LIMIT 1)",
            t = table.name,
            set = assignments.join(", "),
            pk = pk.name,
        );
        let status = execute(port, ActionRequest::new(sql).with_params(params), kind)?;
        Ok(ActionReport::new(kind, Some(&table.name), status))
    }
}

/// Issue one tagged statement; rejections become [`ActionStatus::Rejected`].
fn execute(port: &dyn QueryPort, request: ActionRequest, kind: ActionKind) -> WeaverResult<ActionStatus> {
    Ok(match port.query(request.with_tag(kind.name()))? {
        Ok(_) => ActionStatus::Applied,
        Err(e) => ActionStatus::Rejected(e.describe()),
    })
}

fn column_name(rng: &mut WorkloadRng) -> String {
    format!("col{}", rng.int_range(1, NAME_SPACE))
}

/// A nullable column whose name is not used by `existing`.
fn random_column(rng: &mut WorkloadRng, existing: &[Column]) -> Option<Column> {
    let name = (0..NAME_ATTEMPTS)
        .map(|_| column_name(rng))
        .find(|name| existing.iter().all(|c| &c.name != name))?;
    let ty = ColumnType::ALL[rng.index(ColumnType::ALL.len()).unwrap_or(0)];
    Some(Column::new(name, ty, rng.int_range(1, 100) as u32))
}

fn random_value(column: &Column, rng: &mut WorkloadRng) -> SqlValue {
    let (long_min, long_max) = LONG_VALUE_LEN;
    match column.ty {
        ColumnType::Int => SqlValue::Integer(rng.int_range(1, NAME_SPACE)),
        ColumnType::Real => SqlValue::Real(1.0 + rng.float() * (NAME_SPACE - 1) as f64),
        ColumnType::Bool => SqlValue::Integer(rng.int_range(0, 1)),
        ColumnType::Char | ColumnType::Varchar => {
            SqlValue::Text(rng.alphanumeric(0, column.length as usize))
        }
        ColumnType::Text => SqlValue::Text(rng.alphanumeric(long_min, long_max)),
        ColumnType::Bytea => SqlValue::Blob(rng.alphanumeric(long_min, long_max).into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DriverError, Rows};
    use crate::sandbox::QueryResult;
    use parking_lot::Mutex;

    /// Accepts everything except statements containing `reject`.
    #[derive(Default)]
    struct RecordingPort {
        seen: Mutex<Vec<ActionRequest>>,
        reject: Mutex<Option<String>>,
        cancelled: bool,
    }

    impl RecordingPort {
        fn rejecting(pattern: &str) -> Self {
            Self {
                reject: Mutex::new(Some(pattern.to_string())),
                ..Default::default()
            }
        }

        fn sql(&self) -> Vec<String> {
            self.seen.lock().iter().map(|r| r.sql.clone()).collect()
        }
    }

    impl QueryPort for RecordingPort {
        fn query(&self, request: ActionRequest) -> WeaverResult<QueryResult> {
            if self.cancelled {
                return Err(WeaverError::Cancelled);
            }
            let rejected = self
                .reject
                .lock()
                .as_deref()
                .is_some_and(|pattern| request.sql.contains(pattern));
            self.seen.lock().push(request);
            if rejected {
                return Ok(Err(DriverError::new("rejected by test")));
            }
            Ok(Ok(Rows::affected(1)))
        }
    }

    fn generator(config: ActionsConfig) -> RandomGenerator {
        RandomGenerator::new(config).unwrap()
    }

    fn only(kind: ActionKind) -> ActionsConfig {
        let mut config = ActionsConfig::default();
        for other in ActionKind::ALL {
            config.weights.insert(other.name().to_string(), 0);
        }
        config.weights.insert(kind.name().to_string(), 1);
        config
    }

    #[test]
    fn test_library_defaults_and_overrides() {
        let library = ActionLibrary::from_config(&ActionsConfig::default()).unwrap();
        assert_eq!(library.weight(ActionKind::InsertSomeData), 1_000);
        assert_eq!(library.weight(ActionKind::DeleteSomeData), 0);

        let library = ActionLibrary::from_config(&only(ActionKind::DropTable)).unwrap();
        let mut rng = WorkloadRng::new(5);
        for _ in 0..50 {
            assert_eq!(library.pick(&mut rng), Some(ActionKind::DropTable));
        }
    }

    #[test]
    fn test_library_rejects_bad_weights() {
        let unknown = ActionsConfig::default().with_weight("vacuum", 1);
        assert!(ActionLibrary::from_config(&unknown).is_err());

        let mut zero = only(ActionKind::DropTable);
        zero.weights.insert("drop_table".into(), 0);
        assert!(ActionLibrary::from_config(&zero).is_err());

        let overflow = ActionsConfig::default()
            .with_weight("drop_table", u64::MAX)
            .with_weight("alter_table", 1);
        let err = ActionLibrary::from_config(&overflow).unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_create_table_shape() {
        let generator = generator(ActionsConfig::default());
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(11);

        let report = generator.run(ActionKind::CreateNormalTable, &mut rng, &port).unwrap();
        assert!(report.is_applied());

        let sql = port.sql();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE foo"), "{}", sql[0]);
        assert!(sql[0].contains("INTEGER PRIMARY KEY"));
        assert_eq!(port.seen.lock()[0].tag.as_deref(), Some("create_normal_table"));

        let table = generator.schema().get(report.table.as_deref().unwrap()).unwrap();
        assert!(table.columns.len() >= 2);
        assert!(table.columns[0].auto_increment);
        let names: HashSet<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.len(), table.columns.len(), "column names are unique");
    }

    #[test]
    fn test_rejected_create_leaves_schema_unchanged() {
        let generator = generator(ActionsConfig::default());
        let port = RecordingPort::rejecting("CREATE");
        let mut rng = WorkloadRng::new(11);

        let report = generator.run(ActionKind::CreateNormalTable, &mut rng, &port).unwrap();
        assert!(matches!(report.status, ActionStatus::Rejected(ref e) if e.contains("rejected")));
        assert!(generator.schema().is_empty());

        // The reservation was released with the failed create
        let mut config = ActionsConfig::default();
        config.ddl.max_table_count = 1;
        config.ddl.min_table_count = 0;
        let schema = Arc::new(Schema::new(1));
        let small = RandomGenerator::with_schema(config, Arc::clone(&schema)).unwrap();
        small.run(ActionKind::CreateNormalTable, &mut rng, &port).unwrap();
        assert!(schema.reserve("foo0").is_some());
    }

    #[test]
    fn test_table_limits_skip_ddl() {
        let mut config = ActionsConfig::default();
        config.ddl.min_table_count = 1;
        config.ddl.max_table_count = 2;
        let generator = generator(config);
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(2);

        let dropped = generator.run(ActionKind::DropTable, &mut rng, &port).unwrap();
        assert!(matches!(dropped.status, ActionStatus::Skipped(_)));

        assert_eq!(generator.create_random_tables(5, &mut rng, &port).unwrap(), 2);
        assert_eq!(generator.schema().len(), 2);

        let dropped = generator.run(ActionKind::DropTable, &mut rng, &port).unwrap();
        assert!(dropped.is_applied());
        assert_eq!(generator.schema().len(), 1);
        assert!(port.sql().last().unwrap().starts_with("DROP TABLE foo"));
    }

    #[test]
    fn test_insert_uses_parameters_and_skips_serial_column() {
        let mut config = ActionsConfig::default();
        config.dml.insert_rows = 3;
        let generator = generator(config);
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(4);

        let skipped = generator.run(ActionKind::InsertSomeData, &mut rng, &port).unwrap();
        assert_eq!(skipped.status, ActionStatus::Skipped("no tables".into()));

        generator.create_random_tables(1, &mut rng, &port).unwrap();
        let table = generator.schema().tables()[0].clone();
        let report = generator.run(ActionKind::InsertSomeData, &mut rng, &port).unwrap();
        assert!(report.is_applied());

        let seen = port.seen.lock();
        let insert = seen.last().unwrap();
        let names: Vec<&str> = table.columns[1..].iter().map(|c| c.name.as_str()).collect();
        let prefix = format!("INSERT INTO {} ({}) VALUES (", table.name, names.join(", "));
        assert!(insert.sql.starts_with(&prefix), "{}", insert.sql);
        assert_eq!(insert.params.len(), 3 * names.len());
        assert_eq!(insert.tag.as_deref(), Some("insert_some_data"));
    }

    #[test]
    fn test_alter_tracks_accepted_clauses() {
        let mut config = ActionsConfig::default();
        config.ddl.max_alter_clauses = 5;
        let generator = generator(config);
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(8);
        generator.create_random_tables(1, &mut rng, &port).unwrap();

        for _ in 0..20 {
            generator.run(ActionKind::AlterTable, &mut rng, &port).unwrap();
        }

        let table = generator.schema().tables()[0].clone();
        let mut expected: Vec<String> = Vec::new();
        for sql in port.sql() {
            if let Some(def) = sql.split(" ADD COLUMN ").nth(1) {
                expected.push(def.split(' ').next().unwrap().to_string());
            } else if let Some(col) = sql.split(" DROP COLUMN ").nth(1) {
                expected.retain(|c| c != col);
            } else if sql.starts_with("CREATE") {
                let inner = &sql[sql.find('(').unwrap() + 1..sql.len() - 1];
                expected = inner
                    .split(", ")
                    .map(|d| d.split(' ').next().unwrap().to_string())
                    .collect();
            }
        }
        let actual: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        assert_eq!(actual, expected);
        assert!(table.columns[0].primary_key, "primary key is never dropped");
    }

    #[test]
    fn test_rejected_alter_keeps_schema() {
        let generator = generator(ActionsConfig::default());
        let mut rng = WorkloadRng::new(8);
        generator
            .create_random_tables(1, &mut rng, &RecordingPort::default())
            .unwrap();
        let before = generator.schema().tables()[0].clone();

        let port = RecordingPort::rejecting("ALTER");
        let report = generator.run(ActionKind::AlterTable, &mut rng, &port).unwrap();
        assert!(!report.is_applied());
        assert_eq!(generator.schema().tables()[0], before);
    }

    #[test]
    fn test_delete_and_update_target_primary_key() {
        let generator = generator(ActionsConfig::default());
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(9);
        generator.create_random_tables(1, &mut rng, &port).unwrap();
        let table = generator.schema().tables()[0].clone();
        let pk = &table.columns[0].name;

        generator.run(ActionKind::DeleteSomeData, &mut rng, &port).unwrap();
        generator.run(ActionKind::UpdateOneRow, &mut rng, &port).unwrap();

        let sql = port.sql();
        let subquery = format!("WHERE {pk} IN (SELECT {pk} FROM {} ORDER BY random() LIMIT", table.name);
        assert!(sql[1].starts_with(&format!("DELETE FROM {}", table.name)));
        assert!(sql[1].contains(&subquery));
        assert!(sql[2].starts_with(&format!("UPDATE {} SET", table.name)));
        assert!(sql[2].ends_with(&format!("{subquery} 1)")));
    }

    #[test]
    fn test_initial_data_fills_every_table() {
        let mut config = ActionsConfig::default();
        config.dml.initial_batches = 2;
        config.dml.initial_batch_rows = 5;
        let generator = generator(config);
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(6);

        assert_eq!(generator.create_random_tables(3, &mut rng, &port).unwrap(), 3);
        assert_eq!(generator.generate_initial_data(&mut rng, &port).unwrap(), 6);
        let inserts = port.sql().iter().filter(|s| s.starts_with("INSERT")).count();
        assert_eq!(inserts, 6);
    }

    #[test]
    fn test_cancelled_port_is_an_error() {
        let generator = generator(ActionsConfig::default());
        let port = RecordingPort {
            cancelled: true,
            ..Default::default()
        };
        let mut rng = WorkloadRng::new(1);

        let err = generator.run(ActionKind::CreateNormalTable, &mut rng, &port).unwrap_err();
        assert_eq!(err, WeaverError::Cancelled);
        assert!(generator.schema().is_empty());
    }

    #[test]
    fn test_random_action_follows_weights() {
        let generator = generator(only(ActionKind::CreateNormalTable));
        let port = RecordingPort::default();
        let mut rng = WorkloadRng::new(1);

        for _ in 0..3 {
            let report = generator.random_action(&mut rng, &port).unwrap();
            assert_eq!(report.kind, ActionKind::CreateNormalTable);
        }
        assert_eq!(generator.schema().len(), 3);
    }
}
