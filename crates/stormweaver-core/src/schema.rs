//! Shared table metadata for generated DDL and DML.
//!
//! Workers that generate random statements need to know which tables and
//! columns exist without asking the database before every statement. The
//! [`Schema`] registry tracks that, shared by every worker of a run. It is
//! only updated after the database accepted a statement, so it can lag behind
//! concurrent changes; statements built from a stale view are simply
//! rejected by the database.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::random::WorkloadRng;

/// Default number of tables the registry can track.
pub const DEFAULT_TABLE_CAPACITY: usize = 200;

/// Column types the generator knows how to declare and fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Char,
    Varchar,
    Real,
    Bool,
    Bytea,
    Text,
}

impl ColumnType {
    pub const ALL: [ColumnType; 7] = [
        ColumnType::Int,
        ColumnType::Char,
        ColumnType::Varchar,
        ColumnType::Real,
        ColumnType::Bool,
        ColumnType::Bytea,
        ColumnType::Text,
    ];

    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Int => "INT",
            ColumnType::Char => "CHAR",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Real => "REAL",
            ColumnType::Bool => "BOOL",
            ColumnType::Bytea => "BYTEA",
            ColumnType::Text => "TEXT",
        }
    }

    /// Whether the declaration carries a length, as in `VARCHAR(20)`.
    pub fn has_length(self) -> bool {
        matches!(self, ColumnType::Char | ColumnType::Varchar)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    /// Declared length; 0 for types without one
    pub length: u32,
    pub primary_key: bool,
    /// Filled in by the database; never part of an INSERT column list
    pub auto_increment: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType, length: u32) -> Self {
        Self {
            name: name.into(),
            ty,
            length: if ty.has_length() { length.max(1) } else { 0 },
            primary_key: false,
            auto_increment: false,
        }
    }

    /// Integer primary key assigned by the database.
    pub fn serial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Int,
            length: 0,
            primary_key: true,
            auto_increment: true,
        }
    }

    /// Column definition as used in CREATE TABLE and ADD COLUMN.
    pub fn definition(&self) -> String {
        if self.auto_increment {
            return format!("{} INTEGER PRIMARY KEY", self.name);
        }
        if self.length > 0 {
            format!("{} {}({})", self.name, self.ty.sql_name(), self.length)
        } else {
            format!("{} {}", self.name, self.ty.sql_name())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    /// The single-column primary key, when the table has one.
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.primary_key)
    }

    /// Columns an INSERT has to provide values for.
    pub fn insertable_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.auto_increment)
    }

    pub fn create_sql(&self) -> String {
        let defs: Vec<String> = self.columns.iter().map(Column::definition).collect();
        format!("CREATE TABLE {} ({})", self.name, defs.join(", "))
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: Vec<Arc<Table>>,
    /// Names of tables whose CREATE is in flight
    reserved: HashSet<String>,
}

/// Registry of the tables generated statements may target.
#[derive(Debug)]
pub struct Schema {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_CAPACITY)
    }
}

impl Schema {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    /// Number of completed tables; in-flight creates are not counted.
    pub fn len(&self) -> usize {
        self.inner.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every tracked table.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().tables.clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.inner
            .read()
            .tables
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// A uniformly chosen table, or `None` when there are none.
    pub fn pick(&self, rng: &mut WorkloadRng) -> Option<Arc<Table>> {
        let inner = self.inner.read();
        rng.index(inner.tables.len()).map(|idx| Arc::clone(&inner.tables[idx]))
    }

    /// Reserve room for a table called `name` before creating it.
    ///
    /// `None` when the registry is full (counting other reservations) or the
    /// name is already used. Dropping the slot without completing it frees the
    /// room again.
    pub fn reserve(&self, name: &str) -> Option<CreateSlot<'_>> {
        let mut inner = self.inner.write();
        if inner.tables.len() + inner.reserved.len() >= self.capacity {
            return None;
        }
        if inner.reserved.contains(name) || inner.tables.iter().any(|t| t.name == name) {
            return None;
        }
        inner.reserved.insert(name.to_string());
        Some(CreateSlot {
            schema: self,
            name: name.to_string(),
            completed: false,
        })
    }

    /// Apply `change` to the named table. Returns false when the table is no
    /// longer tracked.
    ///
    /// The change runs under the write lock against the current version of
    /// the table, so concurrent alters of the same table don't lose updates.
    pub fn alter<F>(&self, name: &str, change: F) -> bool
    where
        F: FnOnce(&mut Table),
    {
        let mut inner = self.inner.write();
        match inner.tables.iter_mut().find(|t| t.name == name) {
            Some(slot) => {
                change(Arc::make_mut(slot));
                true
            }
            None => false,
        }
    }

    /// Forget the named table. Returns false when it was not tracked.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.tables.iter().position(|t| t.name == name) {
            Some(idx) => {
                inner.tables.swap_remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Room for one table whose CREATE statement is in flight.
pub struct CreateSlot<'a> {
    schema: &'a Schema,
    name: String,
    completed: bool,
}

impl CreateSlot<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the created table. Its name must be the reserved one.
    pub fn complete(mut self, mut table: Table) {
        table.name = self.name.clone();
        let mut inner = self.schema.inner.write();
        inner.reserved.remove(&self.name);
        inner.tables.push(Arc::new(table));
        self.completed = true;
    }
}

impl Drop for CreateSlot<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.schema.inner.write().reserved.remove(&self.name);
        }
    }
}
