//! Conversions between Lua values and SQL values.
//!
//! SQL `NULL` maps to `nil`, so a NULL column is simply absent from the row
//! table a script sees. Lua strings that are not valid UTF-8 bind as blobs.

use std::ffi::c_void;

use mlua::{Lua, Result as LuaResult, Table, Value};
use stormweaver_core::{ActionRequest, QueryResult, Rows, SqlValue, Step};

pub fn to_sql_value(value: &Value) -> LuaResult<SqlValue> {
    Ok(match value {
        Value::Nil => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Number(n) => SqlValue::Real(*n),
        Value::String(s) => match s.to_str() {
            Ok(text) => SqlValue::Text(text.to_string()),
            Err(_) => SqlValue::Blob(s.as_bytes().to_vec()),
        },
        other => {
            return Err(mlua::Error::runtime(format!(
                "cannot bind a {} as a SQL parameter",
                other.type_name()
            )))
        }
    })
}

pub fn from_sql_value(lua: &Lua, value: &SqlValue) -> LuaResult<Value> {
    Ok(match value {
        SqlValue::Null => Value::Nil,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(f) => Value::Number(*f),
        SqlValue::Text(s) => Value::String(lua.create_string(s)?),
        SqlValue::Blob(b) => Value::String(lua.create_string(b)?),
    })
}

/// Statement parameters: `nil`, a single scalar, or an array (holes bind NULL).
pub fn params_from_lua(value: Option<Value>) -> LuaResult<Vec<SqlValue>> {
    match value {
        None | Some(Value::Nil) => Ok(Vec::new()),
        Some(Value::Table(list)) => {
            let len = list.raw_len();
            let mut params = Vec::with_capacity(len);
            for i in 1..=len {
                params.push(to_sql_value(&list.raw_get::<Value>(i)?)?);
            }
            Ok(params)
        }
        Some(scalar) => Ok(vec![to_sql_value(&scalar)?]),
    }
}

/// Result rows as an array of tables keyed by column name.
pub fn rows_to_lua(lua: &Lua, rows: &Rows) -> LuaResult<Table> {
    let list = lua.create_table_with_capacity(rows.rows.len(), 0)?;
    for (i, row) in rows.rows.iter().enumerate() {
        let entry = lua.create_table()?;
        for (col, value) in row.iter().enumerate() {
            let value = from_sql_value(lua, value)?;
            match rows.columns.get(col) {
                Some(name) => entry.raw_set(name.as_str(), value)?,
                None => entry.raw_set(col + 1, value)?,
            }
        }
        list.raw_set(i + 1, entry)?;
    }
    Ok(list)
}

/// The table `ctx.query` returns: `{ ok, rows, row_count, affected, error }`.
pub fn query_result_to_lua(lua: &Lua, result: &QueryResult) -> LuaResult<Table> {
    let table = lua.create_table()?;
    match result {
        Ok(rows) => {
            table.set("ok", true)?;
            table.set("rows", rows_to_lua(lua, rows)?)?;
            table.set("row_count", rows.row_count())?;
            table.set("affected", rows.affected)?;
        }
        Err(e) => {
            table.set("ok", false)?;
            table.set("rows", lua.create_table()?)?;
            table.set("row_count", 0)?;
            table.set("affected", 0)?;
            table.set("error", e.describe())?;
        }
    }
    Ok(table)
}

/// Interpret what `step` returned: `nil` (done), `true` (the step already ran
/// its statements), a SQL string, or an action table
/// `{ sql=, params=, backend=, tag= }`.
pub fn step_from_lua(value: Value) -> LuaResult<Step> {
    match value {
        Value::Nil => Ok(Step::Done),
        Value::Boolean(true) => Ok(Step::Executed),
        Value::String(sql) => Ok(Step::Action(ActionRequest::new(sql.to_str()?.to_string()))),
        Value::Table(table) => {
            let sql: Option<String> = table.get("sql")?;
            let sql = sql.ok_or_else(|| mlua::Error::runtime("action table has no 'sql' field"))?;
            let mut request =
                ActionRequest::new(sql).with_params(params_from_lua(table.get("params")?)?);
            if let Some(backend) = table.get::<Option<String>>("backend")? {
                request = request.with_backend(backend);
            }
            if let Some(tag) = table.get::<Option<String>>("tag")? {
                request = request.with_tag(tag);
            }
            Ok(Step::Action(request))
        }
        other => Err(mlua::Error::runtime(format!(
            "step must return nil, true, a SQL string or an action table, got {}",
            other.type_name()
        ))),
    }
}

/// Deepest table nesting `to_json` follows.
const MAX_JSON_DEPTH: usize = 32;

/// Plain data (tables, strings, numbers, booleans) as JSON.
///
/// Cyclic tables and nesting beyond [`MAX_JSON_DEPTH`] are errors.
pub fn to_json(value: &Value) -> LuaResult<serde_json::Value> {
    json_value(value, &mut Vec::new())
}

fn json_value(value: &Value, path: &mut Vec<*const c_void>) -> LuaResult<serde_json::Value> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.to_str()?.to_string()),
        Value::Table(table) => {
            // Only the tables on the current path count; shared subtables are fine.
            let ptr = table.to_pointer();
            if path.contains(&ptr) {
                return Err(mlua::Error::runtime("cannot convert a cyclic table to data"));
            }
            if path.len() >= MAX_JSON_DEPTH {
                return Err(mlua::Error::runtime(format!(
                    "table nesting deeper than {} levels",
                    MAX_JSON_DEPTH
                )));
            }
            path.push(ptr);
            let json = table_json(table, path);
            path.pop();
            json?
        }
        other => {
            return Err(mlua::Error::runtime(format!(
                "cannot convert a {} to data",
                other.type_name()
            )))
        }
    })
}

fn table_json(table: &Table, path: &mut Vec<*const c_void>) -> LuaResult<serde_json::Value> {
    if table.raw_len() > 0 {
        let mut items = Vec::new();
        for item in table.clone().sequence_values::<Value>() {
            items.push(json_value(&item?, path)?);
        }
        return Ok(serde_json::Value::Array(items));
    }

    let mut map = serde_json::Map::new();
    for pair in table.clone().pairs::<String, Value>() {
        let (key, value) = pair?;
        map.insert(key, json_value(&value, path)?);
    }
    Ok(serde_json::Value::Object(map))
}
