use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::debug;

use gantry_core::error::{GantryError, Result};
use gantry_core::Context;
use gantry_graph::DatabaseConfig;

/// Substitute every `{name}` placeholder with the context value's string
/// form: string values single-quoted with embedded quotes doubled, other
/// values rendered as-is. A deliberately simple textual rule, not
/// driver-side parameterization. Placeholders with no context entry are
/// left untouched.
pub fn substitute_placeholders(query: &str, ctx: &Context) -> String {
    let re = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(query, |caps: &regex::Captures| {
        let name = &caps[1];
        match ctx.get(name) {
            Some(Value::String(s)) => format!("'{}'", s.replace('\'', "''")),
            Some(other) => Context::value_string(other),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Execute a Database node's query against its SQLite file.
///
/// One connection per node, opened here and dropped on every return path.
/// SELECT results: zero rows is null, one row is that row as an object,
/// more is an array of row objects. Non-SELECT results:
/// `{"affected_rows": n}`.
pub fn execute_query(config: &DatabaseConfig, ctx: &Context) -> Result<Value> {
    let sql = substitute_placeholders(&config.query, ctx);
    debug!(database = %config.database, sql = %sql, "Executing query");

    let conn = Connection::open(&config.database).map_err(db_error)?;

    if config.operation.is_select() {
        select_rows(&conn, &sql)
    } else {
        let affected = conn.execute(&sql, []).map_err(db_error)?;
        Ok(json!({ "affected_rows": affected }))
    }
}

fn select_rows(conn: &Connection, sql: &str) -> Result<Value> {
    let mut stmt = conn.prepare(sql).map_err(db_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query([]).map_err(db_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(db_error)? {
        let mut obj = serde_json::Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(db_error)?;
            obj.insert(name.clone(), column_to_json(value));
        }
        out.push(Value::Object(obj));
    }

    Ok(match out.len() {
        0 => Value::Null,
        1 => out.remove(0),
        _ => Value::Array(out),
    })
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

fn db_error(e: rusqlite::Error) -> GantryError {
    GantryError::Database(e.to_string())
}
