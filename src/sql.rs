//! SQL access exposed to scripts as `sql.open(path)` (§4.6).
//!
//! `Database`/`Statement` are `mlua::UserData` wrapping `rusqlite`. Grounded
//! in the teacher's use of `rusqlite` for embedded SQLite access (see
//! `r3e-network-neo-rs`'s SQLite wallet) and in the value-conversion idiom
//! from the teacher's own Lua/JSON bridging in `scripts.rs`.
//!
//! `prepare(sql)` returns a `Statement` supporting only `bind` + `execute`
//! (not a row cursor): `query(sql, want_headers)` already covers reads and
//! returns every row in one call, so the only remaining use for a prepared
//! statement is a parameterised write. This sidesteps a self-referential
//! `rusqlite::Statement<'conn>` living inside a `mlua::UserData` with no
//! connection lifetime to borrow from.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Lua, UserData, UserDataMethods, Value as LuaValue};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;

use crate::error::AppError;

fn sql_err(e: impl std::fmt::Display) -> mlua::Error {
    mlua::Error::external(AppError::Sql(e.to_string()))
}

pub struct Database {
    conn: Rc<RefCell<Option<Connection>>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path).map_err(|e| AppError::Sql(e.to_string()))?;
        Ok(Self {
            conn: Rc::new(RefCell::new(Some(conn))),
        })
    }

    fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> mlua::Result<R> {
        let guard = self.conn.borrow();
        let conn = guard.as_ref().ok_or_else(|| sql_err("database closed"))?;
        f(conn).map_err(|e| map_sqlite_error(&e))
    }
}

fn map_sqlite_error(e: &rusqlite::Error) -> mlua::Error {
    if let rusqlite::Error::SqliteFailure(err, _) = e {
        if err.code == rusqlite::ErrorCode::DatabaseBusy {
            return sql_err("sqlite timeout");
        }
    }
    sql_err(e)
}

impl UserData for Database {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method(
            "query",
            |lua, this, (sql, want_headers): (String, Option<bool>)| {
                query(lua, this, &sql, want_headers.unwrap_or(false))
            },
        );
        methods.add_method("prepare", |_, this, sql: String| {
            Ok(Statement {
                conn: this.conn.clone(),
                sql,
                bindings: RefCell::new(HashMap::new()),
                finalized: Cell::new(false),
            })
        });
        methods.add_method("close", |_, this, ()| {
            this.conn.borrow_mut().take();
            Ok(())
        });
    }
}

fn query(lua: &Lua, db: &Database, sql: &str, want_headers: bool) -> mlua::Result<LuaValue> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(sql)?;
        let col_count = stmt.column_count();
        if col_count == 0 {
            let affected = stmt.execute([])?;
            return Ok(LuaValue::Integer(affected as i64));
        }
        let col_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let mut rows = stmt.query([])?;
        let out = lua.create_table().map_err(rusqlite_wrap)?;
        let mut idx: i64 = 1;
        if want_headers {
            let header_row = lua.create_sequence_from(col_names.iter().cloned()).map_err(rusqlite_wrap)?;
            out.set(idx, header_row).map_err(rusqlite_wrap)?;
            idx += 1;
        }
        while let Some(row) = rows.next()? {
            let row_table = lua.create_table().map_err(rusqlite_wrap)?;
            for c in 0..col_count {
                let v = sqlite_value_to_lua(lua, row.get_ref(c)?).map_err(rusqlite_wrap)?;
                row_table.set((c + 1) as i64, v).map_err(rusqlite_wrap)?;
            }
            out.set(idx, row_table).map_err(rusqlite_wrap)?;
            idx += 1;
        }
        Ok(LuaValue::Table(out))
    })
}

/// `rusqlite`'s closures must return `rusqlite::Result`; Lua table
/// construction cannot fail with a sqlite error, so this just wraps it in an
/// opaque `SqliteFailure`-shaped error purely to satisfy that signature.
fn rusqlite_wrap(e: mlua::Error) -> rusqlite::Error {
    rusqlite::Error::ModuleError(e.to_string())
}

fn sqlite_value_to_lua(lua: &Lua, v: ValueRef) -> mlua::Result<LuaValue> {
    Ok(match v {
        ValueRef::Null => LuaValue::Nil,
        ValueRef::Integer(i) => LuaValue::Integer(i),
        ValueRef::Real(f) => LuaValue::Number(f),
        ValueRef::Text(t) => LuaValue::String(lua.create_string(t)?),
        // An empty BLOB is a distinct present value, not absent -- surfaced
        // as an empty Lua string rather than nil (resolved open question,
        // SPEC_FULL.md §4.6).
        ValueRef::Blob(b) => LuaValue::String(lua.create_string(b)?),
    })
}

pub struct Statement {
    conn: Rc<RefCell<Option<Connection>>>,
    sql: String,
    bindings: RefCell<HashMap<i64, SqlValue>>,
    finalized: Cell<bool>,
}

impl UserData for Statement {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method(
            "bind",
            |lua, this, (index, value, as_integer): (i64, LuaValue, Option<bool>)| {
                if this.finalized.get() {
                    return Err(sql_err("statement finalized"));
                }
                let bound = bind_value(lua, value, as_integer.unwrap_or(false))?;
                this.bindings.borrow_mut().insert(index, bound);
                Ok(())
            },
        );
        methods.add_method("execute", |_, this, ()| {
            if this.finalized.get() {
                return Err(sql_err("statement finalized"));
            }
            this.finalized.set(true);
            let guard = this.conn.borrow();
            let conn = guard.as_ref().ok_or_else(|| sql_err("database closed"))?;
            let mut stmt = conn.prepare(&this.sql).map_err(|e| map_sqlite_error(&e))?;
            let bindings = this.bindings.borrow();
            let max_idx = bindings.keys().copied().max().unwrap_or(0);
            let mut params: Vec<SqlValue> = Vec::with_capacity(max_idx as usize);
            for i in 1..=max_idx {
                params.push(bindings.get(&i).cloned().unwrap_or(SqlValue::Null));
            }
            let affected = stmt
                .execute(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| map_sqlite_error(&e))?;
            Ok(affected as i64)
        });
        // No-op once `execute` already finalized the statement -- kept so
        // scripts that explicitly finalize unused statements don't error.
        methods.add_method("finalize", |_, this, ()| {
            this.finalized.set(true);
            Ok(())
        });
    }
}

fn bind_value(lua: &Lua, value: LuaValue, as_integer: bool) -> mlua::Result<SqlValue> {
    if as_integer {
        if let Some(i) = lua_value_as_i64(&value) {
            return Ok(SqlValue::Integer(i));
        }
    }
    match value {
        LuaValue::Nil | LuaValue::Function(_) | LuaValue::Thread(_) | LuaValue::LightUserData(_) => {
            Ok(SqlValue::Null)
        }
        LuaValue::Boolean(b) => Ok(SqlValue::Integer(if b { 1 } else { 0 })),
        LuaValue::Integer(i) => Ok(SqlValue::Integer(i)),
        LuaValue::Number(n) => Ok(SqlValue::Real(n)),
        LuaValue::String(ref s) => Ok(SqlValue::Text(s.to_str()?.to_string())),
        LuaValue::Table(ref t) => {
            if let Ok(len) = t.get::<_, i64>("byteLength") {
                let mut bytes = Vec::with_capacity(len.max(0) as usize);
                for i in 1..=len {
                    bytes.push(t.get::<_, u8>(i)?);
                }
                return Ok(SqlValue::Blob(bytes));
            }
            if table_has_tostring(t) {
                if let Some(s) = lua.coerce_string(value.clone())? {
                    return Ok(SqlValue::Text(s.to_str()?.to_string()));
                }
            }
            let json = crate::host_api::lua_to_json(value.clone())
                .map_err(|e| mlua::Error::external(e.to_string()))?;
            Ok(SqlValue::Text(serde_json::to_string(&json).unwrap_or_default()))
        }
        _ => Ok(SqlValue::Null),
    }
}

fn table_has_tostring(t: &mlua::Table) -> bool {
    t.get_metatable()
        .map(|mt| {
            mt.get::<_, LuaValue>("__tostring")
                .map(|v| !matches!(v, LuaValue::Nil))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

fn lua_value_as_i64(v: &LuaValue) -> Option<i64> {
    match v {
        LuaValue::Integer(i) => Some(*i),
        LuaValue::Number(n) => Some(*n as i64),
        LuaValue::Boolean(b) => Some(if *b { 1 } else { 0 }),
        _ => None,
    }
}

/// Register `sql.open(path)` as the only entry point into this module.
pub fn install(lua: &Lua) -> mlua::Result<()> {
    let sql_table = lua.create_table()?;
    sql_table.set(
        "open",
        lua.create_function(|_, path: String| {
            Database::open(&path).map_err(|e| mlua::Error::external(e.to_string()))
        })?,
    )?;
    lua.globals().set("sql", sql_table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_select_roundtrip() {
        let lua = Lua::new();
        install(&lua).unwrap();
        lua.load(
            r#"
            local db = sql.open(":memory:")
            db:query("create table t (a integer, b text)")
            local stmt = db:prepare("insert into t (a, b) values (?, ?)")
            stmt:bind(1, 7, true)
            stmt:bind(2, "seven")
            stmt:execute()
            rows = db:query("select a, b from t", true)
            "#,
        )
        .exec()
        .unwrap();
        let rows: mlua::Table = lua.globals().get("rows").unwrap();
        let header: mlua::Table = rows.get(1).unwrap();
        assert_eq!(header.get::<_, String>(1).unwrap(), "a");
        let row: mlua::Table = rows.get(2).unwrap();
        assert_eq!(row.get::<_, i64>(1).unwrap(), 7);
        assert_eq!(row.get::<_, String>(2).unwrap(), "seven");
    }

    #[test]
    fn ddl_without_rows_returns_affected_count() {
        let lua = Lua::new();
        install(&lua).unwrap();
        lua.load(
            r#"
            local db = sql.open(":memory:")
            n = db:query("create table t (a integer)")
            "#,
        )
        .exec()
        .unwrap();
        let n: i64 = lua.globals().get("n").unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn empty_blob_surfaces_as_empty_string_not_nil() {
        let lua = Lua::new();
        install(&lua).unwrap();
        lua.load(
            r#"
            local db = sql.open(":memory:")
            db:query("create table t (b blob)")
            local stmt = db:prepare("insert into t (b) values (?)")
            local empty = { byteLength = 0 }
            stmt:bind(1, empty)
            stmt:execute()
            rows = db:query("select b from t", false)
            "#,
        )
        .exec()
        .unwrap();
        let rows: mlua::Table = lua.globals().get("rows").unwrap();
        let row: mlua::Table = rows.get(1).unwrap();
        let v: mlua::Value = row.get(1).unwrap();
        match v {
            mlua::Value::String(s) => assert_eq!(s.as_bytes().len(), 0),
            other => panic!("expected empty string, got {other:?}"),
        }
    }
}
