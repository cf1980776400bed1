//! The `cgi.*` / `kv.*` / `import` surface installed into every fresh script
//! VM (§4.4). Grounded in the teacher's `scripts.rs` global-registration
//! idiom (one `install`-style function per subsystem, `Lua::set_app_data` for
//! per-request state) and its JSON/Lua value bridging helpers.
//!
//! A VM has no `alert`-equivalent to strip; Lua's only ambient global this
//! design removes is `print`, since `cgi.print` is the one and only way a
//! script writes to the response body (§4.4).

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Lua, Value as LuaValue, Variadic};
use serde_json::Value as JsonValue;

use crate::context::RequestContext;
use crate::error::AppError;
use crate::kv::{KvStore, KvValue, SetOutcome};
use crate::library;

/// Installs `cgi`, `kv`, and `import`, and binds `ctx` into the VM's app-data
/// slot so every closure below can reach it without threading it through
/// Lua call signatures. `script_dir` is the library search path passed to
/// `import` (§4.3); `kv` is the process-wide store shared by every worker.
pub fn install(
    lua: &Lua,
    ctx: Rc<RefCell<RequestContext>>,
    script_dir: Option<std::path::PathBuf>,
    kv: KvStore,
) -> mlua::Result<()> {
    lua.set_app_data(ctx.clone());
    lua.globals().set("print", mlua::Value::Nil)?;

    install_cgi(lua, ctx.clone())?;
    install_kv(lua, kv)?;
    install_import(lua, ctx, script_dir)?;
    crate::sql::install(lua)?;
    Ok(())
}

fn install_cgi(lua: &Lua, ctx: Rc<RefCell<RequestContext>>) -> mlua::Result<()> {
    let cgi = lua.create_table()?;

    let c = ctx.clone();
    cgi.set(
        "print",
        lua.create_function(move |_, args: Variadic<String>| {
            let mut c = c.borrow_mut();
            for a in args.iter() {
                c.print(a);
            }
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "setResponseCode",
        lua.create_function(move |_, code: u16| {
            c.borrow_mut().status_code = code;
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "setHeader",
        lua.create_function(move |_, (name, value): (String, String)| {
            c.borrow_mut().set_header(&name, &value);
            Ok(())
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getMethod",
        lua.create_function(move |lua, ()| {
            let c = c.borrow();
            match c.request.method.as_str() {
                "GET" | "POST" | "PUT" | "DELETE" | "HEAD" => {
                    Ok(LuaValue::String(lua.create_string(&c.request.method)?))
                }
                _ => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "isSecure",
        lua.create_function(move |_, ()| Ok(c.borrow().request.is_secure))?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getPath",
        lua.create_function(move |_, ()| Ok(c.borrow().request.path.clone()))?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getFullPath",
        lua.create_function(move |_, ()| Ok(c.borrow().request.full_path.clone()))?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getQuery",
        lua.create_function(move |lua, name: String| {
            let c = c.borrow();
            match c.request.query.get(&name) {
                Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getHeader",
        lua.create_function(move |lua, name: String| {
            let c = c.borrow();
            match c.request.headers.get(&name) {
                Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getCookie",
        lua.create_function(move |lua, name: String| {
            let c = c.borrow();
            match c.request.cookies.get(&name) {
                Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getPost",
        lua.create_function(move |lua, name: String| {
            let c = c.borrow();
            match c.request.get_post(&name) {
                Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let c = ctx.clone();
    cgi.set(
        "getFile",
        lua.create_function(move |lua, name: String| {
            let c = c.borrow();
            match c.request.files.get(&name) {
                Some(v) => Ok(LuaValue::String(lua.create_string(v)?)),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    // `getPostMulti(callback)` invokes `callback(name, value)` for every
    // posted field in submission order. If a callback throws, the first
    // error is captured and the iteration continues (so later callbacks
    // still observe every field) then re-raised once iteration completes
    // (§4.4).
    let c = ctx.clone();
    cgi.set(
        "getPostMulti",
        lua.create_function(move |_, callback: mlua::Function| {
            let fields = c.borrow().request.post_fields.clone();
            for (name, value) in fields {
                if let Err(e) = callback.call::<_, ()>((name, value)) {
                    let mut c = c.borrow_mut();
                    if c.pending_error.is_none() {
                        c.pending_error = Some(e.to_string());
                    }
                }
            }
            let pending = c.borrow_mut().pending_error.take();
            if let Some(msg) = pending {
                return Err(mlua::Error::external(AppError::Runtime(msg)));
            }
            Ok(())
        })?,
    )?;

    lua.globals().set("cgi", cgi)?;
    Ok(())
}

fn install_kv(lua: &Lua, kv: KvStore) -> mlua::Result<()> {
    let kv_table = lua.create_table()?;

    let store = kv.clone();
    kv_table.set(
        "get",
        lua.create_function(move |lua, key: String| match store.get(&key) {
            Some(KvValue::Bytes(b)) => Ok(LuaValue::String(lua.create_string(&b)?)),
            Some(KvValue::Native { .. }) | None => Ok(LuaValue::Nil),
        })?,
    )?;

    let store = kv.clone();
    kv_table.set(
        "set",
        lua.create_function(
            move |_, (key, value, ttl, nx): (String, Option<String>, Option<i64>, Option<bool>)| {
                let outcome = store.set(
                    &key,
                    value.map(KvValue::from_str),
                    ttl.unwrap_or(0),
                    nx.unwrap_or(false),
                );
                Ok(matches!(outcome, SetOutcome::Inserted | SetOutcome::Replaced))
            },
        )?,
    )?;

    let store = kv.clone();
    kv_table.set(
        "del",
        lua.create_function(move |_, key: String| Ok(matches!(store.del(&key), SetOutcome::Deleted)))?,
    )?;

    lua.globals().set("kv", kv_table)?;
    Ok(())
}

fn install_import(
    lua: &Lua,
    ctx: Rc<RefCell<RequestContext>>,
    script_dir: Option<std::path::PathBuf>,
) -> mlua::Result<()> {
    lua.globals().set(
        "import",
        lua.create_function(move |lua, name: String| {
            library::import(lua, script_dir.as_deref(), &ctx, &name)
                .map_err(|e| mlua::Error::external(e.to_string()))
        })?,
    )?;
    Ok(())
}

/// Converts a Lua value into `serde_json::Value` for the subset of types the
/// SQL bridge and diagnostics need: tables become JSON objects when every key
/// is a string, arrays otherwise, matching the teacher's `scripts.rs`
/// table-shape heuristic.
pub fn lua_to_json(value: LuaValue) -> Result<JsonValue, AppError> {
    match value {
        LuaValue::Nil => Ok(JsonValue::Null),
        LuaValue::Boolean(b) => Ok(JsonValue::Bool(b)),
        LuaValue::Integer(i) => Ok(JsonValue::from(i)),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)),
        LuaValue::String(s) => Ok(JsonValue::String(
            s.to_str()
                .map_err(|e| AppError::Runtime(e.to_string()))?
                .to_string(),
        )),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            let is_array = len > 0 && t.clone().pairs::<LuaValue, LuaValue>().count() == len;
            if is_array {
                let mut out = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.get(i).map_err(|e| AppError::Runtime(e.to_string()))?;
                    out.push(lua_to_json(v)?);
                }
                Ok(JsonValue::Array(out))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<LuaValue, LuaValue>() {
                    let (k, v) = pair.map_err(|e| AppError::Runtime(e.to_string()))?;
                    let key = match k {
                        LuaValue::String(s) => s
                            .to_str()
                            .map_err(|e| AppError::Runtime(e.to_string()))?
                            .to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        other => return Err(AppError::Runtime(format!("unsupported key type {other:?}"))),
                    };
                    map.insert(key, lua_to_json(v)?);
                }
                Ok(JsonValue::Object(map))
            }
        }
        other => Err(AppError::Runtime(format!("cannot serialize {other:?} to JSON"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestData;

    fn vm_with_ctx(request: RequestData) -> (Lua, Rc<RefCell<RequestContext>>) {
        let lua = Lua::new();
        let ctx = Rc::new(RefCell::new(RequestContext::new(request)));
        install(&lua, ctx.clone(), None, KvStore::new()).unwrap();
        (lua, ctx)
    }

    #[test]
    fn print_global_is_removed() {
        let (lua, _ctx) = vm_with_ctx(RequestData::default());
        let err = lua.load("print('x')").exec().unwrap_err();
        assert!(err.to_string().contains("nil"));
    }

    #[test]
    fn cgi_print_appends_to_response_body() {
        let (lua, ctx) = vm_with_ctx(RequestData::default());
        lua.load("cgi.print('hello ', 'world')").exec().unwrap();
        assert_eq!(ctx.borrow().response_body, b"hello world");
    }

    #[test]
    fn cgi_set_response_code_and_header() {
        let (lua, ctx) = vm_with_ctx(RequestData::default());
        lua.load("cgi.setResponseCode(201); cgi.setHeader('X-A', '1')")
            .exec()
            .unwrap();
        assert_eq!(ctx.borrow().status_code, 201);
        assert_eq!(ctx.borrow().response_headers.get("X-A").unwrap(), "1");
    }

    #[test]
    fn get_method_nil_for_unrecognised_verb() {
        let mut req = RequestData::default();
        req.method = "TRACE".to_string();
        let (lua, _ctx) = vm_with_ctx(req);
        let v: LuaValue = lua.load("return cgi.getMethod()").eval().unwrap();
        assert!(matches!(v, LuaValue::Nil));
    }

    #[test]
    fn get_full_path_and_get_file_read_request_snapshot() {
        let mut req = RequestData::default();
        req.full_path = "/a/b.jsx".to_string();
        req.files.insert("upload".to_string(), "contents".to_string());
        let (lua, _ctx) = vm_with_ctx(req);
        let full_path: String = lua.load("return cgi.getFullPath()").eval().unwrap();
        assert_eq!(full_path, "/a/b.jsx");
        let file: String = lua.load("return cgi.getFile('upload')").eval().unwrap();
        assert_eq!(file, "contents");
    }

    #[test]
    fn get_query_reads_request_snapshot() {
        let mut req = RequestData::default();
        req.query.insert("q".to_string(), "abc".to_string());
        let (lua, _ctx) = vm_with_ctx(req);
        let v: String = lua
            .load("return cgi.getQuery('q')")
            .eval()
            .unwrap();
        assert_eq!(v, "abc");
    }

    #[test]
    fn kv_roundtrip_through_lua() {
        let (lua, _ctx) = vm_with_ctx(RequestData::default());
        let ok: bool = lua
            .load("return kv.set('a', '1', 0, false)")
            .eval()
            .unwrap();
        assert!(ok);
        let v: String = lua.load("return kv.get('a')").eval().unwrap();
        assert_eq!(v, "1");
    }

    #[test]
    fn post_multi_reraises_first_callback_error_after_full_iteration() {
        let mut req = RequestData::default();
        req.post_fields.push(("a".to_string(), "1".to_string()));
        req.post_fields.push(("b".to_string(), "2".to_string()));
        let (lua, _ctx) = vm_with_ctx(req);
        lua.globals().set("seen", lua.create_table().unwrap()).unwrap();
        let err = lua
            .load(
                r#"
                cgi.getPostMulti(function(name, value)
                    table.insert(seen, name)
                    error("boom: " .. name)
                end)
                "#,
            )
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("boom: a"));
        let seen: mlua::Table = lua.globals().get("seen").unwrap();
        assert_eq!(seen.raw_len(), 2);
    }

    #[test]
    fn lua_to_json_table_with_only_int_keys_is_array() {
        let lua = Lua::new();
        let v: LuaValue = lua.load("return {10, 20, 30}").eval().unwrap();
        let json = lua_to_json(v).unwrap();
        assert_eq!(json, serde_json::json!([10, 20, 30]));
    }

    #[test]
    fn lua_to_json_table_with_string_keys_is_object() {
        let lua = Lua::new();
        let v: LuaValue = lua.load("return {a = 1, b = 'two'}").eval().unwrap();
        let json = lua_to_json(v).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": "two"}));
    }
}
