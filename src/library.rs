//! On-demand library resolver exposed to scripts as `import(name)` (§4.3).
//!
//! Resolution order is `NAME.lua` (script source, evaluated in the request's
//! VM) then the platform's native extension filename (loaded via
//! `libloading`). A library already registered in the Request Context is a
//! no-op on re-import -- only its first load runs, matching Lua's
//! `require`-style "load once" convention.

use std::cell::RefCell;
use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::Lua;

use crate::context::{LoadedLibrary, RequestContext};
use crate::error::{format_lua_error, AppError, AppResult};

/// Minimal FFI surface handed to a native library's init entry point. A
/// native extension can only observe the Lua environment through this table
/// of callbacks -- it never receives a raw `lua_State*` -- so the boundary
/// stays in safe-by-construction Rust on our side of the call.
#[repr(C)]
pub struct NativeLibraryApi {
    ctx: *mut c_void,
    pub set_global: unsafe extern "C" fn(ctx: *mut c_void, name: *const i8, value: *const i8) -> i32,
}

struct ApiContext<'a> {
    lua: &'a Lua,
}

unsafe extern "C" fn set_global_impl(ctx: *mut c_void, name: *const i8, value: *const i8) -> i32 {
    if ctx.is_null() || name.is_null() || value.is_null() {
        return 1;
    }
    let api_ctx = &*(ctx as *const ApiContext);
    let name = CStr::from_ptr(name).to_string_lossy();
    let value = CStr::from_ptr(value).to_string_lossy();
    match api_ctx.lua.globals().set(name.as_ref(), value.as_ref()) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Entry point a native library exposes to be loaded via `import(name)`.
pub type LibraryInitFn = unsafe extern "C" fn(api: *const NativeLibraryApi) -> i32;

fn native_lib_filename(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{name}.dll")
    } else if cfg!(target_os = "macos") {
        format!("lib{name}.dylib")
    } else {
        format!("lib{name}.so")
    }
}

/// Resolve and load `name`, registering it in `ctx` on success. Returns
/// whatever the script form evaluates to (`nil` for native libraries and for
/// an already-loaded re-import).
pub fn import(
    lua: &Lua,
    lib_path: Option<&Path>,
    ctx: &Rc<RefCell<RequestContext>>,
    name: &str,
) -> AppResult<mlua::Value> {
    if ctx.borrow().libraries.contains_key(name) {
        return Ok(mlua::Value::Nil);
    }
    let lib_path = lib_path.ok_or_else(|| AppError::Library("no library path".to_string()))?;

    let script_path = lib_path.join(format!("{name}.lua"));
    if script_path.is_file() {
        return load_script_library(lua, ctx, name, &script_path);
    }

    let native_path = lib_path.join(native_lib_filename(name));
    if native_path.is_file() {
        return load_native_library(lua, ctx, name, &native_path);
    }

    Err(AppError::Library(format!("module '{name}' not found")))
}

fn load_script_library(
    lua: &Lua,
    ctx: &Rc<RefCell<RequestContext>>,
    name: &str,
    path: &Path,
) -> AppResult<mlua::Value> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| AppError::Library(format!("{}: {}", path.display(), e)))?;
    let result: mlua::Value = lua
        .load(&source)
        .set_name(name)
        .eval()
        .map_err(|e| AppError::Library(format_lua_error(&e)))?;
    ctx.borrow_mut().libraries.insert(
        name.to_string(),
        LoadedLibrary {
            name: name.to_string(),
            native: None,
        },
    );
    Ok(result)
}

fn load_native_library(
    lua: &Lua,
    ctx: &Rc<RefCell<RequestContext>>,
    name: &str,
    path: &PathBuf,
) -> AppResult<mlua::Value> {
    let library = unsafe { libloading::Library::new(path) }
        .map_err(|e| AppError::Library(format!("{}: {}", path.display(), e)))?;
    let init: libloading::Symbol<LibraryInitFn> = unsafe {
        library
            .get(b"clarium_library_init\0")
            .map_err(|e| AppError::Library(format!("{}: {}", path.display(), e)))?
    };

    let api_ctx = ApiContext { lua };
    let api = NativeLibraryApi {
        ctx: &api_ctx as *const ApiContext as *mut c_void,
        set_global: set_global_impl,
    };
    let rc = unsafe { init(&api as *const NativeLibraryApi) };
    if rc != 0 {
        // Init failed: the handle is dropped here (closed) without ever
        // reaching the Request Context's library table (§9 resolved open
        // question -- a failed-init library must not stay registered).
        return Err(AppError::Library(format!(
            "module '{name}' init failed with code {rc}"
        )));
    }

    ctx.borrow_mut().libraries.insert(
        name.to_string(),
        LoadedLibrary {
            name: name.to_string(),
            native: Some(library),
        },
    );
    Ok(mlua::Value::Nil)
}

#[allow(dead_code)]
fn _name_is_valid_c_identifier(name: &str) -> bool {
    CString::new(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestData;

    #[test]
    fn missing_lib_path_is_an_error() {
        let lua = Lua::new();
        let ctx = Rc::new(RefCell::new(RequestContext::new(RequestData::default())));
        let err = import(&lua, None, &ctx, "nope").unwrap_err();
        assert!(matches!(err, AppError::Library(_)));
        assert_eq!(err.to_string(), "no library path");
    }

    #[test]
    fn script_library_loads_and_evaluates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greet.lua"), "return 'hi'").unwrap();
        let lua = Lua::new();
        let ctx = Rc::new(RefCell::new(RequestContext::new(RequestData::default())));
        let v = import(&lua, Some(dir.path()), &ctx, "greet").unwrap();
        match v {
            mlua::Value::String(s) => assert_eq!(s.to_str().unwrap(), "hi"),
            other => panic!("expected string, got {other:?}"),
        }
        assert!(ctx.borrow().libraries.contains_key("greet"));
    }

    #[test]
    fn unknown_library_name_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let lua = Lua::new();
        let ctx = Rc::new(RefCell::new(RequestContext::new(RequestData::default())));
        let err = import(&lua, Some(dir.path()), &ctx, "ghost").unwrap_err();
        assert_eq!(err.to_string(), "module 'ghost' not found");
    }

    #[test]
    fn reimport_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greet.lua"), "return 'hi'").unwrap();
        let lua = Lua::new();
        let ctx = Rc::new(RefCell::new(RequestContext::new(RequestData::default())));
        import(&lua, Some(dir.path()), &ctx, "greet").unwrap();
        let v = import(&lua, Some(dir.path()), &ctx, "greet").unwrap();
        assert!(matches!(v, mlua::Value::Nil));
    }
}
