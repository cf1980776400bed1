//! Native plugin modules: startup-time loading, the `ModuleFacility` FFI
//! handle passed to them, and the Module Handler Adapter that presents a
//! loaded module as an Axum handler (§3 "Module Registration", §6 "Handler
//! facility").
//!
//! Grounded in `library.rs`'s `NativeLibraryApi` pattern (a narrow callback
//! table instead of a raw interpreter handle) but for whole-process-lifetime
//! modules rather than per-request libraries: `clarium_module_init` runs once
//! at startup, `clarium_module_handle` runs per matching request, and
//! `clarium_module_destroy` runs once at shutdown, in reverse registration
//! order (§3, §5 resource policy).

use std::ffi::CString;
use std::os::raw::c_char;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::error::{AppError, AppResult};
use crate::kv::{KvStore, KvValue};

/// The process-wide `KvStore`, reachable from `kv_get_impl`/`kv_set_impl`.
/// Those two functions are plain `extern "C"` pointers -- the C ABI has no
/// captured state, so there is no way to close over a `KvStore` handle the
/// way a Rust closure would. Set exactly once, in `ModuleRegistry::load`,
/// before any module's `init` (and therefore any possible call back in) runs.
static MODULE_KV: OnceCell<KvStore> = OnceCell::new();

pub type ModuleInitFn = unsafe extern "C" fn(docroot: *const c_char) -> i32;
pub type ModuleHandleFn = unsafe extern "C" fn(
    facility: *const ModuleFacility,
    method: *const c_char,
    path: *const c_char,
    body: *const u8,
    body_len: usize,
    out_status: *mut u16,
    out_body: *mut *mut u8,
    out_body_len: *mut usize,
) -> i32;
pub type ModuleDestroyFn = unsafe extern "C" fn();

type KvGetFn = unsafe extern "C" fn(key: *const c_char) -> *mut c_char;
type KvSetFn =
    unsafe extern "C" fn(key: *const c_char, value: *const c_char, ttl_seconds: i64, nx: i32) -> i32;

/// The server-wide handle given to native modules at request time (§6).
/// `#[repr(C)]` and pointer-based so it is safe to hand across the FFI
/// boundary; string fields are `CString`-owned to guarantee NUL termination.
#[repr(C)]
pub struct ModuleFacility {
    docroot: *const c_char,
    http_port: u16,
    https_port: u16,
    scripts_path: *const c_char,
    modules_path: *const c_char,
    libpath: *const c_char,
    kv_get: KvGetFn,
    kv_set: KvSetFn,
}

/// Returns a heap `CString` the caller owns (module side must treat it as
/// borrowed for the duration of the call -- there is no matching free
/// export, so native modules are expected to copy out of it rather than
/// retain the pointer, matching how `clarium_module_handle`'s own
/// out-params work). Null if the key is absent or not valid UTF-8.
unsafe extern "C" fn kv_get_impl(key: *const c_char) -> *mut c_char {
    let Some(kv) = MODULE_KV.get() else {
        return std::ptr::null_mut();
    };
    let key = match std::ffi::CStr::from_ptr(key).to_str() {
        Ok(k) => k,
        Err(_) => return std::ptr::null_mut(),
    };
    match kv.get_str(key) {
        Some(value) => match CString::new(value) {
            Ok(c) => c.into_raw(),
            Err(_) => std::ptr::null_mut(),
        },
        None => std::ptr::null_mut(),
    }
}

/// Mirrors the §4.1 set-semantics table: `value == NULL` deletes,
/// `ttl_seconds` follows the same `<0 clear / 0 keep / >0 set` rule as the
/// Lua `kv.set` binding, `nx` suppresses overwriting an existing key.
/// Returns 0 on success, 1 if the write was rejected (e.g. `nx` on an
/// existing key, or deleting an absent key).
unsafe extern "C" fn kv_set_impl(
    key: *const c_char,
    value: *const c_char,
    ttl_seconds: i64,
    nx: i32,
) -> i32 {
    let Some(kv) = MODULE_KV.get() else {
        return 1;
    };
    let key = match std::ffi::CStr::from_ptr(key).to_str() {
        Ok(k) => k,
        Err(_) => return 1,
    };
    let value = if value.is_null() {
        None
    } else {
        match std::ffi::CStr::from_ptr(value).to_str() {
            Ok(v) => Some(KvValue::from_str(v)),
            Err(_) => return 1,
        }
    };
    match kv.set(key, value, ttl_seconds, nx != 0) {
        crate::kv::SetOutcome::Rejected => 1,
        _ => 0,
    }
}

/// A loaded native module, bound permanently to one URL for the process
/// lifetime. Destroyed at shutdown by `ModuleRegistry::shutdown`, never
/// per-request (native modules are process-wide, unlike on-demand libraries
/// -- §9 design note on per-request vs process-wide native loading).
pub struct LoadedModule {
    pub url: String,
    library: libloading::Library,
    handle_symbol_name: &'static [u8],
    destroy_symbol_name: &'static [u8],
    has_destroy: bool,
}

impl LoadedModule {
    pub fn handle(
        &self,
        facility: &ModuleFacility,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> AppResult<(u16, Vec<u8>)> {
        let handle_fn: libloading::Symbol<ModuleHandleFn> = unsafe {
            self.library
                .get(self.handle_symbol_name)
                .map_err(|e| AppError::Library(e.to_string()))?
        };
        let method_c = CString::new(method).map_err(|e| AppError::Library(e.to_string()))?;
        let path_c = CString::new(path).map_err(|e| AppError::Library(e.to_string()))?;
        let mut status: u16 = 200;
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let rc = unsafe {
            handle_fn(
                facility as *const ModuleFacility,
                method_c.as_ptr(),
                path_c.as_ptr(),
                body.as_ptr(),
                body.len(),
                &mut status,
                &mut out_ptr,
                &mut out_len,
            )
        };
        if rc != 0 {
            return Err(AppError::Library(format!(
                "module '{}' handler failed with code {rc}",
                self.url
            )));
        }
        let response = if out_ptr.is_null() || out_len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(out_ptr, out_len).to_vec() }
        };
        Ok((status, response))
    }

    fn destroy(&self) {
        if !self.has_destroy {
            return;
        }
        let sym: Result<libloading::Symbol<ModuleDestroyFn>, _> =
            unsafe { self.library.get(self.destroy_symbol_name) };
        if let Ok(destroy_fn) = sym {
            unsafe { destroy_fn() };
        }
    }
}

/// Loads every configured module at startup; destroys them, in reverse
/// registration order, at shutdown (§3 Module Registration lifecycle, §5
/// resource policy).
pub struct ModuleRegistry {
    modules: Vec<LoadedModule>,
}

impl ModuleRegistry {
    /// `bindings` is `(url, shared_object_path)` as resolved from config.
    /// `kv` is stashed in `MODULE_KV` before any module's `init` runs, so a
    /// module is free to call back into `kv_get`/`kv_set` even from `init`.
    pub fn load(docroot: &Path, bindings: &[(String, PathBuf)], kv: &KvStore) -> AppResult<Self> {
        let _ = MODULE_KV.set(kv.clone());
        let mut modules = Vec::with_capacity(bindings.len());
        for (url, so_path) in bindings {
            let library = unsafe { libloading::Library::new(so_path) }
                .map_err(|e| AppError::Library(format!("{}: {}", so_path.display(), e)))?;
            let init: libloading::Symbol<ModuleInitFn> = unsafe {
                library
                    .get(b"clarium_module_init\0")
                    .map_err(|e| AppError::Library(format!("{}: {}", so_path.display(), e)))?
            };
            let docroot_c =
                CString::new(docroot.to_string_lossy().as_bytes()).map_err(|e| AppError::Library(e.to_string()))?;
            let rc = unsafe { init(docroot_c.as_ptr()) };
            if rc != 0 {
                return Err(AppError::Library(format!(
                    "module '{url}' init failed with code {rc}"
                )));
            }
            let has_destroy = unsafe { library.get::<ModuleDestroyFn>(b"clarium_module_destroy\0") }.is_ok();
            modules.push(LoadedModule {
                url: url.clone(),
                library,
                handle_symbol_name: b"clarium_module_handle\0",
                destroy_symbol_name: b"clarium_module_destroy\0",
                has_destroy,
            });
        }
        Ok(Self { modules })
    }

    pub fn find(&self, url: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.url == url)
    }

    /// Run every module's `destroy()` hook, in reverse registration order,
    /// then drop the library handles (closing them) -- resolves the §9 open
    /// question about ordering at shutdown explicitly rather than leaving it
    /// to signal-handler interleaving.
    pub fn shutdown(self) {
        for module in self.modules.iter().rev() {
            module.destroy();
        }
    }
}

/// Builds the `#[repr(C)]` facility handed to a module's `handle` call.
/// Caller-owned `CString`s back every pointer field and must outlive the
/// call.
pub struct FacilityStrings {
    pub docroot: CString,
    pub scripts_path: CString,
    pub modules_path: CString,
    pub libpath: CString,
}

/// `kv` is unused directly -- by the time any facility is built, `kv_get`/
/// `kv_set` already read the same store back out of `MODULE_KV`, set once in
/// `ModuleRegistry::load`. It stays a parameter so call sites read as binding
/// the facility to "this server's" KV store rather than a process global.
pub fn build_facility(
    strings: &FacilityStrings,
    http_port: u16,
    https_port: u16,
    _kv: &KvStore,
) -> ModuleFacility {
    ModuleFacility {
        docroot: strings.docroot.as_ptr(),
        http_port,
        https_port,
        scripts_path: strings.scripts_path.as_ptr(),
        modules_path: strings.modules_path.as_ptr(),
        libpath: strings.libpath.as_ptr(),
        kv_get: kv_get_impl,
        kv_set: kv_set_impl,
    }
}
