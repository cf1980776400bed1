//! Per-request mutable state (§3, "Request Context").
//!
//! One `RequestContext` is created per script dispatch and lives exactly as
//! long as the `spawn_blocking` closure that owns it; it is never shared
//! across requests or threads, so plain `HashMap`/`Vec` suffice -- no locking.
//! It is reachable from every host-API closure via the VM's app-data slot
//! (§9, "context via VM private slot"), realized with `mlua::Lua::set_app_data`.

use std::collections::HashMap;

/// A read-only snapshot of the inbound HTTP request, captured before the
/// script VM starts so host-API calls never need to touch the live Axum
/// request (whose body has already been consumed to build this snapshot).
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub method: String,
    pub is_secure: bool,
    pub path: String,
    pub full_path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Ordered so `getPostMulti` can honor POST-field insertion order;
    /// duplicate names are expected (repeated form fields).
    pub post_fields: Vec<(String, String)>,
    pub files: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

impl RequestData {
    pub fn get_post(&self, name: &str) -> Option<&str> {
        self.post_fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A library loaded on demand within one request (§4.3). Native handles are
/// released when the owning `RequestContext` drops.
pub struct LoadedLibrary {
    pub name: String,
    pub native: Option<libloading::Library>,
}

/// The per-request mutable bag threaded through every host-API call.
pub struct RequestContext {
    pub request: RequestData,
    pub status_code: u16,
    /// Case preserved exactly as the script supplied it; last write for an
    /// identical key wins per §4.4.
    pub response_headers: HashMap<String, String>,
    pub response_body: Vec<u8>,
    pub libraries: HashMap<String, LoadedLibrary>,
    /// Captures the first error thrown by a `getPostMulti` callback so it can
    /// be re-raised after the iteration completes (§4.4).
    pub pending_error: Option<String>,
    /// Set by the executor once bytecode is obtained; surfaced as the
    /// `Compiled: true` diagnostic header on a fresh compile.
    pub compiled_fresh: bool,
}

impl RequestContext {
    pub fn new(request: RequestData) -> Self {
        Self {
            request,
            status_code: 200,
            response_headers: HashMap::new(),
            response_body: Vec::new(),
            libraries: HashMap::new(),
            pending_error: None,
            compiled_fresh: false,
        }
    }

    pub fn print(&mut self, s: &str) {
        self.response_body.extend_from_slice(s.as_bytes());
    }

    /// `"null"`/`"undefined"` remove the header; setting an absent header to
    /// one of those values is a no-op (§4.4).
    pub fn set_header(&mut self, name: &str, value: &str) {
        if value == "null" || value == "undefined" {
            self.response_headers.remove(name);
        } else {
            self.response_headers.insert(name.to_string(), value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(RequestData::default())
    }

    #[test]
    fn default_status_is_200() {
        assert_eq!(ctx().status_code, 200);
    }

    #[test]
    fn print_concatenates_into_body() {
        let mut c = ctx();
        c.print("a");
        c.print("b");
        assert_eq!(c.response_body, b"ab");
    }

    #[test]
    fn set_header_then_remove_via_undefined() {
        let mut c = ctx();
        c.set_header("X", "keep");
        c.set_header("X", "undefined");
        assert!(!c.response_headers.contains_key("X"));
    }

    #[test]
    fn removal_of_absent_header_is_noop() {
        let mut c = ctx();
        c.set_header("X", "null");
        assert!(c.response_headers.is_empty());
    }

    #[test]
    fn last_write_wins_for_same_key() {
        let mut c = ctx();
        c.set_header("X-A", "1");
        c.set_header("X-A", "2");
        assert_eq!(c.response_headers.get("X-A").unwrap(), "2");
    }
}
