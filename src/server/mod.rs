//! HTTP(S) wiring: `axum::Router` construction, static file serving via
//! `tower-http`, script dispatch through the executor, native-module
//! dispatch, and graceful shutdown (§5, §6).
//!
//! Grounded in the teacher's `server.rs` `AppState`-via-`with_state` idiom
//! (one `Arc<ServerState>` cloned into the router, no process-global
//! singletons beyond the shutdown flag -- §9 design note).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::Notify;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::bytecode_cache::BytecodeCache;
use crate::config::ServerConfig;
use crate::context::RequestData;
use crate::executor::{self, ScriptRouter};
use crate::kv::KvStore;
use crate::modules::ModuleRegistry;

pub struct ServerState {
    pub config: ServerConfig,
    pub bytecode_cache: Arc<BytecodeCache>,
    pub kv: KvStore,
    pub router: ScriptRouter,
    pub modules: ModuleRegistry,
    pub shutdown: Arc<AtomicBool>,
}

/// Marks which listener accepted a connection -- inserted as a request
/// extension by a per-router `layer`, since a plain HTTP listener and the
/// `axum_server`-driven TLS listener share the same `Router`/`ServerState`
/// and otherwise have no way to tell `cgi.isSecure()` apart.
#[derive(Clone, Copy)]
struct IsSecure(bool);

/// `is_secure` distinguishes the plain-HTTP router from the TLS router --
/// both wrap the same `state`, but only the TLS one stamps every request
/// with `IsSecure(true)` so `cgi.isSecure()` reports accurately.
pub fn build_router(state: Arc<ServerState>, is_secure: bool) -> Router {
    Router::new()
        .route("/", any(dispatch))
        .route("/*path", any(dispatch))
        .layer(axum::Extension(IsSecure(is_secure)))
        .with_state(state)
}

async fn dispatch(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let is_secure = request
        .extensions()
        .get::<IsSecure>()
        .copied()
        .unwrap_or(IsSecure(false))
        .0;

    if let Some(module) = state.modules.find(&path) {
        let (parts, body) = request.into_parts();
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(b) => b,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        return dispatch_module(&state, module, &parts.method, &path, &bytes);
    }

    match state.router.resolve(&path) {
        Ok(Some(script_path)) => {
            return dispatch_script(&state, request, &path, is_secure, script_path).await
        }
        Ok(None) => {}
        Err(e) => {
            let code = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
            return (code, e.body()).into_response();
        }
    }

    serve_static(&state.config.docroot, request).await
}

async fn serve_static(docroot: &std::path::Path, request: Request) -> Response {
    match ServeDir::new(docroot).oneshot(request).await {
        Ok(resp) => resp.into_response(),
        Err(e) => {
            error!(target: "luaserv", "static file service error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn dispatch_module(
    state: &Arc<ServerState>,
    module: &crate::modules::LoadedModule,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Response {
    let strings = facility_strings(&state.config);
    let https_port = state.config.ssl.as_ref().map(|s| s.port).unwrap_or(0);
    let facility = crate::modules::build_facility(&strings, state.config.http_port, https_port, &state.kv);

    match module.handle(&facility, method.as_str(), path, body) {
        Ok((status, resp_body)) => {
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (code, resp_body).into_response()
        }
        Err(e) => {
            error!(target: "luaserv", "module handler failed for {path}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.body()).into_response()
        }
    }
}

fn facility_strings(config: &ServerConfig) -> crate::modules::FacilityStrings {
    let cstr = |p: Option<&std::path::Path>| {
        std::ffi::CString::new(
            p.unwrap_or(std::path::Path::new("")).to_string_lossy().as_bytes(),
        )
        .unwrap_or_default()
    };
    crate::modules::FacilityStrings {
        docroot: cstr(Some(&config.docroot)),
        scripts_path: cstr(config.scripts_path.as_deref()),
        modules_path: cstr(config.modules_path.as_deref()),
        libpath: cstr(config.libpath.as_deref()),
    }
}

async fn dispatch_script(
    state: &Arc<ServerState>,
    request: Request,
    path: &str,
    is_secure: bool,
    script_path: PathBuf,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let request_data =
        build_request_data(&parts.method, path, is_secure, &parts.uri, &parts.headers, &bytes);

    let bytecode_cache = state.bytecode_cache.clone();
    let kv = state.kv.clone();
    let library_path = state.config.libpath.clone();

    let result = tokio::task::spawn_blocking(move || {
        executor::execute(&bytecode_cache, &kv, &script_path, library_path.as_deref(), request_data)
    })
    .await;

    match result {
        Ok(resp) => executed_response_into_axum(resp),
        Err(join_err) => {
            error!(target: "luaserv", "script task panicked: {join_err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn executed_response_into_axum(resp: executor::ExecutedResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &resp.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                builder = builder.header(name, value);
            }
            _ => warn!(target: "luaserv", "dropping malformed response header {name}"),
        }
    }
    builder
        .body(Body::from(resp.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn build_request_data(
    method: &Method,
    path: &str,
    is_secure: bool,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> RequestData {
    let mut req = RequestData {
        method: method.as_str().to_string(),
        is_secure,
        path: path.to_string(),
        full_path: path.to_string(),
        ..Default::default()
    };

    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            req.headers.insert(name.as_str().to_string(), v.to_string());
        }
    }

    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        for part in cookie_header.split(';') {
            if let Some((k, v)) = part.trim().split_once('=') {
                req.cookies.insert(k.to_string(), v.to_string());
            }
        }
    }

    if let Some(query) = uri.query() {
        for (k, v) in parse_urlencoded_pairs(query) {
            req.query.insert(k, v);
        }
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if method == Method::POST && content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(body_str) = std::str::from_utf8(body) {
            for (k, v) in parse_urlencoded_pairs(body_str) {
                req.post_fields.push((k, v));
            }
        }
    }

    req
}

/// `application/x-www-form-urlencoded`-style `a=1&b=2` parsing. Grounded in
/// the teacher's direct use of the `urlencoding` crate for percent-decoding
/// rather than pulling in a dedicated query-string crate for two fields.
fn parse_urlencoded_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(k), decode(v))
        })
        .collect()
}

/// Runs the server to completion: binds the configured listener(s) -- plain
/// HTTP always, plus a second TLS listener via `axum-server`'s
/// `RustlsConfig` when the config carries an `ssl` section -- serves until a
/// shutdown signal arrives, then joins in-flight work and runs module
/// destroy hooks (§5 cancellation/timeouts, §9 resolved ordering).
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let kv = KvStore::new();
    let _sweeper = kv.spawn_sweeper(Duration::from_secs(1));

    let modules = ModuleRegistry::load(&config.docroot, &config.module_bindings, &kv)?;
    let router = ScriptRouter::new(
        config.docroot.clone(),
        config.script_bindings.clone(),
        config.global_ext.as_deref(),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let ssl = config.ssl.clone();

    let state = Arc::new(ServerState {
        bytecode_cache: Arc::new(BytecodeCache::new()),
        kv,
        router,
        modules,
        shutdown: shutdown.clone(),
        config,
    });

    let http_app = build_router(state.clone(), false);

    info!(target: "luaserv", "listening on {http_addr}");
    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    let http_notify = notify.clone();
    let http_server =
        axum::serve(listener, http_app).with_graceful_shutdown(async move {
            http_notify.notified().await;
        });

    let tls_handle = axum_server::Handle::new();
    let https_server = match ssl.as_ref() {
        Some(ssl) => {
            let tls_config = RustlsConfig::from_pem_file(&ssl.cert, &ssl.key)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load TLS certificate/key: {e}"))?;
            let https_addr = SocketAddr::from(([0, 0, 0, 0], ssl.port));
            info!(target: "luaserv", "listening (tls) on {https_addr}");
            let https_app = build_router(state.clone(), true);
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(tls_handle.clone())
                    .serve(https_app.into_make_service()),
            )
        }
        None => None,
    };

    let signal_task = tokio::spawn(shutdown_signal(shutdown.clone(), notify, tls_handle));

    match https_server {
        Some(https_server) => {
            let (http_res, https_res) = tokio::join!(http_server, https_server);
            http_res?;
            https_res?;
        }
        None => http_server.await?,
    }
    signal_task.abort();

    // Module destroy hooks run strictly after both listeners have stopped
    // and every in-flight `spawn_blocking` task has joined (resolved §9 open
    // question on shutdown ordering). Both `axum::serve` and the TLS server
    // were handed their own `Arc` clone of `app`/`state`, both have now
    // returned and dropped their clones, so this should be the sole
    // remaining owner; if some task is still unwinding, skip teardown rather
    // than invent a parallel module registry.
    match Arc::try_unwrap(state) {
        Ok(state) => state.modules.shutdown(),
        Err(_) => warn!(
            target: "luaserv",
            "server state still referenced at shutdown; skipping module destroy hooks"
        ),
    }
    Ok(())
}

/// Waits for SIGTERM/SIGINT, then wakes every listener's graceful-shutdown
/// future via `notify` and asks the TLS listener's `Handle` to wind down
/// in-flight connections with a grace period (the plain HTTP side gets the
/// same treatment for free from `axum::serve`'s own graceful shutdown).
async fn shutdown_signal(flag: Arc<AtomicBool>, notify: Arc<Notify>, tls_handle: axum_server::Handle) {
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
    ])
    .expect("failed to register signal handlers");

    tokio::task::spawn_blocking(move || {
        for _ in signals.forever() {
            break;
        }
    })
    .await
    .ok();

    flag.store(true, Ordering::SeqCst);
    info!(target: "luaserv", "shutdown signal received");
    notify.notify_waiters();
    tls_handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoded_pairs_decode_plus_as_space_and_percent_escapes() {
        let pairs = parse_urlencoded_pairs("who=hello+world&q=a%2Bb");
        assert_eq!(pairs[0], ("who".to_string(), "hello world".to_string()));
        assert_eq!(pairs[1], ("q".to_string(), "a+b".to_string()));
    }

    #[test]
    fn empty_query_string_yields_no_pairs() {
        assert!(parse_urlencoded_pairs("").is_empty());
    }

    #[test]
    fn build_request_data_carries_is_secure_flag_through() {
        let method = Method::GET;
        let uri: axum::http::Uri = "/x".parse().unwrap();
        let headers = HeaderMap::new();
        let body = Bytes::new();

        let plain = build_request_data(&method, "/x", false, &uri, &headers, &body);
        assert!(!plain.is_secure);

        let tls = build_request_data(&method, "/x", true, &uri, &headers, &body);
        assert!(tls.is_secure);
    }
}
