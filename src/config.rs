//! Configuration document parsing (§6). Grounded in the teacher's
//! `serde`-derive-everything style; the document itself is parsed with
//! `quick-xml`'s serde integration instead of the teacher's own format since
//! this system's config is XML, not the teacher's native config shape.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct ScriptBinding {
    #[serde(rename = "@url")]
    pub url: String,
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ScriptsSection {
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "@global", default)]
    pub global: Option<String>,
    #[serde(rename = "@libpath", default)]
    pub libpath: Option<String>,
    #[serde(rename = "script", default)]
    pub script: Vec<ScriptBinding>,
}

#[derive(Debug, Deserialize)]
pub struct ModuleBinding {
    #[serde(rename = "@url")]
    pub url: String,
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ModulesSection {
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "module", default)]
    pub module: Vec<ModuleBinding>,
}

#[derive(Debug, Deserialize)]
pub struct SslSection {
    pub port: u16,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename = "server")]
pub struct RawServerConfig {
    pub docroot: String,
    pub port: Option<u16>,
    pub scripts: Option<ScriptsSection>,
    pub modules: Option<ModulesSection>,
    pub ssl: Option<SslSection>,
}

/// The resolved, validated configuration used by the rest of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub docroot: PathBuf,
    pub http_port: u16,
    pub scripts_path: Option<PathBuf>,
    /// URL-extension pattern (e.g. `jsx`) that runs any matching request
    /// through the script executor against `docroot`.
    pub global_ext: Option<String>,
    pub libpath: Option<PathBuf>,
    pub script_bindings: Vec<(String, PathBuf)>,
    pub modules_path: Option<PathBuf>,
    pub module_bindings: Vec<(String, PathBuf)>,
    pub ssl: Option<SslConfig>,
}

#[derive(Debug, Clone)]
pub struct SslConfig {
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
}

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_GLOBAL_EXT: &str = "jsx";

/// Load and validate the configuration document at `path` (§6, §7 -- a
/// configuration error here is always fatal at startup), then let `CLARA_*`
/// environment variables override individual deployment knobs (§6, matching
/// the teacher's `CLARIUM_*`/`std::env::var` precedent in `main.rs`/
/// `server.rs` for the same purpose).
pub fn load(path: &Path) -> AppResult<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    let raw: RawServerConfig = quick_xml::de::from_str(&text)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    let mut config = validate(raw)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies `CLARA_*` overrides on top of the document-derived config. Each
/// variable is independently optional; an absent or unparsable value leaves
/// the document's own value in place rather than erroring, since these are
/// deployment-time knobs layered over a config that already validated.
fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(v) = std::env::var("CLARA_DOCROOT") {
        config.docroot = PathBuf::from(v);
    }
    if let Some(port) = std::env::var("CLARA_HTTP_PORT").ok().and_then(|v| v.parse().ok()) {
        config.http_port = port;
    }
    if let Ok(v) = std::env::var("CLARA_SCRIPTS_PATH") {
        config.scripts_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CLARA_MODULES_PATH") {
        config.modules_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CLARA_LIBPATH") {
        config.libpath = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("CLARA_GLOBAL_EXT") {
        config.global_ext = Some(v);
    }
    if let Some(ssl) = config.ssl.as_mut() {
        if let Some(port) = std::env::var("CLARA_SSL_PORT").ok().and_then(|v| v.parse().ok()) {
            ssl.port = port;
        }
    }
}

fn validate(raw: RawServerConfig) -> AppResult<ServerConfig> {
    let docroot = PathBuf::from(&raw.docroot);
    if raw.docroot.trim().is_empty() {
        return Err(AppError::Config("docroot must not be empty".to_string()));
    }

    let (scripts_path, global_ext, libpath, script_bindings) = match raw.scripts {
        Some(s) => {
            let base = PathBuf::from(&s.path);
            let bindings = s
                .script
                .iter()
                .map(|b| (b.url.clone(), base.join(&b.name)))
                .collect();
            let global = s.global.map(|g| if g.is_empty() { DEFAULT_GLOBAL_EXT.to_string() } else { g });
            (Some(base), global, s.libpath.map(PathBuf::from), bindings)
        }
        None => (None, None, None, Vec::new()),
    };

    let (modules_path, module_bindings) = match raw.modules {
        Some(m) => {
            let base = PathBuf::from(&m.path);
            let bindings = m
                .module
                .iter()
                .map(|b| (b.url.clone(), base.join(&b.name)))
                .collect();
            (Some(base), bindings)
        }
        None => (None, Vec::new()),
    };

    let ssl = raw.ssl.map(|s| SslConfig {
        port: s.port,
        cert: PathBuf::from(s.cert),
        key: PathBuf::from(s.key),
    });

    Ok(ServerConfig {
        docroot,
        http_port: raw.port.unwrap_or(DEFAULT_HTTP_PORT),
        scripts_path,
        global_ext,
        libpath,
        script_bindings,
        modules_path,
        module_bindings,
        ssl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_defaults_port_and_skips_optional_sections() {
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot>/var/www</docroot></server>"#,
        )
        .unwrap();
        let cfg = validate(raw).unwrap();
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert!(cfg.scripts_path.is_none());
        assert!(cfg.ssl.is_none());
    }

    #[test]
    fn empty_global_defaults_to_jsx() {
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot>/var/www</docroot><scripts path="/s" global=""/></server>"#,
        )
        .unwrap();
        let cfg = validate(raw).unwrap();
        assert_eq!(cfg.global_ext.as_deref(), Some("jsx"));
    }

    #[test]
    fn explicit_script_binding_resolves_to_path_plus_name() {
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot>/var/www</docroot>
               <scripts path="/s">
                 <script url="/echo" name="echo.lua"/>
               </scripts></server>"#,
        )
        .unwrap();
        let cfg = validate(raw).unwrap();
        assert_eq!(cfg.script_bindings.len(), 1);
        assert_eq!(cfg.script_bindings[0].0, "/echo");
        assert_eq!(cfg.script_bindings[0].1, PathBuf::from("/s/echo.lua"));
    }

    #[test]
    fn ssl_section_requires_all_three_fields() {
        let err = quick_xml::de::from_str::<RawServerConfig>(
            r#"<server><docroot>/var/www</docroot><ssl><port>8443</port><cert>c.pem</cert></ssl></server>"#,
        )
        .unwrap_err();
        // quick-xml's serde layer rejects the missing `key` element outright
        // since `SslSection` has no optional fields -- this is the
        // "all three required together" rule enforced at the type level
        // rather than with a second validation pass.
        let _ = err;
    }

    #[test]
    fn empty_docroot_is_rejected() {
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot></docroot></server>"#,
        )
        .unwrap();
        let err = validate(raw).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn env_override_replaces_document_port_and_docroot() {
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot>/var/www</docroot><port>8080</port></server>"#,
        )
        .unwrap();
        let mut cfg = validate(raw).unwrap();

        std::env::set_var("CLARA_DOCROOT", "/srv/override");
        std::env::set_var("CLARA_HTTP_PORT", "9090");
        apply_env_overrides(&mut cfg);
        std::env::remove_var("CLARA_DOCROOT");
        std::env::remove_var("CLARA_HTTP_PORT");

        assert_eq!(cfg.docroot, PathBuf::from("/srv/override"));
        assert_eq!(cfg.http_port, 9090);
    }

    #[test]
    fn absent_env_overrides_leave_document_values_untouched() {
        std::env::remove_var("CLARA_DOCROOT");
        std::env::remove_var("CLARA_HTTP_PORT");
        let raw: RawServerConfig = quick_xml::de::from_str(
            r#"<server><docroot>/var/www</docroot><port>1234</port></server>"#,
        )
        .unwrap();
        let mut cfg = validate(raw).unwrap();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.docroot, PathBuf::from("/var/www"));
        assert_eq!(cfg.http_port, 1234);
    }
}
