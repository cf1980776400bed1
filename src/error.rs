//! Unified application error model.
//!
//! Every failure that can surface across a request boundary funnels through
//! `AppError` so the executor has one place to decide status code and body
//! text. Startup/config failures instead bubble up as `anyhow::Error` and are
//! fatal (see `main.rs`).

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    /// Script file missing or unreadable (`stat`/`read` failed) -- §4.5 step
    /// 3, surfaces as 500.
    #[error("{0}")]
    ScriptResolution(String),
    /// Resolved script path exceeds `MAX_SCRIPT_PATH_LEN` -- §4.5 step 1,
    /// surfaces as 400 rather than the 500 every other executor failure maps
    /// to, since this is a malformed request rather than a server fault.
    #[error("{0}")]
    PathTooLong(String),
    /// Compilation of a script to bytecode failed.
    #[error("{0}")]
    Compile(String),
    /// A script threw an uncaught error while executing.
    #[error("{0}")]
    Runtime(String),
    /// Library (script or native) import failed.
    #[error("{0}")]
    Library(String),
    /// SQL preparation/execution failed.
    #[error("{0}")]
    Sql(String),
    /// VM or other resource allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// Catch-all for I/O and OS-reported errors.
    #[error("{0}")]
    Io(String),
    /// Configuration document missing, unparsable, or missing a required
    /// element -- always fatal at startup (§7).
    #[error("{0}")]
    Config(String),
}

impl AppError {
    /// Every request-execution failure surfaces as 500 per spec, except an
    /// over-length script path (§4.5 step 1), which is the requester's
    /// fault and maps to 400. `Config` never reaches this path -- it is
    /// fatal at startup, never surfaced as an HTTP response.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::PathTooLong(_) => 400,
            _ => 500,
        }
    }

    pub fn body(&self) -> String {
        self.to_string()
    }
}

impl From<mlua::Error> for AppError {
    fn from(err: mlua::Error) -> Self {
        AppError::Runtime(format_lua_error(&err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// Unwraps an `mlua::Error` to its message text, peeling through the
/// `CallbackError` wrapper mlua adds around errors raised inside a Rust
/// callback. The structured `fileName : lineNumber : message` rendering for
/// a thrown Lua table happens earlier, inside the executor's `pcall`
/// wrapper script, while the table is still intact -- by the time an error
/// reaches this function it is already a plain string.
pub fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::RuntimeError(msg) => msg.clone(),
        other => other.to_string(),
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_500_except_path_too_long() {
        let variants = [
            AppError::ScriptResolution("x".into()),
            AppError::Compile("x".into()),
            AppError::Runtime("x".into()),
            AppError::Library("x".into()),
            AppError::Sql("x".into()),
            AppError::OutOfMemory,
            AppError::Io("x".into()),
            AppError::Config("x".into()),
        ];
        for v in variants {
            assert_eq!(v.http_status(), 500);
        }
    }

    #[test]
    fn path_too_long_maps_to_400() {
        assert_eq!(AppError::PathTooLong("x".into()).http_status(), 400);
    }

    #[test]
    fn out_of_memory_message() {
        assert_eq!(AppError::OutOfMemory.body(), "out of memory");
    }

}
