use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// `daemonize` forks the process before any threads (including Tokio's
/// runtime threads) exist, so the fork has to happen ahead of
/// `#[tokio::main]` rather than inside it -- the runtime is built and
/// entered by hand after daemonizing succeeds.
fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    fmt().with_env_filter(filter).init();

    let mut args = std::env::args();
    let _program = args.next();
    let config_path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: luaserv <config.xml>");
            std::process::exit(1);
        }
    };

    let config = luaserv::config::load(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    });

    info!(target: "luaserv", "luaserv starting: docroot='{}', http_port={}", config.docroot.display(), config.http_port);

    daemonize::Daemonize::new().start().map_err(|e| {
        error!(target: "luaserv", "failed to daemonize: {e}");
        anyhow::anyhow!("daemonize failed: {e}")
    })?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(luaserv::server::run(config))
}
