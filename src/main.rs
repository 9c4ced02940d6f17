//! p2pnode: node entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse CLI, load settings, init logger
//!   3. Load or create the node identity
//!   4. Assemble the node configuration and the component graph
//!   5. Start the clearnet and overlay listeners under the supervisor

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use p2pnode::assembly::{self, Base};
use p2pnode::bootstrap::{identity, logger};
use p2pnode::config::{self, DEFAULT_DB_PORT, NodeFlags};
use p2pnode::error::AppError;
use p2pnode::supervisor::{self, Task, readiness::ReadinessRegistry};
use p2pnode::transport::{self, HttpListener, exporter};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; the file is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args()?;

    let settings = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(settings.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some(), settings.log_file.as_deref())?;

    info!(
        configured_log_level = %settings.log_level,
        effective_log_level = %effective_log_level,
        db_port = args.db_port,
        "settings loaded"
    );

    let loaded = identity::load_or_create(&settings.identity_file);
    info!(
        node_id = %loaded.node_id(),
        generated = loaded.was_generated(),
        "identity ready"
    );

    let node_config = Arc::new(config::assemble(
        loaded.signing_key.clone(),
        NodeFlags { db_port: args.db_port },
    ));

    // Installed before assembly so the assembly counters are recorded.
    let metrics = exporter::install();

    // Ctrl-C cancels this token; every listener and background consumer watches it.
    let shutdown = CancellationToken::new();

    let surface = assembly::assemble(Base::new(node_config, shutdown.clone())).await?;
    info!(components = surface.assembled.len(), "node assembled");

    let router = transport::build_routes(surface.router, metrics);
    let readiness = ReadinessRegistry::new();

    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    tasks.push(Box::new(HttpListener::new(
        settings.http.bind.clone(),
        router.clone(),
        readiness.reporter("http", true).await,
    )));
    tasks.extend(overlay_tasks(&settings, &loaded.signing_key, router, &readiness).await);

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    supervisor::run(tasks, shutdown, readiness).await
}

/// The swarm binds inside its task, so an overlay bind failure is reported
/// through the supervisor after the clearnet listener has started.
#[cfg(feature = "overlay-libp2p")]
async fn overlay_tasks(
    settings: &config::Settings,
    key: &ed25519_dalek::SigningKey,
    router: axum::Router,
    readiness: &ReadinessRegistry,
) -> Vec<Box<dyn Task>> {
    use p2pnode::transport::swarm::SwarmListener;

    if !settings.overlay.enabled {
        info!("overlay disabled; serving clearnet only");
        return Vec::new();
    }
    let listener = SwarmListener::new(
        key.clone(),
        settings.overlay.clone(),
        router,
        readiness.reporter("overlay", false).await,
    );
    vec![Box::new(listener)]
}

#[cfg(not(feature = "overlay-libp2p"))]
async fn overlay_tasks(
    settings: &config::Settings,
    _key: &ed25519_dalek::SigningKey,
    _router: axum::Router,
    _readiness: &ReadinessRegistry,
) -> Vec<Box<dyn Task>> {
    if settings.overlay.enabled {
        tracing::warn!("overlay enabled in settings but built without an overlay host; serving clearnet only");
    }
    Vec::new()
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    db_port: u16,
}

fn parse_cli_args() -> Result<CliArgs, AppError> {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut db_port = DEFAULT_DB_PORT;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: p2pnode [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -d, --db-port <PORT>       Local postgres port (default: {DEFAULT_DB_PORT})");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-d" | "--db-port" => {
                let value = iter
                    .next()
                    .ok_or_else(|| AppError::Config("-d/--db-port requires a port argument".into()))?;
                db_port = value
                    .parse()
                    .map_err(|e| AppError::Config(format!("invalid db port '{value}': {e}")))?;
            }
            "-f" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::Config("-f/--config requires a path argument".into()))?;
                config_path = Some(path);
            }
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            _ => {}
        }
    }

    Ok(CliArgs {
        log_level: logger::level_for_verbosity(verbosity),
        config_path,
        db_port,
    })
}
