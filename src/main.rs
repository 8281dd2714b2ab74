use anyhow::Result;
use clap::{Parser, Subcommand};
use corexd::{auth, config::DaemonConfig, session::SessionRegistry, AppContext};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "corexd",
    about = "CoreX Host — local CLI↔GUI command-execution daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "COREXD_PORT")]
    port: Option<u16>,

    /// Bind address for the WebSocket server (default: 127.0.0.1)
    #[arg(long, env = "COREXD_BIND")]
    bind: Option<String>,

    /// Data directory for the auth token file and config.toml
    #[arg(long, env = "COREXD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COREXD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "COREXD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon server (default when no subcommand given).
    ///
    /// Runs corexd in the foreground. A fresh auth token is generated on
    /// every start and written to {data_dir}/auth_token for the GUI client
    /// to pick up.
    ///
    /// Examples:
    ///   corexd serve
    ///   corexd
    Serve,
    /// Print the current auth token file path and value.
    ///
    /// The GUI client reads the same file out-of-band; this subcommand is
    /// for manual clients and debugging. The token rotates on every daemon
    /// start, so the printed value is only valid while that run is alive.
    ///
    /// Examples:
    ///   corexd token
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Token) => print_token(args.data_dir),
        None | Some(Command::Serve) => run_server(args).await,
    }
}

fn print_token(data_dir: Option<std::path::PathBuf>) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(corexd::config::default_data_dir);
    let path = auth::token_path(&data_dir);
    let token = std::fs::read_to_string(&path).map_err(|e| {
        anyhow::anyhow!(
            "no token at {} — is the daemon running? ({e})",
            path.display()
        )
    })?;
    println!("{}", path.display());
    println!("{}", token.trim());
    Ok(())
}

async fn run_server(args: Args) -> Result<()> {
    let config = Arc::new(DaemonConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bind,
    ));
    let _log_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "corexd starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        bind = %config.bind_address,
        "config loaded"
    );

    let token_store = match auth::TokenStore::generate(&config.data_dir) {
        Ok(store) => {
            info!(path = %store.path().display(), "auth token ready");
            Arc::new(store)
        }
        Err(e) => {
            // Without a token file a legitimate client can never authenticate,
            // so the daemon must not listen at all.
            eprintln!("FATAL: failed to write auth token: {e:#}");
            std::process::exit(1);
        }
    };
    auth::check_token_permissions(&config.data_dir);

    let ctx = Arc::new(AppContext {
        config,
        registry: Arc::new(SessionRegistry::new()),
        token_store: token_store.clone(),
        started_at: std::time::Instant::now(),
    });

    let run_result = corexd::ipc::run(ctx).await;

    // Clean shutdown invalidates the credential for this run.
    token_store.remove_file();
    run_result
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("corexd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only — don't panic on a bad log path.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
