use clap::{Args, Parser, Subcommand};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vllm_router::client::create_pooled_client;
use vllm_router::config::ConfigFile;
use vllm_router::upstream::Fleet;
use vllm_router::{AppState, build_router, discovery, health, reload, scraper};

#[derive(Debug, Parser)]
#[command(name = "vllm-router", version, about = "Load-aware reverse proxy for LLM inference fleets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the router.
    Run(RunArgs),
    /// Parse and validate a config file, then exit.
    CheckConfig {
        #[arg(long, env = "CONFIG_PATH", default_value = "servers.toml")]
        config: PathBuf,
    },
    /// Print the version string.
    Version,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Address to bind.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, short = 'p', env = "PORT", default_value_t = 8888)]
    port: u16,

    /// Path to the fleet configuration file.
    #[arg(long, env = "CONFIG_PATH", default_value = "servers.toml")]
    config: PathBuf,

    /// Pretty (ANSI) console log output.
    #[arg(long, short = 'c', env = "LOG_TO_CONSOLE", default_value_t = false)]
    console: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: String,

    /// Accepted for CLI compatibility; the config file is always watched.
    #[arg(long, hide = true, default_value_t = false)]
    reload: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("vllm-router {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Command::CheckConfig { config } => check_config(&config),
        Command::Run(args) => run(args),
    }
}

fn check_config(path: &PathBuf) -> ExitCode {
    match ConfigFile::load(path) {
        Ok(config) => {
            println!(
                "{}: {} upstreams, health check every {}s, reload every {}s",
                path.display(),
                config.servers.servers.len(),
                config.tuning.health_check_interval,
                config.tuning.config_reload_interval,
            );
            for spec in &config.servers.servers {
                println!(
                    "  {} (max_concurrent_requests: {})",
                    spec.url, spec.max_concurrent_requests
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("configuration error: {err}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(args: &RunArgs) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(args.console)
        .init();
}

fn run(args: RunArgs) -> ExitCode {
    init_logging(&args);

    let config = match ConfigFile::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, path = %args.config.display(), "failed to load configuration");
            return ExitCode::from(2);
        }
    };
    if args.reload {
        warn!("--reload is accepted for compatibility; config reload is always on");
    }

    match serve(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn serve(args: RunArgs, config: ConfigFile) -> anyhow::Result<()> {
    info!(
        upstreams = config.servers.servers.len(),
        config = %args.config.display(),
        "starting vllm-router"
    );

    let fleet = Fleet::new(reload::build_fleet(config));
    let client = create_pooled_client();

    // Background loops share the fleet handle, the pooled client, and one
    // shutdown signal; the supervisor joins them after the server drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = vec![
        tokio::spawn(scraper::run_scraper(
            client.clone(),
            fleet.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(health::run_health_checker(
            client.clone(),
            fleet.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(discovery::run_discovery(
            client.clone(),
            fleet.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(reload::run_config_watcher(
            args.config.clone(),
            fleet.clone(),
            shutdown_rx.clone(),
        )),
    ];

    // In-flight forwards get up to request_timeout to drain once the
    // shutdown signal fires; after that remaining connections are closed.
    let drain_deadline = fleet.load().tuning.forward_timeout();

    let state = AppState::with_client(fleet, client);
    let router = build_router(state);

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("vllm-router listening on {bind_addr}");

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        });
    }

    let mut drain_rx = shutdown_rx.clone();
    let mut signal_rx = shutdown_rx;
    let serve_future = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = drain_rx.changed().await;
        })
        .into_future();
    tokio::pin!(serve_future);

    let served = tokio::select! {
        result = &mut serve_future => result,
        _ = signal_rx.changed() => {
            match tokio::time::timeout(drain_deadline, &mut serve_future).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "open connections did not drain within {}s, closing them",
                        drain_deadline.as_secs()
                    );
                    Ok(())
                }
            }
        }
    };
    served?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        task.await?;
    }
    info!("vllm-router stopped");
    Ok(())
}
