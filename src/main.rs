mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use strato_controller::build;
use strato_core::config::CoreConfig;
use strato_node::TcpTransport;
use strato_store::{BlockDriver, Datastore, LocalBlockDriver};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Human,
    Json,
}

#[derive(Parser)]
#[command(
    name = "stratod",
    version,
    about = "Tenant-aware cloud workload controller"
)]
struct Cli {
    /// Controller configuration file (TOML)
    #[arg(long, default_value = "/etc/strato/stratod.toml")]
    config: PathBuf,

    /// Override the persistent database directory
    #[arg(long)]
    database_dir: Option<PathBuf>,

    /// Override the scheduling peer address (host:port)
    #[arg(long)]
    server_url: Option<String>,

    /// Disable tenant networking (no appliances are launched)
    #[arg(long)]
    no_network: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormatArg::Human)]
    log_format: LogFormatArg,

    /// Print the effective configuration and exit
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        CoreConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        CoreConfig::default()
    };
    if let Some(dir) = cli.database_dir {
        config.database.persistent = dir;
    }
    if let Some(url) = cli.server_url {
        config.server_url = url;
    }
    if cli.no_network {
        config.no_network = true;
    }

    if cli.dump_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init(match cli.log_format {
        LogFormatArg::Human => logging::LogFormat::Human,
        LogFormatArg::Json => logging::LogFormat::Json,
    });

    serve(config).await
}

/// Bring the core up, then run until interrupted.
async fn serve(config: CoreConfig) -> Result<()> {
    let store = Arc::new(
        Datastore::open(&config.database.persistent)
            .with_context(|| "opening the persistent datastore")?,
    );

    let block: Arc<dyn BlockDriver> = Arc::new(LocalBlockDriver::new());

    let transport = Arc::new(
        TcpTransport::connect(&config.server_url)
            .await
            .with_context(|| format!("connecting to scheduling peer {}", config.server_url))?,
    );

    let (controller, _events) = build(config, store, block, transport);
    controller
        .initialize()
        .await
        .with_context(|| "initializing the controller")?;

    info!("controller ready");

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "listening for ctrl-c")?;
    info!("shutdown signal received");
    controller.shutdown();
    Ok(())
}
