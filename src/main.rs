use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use breaksync::core::{LocalCore, ManualActivity, MemoryConfigurator};
use breaksync::{storage, AppState, Collaborators};

/// Keeps break timers, modes and activity in step across machines on a LAN.
#[derive(Parser, Debug)]
#[command(name = "breaksync", version)]
struct Cli {
    /// State directory holding the identity and settings files.
    #[arg(long, env = "BREAKSYNC_HOME")]
    home: Option<PathBuf>,

    /// Listen port for direct links and the announce group.
    #[arg(long, short)]
    port: Option<u16>,

    /// Peer to keep a link to, as host:port. May be repeated.
    #[arg(long = "connect", short = 'c')]
    connect: Vec<String>,

    #[arg(long)]
    no_multicast: bool,

    /// Dial peers heard on the announce group.
    #[arg(long)]
    auto_connect: bool,

    /// Write logs to a daily file in this directory instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let _guard = breaksync::init_logging(cli.log_dir.as_deref())?;

    let home = match cli.home {
        Some(home) => home,
        None => storage::default_home()?,
    };

    let mut settings = storage::load_settings(&home);
    if let Some(port) = cli.port {
        settings.port = port;
    }
    settings.peers.extend(cli.connect);
    if cli.no_multicast {
        settings.multicast = false;
    }
    if cli.auto_connect {
        settings.auto_connect = true;
    }

    if !settings.enabled {
        tracing::info!("networking disabled in {}", home.display());
        return Ok(());
    }

    let local_id = storage::load_or_create_id(&home, settings.port)?;
    tracing::info!(peer = %local_id, "starting");

    let collaborators = Collaborators {
        config: Arc::new(MemoryConfigurator::new()),
        core: Arc::new(LocalCore::new()),
        activity: Arc::new(ManualActivity::new(false)),
    };
    let app = AppState::start(&settings, local_id, collaborators).await?;
    tracing::info!("listening on {}", app.network.listen_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    app.shutdown().await;
    Ok(())
}
