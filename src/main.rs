//! nicohub binary entry point. See the `nicohub` library for the core
//! functionality.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nicohub::user::UserStore;
use nicohub::{Account, HttpLiveApi, Hub, MessageRouter, Settings};

/// Global flag for signal-triggered shutdown (as Arc for signal-hook
/// compatibility).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "nicohub", version, about = "Live-broadcast comment client and plugin host")]
struct Cli {
    /// Configuration directory override.
    #[arg(long, global = true)]
    config_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub (default).
    Run {
        /// TCP port the plugin bus listens on; overrides settings.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective settings and exit.
    Config,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(dir) = &cli.config_dir {
        std::env::set_var("NICOHUB_CONFIG_DIR", dir);
    }

    match cli.command.unwrap_or(Commands::Run { port: None }) {
        Commands::Run { port } => run(port),
        Commands::Config => {
            let settings = Settings::load()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn run(port: Option<u16>) -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(run_async(port))
}

async fn run_async(port: Option<u16>) -> Result<()> {
    let mut settings = Settings::load()?;
    if let Some(port) = port {
        settings.plugin_port = port;
    }
    if settings.plugins.is_empty() {
        anyhow::bail!("no plugins configured; at least a main plugin is required");
    }

    let account = match Account::load() {
        Ok(account) => {
            log::info!("[Main] Account loaded for {}", account.mail);
            Some(account)
        }
        Err(_) => {
            log::info!("[Main] No account configured yet");
            None
        }
    };
    let users = UserStore::open(Settings::config_dir()?.join("users.json"))?;

    let bus_port = settings.plugin_port;
    let quit = CancellationToken::new();
    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    let router = MessageRouter::new(&settings.plugins, hub_tx, quit.clone());

    let api = Arc::new(HttpLiveApi::default());
    let hub = Hub::new(api, Arc::clone(&router), settings, account, users);

    router
        .start(bus_port)
        .await
        .map_err(|e| anyhow::anyhow!("starting plugin bus: {e}"))?;

    // Bridge the signal flag into the shared quit token.
    let signal_quit = quit.clone();
    let signal_watch = tokio::spawn(async move {
        while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
            if signal_quit.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        log::info!("[Main] Shutdown signal received");
        signal_quit.cancel();
    });

    let settings = hub.run(hub_rx, quit.clone()).await;
    quit.cancel();
    router.shutdown().await;
    if let Err(e) = signal_watch.await {
        log::warn!("[Main] Signal watcher panicked: {e}");
    }

    // Persist only after every task has joined.
    settings.save()?;
    log::info!("[Main] Settings saved, bye");
    Ok(())
}
