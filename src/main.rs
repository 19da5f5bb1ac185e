mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use flowrelay::stats::{DAILY_RETENTION_DAYS, DAY_FORMAT, local_day};
use flowrelay::store::{run_event_writer, run_metrics_flusher};
use flowrelay::{
    AppContext, DEFAULT_UPSTREAM, KeyManager, KeyRegistry, KeyStore, ProxyError, RefreshCollector,
    Settings, SettingsHandle, StatsAggregator,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Load-balancing proxy for OpenAI-compatible API keys")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy together with its refresh and persistence tasks.
    Serve(ServeArgs),
    /// Add keys from a file (or stdin with `-`) to the key database.
    Import(ImportArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Comma separated API keys to add on startup, or repeat the flag.
    #[arg(
        long,
        value_delimiter = ',',
        env = "FLOWRELAY_API_KEYS",
        hide_env_values = true
    )]
    keys: Option<Vec<String>>,

    /// Base URL of the OpenAI-compatible upstream.
    #[arg(long, env = "FLOWRELAY_UPSTREAM", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// SQLite database holding keys, request logs and daily totals.
    #[arg(long, env = "FLOWRELAY_DB_PATH", default_value = "flowrelay.db")]
    db_path: String,

    /// YAML settings file. Missing files fall back to defaults.
    #[arg(long, env = "FLOWRELAY_SETTINGS", default_value = "config/settings.yaml")]
    settings: PathBuf,

    #[arg(long, env = "FLOWRELAY_BIND", default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, env = "FLOWRELAY_PORT", default_value_t = 3016)]
    port: u16,
}

#[derive(Debug, Parser)]
struct ImportArgs {
    /// File with keys separated by newlines, commas or spaces.
    file: PathBuf,

    #[arg(long, env = "FLOWRELAY_DB_PATH", default_value = "flowrelay.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowrelay=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await,
        Command::Import(args) => run_import(args).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = SettingsHandle::from_file(&args.settings)?;
    let store = Arc::new(KeyStore::open(&args.db_path).await?);

    for secret in args.keys.unwrap_or_default() {
        match store.insert_key(&secret).await {
            Ok(key) => info!(key = %key.preview(), "api key added from environment"),
            Err(ProxyError::DuplicateKey | ProxyError::EmptyKey) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let registry = Arc::new(KeyRegistry::from_keys(store.load_keys().await?));
    let stats = Arc::new(StatsAggregator::new());
    let since = local_day(Utc::now() - Duration::days(DAILY_RETENTION_DAYS))
        .format(DAY_FORMAT)
        .to_string();
    stats.seed_daily(store.load_daily_stats(&since).await?);
    if registry.is_empty() {
        warn!("no api keys configured; proxy requests will fail until keys are added");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = AppContext::new(settings, registry, stats, &args.upstream)?.with_events(events_tx);

    let background = CancellationToken::new();
    let tasks = vec![
        tokio::spawn(RefreshCollector::new(ctx.clone()).run(background.child_token())),
        tokio::spawn(run_event_writer(
            store.clone(),
            events_rx,
            background.child_token(),
        )),
        tokio::spawn(run_metrics_flusher(
            store.clone(),
            ctx.clone(),
            background.child_token(),
        )),
    ];

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let state = Arc::new(server::AppState::new(ctx, store));
    let served = server::serve(addr, state, shutdown).await;

    background.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            error!(error = %err, "background task panicked");
        }
    }
    served
}

async fn run_import(args: ImportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let raw = if args.file.as_os_str() == "-" {
        tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin())).await??
    } else {
        tokio::fs::read_to_string(&args.file).await?
    };

    let store = Arc::new(KeyStore::open(&args.db_path).await?);
    let registry = Arc::new(KeyRegistry::from_keys(store.load_keys().await?));
    let ctx = AppContext::new(
        SettingsHandle::new(Settings::default()),
        registry,
        Arc::new(StatsAggregator::new()),
        DEFAULT_UPSTREAM,
    )?;
    let report = KeyManager::new(ctx, store).import_keys(&raw).await?;
    println!(
        "imported {} keys, skipped {} duplicates",
        report.added.len(),
        report.duplicates
    );
    Ok(())
}
