use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use stalker_proxy::catalog::CatalogService;
use stalker_proxy::config::{AppContext, ConfigStore};
use stalker_proxy::database::Database;
use stalker_proxy::epg::EpgService;
use stalker_proxy::jobs::{spawn_catalog_loop, spawn_epg_loop, JobManager};
use stalker_proxy::logging;
use stalker_proxy::matching::StationDirectory;
use stalker_proxy::portal::StalkerConnector;
use stalker_proxy::streaming::{SessionTable, StreamDispatcher};
use stalker_proxy::web::{AppState, WebServer};

#[derive(Parser)]
#[command(name = "stalker-proxy")]
#[command(version)]
#[command(about = "Stalker portal proxy: M3U playlists, XMLTV guides and FFmpeg-relayed streams")]
struct Cli {
    /// Configuration file path (overrides CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening IP address (overrides BIND_HOST)
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port (overrides PORT)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut context = AppContext::from_env();
    if let Some(config) = cli.config {
        context.config_path = config;
    }
    if let Some(host) = cli.host {
        context.bind_host = host;
    }
    if let Some(port) = cli.port {
        context.port = port;
    }

    let _log_guard =
        logging::init(&context.log_dir, &cli.log_level).context("initializing logging")?;
    info!("Starting stalker-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", context.data_dir.display());
    info!("Config file: {}", context.config_path.display());
    info!("Catalog database: {}", context.db_path.display());

    check_binary(&context.ffmpeg_path);
    check_binary(&context.ffprobe_path);

    let config = ConfigStore::load(&context.config_path).context("loading config.json")?;
    let database = Database::new(&context.db_path)
        .await
        .context("opening catalog database")?;
    database
        .migrate()
        .await
        .context("migrating catalog schema")?;
    info!("Catalog database ready");

    let settings = config.settings();
    let directory = if settings.station_directory.is_empty() {
        StationDirectory::empty(settings.match_threshold)
    } else {
        StationDirectory::load(
            std::path::Path::new(&settings.station_directory),
            settings.match_threshold,
        )
        .unwrap_or_else(|err| {
            warn!("Station directory unavailable: {err}");
            StationDirectory::empty(settings.match_threshold)
        })
    };

    let connector = Arc::new(StalkerConnector::new(context.timezone.clone()));
    let sessions = SessionTable::new();
    let catalog = Arc::new(CatalogService::new(
        database.clone(),
        config.clone(),
        connector.clone(),
        Arc::new(directory),
    ));
    let epg = Arc::new(EpgService::new(
        database.clone(),
        config.clone(),
        connector.clone(),
        context.epg_sources_dir(),
    ));
    let dispatcher = Arc::new(StreamDispatcher::new(
        config.clone(),
        database.clone(),
        connector.clone(),
        sessions.clone(),
        context.ffmpeg_path.clone(),
    ));

    let jobs = JobManager::new(catalog.clone(), epg.clone(), config.clone());
    jobs.start();
    spawn_catalog_loop(
        jobs.clone(),
        config.clone(),
        context.channel_refresh_interval,
    );
    spawn_epg_loop(jobs.clone(), config.clone(), context.epg_refresh_interval);
    info!("Background refresh loops started");

    if let Err(err) = epg.sync_sources().await {
        warn!("Initial EPG source sync failed: {err}");
    }

    let public_host = context
        .public_host
        .clone()
        .unwrap_or_else(|| format!("{}:{}", context.bind_host, context.port));
    info!("Public base URL: http://{public_host}");

    let state = AppState {
        config,
        context,
        database,
        sessions,
        dispatcher,
        catalog,
        epg,
        jobs,
        connector,
    };
    let server = WebServer::new(state).context("binding listener address")?;
    server.serve().await.context("serving HTTP")?;

    Ok(())
}

fn check_binary(path: &str) {
    match std::process::Command::new(path).arg("-version").output() {
        Ok(output) if output.status.success() => {
            info!("Found {path}");
        }
        _ => warn!("{path} not found or not executable; streaming will fail"),
    }
}
