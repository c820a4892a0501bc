//! EPG source manager
//!
//! Keeps the `epg_sources` table in step with configuration (one portal
//! source per EPG-fetching portal, plus the custom XMLTV URLs from
//! settings), and refreshes each source into its per-source programme DB.
//! Same-source refreshes collapse to a single in-flight run; different
//! sources run in parallel up to a global cap.

use anyhow::{anyhow, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub mod parser;
pub mod store;
pub mod xmltv;

use crate::config::ConfigStore;
use crate::database::Database;
use crate::errors::EpgError;
use crate::models::{
    ChannelRecord, EpgChannelRecord, EpgSourceRecord, EpgSourceType, ProgrammeRow,
};
use crate::portal::PortalConnector;
use store::ProgrammeStore;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
/// Concurrent source refreshes across the whole process
const GLOBAL_REFRESH_CAP: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct EpgStatus {
    pub is_refreshing: bool,
    pub last_refresh: Option<i64>,
    pub sources: Vec<EpgSourceRecord>,
}

pub struct EpgService {
    database: Database,
    config: ConfigStore,
    connector: Arc<dyn PortalConnector>,
    sources_dir: PathBuf,
    http: reqwest::Client,
    source_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refresh_slots: Arc<tokio::sync::Semaphore>,
    in_flight: AtomicUsize,
}

impl EpgService {
    pub fn new(
        database: Database,
        config: ConfigStore,
        connector: Arc<dyn PortalConnector>,
        sources_dir: PathBuf,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            database,
            config,
            connector,
            sources_dir,
            http,
            source_locks: Mutex::new(HashMap::new()),
            refresh_slots: Arc::new(tokio::sync::Semaphore::new(GLOBAL_REFRESH_CAP)),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Reconcile `epg_sources` rows with the configuration: every enabled
    /// portal with `fetch epg` is a portal-typed source keyed by its
    /// portal id; settings contribute the custom XMLTV sources.
    pub async fn sync_sources(&self) -> Result<Vec<EpgSourceRecord>> {
        let snapshot = self.config.snapshot();
        let interval = snapshot.settings.epg_refresh_interval;

        for (portal_id, portal) in &snapshot.portals {
            if !portal.enabled || !portal.fetch_epg {
                continue;
            }
            self.database
                .upsert_epg_source(&EpgSourceRecord {
                    source_id: portal_id.clone(),
                    name: portal.name.clone(),
                    url: portal.url.clone(),
                    source_type: EpgSourceType::Portal,
                    enabled: true,
                    interval_hours: interval,
                    last_fetch: None,
                    last_refresh: None,
                })
                .await?;
        }

        for source in &snapshot.settings.epg_custom_sources {
            if source.url.trim().is_empty() {
                continue;
            }
            let source_id = if source.id.is_empty() {
                // Stable id derived from the URL so re-saves do not spawn
                // duplicate programme DBs
                crate::catalog::channel_hash(&source.url, "", "", "", "", "")[..16].to_string()
            } else {
                source.id.clone()
            };
            self.database
                .upsert_epg_source(&EpgSourceRecord {
                    source_id,
                    name: if source.name.is_empty() {
                        source.url.clone()
                    } else {
                        source.name.clone()
                    },
                    url: source.url.clone(),
                    source_type: EpgSourceType::Custom,
                    enabled: source.enabled,
                    interval_hours: source.interval,
                    last_fetch: None,
                    last_refresh: None,
                })
                .await?;
        }

        self.database.list_epg_sources().await
    }

    pub async fn status(&self) -> Result<EpgStatus> {
        let sources = self.database.list_epg_sources().await?;
        let last_refresh = sources.iter().filter_map(|s| s.last_refresh).max();
        Ok(EpgStatus {
            is_refreshing: self.is_refreshing(),
            last_refresh,
            sources,
        })
    }

    /// Refresh every enabled source, optionally scoped to explicit ids.
    /// A scheduled sweep honours each source's `interval_hours`; an
    /// explicit id list bypasses the interval (never the per-source
    /// mutex). Per-source failures are logged and skipped; the sweep
    /// itself only fails when the source list cannot be read.
    pub async fn refresh_all(&self, only: Option<&[String]>) -> Result<usize> {
        let sources = self.sync_sources().await?;
        let now = Utc::now().timestamp();
        let mut refreshed = 0usize;
        for source in sources {
            if !source.enabled {
                continue;
            }
            match only {
                Some(ids) => {
                    if !ids.contains(&source.source_id) {
                        continue;
                    }
                }
                None => {
                    if let Some(last) = source.last_refresh {
                        if source.interval_hours > 0.0
                            && now - last < (source.interval_hours * 3600.0) as i64
                        {
                            continue;
                        }
                    }
                }
            }
            match self.refresh_source(&source).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    "EPG refresh failed for source '{}' ({}): {err}",
                    source.name, source.source_id
                ),
            }
        }
        Ok(refreshed)
    }

    /// Refresh one source. Returns false when another refresh of the same
    /// source was already in flight (the call collapses into it).
    pub async fn refresh_source(&self, source: &EpgSourceRecord) -> Result<bool> {
        let lock = self.source_lock(&source.source_id);
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(
                    "EPG source '{}' already refreshing, collapsing request",
                    source.source_id
                );
                return Ok(false);
            }
        };
        let _permit = self.refresh_slots.acquire().await?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let started = std::time::Instant::now();
        let result = match source.source_type {
            EpgSourceType::Custom => self.refresh_custom(source).await,
            EpgSourceType::Portal => self.refresh_portal_source(source).await,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(guard);

        let (channels, programmes, skipped) = result?;
        info!(
            "EPG source '{}' refreshed in {:?}: {} channels, {} programmes, {} skipped elements",
            source.name,
            started.elapsed(),
            channels,
            programmes,
            skipped
        );
        Ok(true)
    }

    async fn refresh_custom(&self, source: &EpgSourceRecord) -> Result<(usize, usize, usize)> {
        let content = self.download(&source.url).await?;
        self.database
            .mark_epg_fetch(&source.source_id, Utc::now().timestamp())
            .await?;

        let parsed = parser::parse_xmltv(&content, &source.source_id)
            .map_err(|e| anyhow!("source {}: {e}", source.source_id))?;
        if parsed.skipped > 0 {
            warn!(
                "EPG source '{}': skipped {} malformed elements",
                source.source_id, parsed.skipped
            );
        }

        self.database
            .replace_epg_channels(&source.source_id, &parsed.channels)
            .await?;

        let store = ProgrammeStore::open(&self.sources_dir, &source.source_id).await?;
        store.clear().await?;
        let inserted = store.insert_batch(&parsed.programmes).await?;
        let retention = self.config.settings().epg_retention_hours;
        let cutoff = Utc::now().timestamp() - (retention * 3600.0) as i64;
        store.delete_before(cutoff).await?;

        if !parsed.channels.is_empty() && inserted > 0 {
            self.database
                .mark_epg_refresh(&source.source_id, Utc::now().timestamp())
                .await?;
        }
        Ok((parsed.channels.len(), inserted, parsed.skipped))
    }

    async fn refresh_portal_source(
        &self,
        source: &EpgSourceRecord,
    ) -> Result<(usize, usize, usize)> {
        let portal_id = &source.source_id;
        let portal = self
            .config
            .portal(portal_id)
            .ok_or_else(|| anyhow!("portal {portal_id} vanished from config"))?;
        let settings = self.config.settings();

        let enabled: Vec<ChannelRecord> = self
            .database
            .list_enabled_channels()
            .await?
            .into_iter()
            .filter(|ch| &ch.portal_id == portal_id)
            .collect();
        if enabled.is_empty() {
            info!(
                "Portal '{}' has no enabled channels, storing empty guide",
                portal.name
            );
        }

        // First MAC that answers supplies the guide
        let mut epg = None;
        for mac in portal.macs.keys() {
            match self.connector.connect(&portal, mac).await {
                Ok(session) => match session.get_epg(settings.epg_future_hours as u32).await {
                    Ok(data) => {
                        epg = Some(data);
                        break;
                    }
                    Err(err) => warn!("EPG fetch via MAC {mac} failed: {err}"),
                },
                Err(err) => warn!("MAC {mac} unavailable for EPG fetch: {err}"),
            }
        }
        let epg =
            epg.ok_or_else(|| anyhow!("no MAC could fetch the guide for portal {portal_id}"))?;
        self.database
            .mark_epg_fetch(portal_id, Utc::now().timestamp())
            .await?;

        let now = Utc::now().timestamp();
        let past_cutoff = now - (settings.epg_past_hours * 3600.0) as i64;
        let future_cutoff = now + (settings.epg_future_hours * 3600.0) as i64;

        let mut channel_rows: Vec<EpgChannelRecord> = Vec::new();
        let mut programme_rows: Vec<ProgrammeRow> = Vec::new();
        let mut skipped = 0usize;

        for channel in &enabled {
            let epg_id = channel.effective_epg_id().to_string();
            if epg_id.is_empty() {
                continue;
            }
            channel_rows.push(EpgChannelRecord {
                source_id: portal_id.clone(),
                channel_id: epg_id.clone(),
                display_name: channel.effective_display_name().to_string(),
                icon: channel.logo.clone(),
                lcn: channel.effective_number().to_string(),
                names: vec![channel.effective_display_name().to_string()],
            });

            let mut ids = vec![channel.channel_id.clone()];
            ids.extend(channel.alternate_ids.iter().cloned());
            let programmes = ids.iter().find_map(|id| epg.get(id));
            let Some(programmes) = programmes else {
                continue;
            };

            for programme in programmes {
                let Some(start_ts) = parse_epoch(programme.start_timestamp.as_deref()) else {
                    skipped += 1;
                    continue;
                };
                let Some(stop_ts) = parse_epoch(programme.stop_timestamp.as_deref()) else {
                    skipped += 1;
                    continue;
                };
                if stop_ts < past_cutoff || start_ts > future_cutoff {
                    continue;
                }
                programme_rows.push(ProgrammeRow {
                    channel_id: epg_id.clone(),
                    start: parser::format_xmltv_time(start_ts),
                    stop: parser::format_xmltv_time(stop_ts),
                    start_ts,
                    stop_ts,
                    title: programme.name.clone().unwrap_or_default(),
                    description: programme.descr.clone().unwrap_or_default(),
                    categories: programme.category.clone().unwrap_or_default(),
                    ..Default::default()
                });
            }
        }

        self.database
            .replace_epg_channels(portal_id, &channel_rows)
            .await?;
        let store = ProgrammeStore::open(&self.sources_dir, portal_id).await?;
        store.clear().await?;
        let inserted = store.insert_batch(&programme_rows).await?;

        if !channel_rows.is_empty() && inserted > 0 {
            self.database
                .mark_epg_refresh(portal_id, Utc::now().timestamp())
                .await?;
        }
        Ok((channel_rows.len(), inserted, skipped))
    }

    /// GET with redirects; gunzip by content-type or magic bytes.
    async fn download(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EpgError::Download {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(EpgError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            }
            .into());
        }

        let gzip_by_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        let bytes = response.bytes().await.map_err(|e| EpgError::Download {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let text = if gzip_by_type || bytes.starts_with(&[0x1f, 0x8b]) {
            let mut decoder = GzDecoder::new(bytes.as_ref());
            let mut out = String::new();
            decoder
                .read_to_string(&mut out)
                .map_err(|e| EpgError::Download {
                    url: url.to_string(),
                    message: format!("gzip decode: {e}"),
                })?;
            out
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        Ok(text)
    }

    fn source_lock(&self, source_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.source_locks.lock().expect("source lock map poisoned");
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn sources_dir(&self) -> &PathBuf {
        &self.sources_dir
    }
}

/// Portal timestamps arrive as seconds or milliseconds, as strings or
/// numbers; normalize to seconds.
fn parse_epoch(value: Option<&str>) -> Option<i64> {
    let ts: i64 = value?.trim().parse().ok()?;
    if ts > 100_000_000_000 {
        Some(ts / 1000)
    } else {
        Some(ts)
    }
}
