//! Incremental catalog refresh
//!
//! Reconciles the channel store against the live portal inventory: per-MAC
//! availability, content-hash change detection, duplicate-name merging,
//! soft-delete with TTL, and stats recomputation — all committed in a
//! single transaction per portal, serialized by the portal write lock.

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{ConfigStore, PortalConfig};
use crate::database::channels as channel_queries;
use crate::database::Database;
use crate::matching::StationDirectory;
use crate::models::{ChannelRecord, MacCandidate, RawChannel, RefreshStats};
use crate::portal::{PortalConnector, PortalSession};
use crate::scheduler::{select_macs, ScoreWeights};
use crate::tags::{self, TagRules};

/// Whole-listing budget per MAC during refresh
const MAC_LISTING_TIMEOUT: Duration = Duration::from_secs(60);

struct FetchedChannel {
    raw: RawChannel,
    available_macs: Vec<String>,
    alternate_ids: Vec<String>,
}

pub struct CatalogService {
    database: Database,
    config: ConfigStore,
    connector: Arc<dyn PortalConnector>,
    directory: Arc<StationDirectory>,
}

impl CatalogService {
    pub fn new(
        database: Database,
        config: ConfigStore,
        connector: Arc<dyn PortalConnector>,
        directory: Arc<StationDirectory>,
    ) -> Self {
        Self {
            database,
            config,
            connector,
            directory,
        }
    }

    /// Refresh one portal. Holds the portal write lock for the duration;
    /// a concurrent call for the same portal waits (callers coalesce at
    /// the job queue instead of stacking up here).
    pub async fn refresh_portal(&self, portal_id: &str) -> Result<RefreshStats> {
        let portal = self
            .config
            .portal(portal_id)
            .ok_or_else(|| anyhow!("unknown portal {portal_id}"))?;
        if !portal.enabled {
            return Err(anyhow!("portal {portal_id} is disabled"));
        }

        let lock = self.database.portal_lock(portal_id);
        let _guard = lock.lock().await;

        info!("Refreshing portal '{}' ({portal_id})", portal.name);
        let mut stats = RefreshStats::default();

        // Reference ordering over all non-expired MACs; the first MAC that
        // answers supplies genres.
        let today = Utc::now().date_naive();
        let candidates: Vec<MacCandidate> = portal
            .macs
            .iter()
            .map(|(mac, account)| MacCandidate {
                mac: mac.clone(),
                watchdog_timeout: account.watchdog_timeout,
                playback_limit: account.playback_limit,
                expiry: account.expiry_date(),
            })
            .collect();
        let mac_order = select_macs(
            &candidates,
            &HashMap::new(),
            portal.streams_per_mac,
            ScoreWeights::default(),
            today,
        );
        if mac_order.is_empty() {
            return Err(anyhow!(
                "portal {portal_id} has no usable (non-expired) MACs"
            ));
        }

        // Per-MAC listings: availability union + first-seen channel data.
        let mut channels_by_id: BTreeMap<String, FetchedChannel> = BTreeMap::new();
        let mut genres: HashMap<String, String> = HashMap::new();
        let mut succeeded_macs = 0usize;

        for mac in &mac_order {
            match self.fetch_mac_listing(portal_id, &portal, mac).await {
                Ok((mac_channels, mac_genres)) => {
                    succeeded_macs += 1;
                    if genres.is_empty() {
                        genres = mac_genres;
                    }
                    for raw in mac_channels {
                        let has_cmd = raw
                            .cmd
                            .as_deref()
                            .map(|cmd| !cmd.trim().is_empty())
                            .unwrap_or(false);
                        let entry = channels_by_id.entry(raw.id.clone()).or_insert_with(|| {
                            FetchedChannel {
                                raw,
                                available_macs: Vec::new(),
                                alternate_ids: Vec::new(),
                            }
                        });
                        if has_cmd && !entry.available_macs.contains(mac) {
                            entry.available_macs.push(mac.clone());
                        }
                    }
                }
                Err(err) => {
                    stats.macs_failed += 1;
                    warn!(
                        "Skipping MAC {mac} for portal '{}': whole listing failed: {err}",
                        portal.name
                    );
                }
            }
        }

        if succeeded_macs == 0 {
            return Err(anyhow!(
                "portal {portal_id}: every MAC listing failed, keeping catalog untouched"
            ));
        }

        stats.channels_seen = channels_by_id.len();
        let merged = merge_duplicate_names(channels_by_id);
        stats.merged = merged.values().map(|entry| entry.alternate_ids.len()).sum();

        self.reconcile(portal_id, &portal, merged, genres, &mut stats)
            .await?;

        info!(
            "Refresh of portal '{}' done: {} seen, {} imported, {} updated, {} skipped, {} merged, {} soft-deleted, {} hard-deleted",
            portal.name,
            stats.channels_seen,
            stats.imported,
            stats.updated,
            stats.skipped,
            stats.merged,
            stats.soft_deleted,
            stats.hard_deleted,
        );
        Ok(stats)
    }

    async fn fetch_mac_listing(
        &self,
        portal_id: &str,
        portal: &PortalConfig,
        mac: &str,
    ) -> Result<(Vec<RawChannel>, HashMap<String, String>)> {
        let session = self.connector.connect(portal, mac).await?;
        self.update_mac_record(portal_id, mac, session.as_ref())
            .await;

        let channels = tokio::time::timeout(MAC_LISTING_TIMEOUT, session.get_all_channels())
            .await
            .map_err(|_| anyhow!("listing timed out after {MAC_LISTING_TIMEOUT:?}"))??;

        let genres = match session.get_genres().await {
            Ok(list) => list
                .into_iter()
                .map(|genre| (genre.id, genre.title))
                .collect(),
            Err(err) => {
                warn!("Genre listing failed for MAC {mac}: {err}");
                HashMap::new()
            }
        };
        Ok((channels, genres))
    }

    /// Opportunistic profile/expiry refresh on token acquisition;
    /// best-effort, failures only logged.
    async fn update_mac_record(&self, portal_id: &str, mac: &str, session: &dyn PortalSession) {
        let profile = match session.get_profile().await {
            Ok(profile) => profile,
            Err(err) => {
                warn!("Profile fetch failed for MAC {mac}: {err}");
                return;
            }
        };
        let expiry = session.get_expiry().await.unwrap_or(None);
        let now = Utc::now().timestamp();
        self.config.update_mac(portal_id, mac, |account| {
            let watchdog = profile.watchdog_timeout_seconds();
            if watchdog > 0 {
                account.watchdog_timeout = watchdog;
            }
            let limit = profile.playback_limit_value();
            if limit > 0 {
                account.playback_limit = limit;
            }
            if let Some(date) = expiry {
                account.expiry = Some(date.format("%Y-%m-%d").to_string());
            }
            account.last_profile_fetch = Some(now);
        });
    }

    /// Explicit per-MAC profile + expiry refresh (admin action).
    pub async fn refresh_mac_profiles(&self, portal_id: &str) -> Result<usize> {
        let portal = self
            .config
            .portal(portal_id)
            .ok_or_else(|| anyhow!("unknown portal {portal_id}"))?;
        let mut updated = 0usize;
        for mac in portal.macs.keys() {
            match self.connector.connect(&portal, mac).await {
                Ok(session) => {
                    self.update_mac_record(portal_id, mac, session.as_ref())
                        .await;
                    updated += 1;
                }
                Err(err) => warn!("MAC {mac} profile refresh failed: {err}"),
            }
        }
        Ok(updated)
    }

    async fn reconcile(
        &self,
        portal_id: &str,
        portal: &PortalConfig,
        merged: BTreeMap<String, FetchedChannel>,
        genres: HashMap<String, String>,
        stats: &mut RefreshStats,
    ) -> Result<()> {
        let settings = self.config.settings();
        let rules = TagRules::from_settings(&settings);
        let existing_hashes = self.database.channel_hashes(portal_id).await?;
        let existing_ids = self.database.channel_ids(portal_id).await?;

        let mut tx = self.database.pool().begin().await?;

        // Groups before channels so every channels.genre_id has a row.
        let mut genre_counts: HashMap<String, i64> = HashMap::new();
        for entry in merged.values() {
            let genre_id = entry.raw.tv_genre_id.clone().unwrap_or_default();
            if !genre_id.is_empty() {
                *genre_counts.entry(genre_id).or_insert(0) += 1;
            }
        }
        for (genre_id, count) in &genre_counts {
            let name = genres.get(genre_id).cloned().unwrap_or_default();
            channel_queries::upsert_group(&mut tx, portal_id, genre_id, &name, *count).await?;
        }
        if !portal.selected_genres.is_empty() {
            channel_queries::set_groups_active(&mut tx, portal_id, &portal.selected_genres).await?;
        }

        let mut present: HashSet<String> = HashSet::new();
        let mut deleted_alternates: Vec<String> = Vec::new();

        for (channel_id, entry) in &merged {
            present.insert(channel_id.clone());
            deleted_alternates.extend(entry.alternate_ids.iter().cloned());

            let raw = &entry.raw;
            let genre_id = raw.tv_genre_id.clone().unwrap_or_default();
            let genre = genres.get(&genre_id).cloned().unwrap_or_default();
            let number = raw.number.clone().unwrap_or_default();
            let logo = raw.logo.clone().unwrap_or_default();
            let cmd = raw.cmd.clone().unwrap_or_default();

            let hash = channel_hash(&raw.name, &number, &genre, &genre_id, &logo, &cmd);
            let mut available = entry.available_macs.clone();
            available.sort();
            let mut alternates = entry.alternate_ids.clone();
            alternates.sort();

            if existing_hashes.get(channel_id).map(String::as_str) == Some(hash.as_str()) {
                // Content unchanged: tag extraction and matching are
                // skipped entirely; only presence data moves.
                channel_queries::update_channel_presence(
                    &mut tx,
                    portal_id,
                    channel_id,
                    &available,
                    &alternates,
                )
                .await?;
                stats.skipped += 1;
                continue;
            }

            let extract = tags::extract(&raw.name, &rules);
            let auto_name = if portal.auto_normalize_names && !extract.is_header {
                extract.clean_name.clone()
            } else {
                String::new()
            };

            let matched = if portal.auto_match && !extract.is_header && !self.directory.is_empty() {
                self.directory.match_name(&raw.name, &extract.country)
            } else {
                None
            };

            let record = ChannelRecord {
                portal_id: portal_id.to_string(),
                channel_id: channel_id.clone(),
                name: raw.name.clone(),
                number,
                genre,
                genre_id,
                logo,
                cmd,
                auto_name,
                resolution: extract.resolution.clone(),
                video_codec: extract.video_codec.clone(),
                country: extract.country.clone(),
                audio_tags: extract.audio_tags.join(","),
                event_tags: extract.event_tags.join(","),
                misc_tags: extract.misc_tags.join(","),
                matched_name: matched.as_ref().map(|m| m.name.clone()).unwrap_or_default(),
                matched_source: matched
                    .as_ref()
                    .map(|m| m.source.clone())
                    .unwrap_or_default(),
                matched_station_id: matched
                    .as_ref()
                    .map(|m| m.station_id.clone())
                    .unwrap_or_default(),
                matched_call_sign: matched
                    .as_ref()
                    .map(|m| m.call_sign.clone())
                    .unwrap_or_default(),
                matched_logo: matched.as_ref().map(|m| m.logo.clone()).unwrap_or_default(),
                matched_score: matched.as_ref().map(|m| m.score),
                is_header: extract.is_header,
                is_event: extract.is_event,
                is_raw: extract.is_raw,
                enabled: false,
                available_macs: available,
                alternate_ids: alternates,
                channel_hash: hash,
                ..Default::default()
            };

            let existed = existing_hashes.contains_key(channel_id);
            channel_queries::upsert_channel(&mut tx, &record).await?;
            channel_queries::sync_channel_tags(
                &mut tx,
                portal_id,
                channel_id,
                &extract.event_tags,
                &extract.misc_tags,
            )
            .await?;
            if existed {
                stats.updated += 1;
            } else {
                stats.imported += 1;
            }
        }

        // Merged-away ids lose their own rows (the winner carries them in
        // alternate_ids).
        deleted_alternates.retain(|id| !present.contains(id));
        channel_queries::delete_channels(&mut tx, portal_id, &deleted_alternates).await?;

        // Rows absent from every non-failing MAC listing: soft-delete.
        let missing: Vec<String> = existing_ids
            .iter()
            .filter(|id| !present.contains(*id) && !deleted_alternates.contains(*id))
            .cloned()
            .collect();
        stats.soft_deleted =
            channel_queries::mark_channels_missing(&mut tx, portal_id, &missing, Utc::now())
                .await?;

        let cutoff = Utc::now()
            - ChronoDuration::seconds((settings.channel_retention_hours * 3600.0) as i64);
        stats.hard_deleted =
            channel_queries::hard_delete_missing(&mut tx, portal_id, cutoff).await?;

        channel_queries::recompute_stats(&mut tx, portal_id, &portal.name).await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Content fingerprint over the raw portal fields; availability and
/// derived data deliberately stay out so they cannot force re-extraction.
pub fn channel_hash(
    name: &str,
    number: &str,
    genre: &str,
    genre_id: &str,
    logo: &str,
    cmd: &str,
) -> String {
    let mut hasher = Sha256::new();
    for field in [name, number, genre, genre_id, logo, cmd] {
        hasher.update(field.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Channels sharing a display name collapse into one row: the lowest
/// numeric id wins, the rest become alternates and their MACs union in.
fn merge_duplicate_names(
    channels_by_id: BTreeMap<String, FetchedChannel>,
) -> BTreeMap<String, FetchedChannel> {
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for (id, entry) in &channels_by_id {
        by_name
            .entry(entry.raw.name.trim().to_string())
            .or_default()
            .push(id.clone());
    }

    let mut source = channels_by_id;
    let mut merged: BTreeMap<String, FetchedChannel> = BTreeMap::new();
    let mut names: Vec<&String> = by_name.keys().collect();
    names.sort();

    for name in names {
        let mut ids = by_name.get(name).cloned().unwrap_or_default();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

        let primary_id = ids[0].clone();
        let mut primary = source.remove(&primary_id).expect("primary channel present");
        for alternate_id in &ids[1..] {
            if let Some(alternate) = source.remove(alternate_id) {
                primary.alternate_ids.push(alternate_id.clone());
                for mac in alternate.available_macs {
                    if !primary.available_macs.contains(&mac) {
                        primary.available_macs.push(mac);
                    }
                }
            }
        }
        merged.insert(primary_id, primary);
    }

    merged
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::errors::PortalError;
    use crate::models::{MacProfile, RawEpg, RawGenre};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted portal backend shared across connector instances:
    /// per-MAC channel listings plus call counters.
    #[derive(Default)]
    pub struct StubPortal {
        pub channels: Mutex<HashMap<String, Vec<RawChannel>>>,
        pub failing_macs: Mutex<HashSet<String>>,
        pub genres: Mutex<Vec<RawGenre>>,
        /// (mac, cmd) → resolved link; absent means the portal answers
        /// with its no-link sentinel
        pub links: Mutex<HashMap<(String, String), String>>,
        pub listing_calls: Mutex<usize>,
        pub link_calls: Mutex<usize>,
    }

    impl StubPortal {
        pub fn set_channels(&self, mac: &str, channels: Vec<RawChannel>) {
            self.channels
                .lock()
                .unwrap()
                .insert(mac.to_string(), channels);
        }

        pub fn set_link(&self, mac: &str, cmd: &str, link: &str) {
            self.links
                .lock()
                .unwrap()
                .insert((mac.to_string(), cmd.to_string()), link.to_string());
        }

        pub fn fail_mac(&self, mac: &str) {
            self.failing_macs.lock().unwrap().insert(mac.to_string());
        }

        pub fn listing_calls(&self) -> usize {
            *self.listing_calls.lock().unwrap()
        }

        pub fn link_calls(&self) -> usize {
            *self.link_calls.lock().unwrap()
        }
    }

    pub struct StubConnector(pub Arc<StubPortal>);

    struct StubSession {
        portal: Arc<StubPortal>,
        mac: String,
    }

    #[async_trait]
    impl PortalConnector for StubConnector {
        async fn connect(
            &self,
            _portal: &PortalConfig,
            mac: &str,
        ) -> Result<Box<dyn PortalSession>, PortalError> {
            if self.0.failing_macs.lock().unwrap().contains(mac) {
                return Err(PortalError::Unreachable(format!("stub: {mac} is down")));
            }
            Ok(Box::new(StubSession {
                portal: self.0.clone(),
                mac: mac.to_string(),
            }))
        }
    }

    #[async_trait]
    impl PortalSession for StubSession {
        fn mac(&self) -> &str {
            &self.mac
        }

        async fn get_profile(&self) -> Result<MacProfile, PortalError> {
            Ok(MacProfile::default())
        }

        async fn get_expiry(&self) -> Result<Option<chrono::NaiveDate>, PortalError> {
            Ok(None)
        }

        async fn get_all_channels(&self) -> Result<Vec<RawChannel>, PortalError> {
            *self.portal.listing_calls.lock().unwrap() += 1;
            if self.portal.failing_macs.lock().unwrap().contains(&self.mac) {
                return Err(PortalError::Unreachable("stub listing failure".into()));
            }
            Ok(self
                .portal
                .channels
                .lock()
                .unwrap()
                .get(&self.mac)
                .cloned()
                .unwrap_or_default())
        }

        async fn get_genres(&self) -> Result<Vec<RawGenre>, PortalError> {
            Ok(self.portal.genres.lock().unwrap().clone())
        }

        async fn get_link(&self, cmd: &str) -> Result<String, PortalError> {
            *self.portal.link_calls.lock().unwrap() += 1;
            let key = (self.mac.clone(), cmd.to_string());
            match self.portal.links.lock().unwrap().get(&key) {
                Some(link) if !link.is_empty() => Ok(link.clone()),
                _ => Err(PortalError::NoLink),
            }
        }

        async fn get_epg(&self, _period_hours: u32) -> Result<RawEpg, PortalError> {
            Ok(RawEpg::new())
        }
    }

    pub fn raw_channel(id: &str, name: &str, cmd: &str) -> RawChannel {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "number": id,
            "tv_genre_id": "1",
            "logo": "",
            "cmd": cmd,
        }))
        .unwrap()
    }

    pub fn test_config(portal_id: &str, macs: &[&str]) -> ConfigStore {
        let mut portal = PortalConfig::default();
        portal.name = "Test Portal".into();
        portal.url = "http://portal.test/c/".into();
        for mac in macs {
            portal.macs.insert(mac.to_string(), Default::default());
        }
        let mut file = crate::config::ConfigFile::default();
        file.portals.insert(portal_id.to_string(), portal);
        ConfigStore::ephemeral(file)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::database::test_database;

    async fn service(config: ConfigStore, portal: Arc<StubPortal>) -> (CatalogService, Database) {
        let database = test_database().await;
        let service = CatalogService::new(
            database.clone(),
            config,
            Arc::new(StubConnector(portal)),
            Arc::new(StationDirectory::empty(0.65)),
        );
        (service, database)
    }

    #[tokio::test]
    async fn refresh_is_idempotent_and_hash_skips() {
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![
                raw_channel("1", "BBC One FHD", "ffmpeg http://localhost/ch/1"),
                raw_channel("2", "BBC Two HD", "ffmpeg http://localhost/ch/2"),
            ],
        );
        let config = test_config("p1", &["00:1A:79:AA"]);
        let (service, database) = service(config, portal).await;

        let first = service.refresh_portal("p1").await.unwrap();
        assert_eq!(first.imported, 2);
        assert_eq!(first.skipped, 0);
        let hashes_before = database.channel_hashes("p1").await.unwrap();

        let second = service.refresh_portal("p1").await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2, "unchanged hashes skip re-extraction");
        assert_eq!(second.soft_deleted, 0);

        let hashes_after = database.channel_hashes("p1").await.unwrap();
        assert_eq!(hashes_before, hashes_after);

        let row = database.get_channel("p1", "1").await.unwrap().unwrap();
        assert_eq!(row.available_macs, vec!["00:1A:79:AA".to_string()]);
    }

    #[tokio::test]
    async fn failing_mac_keeps_catalog_intact() {
        // A MAC whose whole listing fails is skipped: the other MAC
        // keeps its availability and nothing gets soft-deleted.
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1")],
        );
        portal.set_channels(
            "00:1A:79:BB",
            vec![raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1")],
        );
        let config = test_config("p1", &["00:1A:79:AA", "00:1A:79:BB"]);
        let (service, database) = service(config, portal.clone()).await;

        let first = service.refresh_portal("p1").await.unwrap();
        assert_eq!(first.macs_failed, 0);
        let row = database.get_channel("p1", "1").await.unwrap().unwrap();
        assert_eq!(row.available_macs.len(), 2);

        portal.fail_mac("00:1A:79:BB");
        let second = service.refresh_portal("p1").await.unwrap();
        assert_eq!(second.macs_failed, 1);
        assert_eq!(second.soft_deleted, 0);

        let row = database.get_channel("p1", "1").await.unwrap().unwrap();
        assert!(row.available_macs.contains(&"00:1A:79:AA".to_string()));
        assert!(row.missing_since.is_none());
    }

    #[tokio::test]
    async fn all_macs_failing_aborts_refresh() {
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1")],
        );
        let config = test_config("p1", &["00:1A:79:AA"]);
        let (service, database) = service(config, portal.clone()).await;
        service.refresh_portal("p1").await.unwrap();

        portal.fail_mac("00:1A:79:AA");
        assert!(service.refresh_portal("p1").await.is_err());
        // Catalog untouched
        let row = database.get_channel("p1", "1").await.unwrap().unwrap();
        assert!(row.missing_since.is_none());
    }

    #[tokio::test]
    async fn vanished_channel_soft_deletes_then_restores() {
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![
                raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1"),
                raw_channel("2", "BBC Two", "ffmpeg http://localhost/ch/2"),
            ],
        );
        let config = test_config("p1", &["00:1A:79:AA"]);
        let (service, database) = service(config, portal.clone()).await;
        service.refresh_portal("p1").await.unwrap();
        database.set_channel_enabled("p1", "2", true).await.unwrap();

        // Channel 2 vanishes
        portal.set_channels(
            "00:1A:79:AA",
            vec![raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1")],
        );
        let stats = service.refresh_portal("p1").await.unwrap();
        assert_eq!(stats.soft_deleted, 1);
        let row = database.get_channel("p1", "2").await.unwrap().unwrap();
        assert!(!row.enabled);
        assert!(row.missing_since.is_some());

        // ...and reappears with its prior enabled state
        portal.set_channels(
            "00:1A:79:AA",
            vec![
                raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1"),
                raw_channel("2", "BBC Two", "ffmpeg http://localhost/ch/2"),
            ],
        );
        service.refresh_portal("p1").await.unwrap();
        let row = database.get_channel("p1", "2").await.unwrap().unwrap();
        assert!(row.enabled, "prior enabled state restored");
        assert!(row.missing_since.is_none());
    }

    #[tokio::test]
    async fn duplicate_names_merge_into_lowest_id() {
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![raw_channel(
                "7",
                "Sky Sports",
                "ffmpeg http://localhost/ch/7",
            )],
        );
        portal.set_channels(
            "00:1A:79:BB",
            vec![raw_channel(
                "12",
                "Sky Sports",
                "ffmpeg http://localhost/ch/12",
            )],
        );
        let config = test_config("p1", &["00:1A:79:AA", "00:1A:79:BB"]);
        let (service, database) = service(config, portal).await;

        let stats = service.refresh_portal("p1").await.unwrap();
        assert_eq!(stats.merged, 1);

        let primary = database.get_channel("p1", "7").await.unwrap().unwrap();
        assert_eq!(primary.alternate_ids, vec!["12".to_string()]);
        assert_eq!(primary.available_macs.len(), 2);
        // Invariant: merged-away id has no row of its own
        assert!(database.get_channel("p1", "12").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_cmd_drops_mac_from_channel_only() {
        let portal = Arc::new(StubPortal::default());
        portal.set_channels(
            "00:1A:79:AA",
            vec![
                raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1"),
                raw_channel("2", "BBC Two", ""),
            ],
        );
        portal.set_channels(
            "00:1A:79:BB",
            vec![
                raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1"),
                raw_channel("2", "BBC Two", "ffmpeg http://localhost/ch/2"),
            ],
        );
        let config = test_config("p1", &["00:1A:79:AA", "00:1A:79:BB"]);
        let (service, database) = service(config, portal).await;
        service.refresh_portal("p1").await.unwrap();

        let one = database.get_channel("p1", "1").await.unwrap().unwrap();
        assert_eq!(one.available_macs.len(), 2);
        let two = database.get_channel("p1", "2").await.unwrap().unwrap();
        assert_eq!(two.available_macs, vec!["00:1A:79:BB".to_string()]);
        assert!(two.missing_since.is_none(), "not soft-deleted");
    }

    #[test]
    fn hash_covers_raw_fields_only() {
        let a = channel_hash("BBC One", "1", "News", "5", "logo.png", "cmd");
        let b = channel_hash("BBC One", "1", "News", "5", "logo.png", "cmd");
        assert_eq!(a, b);
        let c = channel_hash("BBC One", "1", "News", "5", "logo.png", "cmd2");
        assert_ne!(a, c);
    }
}
