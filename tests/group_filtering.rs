//! End-to-end visibility tests: group toggles change what the playlist
//! and guide emit without touching the portal, and emissions are stable
//! over an unchanged catalog snapshot.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stalker_proxy::catalog::CatalogService;
use stalker_proxy::config::{ConfigFile, ConfigStore, PortalConfig};
use stalker_proxy::database::channels::set_groups_active;
use stalker_proxy::database::Database;
use stalker_proxy::epg::xmltv::emit_to_string;
use stalker_proxy::errors::PortalError;
use stalker_proxy::matching::StationDirectory;
use stalker_proxy::models::{MacProfile, RawChannel, RawEpg, RawGenre};
use stalker_proxy::playlist::generate_playlist;
use stalker_proxy::portal::{PortalConnector, PortalSession};

const MAC: &str = "00:1A:79:AA:BB:CC";

/// Counts every portal round-trip so tests can assert "no re-import".
#[derive(Default)]
struct CountingPortal {
    channels: Mutex<Vec<RawChannel>>,
    calls: Mutex<usize>,
}

struct CountingConnector(Arc<CountingPortal>);

struct CountingSession {
    portal: Arc<CountingPortal>,
    mac: String,
}

#[async_trait]
impl PortalConnector for CountingConnector {
    async fn connect(
        &self,
        _portal: &PortalConfig,
        mac: &str,
    ) -> Result<Box<dyn PortalSession>, PortalError> {
        Ok(Box::new(CountingSession {
            portal: self.0.clone(),
            mac: mac.to_string(),
        }))
    }
}

#[async_trait]
impl PortalSession for CountingSession {
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
        *self.portal.calls.lock().unwrap() += 1;
        Ok(self.portal.channels.lock().unwrap().clone())
    }

    async fn get_genres(&self) -> Result<Vec<RawGenre>, PortalError> {
        Ok(vec![
            serde_json::from_value(serde_json::json!({"id": "G", "title": "Sports"})).unwrap(),
            serde_json::from_value(serde_json::json!({"id": "H", "title": "News"})).unwrap(),
        ])
    }

    async fn get_link(&self, _cmd: &str) -> Result<String, PortalError> {
        Err(PortalError::NoLink)
    }

    async fn get_epg(&self, _period_hours: u32) -> Result<RawEpg, PortalError> {
        Ok(RawEpg::new())
    }
}

fn raw(id: &str, name: &str, genre: &str) -> RawChannel {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": name,
        "number": id,
        "tv_genre_id": genre,
        "cmd": format!("ffmpeg http://localhost/ch/{id}"),
    }))
    .unwrap()
}

fn config() -> ConfigStore {
    let mut portal = PortalConfig::default();
    portal.name = "Portal One".into();
    portal.url = "http://portal.test/c/".into();
    portal.macs.insert(MAC.to_string(), Default::default());
    let mut file = ConfigFile::default();
    file.portals.insert("p1".to_string(), portal);
    ConfigStore::ephemeral(file)
}

async fn seeded() -> (CatalogService, Database, ConfigStore, Arc<CountingPortal>) {
    let database = Database::connect("sqlite::memory:").await.unwrap();
    database.migrate().await.unwrap();
    let portal = Arc::new(CountingPortal::default());
    *portal.channels.lock().unwrap() = vec![
        raw("1", "Sky Sports Main Event", "G"),
        raw("2", "BBC News", "H"),
    ];
    let config = config();
    let catalog = CatalogService::new(
        database.clone(),
        config.clone(),
        Arc::new(CountingConnector(portal.clone())),
        Arc::new(StationDirectory::empty(0.65)),
    );
    catalog.refresh_portal("p1").await.unwrap();

    // Operator enables both channels
    sqlx::query("UPDATE channels SET enabled = 1")
        .execute(database.pool())
        .await
        .unwrap();

    (catalog, database, config, portal)
}

#[tokio::test]
async fn group_toggle_hides_channels_without_reimport() {
    let (_catalog, database, config, portal) = seeded().await;
    let calls_after_refresh = *portal.calls.lock().unwrap();

    let before = generate_playlist(&database, "proxy:8001").await.unwrap();
    assert!(before.contains("Sky Sports Main Event"));
    assert!(before.contains("BBC News"));

    // Deactivate group G: only H stays visible
    {
        let mut conn = database.pool().acquire().await.unwrap();
        set_groups_active(&mut conn, "p1", &["H".into()])
            .await
            .unwrap();
    }

    let after = generate_playlist(&database, "proxy:8001").await.unwrap();
    assert!(!after.contains("Sky Sports Main Event"));
    assert!(after.contains("BBC News"));

    let dir = tempfile::tempdir().unwrap();
    let guide = emit_to_string(database.clone(), config, dir.path().to_path_buf())
        .await
        .unwrap();
    assert!(!guide.contains("Sky Sports Main Event"));
    assert!(guide.contains("BBC News"));

    // The whole visibility change happened without one portal call
    assert_eq!(
        *portal.calls.lock().unwrap(),
        calls_after_refresh,
        "group toggling must not trigger a re-import"
    );
}

#[tokio::test]
async fn playlist_is_byte_identical_on_same_snapshot() {
    let (_catalog, database, _config, _portal) = seeded().await;
    let first = generate_playlist(&database, "proxy:8001").await.unwrap();
    let second = generate_playlist(&database, "proxy:8001").await.unwrap();
    assert_eq!(first, second);
    assert!(first.starts_with("#EXTM3U\n"));
    assert!(first.contains("http://proxy:8001/play/p1/1"));
}

#[tokio::test]
async fn empty_group_selection_shows_everything() {
    let (_catalog, database, _config, _portal) = seeded().await;
    {
        let mut conn = database.pool().acquire().await.unwrap();
        set_groups_active(&mut conn, "p1", &[]).await.unwrap();
    }
    let playlist = generate_playlist(&database, "proxy:8001").await.unwrap();
    assert!(playlist.contains("Sky Sports Main Event"));
    assert!(playlist.contains("BBC News"));
}

#[tokio::test]
async fn refresh_records_mac_availability_for_scheduler() {
    let (_catalog, database, config, _portal) = seeded().await;
    let channel = database.get_channel("p1", "1").await.unwrap().unwrap();
    let portal = config.portal("p1").unwrap();
    let candidates: Vec<stalker_proxy::models::MacCandidate> = portal
        .macs
        .iter()
        .map(|(mac, account)| stalker_proxy::models::MacCandidate {
            mac: mac.clone(),
            watchdog_timeout: account.watchdog_timeout,
            playback_limit: account.playback_limit,
            expiry: account.expiry_date(),
        })
        .collect();
    let order = stalker_proxy::scheduler::select_macs(
        &candidates,
        &HashMap::new(),
        portal.streams_per_mac,
        stalker_proxy::scheduler::ScoreWeights::default(),
        chrono::Utc::now().date_naive(),
    );
    assert_eq!(order, vec![MAC.to_string()]);
    assert_eq!(channel.available_macs, vec![MAC.to_string()]);
}
