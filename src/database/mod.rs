//! Catalog store over embedded SQLite
//!
//! One pool for the main catalog (channels, groups, stats, EPG source
//! metadata). Writers are serialized per portal through
//! [`Database::portal_lock`]; readers go straight to the pool and rely on
//! WAL snapshot semantics.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::info;

pub mod channels;
pub mod epg;

/// Statement batch applied at startup. SQLite `IF NOT EXISTS` keeps this
/// idempotent across restarts.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS channels (
        portal_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        number TEXT NOT NULL DEFAULT '',
        genre TEXT NOT NULL DEFAULT '',
        genre_id TEXT NOT NULL DEFAULT '',
        logo TEXT NOT NULL DEFAULT '',
        cmd TEXT NOT NULL DEFAULT '',
        auto_name TEXT NOT NULL DEFAULT '',
        display_name TEXT NOT NULL DEFAULT '',
        resolution TEXT NOT NULL DEFAULT '',
        video_codec TEXT NOT NULL DEFAULT '',
        country TEXT NOT NULL DEFAULT '',
        audio_tags TEXT NOT NULL DEFAULT '',
        event_tags TEXT NOT NULL DEFAULT '',
        misc_tags TEXT NOT NULL DEFAULT '',
        custom_name TEXT NOT NULL DEFAULT '',
        custom_number TEXT NOT NULL DEFAULT '',
        custom_genre TEXT NOT NULL DEFAULT '',
        custom_epg_id TEXT NOT NULL DEFAULT '',
        matched_name TEXT NOT NULL DEFAULT '',
        matched_source TEXT NOT NULL DEFAULT '',
        matched_station_id TEXT NOT NULL DEFAULT '',
        matched_call_sign TEXT NOT NULL DEFAULT '',
        matched_logo TEXT NOT NULL DEFAULT '',
        matched_score REAL,
        is_header INTEGER NOT NULL DEFAULT 0,
        is_event INTEGER NOT NULL DEFAULT 0,
        is_raw INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 0,
        prior_enabled INTEGER,
        available_macs TEXT NOT NULL DEFAULT '',
        alternate_ids TEXT NOT NULL DEFAULT '',
        channel_hash TEXT NOT NULL DEFAULT '',
        missing_since INTEGER,
        PRIMARY KEY (portal_id, channel_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_channels_enabled ON channels(enabled)",
    "CREATE INDEX IF NOT EXISTS idx_channels_portal_id ON channels(portal_id)",
    "CREATE INDEX IF NOT EXISTS idx_channels_name ON channels(name)",
    "CREATE INDEX IF NOT EXISTS idx_channels_display_name ON channels(display_name)",
    "CREATE INDEX IF NOT EXISTS idx_channels_genre_id ON channels(genre_id)",
    "CREATE INDEX IF NOT EXISTS idx_channels_missing ON channels(missing_since)",
    "CREATE TABLE IF NOT EXISTS groups (
        portal_id TEXT NOT NULL,
        genre_id TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        channel_count INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (portal_id, genre_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_groups_active ON groups(portal_id, active)",
    "CREATE TABLE IF NOT EXISTS channel_tags (
        portal_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        tag_type TEXT NOT NULL,
        tag_value TEXT NOT NULL,
        PRIMARY KEY (portal_id, channel_id, tag_type, tag_value)
    )",
    "CREATE INDEX IF NOT EXISTS idx_channel_tags_type_value ON channel_tags(tag_type, tag_value)",
    "CREATE TABLE IF NOT EXISTS portal_stats (
        portal_id TEXT PRIMARY KEY,
        portal_name TEXT NOT NULL DEFAULT '',
        total_channels INTEGER NOT NULL DEFAULT 0,
        active_channels INTEGER NOT NULL DEFAULT 0,
        total_groups INTEGER NOT NULL DEFAULT 0,
        active_groups INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS group_stats (
        portal_id TEXT NOT NULL,
        portal_name TEXT NOT NULL DEFAULT '',
        group_name TEXT NOT NULL,
        channel_count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (portal_id, group_name)
    )",
    "CREATE TABLE IF NOT EXISTS epg_sources (
        source_id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        source_type TEXT NOT NULL DEFAULT 'custom',
        enabled INTEGER NOT NULL DEFAULT 1,
        interval_hours REAL NOT NULL DEFAULT 24.0,
        last_fetch INTEGER,
        last_refresh INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS epg_channels (
        source_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        display_name TEXT NOT NULL DEFAULT '',
        icon TEXT NOT NULL DEFAULT '',
        lcn TEXT NOT NULL DEFAULT '',
        updated_at INTEGER,
        PRIMARY KEY (source_id, channel_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_epg_channels_channel ON epg_channels(channel_id)",
    "CREATE TABLE IF NOT EXISTS epg_channel_names (
        source_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        name TEXT NOT NULL,
        PRIMARY KEY (source_id, channel_id, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_epg_channel_names_name ON epg_channel_names(name COLLATE NOCASE)",
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    portal_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Database {
    /// Open (creating if needed) the catalog database at `path`.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Connect via URL; tests use `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            portal_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Catalog schema ready ({} statements)", SCHEMA.len());
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Per-portal write lock. Refresh and admin mutations for one portal
    /// serialize on this; other portals proceed in parallel.
    pub fn portal_lock(&self, portal_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.portal_locks.lock().expect("portal lock map poisoned");
        locks
            .entry(portal_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("open in-memory db");
    db.migrate().await.expect("migrate");
    db
}
