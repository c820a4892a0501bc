//! EPG source metadata and channel-id alias queries
//!
//! Programme rows live in per-source databases (see `epg::store`); the
//! main catalog only tracks source rows, the channels each source knows
//! about, and their display-name aliases used for resolution at emission
//! time.

use anyhow::Result;
use sqlx::Row;

use super::Database;
use crate::models::{EpgChannelRecord, EpgSourceRecord, EpgSourceType};

/// Where a channel's programmes come from, resolved per effective EPG id.
#[derive(Debug, Clone)]
pub struct EpgResolution {
    pub source_id: String,
    pub channel_id: String,
    pub display_name: String,
    pub icon: String,
    pub lcn: String,
}

impl Database {
    pub async fn upsert_epg_source(&self, source: &EpgSourceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO epg_sources
                (source_id, name, url, source_type, enabled, interval_hours, last_fetch, last_refresh)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                source_type = excluded.source_type,
                enabled = excluded.enabled,
                interval_hours = excluded.interval_hours,
                last_fetch = COALESCE(excluded.last_fetch, epg_sources.last_fetch),
                last_refresh = COALESCE(excluded.last_refresh, epg_sources.last_refresh)",
        )
        .bind(&source.source_id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.source_type.as_str())
        .bind(source.enabled as i64)
        .bind(source.interval_hours)
        .bind(source.last_fetch)
        .bind(source.last_refresh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_epg_sources(&self) -> Result<Vec<EpgSourceRecord>> {
        let rows = sqlx::query(
            "SELECT source_id, name, url, source_type, enabled, interval_hours, last_fetch, last_refresh
             FROM epg_sources ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| EpgSourceRecord {
                source_id: row.get("source_id"),
                name: row.get("name"),
                url: row.get("url"),
                source_type: EpgSourceType::parse(&row.get::<String, _>("source_type")),
                enabled: row.get::<i64, _>("enabled") != 0,
                interval_hours: row.get("interval_hours"),
                last_fetch: row.get("last_fetch"),
                last_refresh: row.get("last_refresh"),
            })
            .collect())
    }

    pub async fn get_epg_source(&self, source_id: &str) -> Result<Option<EpgSourceRecord>> {
        Ok(self
            .list_epg_sources()
            .await?
            .into_iter()
            .find(|s| s.source_id == source_id))
    }

    pub async fn mark_epg_fetch(&self, source_id: &str, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE epg_sources SET last_fetch = ? WHERE source_id = ?")
            .bind(timestamp)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_epg_refresh(&self, source_id: &str, timestamp: i64) -> Result<()> {
        sqlx::query("UPDATE epg_sources SET last_refresh = ? WHERE source_id = ?")
            .bind(timestamp)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_epg_source(&self, source_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["epg_sources", "epg_channels", "epg_channel_names"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE source_id = ?"))
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replace the channel metadata a source reported in its last refresh.
    pub async fn replace_epg_channels(
        &self,
        source_id: &str,
        channels: &[EpgChannelRecord],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM epg_channels WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM epg_channel_names WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        for channel in channels {
            sqlx::query(
                "INSERT OR REPLACE INTO epg_channels
                    (source_id, channel_id, display_name, icon, lcn, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(source_id)
            .bind(&channel.channel_id)
            .bind(&channel.display_name)
            .bind(&channel.icon)
            .bind(&channel.lcn)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            for name in &channel.names {
                sqlx::query(
                    "INSERT OR IGNORE INTO epg_channel_names (source_id, channel_id, name)
                     VALUES (?, ?, ?)",
                )
                .bind(source_id)
                .bind(&channel.channel_id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Resolve an effective EPG id to the source that carries it.
    ///
    /// Resolution order: a source whose `epg_channels` contains the id
    /// verbatim wins; otherwise a case-folded display-name alias in
    /// `epg_channel_names`; otherwise none. Multiple hits tie-break on
    /// source_id so emission stays deterministic.
    pub async fn resolve_epg_id(&self, epg_id: &str) -> Result<Option<EpgResolution>> {
        let row = sqlx::query(
            "SELECT source_id, channel_id, display_name, icon, lcn
             FROM epg_channels WHERE channel_id = ? ORDER BY source_id LIMIT 1",
        )
        .bind(epg_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(EpgResolution {
                source_id: row.get("source_id"),
                channel_id: row.get("channel_id"),
                display_name: row.get("display_name"),
                icon: row.get("icon"),
                lcn: row.get("lcn"),
            }));
        }

        let row = sqlx::query(
            "SELECT n.source_id, n.channel_id, c.display_name, c.icon, c.lcn
             FROM epg_channel_names n
             JOIN epg_channels c ON c.source_id = n.source_id AND c.channel_id = n.channel_id
             WHERE n.name = ? COLLATE NOCASE
             ORDER BY n.source_id, n.channel_id LIMIT 1",
        )
        .bind(epg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| EpgResolution {
            source_id: row.get("source_id"),
            channel_id: row.get("channel_id"),
            display_name: row.get("display_name"),
            icon: row.get("icon"),
            lcn: row.get("lcn"),
        }))
    }
}
