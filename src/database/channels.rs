//! Channel, group and stats queries
//!
//! Write helpers take a `&mut SqliteConnection` so the catalog refresh can
//! run its whole reconcile inside one transaction; read helpers live on
//! [`Database`] and hit the pool directly.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;

use super::Database;
use crate::models::{ChannelRecord, GroupRecord, PortalStats};

/// A channel is active when its group is active, when it is ungrouped and
/// the synthetic UNGROUPED group is active, or when the portal has no
/// active groups at all.
pub const ACTIVE_GROUP_CONDITION: &str = "(
    g.active = 1
    OR (
        (c.genre_id IS NULL OR c.genre_id = '')
        AND EXISTS (
            SELECT 1 FROM groups g3
            WHERE g3.portal_id = c.portal_id AND g3.genre_id = 'UNGROUPED' AND g3.active = 1
        )
    )
    OR NOT EXISTS (
        SELECT 1 FROM groups g2 WHERE g2.portal_id = c.portal_id AND g2.active = 1
    )
)";

pub fn csv_join(values: &[String]) -> String {
    values.join(",")
}

pub fn csv_split(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn row_to_channel(row: &SqliteRow) -> ChannelRecord {
    ChannelRecord {
        portal_id: row.get("portal_id"),
        channel_id: row.get("channel_id"),
        name: row.get("name"),
        number: row.get("number"),
        genre: row.get("genre"),
        genre_id: row.get("genre_id"),
        logo: row.get("logo"),
        cmd: row.get("cmd"),
        auto_name: row.get("auto_name"),
        display_name: row.get("display_name"),
        resolution: row.get("resolution"),
        video_codec: row.get("video_codec"),
        country: row.get("country"),
        audio_tags: row.get("audio_tags"),
        event_tags: row.get("event_tags"),
        misc_tags: row.get("misc_tags"),
        custom_name: row.get("custom_name"),
        custom_number: row.get("custom_number"),
        custom_genre: row.get("custom_genre"),
        custom_epg_id: row.get("custom_epg_id"),
        matched_name: row.get("matched_name"),
        matched_source: row.get("matched_source"),
        matched_station_id: row.get("matched_station_id"),
        matched_call_sign: row.get("matched_call_sign"),
        matched_logo: row.get("matched_logo"),
        matched_score: row.get("matched_score"),
        is_header: row.get::<i64, _>("is_header") != 0,
        is_event: row.get::<i64, _>("is_event") != 0,
        is_raw: row.get::<i64, _>("is_raw") != 0,
        enabled: row.get::<i64, _>("enabled") != 0,
        available_macs: csv_split(&row.get::<String, _>("available_macs")),
        alternate_ids: csv_split(&row.get::<String, _>("alternate_ids")),
        channel_hash: row.get("channel_hash"),
        missing_since: row
            .get::<Option<i64>, _>("missing_since")
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
    }
}

// c.-qualified so the list survives joins against groups
const CHANNEL_COLUMNS: &str = "c.portal_id, c.channel_id, c.name, c.number, c.genre, c.genre_id,
    c.logo, c.cmd, c.auto_name, c.display_name, c.resolution, c.video_codec, c.country,
    c.audio_tags, c.event_tags, c.misc_tags,
    c.custom_name, c.custom_number, c.custom_genre, c.custom_epg_id,
    c.matched_name, c.matched_source, c.matched_station_id, c.matched_call_sign, c.matched_logo,
    c.matched_score, c.is_header, c.is_event, c.is_raw, c.enabled, c.prior_enabled,
    c.available_macs, c.alternate_ids, c.channel_hash, c.missing_since";

/// Full upsert for a channel whose content hash changed (or that is new).
/// Custom overrides and the enabled flag belong to the operator and are
/// never touched; a soft-deleted row that reappears gets its prior enabled
/// state back.
pub async fn upsert_channel(conn: &mut SqliteConnection, rec: &ChannelRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO channels (
            portal_id, channel_id, name, number, genre, genre_id, logo, cmd,
            auto_name, display_name, resolution, video_codec, country,
            audio_tags, event_tags, misc_tags,
            matched_name, matched_source, matched_station_id, matched_call_sign,
            matched_logo, matched_score, is_header, is_event, is_raw,
            enabled, available_macs, alternate_ids, channel_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(portal_id, channel_id) DO UPDATE SET
            name = excluded.name,
            number = excluded.number,
            genre = excluded.genre,
            genre_id = excluded.genre_id,
            logo = excluded.logo,
            cmd = excluded.cmd,
            auto_name = CASE WHEN excluded.auto_name != '' THEN excluded.auto_name ELSE channels.auto_name END,
            display_name = COALESCE(
                NULLIF(channels.custom_name, ''), NULLIF(excluded.matched_name, ''),
                NULLIF(excluded.auto_name, ''), excluded.name
            ),
            resolution = excluded.resolution,
            video_codec = excluded.video_codec,
            country = excluded.country,
            audio_tags = excluded.audio_tags,
            event_tags = excluded.event_tags,
            misc_tags = excluded.misc_tags,
            matched_name = CASE WHEN excluded.matched_name != '' THEN excluded.matched_name ELSE channels.matched_name END,
            matched_source = CASE WHEN excluded.matched_name != '' THEN excluded.matched_source ELSE channels.matched_source END,
            matched_station_id = CASE WHEN excluded.matched_name != '' THEN excluded.matched_station_id ELSE channels.matched_station_id END,
            matched_call_sign = CASE WHEN excluded.matched_name != '' THEN excluded.matched_call_sign ELSE channels.matched_call_sign END,
            matched_logo = CASE WHEN excluded.matched_name != '' THEN excluded.matched_logo ELSE channels.matched_logo END,
            matched_score = CASE WHEN excluded.matched_name != '' THEN excluded.matched_score ELSE channels.matched_score END,
            is_header = excluded.is_header,
            is_event = excluded.is_event,
            is_raw = excluded.is_raw,
            enabled = CASE
                WHEN channels.missing_since IS NOT NULL THEN COALESCE(channels.prior_enabled, channels.enabled)
                ELSE channels.enabled
            END,
            prior_enabled = NULL,
            missing_since = NULL,
            available_macs = excluded.available_macs,
            alternate_ids = excluded.alternate_ids,
            channel_hash = excluded.channel_hash",
    )
    .bind(&rec.portal_id)
    .bind(&rec.channel_id)
    .bind(&rec.name)
    .bind(&rec.number)
    .bind(&rec.genre)
    .bind(&rec.genre_id)
    .bind(&rec.logo)
    .bind(&rec.cmd)
    .bind(&rec.auto_name)
    .bind(rec.effective_display_name())
    .bind(&rec.resolution)
    .bind(&rec.video_codec)
    .bind(&rec.country)
    .bind(&rec.audio_tags)
    .bind(&rec.event_tags)
    .bind(&rec.misc_tags)
    .bind(&rec.matched_name)
    .bind(&rec.matched_source)
    .bind(&rec.matched_station_id)
    .bind(&rec.matched_call_sign)
    .bind(&rec.matched_logo)
    .bind(rec.matched_score)
    .bind(rec.is_header as i64)
    .bind(rec.is_event as i64)
    .bind(rec.is_raw as i64)
    .bind(rec.enabled as i64)
    .bind(csv_join(&rec.available_macs))
    .bind(csv_join(&rec.alternate_ids))
    .bind(&rec.channel_hash)
    .execute(conn)
    .await?;
    Ok(())
}

/// Presence-only update for a channel whose hash was unchanged: refresh
/// MAC availability and merge links, and clear a pending soft-delete.
pub async fn update_channel_presence(
    conn: &mut SqliteConnection,
    portal_id: &str,
    channel_id: &str,
    available_macs: &[String],
    alternate_ids: &[String],
) -> Result<()> {
    sqlx::query(
        "UPDATE channels SET
            available_macs = ?,
            alternate_ids = ?,
            enabled = CASE
                WHEN missing_since IS NOT NULL THEN COALESCE(prior_enabled, enabled)
                ELSE enabled
            END,
            prior_enabled = NULL,
            missing_since = NULL
        WHERE portal_id = ? AND channel_id = ?",
    )
    .bind(csv_join(available_macs))
    .bind(csv_join(alternate_ids))
    .bind(portal_id)
    .bind(channel_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Replace normalized tag rows for one channel.
pub async fn sync_channel_tags(
    conn: &mut SqliteConnection,
    portal_id: &str,
    channel_id: &str,
    event_tags: &[String],
    misc_tags: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM channel_tags WHERE portal_id = ? AND channel_id = ?")
        .bind(portal_id)
        .bind(channel_id)
        .execute(&mut *conn)
        .await?;
    for (tag_type, values) in [("event", event_tags), ("misc", misc_tags)] {
        for value in values {
            sqlx::query(
                "INSERT OR IGNORE INTO channel_tags (portal_id, channel_id, tag_type, tag_value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(portal_id)
            .bind(channel_id)
            .bind(tag_type)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Merged-away alternates must not keep their own rows.
pub async fn delete_channels(
    conn: &mut SqliteConnection,
    portal_id: &str,
    channel_ids: &[String],
) -> Result<()> {
    for channel_id in channel_ids {
        sqlx::query("DELETE FROM channels WHERE portal_id = ? AND channel_id = ?")
            .bind(portal_id)
            .bind(channel_id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM channel_tags WHERE portal_id = ? AND channel_id = ?")
            .bind(portal_id)
            .bind(channel_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Soft-delete rows that vanished from every non-failing MAC listing. The
/// prior enabled flag is parked so a later reappearance can restore it.
pub async fn mark_channels_missing(
    conn: &mut SqliteConnection,
    portal_id: &str,
    channel_ids: &[String],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut affected = 0usize;
    for channel_id in channel_ids {
        let result = sqlx::query(
            "UPDATE channels SET
                prior_enabled = enabled,
                enabled = 0,
                missing_since = ?
            WHERE portal_id = ? AND channel_id = ? AND missing_since IS NULL",
        )
        .bind(now.timestamp())
        .bind(portal_id)
        .bind(channel_id)
        .execute(&mut *conn)
        .await?;
        affected += result.rows_affected() as usize;
    }
    Ok(affected)
}

/// Hard-delete soft-deleted rows whose TTL ran out.
pub async fn hard_delete_missing(
    conn: &mut SqliteConnection,
    portal_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<usize> {
    let result = sqlx::query(
        "DELETE FROM channels
         WHERE portal_id = ? AND missing_since IS NOT NULL AND missing_since < ?",
    )
    .bind(portal_id)
    .bind(cutoff.timestamp())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() as usize)
}

pub async fn upsert_group(
    conn: &mut SqliteConnection,
    portal_id: &str,
    genre_id: &str,
    name: &str,
    channel_count: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO groups (portal_id, genre_id, name, channel_count)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(portal_id, genre_id) DO UPDATE SET
            name = excluded.name,
            channel_count = excluded.channel_count",
    )
    .bind(portal_id)
    .bind(genre_id)
    .bind(name)
    .bind(channel_count)
    .execute(conn)
    .await?;
    Ok(())
}

/// Replace the active-group selection. An empty selection deactivates
/// every group, which the active condition reads as "include all".
pub async fn set_groups_active(
    conn: &mut SqliteConnection,
    portal_id: &str,
    selected_genres: &[String],
) -> Result<()> {
    sqlx::query("UPDATE groups SET active = 0 WHERE portal_id = ?")
        .bind(portal_id)
        .execute(&mut *conn)
        .await?;
    for genre_id in selected_genres {
        sqlx::query("UPDATE groups SET active = 1 WHERE portal_id = ? AND genre_id = ?")
            .bind(portal_id)
            .bind(genre_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Recompute `portal_stats` and `group_stats`; runs inside the refresh
/// transaction so counters and rows commit together.
pub async fn recompute_stats(
    conn: &mut SqliteConnection,
    portal_id: &str,
    portal_name: &str,
) -> Result<PortalStats> {
    let row = sqlx::query(&format!(
        "SELECT
            COUNT(*) AS total_channels,
            SUM(CASE WHEN c.enabled = 1 AND {ACTIVE_GROUP_CONDITION} THEN 1 ELSE 0 END) AS active_channels
         FROM channels c
         LEFT JOIN groups g ON c.portal_id = g.portal_id AND c.genre_id = g.genre_id
         WHERE c.portal_id = ?"
    ))
    .bind(portal_id)
    .fetch_one(&mut *conn)
    .await?;
    let total_channels: i64 = row.get("total_channels");
    let active_channels: i64 = row.get::<Option<i64>, _>("active_channels").unwrap_or(0);

    let row = sqlx::query(
        "SELECT COUNT(*) AS total_groups,
                SUM(CASE WHEN active = 1 THEN 1 ELSE 0 END) AS active_groups
         FROM groups WHERE portal_id = ?",
    )
    .bind(portal_id)
    .fetch_one(&mut *conn)
    .await?;
    let total_groups: i64 = row.get("total_groups");
    let active_groups: i64 = row.get::<Option<i64>, _>("active_groups").unwrap_or(0);

    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO portal_stats
            (portal_id, portal_name, total_channels, active_channels, total_groups, active_groups, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(portal_id) DO UPDATE SET
            portal_name = excluded.portal_name,
            total_channels = excluded.total_channels,
            active_channels = excluded.active_channels,
            total_groups = excluded.total_groups,
            active_groups = excluded.active_groups,
            updated_at = excluded.updated_at",
    )
    .bind(portal_id)
    .bind(portal_name)
    .bind(total_channels)
    .bind(active_channels)
    .bind(total_groups)
    .bind(active_groups)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM group_stats WHERE portal_id = ?")
        .bind(portal_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO group_stats (portal_id, portal_name, group_name, channel_count, updated_at)
         SELECT c.portal_id, ?, COALESCE(NULLIF(c.genre, ''), 'UNGROUPED'), COUNT(*), ?
         FROM channels c WHERE c.portal_id = ?
         GROUP BY COALESCE(NULLIF(c.genre, ''), 'UNGROUPED')",
    )
    .bind(portal_name)
    .bind(&now)
    .bind(portal_id)
    .execute(&mut *conn)
    .await?;

    Ok(PortalStats {
        total_channels,
        active_channels,
        total_groups,
        active_groups,
    })
}

impl Database {
    /// Stored content hashes for one portal, used by the hash-equals-skip
    /// path of the refresh.
    pub async fn channel_hashes(&self, portal_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT channel_id, channel_hash FROM channels WHERE portal_id = ?")
            .bind(portal_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("channel_id"), row.get("channel_hash")))
            .collect())
    }

    /// All known channel ids for a portal (soft-deleted included).
    pub async fn channel_ids(&self, portal_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT channel_id FROM channels WHERE portal_id = ?")
            .bind(portal_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("channel_id")).collect())
    }

    pub async fn get_channel(
        &self,
        portal_id: &str,
        channel_id: &str,
    ) -> Result<Option<ChannelRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.portal_id = ? AND c.channel_id = ?"
        ))
        .bind(portal_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_channel))
    }

    /// Enabled channels in active groups, ordered for stable playlist and
    /// guide emission: effective display name, then portal, then channel.
    pub async fn list_enabled_channels(&self) -> Result<Vec<ChannelRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels c
             LEFT JOIN groups g ON c.portal_id = g.portal_id AND c.genre_id = g.genre_id
             WHERE c.enabled = 1 AND c.missing_since IS NULL AND {ACTIVE_GROUP_CONDITION}
             ORDER BY COALESCE(
                 NULLIF(c.custom_name, ''), NULLIF(c.matched_name, ''),
                 NULLIF(c.auto_name, ''), c.name
             ), c.portal_id, c.channel_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_channel).collect())
    }

    pub async fn set_channel_enabled(
        &self,
        portal_id: &str,
        channel_id: &str,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE channels SET enabled = ? WHERE portal_id = ? AND channel_id = ?")
            .bind(enabled as i64)
            .bind(portal_id)
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_groups(&self, portal_id: &str) -> Result<Vec<GroupRecord>> {
        let rows = sqlx::query(
            "SELECT portal_id, genre_id, name, channel_count, active
             FROM groups WHERE portal_id = ? ORDER BY name",
        )
        .bind(portal_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| GroupRecord {
                portal_id: row.get("portal_id"),
                genre_id: row.get("genre_id"),
                name: row.get("name"),
                channel_count: row.get("channel_count"),
                active: row.get::<i64, _>("active") != 0,
            })
            .collect())
    }

    pub async fn portal_stats(&self, portal_id: &str) -> Result<Option<PortalStats>> {
        let row = sqlx::query(
            "SELECT total_channels, active_channels, total_groups, active_groups
             FROM portal_stats WHERE portal_id = ?",
        )
        .bind(portal_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| PortalStats {
            total_channels: row.get("total_channels"),
            active_channels: row.get("active_channels"),
            total_groups: row.get("total_groups"),
            active_groups: row.get("active_groups"),
        }))
    }

    /// Cascade removal of everything a portal owns.
    pub async fn delete_portal(&self, portal_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "channels",
            "channel_tags",
            "groups",
            "portal_stats",
            "group_stats",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE portal_id = ?"))
                .bind(portal_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_database;

    fn record(portal: &str, id: &str, name: &str) -> ChannelRecord {
        ChannelRecord {
            portal_id: portal.into(),
            channel_id: id.into(),
            name: name.into(),
            number: "1".into(),
            enabled: true,
            channel_hash: format!("hash-{id}"),
            ..Default::default()
        }
    }

    /// Run write helpers on a short-lived connection so the single
    /// in-memory pool connection is free for reads afterwards.
    async fn writes<F>(db: &Database, f: F)
    where
        F: for<'c> FnOnce(
            &'c mut SqliteConnection,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'c>>,
    {
        let mut conn = db.pool().acquire().await.unwrap();
        f(&mut conn).await;
    }

    #[tokio::test]
    async fn upsert_preserves_custom_fields() {
        let db = test_database().await;

        let rec = record("p1", "100", "BBC One FHD");
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_channel(conn, &rec).await.unwrap();
            })
        })
        .await;

        sqlx::query(
            "UPDATE channels SET custom_name = 'My BBC', custom_epg_id = 'bbc1.uk', enabled = 0
             WHERE portal_id = 'p1' AND channel_id = '100'",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let mut updated = record("p1", "100", "BBC One FHD");
        updated.channel_hash = "hash-new".into();
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_channel(conn, &updated).await.unwrap();
            })
        })
        .await;

        let row = db.get_channel("p1", "100").await.unwrap().unwrap();
        assert_eq!(row.custom_name, "My BBC");
        assert_eq!(row.custom_epg_id, "bbc1.uk");
        assert!(!row.enabled, "operator-disabled flag must survive refresh");
        assert_eq!(row.channel_hash, "hash-new");
    }

    #[tokio::test]
    async fn soft_delete_and_restore_cycle() {
        let db = test_database().await;

        let rec = record("p1", "100", "BBC One");
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_channel(conn, &rec).await.unwrap();
                let marked = mark_channels_missing(conn, "p1", &["100".into()], Utc::now())
                    .await
                    .unwrap();
                assert_eq!(marked, 1);
            })
        })
        .await;

        let row = db.get_channel("p1", "100").await.unwrap().unwrap();
        assert!(!row.enabled);
        assert!(row.missing_since.is_some());

        writes(&db, |conn| {
            Box::pin(async move {
                // Second refresh must not re-mark (prior_enabled would be lost)
                let marked = mark_channels_missing(conn, "p1", &["100".into()], Utc::now())
                    .await
                    .unwrap();
                assert_eq!(marked, 0);
                update_channel_presence(conn, "p1", "100", &["00:1A:79:AA".into()], &[])
                    .await
                    .unwrap();
            })
        })
        .await;

        let row = db.get_channel("p1", "100").await.unwrap().unwrap();
        assert!(row.enabled, "prior enabled state restored on reappearance");
        assert!(row.missing_since.is_none());
        assert_eq!(row.available_macs, vec!["00:1A:79:AA".to_string()]);
    }

    #[tokio::test]
    async fn hard_delete_honours_cutoff() {
        let db = test_database().await;

        let rec = record("p1", "100", "Gone");
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_channel(conn, &rec).await.unwrap();
            })
        })
        .await;

        let long_ago = Utc::now() - chrono::Duration::hours(100);
        sqlx::query("UPDATE channels SET missing_since = ?, enabled = 0 WHERE channel_id = '100'")
            .bind(long_ago.timestamp())
            .execute(db.pool())
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(72);
        writes(&db, |conn| {
            Box::pin(async move {
                let deleted = hard_delete_missing(conn, "p1", cutoff).await.unwrap();
                assert_eq!(deleted, 1);
            })
        })
        .await;
        assert!(db.get_channel("p1", "100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_toggle_filters_without_deleting() {
        let db = test_database().await;

        let mut rec = record("p1", "100", "Sports 1");
        rec.genre_id = "G".into();
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_channel(conn, &rec).await.unwrap();
                upsert_group(conn, "p1", "G", "Sports", 1).await.unwrap();
            })
        })
        .await;

        assert_eq!(db.list_enabled_channels().await.unwrap().len(), 1);

        // Another group becomes the only active one; G drops out
        writes(&db, |conn| {
            Box::pin(async move {
                upsert_group(conn, "p1", "H", "News", 0).await.unwrap();
                set_groups_active(conn, "p1", &["H".into()]).await.unwrap();
            })
        })
        .await;
        assert!(db.list_enabled_channels().await.unwrap().is_empty());

        // Channel row untouched
        assert!(db.get_channel("p1", "100").await.unwrap().is_some());

        // No active groups at all → everything visible again
        writes(&db, |conn| {
            Box::pin(async move {
                set_groups_active(conn, "p1", &[]).await.unwrap();
            })
        })
        .await;
        assert_eq!(db.list_enabled_channels().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enabled_ordering_is_stable() {
        let db = test_database().await;

        writes(&db, |conn| {
            Box::pin(async move {
                for (id, name) in [("2", "Beta"), ("1", "Alpha"), ("3", "Alpha")] {
                    upsert_channel(conn, &record("p1", id, name)).await.unwrap();
                }
            })
        })
        .await;
        let listed = db.list_enabled_channels().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.channel_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);
    }

    #[tokio::test]
    async fn recompute_stats_counts_active() {
        let db = test_database().await;

        writes(&db, |conn| {
            Box::pin(async move {
                let mut a = record("p1", "1", "A");
                a.genre_id = "G".into();
                a.genre = "Sports".into();
                upsert_channel(conn, &a).await.unwrap();
                let mut b = record("p1", "2", "B");
                b.genre_id = "G".into();
                b.genre = "Sports".into();
                upsert_channel(conn, &b).await.unwrap();
            })
        })
        .await;
        sqlx::query("UPDATE channels SET enabled = 0 WHERE channel_id = '2'")
            .execute(db.pool())
            .await
            .unwrap();

        writes(&db, |conn| {
            Box::pin(async move {
                upsert_group(conn, "p1", "G", "Sports", 2).await.unwrap();
                let stats = recompute_stats(conn, "p1", "Portal One").await.unwrap();
                assert_eq!(stats.total_channels, 2);
                assert_eq!(stats.active_channels, 1);
                assert_eq!(stats.total_groups, 1);
                assert_eq!(stats.active_groups, 1);
            })
        })
        .await;
    }
}
