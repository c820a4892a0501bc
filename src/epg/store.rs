//! Per-source programme store
//!
//! Each EPG source owns a dedicated SQLite file under
//! `DATA_DIR/epg_sources/<source_id>.db` — single writer, many readers.
//! Keeping programmes out of the main catalog keeps refreshes of one
//! source from blocking anything else.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::models::ProgrammeRow;

/// Programme rows per insert transaction
pub const BATCH_SIZE: usize = 5_000;
/// IN-clause chunk size, SQLite bind-parameter limit minded
const QUERY_CHUNK: usize = 900;

pub struct ProgrammeStore {
    pool: SqlitePool,
}

impl ProgrammeStore {
    pub async fn open(dir: &Path, source_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let filename = dir.join(format!("{}.db", sanitize_source_id(source_id)));
        let options = SqliteConnectOptions::new()
            .filename(&filename)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS programmes (
                channel_id TEXT NOT NULL,
                start TEXT NOT NULL DEFAULT '',
                stop TEXT NOT NULL DEFAULT '',
                start_ts INTEGER NOT NULL,
                stop_ts INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                sub_title TEXT NOT NULL DEFAULT '',
                categories TEXT NOT NULL DEFAULT '',
                episode_num TEXT NOT NULL DEFAULT '',
                rating TEXT NOT NULL DEFAULT '',
                icon TEXT NOT NULL DEFAULT '',
                extra_json TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&mut *tx)
        .await?;
        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_programmes_channel ON programmes(channel_id)",
            "CREATE INDEX IF NOT EXISTS idx_programmes_start ON programmes(start_ts)",
            "CREATE INDEX IF NOT EXISTS idx_programmes_stop ON programmes(stop_ts)",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Batched inserts, [`BATCH_SIZE`] rows per transaction.
    pub async fn insert_batch(&self, rows: &[ProgrammeRow]) -> Result<usize> {
        let mut inserted = 0usize;
        for chunk in rows.chunks(BATCH_SIZE) {
            let mut tx = self.pool.begin().await?;
            for row in chunk {
                sqlx::query(
                    "INSERT INTO programmes
                        (channel_id, start, stop, start_ts, stop_ts, title, description,
                         sub_title, categories, episode_num, rating, icon, extra_json)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&row.channel_id)
                .bind(&row.start)
                .bind(&row.stop)
                .bind(row.start_ts)
                .bind(row.stop_ts)
                .bind(&row.title)
                .bind(&row.description)
                .bind(&row.sub_title)
                .bind(&row.categories)
                .bind(&row.episode_num)
                .bind(&row.rating)
                .bind(&row.icon)
                .bind(&row.extra_json)
                .execute(&mut *tx)
                .await?;
                inserted += 1;
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    /// Drop programmes that ended before `cutoff_ts` (retention sweep,
    /// same refresh that inserted the fresh rows).
    pub async fn delete_before(&self, cutoff_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM programmes WHERE stop_ts < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM programmes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM programmes")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Programmes for the given channel ids overlapping the window,
    /// ordered by start time.
    pub async fn query_range(
        &self,
        channel_ids: &[String],
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<ProgrammeRow>> {
        let mut rows_out = Vec::new();
        for chunk in channel_ids.chunks(QUERY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT channel_id, start, stop, start_ts, stop_ts, title, description,
                        sub_title, categories, episode_num, rating, icon, extra_json
                 FROM programmes
                 WHERE channel_id IN ({placeholders}) AND stop_ts >= ? AND start_ts <= ?
                 ORDER BY channel_id, start_ts",
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query
                .bind(from_ts)
                .bind(to_ts)
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                rows_out.push(ProgrammeRow {
                    channel_id: row.get("channel_id"),
                    start: row.get("start"),
                    stop: row.get("stop"),
                    start_ts: row.get("start_ts"),
                    stop_ts: row.get("stop_ts"),
                    title: row.get("title"),
                    description: row.get("description"),
                    sub_title: row.get("sub_title"),
                    categories: row.get("categories"),
                    episode_num: row.get("episode_num"),
                    rating: row.get("rating"),
                    icon: row.get("icon"),
                    extra_json: row.get("extra_json"),
                });
            }
        }
        Ok(rows_out)
    }
}

/// File-system safe source ids; anything exotic maps to `_`.
fn sanitize_source_id(source_id: &str) -> String {
    source_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
