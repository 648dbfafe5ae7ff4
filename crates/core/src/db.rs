use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tokio::fs;

/// Row of the `points` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointRecord {
    pub id: String,
    pub date: i64,
    pub nc_version: String,
    pub complete: bool,
    pub sealed: bool,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Opens (and creates if needed) the `SQLite` state database.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the database cannot be opened.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = Pool::<Sqlite>::connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS points (
                id TEXT PRIMARY KEY,
                date INTEGER NOT NULL,
                nc_version TEXT NOT NULL,
                complete INTEGER NOT NULL,
                sealed INTEGER NOT NULL DEFAULT 0
            );
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS changed_files (
                path TEXT PRIMARY KEY,
                changed_at TEXT NOT NULL
            );
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a freshly reserved point.
    ///
    /// # Errors
    /// Returns an error if the insert fails, e.g. for a duplicate id.
    pub async fn register_point(
        &self,
        id: &str,
        date: i64,
        nc_version: &str,
        complete: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO points(id, date, nc_version, complete, sealed) VALUES(?, ?, ?, ?, 0)",
        )
        .bind(id)
        .bind(date)
        .bind(nc_version)
        .bind(i64::from(complete))
        .execute(&self.pool)
        .await
        .with_context(|| format!("registering point {id}"))?;
        Ok(())
    }

    /// Flags a point as sealed.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_sealed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE points SET sealed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("sealing point {id}"))?;
        Ok(())
    }

    /// Drops the record of a point.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn forget_point(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM points WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists point records, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_points(&self) -> Result<Vec<PointRecord>> {
        let rows = sqlx::query(
            "SELECT id, date, nc_version, complete, sealed FROM points ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(point_record).collect())
    }

    /// Newest sealed complete point, the base of incremental composition.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn last_complete(&self) -> Result<Option<PointRecord>> {
        let row = sqlx::query(
            "SELECT id, date, nc_version, complete, sealed FROM points \
             WHERE complete = 1 AND sealed = 1 ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(point_record))
    }

    /// Records a change of `path`, keeping only the latest time per path.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn record_changed(&self, path: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO changed_files(path, changed_at) VALUES(?, ?) \
             ON CONFLICT(path) DO UPDATE SET changed_at = excluded.changed_at",
        )
        .bind(path)
        .bind(timestamp(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Paths changed at or after `since`, sorted.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT path FROM changed_files WHERE changed_at >= ? ORDER BY path ASC",
        )
        .bind(timestamp(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("path")).collect())
    }

    /// Forgets every recorded change.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn clear_changed(&self) -> Result<()> {
        sqlx::query("DELETE FROM changed_files")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn point_record(row: &sqlx::sqlite::SqliteRow) -> PointRecord {
    PointRecord {
        id: row.get("id"),
        date: row.get("date"),
        nc_version: row.get("nc_version"),
        complete: row.get::<i64, _>("complete") != 0,
        sealed: row.get::<i64, _>("sealed") != 0,
    }
}
