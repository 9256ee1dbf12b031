//! Persisted log of finished downloads, shown on the dashboard's history page.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

pub const HISTORY_DB_FILE: &str = "history.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub subject_id: String,
    pub title: String,
    pub source_url: String,
    pub format_id: String,
    pub quality: String,
    pub file_size: u64,
    pub file_path: String,
    pub downloaded_at: DateTime<Utc>,
    /// Wall time from opening the transfer to the file landing on disk.
    pub completion_secs: f64,
    /// Bytes per second over the whole transfer.
    pub average_speed: u64,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // Setting the journal mode answers with a row, which `execute` rejects.
    let mut rows = conn
        .query("PRAGMA journal_mode=WAL", params![])
        .await
        .context("enabling WAL journal")?;
    while rows.next().await?.is_some() {}
    conn.execute("PRAGMA synchronous=NORMAL", params![])
        .await
        .context("setting synchronous mode")?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS history (
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            title TEXT NOT NULL,
            source_url TEXT NOT NULL,
            format_id TEXT NOT NULL,
            quality TEXT NOT NULL DEFAULT '',
            file_size INTEGER NOT NULL DEFAULT 0,
            file_path TEXT NOT NULL,
            downloaded_at TEXT NOT NULL,
            completion_secs REAL NOT NULL DEFAULT 0,
            average_speed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_history_downloaded_at ON history(downloaded_at);
        "#,
    )
    .await?;
    Ok(())
}

pub struct HistoryStore {
    conn: Connection,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Opens (and if necessary creates) the history DB.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening history DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a record, replacing any previous record with the same id.
    pub async fn insert(&self, record: &HistoryRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO history (
                    id, subject_id, title, source_url, format_id, quality,
                    file_size, file_path, downloaded_at, completion_secs, average_speed
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    record.id.as_str(),
                    record.subject_id.as_str(),
                    record.title.as_str(),
                    record.source_url.as_str(),
                    record.format_id.as_str(),
                    record.quality.as_str(),
                    to_sql_int(record.file_size),
                    record.file_path.as_str(),
                    record.downloaded_at.to_rfc3339(),
                    record.completion_secs,
                    to_sql_int(record.average_speed),
                ],
            )
            .await
            .with_context(|| format!("recording history entry {}", record.id))?;
        Ok(())
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, subject_id, title, source_url, format_id, quality,
                       file_size, file_path, downloaded_at, completion_secs, average_speed
                FROM history
                ORDER BY downloaded_at DESC, rowid DESC
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM history WHERE id = ?1", params![id])
            .await?;
        Ok(affected > 0)
    }

    /// Deletes every record and returns how many were removed.
    pub async fn clear(&self) -> Result<u64> {
        Ok(self.conn.execute("DELETE FROM history", params![]).await?)
    }
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// Column order must match the SELECT in `list`.
fn row_to_record(row: &Row) -> Result<HistoryRecord> {
    let downloaded_at: String = row.get(8)?;
    let downloaded_at = DateTime::parse_from_rfc3339(&downloaded_at)
        .with_context(|| format!("parsing stored timestamp {downloaded_at}"))?
        .with_timezone(&Utc);

    Ok(HistoryRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        title: row.get(2)?,
        source_url: row.get(3)?,
        format_id: row.get(4)?,
        quality: row.get(5)?,
        file_size: from_sql_int(row.get(6)?),
        file_path: row.get(7)?,
        downloaded_at,
        completion_secs: row.get(9)?,
        average_speed: from_sql_int(row.get(10)?),
    })
}
