use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::{Privacy, UploadRecord};
use crate::sqlite::{ensure_parent_dir, open_connection};

const UPLOAD_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    source_key TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    url TEXT,
    title TEXT NOT NULL,
    privacy TEXT NOT NULL,
    scheduled_publish_at TEXT,
    script_id TEXT,
    original_file TEXT NOT NULL,
    run_id TEXT,
    uploaded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_uploads_uploaded_at ON uploads(uploaded_at);
";

#[derive(Debug, Error)]
pub enum UploadLogError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open upload log at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("source {source_key} is already in the upload log")]
    Conflict { source_key: String },
    #[error("upload log row is corrupt: {0}")]
    Corrupt(String),
    #[error("background task failed: {0}")]
    Join(String),
}

pub type UploadLogResult<T> = std::result::Result<T, UploadLogError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLogEntry {
    pub record: UploadRecord,
    pub original_file: PathBuf,
    pub run_id: Option<String>,
}

/// Persisted history of published videos, keyed by source artifact.
#[derive(Debug, Clone)]
pub struct SqliteUploadLog {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteUploadLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        }
    }

    pub fn read_only(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_ONLY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> UploadLogResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| UploadLogError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> UploadLogResult<()> {
        ensure_parent_dir(&self.path)?;
        let conn = self.open()?;
        conn.execute_batch(UPLOAD_SCHEMA)?;
        Ok(())
    }

    pub fn find(&self, source_key: &str) -> UploadLogResult<Option<UploadLogEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT source_key, video_id, url, title, privacy, scheduled_publish_at, script_id,
                    original_file, run_id, uploaded_at
             FROM uploads WHERE source_key = ?1",
        )?;
        stmt.query_row([source_key], entry_from_row)
            .optional()?
            .transpose()
    }

    pub fn contains(&self, source_key: &str) -> UploadLogResult<bool> {
        Ok(self.find(source_key)?.is_some())
    }

    /// Appends a new entry; an existing entry for the same source key is a
    /// [`UploadLogError::Conflict`], never an overwrite.
    pub fn append(&self, entry: &UploadLogEntry) -> UploadLogResult<()> {
        let conn = self.open()?;
        let record = &entry.record;
        let inserted = conn.execute(
            "INSERT INTO uploads (
                source_key, video_id, url, title, privacy, scheduled_publish_at, script_id,
                original_file, run_id, uploaded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &record.source_key,
                &record.video_id,
                &record.url,
                &record.title,
                record.privacy.as_str(),
                record.scheduled_publish_at,
                &record.script_id,
                entry.original_file.display().to_string(),
                &entry.run_id,
                record.uploaded_at,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(UploadLogError::Conflict {
                    source_key: record.source_key.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn list(&self, limit: usize) -> UploadLogResult<Vec<UploadLogEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT source_key, video_id, url, title, privacy, scheduled_publish_at, script_id,
                    original_file, run_id, uploaded_at
             FROM uploads ORDER BY uploaded_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<UploadLogResult<UploadLogEntry>> {
    let privacy: String = row.get(4)?;
    let privacy = match privacy.parse::<Privacy>() {
        Ok(privacy) => privacy,
        Err(reason) => return Ok(Err(UploadLogError::Corrupt(reason))),
    };
    let original_file: String = row.get(7)?;
    let scheduled: Option<DateTime<Utc>> = row.get(5)?;
    Ok(Ok(UploadLogEntry {
        record: UploadRecord {
            source_key: row.get(0)?,
            video_id: row.get(1)?,
            url: row.get(2)?,
            title: row.get(3)?,
            privacy,
            scheduled_publish_at: scheduled,
            script_id: row.get(6)?,
            uploaded_at: row.get(9)?,
        },
        original_file: PathBuf::from(original_file),
        run_id: row.get(8)?,
    }))
}

/// Async view used by the upload stage.
#[async_trait]
pub trait UploadLog: Send + Sync {
    async fn find_upload(&self, source_key: &str) -> UploadLogResult<Option<UploadLogEntry>>;
    async fn append_upload(&self, entry: &UploadLogEntry) -> UploadLogResult<()>;
}

#[async_trait]
impl UploadLog for SqliteUploadLog {
    async fn find_upload(&self, source_key: &str) -> UploadLogResult<Option<UploadLogEntry>> {
        let log = self.clone();
        let key = source_key.to_string();
        tokio::task::spawn_blocking(move || log.find(&key))
            .await
            .map_err(|err| UploadLogError::Join(err.to_string()))?
    }

    async fn append_upload(&self, entry: &UploadLogEntry) -> UploadLogResult<()> {
        let log = self.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || log.append(&entry))
            .await
            .map_err(|err| UploadLogError::Join(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, video_id: &str) -> UploadLogEntry {
        UploadLogEntry {
            record: UploadRecord {
                video_id: video_id.into(),
                url: Some(format!("https://youtu.be/{video_id}")),
                title: "AI Facts".into(),
                privacy: Privacy::Unlisted,
                scheduled_publish_at: None,
                source_key: key.into(),
                script_id: Some("abc".into()),
                uploaded_at: Utc::now(),
            },
            original_file: PathBuf::from("videos/ai_facts.mp4"),
            run_id: Some("run-1".into()),
        }
    }

    #[test]
    fn append_then_find_and_reject_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteUploadLog::new(dir.path().join("uploads.sqlite"));
        log.initialize().unwrap();

        assert!(!log.contains("key-1").unwrap());
        log.append(&entry("key-1", "vid1")).unwrap();
        let found = log.find("key-1").unwrap().unwrap();
        assert_eq!(found.record.video_id, "vid1");
        assert_eq!(found.record.privacy, Privacy::Unlisted);

        let err = log.append(&entry("key-1", "vid2")).unwrap_err();
        assert!(matches!(err, UploadLogError::Conflict { ref source_key } if source_key == "key-1"));
        assert_eq!(log.list(10).unwrap().len(), 1);
    }
}
