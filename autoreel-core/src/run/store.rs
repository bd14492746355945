use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::sqlite::{ensure_parent_dir, open_connection};

use super::models::{InitialInput, RunFailure, RunStatus, StageResult, WorkflowMode, WorkflowRun};
use super::{RunStoreError, RunStoreResult};

const RUN_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    stage_index INTEGER NOT NULL,
    input TEXT NOT NULL,
    results TEXT NOT NULL,
    failure TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
CREATE INDEX IF NOT EXISTS idx_workflow_runs_updated ON workflow_runs(updated_at);
";

#[derive(Debug, Clone)]
pub struct SqliteRunStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteRunStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteRunStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> RunStoreResult<SqliteRunStore> {
        let path = self.path.ok_or(RunStoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteRunStore { path, flags })
    }
}

/// Run-state store: one row per run, stage results kept as JSON.
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteRunStore {
    pub fn builder() -> SqliteRunStoreBuilder {
        SqliteRunStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> RunStoreResult<Self> {
        SqliteRunStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> RunStoreResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| RunStoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> RunStoreResult<()> {
        ensure_parent_dir(&self.path)?;
        let conn = self.open()?;
        conn.execute_batch(RUN_SCHEMA)?;
        Ok(())
    }

    pub fn save(&self, run: &WorkflowRun) -> RunStoreResult<()> {
        let conn = self.open()?;
        let input = serde_json::to_string(&run.input)?;
        let results = serde_json::to_string(&run.results)?;
        let failure = run
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO workflow_runs (
                run_id, mode, status, stage_index, input, results, failure, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(run_id) DO UPDATE SET
                mode = excluded.mode,
                status = excluded.status,
                stage_index = excluded.stage_index,
                input = excluded.input,
                results = excluded.results,
                failure = excluded.failure,
                updated_at = excluded.updated_at",
            params![
                &run.run_id,
                run.mode.as_str(),
                run.status.as_str(),
                run.stage_index as i64,
                input,
                results,
                failure,
                run.created_at,
                run.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn fetch(&self, run_id: &str) -> RunStoreResult<Option<WorkflowRun>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, mode, status, stage_index, input, results, failure, created_at, updated_at
             FROM workflow_runs WHERE run_id = ?1",
        )?;
        let row = stmt.query_row([run_id], RawRun::from_row).optional()?;
        row.map(RawRun::into_run).transpose()
    }

    pub fn load(&self, run_id: &str) -> RunStoreResult<WorkflowRun> {
        self.fetch(run_id)?.ok_or_else(|| RunStoreError::NotFound {
            run_id: run_id.to_string(),
        })
    }

    pub fn list(&self, status: Option<RunStatus>, limit: usize) -> RunStoreResult<Vec<WorkflowRun>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, mode, status, stage_index, input, results, failure, created_at, updated_at
             FROM workflow_runs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                RawRun::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRun::into_run).collect()
    }
}

struct RawRun {
    run_id: String,
    mode: String,
    status: String,
    stage_index: i64,
    input: String,
    results: String,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            mode: row.get(1)?,
            status: row.get(2)?,
            stage_index: row.get(3)?,
            input: row.get(4)?,
            results: row.get(5)?,
            failure: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_run(self) -> RunStoreResult<WorkflowRun> {
        let corrupt = |column: &'static str, reason: String| RunStoreError::Corrupt {
            run_id: self.run_id.clone(),
            column,
            reason,
        };
        let mode = self
            .mode
            .parse::<WorkflowMode>()
            .map_err(|reason| corrupt("mode", reason))?;
        let status = self
            .status
            .parse::<RunStatus>()
            .map_err(|reason| corrupt("status", reason))?;
        let input: InitialInput = serde_json::from_str(&self.input)
            .map_err(|err| corrupt("input", err.to_string()))?;
        let results: Vec<StageResult> = serde_json::from_str(&self.results)
            .map_err(|err| corrupt("results", err.to_string()))?;
        let failure: Option<RunFailure> = self
            .failure
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|err| corrupt("failure", err.to_string()))?;
        let stage_index = usize::try_from(self.stage_index)
            .map_err(|err| corrupt("stage_index", err.to_string()))?;
        if stage_index > mode.stages().len() || results.len() != stage_index {
            return Err(corrupt(
                "stage_index",
                format!(
                    "index {stage_index} does not match {} stored results",
                    results.len()
                ),
            ));
        }
        Ok(WorkflowRun {
            run_id: self.run_id,
            mode,
            status,
            stage_index,
            input,
            results,
            failure,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Async view over the run-state store used by the orchestrator.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn save_run(&self, run: &WorkflowRun) -> RunStoreResult<()>;
    async fn load_run(&self, run_id: &str) -> RunStoreResult<Option<WorkflowRun>>;
}

#[async_trait]
impl RunStateStore for SqliteRunStore {
    async fn save_run(&self, run: &WorkflowRun) -> RunStoreResult<()> {
        let store = self.clone();
        let run = run.clone();
        tokio::task::spawn_blocking(move || store.save(&run))
            .await
            .map_err(|err| RunStoreError::Join(err.to_string()))?
    }

    async fn load_run(&self, run_id: &str) -> RunStoreResult<Option<WorkflowRun>> {
        let store = self.clone();
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || store.fetch(&run_id))
            .await
            .map_err(|err| RunStoreError::Join(err.to_string()))?
    }
}
