use autoreel_core::run::{RunFailure, RunStoreError, ScriptArtifact};
use autoreel_core::{
    InitialInput, RunStateStore, RunStatus, SqliteRunStore, StageArtifact, StageKind, StageResult,
    WorkflowMode, WorkflowRun,
};
use chrono::{Duration, Utc};

fn setup_store(dir: &tempfile::TempDir) -> SqliteRunStore {
    let store = SqliteRunStore::builder()
        .path(dir.path().join("state/runs.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    store
}

fn topic_run(mode: WorkflowMode) -> WorkflowRun {
    WorkflowRun::new(
        mode,
        InitialInput::Topic {
            topic: "AI Facts".into(),
        },
    )
}

fn script_result() -> StageResult {
    StageResult {
        stage: StageKind::Script,
        artifact: StageArtifact::Script(ScriptArtifact::new(
            Some("AI Facts".into()),
            "AI learns from data.".into(),
            "AI Facts".into(),
            "Quick facts.".into(),
            vec!["ai".into(), "facts".into()],
        )),
        provider: Some(autoreel_core::ProviderKind::Template),
        attempts: Vec::new(),
        completed_at: Utc::now(),
    }
}

#[test]
fn run_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir);

    let mut run = topic_run(WorkflowMode::FullAuto);
    run.status = RunStatus::Running;
    store.save(&run).unwrap();

    run.results.push(script_result());
    run.stage_index = 1;
    run.status = RunStatus::Failed;
    run.failure = Some(RunFailure {
        stage: StageKind::Video,
        error_kind: "providers_exhausted".into(),
        message: "all video providers failed".into(),
        attempts: 4,
        failed_at: Utc::now(),
    });
    run.touch();
    store.save(&run).unwrap();

    let reopened = setup_store(&dir);
    let loaded = reopened.load(&run.run_id).unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert_eq!(loaded.stage_index, 1);
    assert_eq!(loaded.current_stage(), Some(StageKind::Video));
    assert_eq!(loaded.results, run.results);
    assert_eq!(loaded.failure, run.failure);
    assert_eq!(loaded.input, run.input);
    assert_eq!(reopened.list(None, 10).unwrap().len(), 1);
}

#[test]
fn missing_run_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir);
    assert!(store.fetch("run-missing").unwrap().is_none());
    assert!(matches!(
        store.load("run-missing"),
        Err(RunStoreError::NotFound { .. })
    ));
}

#[test]
fn list_filters_by_status_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir);
    let now = Utc::now();

    for (offset, status) in [
        (3, RunStatus::Completed),
        (2, RunStatus::Paused),
        (1, RunStatus::Completed),
    ] {
        let mut run = topic_run(WorkflowMode::ScriptOnly);
        run.status = status;
        run.updated_at = now - Duration::minutes(offset);
        store.save(&run).unwrap();
    }

    let completed = store.list(Some(RunStatus::Completed), 10).unwrap();
    assert_eq!(completed.len(), 2);
    assert!(completed[0].updated_at > completed[1].updated_at);

    let newest = store.list(None, 1).unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].status, RunStatus::Completed);
    assert_eq!(store.list(Some(RunStatus::Paused), 10).unwrap().len(), 1);
}

#[test]
fn inconsistent_stage_index_is_reported_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir);
    let run = topic_run(WorkflowMode::FullAuto);
    store.save(&run).unwrap();

    let conn = rusqlite::Connection::open(store.path()).unwrap();
    conn.execute(
        "UPDATE workflow_runs SET stage_index = 2 WHERE run_id = ?1",
        [&run.run_id],
    )
    .unwrap();

    match store.fetch(&run.run_id) {
        Err(RunStoreError::Corrupt { column, .. }) => assert_eq!(column, "stage_index"),
        other => panic!("expected corrupt row, got {other:?}"),
    }
}

#[tokio::test]
async fn async_view_round_trips_through_blocking_pool() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir);
    let mut run = topic_run(WorkflowMode::ScriptAndVideo);
    run.status = RunStatus::Paused;

    store.save_run(&run).await.unwrap();
    let loaded = store.load_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(loaded.run_id, run.run_id);
    assert_eq!(loaded.mode, WorkflowMode::ScriptAndVideo);
    assert!(loaded.status.resumable());
    assert!(store.load_run("run-missing").await.unwrap().is_none());
}
