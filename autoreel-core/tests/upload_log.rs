use std::path::PathBuf;

use autoreel_core::run::{Privacy, UploadRecord};
use autoreel_core::upload_log::UploadLogError;
use autoreel_core::{SqliteUploadLog, UploadLog, UploadLogEntry};
use chrono::{Duration, Utc};

fn entry(key: &str, video_id: &str, minutes_ago: i64) -> UploadLogEntry {
    UploadLogEntry {
        record: UploadRecord {
            video_id: video_id.into(),
            url: Some(format!("https://www.youtube.com/watch?v={video_id}")),
            title: format!("Upload {video_id}"),
            privacy: Privacy::Private,
            scheduled_publish_at: Some(Utc::now() + Duration::hours(2)),
            source_key: key.into(),
            script_id: None,
            uploaded_at: Utc::now() - Duration::minutes(minutes_ago),
        },
        original_file: PathBuf::from(format!("videos/{video_id}.mp4")),
        run_id: None,
    }
}

#[test]
fn history_is_listed_newest_first_and_readable_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data/uploads.sqlite");
    let log = SqliteUploadLog::new(&path);
    log.initialize().unwrap();

    log.append(&entry("key-old", "vidold", 30)).unwrap();
    log.append(&entry("key-new", "vidnew", 1)).unwrap();

    let reader = SqliteUploadLog::read_only(&path);
    let listed = reader.list(10).unwrap();
    let ids: Vec<&str> = listed.iter().map(|e| e.record.video_id.as_str()).collect();
    assert_eq!(ids, vec!["vidnew", "vidold"]);
    assert!(listed[0].record.scheduled_publish_at.is_some());
    assert_eq!(listed[1].original_file, PathBuf::from("videos/vidold.mp4"));
    assert_eq!(reader.list(1).unwrap().len(), 1);

    assert!(reader.append(&entry("key-3", "vid3", 0)).is_err());
}

#[test]
fn read_only_log_requires_an_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let reader = SqliteUploadLog::read_only(dir.path().join("missing.sqlite"));
    assert!(matches!(
        reader.list(5),
        Err(UploadLogError::OpenDatabase { .. })
    ));
}

#[tokio::test]
async fn async_append_reports_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let log = SqliteUploadLog::new(dir.path().join("uploads.sqlite"));
    log.initialize().unwrap();

    log.append_upload(&entry("key-1", "vid1", 0)).await.unwrap();
    let err = log
        .append_upload(&entry("key-1", "vid2", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadLogError::Conflict { .. }));

    let kept = log.find_upload("key-1").await.unwrap().unwrap();
    assert_eq!(kept.record.video_id, "vid1");
    assert!(log.find_upload("key-2").await.unwrap().is_none());
}
