use tempfile::TempDir;

use quadcast::db::RecordingsDb;

#[test]
fn it_creates_and_initializes_the_index() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("db.sqlite");

    let db = RecordingsDb::setup(&db_path).unwrap();
    assert_eq!(db.open_recording_count().unwrap(), 0);
    assert!(db.recent_for_camera("cam0", 10).unwrap().is_empty());
}

#[test]
fn recording_lifecycle_is_tracked() {
    let tmp = TempDir::new().unwrap();
    let db = RecordingsDb::setup(tmp.path().join("db.sqlite")).unwrap();

    db.insert_started("cam1", "/rec/cam1/a.mp4", "2026-08-01T10:00:00+00:00")
        .unwrap();
    assert_eq!(db.open_recording_count().unwrap(), 1);

    db.mark_finished("/rec/cam1/a.mp4", "2026-08-01T10:05:00+00:00", 123_456, false)
        .unwrap();
    assert_eq!(db.open_recording_count().unwrap(), 0);

    let rows = db.recent_for_camera("cam1", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, "/rec/cam1/a.mp4");
    assert_eq!(rows[0].bytes, 123_456);
    assert!(!rows[0].truncated);
    assert!(rows[0].finished_at.is_some());
}

#[test]
fn recent_listing_is_per_camera_and_newest_first() {
    let tmp = TempDir::new().unwrap();
    let db = RecordingsDb::setup(tmp.path().join("db.sqlite")).unwrap();

    db.insert_started("cam0", "/rec/cam0/old.mp4", "2026-08-01T09:00:00+00:00")
        .unwrap();
    db.insert_started("cam0", "/rec/cam0/new.mp4", "2026-08-01T11:00:00+00:00")
        .unwrap();
    db.insert_started("cam1", "/rec/cam1/other.mp4", "2026-08-01T10:00:00+00:00")
        .unwrap();

    let rows = db.recent_for_camera("cam0", 10).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].path, "/rec/cam0/new.mp4");
    assert_eq!(rows[1].path, "/rec/cam0/old.mp4");

    let limited = db.recent_for_camera("cam0", 1).unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn reopen_marks_dangling_rows_truncated() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("db.sqlite");

    {
        let db = RecordingsDb::setup(&db_path).unwrap();
        db.insert_started("cam2", "/rec/cam2/crashed.mp4", "2026-08-01T12:00:00+00:00")
            .unwrap();
        // Process "crashes" here: no mark_finished.
    }

    let db = RecordingsDb::setup(&db_path).unwrap();
    assert_eq!(db.open_recording_count().unwrap(), 0);

    let rows = db.recent_for_camera("cam2", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].truncated, "dangling row must be marked truncated");
}

#[test]
fn restarting_the_same_path_resets_the_row() {
    let tmp = TempDir::new().unwrap();
    let db = RecordingsDb::setup(tmp.path().join("db.sqlite")).unwrap();

    db.insert_started("cam0", "/rec/cam0/a.mp4", "2026-08-01T10:00:00+00:00")
        .unwrap();
    db.mark_finished("/rec/cam0/a.mp4", "2026-08-01T10:01:00+00:00", 10, true)
        .unwrap();

    // Same path recorded again: row is reused, counters reset.
    db.insert_started("cam0", "/rec/cam0/a.mp4", "2026-08-01T11:00:00+00:00")
        .unwrap();
    let rows = db.recent_for_camera("cam0", 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].finished_at.is_none());
    assert!(!rows[0].truncated);
    assert_eq!(rows[0].bytes, 0);
}
