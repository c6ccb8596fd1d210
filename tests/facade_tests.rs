//! End-to-end tests through the control facade, against stubbed capture
//! devices. Cameras report no signal, so every path exercised here runs
//! the real supervisor loop without touching video hardware.

use std::sync::Arc;

use serde_json::Map;
use tempfile::TempDir;

use quadcast::caps::{PixelFormat, VideoCaps};
use quadcast::config::{AppConfig, load_config, verify_app_config};
use quadcast::engines::LifecycleState;
use quadcast::error::QuadcastError;
use quadcast::pipeline::spec::EncoderCatalog;
use quadcast::probe::{DeviceKind, ProbeReport, StubDeviceProbe};
use quadcast::scene::{Resolution, Scene, Slot, SourceType};
use quadcast::service::CaptureService;
use quadcast::supervisor::SceneApplied;

fn test_config(tmp: &TempDir) -> AppConfig {
    let toml = format!(
        r#"
        [global]
        media_server_url = "rtsp://127.0.0.1:8554"
        recording_root = "{root}/recordings"
        scenes_dir = "{root}/scenes"
        db_path = "{root}/quadcast.db"

        [[cameras]]
        id = "cam0"
        device = "/dev/video0"

        [[cameras]]
        id = "cam1"
        device = "/dev/video1"
        "#,
        root = tmp.path().display()
    );
    let path = tmp.path().join("quadcast.toml");
    std::fs::write(&path, toml).unwrap();
    let cfg = load_config(path.to_str().unwrap()).unwrap();
    verify_app_config(&cfg).unwrap();
    cfg
}

fn no_signal_report() -> ProbeReport {
    ProbeReport {
        exists: true,
        openable_exclusively: true,
        kind: DeviceKind::HdmiBridge,
        current_caps: Some(VideoCaps::new(0, 0, 0, PixelFormat::Unknown(0))),
        has_signal: false,
    }
}

fn service_with_dark_cameras(tmp: &TempDir) -> (CaptureService, Arc<StubDeviceProbe>) {
    let probe = Arc::new(StubDeviceProbe::new());
    probe.set_report("/dev/video0", no_signal_report());
    probe.set_report("/dev/video1", no_signal_report());

    let service = CaptureService::new(
        test_config(tmp),
        probe.clone(),
        Some(EncoderCatalog::software_only()),
    )
    .unwrap();
    (service, probe)
}

#[test]
fn start_without_signal_parks_in_no_signal_and_creates_no_pipeline() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    let snapshot = facade.start_ingest("cam0").unwrap();
    assert_eq!(snapshot.state, LifecycleState::NoSignal);
    assert!(!snapshot.signal);
    assert!(snapshot.buffer_age_ms.is_none(), "no pipeline, no buffers");

    // Re-issuing the start is a success, still parked.
    let again = facade.start_ingest("cam0").unwrap();
    assert_eq!(again.state, LifecycleState::NoSignal);
}

#[test]
fn unknown_camera_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    assert!(matches!(
        facade.start_ingest("cam9"),
        Err(QuadcastError::NotFound(_))
    ));
    assert!(matches!(
        facade.stop_record("cam9"),
        Err(QuadcastError::NotFound(_))
    ));
}

#[test]
fn status_reports_every_camera_and_the_device_table() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    facade.start_ingest("cam0").unwrap();
    facade.start_ingest("cam1").unwrap();

    let report = facade.get_status().unwrap();
    assert_eq!(report.cameras.len(), 2);
    assert!(report
        .cameras
        .iter()
        .all(|c| c.state == LifecycleState::NoSignal));
    assert_eq!(report.devices.len(), 2);
    // Parked engines own no device.
    assert!(report.devices.iter().all(|d| d.owner.is_none()));
    assert_eq!(report.mixer.state, LifecycleState::Idle);
}

#[test]
fn scene_crud_round_trips_through_the_facade() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    // Built-ins were seeded for both cameras.
    let listed = facade.list_scenes().unwrap();
    assert!(listed.iter().any(|s| s.id == "quad"));
    assert!(listed.iter().any(|s| s.id == "cam1_full"));

    let mut scene = Scene {
        id: "custom".to_string(),
        label: "Custom".to_string(),
        resolution: Resolution {
            width: 1280,
            height: 720,
        },
        slots: vec![Slot {
            source: "cam0".to_string(),
            source_type: SourceType::Camera,
            x: 0.1,
            y: 0.1,
            w: 0.8,
            h: 0.8,
            z: 1,
            alpha: 0.9,
            crop: None,
            looping: None,
            hold: None,
            extra: Map::new(),
        }],
        extra: Map::new(),
    };
    scene
        .extra
        .insert("operator".to_string(), serde_json::json!("alex"));

    let stored = facade.put_scene(scene.clone()).unwrap();
    assert_eq!(stored.id, "custom");

    let fetched = facade.get_scene("custom").unwrap();
    assert_eq!(fetched, stored, "get(put(s)) must be semantically equal");
    assert_eq!(fetched.extra["operator"], "alex");

    facade.delete_scene("custom").unwrap();
    assert!(matches!(
        facade.get_scene("custom"),
        Err(QuadcastError::NotFound(_))
    ));
}

#[test]
fn scene_with_unknown_camera_is_invalid_argument() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    let scene = Scene {
        id: "bad".to_string(),
        label: "Bad".to_string(),
        resolution: Resolution {
            width: 1920,
            height: 1080,
        },
        slots: vec![Slot {
            source: "cam9".to_string(),
            source_type: SourceType::Camera,
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
            z: 0,
            alpha: 1.0,
            crop: None,
            looping: None,
            hold: None,
            extra: Map::new(),
        }],
        extra: Map::new(),
    };

    assert!(matches!(
        facade.put_scene(scene),
        Err(QuadcastError::InvalidArgument(_))
    ));

    // Mixer untouched by the failed request.
    let mixer = facade.get_mixer_status().unwrap();
    assert_eq!(mixer.state, LifecycleState::Idle);
    assert!(mixer.scene.is_none());
}

#[test]
fn apply_stores_scene_when_mixer_is_stopped_and_guards_deletion() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    assert!(matches!(
        facade.apply_scene("nope"),
        Err(QuadcastError::NotFound(_))
    ));

    let applied = facade.apply_scene("quad").unwrap();
    assert_eq!(applied, SceneApplied::Stored);

    let mixer = facade.get_mixer_status().unwrap();
    assert_eq!(mixer.scene.as_deref(), Some("quad"));

    // The applied scene cannot be deleted; the store is unchanged.
    assert!(matches!(
        facade.delete_scene("quad"),
        Err(QuadcastError::SceneInUse(_))
    ));
    assert!(facade.list_scenes().unwrap().iter().any(|s| s.id == "quad"));

    // Applying the same scene twice is equivalent to applying it once.
    let again = facade.apply_scene("quad").unwrap();
    assert_eq!(again, SceneApplied::Stored);
}

#[test]
fn recorder_status_is_idle_without_a_recording() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    let status = facade.record_status("cam0").unwrap();
    assert_eq!(status.state, LifecycleState::Idle);
    assert!(status.file.is_none());
    assert_eq!(status.bytes_written, 0);

    assert!(matches!(
        facade.stop_record("cam0"),
        Err(QuadcastError::NotFound(_))
    ));

    // Branched recording on a camera with no signal refuses with the
    // dedicated no-signal error.
    assert!(matches!(
        facade.start_record("cam0"),
        Err(QuadcastError::DeviceNoSignal(_))
    ));
}

#[test]
fn stop_ingest_is_idempotent_and_lands_in_idle() {
    let tmp = TempDir::new().unwrap();
    let (service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();

    facade.start_ingest("cam0").unwrap();
    let stopped = facade.stop_ingest("cam0").unwrap();
    assert_eq!(stopped.state, LifecycleState::Idle);

    let again = facade.stop_ingest("cam0").unwrap();
    assert_eq!(again.state, LifecycleState::Idle);
}

#[test]
fn graceful_shutdown_completes() {
    let tmp = TempDir::new().unwrap();
    let (mut service, _probe) = service_with_dark_cameras(&tmp);
    let facade = service.facade();
    facade.start_ingest("cam0").unwrap();

    service.shutdown().unwrap();
}
