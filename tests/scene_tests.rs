use quadcast::caps::{PixelFormat, VideoCaps};
use quadcast::error::QuadcastError;
use quadcast::scene::{
    CameraResolveState, ResolveContext, Resolution, Scene, SceneContext, Slot, SourceBranch,
    SourceType, resolve,
};
use serde_json::Map;

fn camera_ids() -> Vec<String> {
    vec!["cam0".to_string(), "cam1".to_string()]
}

fn publish_paths() -> Vec<String> {
    vec!["/cam0".to_string(), "/cam1".to_string()]
}

fn make_slot(source: &str, x: f64, y: f64, w: f64, h: f64) -> Slot {
    Slot {
        source: source.to_string(),
        source_type: SourceType::Camera,
        x,
        y,
        w,
        h,
        z: 0,
        alpha: 1.0,
        crop: None,
        looping: None,
        hold: None,
        extra: Map::new(),
    }
}

fn make_scene(id: &str, slots: Vec<Slot>) -> Scene {
    Scene {
        id: id.to_string(),
        label: format!("Scene {id}"),
        resolution: Resolution {
            width: 1920,
            height: 1080,
        },
        slots,
        extra: Map::new(),
    }
}

fn resolve_cameras() -> Vec<CameraResolveState> {
    vec![
        CameraResolveState {
            id: "cam0".to_string(),
            device: "/dev/video0".to_string(),
            publish_url: "rtsp://127.0.0.1:8554/cam0".to_string(),
            running: true,
            observed_caps: Some(VideoCaps::new(1920, 1080, 30, PixelFormat::Nv12)),
        },
        CameraResolveState {
            id: "cam1".to_string(),
            device: "/dev/video1".to_string(),
            publish_url: "rtsp://127.0.0.1:8554/cam1".to_string(),
            running: false,
            observed_caps: None,
        },
    ]
}

#[test]
fn json_round_trip_preserves_unknown_keys() {
    let json = r#"
    {
      "id": "quad",
      "label": "4-up grid",
      "resolution": { "width": 1920, "height": 1080 },
      "vendor_hint": { "theme": "dark" },
      "slots": [
        {
          "source": "cam0", "source_type": "camera",
          "x": 0.0, "y": 0.0, "w": 0.5, "h": 0.5,
          "z": 0, "alpha": 1.0,
          "operator_note": "stage left"
        }
      ]
    }"#;

    let scene: Scene = serde_json::from_str(json).unwrap();
    assert_eq!(scene.extra["vendor_hint"]["theme"], "dark");
    assert_eq!(scene.slots[0].extra["operator_note"], "stage left");

    let out = serde_json::to_string(&scene).unwrap();
    let reparsed: Scene = serde_json::from_str(&out).unwrap();
    assert_eq!(scene, reparsed);

    // Value-level comparison: nothing dropped, nothing invented.
    let original: serde_json::Value = serde_json::from_str(json).unwrap();
    let round_tripped: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(original, round_tripped);
}

#[test]
fn validation_clamps_out_of_range_geometry() {
    let ids = camera_ids();
    let paths = publish_paths();
    let ctx = SceneContext {
        camera_ids: &ids,
        publish_paths: &paths,
    };

    let mut scene = make_scene("clamped", vec![make_slot("cam0", -0.25, 0.5, 0.9, 2.0)]);
    scene.slots[0].alpha = 1.7;

    let normalized = scene.validate(&ctx).unwrap();
    let slot = &normalized.slots[0];
    assert_eq!(slot.x, 0.0);
    assert_eq!(slot.y, 0.5);
    assert!(slot.w <= 1.0 && slot.w >= 0.0);
    assert!(slot.h <= 0.5, "height must be clamped to fit below y");
    assert_eq!(slot.alpha, 1.0);
}

#[test]
fn validation_rejects_structural_problems() {
    let ids = camera_ids();
    let paths = publish_paths();
    let ctx = SceneContext {
        camera_ids: &ids,
        publish_paths: &paths,
    };

    // Unknown camera
    let scene = make_scene("bad", vec![make_slot("cam9", 0.0, 0.0, 1.0, 1.0)]);
    assert!(matches!(
        scene.validate(&ctx),
        Err(QuadcastError::InvalidArgument(_))
    ));

    // No slots
    let scene = make_scene("empty", vec![]);
    assert!(scene.validate(&ctx).is_err());

    // Non-finite geometry
    let scene = make_scene("nan", vec![make_slot("cam0", f64::NAN, 0.0, 1.0, 1.0)]);
    assert!(scene.validate(&ctx).is_err());

    // Exact duplicate slots
    let scene = make_scene(
        "dup",
        vec![
            make_slot("cam0", 0.0, 0.0, 0.5, 0.5),
            make_slot("cam0", 0.0, 0.0, 0.5, 0.5),
        ],
    );
    assert!(scene.validate(&ctx).is_err());

    // Same source at different geometry is fine.
    let scene = make_scene(
        "twice",
        vec![
            make_slot("cam0", 0.0, 0.0, 0.5, 0.5),
            make_slot("cam0", 0.5, 0.5, 0.5, 0.5),
        ],
    );
    assert!(scene.validate(&ctx).is_ok());
}

#[test]
fn resolution_maps_running_and_parked_cameras() {
    let cameras = resolve_cameras();
    let ctx = ResolveContext {
        cameras: &cameras,
        media_server_url: "rtsp://127.0.0.1:8554",
        direct_capture: false,
    };

    let scene = make_scene(
        "pair",
        vec![
            make_slot("cam0", 0.0, 0.0, 0.5, 1.0),
            make_slot("cam1", 0.5, 0.0, 0.5, 1.0),
        ],
    );
    let resolved = resolve(&scene, &ctx).unwrap();

    assert_eq!(resolved.slots.len(), 2);
    assert_eq!(
        resolved.slots[0].branch,
        SourceBranch::MediaServer {
            url: "rtsp://127.0.0.1:8554/cam0".to_string()
        }
    );
    // cam1 is not running: black placeholder, not a capture.
    assert_eq!(
        resolved.slots[1].branch,
        SourceBranch::Placeholder {
            camera: "cam1".to_string()
        }
    );

    // Pixel geometry from relative units.
    assert_eq!(resolved.slots[0].rect.x, 0);
    assert_eq!(resolved.slots[0].rect.w, 960);
    assert_eq!(resolved.slots[1].rect.x, 960);
    assert_eq!(resolved.slots[0].rect.h, 1080);
}

#[test]
fn resolution_is_deterministic() {
    let cameras = resolve_cameras();
    let ctx = ResolveContext {
        cameras: &cameras,
        media_server_url: "rtsp://127.0.0.1:8554",
        direct_capture: false,
    };

    let scene = make_scene(
        "det",
        vec![
            make_slot("cam0", 0.0, 0.0, 0.5, 0.5),
            make_slot("cam1", 0.5, 0.0, 0.5, 0.5),
        ],
    );

    let a = resolve(&scene, &ctx).unwrap();
    let b = resolve(&scene, &ctx).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.source_set(), b.source_set());
}

#[test]
fn source_set_dedups_repeated_sources() {
    let cameras = resolve_cameras();
    let ctx = ResolveContext {
        cameras: &cameras,
        media_server_url: "rtsp://127.0.0.1:8554",
        direct_capture: false,
    };

    let scene = make_scene(
        "mirror",
        vec![
            make_slot("cam0", 0.0, 0.0, 0.5, 0.5),
            make_slot("cam0", 0.5, 0.5, 0.5, 0.5),
        ],
    );
    let resolved = resolve(&scene, &ctx).unwrap();
    assert_eq!(resolved.slots.len(), 2);
    assert_eq!(resolved.source_set().len(), 1, "one branch for one camera");
}

#[test]
fn crop_converts_to_source_pixel_margins() {
    let cameras = resolve_cameras();
    let ctx = ResolveContext {
        cameras: &cameras,
        media_server_url: "rtsp://127.0.0.1:8554",
        direct_capture: false,
    };

    let mut scene = make_scene("crop", vec![make_slot("cam0", 0.0, 0.0, 1.0, 1.0)]);
    scene.slots[0].crop = Some(quadcast::scene::CropRect {
        x: 0.25,
        y: 0.0,
        w: 0.5,
        h: 1.0,
    });

    let resolved = resolve(&scene, &ctx).unwrap();
    let crop = resolved.slots[0].crop.unwrap();
    assert_eq!(crop.left, 480);
    assert_eq!(crop.right, 480);
    assert_eq!(crop.top, 0);
    assert_eq!(crop.bottom, 0);
}
