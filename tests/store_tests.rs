use serde_json::Map;
use tempfile::TempDir;

use quadcast::scene::{Resolution, Scene, Slot, SourceType};
use quadcast::scene_store::SceneStore;

fn cameras() -> Vec<String> {
    vec![
        "cam0".to_string(),
        "cam1".to_string(),
        "cam2".to_string(),
        "cam3".to_string(),
    ]
}

fn make_scene(id: &str) -> Scene {
    Scene {
        id: id.to_string(),
        label: format!("Scene {id}"),
        resolution: Resolution {
            width: 1280,
            height: 720,
        },
        slots: vec![Slot {
            source: "cam0".to_string(),
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
    }
}

#[test]
fn first_run_seeds_builtin_scenes() {
    let tmp = TempDir::new().unwrap();
    let store = SceneStore::open(tmp.path(), &cameras()).unwrap();

    let ids: Vec<&str> = store.list().iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"quad"));
    assert!(ids.contains(&"cam0_full"));
    assert!(ids.contains(&"cam3_full"));
    assert!(ids.contains(&"side_by_side"));
    assert!(ids.contains(&"pip"));

    let quad = store.get("quad").unwrap();
    assert_eq!(quad.slots.len(), 4);
}

#[test]
fn listing_preserves_insertion_order_across_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let mut store = SceneStore::open(tmp.path(), &cameras()).unwrap();
        store.put(make_scene("zeta")).unwrap();
        store.put(make_scene("alpha")).unwrap();
    }

    let store = SceneStore::open(tmp.path(), &cameras()).unwrap();
    let ids: Vec<&str> = store.list().iter().map(|s| s.id.as_str()).collect();

    // Custom scenes keep the order they were created in, after the seeds.
    let zeta = ids.iter().position(|&s| s == "zeta").unwrap();
    let alpha = ids.iter().position(|&s| s == "alpha").unwrap();
    assert!(zeta < alpha, "zeta was inserted before alpha");
}

#[test]
fn update_keeps_listing_position() {
    let tmp = TempDir::new().unwrap();
    let mut store = SceneStore::open(tmp.path(), &cameras()).unwrap();

    store.put(make_scene("first")).unwrap();
    store.put(make_scene("second")).unwrap();

    let before: Vec<String> = store.list().iter().map(|s| s.id.clone()).collect();

    let mut updated = make_scene("first");
    updated.label = "renamed".to_string();
    store.put(updated).unwrap();

    let after: Vec<String> = store.list().iter().map(|s| s.id.clone()).collect();
    assert_eq!(before, after, "overwriting must not reorder the listing");
    assert_eq!(store.get("first").unwrap().label, "renamed");
}

#[test]
fn delete_removes_scene_and_file() {
    let tmp = TempDir::new().unwrap();
    let mut store = SceneStore::open(tmp.path(), &cameras()).unwrap();

    store.put(make_scene("doomed")).unwrap();
    assert!(tmp.path().join("doomed.json").exists());

    store.delete("doomed").unwrap();
    assert!(!tmp.path().join("doomed.json").exists());
    assert!(store.get("doomed").is_err());
    assert!(store.delete("doomed").is_err(), "double delete is NotFound");
}

#[test]
fn builtin_scenes_can_be_overwritten() {
    let tmp = TempDir::new().unwrap();
    let mut store = SceneStore::open(tmp.path(), &cameras()).unwrap();

    let mut quad = store.get("quad").unwrap().clone();
    quad.label = "my quad".to_string();
    store.put(quad).unwrap();

    assert_eq!(store.get("quad").unwrap().label, "my quad");

    // And the overwrite survives reopen.
    drop(store);
    let store = SceneStore::open(tmp.path(), &cameras()).unwrap();
    assert_eq!(store.get("quad").unwrap().label, "my quad");
}

#[test]
fn unknown_keys_survive_the_store() {
    let tmp = TempDir::new().unwrap();
    let mut store = SceneStore::open(tmp.path(), &cameras()).unwrap();

    let mut scene = make_scene("annotated");
    scene
        .extra
        .insert("revision".to_string(), serde_json::json!(7));
    store.put(scene).unwrap();

    drop(store);
    let store = SceneStore::open(tmp.path(), &cameras()).unwrap();
    assert_eq!(store.get("annotated").unwrap().extra["revision"], 7);
}
