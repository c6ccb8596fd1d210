use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{QuadcastError, Result};
use crate::scene::{Scene, SceneContext, builtin_scenes};

const ORDER_FILE: &str = "order.json";

/// Persistent scene storage: one JSON file per scene id plus a sidecar
/// insertion-order index. Scene files stay byte-round-trippable; the order
/// lives outside them.
pub struct SceneStore {
    dir: PathBuf,
    order: Vec<String>,
    scenes: HashMap<String, Scene>,
}

impl SceneStore {
    /// Open the store, loading every scene listed in the order index. On
    /// first run (no index), seed the built-in scenes for the configured
    /// cameras.
    pub fn open(dir: impl Into<PathBuf>, camera_ids: &[String]) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut store = Self {
            dir,
            order: Vec::new(),
            scenes: HashMap::new(),
        };

        let order_path = store.dir.join(ORDER_FILE);
        if order_path.exists() {
            store.load(&order_path)?;
        } else {
            info!(dir = %store.dir.display(), "Empty scene store, seeding built-in scenes");
            for scene in builtin_scenes(camera_ids) {
                store.put(scene)?;
            }
        }

        Ok(store)
    }

    fn load(&mut self, order_path: &Path) -> Result<()> {
        let text = fs::read_to_string(order_path)?;
        let order: Vec<String> = serde_json::from_str(&text)?;

        for id in order {
            let path = self.scene_path(&id);
            match fs::read_to_string(&path) {
                Ok(json) => {
                    let scene: Scene = serde_json::from_str(&json)?;
                    self.scenes.insert(id.clone(), scene);
                    self.order.push(id);
                }
                Err(err) => {
                    // A missing file for an indexed id is tolerated so one
                    // deleted-by-hand scene does not take the store down.
                    warn!(scene = %id, %err, "Indexed scene file unreadable, skipping");
                }
            }
        }
        Ok(())
    }

    fn scene_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn persist_order(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.order)?;
        fs::write(self.dir.join(ORDER_FILE), text)?;
        Ok(())
    }

    /// Scene ids in insertion order.
    pub fn list(&self) -> Vec<&Scene> {
        self.order
            .iter()
            .filter_map(|id| self.scenes.get(id))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<&Scene> {
        self.scenes
            .get(id)
            .ok_or_else(|| QuadcastError::NotFound(format!("scene '{id}'")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scenes.contains_key(id)
    }

    /// Create or overwrite. New ids append to the listing order; existing
    /// ids keep their position.
    pub fn put(&mut self, scene: Scene) -> Result<()> {
        let json = serde_json::to_string_pretty(&scene)?;
        fs::write(self.scene_path(&scene.id), json)?;

        if !self.order.contains(&scene.id) {
            self.order.push(scene.id.clone());
            self.persist_order()?;
        }
        self.scenes.insert(scene.id.clone(), scene);
        Ok(())
    }

    /// Remove a scene. The caller (supervisor) is responsible for refusing
    /// deletion of the scene currently applied to the mixer.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        if !self.scenes.contains_key(id) {
            return Err(QuadcastError::NotFound(format!("scene '{id}'")));
        }

        fs::remove_file(self.scene_path(id))?;
        self.scenes.remove(id);
        self.order.retain(|s| s != id);
        self.persist_order()?;
        Ok(())
    }

    /// Validate against the live context and persist the normalized scene.
    pub fn put_validated(&mut self, scene: &Scene, ctx: &SceneContext<'_>) -> Result<Scene> {
        let normalized = scene.validate(ctx)?;
        self.put(normalized.clone())?;
        Ok(normalized)
    }
}
