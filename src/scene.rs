use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::caps::VideoCaps;
use crate::error::{QuadcastError, Result};

/// Test-source patterns accepted for `source_type = "graphic"` slots.
pub const KNOWN_GRAPHICS: &[&str] = &["black", "white", "smpte", "snow", "ball"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Relative crop rectangle in source-frame units, [0,1] on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Camera,
    FileVideo,
    StillImage,
    Graphic,
    MediaServerPath,
}

/// One entry in a scene: a positioned, sized, z-ordered source reference.
///
/// Unknown keys are kept in `extra` and written back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub source: String,
    pub source_type: SourceType,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub z: i32,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropRect>,
    /// File-video slots only: restart the file at EOS.
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub looping: Option<bool>,
    /// Still-image slots only: hold duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_alpha() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub label: String,
    pub resolution: Resolution,
    pub slots: Vec<Slot>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What scene validation needs to know about the world: which cameras are
/// configured, and which media-server paths the service publishes.
pub struct SceneContext<'a> {
    pub camera_ids: &'a [String],
    pub publish_paths: &'a [String],
}

impl Scene {
    /// Validate and normalize: geometry and alpha are clamped into range
    /// (with a log line), structural problems are errors. Returns the
    /// normalized scene the store should persist.
    pub fn validate(&self, ctx: &SceneContext<'_>) -> Result<Scene> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(QuadcastError::InvalidArgument(format!(
                "scene id '{}' is not a valid identifier",
                self.id
            )));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(QuadcastError::InvalidArgument(format!(
                "scene '{}' has a zero output resolution",
                self.id
            )));
        }
        if self.slots.is_empty() {
            return Err(QuadcastError::InvalidArgument(format!(
                "scene '{}' has no slots",
                self.id
            )));
        }

        let mut normalized = self.clone();
        for (idx, slot) in normalized.slots.iter_mut().enumerate() {
            for (name, v) in [
                ("x", slot.x),
                ("y", slot.y),
                ("w", slot.w),
                ("h", slot.h),
                ("alpha", slot.alpha),
            ] {
                if !v.is_finite() {
                    return Err(QuadcastError::InvalidArgument(format!(
                        "scene '{}' slot {} has non-finite {}",
                        self.id, idx, name
                    )));
                }
            }

            let clamped = clamp_slot_geometry(slot);
            if clamped {
                warn!(
                    scene = %self.id,
                    slot = idx,
                    source = %slot.source,
                    "Slot geometry out of range, clamped into [0,1]"
                );
            }

            if let Some(crop) = &slot.crop {
                if ![crop.x, crop.y, crop.w, crop.h].iter().all(|v| v.is_finite())
                    || crop.w <= 0.0
                    || crop.h <= 0.0
                {
                    return Err(QuadcastError::InvalidArgument(format!(
                        "scene '{}' slot {} has an invalid crop rectangle",
                        self.id, idx
                    )));
                }
            }

            match slot.source_type {
                SourceType::Camera => {
                    if !ctx.camera_ids.contains(&slot.source) {
                        return Err(QuadcastError::InvalidArgument(format!(
                            "scene '{}' references unknown camera '{}'",
                            self.id, slot.source
                        )));
                    }
                }
                SourceType::FileVideo | SourceType::StillImage => {
                    if !Path::new(&slot.source).exists() {
                        return Err(QuadcastError::InvalidArgument(format!(
                            "scene '{}' references missing file '{}'",
                            self.id, slot.source
                        )));
                    }
                }
                SourceType::Graphic => {
                    if !KNOWN_GRAPHICS.contains(&slot.source.as_str()) {
                        return Err(QuadcastError::InvalidArgument(format!(
                            "scene '{}' references unknown graphic '{}'",
                            self.id, slot.source
                        )));
                    }
                }
                SourceType::MediaServerPath => {
                    if !slot.source.starts_with('/')
                        && !ctx.publish_paths.contains(&slot.source)
                    {
                        return Err(QuadcastError::InvalidArgument(format!(
                            "scene '{}' references unknown media-server path '{}'",
                            self.id, slot.source
                        )));
                    }
                }
            }
        }

        // Reject exact duplicates; two slots showing the same source at
        // different geometry are legal and share one upstream branch.
        for i in 0..normalized.slots.len() {
            for j in (i + 1)..normalized.slots.len() {
                let (a, b) = (&normalized.slots[i], &normalized.slots[j]);
                if a.source == b.source
                    && a.source_type == b.source_type
                    && a.x == b.x
                    && a.y == b.y
                    && a.w == b.w
                    && a.h == b.h
                    && a.z == b.z
                {
                    return Err(QuadcastError::InvalidArgument(format!(
                        "scene '{}' has duplicate slots {} and {}",
                        self.id, i, j
                    )));
                }
            }
        }

        Ok(normalized)
    }
}

/// Clamp x/y/w/h/alpha into [0,1] and keep the rect inside the canvas.
/// Returns whether anything moved.
fn clamp_slot_geometry(slot: &mut Slot) -> bool {
    let before = (slot.x, slot.y, slot.w, slot.h, slot.alpha);
    slot.x = slot.x.clamp(0.0, 1.0);
    slot.y = slot.y.clamp(0.0, 1.0);
    slot.w = slot.w.clamp(0.0, 1.0 - slot.x);
    slot.h = slot.h.clamp(0.0, 1.0 - slot.y);
    slot.alpha = slot.alpha.clamp(0.0, 1.0);
    before != (slot.x, slot.y, slot.w, slot.h, slot.alpha)
}

////////////////////////////////////////////////////////////////////////////////
// Resolution to concrete pipeline sources
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

/// A slot source mapped to the concrete branch the mixer will build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceBranch {
    /// Consume the camera's (or an arbitrary) publish stream back from the
    /// media server.
    MediaServer { url: String },
    /// Camera is parked (no signal / idle / error): black slot.
    Placeholder { camera: String },
    /// Direct V4L2 capture; only when configured, and subject to the
    /// supervisor's device-ownership check.
    DirectCapture { device: String, caps: VideoCaps },
    FileVideo { path: String, looping: bool },
    StillImage { path: String, hold_ms: u64 },
    Graphic { pattern: String },
}

impl SourceBranch {
    /// Stable identity used for branch dedup and compositor pad mapping.
    pub fn key(&self) -> String {
        match self {
            Self::MediaServer { url } => format!("ms:{url}"),
            Self::Placeholder { camera } => format!("ph:{camera}"),
            Self::DirectCapture { device, .. } => format!("dev:{device}"),
            Self::FileVideo { path, .. } => format!("file:{path}"),
            Self::StillImage { path, .. } => format!("img:{path}"),
            Self::Graphic { pattern } => format!("gfx:{pattern}"),
        }
    }
}

/// Crop expressed as pixel margins off each source edge, the way
/// `videocrop` wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropMargins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSlot {
    pub branch: SourceBranch,
    pub rect: PixelRect,
    pub z: i32,
    pub alpha: f64,
    /// Crop margins, only when the source geometry is known.
    pub crop: Option<CropMargins>,
}

/// A scene with every source mapped to a concrete branch and every
/// geometry converted to output pixels. Resolution is deterministic:
/// semantically equal scenes against the same camera states produce equal
/// values, so the mixer can compare cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScene {
    pub scene_id: String,
    pub width: u32,
    pub height: u32,
    pub slots: Vec<ResolvedSlot>,
}

impl ResolvedScene {
    /// The distinct upstream branches, by stable key.
    pub fn source_set(&self) -> BTreeSet<String> {
        self.slots.iter().map(|s| s.branch.key()).collect()
    }
}

/// Per-camera facts resolution needs, captured from engine runtime by the
/// supervisor at apply time.
#[derive(Debug, Clone)]
pub struct CameraResolveState {
    pub id: String,
    pub device: String,
    pub publish_url: String,
    pub running: bool,
    pub observed_caps: Option<VideoCaps>,
}

pub struct ResolveContext<'a> {
    pub cameras: &'a [CameraResolveState],
    /// Base URL used for `media_server_path` slots.
    pub media_server_url: &'a str,
    pub direct_capture: bool,
}

pub fn resolve(scene: &Scene, ctx: &ResolveContext<'_>) -> Result<ResolvedScene> {
    let out_w = scene.resolution.width;
    let out_h = scene.resolution.height;
    let mut slots = Vec::with_capacity(scene.slots.len());

    for slot in &scene.slots {
        let (branch, source_caps) = resolve_branch(slot, ctx)?;

        let rect = PixelRect {
            x: (slot.x * out_w as f64).round() as i32,
            y: (slot.y * out_h as f64).round() as i32,
            w: (slot.w * out_w as f64).round().max(1.0) as u32,
            h: (slot.h * out_h as f64).round().max(1.0) as u32,
        };

        let crop = match (&slot.crop, source_caps) {
            (Some(c), Some(caps)) => {
                let left = (c.x.clamp(0.0, 1.0) * caps.width as f64).round() as u32;
                let top = (c.y.clamp(0.0, 1.0) * caps.height as f64).round() as u32;
                let w = (c.w.clamp(0.0, 1.0) * caps.width as f64).round() as u32;
                let h = (c.h.clamp(0.0, 1.0) * caps.height as f64).round() as u32;
                Some(CropMargins {
                    left,
                    top,
                    right: caps.width.saturating_sub(left + w),
                    bottom: caps.height.saturating_sub(top + h),
                })
            }
            (Some(_), None) => {
                warn!(
                    scene = %scene.id,
                    source = %slot.source,
                    "Crop requested but source geometry unknown, ignoring"
                );
                None
            }
            (None, _) => None,
        };

        slots.push(ResolvedSlot {
            branch,
            rect,
            z: slot.z,
            alpha: slot.alpha.clamp(0.0, 1.0),
            crop,
        });
    }

    Ok(ResolvedScene {
        scene_id: scene.id.clone(),
        width: out_w,
        height: out_h,
        slots,
    })
}

fn resolve_branch(
    slot: &Slot,
    ctx: &ResolveContext<'_>,
) -> Result<(SourceBranch, Option<VideoCaps>)> {
    match slot.source_type {
        SourceType::Camera => {
            let cam = ctx
                .cameras
                .iter()
                .find(|c| c.id == slot.source)
                .ok_or_else(|| {
                    QuadcastError::InvalidArgument(format!(
                        "unknown camera '{}' in scene slot",
                        slot.source
                    ))
                })?;

            if cam.running {
                Ok((
                    SourceBranch::MediaServer {
                        url: cam.publish_url.clone(),
                    },
                    cam.observed_caps,
                ))
            } else if ctx.direct_capture && cam.observed_caps.is_some() {
                let caps = cam.observed_caps.unwrap();
                Ok((
                    SourceBranch::DirectCapture {
                        device: cam.device.clone(),
                        caps,
                    },
                    Some(caps),
                ))
            } else {
                Ok((
                    SourceBranch::Placeholder {
                        camera: cam.id.clone(),
                    },
                    None,
                ))
            }
        }
        SourceType::FileVideo => Ok((
            SourceBranch::FileVideo {
                path: slot.source.clone(),
                looping: slot.looping.unwrap_or(false),
            },
            None,
        )),
        SourceType::StillImage => Ok((
            SourceBranch::StillImage {
                path: slot.source.clone(),
                hold_ms: (slot.hold.unwrap_or(0.0).max(0.0) * 1000.0) as u64,
            },
            None,
        )),
        SourceType::Graphic => Ok((
            SourceBranch::Graphic {
                pattern: slot.source.clone(),
            },
            None,
        )),
        SourceType::MediaServerPath => Ok((
            SourceBranch::MediaServer {
                url: format!(
                    "{}{}",
                    ctx.media_server_url.trim_end_matches('/'),
                    slot.source
                ),
            },
            None,
        )),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Built-in scenes
////////////////////////////////////////////////////////////////////////////////

fn camera_slot(id: &str, x: f64, y: f64, w: f64, h: f64, z: i32) -> Slot {
    Slot {
        source: id.to_string(),
        source_type: SourceType::Camera,
        x,
        y,
        w,
        h,
        z,
        alpha: 1.0,
        crop: None,
        looping: None,
        hold: None,
        extra: Map::new(),
    }
}

/// The scenes seeded into an empty store: quad grid, one full-screen scene
/// per camera, side-by-side of the first two, picture-in-picture.
pub fn builtin_scenes(camera_ids: &[String]) -> Vec<Scene> {
    let resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    let mut scenes = Vec::new();

    let quad_cells = [
        (0.0, 0.0),
        (0.5, 0.0),
        (0.0, 0.5),
        (0.5, 0.5),
    ];
    let quad_slots: Vec<Slot> = camera_ids
        .iter()
        .take(4)
        .zip(quad_cells.iter())
        .map(|(id, (x, y))| camera_slot(id, *x, *y, 0.5, 0.5, 0))
        .collect();
    if !quad_slots.is_empty() {
        scenes.push(Scene {
            id: "quad".to_string(),
            label: "4-up grid".to_string(),
            resolution,
            slots: quad_slots,
            extra: Map::new(),
        });
    }

    for id in camera_ids {
        scenes.push(Scene {
            id: format!("{id}_full"),
            label: format!("{id} full screen"),
            resolution,
            slots: vec![camera_slot(id, 0.0, 0.0, 1.0, 1.0, 0)],
            extra: Map::new(),
        });
    }

    if camera_ids.len() >= 2 {
        scenes.push(Scene {
            id: "side_by_side".to_string(),
            label: "Side by side".to_string(),
            resolution,
            slots: vec![
                camera_slot(&camera_ids[0], 0.0, 0.25, 0.5, 0.5, 0),
                camera_slot(&camera_ids[1], 0.5, 0.25, 0.5, 0.5, 0),
            ],
            extra: Map::new(),
        });
        scenes.push(Scene {
            id: "pip".to_string(),
            label: "Picture in picture".to_string(),
            resolution,
            slots: vec![
                camera_slot(&camera_ids[0], 0.0, 0.0, 1.0, 1.0, 0),
                camera_slot(&camera_ids[1], 0.7, 0.7, 0.25, 0.25, 1),
            ],
            extra: Map::new(),
        });
    }

    scenes
}
