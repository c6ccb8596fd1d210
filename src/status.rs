//! Snapshot types the control facade hands to the external HTTP layer.
//! Everything here serializes; nothing here holds pipeline references.

use serde::Serialize;

use crate::caps::VideoCaps;
use crate::engines::LifecycleState;

#[derive(Debug, Clone, Serialize)]
pub struct CameraSnapshot {
    pub id: String,
    pub state: LifecycleState,
    pub observed_caps: Option<VideoCaps>,
    pub signal: bool,
    pub buffer_age_ms: Option<u64>,
    pub last_error: Option<String>,
    pub recording_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MixerSnapshot {
    pub state: LifecycleState,
    pub scene: Option<String>,
    pub health: Health,
    pub publish_active: bool,
    pub publish_path: Option<String>,
    pub file_active: bool,
    pub file_path: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub state: LifecycleState,
    pub file: Option<String>,
    pub bytes_written: u64,
    pub duration_ms: u64,
}

/// One row of the device-busy table: who owns which capture device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceOwnerEntry {
    pub device: String,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cameras: Vec<CameraSnapshot>,
    pub mixer: MixerSnapshot,
    pub devices: Vec<DeviceOwnerEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SceneSummary {
    pub id: String,
    pub label: String,
    pub slot_count: usize,
}
