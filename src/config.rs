use std::fs;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::constants;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub global: GlobalConfig,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_recording_root")]
    pub recording_root: String,
    #[serde(default = "default_scenes_dir")]
    pub scenes_dir: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// RTSP base of the co-located media server, e.g. `rtsp://127.0.0.1:8554`.
    pub media_server_url: String,

    #[serde(default)]
    pub recorder_mode: RecorderMode,

    /// Terminate processes found holding an unowned capture device.
    #[serde(default = "default_true")]
    pub kill_stranded_processes: bool,

    /// Let the mixer open capture devices directly when a camera's ingest
    /// is not running, instead of falling back to a placeholder slot.
    #[serde(default)]
    pub mixer_direct_capture: bool,

    /// When set, the mixer also writes the program output to this file
    /// (container chosen from the extension).
    pub program_record_path: Option<String>,

    pub log_level: Option<String>,

    #[serde(default = "default_start_timeout")]
    pub start_timeout_sec: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_sec: u64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_sec: u64,
    #[serde(default = "default_ingest_poll")]
    pub ingest_poll_sec: u64,
    #[serde(default = "default_mixer_poll")]
    pub mixer_poll_sec: u64,
    #[serde(default = "default_rebuild_backoff")]
    pub rebuild_backoff_sec: u64,
}

impl GlobalConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_sec)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_sec)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_sec)
    }

    pub fn rebuild_backoff(&self) -> Duration {
        Duration::from_secs(self.rebuild_backoff_sec)
    }

    /// Publish URL for a media-server path like `/cam0`.
    pub fn publish_url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.media_server_url.trim_end_matches('/'),
            path
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderMode {
    /// Branch a file sink off the running ingest tee; one capture per device.
    #[default]
    Branched,
    /// Dedicated capture-to-file pipeline; ingest must be idle for the camera.
    Standalone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    #[default]
    H264,
    H265,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Short stable identifier, `cam0..cam3`.
    pub id: String,
    pub device: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    #[serde(default)]
    pub codec: CodecPreference,
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,

    /// strftime template with a `{camera}` placeholder, expanded at
    /// recording start.
    #[serde(default = "default_record_template")]
    pub record_template: String,

    /// Media-server publish path; defaults to `/<id>`.
    pub publish_path: Option<String>,
}

impl CameraConfig {
    pub fn publish_path(&self) -> String {
        self.publish_path
            .clone()
            .unwrap_or_else(|| format!("/{}", self.id))
    }
}

fn default_true() -> bool {
    true
}
fn default_recording_root() -> String {
    constants::RECORDING_ROOT.to_string()
}
fn default_scenes_dir() -> String {
    constants::SCENES_DIR.to_string()
}
fn default_db_path() -> String {
    constants::DB_PATH.to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_framerate() -> u32 {
    30
}
fn default_bitrate() -> u32 {
    8000
}
fn default_record_template() -> String {
    "{camera}/%Y-%m-%d/%H-%M-%S.mp4".to_string()
}
fn default_start_timeout() -> u64 {
    constants::START_TIMEOUT_SEC
}
fn default_stop_timeout() -> u64 {
    constants::STOP_TIMEOUT_SEC
}
fn default_liveness_timeout() -> u64 {
    constants::LIVENESS_TIMEOUT_SEC
}
fn default_ingest_poll() -> u64 {
    constants::INGEST_POLL_SEC
}
fn default_mixer_poll() -> u64 {
    constants::MIXER_POLL_SEC
}
fn default_rebuild_backoff() -> u64 {
    constants::REBUILD_BACKOFF_SEC
}

pub fn load_config(path: &str) -> Result<AppConfig> {
    let text = fs::read_to_string(path)?;
    let cfg: AppConfig = toml::from_str(&text)?;
    Ok(cfg)
}

/// Reject configurations the service cannot run with. Returns the first
/// problem found so the binary can exit non-zero with a reason.
pub fn verify_app_config(cfg: &AppConfig) -> std::result::Result<(), String> {
    if cfg.cameras.is_empty() {
        return Err("no cameras configured".to_string());
    }

    let mut ids: Vec<&str> = vec![];
    let mut devices: Vec<&str> = vec![];
    let mut publish_paths: Vec<String> = vec![constants::PROGRAM_PUBLISH_PATH.to_string()];

    for cam in &cfg.cameras {
        if cam.id.is_empty() || !cam.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("camera id '{}' is not a valid identifier", cam.id));
        }
        if ids.contains(&cam.id.as_str()) {
            return Err(format!("duplicate camera id '{}'", cam.id));
        }
        ids.push(&cam.id);

        if devices.contains(&cam.device.as_str()) {
            return Err(format!("device '{}' is claimed by two cameras", cam.device));
        }
        devices.push(&cam.device);

        let publish = cam.publish_path();
        if publish_paths.contains(&publish) {
            return Err(format!("publish path '{}' is claimed twice", publish));
        }
        publish_paths.push(publish);

        if cam.width == 0 || cam.height == 0 || cam.framerate == 0 {
            return Err(format!("camera '{}' has a zero geometry or framerate", cam.id));
        }
        if cam.bitrate_kbps == 0 {
            return Err(format!("camera '{}' has a zero bitrate", cam.id));
        }
        if cam.record_template.is_empty() {
            return Err(format!("camera '{}' has an empty record template", cam.id));
        }
    }

    if cfg.global.media_server_url.is_empty() {
        return Err("global.media_server_url is required".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [global]
            media_server_url = "rtsp://127.0.0.1:8554"

            [[cameras]]
            id = "cam0"
            device = "/dev/video0"

            [[cameras]]
            id = "cam1"
            device = "/dev/video1"
            codec = "h265"
            bitrate_kbps = 12000
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: AppConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.cameras[0].width, 1920);
        assert_eq!(cfg.cameras[0].codec, CodecPreference::H264);
        assert_eq!(cfg.cameras[1].codec, CodecPreference::H265);
        assert_eq!(cfg.global.recorder_mode, RecorderMode::Branched);
        assert!(cfg.global.kill_stranded_processes);
        assert_eq!(cfg.cameras[0].publish_path(), "/cam0");
        assert!(verify_app_config(&cfg).is_ok());
    }

    #[test]
    fn rejects_duplicate_devices() {
        let mut cfg: AppConfig = toml::from_str(minimal_toml()).unwrap();
        cfg.cameras[1].device = "/dev/video0".to_string();
        assert!(verify_app_config(&cfg).is_err());
    }

    #[test]
    fn rejects_publish_collision_with_program_path() {
        let mut cfg: AppConfig = toml::from_str(minimal_toml()).unwrap();
        cfg.cameras[0].publish_path = Some("/program".to_string());
        assert!(verify_app_config(&cfg).is_err());
    }
}
