pub const START_TIMEOUT_SEC: u64 = 10;
pub const STOP_TIMEOUT_SEC: u64 = 10;
pub const LIVENESS_TIMEOUT_SEC: u64 = 15;

pub const INGEST_POLL_SEC: u64 = 10;
pub const MIXER_POLL_SEC: u64 = 5;
pub const REBUILD_BACKOFF_SEC: u64 = 30;

/// Wait after stopping a pipeline that held a capture device before a
/// rebuild re-opens it. Avoids EBUSY races on shared cameras.
pub const DEVICE_RELEASE_DELAY_MS: u64 = 500;

/// Minimum geometry the driver must report for a source to count as signal.
pub const MIN_SIGNAL_WIDTH: u32 = 640;
pub const MIN_SIGNAL_HEIGHT: u32 = 480;

/// Depth of the supervisor control queue.
pub const CONTROL_QUEUE_DEPTH: usize = 64;

pub const PROGRAM_PUBLISH_PATH: &str = "/program";

// DEBUG
#[cfg(debug_assertions)]
pub const RECORDING_ROOT: &str = "./recordings/";
#[cfg(debug_assertions)]
pub const SCENES_DIR: &str = "./scenes/";
#[cfg(debug_assertions)]
pub const DB_PATH: &str = "./quadcast.db";

// RELEASE
#[cfg(not(debug_assertions))]
pub const RECORDING_ROOT: &str = "/var/lib/quadcast/recordings/";
#[cfg(not(debug_assertions))]
pub const SCENES_DIR: &str = "/var/lib/quadcast/scenes/";
#[cfg(not(debug_assertions))]
pub const DB_PATH: &str = "/var/lib/quadcast/quadcast.db";
