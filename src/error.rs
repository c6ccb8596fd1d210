use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuadcastError>;

/// Error taxonomy surfaced by engines, the supervisor, and the control
/// facade. The HTTP layer maps these kinds onto status codes.
#[derive(Debug, Error)]
pub enum QuadcastError {
    /// Unknown camera or scene id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed scene or invalid id in a request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Deletion of the scene currently applied to the mixer.
    #[error("scene '{0}' is currently applied to the mixer")]
    SceneInUse(String),

    /// The capture device is held by another pipeline.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Start requested for a camera with no signal. The engine parks in
    /// NoSignal and auto-starts on recovery; this is not a failure state.
    #[error("no signal on camera '{0}'")]
    DeviceNoSignal(String),

    /// The builder could not negotiate the observed source format.
    #[error("unsupported caps: {0}")]
    DeviceCapsUnsupported(String),

    /// A state transition missed its deadline.
    #[error("'{operation}' timed out after {deadline:?}")]
    Timeout {
        operation: String,
        deadline: Duration,
    },

    /// Fatal error posted on a pipeline bus.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Two pipelines would publish to the same media-server path.
    #[error("publish path collision on '{0}'")]
    PublishCollision(String),

    /// Scene store or recordings index I/O failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QuadcastError {
    pub fn timeout(operation: impl Into<String>, deadline: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            deadline,
        }
    }

    /// Stable kind label used in status snapshots and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::SceneInUse(_) => "SceneInUse",
            Self::DeviceBusy(_) => "DeviceBusy",
            Self::DeviceNoSignal(_) => "DeviceNoSignal",
            Self::DeviceCapsUnsupported(_) => "DeviceCapsUnsupported",
            Self::Timeout { .. } => "Timeout",
            Self::Pipeline(_) => "PipelineError",
            Self::PublishCollision(_) => "PublishCollision",
            Self::Persistence(_) => "PersistenceError",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<std::io::Error> for QuadcastError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for QuadcastError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<rusqlite::Error> for QuadcastError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<gstreamer::glib::Error> for QuadcastError {
    fn from(err: gstreamer::glib::Error) -> Self {
        Self::Pipeline(err.to_string())
    }
}

impl From<gstreamer::glib::BoolError> for QuadcastError {
    fn from(err: gstreamer::glib::BoolError) -> Self {
        Self::Pipeline(err.to_string())
    }
}

impl From<gstreamer::StateChangeError> for QuadcastError {
    fn from(err: gstreamer::StateChangeError) -> Self {
        Self::Pipeline(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        let err = QuadcastError::timeout("mixer start", Duration::from_secs(10));
        assert_eq!(err.kind(), "Timeout");
        assert_eq!(
            QuadcastError::SceneInUse("quad".into()).kind(),
            "SceneInUse"
        );
    }
}
