use std::sync::mpsc::Sender;
use std::time::Duration;

use tracing::{info, warn};

use crate::caps::VideoCaps;
use crate::config::{CameraConfig, GlobalConfig, RecorderMode};
use crate::error::{QuadcastError, Result};
use crate::pipeline::MediaInit;
use crate::pipeline::builder;
use crate::pipeline::handle::{BusNote, PipelineHandle};
use crate::pipeline::spec::{CaptureParams, EncoderKind, PipelineSpec};
use crate::probe::ProbeReport;
use crate::status::CameraSnapshot;

use super::LifecycleState;

/// What a start request actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Already Running at identical caps; nothing happened.
    AlreadyRunning,
    /// Stopped and restarted because the observed caps changed.
    Rebuilt,
    /// No signal on the device; the engine parked in NoSignal and no
    /// pipeline was created.
    ParkedNoSignal,
}

/// The always-on capture pipeline for one camera, publishing to the media
/// server. Single source of truth for camera liveness.
pub struct IngestEngine {
    media: MediaInit,
    camera: CameraConfig,
    publish_url: String,
    encoder: EncoderKind,
    tee_for_recorder: bool,
    start_timeout: Duration,
    stop_timeout: Duration,
    notes: Sender<BusNote>,

    state: LifecycleState,
    handle: Option<PipelineHandle>,
    observed_caps: Option<VideoCaps>,
    signal_present: bool,
    last_error: Option<String>,
}

impl IngestEngine {
    pub fn new(
        media: MediaInit,
        camera: CameraConfig,
        global: &GlobalConfig,
        encoder: EncoderKind,
        notes: Sender<BusNote>,
    ) -> Self {
        let publish_url = global.publish_url(&camera.publish_path());
        Self {
            media,
            camera,
            publish_url,
            encoder,
            tee_for_recorder: global.recorder_mode == RecorderMode::Branched,
            start_timeout: global.start_timeout(),
            stop_timeout: global.stop_timeout(),
            notes,
            state: LifecycleState::Idle,
            handle: None,
            observed_caps: None,
            signal_present: false,
            last_error: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera.id
    }

    pub fn device(&self) -> &str {
        &self.camera.device
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }

    pub fn observed_caps(&self) -> Option<VideoCaps> {
        self.observed_caps
    }

    pub fn signal_present(&self) -> bool {
        self.signal_present
    }

    pub fn pipeline_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.name())
    }

    /// The running pipeline handle, for the branched recorder to attach to.
    pub fn handle(&self) -> Option<&PipelineHandle> {
        self.handle.as_ref()
    }

    /// Start (or rebuild) against a fresh probe report. The supervisor
    /// probes before calling so device policy stays in one place.
    pub fn start(&mut self, report: &ProbeReport) -> Result<StartOutcome> {
        self.signal_present = report.has_signal;

        if !report.exists {
            self.state = LifecycleState::Error;
            self.last_error = Some("device not present".to_string());
            return Err(QuadcastError::NotFound(format!(
                "device {} for camera '{}'",
                self.camera.device, self.camera.id
            )));
        }

        if !report.has_signal {
            // Not a failure: park and wait for the supervisor to notice
            // signal return.
            if self.handle.is_some() {
                self.teardown(false);
            }
            self.state = LifecycleState::NoSignal;
            self.observed_caps = report.current_caps;
            info!(camera = %self.camera.id, "No signal, parking ingest");
            return Ok(StartOutcome::ParkedNoSignal);
        }

        let caps = report.current_caps.ok_or_else(|| {
            QuadcastError::DeviceCapsUnsupported(format!(
                "camera '{}' reports signal but no caps",
                self.camera.id
            ))
        })?;

        let mut rebuilt = false;
        if self.state == LifecycleState::Running {
            if self.observed_caps == Some(caps) && !self.handle_is_dead() {
                return Ok(StartOutcome::AlreadyRunning);
            }
            info!(
                camera = %self.camera.id,
                old = self.observed_caps.map(|c| c.to_string()),
                new = %caps,
                "Caps changed, rebuilding ingest"
            );
            self.teardown(true);
            rebuilt = true;
        } else if self.handle.is_some() {
            self.teardown(true);
        }

        self.state = LifecycleState::Starting;
        self.observed_caps = Some(caps);

        let spec = self.build_spec(caps);
        let description = builder::build(&spec)?;
        let name = spec.pipeline_name();

        let handle =
            PipelineHandle::launch(&self.media, &name, &description, Some(self.notes.clone()))?;

        match handle.start(self.start_timeout) {
            Ok(()) => {
                self.handle = Some(handle);
                self.state = LifecycleState::Running;
                self.last_error = None;
                Ok(if rebuilt {
                    StartOutcome::Rebuilt
                } else {
                    StartOutcome::Started
                })
            }
            Err(err) => {
                // start() already forced teardown; the device fd is free.
                drop(handle);
                self.state = LifecycleState::Error;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Stop from any state; always lands in Idle with the device released.
    pub fn stop(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.state = LifecycleState::Idle;
            return Ok(());
        }
        self.state = LifecycleState::Stopping;
        self.teardown(true);
        self.state = LifecycleState::Idle;
        Ok(())
    }

    fn teardown(&mut self, graceful: bool) {
        if let Some(handle) = self.handle.take() {
            match handle.stop(graceful, self.stop_timeout) {
                Ok(outcome) if outcome.forced => {
                    warn!(camera = %self.camera.id, "Ingest teardown was forced");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(camera = %self.camera.id, %err, "Ingest teardown error");
                }
            }
        }
    }

    fn handle_is_dead(&self) -> bool {
        self.handle.as_ref().map(|h| h.had_error()).unwrap_or(true)
    }

    fn build_spec(&self, caps: VideoCaps) -> PipelineSpec {
        let capture = CaptureParams {
            device: self.camera.device.clone(),
            caps,
            target_width: self.camera.width,
            target_height: self.camera.height,
            target_fps: self.camera.framerate,
            bitrate_kbps: self.camera.bitrate_kbps,
        };
        if self.tee_for_recorder {
            PipelineSpec::CaptureTee {
                capture,
                encoder: self.encoder.clone(),
                publish_url: self.publish_url.clone(),
            }
        } else {
            PipelineSpec::CaptureToPublish {
                capture,
                encoder: self.encoder.clone(),
                publish_url: self.publish_url.clone(),
            }
        }
    }

    /// Buffer age of the running pipeline; `None` when not running or no
    /// buffer has flowed yet.
    pub fn buffer_age(&self) -> Option<Duration> {
        self.handle.as_ref().and_then(|h| h.buffer_age())
    }

    /// Self-transition on liveness failure; the supervisor decides when to
    /// rebuild.
    pub fn mark_degraded(&mut self, reason: &str) {
        if self.state == LifecycleState::Running {
            warn!(camera = %self.camera.id, reason, "Ingest degraded");
            self.state = LifecycleState::Degraded;
            self.last_error = Some(reason.to_string());
        }
    }

    /// Fatal bus event for this engine's pipeline.
    pub fn mark_failed(&mut self, message: &str) {
        self.teardown(false);
        self.state = LifecycleState::Error;
        self.last_error = Some(message.to_string());
    }

    /// Signal sampled away while running: release the device and park.
    pub fn mark_signal_lost(&mut self) {
        self.signal_present = false;
        if self.state.is_active() {
            info!(camera = %self.camera.id, "Signal lost, stopping ingest");
            self.teardown(false);
            self.state = LifecycleState::NoSignal;
        }
    }

    pub fn set_signal_present(&mut self, present: bool) {
        self.signal_present = present;
    }

    pub fn observe(&self) -> CameraSnapshot {
        CameraSnapshot {
            id: self.camera.id.clone(),
            state: self.state,
            observed_caps: self.observed_caps,
            signal: self.signal_present,
            buffer_age_ms: self.buffer_age().map(|d| d.as_millis() as u64),
            last_error: self.last_error.clone(),
            recording_file: None,
        }
    }
}
