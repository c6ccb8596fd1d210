use std::sync::mpsc::Sender;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::constants::{DEVICE_RELEASE_DELAY_MS, PROGRAM_PUBLISH_PATH};
use crate::error::{QuadcastError, Result};
use crate::pipeline::MediaInit;
use crate::pipeline::builder::{self, pad_properties};
use crate::pipeline::handle::{BusNote, PipelineHandle};
use crate::pipeline::spec::{Container, EncoderKind, PipelineSpec};
use crate::scene::{ResolvedScene, ResolvedSlot};
use crate::status::{Health, MixerSnapshot};

use super::LifecycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Mixer not running; the scene becomes the target for the next start.
    Stored,
    /// Scene identical to the one in force; nothing happened.
    Unchanged,
    /// Pad properties updated in place; pipeline handle untouched.
    HotReconfigured,
    /// Source set changed; full stop-and-start.
    Rebuilt,
}

/// The scene compositor: one branch per distinct source, composited,
/// encoded once, published as the program output.
pub struct MixerEngine {
    media: MediaInit,
    encoder: EncoderKind,
    publish_url: String,
    start_timeout: Duration,
    stop_timeout: Duration,
    notes: Sender<BusNote>,

    state: LifecycleState,
    handle: Option<PipelineHandle>,
    /// Scene to build at the next start.
    target: Option<ResolvedScene>,
    /// Scene currently in force on the running pipeline.
    applied: Option<ResolvedScene>,
    /// Slot layout the running pipeline was built with; compositor pad
    /// index equals position here. Hot reconfiguration maps new slots
    /// onto these pads.
    built_slots: Vec<ResolvedSlot>,
    file_sink: Option<(Container, String)>,
    last_error: Option<String>,
}

impl MixerEngine {
    pub fn new(
        media: MediaInit,
        global: &GlobalConfig,
        encoder: EncoderKind,
        notes: Sender<BusNote>,
    ) -> Self {
        let file_sink = global
            .program_record_path
            .clone()
            .map(|path| (Container::for_extension(&path), path));
        Self {
            media,
            encoder,
            publish_url: global.publish_url(PROGRAM_PUBLISH_PATH),
            start_timeout: global.start_timeout(),
            stop_timeout: global.stop_timeout(),
            notes,
            state: LifecycleState::Idle,
            handle: None,
            target: None,
            applied: None,
            built_slots: Vec::new(),
            file_sink,
            last_error: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn applied_scene_id(&self) -> Option<&str> {
        self.applied
            .as_ref()
            .or(self.target.as_ref())
            .map(|s| s.scene_id.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running && self.handle.is_some()
    }

    pub fn pipeline_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.name())
    }

    /// The central operation: compare the requested resolved scene with
    /// the one in force and take the least disruptive path.
    pub fn apply(&mut self, resolved: ResolvedScene) -> Result<ApplyOutcome> {
        if !self.is_running() {
            debug!(scene = %resolved.scene_id, "Mixer stopped, storing target scene");
            self.target = Some(resolved);
            return Ok(ApplyOutcome::Stored);
        }

        if self.applied.as_ref() == Some(&resolved) {
            return Ok(ApplyOutcome::Unchanged);
        }

        match self.plan_hot_reconfigure(&resolved) {
            Some(assignment) => {
                self.hot_reconfigure(&resolved, &assignment)?;
                self.target = Some(resolved.clone());
                self.applied = Some(resolved);
                Ok(ApplyOutcome::HotReconfigured)
            }
            None => {
                info!(
                    scene = %resolved.scene_id,
                    "Source set changed, rebuilding mixer pipeline"
                );
                self.teardown(true);
                // Let capture devices settle before the rebuild re-opens
                // anything a branch shares with an ingest.
                std::thread::sleep(Duration::from_millis(DEVICE_RELEASE_DELAY_MS));
                self.target = Some(resolved);
                self.start_pipeline()?;
                Ok(ApplyOutcome::Rebuilt)
            }
        }
    }

    /// Map every requested slot onto an unused built pad carrying the same
    /// source branch (and the same crop, which lives in the branch and
    /// cannot be changed in place). `None` means a rebuild is needed.
    fn plan_hot_reconfigure(&self, resolved: &ResolvedScene) -> Option<Vec<usize>> {
        if resolved.width != self.applied.as_ref()?.width
            || resolved.height != self.applied.as_ref()?.height
        {
            return None;
        }

        let mut used = vec![false; self.built_slots.len()];
        let mut assignment = Vec::with_capacity(resolved.slots.len());

        for slot in &resolved.slots {
            let key = slot.branch.key();
            let pad = self.built_slots.iter().enumerate().position(|(idx, built)| {
                !used[idx] && built.branch.key() == key && built.crop == slot.crop
            })?;
            used[pad] = true;
            assignment.push(pad);
        }
        Some(assignment)
    }

    fn hot_reconfigure(&mut self, resolved: &ResolvedScene, assignment: &[usize]) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| QuadcastError::Internal("hot reconfigure without pipeline".into()))?;

        for (slot, &pad_idx) in resolved.slots.iter().zip(assignment) {
            handle.set_pad_properties("comp", &format!("sink_{pad_idx}"), &pad_properties(slot))?;
        }

        // Pads whose source dropped out of the scene go transparent.
        for (idx, _) in self.built_slots.iter().enumerate() {
            if !assignment.contains(&idx) {
                handle.set_pad_properties(
                    "comp",
                    &format!("sink_{idx}"),
                    &[
                        ("alpha".to_string(), "0.000".to_string()),
                        ("zorder".to_string(), "0".to_string()),
                    ],
                )?;
            }
        }

        info!(scene = %resolved.scene_id, "Scene hot-reconfigured in place");
        Ok(())
    }

    /// Start the mixer with the stored target scene.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.target.is_none() {
            return Err(QuadcastError::InvalidArgument(
                "no scene applied to the mixer".to_string(),
            ));
        }
        self.start_pipeline()
    }

    fn start_pipeline(&mut self) -> Result<()> {
        let scene = self
            .target
            .clone()
            .ok_or_else(|| QuadcastError::Internal("mixer start without target scene".into()))?;

        self.state = LifecycleState::Starting;

        let spec = PipelineSpec::MixerScene {
            scene: scene.clone(),
            encoder: self.encoder.clone(),
            publish_url: self.publish_url.clone(),
            file_sink: self.file_sink.clone(),
        };
        let description = builder::build(&spec)?;
        let name = spec.pipeline_name();

        let handle =
            PipelineHandle::launch(&self.media, &name, &description, Some(self.notes.clone()))?;
        match handle.start(self.start_timeout) {
            Ok(()) => {
                self.handle = Some(handle);
                self.built_slots = scene.slots.clone();
                self.applied = Some(scene);
                self.state = LifecycleState::Running;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                drop(handle);
                self.state = LifecycleState::Error;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

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
                    warn!("Mixer teardown was forced");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "Mixer teardown error"),
            }
        }
        self.applied = None;
        self.built_slots.clear();
    }

    pub fn buffer_age(&self) -> Option<Duration> {
        self.handle.as_ref().and_then(|h| h.buffer_age())
    }

    pub fn mark_degraded(&mut self, reason: &str) {
        if self.state == LifecycleState::Running {
            warn!(reason, "Mixer degraded");
            self.state = LifecycleState::Degraded;
            self.last_error = Some(reason.to_string());
        }
    }

    pub fn mark_failed(&mut self, message: &str) {
        self.teardown(false);
        self.state = LifecycleState::Error;
        self.last_error = Some(message.to_string());
    }

    /// Rebuild in place after a degradation: tear down and start the
    /// target scene again.
    pub fn rebuild(&mut self) -> Result<()> {
        self.teardown(false);
        std::thread::sleep(Duration::from_millis(DEVICE_RELEASE_DELAY_MS));
        self.start_pipeline()
    }

    pub fn status(&self) -> MixerSnapshot {
        let health = match self.state {
            LifecycleState::Running => Health::Ok,
            LifecycleState::Degraded => Health::Degraded,
            LifecycleState::Error => Health::Failed,
            _ => Health::Ok,
        };
        MixerSnapshot {
            state: self.state,
            scene: self.applied_scene_id().map(|s| s.to_string()),
            health,
            publish_active: self.is_running(),
            publish_path: Some(self.publish_url.clone()),
            file_active: self.is_running() && self.file_sink.is_some(),
            file_path: self.file_sink.as_ref().map(|(_, path)| path.clone()),
            last_error: self.last_error.clone(),
        }
    }
}
