//! The serialized control plane.
//!
//! Every mutating operation reaches the supervisor as a [`Command`] on one
//! bounded queue; bus events and health ticks arrive on the same queue as
//! [`Event`]s. The loop drains commands before events, so health work never
//! delays an operator request. Engines are only ever touched from this
//! loop, which gives global ordering without locks on the engines.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{AppConfig, RecorderMode};
use crate::db_worker::DbMessage;
use crate::engines::LifecycleState;
use crate::engines::ingest::IngestEngine;
use crate::engines::mixer::{ApplyOutcome, MixerEngine};
use crate::engines::recorder::{RecorderEngine, StopReport};
use crate::error::{QuadcastError, Result};
use crate::pipeline::handle::BusNote;
use crate::probe::{DeviceKind, DeviceProbe, ProbeReport};
use crate::scene::{CameraResolveState, ResolveContext, Scene, SceneContext, SourceType, resolve};
use crate::scene_store::SceneStore;
use crate::status::{
    CameraSnapshot, DeviceOwnerEntry, MixerSnapshot, RecorderStatus, SceneSummary, StatusReport,
};

/// Who holds a capture device right now. Exactly one owner per device at
/// any instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOwner {
    Ingest(String),
    Recorder(String),
    Mixer,
}

impl DeviceOwner {
    fn label(&self) -> String {
        match self {
            Self::Ingest(cam) => format!("ingest:{cam}"),
            Self::Recorder(cam) => format!("recorder:{cam}"),
            Self::Mixer => "mixer".to_string(),
        }
    }
}

/// Result payload of a recorder stop, surfaced to the facade caller.
#[derive(Debug, Clone)]
pub struct RecordingStopped {
    pub path: String,
    pub bytes: u64,
    pub duration_ms: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneApplied {
    Stored,
    Unchanged,
    HotReconfigured,
    Rebuilt,
}

impl From<ApplyOutcome> for SceneApplied {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Stored => Self::Stored,
            ApplyOutcome::Unchanged => Self::Unchanged,
            ApplyOutcome::HotReconfigured => Self::HotReconfigured,
            ApplyOutcome::Rebuilt => Self::Rebuilt,
        }
    }
}

pub enum Command {
    StartIngest {
        camera: String,
        reply: Sender<Result<CameraSnapshot>>,
    },
    StopIngest {
        camera: String,
        reply: Sender<Result<CameraSnapshot>>,
    },
    StartRecord {
        camera: String,
        reply: Sender<Result<RecorderStatus>>,
    },
    StopRecord {
        camera: String,
        reply: Sender<Result<RecordingStopped>>,
    },
    RecordStatus {
        camera: String,
        reply: Sender<Result<RecorderStatus>>,
    },
    GetStatus {
        reply: Sender<StatusReport>,
    },
    ListScenes {
        reply: Sender<Vec<SceneSummary>>,
    },
    GetScene {
        id: String,
        reply: Sender<Result<Scene>>,
    },
    PutScene {
        scene: Scene,
        reply: Sender<Result<Scene>>,
    },
    DeleteScene {
        id: String,
        reply: Sender<Result<()>>,
    },
    ApplyScene {
        id: String,
        reply: Sender<Result<SceneApplied>>,
    },
    StartMixer {
        reply: Sender<Result<MixerSnapshot>>,
    },
    StopMixer {
        reply: Sender<Result<MixerSnapshot>>,
    },
    GetMixerStatus {
        reply: Sender<MixerSnapshot>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

pub enum Event {
    Bus(BusNote),
    PollTick,
}

pub enum Msg {
    Command(Command),
    Event(Event),
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Supervisor {
    cfg: AppConfig,
    probe: Arc<dyn DeviceProbe>,
    ingests: Vec<IngestEngine>,
    recorders: Vec<RecorderEngine>,
    mixer: MixerEngine,
    scene_store: SceneStore,
    db_tx: Sender<DbMessage>,

    owners: HashMap<String, DeviceOwner>,
    /// Last rebuild attempt per engine key; at most one rebuild per key
    /// per backoff window.
    last_rebuild: HashMap<String, Instant>,
    /// Ingests stopped to make room for a standalone recording; restarted
    /// when the recording stops.
    resume_after_record: Vec<String>,

    last_ingest_poll: Instant,
    last_mixer_poll: Instant,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        probe: Arc<dyn DeviceProbe>,
        ingests: Vec<IngestEngine>,
        recorders: Vec<RecorderEngine>,
        mixer: MixerEngine,
        scene_store: SceneStore,
        db_tx: Sender<DbMessage>,
    ) -> Self {
        Self {
            cfg,
            probe,
            ingests,
            recorders,
            mixer,
            scene_store,
            db_tx,
            owners: HashMap::new(),
            last_rebuild: HashMap::new(),
            resume_after_record: Vec::new(),
            last_ingest_poll: Instant::now(),
            last_mixer_poll: Instant::now(),
        }
    }

    /// Consume the control queue until shutdown. Commands drain before
    /// events within every batch.
    pub fn run(mut self, rx: Receiver<Msg>) {
        info!("Supervisor loop started");
        loop {
            let first = match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };

            let mut batch: Vec<Msg> = vec![first];
            while let Ok(msg) = rx.try_recv() {
                batch.push(msg);
            }
            // Stable: commands keep arrival order among themselves.
            batch.sort_by_key(|m| matches!(m, Msg::Event(_)));

            let mut queue: VecDeque<Msg> = batch.into();
            while let Some(msg) = queue.pop_front() {
                let flow = match msg {
                    Msg::Command(cmd) => self.handle_command(cmd),
                    Msg::Event(event) => {
                        self.handle_event(event);
                        Flow::Continue
                    }
                };
                if matches!(flow, Flow::Shutdown) {
                    info!("Supervisor loop stopped");
                    return;
                }
            }
        }
        warn!("Supervisor queue closed without shutdown command");
        self.shutdown_all();
    }

    ////////////////////////////////////////////////////////////////////////
    // Command handling
    ////////////////////////////////////////////////////////////////////////

    fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::StartIngest { camera, reply } => {
                let _ = reply.send(self.start_ingest(&camera));
            }
            Command::StopIngest { camera, reply } => {
                let _ = reply.send(self.stop_ingest(&camera));
            }
            Command::StartRecord { camera, reply } => {
                let _ = reply.send(self.start_record(&camera));
            }
            Command::StopRecord { camera, reply } => {
                let _ = reply.send(self.stop_record(&camera));
            }
            Command::RecordStatus { camera, reply } => {
                let result = self
                    .recorder_idx(&camera)
                    .map(|idx| self.recorders[idx].status());
                let _ = reply.send(result);
            }
            Command::GetStatus { reply } => {
                let _ = reply.send(self.status_report());
            }
            Command::ListScenes { reply } => {
                let summaries = self
                    .scene_store
                    .list()
                    .into_iter()
                    .map(|s| SceneSummary {
                        id: s.id.clone(),
                        label: s.label.clone(),
                        slot_count: s.slots.len(),
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
            Command::GetScene { id, reply } => {
                let _ = reply.send(self.scene_store.get(&id).cloned());
            }
            Command::PutScene { scene, reply } => {
                let _ = reply.send(self.put_scene(scene));
            }
            Command::DeleteScene { id, reply } => {
                let _ = reply.send(self.delete_scene(&id));
            }
            Command::ApplyScene { id, reply } => {
                let _ = reply.send(self.apply_scene(&id));
            }
            Command::StartMixer { reply } => {
                let _ = reply.send(self.start_mixer());
            }
            Command::StopMixer { reply } => {
                let result = self.mixer.stop().map(|()| {
                    self.release_owner(&DeviceOwner::Mixer);
                    self.mixer.status()
                });
                let _ = reply.send(result);
            }
            Command::GetMixerStatus { reply } => {
                let _ = reply.send(self.mixer.status());
            }
            Command::Shutdown { reply } => {
                self.shutdown_all();
                let _ = reply.send(());
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    fn ingest_idx(&self, camera: &str) -> Result<usize> {
        self.ingests
            .iter()
            .position(|e| e.camera_id() == camera)
            .ok_or_else(|| QuadcastError::NotFound(format!("camera '{camera}'")))
    }

    fn recorder_idx(&self, camera: &str) -> Result<usize> {
        self.recorders
            .iter()
            .position(|e| e.camera_id() == camera)
            .ok_or_else(|| QuadcastError::NotFound(format!("camera '{camera}'")))
    }

    /// Probe a device on behalf of an engine, applying the stranded-process
    /// policy when something unowned holds it.
    fn probe_for(&mut self, device: &str, wanted: &DeviceOwner) -> Result<ProbeReport> {
        let path = PathBuf::from(device);
        let mut report = self.probe.probe(&path);

        if report.exists && !report.openable_exclusively {
            match self.owners.get(device) {
                Some(owner) if owner == wanted => {}
                Some(owner) => {
                    return Err(QuadcastError::DeviceBusy(format!(
                        "{device} is held by {}",
                        owner.label()
                    )));
                }
                None => {
                    if !self.cfg.global.kill_stranded_processes {
                        return Err(QuadcastError::DeviceBusy(format!(
                            "{device} is held by an unknown process"
                        )));
                    }
                    warn!(device, "Device busy with no known owner, cleaning up holder");
                    terminate_device_holders(&path);
                    report = self.probe.probe(&path);
                    if report.exists && !report.openable_exclusively {
                        return Err(QuadcastError::DeviceBusy(format!(
                            "{device} still busy after stranded-process cleanup"
                        )));
                    }
                }
            }
        }

        Ok(report)
    }

    fn publish_url_in_use(&self, url: &str, skip_camera: Option<&str>) -> bool {
        self.ingests.iter().any(|e| {
            Some(e.camera_id()) != skip_camera && e.state().is_active() && e.publish_url() == url
        })
    }

    fn start_ingest(&mut self, camera: &str) -> Result<CameraSnapshot> {
        let idx = self.ingest_idx(camera)?;
        let device = self.ingests[idx].device().to_string();

        if let Some(owner) = self.owners.get(&device)
            && *owner != DeviceOwner::Ingest(camera.to_string())
        {
            return Err(QuadcastError::DeviceBusy(format!(
                "{device} is held by {}",
                owner.label()
            )));
        }

        let url = self.ingests[idx].publish_url().to_string();
        if self.publish_url_in_use(&url, Some(camera)) {
            return Err(QuadcastError::PublishCollision(url));
        }

        let wanted = DeviceOwner::Ingest(camera.to_string());
        let report = self.probe_for(&device, &wanted)?;

        match self.ingests[idx].start(&report) {
            Ok(outcome) => {
                use crate::engines::ingest::StartOutcome;
                match outcome {
                    StartOutcome::ParkedNoSignal => {
                        self.owners.remove(&device);
                    }
                    _ => {
                        self.owners.insert(device, wanted);
                    }
                }
                Ok(self.ingests[idx].observe())
            }
            Err(err) => {
                self.owners.remove(&device);
                Err(err)
            }
        }
    }

    fn stop_ingest(&mut self, camera: &str) -> Result<CameraSnapshot> {
        let idx = self.ingest_idx(camera)?;

        // A branched recording lives inside the ingest pipeline; finalize
        // it before the capture goes away.
        let rec_idx = self.recorder_idx(camera)?;
        if self.recorders[rec_idx].is_recording()
            && self.recorders[rec_idx].mode() == RecorderMode::Branched
        {
            info!(camera, "Stopping ingest with active recording, finalizing first");
            let report = self.recorders[rec_idx].stop(self.ingests[idx].handle())?;
            self.record_finished(camera, &report);
        }

        self.ingests[idx].stop()?;
        let device = self.ingests[idx].device().to_string();
        self.owners.remove(&device);
        Ok(self.ingests[idx].observe())
    }

    fn start_record(&mut self, camera: &str) -> Result<RecorderStatus> {
        let rec_idx = self.recorder_idx(camera)?;
        let ing_idx = self.ingest_idx(camera)?;

        if self.recorders[rec_idx].is_recording() {
            // Idempotent happy path.
            return Ok(self.recorders[rec_idx].status());
        }

        let device = self.ingests[ing_idx].device().to_string();
        let path = match self.recorders[rec_idx].mode() {
            RecorderMode::Branched => {
                if self.ingests[ing_idx].state() != LifecycleState::Running {
                    // The branch needs a running capture underneath it.
                    let snapshot = self.start_ingest(camera)?;
                    if snapshot.state == LifecycleState::NoSignal {
                        return Err(QuadcastError::DeviceNoSignal(camera.to_string()));
                    }
                }
                let handle = self.ingests[ing_idx].handle().ok_or_else(|| {
                    QuadcastError::Internal(format!("ingest '{camera}' running without pipeline"))
                })?;
                self.recorders[rec_idx].start_branched(handle)?
            }
            RecorderMode::Standalone => {
                if self.ingests[ing_idx].state().is_active() {
                    info!(camera, "Standalone recording: idling ingest first");
                    self.stop_ingest(camera)?;
                    self.resume_after_record.push(camera.to_string());
                }
                let wanted = DeviceOwner::Recorder(camera.to_string());
                let report = self.probe_for(&device, &wanted)?;
                let path = self.recorders[rec_idx].start_standalone(&report)?;
                self.owners.insert(device, wanted);
                path
            }
        };

        let _ = self.db_tx.send(DbMessage::RecordingStarted {
            camera_key: camera.to_string(),
            path: path.to_string_lossy().to_string(),
            started_at: chrono::Local::now().to_rfc3339(),
        });

        Ok(self.recorders[rec_idx].status())
    }

    fn stop_record(&mut self, camera: &str) -> Result<RecordingStopped> {
        let rec_idx = self.recorder_idx(camera)?;
        let ing_idx = self.ingest_idx(camera)?;

        let report = self.recorders[rec_idx].stop(self.ingests[ing_idx].handle())?;
        self.record_finished(camera, &report);

        if self.recorders[rec_idx].mode() == RecorderMode::Standalone {
            let device = self.ingests[ing_idx].device().to_string();
            self.owners.remove(&device);

            if let Some(pos) = self.resume_after_record.iter().position(|c| c == camera) {
                self.resume_after_record.remove(pos);
                info!(camera, "Recording stopped, restarting ingest");
                if let Err(err) = self.start_ingest(camera) {
                    warn!(camera, %err, "Ingest restart after recording failed");
                }
            }
        }

        Ok(RecordingStopped {
            path: report.path.to_string_lossy().to_string(),
            bytes: report.bytes,
            duration_ms: report.duration_ms,
            truncated: report.truncated,
        })
    }

    fn record_finished(&self, camera: &str, report: &StopReport) {
        info!(
            camera,
            path = %report.path.display(),
            bytes = report.bytes,
            truncated = report.truncated,
            "Recording indexed"
        );
        let _ = self.db_tx.send(DbMessage::RecordingFinished {
            path: report.path.to_string_lossy().to_string(),
            finished_at: chrono::Local::now().to_rfc3339(),
            bytes: report.bytes as i64,
            truncated: report.truncated,
        });
    }

    fn scene_context(&self) -> (Vec<String>, Vec<String>) {
        let ids = self
            .ingests
            .iter()
            .map(|e| e.camera_id().to_string())
            .collect();
        let paths = self
            .cfg
            .cameras
            .iter()
            .map(|c| c.publish_path())
            .collect();
        (ids, paths)
    }

    fn put_scene(&mut self, scene: Scene) -> Result<Scene> {
        let (ids, paths) = self.scene_context();
        let ctx = SceneContext {
            camera_ids: &ids,
            publish_paths: &paths,
        };
        self.scene_store.put_validated(&scene, &ctx)
    }

    fn delete_scene(&mut self, id: &str) -> Result<()> {
        if self.mixer.applied_scene_id() == Some(id) {
            return Err(QuadcastError::SceneInUse(id.to_string()));
        }
        self.scene_store.delete(id)
    }

    fn resolve_scene(&self, scene: &Scene) -> Result<crate::scene::ResolvedScene> {
        let cameras: Vec<CameraResolveState> = self
            .ingests
            .iter()
            .map(|e| CameraResolveState {
                id: e.camera_id().to_string(),
                device: e.device().to_string(),
                publish_url: e.publish_url().to_string(),
                running: e.state() == LifecycleState::Running,
                observed_caps: e.observed_caps(),
            })
            .collect();
        let ctx = ResolveContext {
            cameras: &cameras,
            media_server_url: &self.cfg.global.media_server_url,
            direct_capture: self.cfg.global.mixer_direct_capture,
        };
        resolve(scene, &ctx)
    }

    fn apply_scene(&mut self, id: &str) -> Result<SceneApplied> {
        let scene = self.scene_store.get(id)?.clone();

        // Validate against the live world so a scene created when a file
        // still existed cannot silently resolve.
        let (ids, paths) = self.scene_context();
        let ctx = SceneContext {
            camera_ids: &ids,
            publish_paths: &paths,
        };
        let scene = scene.validate(&ctx)?;

        // A camera being recorded standalone owns its device; leave the
        // recorder undisturbed and refuse the apply.
        for slot in &scene.slots {
            if slot.source_type == SourceType::Camera
                && let Ok(idx) = self.recorder_idx(&slot.source)
                && self.recorders[idx].is_recording()
                && self.recorders[idx].mode() == RecorderMode::Standalone
            {
                return Err(QuadcastError::DeviceBusy(format!(
                    "camera '{}' is recording in standalone mode",
                    slot.source
                )));
            }
        }

        let resolved = self.resolve_scene(&scene)?;

        // Direct-capture branches open devices; enforce single ownership
        // before the mixer builds anything.
        for slot in &resolved.slots {
            if let crate::scene::SourceBranch::DirectCapture { device, .. } = &slot.branch
                && let Some(owner) = self.owners.get(device)
                && *owner != DeviceOwner::Mixer
            {
                return Err(QuadcastError::DeviceBusy(format!(
                    "{device} is held by {}",
                    owner.label()
                )));
            }
        }

        let outcome = self.mixer.apply(resolved.clone())?;
        if self.mixer.is_running() {
            self.claim_mixer_devices(&resolved);
        }
        Ok(outcome.into())
    }

    fn claim_mixer_devices(&mut self, resolved: &crate::scene::ResolvedScene) {
        self.release_owner(&DeviceOwner::Mixer);
        for slot in &resolved.slots {
            if let crate::scene::SourceBranch::DirectCapture { device, .. } = &slot.branch {
                self.owners.insert(device.clone(), DeviceOwner::Mixer);
            }
        }
    }

    fn start_mixer(&mut self) -> Result<MixerSnapshot> {
        self.mixer.start()?;
        let scene_id = self.mixer.applied_scene_id().map(|s| s.to_string());
        if let Some(id) = scene_id
            && let Ok(scene) = self.scene_store.get(&id).cloned()
            && let Ok(resolved) = self.resolve_scene(&scene)
        {
            self.claim_mixer_devices(&resolved);
        }
        Ok(self.mixer.status())
    }

    fn release_owner(&mut self, owner: &DeviceOwner) {
        self.owners.retain(|_, o| o != owner);
    }

    fn status_report(&self) -> StatusReport {
        let cameras = self
            .ingests
            .iter()
            .map(|e| {
                let mut snapshot = e.observe();
                if let Ok(idx) = self.recorder_idx(e.camera_id()) {
                    snapshot.recording_file = self.recorders[idx]
                        .active_path()
                        .map(|p| p.to_string_lossy().to_string());
                }
                snapshot
            })
            .collect();

        let devices = self
            .cfg
            .cameras
            .iter()
            .map(|c| DeviceOwnerEntry {
                device: c.device.clone(),
                owner: self.owners.get(&c.device).map(|o| o.label()),
            })
            .collect();

        StatusReport {
            cameras,
            mixer: self.mixer.status(),
            devices,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Event handling
    ////////////////////////////////////////////////////////////////////////

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Bus(note) => self.handle_bus_note(note),
            Event::PollTick => self.handle_poll_tick(),
        }
    }

    fn handle_bus_note(&mut self, note: BusNote) {
        let (pipeline, message) = match note {
            BusNote::Error { pipeline, message } => (pipeline, message),
            BusNote::Eos { pipeline } => (pipeline, "unexpected end-of-stream".to_string()),
        };

        if self.mixer.pipeline_name() == Some(pipeline.as_str()) {
            error!(%pipeline, %message, "Mixer pipeline fault");
            self.mixer.mark_failed(&message);
            self.release_owner(&DeviceOwner::Mixer);
            if self.rebuild_allowed("mixer") {
                if let Err(err) = self.mixer.rebuild() {
                    error!(%err, "Mixer auto-rebuild failed, parking in Error");
                }
            }
            return;
        }

        if let Some(idx) = self
            .ingests
            .iter()
            .position(|e| e.pipeline_name() == Some(pipeline.as_str()))
        {
            let camera = self.ingests[idx].camera_id().to_string();
            error!(camera = %camera, %pipeline, %message, "Ingest pipeline fault");

            // A branched recording rides this pipeline; its file is gone
            // with the capture.
            let rec_idx = self.recorder_idx(&camera).expect("recorder per camera");
            if self.recorders[rec_idx].is_recording()
                && self.recorders[rec_idx].mode() == RecorderMode::Branched
                && let Ok(report) = self.recorders[rec_idx].stop(None)
            {
                self.record_finished(&camera, &report);
            }

            self.ingests[idx].mark_failed(&message);
            let device = self.ingests[idx].device().to_string();
            self.owners.remove(&device);

            if self.rebuild_allowed(&format!("ingest:{camera}"))
                && let Err(err) = self.start_ingest(&camera)
            {
                error!(camera = %camera, %err, "Ingest auto-rebuild failed, parking in Error");
            }
            return;
        }

        if let Some(idx) = self
            .recorders
            .iter()
            .position(|r| r.pipeline_name() == Some(pipeline.as_str()))
        {
            let camera = self.recorders[idx].camera_id().to_string();
            error!(camera = %camera, %message, "Standalone recording pipeline fault");
            if let Ok(report) = self.recorders[idx].stop(None) {
                self.record_finished(&camera, &report);
            }
            self.recorders[idx].mark_failed(&message);
            let device = self
                .ingests
                .iter()
                .find(|e| e.camera_id() == camera)
                .map(|e| e.device().to_string());
            if let Some(device) = device {
                self.owners.remove(&device);
            }
            return;
        }

        // A note from a pipeline already torn down; stale, ignore.
    }

    /// One rebuild per engine per backoff window.
    fn rebuild_allowed(&mut self, key: &str) -> bool {
        let backoff = self.cfg.global.rebuild_backoff();
        let now = Instant::now();
        match self.last_rebuild.get(key) {
            Some(last) if now.duration_since(*last) < backoff => {
                warn!(engine = key, "Rebuild suppressed by backoff window");
                false
            }
            _ => {
                self.last_rebuild.insert(key.to_string(), now);
                true
            }
        }
    }

    fn handle_poll_tick(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_ingest_poll)
            >= Duration::from_secs(self.cfg.global.ingest_poll_sec)
        {
            self.last_ingest_poll = now;
            self.poll_ingests();
        }

        if now.duration_since(self.last_mixer_poll)
            >= Duration::from_secs(self.cfg.global.mixer_poll_sec)
        {
            self.last_mixer_poll = now;
            self.poll_mixer();
        }
    }

    fn poll_ingests(&mut self) {
        let cameras: Vec<String> = self
            .ingests
            .iter()
            .map(|e| e.camera_id().to_string())
            .collect();

        for camera in cameras {
            let idx = self.ingest_idx(&camera).expect("known camera");
            let device = self.ingests[idx].device().to_string();
            let report = self.probe.probe(Path::new(&device));
            let state = self.ingests[idx].state();

            match state {
                LifecycleState::Running | LifecycleState::Degraded => {
                    if !report.has_signal {
                        // Finalize a branched recording before the capture
                        // pipeline is torn down.
                        let rec_idx = self.recorder_idx(&camera).expect("recorder per camera");
                        if self.recorders[rec_idx].is_recording()
                            && self.recorders[rec_idx].mode() == RecorderMode::Branched
                            && let Ok(rep) =
                                self.recorders[rec_idx].stop(self.ingests[idx].handle())
                        {
                            self.record_finished(&camera, &rep);
                        }
                        self.ingests[idx].mark_signal_lost();
                        self.owners.remove(&device);
                        continue;
                    }

                    let caps_changed = report.current_caps.is_some()
                        && report.current_caps != self.ingests[idx].observed_caps();
                    if caps_changed {
                        info!(camera = %camera, "Observed caps changed on poll, rebuilding");
                        if let Err(err) = self.start_ingest(&camera) {
                            error!(camera = %camera, %err, "Caps-change rebuild failed");
                        }
                        continue;
                    }

                    let liveness = self.cfg.global.liveness_timeout();
                    let stalled = self.ingests[idx]
                        .buffer_age()
                        .map(|age| age > liveness)
                        .unwrap_or(false);
                    if stalled && state == LifecycleState::Running {
                        self.ingests[idx].mark_degraded("buffer flow stalled");
                    }

                    if self.ingests[idx].state() == LifecycleState::Degraded
                        && self.rebuild_allowed(&format!("ingest:{camera}"))
                        && let Err(err) = self.start_ingest(&camera)
                    {
                        error!(camera = %camera, %err, "Degraded rebuild failed");
                    }
                }
                LifecycleState::NoSignal => {
                    self.ingests[idx].set_signal_present(report.has_signal);
                    if report.has_signal {
                        info!(camera = %camera, "Signal returned, restarting ingest");
                        if report.kind == DeviceKind::HdmiBridge
                            && let Err(err) = self.probe.initialize(Path::new(&device))
                        {
                            warn!(camera = %camera, %err, "Bridge re-init failed, starting anyway");
                        }
                        if let Err(err) = self.start_ingest(&camera) {
                            error!(camera = %camera, %err, "Restart on signal recovery failed");
                        }
                    }
                }
                LifecycleState::Idle | LifecycleState::Error => {
                    // Record the fact; no action while parked or failed.
                    self.ingests[idx].set_signal_present(report.has_signal);
                }
                LifecycleState::Starting | LifecycleState::Stopping => {}
            }
        }
    }

    fn poll_mixer(&mut self) {
        if !matches!(
            self.mixer.state(),
            LifecycleState::Running | LifecycleState::Degraded
        ) {
            return;
        }

        let liveness = self.cfg.global.liveness_timeout();
        let stalled = self
            .mixer
            .buffer_age()
            .map(|age| age > liveness)
            .unwrap_or(false);
        if stalled && self.mixer.state() == LifecycleState::Running {
            self.mixer.mark_degraded("program buffer flow stalled");
        }

        if self.mixer.state() == LifecycleState::Degraded
            && self.rebuild_allowed("mixer")
            && let Err(err) = self.mixer.rebuild()
        {
            error!(%err, "Mixer degraded rebuild failed");
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Shutdown
    ////////////////////////////////////////////////////////////////////////

    /// Graceful teardown of everything: recordings finalize, pipelines
    /// drain to EOS, devices release.
    fn shutdown_all(&mut self) {
        info!("Supervisor shutting down all engines");

        let cameras: Vec<String> = self
            .recorders
            .iter()
            .filter(|r| r.is_recording())
            .map(|r| r.camera_id().to_string())
            .collect();
        for camera in cameras {
            if let Err(err) = self.stop_record(&camera) {
                error!(camera = %camera, %err, "Recording stop during shutdown failed");
            }
        }

        if let Err(err) = self.mixer.stop() {
            error!(%err, "Mixer stop during shutdown failed");
        }
        self.release_owner(&DeviceOwner::Mixer);

        let cameras: Vec<String> = self
            .ingests
            .iter()
            .map(|e| e.camera_id().to_string())
            .collect();
        for camera in cameras {
            if let Err(err) = self.stop_ingest(&camera) {
                error!(camera = %camera, %err, "Ingest stop during shutdown failed");
            }
        }
    }
}

/// Find and terminate processes holding the given device node open. Scans
/// `/proc/*/fd` the way `fuser` does; own process excluded.
fn terminate_device_holders(device: &Path) {
    let own_pid = std::process::id();
    let target = match std::fs::canonicalize(device) {
        Ok(p) => p,
        Err(_) => device.to_path_buf(),
    };

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else {
            continue;
        };

        let holds_device = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .map(|link| link == target)
                .unwrap_or(false)
        });

        if holds_device {
            warn!(pid, device = %device.display(), "Terminating process holding capture device");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
}
