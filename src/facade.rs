use std::sync::mpsc::{self, SyncSender};
use std::time::Duration;

use crate::error::{QuadcastError, Result};
use crate::scene::Scene;
use crate::status::{CameraSnapshot, MixerSnapshot, RecorderStatus, SceneSummary, StatusReport};
use crate::supervisor::{Command, Msg, RecordingStopped, SceneApplied};

/// Narrow synchronous API the HTTP layer consumes. Every call posts one
/// command to the supervisor queue and awaits the typed reply; ordering is
/// whatever order commands land on the queue.
#[derive(Clone)]
pub struct ControlFacade {
    tx: SyncSender<Msg>,
    /// Upper bound on one command round-trip: the worst case is a scene
    /// rebuild (stop + settle + start), plus margin.
    reply_timeout: Duration,
}

impl ControlFacade {
    pub fn new(tx: SyncSender<Msg>, start_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            tx,
            reply_timeout: start_timeout + stop_timeout + Duration::from_secs(15),
        }
    }

    fn roundtrip<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Msg::Command(make(reply_tx)))
            .map_err(|_| QuadcastError::Internal("supervisor queue closed".to_string()))?;
        reply_rx
            .recv_timeout(self.reply_timeout)
            .map_err(|_| QuadcastError::timeout("supervisor reply", self.reply_timeout))
    }

    pub fn start_ingest(&self, camera: &str) -> Result<CameraSnapshot> {
        let camera = camera.to_string();
        self.roundtrip(|reply| Command::StartIngest { camera, reply })?
    }

    pub fn stop_ingest(&self, camera: &str) -> Result<CameraSnapshot> {
        let camera = camera.to_string();
        self.roundtrip(|reply| Command::StopIngest { camera, reply })?
    }

    pub fn start_record(&self, camera: &str) -> Result<RecorderStatus> {
        let camera = camera.to_string();
        self.roundtrip(|reply| Command::StartRecord { camera, reply })?
    }

    pub fn stop_record(&self, camera: &str) -> Result<RecordingStopped> {
        let camera = camera.to_string();
        self.roundtrip(|reply| Command::StopRecord { camera, reply })?
    }

    pub fn record_status(&self, camera: &str) -> Result<RecorderStatus> {
        let camera = camera.to_string();
        self.roundtrip(|reply| Command::RecordStatus { camera, reply })?
    }

    pub fn get_status(&self) -> Result<StatusReport> {
        self.roundtrip(|reply| Command::GetStatus { reply })
    }

    pub fn list_scenes(&self) -> Result<Vec<SceneSummary>> {
        self.roundtrip(|reply| Command::ListScenes { reply })
    }

    pub fn get_scene(&self, id: &str) -> Result<Scene> {
        let id = id.to_string();
        self.roundtrip(|reply| Command::GetScene { id, reply })?
    }

    pub fn put_scene(&self, scene: Scene) -> Result<Scene> {
        self.roundtrip(|reply| Command::PutScene { scene, reply })?
    }

    pub fn delete_scene(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.roundtrip(|reply| Command::DeleteScene { id, reply })?
    }

    pub fn apply_scene(&self, id: &str) -> Result<SceneApplied> {
        let id = id.to_string();
        self.roundtrip(|reply| Command::ApplyScene { id, reply })?
    }

    pub fn start_mixer(&self) -> Result<MixerSnapshot> {
        self.roundtrip(|reply| Command::StartMixer { reply })?
    }

    pub fn stop_mixer(&self) -> Result<MixerSnapshot> {
        self.roundtrip(|reply| Command::StopMixer { reply })?
    }

    pub fn get_mixer_status(&self) -> Result<MixerSnapshot> {
        self.roundtrip(|reply| Command::GetMixerStatus { reply })
    }

    /// Graceful shutdown; returns once every engine has drained.
    pub fn shutdown(&self) -> Result<()> {
        self.roundtrip(|reply| Command::Shutdown { reply })
    }
}
