use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::constants::CONTROL_QUEUE_DEPTH;
use crate::db_worker::{DbWorker, start_db_worker};
use crate::engines::ingest::IngestEngine;
use crate::engines::mixer::MixerEngine;
use crate::engines::recorder::RecorderEngine;
use crate::facade::ControlFacade;
use crate::pipeline::MediaInit;
use crate::pipeline::spec::EncoderCatalog;
use crate::probe::DeviceProbe;
use crate::scene_store::SceneStore;
use crate::supervisor::{Event, Msg, Supervisor};

/// Top-level service: wires the probe, engines, stores, and the
/// supervisor loop together, and hands out control facades.
pub struct CaptureService {
    pub running: Arc<AtomicBool>,
    facade: ControlFacade,
    cfg: AppConfig,
    supervisor_handle: Option<JoinHandle<()>>,
    ticker_handle: Option<JoinHandle<()>>,
    db_worker_handle: Option<JoinHandle<()>>,
}

impl CaptureService {
    /// Construct the service:
    /// - initialize the media framework (once, token-gated)
    /// - probe the encoder catalog (or take an injected one)
    /// - prepare directories and sweep stale partial recordings
    /// - start the DB worker thread
    /// - build one ingest + recorder engine per enabled camera
    /// - start the supervisor loop and the poll ticker
    pub fn new(
        cfg: AppConfig,
        probe: Arc<dyn DeviceProbe>,
        encoder_catalog: Option<EncoderCatalog>,
    ) -> Result<Self> {
        info!("Creating CaptureService");

        let media = MediaInit::acquire().context("media framework initialization failed")?;
        let catalog = encoder_catalog.unwrap_or_else(EncoderCatalog::detect);

        prep_recording_root(&cfg.global.recording_root)
            .context("recording root is not usable")?;

        info!("Creating DB worker...");
        let (db_tx, db_rx) = mpsc::channel();
        let db_worker = DbWorker::new(db_rx, &cfg.global.db_path)?;
        let db_worker_handle = start_db_worker(db_worker);

        let camera_ids: Vec<String> = cfg
            .cameras
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.id.clone())
            .collect();
        let scene_store = SceneStore::open(&cfg.global.scenes_dir, &camera_ids)
            .map_err(|e| anyhow!("scene store: {e}"))?;

        // Control queue plus a forwarder that turns framework bus traffic
        // into supervisor events; bus callbacks never touch engines.
        let (tx, rx) = mpsc::sync_channel::<Msg>(CONTROL_QUEUE_DEPTH);
        let (bus_tx, bus_rx) = mpsc::channel();
        {
            let tx = tx.clone();
            std::thread::spawn(move || {
                while let Ok(note) = bus_rx.recv() {
                    if tx.send(Msg::Event(Event::Bus(note))).is_err() {
                        break;
                    }
                }
            });
        }

        info!("Building engines for {} enabled cameras", camera_ids.len());
        let mut ingests = Vec::new();
        let mut recorders = Vec::new();
        for camera in cfg.cameras.iter().filter(|c| c.enabled) {
            let encoder = catalog
                .choose(camera.codec.into())
                .ok_or_else(|| anyhow!("no usable encoder for camera '{}'", camera.id))?;
            ingests.push(IngestEngine::new(
                media.clone(),
                camera.clone(),
                &cfg.global,
                encoder.clone(),
                bus_tx.clone(),
            ));
            recorders.push(RecorderEngine::new(
                media.clone(),
                camera.clone(),
                &cfg.global,
                encoder,
                bus_tx.clone(),
            ));
        }

        let mixer_encoder = catalog
            .choose(crate::pipeline::spec::Codec::H264)
            .ok_or_else(|| anyhow!("no usable encoder for the mixer"))?;
        let mixer = MixerEngine::new(media.clone(), &cfg.global, mixer_encoder, bus_tx.clone());

        let supervisor = Supervisor::new(
            cfg.clone(),
            probe,
            ingests,
            recorders,
            mixer,
            scene_store,
            db_tx,
        );
        let supervisor_handle = std::thread::spawn(move || supervisor.run(rx));

        let ticker_handle = {
            let tx = tx.clone();
            std::thread::spawn(move || {
                loop {
                    std::thread::sleep(Duration::from_secs(1));
                    match tx.try_send(Msg::Event(Event::PollTick)) {
                        Ok(()) => {}
                        // Queue full: the loop is busy, skip this tick.
                        Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
            })
        };

        let facade = ControlFacade::new(tx, cfg.global.start_timeout(), cfg.global.stop_timeout());

        Ok(Self {
            running: Arc::new(AtomicBool::new(true)),
            facade,
            cfg,
            supervisor_handle: Some(supervisor_handle),
            ticker_handle: Some(ticker_handle),
            db_worker_handle: Some(db_worker_handle),
        })
    }

    pub fn facade(&self) -> ControlFacade {
        self.facade.clone()
    }

    /// Kick off ingest for every enabled camera. Cameras without signal
    /// park in NoSignal; real failures are logged and left for the
    /// supervisor's health loop.
    pub fn start_enabled_ingests(&self) {
        for camera in self.cfg.cameras.iter().filter(|c| c.enabled) {
            match self.facade.start_ingest(&camera.id) {
                Ok(snapshot) => {
                    info!(camera = %camera.id, state = ?snapshot.state, "Ingest started");
                }
                Err(err) => {
                    error!(camera = %camera.id, %err, "Ingest start failed at boot");
                }
            }
        }
    }

    /// Graceful shutdown: every pipeline drains to EOS, recordings
    /// finalize, worker threads join.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.supervisor_handle.is_none() {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);

        info!("Shutting down CaptureService");
        if let Err(err) = self.facade.shutdown() {
            warn!(%err, "Supervisor shutdown command failed");
        }
        if let Some(handle) = self.supervisor_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.ticker_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.db_worker_handle.take() {
            let _ = handle.join();
        }
        info!("CaptureService stopped");
        Ok(())
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Create the recording root and promote recordings a previous process
/// left unfinalized: `<name>.part` files are renamed to their final name
/// and logged as possibly truncated.
fn prep_recording_root(root: &str) -> Result<()> {
    fs::create_dir_all(root)?;

    let part_regex = Regex::new(r"\.part$")?;
    sweep_part_files(Path::new(root), &part_regex)?;
    Ok(())
}

fn sweep_part_files(dir: &Path, part_regex: &Regex) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            sweep_part_files(&path, part_regex)?;
            continue;
        }

        let name = entry.file_name();
        let name = name.to_string_lossy();
        if part_regex.is_match(&name) {
            let final_path = path.with_file_name(part_regex.replace(&name, "").to_string());
            warn!(
                from = %path.display(),
                to = %final_path.display(),
                "Recovering partial recording from previous run (possibly truncated)"
            );
            let _ = fs::rename(&path, &final_path);
        }
    }
    Ok(())
}
