use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{info, warn};

use crate::config::{CameraConfig, GlobalConfig, RecorderMode};
use crate::error::{QuadcastError, Result};
use crate::pipeline::MediaInit;
use crate::pipeline::builder;
use crate::pipeline::handle::{BusNote, PipelineHandle};
use crate::pipeline::spec::{CaptureParams, Container, EncoderKind, PipelineSpec};
use crate::probe::ProbeReport;
use crate::status::RecorderStatus;

use super::LifecycleState;

/// Suffix a recording carries until its container is finalized. Files
/// still wearing it after a crash are swept at startup.
pub const PART_SUFFIX: &str = ".part";

struct ActiveRecording {
    final_path: PathBuf,
    part_path: PathBuf,
    started: Instant,
}

/// The elements of a file branch attached to a running ingest tee.
struct RecordBranch {
    tee_pad: gst::Pad,
    elements: Vec<gst::Element>,
}

/// Outcome of a recorder stop, reported back to the caller and persisted
/// in the recordings index.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub duration_ms: u64,
    /// Finalization was forced; the container may be truncated.
    pub truncated: bool,
}

/// Per-camera recording. Branched mode shares the ingest capture through
/// its tee; standalone mode runs a dedicated capture-to-file pipeline and
/// requires the ingest to be idle (the supervisor enforces that).
pub struct RecorderEngine {
    media: MediaInit,
    camera: CameraConfig,
    mode: RecorderMode,
    encoder: EncoderKind,
    recording_root: PathBuf,
    start_timeout: Duration,
    stop_timeout: Duration,
    notes: Sender<BusNote>,

    state: LifecycleState,
    active: Option<ActiveRecording>,
    branch: Option<RecordBranch>,
    handle: Option<PipelineHandle>,
    last_error: Option<String>,
}

impl RecorderEngine {
    pub fn new(
        media: MediaInit,
        camera: CameraConfig,
        global: &GlobalConfig,
        encoder: EncoderKind,
        notes: Sender<BusNote>,
    ) -> Self {
        Self {
            media,
            camera,
            mode: global.recorder_mode,
            encoder,
            recording_root: PathBuf::from(&global.recording_root),
            start_timeout: global.start_timeout(),
            stop_timeout: global.stop_timeout(),
            notes,
            state: LifecycleState::Idle,
            active: None,
            branch: None,
            handle: None,
            last_error: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera.id
    }

    pub fn mode(&self) -> RecorderMode {
        self.mode
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.final_path.as_path())
    }

    /// Name of the standalone pipeline, when one is running.
    pub fn pipeline_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.name())
    }

    /// Pick the recording path: expand the template, refuse an unwritable
    /// directory, disambiguate an existing path with a numeric suffix.
    fn allocate_path(&self) -> Result<PathBuf> {
        let now = chrono::Local::now();
        let relative = expand_template(&self.camera.record_template, &self.camera.id, &now)?;
        let candidate = self.recording_root.join(relative);

        if let Some(parent) = candidate.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(unique_path(&candidate))
    }

    /// Start a branched recording on the running ingest pipeline. The
    /// capture keeps flowing; only a file branch is added.
    pub fn start_branched(&mut self, ingest: &PipelineHandle) -> Result<PathBuf> {
        if let Some(active) = &self.active {
            // Idempotent happy path: already recording.
            return Ok(active.final_path.clone());
        }

        let final_path = self.allocate_path()?;
        let part_path = part_path_for(&final_path);
        let container = Container::for_extension(&final_path.to_string_lossy());

        self.attach_branch(ingest, &part_path, container)?;

        info!(
            camera = %self.camera.id,
            path = %final_path.display(),
            "Recording started (branched)"
        );
        self.active = Some(ActiveRecording {
            final_path: final_path.clone(),
            part_path,
            started: Instant::now(),
        });
        self.state = LifecycleState::Running;
        self.last_error = None;
        Ok(final_path)
    }

    fn attach_branch(
        &mut self,
        ingest: &PipelineHandle,
        part_path: &Path,
        container: Container,
    ) -> Result<()> {
        let pipeline = ingest.pipeline();
        let tee = ingest.by_name("t").ok_or_else(|| {
            QuadcastError::Internal(format!(
                "ingest pipeline for '{}' has no tee to branch from",
                self.camera.id
            ))
        })?;

        let queue = gst::ElementFactory::make("queue")
            .name("rec_queue")
            .property("max-size-buffers", 0u32)
            .property("max-size-bytes", 0u32)
            .property("max-size-time", 3_000_000_000u64)
            .build()?;
        let parse = gst::ElementFactory::make(self.encoder.parser())
            .name("rec_parse")
            .build()?;
        let mux = gst::ElementFactory::make(container.muxer())
            .name("rec_mux")
            .build()?;
        let sink = gst::ElementFactory::make("filesink")
            .name("rec_sink")
            .property("location", part_path.to_string_lossy().as_ref())
            .build()?;

        pipeline.add_many([&queue, &parse, &mux, &sink])?;
        gst::Element::link_many([&queue, &parse, &mux, &sink])?;
        for el in [&queue, &parse, &mux, &sink] {
            el.sync_state_with_parent()?;
        }

        let tee_pad = tee.request_pad_simple("src_%u").ok_or_else(|| {
            QuadcastError::Pipeline("tee refused a request pad for recording".to_string())
        })?;
        let queue_pad = queue
            .static_pad("sink")
            .ok_or_else(|| QuadcastError::Pipeline("record queue has no sink pad".to_string()))?;
        tee_pad.link(&queue_pad).map_err(|err| {
            QuadcastError::Pipeline(format!("failed to link recording branch: {err:?}"))
        })?;

        self.branch = Some(RecordBranch {
            tee_pad,
            elements: vec![queue, parse, mux, sink],
        });
        Ok(())
    }

    /// Detach the file branch: block the tee pad, cut the link, push EOS
    /// down the branch and wait for it to reach the file sink so the muxer
    /// finalizes. Returns whether finalization had to be abandoned.
    fn detach_branch(&mut self, ingest: &PipelineHandle) -> Result<bool> {
        let branch = match self.branch.take() {
            Some(b) => b,
            None => return Ok(false),
        };
        let pipeline = ingest.pipeline();

        let sink = branch
            .elements
            .last()
            .expect("record branch always has elements");
        let (eos_tx, eos_rx) = mpsc::channel::<()>();
        if let Some(sink_pad) = sink.static_pad("sink") {
            let eos_tx = Mutex::new(eos_tx);
            sink_pad.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_pad, info| {
                if let Some(gst::PadProbeData::Event(event)) = &info.data
                    && event.type_() == gst::EventType::Eos
                {
                    let _ = eos_tx.lock().unwrap().send(());
                    return gst::PadProbeReturn::Remove;
                }
                gst::PadProbeReturn::Ok
            });
        }

        // Hold the tee branch while it is cut so no buffer races the unlink.
        branch
            .tee_pad
            .add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_pad, _info| {
                gst::PadProbeReturn::Ok
            });

        let queue_pad = branch.elements[0]
            .static_pad("sink")
            .ok_or_else(|| QuadcastError::Pipeline("record queue lost its sink pad".to_string()))?;
        let _ = branch.tee_pad.unlink(&queue_pad);
        queue_pad.send_event(gst::event::Eos::new());

        let truncated = eos_rx.recv_timeout(self.stop_timeout).is_err();
        if truncated {
            warn!(
                camera = %self.camera.id,
                "Recording EOS did not reach the file sink in time; file may be truncated"
            );
        }

        if let Some(tee) = ingest.by_name("t") {
            tee.release_request_pad(&branch.tee_pad);
        }
        for el in &branch.elements {
            let _ = el.set_state(gst::State::Null);
        }
        for el in &branch.elements {
            let _ = pipeline.remove(el);
        }

        Ok(truncated)
    }

    /// Start a standalone capture-to-file pipeline. The supervisor has
    /// already idled the ingest and handed over the device.
    pub fn start_standalone(&mut self, report: &ProbeReport) -> Result<PathBuf> {
        if let Some(active) = &self.active {
            return Ok(active.final_path.clone());
        }

        if !report.has_signal {
            self.state = LifecycleState::NoSignal;
            return Err(QuadcastError::DeviceNoSignal(self.camera.id.clone()));
        }
        let caps = report.current_caps.ok_or_else(|| {
            QuadcastError::DeviceCapsUnsupported(format!(
                "camera '{}' reports signal but no caps",
                self.camera.id
            ))
        })?;

        let final_path = self.allocate_path()?;
        let part_path = part_path_for(&final_path);
        let container = Container::for_extension(&final_path.to_string_lossy());

        let spec = PipelineSpec::CaptureToFile {
            capture: CaptureParams {
                device: self.camera.device.clone(),
                caps,
                target_width: self.camera.width,
                target_height: self.camera.height,
                target_fps: self.camera.framerate,
                bitrate_kbps: self.camera.bitrate_kbps,
            },
            encoder: self.encoder.clone(),
            container,
            file_path: part_path.to_string_lossy().to_string(),
        };
        let description = builder::build(&spec)?;
        let name = spec.pipeline_name();

        self.state = LifecycleState::Starting;
        let handle =
            PipelineHandle::launch(&self.media, &name, &description, Some(self.notes.clone()))?;
        match handle.start(self.start_timeout) {
            Ok(()) => {
                self.handle = Some(handle);
                self.active = Some(ActiveRecording {
                    final_path: final_path.clone(),
                    part_path,
                    started: Instant::now(),
                });
                self.state = LifecycleState::Running;
                self.last_error = None;
                info!(
                    camera = %self.camera.id,
                    path = %final_path.display(),
                    "Recording started (standalone)"
                );
                Ok(final_path)
            }
            Err(err) => {
                drop(handle);
                self.state = LifecycleState::Error;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Stop recording and finalize the file. Branched mode needs the
    /// ingest handle the branch lives in. Always succeeds from the
    /// caller's perspective once a recording exists; `truncated` reports
    /// whether finalization was clean.
    pub fn stop(&mut self, ingest: Option<&PipelineHandle>) -> Result<StopReport> {
        let active = self.active.take().ok_or_else(|| {
            QuadcastError::NotFound(format!("no active recording for camera '{}'", self.camera.id))
        })?;

        self.state = LifecycleState::Stopping;

        let truncated = if let Some(handle) = self.handle.take() {
            // Standalone: EOS the whole pipeline so the muxer finalizes.
            let outcome = handle.stop(true, self.stop_timeout)?;
            outcome.forced
        } else if let Some(ingest) = ingest {
            self.detach_branch(ingest)?
        } else {
            // Ingest died underneath the branch; nothing to finalize against.
            self.branch = None;
            true
        };

        // Promote the .part file to its final name whatever happened;
        // a truncated recording is still worth keeping.
        if active.part_path.exists() {
            std::fs::rename(&active.part_path, &active.final_path)?;
        }

        let bytes = std::fs::metadata(&active.final_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let report = StopReport {
            path: active.final_path,
            bytes,
            duration_ms: active.started.elapsed().as_millis() as u64,
            truncated,
        };

        if truncated {
            warn!(
                camera = %self.camera.id,
                path = %report.path.display(),
                "Recording stopped with forced finalization"
            );
        } else {
            info!(
                camera = %self.camera.id,
                path = %report.path.display(),
                bytes,
                "Recording stopped"
            );
        }

        self.state = LifecycleState::Idle;
        Ok(report)
    }

    pub fn status(&self) -> RecorderStatus {
        let (file, bytes, duration_ms) = match &self.active {
            Some(active) => (
                Some(active.final_path.to_string_lossy().to_string()),
                std::fs::metadata(&active.part_path)
                    .map(|m| m.len())
                    .unwrap_or(0),
                active.started.elapsed().as_millis() as u64,
            ),
            None => (None, 0, 0),
        };
        RecorderStatus {
            state: self.state,
            file,
            bytes_written: bytes,
            duration_ms,
        }
    }

    pub fn mark_failed(&mut self, message: &str) {
        self.handle = None;
        self.branch = None;
        self.active = None;
        self.state = LifecycleState::Error;
        self.last_error = Some(message.to_string());
    }
}

/// Expand the recording template: `{camera}` placeholder plus strftime
/// fields against the given wall-clock time.
pub fn expand_template(
    template: &str,
    camera_id: &str,
    now: &chrono::DateTime<chrono::Local>,
) -> Result<String> {
    let with_camera = template.replace("{camera}", camera_id);
    let items: Vec<Item<'_>> = StrftimeItems::new(&with_camera).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(QuadcastError::InvalidArgument(format!(
            "record template '{template}' has an invalid strftime field"
        )));
    }
    Ok(now.format_with_items(items.into_iter()).to_string())
}

/// Append `-1`, `-2`… before the extension until the path is unclaimed.
pub fn unique_path(candidate: &Path) -> PathBuf {
    if !candidate.exists() && !part_path_for(candidate).exists() {
        return candidate.to_path_buf();
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = candidate.parent().unwrap_or_else(|| Path::new("."));

    let mut n = 1u32;
    loop {
        let next = parent.join(format!("{stem}-{n}{ext}"));
        if !next.exists() && !part_path_for(&next).exists() {
            return next;
        }
        n += 1;
    }
}

pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut s = final_path.as_os_str().to_os_string();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expands_camera_and_time() {
        let now = chrono::Local::now();
        let out = expand_template("{camera}/%Y/%m/clip.mp4", "cam2", &now).unwrap();
        assert!(out.starts_with("cam2/"));
        assert!(out.ends_with("clip.mp4"));
        assert!(!out.contains('%'));
    }

    #[test]
    fn template_rejects_bad_strftime() {
        let now = chrono::Local::now();
        assert!(expand_template("{camera}/%Q.mp4", "cam0", &now).is_err());
    }

    #[test]
    fn unique_path_suffixes_existing_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("rec.mp4");
        assert_eq!(unique_path(&base), base);

        std::fs::write(&base, b"x").unwrap();
        assert_eq!(unique_path(&base), tmp.path().join("rec-1.mp4"));

        std::fs::write(tmp.path().join("rec-1.mp4"), b"x").unwrap();
        assert_eq!(unique_path(&base), tmp.path().join("rec-2.mp4"));
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path_for(Path::new("/a/b.mp4")),
            PathBuf::from("/a/b.mp4.part")
        );
    }
}
