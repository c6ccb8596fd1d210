use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

use crate::error::{QuadcastError, Result};

use super::MediaInit;

/// Bus traffic the supervisor cares about, tagged with the pipeline name.
#[derive(Debug, Clone)]
pub enum BusNote {
    Error { pipeline: String, message: String },
    Eos { pipeline: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// EOS did not propagate within the deadline and teardown was forced.
    pub forced: bool,
}

/// Owning handle to one running media pipeline.
///
/// Owns the bus-watcher thread; bus errors and EOS are forwarded to the
/// supervisor's event queue and mirrored in local flags so `stop` can wait
/// for drain. Drop guarantees teardown to Null.
pub struct PipelineHandle {
    name: String,
    pipeline: gst::Pipeline,
    watcher: Option<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
    eos_seen: Arc<AtomicBool>,
    error_seen: Arc<AtomicBool>,
    created: Instant,
    /// Milliseconds since `created` of the last buffer through `flowmon`.
    last_buffer_ms: Arc<AtomicU64>,
}

impl PipelineHandle {
    /// Parse a launch description and wire up monitoring. The pipeline is
    /// left in Null; call [`start`](Self::start).
    pub fn launch(
        _token: &MediaInit,
        name: &str,
        description: &str,
        notes: Option<Sender<BusNote>>,
    ) -> Result<Self> {
        debug!(pipeline = name, %description, "Launching pipeline");

        let element = gst::parse::launch(description)?;
        let pipeline = element
            .downcast::<gst::Pipeline>()
            .map_err(|_| QuadcastError::Pipeline("description is not a pipeline".to_string()))?;

        let shutting_down = Arc::new(AtomicBool::new(false));
        let eos_seen = Arc::new(AtomicBool::new(false));
        let error_seen = Arc::new(AtomicBool::new(false));
        let created = Instant::now();
        let last_buffer_ms = Arc::new(AtomicU64::new(0));

        // Buffer-flow monitor for liveness: every handoff stamps the clock.
        if let Some(flowmon) = pipeline.by_name("flowmon") {
            let last = last_buffer_ms.clone();
            let epoch = created;
            flowmon.connect("handoff", false, move |_args| {
                last.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                None
            });
        }

        let bus = pipeline
            .bus()
            .ok_or_else(|| QuadcastError::Pipeline("pipeline has no bus".to_string()))?;

        let watcher = {
            let name = name.to_string();
            let shutting_down = shutting_down.clone();
            let eos_seen = eos_seen.clone();
            let error_seen = error_seen.clone();
            std::thread::spawn(move || {
                bus_watcher(&name, bus, notes, shutting_down, eos_seen, error_seen);
            })
        };

        Ok(Self {
            name: name.to_string(),
            pipeline,
            watcher: Some(watcher),
            shutting_down,
            eos_seen,
            error_seen,
            created,
            last_buffer_ms,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive the pipeline to Playing, bounded by `deadline`. On breach or
    /// failure the pipeline is forcibly torn down before the error returns,
    /// so a failed start never leaks the capture device.
    pub fn start(&self, deadline: Duration) -> Result<()> {
        if let Err(err) = self.pipeline.set_state(gst::State::Playing) {
            self.force_teardown();
            return Err(QuadcastError::Pipeline(format!(
                "{}: refused to start: {err}",
                self.name
            )));
        }

        let timeout = gst::ClockTime::from_mseconds(deadline.as_millis() as u64);
        let (result, current, _pending) = self.pipeline.state(timeout);

        if self.error_seen.load(Ordering::SeqCst) {
            self.force_teardown();
            return Err(QuadcastError::Pipeline(format!(
                "{}: bus error during start",
                self.name
            )));
        }

        match result {
            Ok(_) if current == gst::State::Playing => {
                info!(pipeline = %self.name, "Pipeline running");
                self.log_negotiated_format();
                Ok(())
            }
            _ => {
                self.force_teardown();
                Err(QuadcastError::timeout(
                    format!("start of pipeline '{}'", self.name),
                    deadline,
                ))
            }
        }
    }

    /// Stop the pipeline. Graceful stops send EOS and wait for it to drain
    /// through the sinks before teardown; the outcome records whether the
    /// drain had to be abandoned.
    pub fn stop(&self, graceful: bool, deadline: Duration) -> Result<StopOutcome> {
        let mut forced = !graceful;

        if graceful && !self.eos_seen.load(Ordering::SeqCst) {
            if self.pipeline.send_event(gst::event::Eos::new()) {
                let gave_up = Instant::now() + deadline;
                while !self.eos_seen.load(Ordering::SeqCst) {
                    if Instant::now() >= gave_up {
                        warn!(pipeline = %self.name, "EOS did not drain in time, forcing teardown");
                        forced = true;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            } else {
                warn!(pipeline = %self.name, "Pipeline rejected EOS event");
                forced = true;
            }
        }

        self.force_teardown();
        Ok(StopOutcome { forced })
    }

    /// What actually got negotiated at the flow monitor, decoded through
    /// the video library rather than raw caps strings.
    fn log_negotiated_format(&self) {
        if let Some(flowmon) = self.pipeline.by_name("flowmon")
            && let Some(pad) = flowmon.static_pad("src")
            && let Some(caps) = pad.current_caps()
            && let Ok(info) = gst_video::VideoInfo::from_caps(&caps)
        {
            debug!(
                pipeline = %self.name,
                width = info.width(),
                height = info.height(),
                format = ?info.format(),
                "Negotiated video format"
            );
        }
    }

    fn force_teardown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            error!(pipeline = %self.name, %err, "Failed to reach Null during teardown");
        }
    }

    /// Age of the last buffer through the flow monitor. `None` until the
    /// first buffer arrives.
    pub fn buffer_age(&self) -> Option<Duration> {
        let stamp = self.last_buffer_ms.load(Ordering::Relaxed);
        if stamp == 0 {
            return None;
        }
        Some(
            self.created
                .elapsed()
                .saturating_sub(Duration::from_millis(stamp)),
        )
    }

    pub fn had_error(&self) -> bool {
        self.error_seen.load(Ordering::SeqCst)
    }

    pub fn current_state(&self) -> gst::State {
        self.pipeline.state(gst::ClockTime::ZERO).1
    }

    /// Set properties on a request pad of a named element; the hot path of
    /// scene reconfiguration.
    pub fn set_pad_properties(
        &self,
        element: &str,
        pad: &str,
        properties: &[(String, String)],
    ) -> Result<()> {
        let el = self.pipeline.by_name(element).ok_or_else(|| {
            QuadcastError::Pipeline(format!("{}: no element '{element}'", self.name))
        })?;
        let pad = el.static_pad(pad).ok_or_else(|| {
            QuadcastError::Pipeline(format!("{}: element '{element}' has no pad '{pad}'", self.name))
        })?;
        for (prop, value) in properties {
            pad.set_property_from_str(prop, value);
        }
        Ok(())
    }

    pub fn by_name(&self, element: &str) -> Option<gst::Element> {
        self.pipeline.by_name(element)
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.force_teardown();
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        debug!(pipeline = %self.name, "Pipeline handle dropped");
    }
}

/// Bus message loop, one thread per pipeline. Forwards fatal errors and
/// EOS to the supervisor and mirrors them into the handle's flags.
fn bus_watcher(
    name: &str,
    bus: gst::Bus,
    notes: Option<Sender<BusNote>>,
    shutting_down: Arc<AtomicBool>,
    eos_seen: Arc<AtomicBool>,
    error_seen: Arc<AtomicBool>,
) {
    use gst::MessageView;

    loop {
        if shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let msg = bus.timed_pop_filtered(
            gst::ClockTime::from_mseconds(500),
            &[gst::MessageType::Error, gst::MessageType::Eos],
        );

        let Some(msg) = msg else { continue };

        match msg.view() {
            MessageView::Eos(..) => {
                debug!(pipeline = name, "End-of-stream reached");
                eos_seen.store(true, Ordering::SeqCst);
                if let Some(tx) = &notes {
                    let _ = tx.send(BusNote::Eos {
                        pipeline: name.to_string(),
                    });
                }
                break;
            }
            MessageView::Error(err) => {
                let message = format!(
                    "{} ({})",
                    err.error(),
                    err.debug().map(|d| d.to_string()).unwrap_or_default()
                );
                error!(pipeline = name, %message, "Pipeline bus error");
                error_seen.store(true, Ordering::SeqCst);
                if let Some(tx) = &notes {
                    let _ = tx.send(BusNote::Error {
                        pipeline: name.to_string(),
                        message,
                    });
                }
                break;
            }
            _ => {}
        }
    }
}
