use anyhow::{Context, Result, bail};
use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use quadcast::config::{load_config, verify_app_config};
use quadcast::log::setup_trace_logging;
use quadcast::probe::V4l2DeviceProbe;
use quadcast::service::CaptureService;

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "quadcast.toml".to_string());

    let cfg = load_config(&config_path)
        .with_context(|| format!("failed to load config from '{config_path}'"))?;
    if let Err(reason) = verify_app_config(&cfg) {
        bail!("invalid configuration: {reason}");
    }
    for camera in cfg.cameras.iter().filter(|c| c.enabled) {
        if !std::path::Path::new(&camera.device).exists() {
            bail!(
                "device '{}' for camera '{}' is not present",
                camera.device,
                camera.id
            );
        }
    }

    setup_trace_logging(cfg.global.log_level.as_deref());

    let mut service = CaptureService::new(cfg, Arc::new(V4l2DeviceProbe), None)?;
    service.start_enabled_ingests();

    // Signal handlers only flip the running flag; shutdown happens on the
    // main thread so every pipeline drains.
    let running = service.running.clone();
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP])?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            println!("Received signal {sig}, shutting down");
            running.store(false, Ordering::SeqCst);
        }
    });

    while service.running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    service.shutdown()?;
    Ok(())
}
