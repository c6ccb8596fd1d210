use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::caps::{PixelFormat, VideoCaps};
use crate::error::{QuadcastError, Result};

/// VIDIOC_QUERYCAP ioctl number
const VIDIOC_QUERYCAP: libc::c_ulong = 0x8068_5600;
/// VIDIOC_G_FMT / VIDIOC_S_FMT ioctl numbers (64-bit layout)
const VIDIOC_G_FMT: libc::c_ulong = 0xC0D0_5604;
const VIDIOC_S_FMT: libc::c_ulong = 0xC0D0_5605;
/// VIDIOC_G_PARM ioctl number
const VIDIOC_G_PARM: libc::c_ulong = 0xC0CC_5615;

const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;

/// V4L2 capability structure for VIDIOC_QUERYCAP
#[repr(C)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

/// v4l2_pix_format, the head of the v4l2_format union for capture devices
#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    r#priv: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

/// v4l2_format: type word, padding to the union's 8-byte alignment, then
/// 200 bytes of union payload. 208 bytes total on 64-bit.
#[repr(C)]
struct V4l2Format {
    type_: u32,
    _pad: u32,
    fmt: [u8; 200],
}

/// v4l2_streamparm for VIDIOC_G_PARM; capture.timeperframe sits at the
/// head of the union after type.
#[repr(C)]
struct V4l2Streamparm {
    type_: u32,
    // v4l2_captureparm
    capability: u32,
    capturemode: u32,
    timeperframe_num: u32,
    timeperframe_den: u32,
    extendedmode: u32,
    readbuffers: u32,
    reserved: [u32; 4],
    _union_tail: [u8; 160],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    /// HDMI-to-CSI bridge chip behind a V4L2 subdevice (tc358743 and kin).
    HdmiBridge,
    /// SoC-native HDMI receiver.
    HdmiNative,
    Usb,
    Unknown,
}

/// Result of probing one capture device. The caller decides policy; the
/// probe never retries.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub exists: bool,
    pub openable_exclusively: bool,
    pub kind: DeviceKind,
    pub current_caps: Option<VideoCaps>,
    pub has_signal: bool,
}

impl ProbeReport {
    pub fn absent() -> Self {
        Self {
            exists: false,
            openable_exclusively: false,
            kind: DeviceKind::Unknown,
            current_caps: None,
            has_signal: false,
        }
    }
}

/// Capability boundary for device introspection. One platform
/// implementation drives real V4L2 ioctls; the stub serves development
/// hosts and tests.
pub trait DeviceProbe: Send + Sync {
    /// Idempotent, side-effect-free snapshot of one device.
    fn probe(&self, device: &Path) -> ProbeReport;

    /// One-shot re-initialization of a bridge subdevice, invoked only on
    /// explicit request (signal recovery on HdmiBridge inputs).
    fn initialize(&self, device: &Path) -> Result<()>;
}

pub struct V4l2DeviceProbe;

impl V4l2DeviceProbe {
    fn query_cap(fd: RawFd) -> Option<V4l2Capability> {
        let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(fd, VIDIOC_QUERYCAP as _, &mut cap as *mut V4l2Capability) };
        if rc < 0 { None } else { Some(cap) }
    }

    fn query_format(fd: RawFd) -> Option<V4l2PixFormat> {
        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let rc = unsafe { libc::ioctl(fd, VIDIOC_G_FMT as _, &mut fmt as *mut V4l2Format) };
        if rc < 0 {
            return None;
        }
        let pix = unsafe { std::ptr::read_unaligned(fmt.fmt.as_ptr() as *const V4l2PixFormat) };
        Some(pix)
    }

    fn query_framerate(fd: RawFd) -> Option<(u32, u32)> {
        let mut parm: V4l2Streamparm = unsafe { std::mem::zeroed() };
        parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let rc = unsafe { libc::ioctl(fd, VIDIOC_G_PARM as _, &mut parm as *mut V4l2Streamparm) };
        if rc < 0 || parm.timeperframe_num == 0 {
            return None;
        }
        // timeperframe is the interval; fps is the inverse
        Some((parm.timeperframe_den, parm.timeperframe_num))
    }

    fn classify(cap: &V4l2Capability) -> DeviceKind {
        let len = cap.driver.iter().position(|&c| c == 0).unwrap_or(16);
        let driver = String::from_utf8_lossy(&cap.driver[..len]).to_lowercase();
        if driver.contains("tc35") || driver.contains("lt6911") || driver.contains("bridge") {
            DeviceKind::HdmiBridge
        } else if driver.contains("hdmirx") || driver.contains("hdmi") {
            DeviceKind::HdmiNative
        } else if driver.contains("uvc") {
            DeviceKind::Usb
        } else {
            DeviceKind::Unknown
        }
    }

    /// Non-blocking exclusive lock to test openability. The lock is
    /// dropped before this function returns; it is never held across the
    /// probe call.
    fn test_exclusive(file: &File) -> bool {
        let fd = file.as_raw_fd();
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            unsafe { libc::flock(fd, libc::LOCK_UN) };
            true
        } else {
            false
        }
    }

    fn caps_from_fd(fd: RawFd) -> Option<VideoCaps> {
        let pix = Self::query_format(fd)?;
        let (num, den) = Self::query_framerate(fd).unwrap_or((0, 1));
        Some(VideoCaps {
            width: pix.width,
            height: pix.height,
            fps_num: num,
            fps_den: den.max(1),
            format: PixelFormat::from_v4l2_fourcc(pix.pixelformat),
        })
    }
}

impl DeviceProbe for V4l2DeviceProbe {
    fn probe(&self, device: &Path) -> ProbeReport {
        if !device.exists() {
            return ProbeReport::absent();
        }

        let file = match OpenOptions::new().read(true).write(true).open(device) {
            Ok(f) => f,
            Err(err) => {
                debug!(device = %device.display(), %err, "Capture device not openable");
                return ProbeReport {
                    exists: true,
                    openable_exclusively: false,
                    kind: DeviceKind::Unknown,
                    current_caps: None,
                    has_signal: false,
                };
            }
        };

        let fd = file.as_raw_fd();
        let kind = match Self::query_cap(fd) {
            Some(cap) if cap.capabilities & V4L2_CAP_VIDEO_CAPTURE != 0
                || cap.device_caps & V4L2_CAP_VIDEO_CAPTURE != 0 =>
            {
                Self::classify(&cap)
            }
            Some(_) | None => DeviceKind::Unknown,
        };

        let openable_exclusively = Self::test_exclusive(&file);
        let current_caps = Self::caps_from_fd(fd);
        let has_signal = current_caps.map(|c| c.is_signal()).unwrap_or(false);

        debug!(
            device = %device.display(),
            ?kind,
            openable_exclusively,
            has_signal,
            caps = current_caps.map(|c| c.to_string()),
            "Probed capture device"
        );

        ProbeReport {
            exists: true,
            openable_exclusively,
            kind,
            current_caps,
            has_signal,
        }
    }

    fn initialize(&self, device: &Path) -> Result<()> {
        // Relock the bridge to the timings it currently detects: read the
        // active format back and set it again so the driver reprograms the
        // capture geometry after an HDMI replug.
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        let fd = file.as_raw_fd();

        let mut fmt: V4l2Format = unsafe { std::mem::zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let rc = unsafe { libc::ioctl(fd, VIDIOC_G_FMT as _, &mut fmt as *mut V4l2Format) };
        if rc < 0 {
            return Err(QuadcastError::Internal(format!(
                "VIDIOC_G_FMT failed on {} during re-init",
                device.display()
            )));
        }

        let rc = unsafe { libc::ioctl(fd, VIDIOC_S_FMT as _, &mut fmt as *mut V4l2Format) };
        if rc < 0 {
            warn!(device = %device.display(), "VIDIOC_S_FMT rejected during bridge re-init");
            return Err(QuadcastError::Internal(format!(
                "VIDIOC_S_FMT failed on {}",
                device.display()
            )));
        }

        Ok(())
    }
}

/// Probe for development hosts without capture hardware: serves canned
/// reports from a mutable map keyed by device path.
#[derive(Default)]
pub struct StubDeviceProbe {
    reports: Mutex<HashMap<String, ProbeReport>>,
}

impl StubDeviceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_report(&self, device: &str, report: ProbeReport) {
        self.reports
            .lock()
            .unwrap()
            .insert(device.to_string(), report);
    }

    pub fn with_signal(caps: VideoCaps) -> ProbeReport {
        ProbeReport {
            exists: true,
            openable_exclusively: true,
            kind: DeviceKind::HdmiBridge,
            current_caps: Some(caps),
            has_signal: caps.is_signal(),
        }
    }
}

impl DeviceProbe for StubDeviceProbe {
    fn probe(&self, device: &Path) -> ProbeReport {
        self.reports
            .lock()
            .unwrap()
            .get(&device.to_string_lossy().to_string())
            .cloned()
            .unwrap_or_else(ProbeReport::absent)
    }

    fn initialize(&self, _device: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::PixelFormat;

    #[test]
    fn struct_sizes_match_the_abi() {
        assert_eq!(std::mem::size_of::<V4l2Capability>(), 104);
        assert_eq!(std::mem::size_of::<V4l2Format>(), 208);
        assert_eq!(std::mem::size_of::<V4l2Streamparm>(), 204);
    }

    #[test]
    fn stub_probe_round_trips_reports() {
        let stub = StubDeviceProbe::new();
        let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::Nv12);
        stub.set_report("/dev/video0", StubDeviceProbe::with_signal(caps));

        let report = stub.probe(Path::new("/dev/video0"));
        assert!(report.exists && report.has_signal);
        assert_eq!(report.current_caps.unwrap().width, 1920);

        let missing = stub.probe(Path::new("/dev/video9"));
        assert!(!missing.exists);
    }
}
