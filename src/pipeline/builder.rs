//! Pure translation of [`PipelineSpec`] values into gst-launch pipeline
//! descriptions.
//!
//! The builder is deterministic: identical specs produce byte-identical
//! descriptions, so callers can compare descriptions to decide whether an
//! in-place update is possible. All policy (encoder choice, caps) is input;
//! nothing here queries the system.

use std::collections::HashMap;
use std::fmt::Write;

use crate::caps::{PixelFormat, VideoCaps};
use crate::error::{QuadcastError, Result};
use crate::scene::{ResolvedScene, SourceBranch};

use super::spec::{CaptureParams, Container, EncoderKind, PipelineSpec};

/// Program output framerate the compositor runs at.
pub const PROGRAM_FPS: u32 = 30;

/// Leaky queue for publish/preview branches: never let a slow consumer
/// back-pressure the capture.
const LEAKY_QUEUE: &str = "queue leaky=downstream max-size-buffers=2";
/// Non-leaky queue for file branches: recordings must not drop frames.
const FILE_QUEUE: &str = "queue max-size-buffers=0 max-size-bytes=0 max-size-time=3000000000";

pub fn build(spec: &PipelineSpec) -> Result<String> {
    match spec {
        PipelineSpec::CaptureToPublish {
            capture,
            encoder,
            publish_url,
        } => {
            let chain = capture_chain(capture, encoder)?;
            Ok(format!(
                "{chain} ! tee name=t allow-not-linked=true \
                 t. ! {LEAKY_QUEUE} ! {publish}",
                publish = publish_fragment(publish_url),
            ))
        }
        // Identical topology to CaptureToPublish; the variant exists so
        // callers state intent (a recorder branch may attach to `t`).
        PipelineSpec::CaptureTee {
            capture,
            encoder,
            publish_url,
        } => build(&PipelineSpec::CaptureToPublish {
            capture: capture.clone(),
            encoder: encoder.clone(),
            publish_url: publish_url.clone(),
        }),
        PipelineSpec::CaptureToFile {
            capture,
            encoder,
            container,
            file_path,
        } => {
            let chain = capture_chain(capture, encoder)?;
            Ok(format!(
                "{chain} ! {file}",
                file = file_fragment(*container, file_path),
            ))
        }
        PipelineSpec::MixerScene {
            scene,
            encoder,
            publish_url,
            file_sink,
        } => mixer_description(scene, encoder, publish_url, file_sink.as_ref()),
        PipelineSpec::FileSource {
            path,
            looping,
            encoder,
            publish_url,
        } => Ok(standalone_source_description(
            &branch_fragment(&SourceBranch::FileVideo {
                path: path.clone(),
                looping: *looping,
            })?,
            encoder,
            publish_url,
        )),
        PipelineSpec::StillSource {
            path,
            hold_ms,
            encoder,
            publish_url,
        } => Ok(standalone_source_description(
            &branch_fragment(&SourceBranch::StillImage {
                path: path.clone(),
                hold_ms: *hold_ms,
            })?,
            encoder,
            publish_url,
        )),
    }
}

/// A non-camera source encoded and published on its own: shared tail for
/// the FileSource/StillSource kinds.
fn standalone_source_description(
    source: &str,
    encoder: &EncoderKind,
    publish_url: &str,
) -> String {
    format!(
        "{source} ! videoconvert ! video/x-raw,format=NV12 \
         ! identity name=flowmon signal-handoffs=true ! {} ! {} config-interval=-1 \
         ! {LEAKY_QUEUE} ! {}",
        encoder_fragment(encoder, 4000, PROGRAM_FPS),
        encoder.parser(),
        publish_fragment(publish_url),
    )
}

/// Source caps as the capture driver delivers them, plus the decode stage
/// formats that are not raw video need.
fn source_caps_fragment(caps: &VideoCaps) -> Result<String> {
    let rate = format!("framerate={}/{}", caps.fps_num.max(1), caps.fps_den.max(1));
    match caps.format {
        PixelFormat::Mjpeg => Ok(format!(
            "image/jpeg,width={},height={},{rate} ! jpegdec",
            caps.width, caps.height
        )),
        f if f.is_bayer() => Ok(format!(
            "video/x-bayer,format={},width={},height={},{rate} ! bayer2rgb",
            f.gst_format().unwrap_or("bggr"),
            caps.width,
            caps.height
        )),
        f => {
            let format = f.gst_format().ok_or_else(|| {
                QuadcastError::DeviceCapsUnsupported(format!(
                    "no raw mapping for source format {f}"
                ))
            })?;
            Ok(format!(
                "video/x-raw,format={format},width={},height={},{rate}",
                caps.width, caps.height
            ))
        }
    }
}

/// Capture device through conversion, normalization, encoder, and parser.
/// Ends unterminated so callers append a tee or sink.
fn capture_chain(capture: &CaptureParams, encoder: &EncoderKind) -> Result<String> {
    let mut desc = String::new();

    write!(
        desc,
        "v4l2src device={} name=src ! {}",
        capture.device,
        source_caps_fragment(&capture.caps)?
    )
    .unwrap();

    // Normalize the rate before conversion when the source runs faster
    // than the target.
    if capture.caps.fps() > capture.target_fps {
        write!(
            desc,
            " ! videorate ! video/x-raw,framerate={}/1",
            capture.target_fps
        )
        .unwrap();
    }

    desc.push_str(" ! videoconvert");
    if capture.caps.width != capture.target_width || capture.caps.height != capture.target_height {
        write!(
            desc,
            " ! videoscale ! video/x-raw,format=NV12,width={},height={}",
            capture.target_width, capture.target_height
        )
        .unwrap();
    } else {
        desc.push_str(" ! video/x-raw,format=NV12");
    }

    write!(
        desc,
        " ! identity name=flowmon signal-handoffs=true ! {} ! {} config-interval=-1",
        encoder_fragment(encoder, capture.bitrate_kbps, capture.target_fps),
        encoder.parser()
    )
    .unwrap();

    Ok(desc)
}

/// Encoder element with low-latency tuning: minimal lookahead, no
/// B-frames, keyframe interval equal to the target framerate.
fn encoder_fragment(encoder: &EncoderKind, bitrate_kbps: u32, fps: u32) -> String {
    let bps = u64::from(bitrate_kbps) * 1000;
    match encoder.element.as_str() {
        "x264enc" => format!(
            "x264enc name=enc tune=zerolatency speed-preset=ultrafast \
             bitrate={bitrate_kbps} key-int-max={fps} bframes=0"
        ),
        "x265enc" => format!(
            "x265enc name=enc tune=zerolatency speed-preset=ultrafast \
             bitrate={bitrate_kbps} key-int-max={fps}"
        ),
        "openh264enc" => format!("openh264enc name=enc bitrate={bps} gop-size={fps}"),
        "mpph264enc" | "mpph265enc" => format!(
            "{} name=enc rc-mode=cbr bps={bps} gop={fps}",
            encoder.element
        ),
        "v4l2h264enc" | "v4l2h265enc" => format!(
            "{} name=enc extra-controls=\"controls,video_bitrate={bps},video_gop_size={fps}\"",
            encoder.element
        ),
        "vaapih264enc" | "vaapih265enc" => format!(
            "{} name=enc rate-control=cbr bitrate={bitrate_kbps} keyframe-period={fps}",
            encoder.element
        ),
        other => format!("{other} name=enc"),
    }
}

fn publish_fragment(publish_url: &str) -> String {
    format!("rtspclientsink name=publish location={publish_url} latency=0")
}

fn file_fragment(container: Container, file_path: &str) -> String {
    format!(
        "{FILE_QUEUE} ! {muxer} name=mux ! filesink name=filesink location={file_path}",
        muxer = container.muxer(),
    )
}

/// One decoded, scaled branch per distinct source. Unterminated; the
/// caller links it to the compositor (directly or through a tee).
fn branch_fragment(branch: &SourceBranch) -> Result<String> {
    match branch {
        SourceBranch::MediaServer { url } => Ok(format!(
            "rtspsrc location={url} latency=100 ! decodebin ! videoconvert ! videoscale"
        )),
        SourceBranch::Placeholder { camera } => Ok(format!(
            "videotestsrc name=ph_{camera} is-live=true pattern=black ! \
             video/x-raw,format=NV12,framerate={PROGRAM_FPS}/1"
        )),
        SourceBranch::DirectCapture { device, caps } => Ok(format!(
            "v4l2src device={device} ! {} ! videoconvert ! videoscale",
            source_caps_fragment(caps)?
        )),
        SourceBranch::FileVideo { path, looping } => Ok(format!(
            "multifilesrc location={path} loop={looping} ! decodebin ! \
             videoconvert ! videoscale ! videorate ! video/x-raw,framerate={PROGRAM_FPS}/1"
        )),
        SourceBranch::StillImage { path, hold_ms } => {
            let freeze = if *hold_ms > 0 {
                let frames = (hold_ms * u64::from(PROGRAM_FPS)).div_ceil(1000);
                format!("imagefreeze num-buffers={frames}")
            } else {
                "imagefreeze".to_string()
            };
            Ok(format!(
                "filesrc location={path} ! decodebin ! {freeze} ! \
                 video/x-raw,framerate={PROGRAM_FPS}/1 ! videoconvert ! videoscale"
            ))
        }
        SourceBranch::Graphic { pattern } => Ok(format!(
            "videotestsrc name=gfx_{pattern} is-live=true pattern={pattern} ! \
             video/x-raw,format=NV12,framerate={PROGRAM_FPS}/1"
        )),
    }
}

/// Compositor pad properties for one slot. Pad index equals slot index,
/// which is what makes hot reconfiguration addressable.
pub fn pad_properties(slot: &crate::scene::ResolvedSlot) -> Vec<(String, String)> {
    vec![
        ("xpos".to_string(), slot.rect.x.to_string()),
        ("ypos".to_string(), slot.rect.y.to_string()),
        ("width".to_string(), slot.rect.w.to_string()),
        ("height".to_string(), slot.rect.h.to_string()),
        ("alpha".to_string(), format!("{:.3}", slot.alpha)),
        ("zorder".to_string(), slot.z.max(0).to_string()),
    ]
}

fn mixer_description(
    scene: &ResolvedScene,
    encoder: &EncoderKind,
    publish_url: &str,
    file_sink: Option<&(Container, String)>,
) -> Result<String> {
    if scene.slots.is_empty() {
        return Err(QuadcastError::InvalidArgument(
            "resolved scene has no slots".to_string(),
        ));
    }

    let mut desc = String::new();

    // Compositor head with per-slot pad properties inline; pad index is
    // slot index.
    desc.push_str("compositor name=comp background=black");
    for (idx, slot) in scene.slots.iter().enumerate() {
        for (prop, value) in pad_properties(slot) {
            write!(desc, " sink_{idx}::{prop}={value}").unwrap();
        }
    }

    write!(
        desc,
        " ! video/x-raw,width={},height={},framerate={PROGRAM_FPS}/1 \
         ! videoconvert ! video/x-raw,format=NV12 \
         ! identity name=flowmon signal-handoffs=true ! {} ! {} config-interval=-1 \
         ! tee name=out allow-not-linked=true",
        scene.width,
        scene.height,
        encoder_fragment(encoder, mixer_bitrate_kbps(scene), PROGRAM_FPS),
        encoder.parser(),
    )
    .unwrap();

    // Distinct branches in first-occurrence order; duplicate slots on the
    // same source share one upstream through a tee.
    let mut branch_index: HashMap<String, usize> = HashMap::new();
    let mut branch_order: Vec<&SourceBranch> = Vec::new();
    let mut slots_of_branch: Vec<Vec<usize>> = Vec::new();

    for (slot_idx, slot) in scene.slots.iter().enumerate() {
        let key = slot.branch.key();
        match branch_index.get(&key) {
            Some(&bidx) => slots_of_branch[bidx].push(slot_idx),
            None => {
                branch_index.insert(key, branch_order.len());
                branch_order.push(&slot.branch);
                slots_of_branch.push(vec![slot_idx]);
            }
        }
    }

    for (bidx, branch) in branch_order.iter().enumerate() {
        let fragment = branch_fragment(branch)?;
        let pads = &slots_of_branch[bidx];

        if pads.len() == 1 {
            let slot_idx = pads[0];
            write!(
                desc,
                " {fragment}{crop} ! {LEAKY_QUEUE} ! comp.sink_{slot_idx}",
                crop = crop_fragment(&scene.slots[slot_idx]),
            )
            .unwrap();
        } else {
            write!(desc, " {fragment} ! tee name=branch{bidx}").unwrap();
            for &slot_idx in pads {
                write!(
                    desc,
                    " branch{bidx}.{crop} ! {LEAKY_QUEUE} ! comp.sink_{slot_idx}",
                    crop = crop_fragment(&scene.slots[slot_idx]),
                )
                .unwrap();
            }
        }
    }

    write!(
        desc,
        " out. ! {LEAKY_QUEUE} ! {}",
        publish_fragment(publish_url)
    )
    .unwrap();

    if let Some((container, path)) = file_sink {
        write!(desc, " out. ! {}", file_fragment(*container, path)).unwrap();
    }

    Ok(desc)
}

fn crop_fragment(slot: &crate::scene::ResolvedSlot) -> String {
    match slot.crop {
        Some(c) => format!(
            " ! videocrop left={} right={} top={} bottom={}",
            c.left, c.right, c.top, c.bottom
        ),
        None => String::new(),
    }
}

/// Program bitrate scaled to the output canvas, 4 Mbps per 1080p worth of
/// pixels with a floor of 2 Mbps.
fn mixer_bitrate_kbps(scene: &ResolvedScene) -> u32 {
    let pixels = u64::from(scene.width) * u64::from(scene.height);
    let reference = 1920u64 * 1080;
    ((pixels * 4000 / reference) as u32).max(2000)
}
