use gstreamer as gst;
use serde::Serialize;
use tracing::{debug, info};

use crate::caps::VideoCaps;
use crate::config::CodecPreference;
use crate::scene::ResolvedScene;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Codec {
    H264,
    H265,
}

impl From<CodecPreference> for Codec {
    fn from(pref: CodecPreference) -> Self {
        match pref {
            CodecPreference::H264 => Codec::H264,
            CodecPreference::H265 => Codec::H265,
        }
    }
}

/// A concrete encoder element the builder will emit. Chosen once at
/// startup by the capability probe; the builder never searches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EncoderKind {
    pub element: String,
    pub hardware: bool,
    pub codec: Codec,
}

impl EncoderKind {
    pub fn parser(&self) -> &'static str {
        match self.codec {
            Codec::H264 => "h264parse",
            Codec::H265 => "h265parse",
        }
    }
}

/// Hardware-first candidate lists per codec. Rockchip MPP encoders lead
/// because that is what this appliance's SoC ships; the stateful V4L2 and
/// VA-API names cover other boards, x264/x265 close as software fallback.
const H264_CANDIDATES: &[(&str, bool)] = &[
    ("mpph264enc", true),
    ("v4l2h264enc", true),
    ("vaapih264enc", true),
    ("x264enc", false),
    ("openh264enc", false),
];

const H265_CANDIDATES: &[(&str, bool)] = &[
    ("mpph265enc", true),
    ("v4l2h265enc", true),
    ("vaapih265enc", true),
    ("x265enc", false),
];

/// Encoders available in the running GStreamer installation, probed once
/// at service startup.
#[derive(Debug, Clone)]
pub struct EncoderCatalog {
    pub h264: Vec<EncoderKind>,
    pub h265: Vec<EncoderKind>,
}

impl EncoderCatalog {
    /// Scan the element registry for known encoders. Requires the media
    /// framework to be initialized.
    pub fn detect() -> Self {
        let probe = |candidates: &[(&str, bool)], codec: Codec| {
            let mut found = Vec::new();
            for (name, hardware) in candidates {
                if gst::ElementFactory::find(name).is_some() {
                    debug!(encoder = name, hardware, "Encoder available");
                    found.push(EncoderKind {
                        element: (*name).to_string(),
                        hardware: *hardware,
                        codec,
                    });
                }
            }
            found
        };

        let catalog = Self {
            h264: probe(H264_CANDIDATES, Codec::H264),
            h265: probe(H265_CANDIDATES, Codec::H265),
        };
        info!(
            h264 = catalog.h264.len(),
            h265 = catalog.h265.len(),
            "Encoder catalog probed"
        );
        catalog
    }

    /// Catalog for tests and development hosts: software encoders only.
    pub fn software_only() -> Self {
        Self {
            h264: vec![EncoderKind {
                element: "x264enc".to_string(),
                hardware: false,
                codec: Codec::H264,
            }],
            h265: vec![EncoderKind {
                element: "x265enc".to_string(),
                hardware: false,
                codec: Codec::H265,
            }],
        }
    }

    /// Best encoder for a codec: hardware first in candidate order, then
    /// software. Falls back to the other codec's list before giving up.
    pub fn choose(&self, codec: Codec) -> Option<EncoderKind> {
        let (primary, fallback) = match codec {
            Codec::H264 => (&self.h264, &self.h265),
            Codec::H265 => (&self.h265, &self.h264),
        };
        primary.first().or_else(|| fallback.first()).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Container {
    Mp4,
    Matroska,
    MpegTs,
}

impl Container {
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4mux",
            Self::Matroska => "matroskamux",
            Self::MpegTs => "mpegtsmux",
        }
    }

    pub fn for_extension(path: &str) -> Self {
        if path.ends_with(".mkv") {
            Self::Matroska
        } else if path.ends_with(".ts") {
            Self::MpegTs
        } else {
            Self::Mp4
        }
    }
}

/// Everything a capture pipeline needs to know about one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParams {
    pub device: String,
    pub caps: VideoCaps,
    /// Target geometry/rate; capture is scaled/normalized when it differs.
    pub target_width: u32,
    pub target_height: u32,
    pub target_fps: u32,
    pub bitrate_kbps: u32,
}

/// Declarative description of one pipeline for the builder. The builder
/// is a pure function over this type.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSpec {
    /// Always-on ingest: capture, encode once, publish to the media server.
    CaptureToPublish {
        capture: CaptureParams,
        encoder: EncoderKind,
        publish_url: String,
    },
    /// Standalone recording: capture straight into a container file.
    CaptureToFile {
        capture: CaptureParams,
        encoder: EncoderKind,
        container: Container,
        file_path: String,
    },
    /// Ingest with a named tee so a file branch can attach while running.
    CaptureTee {
        capture: CaptureParams,
        encoder: EncoderKind,
        publish_url: String,
    },
    /// Scene compositor: one branch per distinct source, encode once,
    /// publish the program, optionally also write a file.
    MixerScene {
        scene: ResolvedScene,
        encoder: EncoderKind,
        publish_url: String,
        file_sink: Option<(Container, String)>,
    },
    /// Publish a video file as its own media-server path (media bed,
    /// slate loop).
    FileSource {
        path: String,
        looping: bool,
        encoder: EncoderKind,
        publish_url: String,
    },
    /// Publish a held still image as its own media-server path.
    StillSource {
        path: String,
        hold_ms: u64,
        encoder: EncoderKind,
        publish_url: String,
    },
}

impl PipelineSpec {
    /// Name for the top-level pipeline element; also the tag bus events
    /// carry back to the supervisor.
    pub fn pipeline_name(&self) -> String {
        match self {
            Self::CaptureToPublish { capture, .. } | Self::CaptureTee { capture, .. } => {
                format!("ingest_{}", sanitize(&capture.device))
            }
            Self::CaptureToFile { capture, .. } => {
                format!("record_{}", sanitize(&capture.device))
            }
            Self::MixerScene { scene, .. } => format!("mixer_{}", sanitize(&scene.scene_id)),
            Self::FileSource { path, .. } | Self::StillSource { path, .. } => {
                format!("source_{}", sanitize(path))
            }
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_prefers_hardware_then_falls_back() {
        let catalog = EncoderCatalog {
            h264: vec![
                EncoderKind {
                    element: "mpph264enc".into(),
                    hardware: true,
                    codec: Codec::H264,
                },
                EncoderKind {
                    element: "x264enc".into(),
                    hardware: false,
                    codec: Codec::H264,
                },
            ],
            h265: vec![],
        };
        assert_eq!(catalog.choose(Codec::H264).unwrap().element, "mpph264enc");
        // No H.265 encoder present: fall back to the H.264 list.
        assert_eq!(catalog.choose(Codec::H265).unwrap().element, "mpph264enc");
    }

    #[test]
    fn container_from_extension() {
        assert_eq!(Container::for_extension("a/b.mkv"), Container::Matroska);
        assert_eq!(Container::for_extension("a/b.ts"), Container::MpegTs);
        assert_eq!(Container::for_extension("a/b.mp4"), Container::Mp4);
    }
}
