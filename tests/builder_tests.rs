use quadcast::caps::{PixelFormat, VideoCaps};
use quadcast::pipeline::builder::{self, PROGRAM_FPS};
use quadcast::pipeline::spec::{
    CaptureParams, Codec, Container, EncoderKind, PipelineSpec,
};
use quadcast::scene::{
    PixelRect, ResolvedScene, ResolvedSlot, SourceBranch,
};

fn x264() -> EncoderKind {
    EncoderKind {
        element: "x264enc".to_string(),
        hardware: false,
        codec: Codec::H264,
    }
}

fn capture(caps: VideoCaps) -> CaptureParams {
    CaptureParams {
        device: "/dev/video0".to_string(),
        caps,
        target_width: 1920,
        target_height: 1080,
        target_fps: 30,
        bitrate_kbps: 8000,
    }
}

fn publish_spec(caps: VideoCaps) -> PipelineSpec {
    PipelineSpec::CaptureToPublish {
        capture: capture(caps),
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/cam0".to_string(),
    }
}

fn slot(branch: SourceBranch, x: i32, w: u32) -> ResolvedSlot {
    ResolvedSlot {
        branch,
        rect: PixelRect {
            x,
            y: 0,
            w,
            h: 1080,
        },
        z: 0,
        alpha: 1.0,
        crop: None,
    }
}

#[test]
fn identical_specs_build_identical_descriptions() {
    let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::Yuy2);
    let a = builder::build(&publish_spec(caps)).unwrap();
    let b = builder::build(&publish_spec(caps)).unwrap();
    assert_eq!(a, b, "builder must be byte-stable");
}

#[test]
fn publish_pipeline_has_low_latency_shape() {
    let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::Yuy2);
    let desc = builder::build(&publish_spec(caps)).unwrap();

    assert!(desc.contains("v4l2src device=/dev/video0"));
    assert!(desc.contains("format=YUY2"));
    // Encoded once, teed, published through a leaky shallow queue.
    assert!(desc.contains("tee name=t"));
    assert!(desc.contains("queue leaky=downstream max-size-buffers=2"));
    assert!(desc.contains("rtspclientsink"));
    // Zero-latency tuning with keyframe interval = framerate.
    assert!(desc.contains("tune=zerolatency"));
    assert!(desc.contains("key-int-max=30"));
    // Same geometry: no scaler stage.
    assert!(!desc.contains("videoscale"));
    assert!(desc.contains("video/x-raw,format=NV12"));
}

#[test]
fn geometry_mismatch_inserts_scaler_and_rate_mismatch_inserts_videorate() {
    let caps = VideoCaps::new(3840, 2160, 60, PixelFormat::Nv12);
    let desc = builder::build(&publish_spec(caps)).unwrap();

    assert!(desc.contains("videoscale"));
    assert!(desc.contains("width=1920,height=1080"));
    assert!(desc.contains("videorate"));
    assert!(desc.contains("framerate=30/1"));
}

#[test]
fn bayer_source_gets_debayer_stage() {
    let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::BayerBggr);
    let desc = builder::build(&publish_spec(caps)).unwrap();
    assert!(desc.contains("video/x-bayer,format=bggr"));
    assert!(desc.contains("bayer2rgb"));
}

#[test]
fn mjpeg_source_gets_jpeg_decoder() {
    let caps = VideoCaps::new(1280, 720, 30, PixelFormat::Mjpeg);
    let desc = builder::build(&publish_spec(caps)).unwrap();
    assert!(desc.contains("image/jpeg"));
    assert!(desc.contains("jpegdec"));
}

#[test]
fn unknown_format_is_rejected() {
    let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::Unknown(0x3232_3232));
    assert!(builder::build(&publish_spec(caps)).is_err());
}

#[test]
fn file_pipeline_uses_non_leaky_queue_and_muxer() {
    let caps = VideoCaps::new(1920, 1080, 30, PixelFormat::Yuy2);
    let desc = builder::build(&PipelineSpec::CaptureToFile {
        capture: capture(caps),
        encoder: x264(),
        container: Container::Mp4,
        file_path: "/var/lib/quadcast/recordings/cam0/clip.mp4.part".to_string(),
    })
    .unwrap();

    assert!(desc.contains("mp4mux"));
    assert!(desc.contains("filesink name=filesink"));
    assert!(!desc.contains("leaky=downstream"));
}

#[test]
fn mixer_description_assigns_pads_in_slot_order() {
    let scene = ResolvedScene {
        scene_id: "pair".to_string(),
        width: 1920,
        height: 1080,
        slots: vec![
            slot(
                SourceBranch::MediaServer {
                    url: "rtsp://127.0.0.1:8554/cam0".to_string(),
                },
                0,
                960,
            ),
            slot(
                SourceBranch::Placeholder {
                    camera: "cam1".to_string(),
                },
                960,
                960,
            ),
        ],
    };

    let desc = builder::build(&PipelineSpec::MixerScene {
        scene,
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/program".to_string(),
        file_sink: None,
    })
    .unwrap();

    assert!(desc.contains("compositor name=comp"));
    assert!(desc.contains("sink_0::xpos=0"));
    assert!(desc.contains("sink_1::xpos=960"));
    assert!(desc.contains("comp.sink_0"));
    assert!(desc.contains("comp.sink_1"));
    assert!(desc.contains("rtspsrc location=rtsp://127.0.0.1:8554/cam0"));
    assert!(desc.contains("videotestsrc name=ph_cam1 is-live=true pattern=black"));
    assert!(desc.contains(&format!("framerate={PROGRAM_FPS}/1")));
}

#[test]
fn duplicate_slots_share_one_branch_through_a_tee() {
    let branch = SourceBranch::MediaServer {
        url: "rtsp://127.0.0.1:8554/cam0".to_string(),
    };
    let scene = ResolvedScene {
        scene_id: "mirror".to_string(),
        width: 1920,
        height: 1080,
        slots: vec![slot(branch.clone(), 0, 960), slot(branch, 960, 960)],
    };

    let desc = builder::build(&PipelineSpec::MixerScene {
        scene,
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/program".to_string(),
        file_sink: None,
    })
    .unwrap();

    // One rtspsrc, teed to both compositor pads.
    assert_eq!(desc.matches("rtspsrc").count(), 1);
    assert!(desc.contains("tee name=branch0"));
    assert!(desc.contains("comp.sink_0"));
    assert!(desc.contains("comp.sink_1"));
}

#[test]
fn file_and_still_sources_publish_on_their_own() {
    let file = builder::build(&PipelineSpec::FileSource {
        path: "/media/bed.mp4".to_string(),
        looping: true,
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/bed".to_string(),
    })
    .unwrap();
    assert!(file.contains("multifilesrc location=/media/bed.mp4 loop=true"));
    assert!(file.contains("rtspclientsink"));
    assert!(file.contains("identity name=flowmon"));

    let still = builder::build(&PipelineSpec::StillSource {
        path: "/media/slate.png".to_string(),
        hold_ms: 5000,
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/slate".to_string(),
    })
    .unwrap();
    assert!(still.contains("filesrc location=/media/slate.png"));
    assert!(still.contains("imagefreeze num-buffers=150"));
}

#[test]
fn mixer_with_file_sink_appends_file_branch() {
    let scene = ResolvedScene {
        scene_id: "solo".to_string(),
        width: 1280,
        height: 720,
        slots: vec![slot(
            SourceBranch::Graphic {
                pattern: "smpte".to_string(),
            },
            0,
            1280,
        )],
    };

    let desc = builder::build(&PipelineSpec::MixerScene {
        scene,
        encoder: x264(),
        publish_url: "rtsp://127.0.0.1:8554/program".to_string(),
        file_sink: Some((Container::Matroska, "/tmp/program.mkv".to_string())),
    })
    .unwrap();

    assert!(desc.contains("matroskamux"));
    assert!(desc.contains("location=/tmp/program.mkv"));
    assert_eq!(desc.matches("out. !").count(), 2, "publish and file branches");
}
