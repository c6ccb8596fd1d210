use gstreamer as gst;

use crate::error::Result;

pub mod builder;
pub mod handle;
pub mod spec;

/// Proof that the media framework was initialized. Constructing any
/// pipeline-owning engine requires a token, which keeps `gst::init` a
/// process-wide one-time event at startup.
#[derive(Clone)]
pub struct MediaInit(());

impl MediaInit {
    pub fn acquire() -> Result<Self> {
        gst::init()?;
        Ok(Self(()))
    }
}
