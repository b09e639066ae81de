//! Turns stored artifacts into lazy, forward-only frame streams.

mod raster;
mod sampling;
mod video;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub use raster::ImageDecoder;
pub use sampling::{FrameSampler, SamplingPolicy};
pub use video::{VideoDecoder, VideoInfo};

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::models::{Frame, MediaKind, UploadArtifact};

/// Finite, single-pass sequence of frames. An `Err` item ends the stream.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

#[async_trait]
pub trait MediaDecoder: Send + Sync {
    /// Validate the artifact and start decoding it.
    ///
    /// Errors returned here happen before any frame is produced.
    async fn decode(&self, artifact: &UploadArtifact) -> Result<FrameStream>;
}

/// Routes artifacts to the image or video decoder by media kind.
#[derive(Debug, Clone)]
pub struct Decoder {
    image: ImageDecoder,
    video: VideoDecoder,
}

impl Decoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            image: ImageDecoder::new(config),
            video: VideoDecoder::new(config),
        }
    }
}

#[async_trait]
impl MediaDecoder for Decoder {
    async fn decode(&self, artifact: &UploadArtifact) -> Result<FrameStream> {
        match artifact.kind {
            MediaKind::Image => self.image.decode(artifact).await,
            MediaKind::Video => self.video.decode(artifact).await,
        }
    }
}
