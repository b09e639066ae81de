use async_trait::async_trait;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, GrayImage, ImageBuffer, ImageFormat, ImageReader};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder as TiffDecoder, DecodingResult};
use tiff::ColorType;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::sampling::{FrameSampler, SamplingPolicy};
use super::{FrameStream, MediaDecoder};
use crate::config::DecoderConfig;
use crate::error::{Result, ScribeError};
use crate::models::{ArtifactId, Frame, UploadArtifact};

/// GIF delays this short are treated the way browsers treat them.
const MIN_GIF_DELAY_MS: u64 = 20;
const DEFAULT_GIF_DELAY_MS: u64 = 100;

/// Decodes still images, animated GIFs and multi-page TIFFs.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    codecs: Vec<String>,
    sampling: SamplingPolicy,
    max_frames: usize,
    channel_capacity: usize,
}

impl ImageDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            codecs: config.image_codecs.clone(),
            sampling: config.sampling,
            max_frames: config.max_frames.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

#[async_trait]
impl MediaDecoder for ImageDecoder {
    async fn decode(&self, artifact: &UploadArtifact) -> Result<FrameStream> {
        let path = artifact.path.clone();
        let probe_path = path.clone();
        let format = tokio::task::spawn_blocking(move || probe_format(&probe_path))
            .await
            .map_err(|e| ScribeError::Internal(format!("image probe task failed: {e}")))??;

        let codec = codec_name(format);
        if !self.codecs.iter().any(|c| c == codec) {
            return Err(ScribeError::UnsupportedCodec(format!(
                "image codec '{codec}' is not enabled"
            )));
        }

        debug!(artifact_id = %artifact.id, codec, "Decoding image");

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        let job = DecodeJob {
            artifact_id: artifact.id.clone(),
            path,
            format,
            sampling: self.sampling,
            max_frames: self.max_frames,
        };
        tokio::task::spawn_blocking(move || job.run(tx));

        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

fn probe_format(path: &Path) -> Result<ImageFormat> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    reader
        .format()
        .ok_or_else(|| ScribeError::UnsupportedCodec("unrecognised image format".to_string()))
}

fn codec_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
        ImageFormat::Gif => "gif",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Bmp => "bmp",
        ImageFormat::WebP => "webp",
        other => other.extensions_str().first().copied().unwrap_or("unknown"),
    }
}

/// Blocking producer half. Stops as soon as the consumer hangs up.
struct DecodeJob {
    artifact_id: ArtifactId,
    path: PathBuf,
    format: ImageFormat,
    sampling: SamplingPolicy,
    max_frames: usize,
}

impl DecodeJob {
    fn run(self, tx: mpsc::Sender<Result<Frame>>) {
        if self.format == ImageFormat::Gif {
            self.run_gif(tx);
        } else if self.format == ImageFormat::Tiff {
            self.run_tiff(tx);
        } else {
            let item = self.decode_still();
            let _ = tx.blocking_send(item);
        }
    }

    fn decode_still(&self) -> Result<Frame> {
        let image = ImageReader::open(&self.path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| ScribeError::CorruptMedia(e.to_string()))?;

        Ok(Frame {
            artifact_id: self.artifact_id.clone(),
            index: 0,
            timestamp_ms: None,
            image,
        })
    }

    /// Every page is a frame. Pages carry no timestamps.
    fn run_tiff(self, tx: mpsc::Sender<Result<Frame>>) {
        let mut decoder = match File::open(&self.path)
            .map_err(ScribeError::from)
            .and_then(|f| TiffDecoder::new(BufReader::new(f)).map_err(corrupt_tiff))
        {
            Ok(decoder) => decoder,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        let mut page = 0u64;
        let mut emitted = 0u32;
        loop {
            if self.sampling.admits_page(page) {
                let item = tiff_page(&mut decoder).map(|image| Frame {
                    artifact_id: self.artifact_id.clone(),
                    index: emitted,
                    timestamp_ms: None,
                    image,
                });
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() {
                    debug!(artifact_id = %self.artifact_id, "Frame consumer dropped, stopping decode");
                    return;
                }
                if failed {
                    warn!(artifact_id = %self.artifact_id, page, "TIFF decoding stopped");
                    return;
                }
                emitted += 1;
                if emitted as usize >= self.max_frames {
                    debug!(artifact_id = %self.artifact_id, emitted, "Frame cap reached");
                    return;
                }
            }

            if !decoder.more_images() {
                return;
            }
            if let Err(e) = decoder.next_image() {
                warn!(artifact_id = %self.artifact_id, page, error = %e, "TIFF decoding stopped");
                let _ = tx.blocking_send(Err(corrupt_tiff(e)));
                return;
            }
            page += 1;
        }
    }

    fn run_gif(self, tx: mpsc::Sender<Result<Frame>>) {
        let decoder = match File::open(&self.path)
            .map_err(ScribeError::from)
            .and_then(|f| {
                GifDecoder::new(BufReader::new(f))
                    .map_err(|e| ScribeError::CorruptMedia(e.to_string()))
            }) {
            Ok(decoder) => decoder,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        let mut frames = decoder.into_frames().peekable();
        let mut sampler = FrameSampler::new(self.sampling);
        let mut elapsed_ms = 0u64;
        let mut emitted = 0u32;
        let mut source_index = 0u64;

        while let Some(next) = frames.next() {
            let frame = match next {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(artifact_id = %self.artifact_id, source_index, error = %e, "GIF decoding stopped");
                    let _ = tx.blocking_send(Err(ScribeError::CorruptMedia(e.to_string())));
                    return;
                }
            };

            let still = source_index == 0 && frames.peek().is_none();
            let (numer, denom) = frame.delay().numer_denom_ms();
            let mut delay_ms = if denom == 0 { 0 } else { (numer / denom) as u64 };
            if delay_ms < MIN_GIF_DELAY_MS {
                delay_ms = DEFAULT_GIF_DELAY_MS;
            }

            if sampler.admit(source_index, elapsed_ms) {
                let item = Frame {
                    artifact_id: self.artifact_id.clone(),
                    index: emitted,
                    timestamp_ms: if still { None } else { Some(elapsed_ms) },
                    image: DynamicImage::ImageRgba8(frame.into_buffer()),
                };
                if tx.blocking_send(Ok(item)).is_err() {
                    debug!(artifact_id = %self.artifact_id, "Frame consumer dropped, stopping decode");
                    return;
                }
                emitted += 1;
                if emitted as usize >= self.max_frames {
                    debug!(artifact_id = %self.artifact_id, emitted, "Frame cap reached");
                    return;
                }
            }

            elapsed_ms += delay_ms;
            source_index += 1;
        }
    }
}

fn corrupt_tiff(e: tiff::TiffError) -> ScribeError {
    ScribeError::CorruptMedia(e.to_string())
}

/// Decode the decoder's current page into an 8- or 16-bit image.
fn tiff_page<R: Read + Seek>(decoder: &mut TiffDecoder<R>) -> Result<DynamicImage> {
    let (width, height) = decoder.dimensions().map_err(corrupt_tiff)?;
    let color = decoder.colortype().map_err(corrupt_tiff)?;
    let pixels = decoder.read_image().map_err(corrupt_tiff)?;

    let image = match (color, pixels) {
        (ColorType::Gray(1), DecodingResult::U8(packed)) => {
            Some(DynamicImage::ImageLuma8(unpack_bilevel(width, height, &packed)))
        }
        (ColorType::Gray(8), DecodingResult::U8(buf)) => {
            GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
        }
        (ColorType::GrayA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
        }
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma16)
        }
        (ColorType::RGB(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb16)
        }
        (ColorType::RGBA(16), DecodingResult::U16(buf)) => {
            ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba16)
        }
        (other, _) => {
            return Err(ScribeError::UnsupportedCodec(format!(
                "tiff color type {other:?} is not supported"
            )))
        }
    };

    image.ok_or_else(|| {
        ScribeError::CorruptMedia("tiff page data does not match its dimensions".to_string())
    })
}

/// 1-bit rows are byte aligned, most significant bit first, 1 is white.
fn unpack_bilevel(width: u32, height: u32, packed: &[u8]) -> GrayImage {
    let stride = width.div_ceil(8) as usize;
    GrayImage::from_fn(width, height, |x, y| {
        let byte = packed
            .get(y as usize * stride + (x / 8) as usize)
            .copied()
            .unwrap_or(0);
        let bit = (byte >> (7 - (x % 8))) & 1;
        image::Luma([if bit == 1 { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgba, RgbaImage};
    use tempfile::TempDir;

    use crate::models::{ArtifactState, MediaKind};

    fn artifact_at(path: PathBuf, mime: &str) -> UploadArtifact {
        UploadArtifact {
            id: ArtifactId::generate(),
            original_filename: None,
            mime_type: mime.to_string(),
            kind: MediaKind::Image,
            size_bytes: 0,
            sha256: String::new(),
            path,
            created_at: Utc::now(),
            state: ArtifactState::Processing,
        }
    }

    fn write_tiff(path: &Path, shades: &[u8]) {
        let file = File::create(path).unwrap();
        let mut encoder = tiff::encoder::TiffEncoder::new(file).unwrap();
        for shade in shades {
            let pixels = vec![*shade; 16 * 12];
            encoder
                .write_image::<tiff::encoder::colortype::Gray8>(16, 12, &pixels)
                .unwrap();
        }
    }

    fn write_gif(path: &Path, frames: usize, delay_ms: u32) {
        let file = File::create(path).unwrap();
        let mut encoder = GifEncoder::new(file);
        let gif_frames = (0..frames).map(|i| {
            let shade = (i * 2 % 255) as u8;
            let buffer = RgbaImage::from_pixel(16, 16, Rgba([shade, shade, shade, 255]));
            image::Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1))
        });
        encoder.encode_frames(gif_frames).unwrap();
    }

    #[tokio::test]
    async fn test_still_png_is_one_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("still.png");
        RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255]))
            .save(&path)
            .unwrap();

        let decoder = ImageDecoder::new(&DecoderConfig::default());
        let frames: Vec<_> = decoder
            .decode(&artifact_at(path, "image/png"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 1);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.index, 0);
        assert_eq!(frame.timestamp_ms, None);
        assert_eq!((frame.width(), frame.height()), (8, 8));
    }

    #[tokio::test]
    async fn test_animated_gif_sampled_per_second() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.gif");
        write_gif(&path, 30, 100);

        let decoder = ImageDecoder::new(&DecoderConfig::default());
        let frames: Vec<Frame> = decoder
            .decode(&artifact_at(path, "image/gif"))
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
        let stamps: Vec<Option<u64>> = frames.iter().map(|f| f.timestamp_ms).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(stamps, vec![Some(0), Some(1000), Some(2000)]);
    }

    #[tokio::test]
    async fn test_frame_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.gif");
        write_gif(&path, 10, 100);

        let config = DecoderConfig {
            sampling: SamplingPolicy::EveryNth(1),
            max_frames: 4,
            ..DecoderConfig::default()
        };
        let frames: Vec<_> = ImageDecoder::new(&config)
            .decode(&artifact_at(path, "image/gif"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames.len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_codec_rejected_before_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        image::RgbImage::from_pixel(8, 8, image::Rgb([10, 10, 10]))
            .save(&path)
            .unwrap();

        let config = DecoderConfig {
            image_codecs: vec!["png".to_string()],
            ..DecoderConfig::default()
        };
        let err = ImageDecoder::new(&config)
            .decode(&artifact_at(path, "image/jpeg"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScribeError::UnsupportedCodec(_)));
    }

    #[tokio::test]
    async fn test_truncated_png_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        let mut bytes = Vec::new();
        RgbaImage::from_pixel(32, 32, Rgba([1, 2, 3, 255]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes.truncate(bytes.len() / 2);
        std::fs::write(&path, bytes).unwrap();

        let frames: Vec<_> = ImageDecoder::new(&DecoderConfig::default())
            .decode(&artifact_at(path, "image/png"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(ScribeError::CorruptMedia(_))));
    }

    #[tokio::test]
    async fn test_multi_page_tiff_yields_every_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.tiff");
        write_tiff(&path, &[40, 200]);

        let frames: Vec<Frame> = ImageDecoder::new(&DecoderConfig::default())
            .decode(&artifact_at(path, "image/tiff"))
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1]);
        assert!(frames.iter().all(|f| f.timestamp_ms.is_none()));
        let shades: Vec<u8> = frames
            .iter()
            .map(|f| f.image.to_luma8().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![40, 200]);
        assert_eq!((frames[1].width(), frames[1].height()), (16, 12));
    }

    #[tokio::test]
    async fn test_tiff_pages_follow_stride_and_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.tiff");
        write_tiff(&path, &[0, 10, 20, 30, 40, 50, 60]);

        let config = DecoderConfig {
            sampling: SamplingPolicy::EveryNth(2),
            max_frames: 3,
            ..DecoderConfig::default()
        };
        let frames: Vec<Frame> = ImageDecoder::new(&config)
            .decode(&artifact_at(path, "image/tiff"))
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        let shades: Vec<u8> = frames
            .iter()
            .map(|f| f.image.to_luma8().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(shades, vec![0, 20, 40]);
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unpack_bilevel_rows_are_byte_aligned() {
        // 10 px wide: two bytes per row.
        let packed = [0b1000_0000, 0b0100_0000, 0b0000_0001, 0b0000_0000];
        let image = unpack_bilevel(10, 2, &packed);
        assert_eq!(image.get_pixel(0, 0)[0], 255);
        assert_eq!(image.get_pixel(1, 0)[0], 0);
        assert_eq!(image.get_pixel(9, 0)[0], 255);
        assert_eq!(image.get_pixel(7, 1)[0], 255);
        assert_eq!(image.get_pixel(8, 1)[0], 0);
    }
}
