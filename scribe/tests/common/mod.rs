#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;

use scribe::config::Config;
use scribe::decode::{Decoder, FrameStream, MediaDecoder};
use scribe::error::{Result, ScribeError};
use scribe::models::{BoundingBox, Frame, Token, UploadArtifact, UploadMeta};
use scribe::ocr::{EngineFactory, EngineOutput, EnginePool, LanguageHints, OcrProvider, RecognitionEngine};
use scribe::processing::{ExtractionOrchestrator, ExtractionRequest};
use scribe::storage::ArtifactStore;

/// What a scripted engine does for one frame.
#[derive(Debug, Clone)]
pub enum Step {
    Say(String),
    SleepThenSay(u64, String),
    Fail,
}

impl Step {
    pub fn say(text: &str) -> Self {
        Step::Say(text.to_string())
    }
}

pub type Script = Arc<dyn Fn(u32, &[String]) -> Step + Send + Sync>;

pub fn script<F>(f: F) -> Script
where
    F: Fn(u32, &[String]) -> Step + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Engine driven by a script keyed on the frame index, which the fake
/// decoder paints into every pixel of the frame.
struct ScriptedEngine {
    script: Script,
}

pub const TOKEN_CONFIDENCE: f32 = 0.92;

fn output(text: &str) -> EngineOutput {
    let tokens = text
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| Token {
            text: word.to_string(),
            confidence: TOKEN_CONFIDENCE,
            bbox: BoundingBox {
                x: i as u32 * 50,
                y: 0,
                width: 40,
                height: 12,
            },
            block: 1,
            line: 1,
        })
        .collect();
    EngineOutput {
        text: text.to_string(),
        tokens,
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn recognize(&mut self, image: &DynamicImage, languages: &[String]) -> Result<EngineOutput> {
        let index = u32::from(image.to_luma8().get_pixel(0, 0)[0]);
        match (self.script)(index, languages) {
            Step::Say(text) => Ok(output(&text)),
            Step::SleepThenSay(ms, text) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(output(&text))
            }
            Step::Fail => Err(ScribeError::EngineFailure(format!("scripted failure on frame {index}"))),
        }
    }
}

pub struct ScriptedFactory {
    script: Script,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn RecognitionEngine>> {
        Ok(Box::new(ScriptedEngine {
            script: Arc::clone(&self.script),
        }))
    }
}

/// Decoder that ignores the artifact's bytes and yields flat frames whose
/// gray level equals their index.
pub struct FakeDecoder {
    pub frames: u32,
    pub fail_after: Option<u32>,
    pub reject: bool,
}

impl FakeDecoder {
    pub fn frames(frames: u32) -> Self {
        Self {
            frames,
            fail_after: None,
            reject: false,
        }
    }
}

#[async_trait]
impl MediaDecoder for FakeDecoder {
    async fn decode(&self, artifact: &UploadArtifact) -> Result<FrameStream> {
        if self.reject {
            return Err(ScribeError::UnsupportedCodec("video codec 'theora' is not enabled".into()));
        }
        let id = artifact.id.clone();
        let mut items: Vec<Result<Frame>> = (0..self.frames)
            .take(self.fail_after.map(|n| n as usize).unwrap_or(usize::MAX))
            .map(|index| {
                Ok(Frame {
                    artifact_id: id.clone(),
                    index,
                    timestamp_ms: Some(u64::from(index) * 1000),
                    image: DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
                        24,
                        24,
                        image::Luma([index as u8]),
                    )),
                })
            })
            .collect();
        if self.fail_after.is_some() {
            items.push(Err(ScribeError::CorruptMedia("truncated frame data".into())));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.scratch_dir = dir.path().to_path_buf();
    config.storage.max_upload_bytes = 4 * 1024 * 1024;
    config.ocr.languages = vec!["eng".to_string(), "deu".to_string()];
    config.ocr.pool_size = 2;
    config.ocr.timeout_ms = 5_000;
    config.pipeline.max_concurrent_requests = 4;
    config.pipeline.frame_concurrency = 2;
    config
}

pub async fn orchestrator_with(
    config: &Config,
    decoder: Arc<dyn MediaDecoder>,
    script: Script,
) -> ExtractionOrchestrator {
    let store = ArtifactStore::open(&config.storage).await.unwrap();
    let pool = EnginePool::new(Arc::new(ScriptedFactory { script }), config.ocr.pool_size);
    let ocr = OcrProvider::new(pool, &config.ocr);
    ExtractionOrchestrator::new(store, decoder, ocr, config)
}

/// Orchestrator using the real image decoder.
pub async fn image_orchestrator(config: &Config, script: Script) -> ExtractionOrchestrator {
    orchestrator_with(config, Arc::new(Decoder::new(&config.decoder)), script).await
}

pub fn request(filename: &str, declared_type: &str, size: usize) -> ExtractionRequest {
    ExtractionRequest {
        meta: UploadMeta {
            filename: Some(filename.to_string()),
            declared_type: Some(declared_type.to_string()),
            declared_size: Some(size as u64),
        },
        languages: LanguageHints::default(),
    }
}

/// Upload body in 4 KiB chunks.
pub fn body(bytes: &[u8]) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + Unpin {
    let chunks: Vec<std::io::Result<Vec<u8>>> =
        bytes.chunks(4096).map(|c| Ok(c.to_vec())).collect();
    futures::stream::iter(chunks)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([250, 250, 250, 255]))),
        ImageFormat::Png,
    )
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(DynamicImage::new_rgb8(width, height), ImageFormat::Jpeg)
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

/// Animated GIF with `frames` frames of `delay_ms` each.
pub fn gif_bytes(frames: u32, delay_ms: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = (0..frames).map(|i| {
            let shade = (i % 200) as u8;
            image::Frame::from_parts(
                RgbaImage::from_pixel(16, 16, Rgba([shade, shade, shade, 255])),
                0,
                0,
                Delay::from_numer_denom_ms(delay_ms, 1),
            )
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

/// Multi-page grayscale TIFF, one page per shade.
pub fn tiff_bytes(shades: &[u8]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = tiff::encoder::TiffEncoder::new(&mut buf).unwrap();
        for shade in shades {
            let pixels = vec![*shade; 64 * 32];
            encoder
                .write_image::<tiff::encoder::colortype::Gray8>(64, 32, &pixels)
                .unwrap();
        }
    }
    buf.into_inner()
}

pub fn scratch_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
