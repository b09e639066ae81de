use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::decode::SamplingPolicy;

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// Comma-separated list, lower-cased and trimmed. Empty or unset yields the default.
fn parse_env_list(var: &str, default: &[&str]) -> Vec<String> {
    match env::var(var) {
        Ok(val) if !val.trim().is_empty() => val
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/tiff",
    "image/bmp",
    "image/webp",
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "video/x-msvideo",
];

pub const DEFAULT_IMAGE_CODECS: &[&str] = &["png", "jpeg", "gif", "tiff", "bmp", "webp"];

pub const DEFAULT_VIDEO_CONTAINERS: &[&str] = &["mov", "mp4", "webm", "matroska", "avi"];

pub const DEFAULT_VIDEO_CODECS: &[&str] = &["h264", "hevc", "vp8", "vp9", "av1", "mpeg4", "mjpeg"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub decoder: DecoderConfig,
    pub preprocess: PreprocessConfig,
    pub ocr: OcrConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub scratch_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub orphan_grace_secs: u64,
    pub orphan_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub image_codecs: Vec<String>,
    pub video_containers: Vec<String>,
    pub video_codecs: Vec<String>,
    #[serde(skip, default)]
    pub sampling: SamplingPolicy,
    pub max_frames: usize,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Frames buffered between the decoding thread and the pipeline.
    pub channel_capacity: usize,
}

/// Toggles and tuning for the preprocessing stages.
///
/// Stages run in a fixed order regardless of which are enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessConfig {
    pub grayscale: bool,
    pub denoise: bool,
    pub binarize: bool,
    pub deskew: bool,
    pub contrast: bool,
    pub max_dimension: u32,
    pub denoise_radius: u32,
    pub binarize_window: u32,
    pub binarize_k: f32,
    pub deskew_min_confidence: f32,
    pub deskew_min_angle: f32,
    pub gamma: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    pub languages: Vec<String>,
    pub datapath: Option<String>,
    pub page_seg_mode: u32,
    pub source_dpi: i32,
    pub timeout_ms: u64,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_requests: usize,
    pub queue_timeout_ms: u64,
    pub request_timeout_secs: u64,
    pub frame_concurrency: usize,
    pub dump_preprocessed_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_keys: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("uploads"),
            max_upload_bytes: 50 * 1024 * 1024,
            allowed_mime_types: owned(DEFAULT_ALLOWED_MIME_TYPES),
            orphan_grace_secs: 3600,
            orphan_sweep_interval_secs: 900,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            image_codecs: owned(DEFAULT_IMAGE_CODECS),
            video_containers: owned(DEFAULT_VIDEO_CONTAINERS),
            video_codecs: owned(DEFAULT_VIDEO_CODECS),
            sampling: SamplingPolicy::default(),
            max_frames: 600,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            channel_capacity: 4,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise: true,
            binarize: true,
            deskew: true,
            contrast: true,
            max_dimension: 4096,
            denoise_radius: 1,
            binarize_window: 31,
            binarize_k: 0.2,
            deskew_min_confidence: 0.1,
            deskew_min_angle: 0.3,
            gamma: 1.0,
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            datapath: None,
            page_seg_mode: 6,
            source_dpi: 300,
            timeout_ms: 30_000,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_pool_size() * 2,
            queue_timeout_ms: 2_000,
            request_timeout_secs: 300,
            frame_concurrency: 2,
            dump_preprocessed_frames: false,
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let server = ServerConfig {
            host: env::var("SCRIBE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env_or("SCRIBE_PORT", 8080),
            api_keys: env::var("SCRIBE_API_KEYS")
                .map(|keys| {
                    keys.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let storage_defaults = StorageConfig::default();
        let storage = StorageConfig {
            scratch_dir: env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(storage_defaults.scratch_dir),
            max_upload_bytes: parse_env_or("MAX_UPLOAD_BYTES", storage_defaults.max_upload_bytes),
            allowed_mime_types: parse_env_list("ALLOWED_MIME_TYPES", DEFAULT_ALLOWED_MIME_TYPES),
            orphan_grace_secs: parse_env_or("ORPHAN_GRACE_SECS", storage_defaults.orphan_grace_secs),
            orphan_sweep_interval_secs: parse_env_or(
                "ORPHAN_SWEEP_INTERVAL_SECS",
                storage_defaults.orphan_sweep_interval_secs,
            ),
        };

        let decoder_defaults = DecoderConfig::default();
        let decoder = DecoderConfig {
            image_codecs: parse_env_list("IMAGE_CODECS", DEFAULT_IMAGE_CODECS),
            video_containers: parse_env_list("VIDEO_CONTAINERS", DEFAULT_VIDEO_CONTAINERS),
            video_codecs: parse_env_list("VIDEO_CODECS", DEFAULT_VIDEO_CODECS),
            sampling: parse_env_or("FRAME_SAMPLING", decoder_defaults.sampling),
            max_frames: parse_env_or("MAX_FRAMES", decoder_defaults.max_frames),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or(decoder_defaults.ffmpeg_path),
            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or(decoder_defaults.ffprobe_path),
            channel_capacity: parse_env_or(
                "DECODER_CHANNEL_CAPACITY",
                decoder_defaults.channel_capacity,
            )
            .max(1),
        };

        let pre = PreprocessConfig::default();
        let preprocess = PreprocessConfig {
            grayscale: parse_env_or("PREPROCESS_GRAYSCALE", pre.grayscale),
            denoise: parse_env_or("PREPROCESS_DENOISE", pre.denoise),
            binarize: parse_env_or("PREPROCESS_BINARIZE", pre.binarize),
            deskew: parse_env_or("PREPROCESS_DESKEW", pre.deskew),
            contrast: parse_env_or("PREPROCESS_CONTRAST", pre.contrast),
            max_dimension: parse_env_or("PREPROCESS_MAX_DIMENSION", pre.max_dimension),
            denoise_radius: parse_env_or("DENOISE_RADIUS", pre.denoise_radius),
            binarize_window: parse_env_or("BINARIZE_WINDOW", pre.binarize_window),
            binarize_k: parse_env_or("BINARIZE_K", pre.binarize_k),
            deskew_min_confidence: parse_env_or("DESKEW_MIN_CONFIDENCE", pre.deskew_min_confidence),
            deskew_min_angle: parse_env_or("DESKEW_MIN_ANGLE", pre.deskew_min_angle),
            gamma: parse_env_or("GAMMA", pre.gamma),
        };

        let ocr_defaults = OcrConfig::default();
        let ocr = OcrConfig {
            languages: env::var("OCR_LANGUAGES")
                .ok()
                .map(|v| crate::ocr::LanguageHints::parse(&v).into_vec())
                .filter(|langs| !langs.is_empty())
                .unwrap_or(ocr_defaults.languages),
            datapath: parse_env_opt("OCR_DATAPATH"),
            page_seg_mode: parse_env_or("OCR_PAGE_SEG_MODE", ocr_defaults.page_seg_mode),
            source_dpi: parse_env_or("OCR_SOURCE_DPI", ocr_defaults.source_dpi),
            timeout_ms: parse_env_or("OCR_TIMEOUT_MS", ocr_defaults.timeout_ms),
            pool_size: parse_env_or("OCR_POOL_SIZE", ocr_defaults.pool_size).max(1),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_concurrent_requests: parse_env_or("MAX_CONCURRENT_REQUESTS", ocr.pool_size * 2)
                .max(1),
            queue_timeout_ms: parse_env_or("QUEUE_TIMEOUT_MS", pipeline_defaults.queue_timeout_ms),
            request_timeout_secs: parse_env_or(
                "REQUEST_TIMEOUT_SECS",
                pipeline_defaults.request_timeout_secs,
            ),
            frame_concurrency: parse_env_or(
                "FRAME_CONCURRENCY",
                pipeline_defaults.frame_concurrency,
            )
            .max(1),
            dump_preprocessed_frames: parse_env_or(
                "DUMP_PREPROCESSED_FRAMES",
                pipeline_defaults.dump_preprocessed_frames,
            ),
        };

        let config = Self {
            server,
            storage,
            decoder,
            preprocess,
            ocr,
            pipeline,
        };
        for warning in config.warnings() {
            tracing::warn!("{}", warning);
        }
        config
    }

    /// Combinations that start fine but misbehave at runtime.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.storage.orphan_grace_secs <= self.pipeline.request_timeout_secs {
            warnings.push(format!(
                "ORPHAN_GRACE_SECS ({}) does not exceed REQUEST_TIMEOUT_SECS ({}); \
                 the sweeper may delete artifacts of requests still in flight",
                self.storage.orphan_grace_secs, self.pipeline.request_timeout_secs
            ));
        }
        warnings
    }
}
