use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::sampling::SamplingPolicy;
use super::{FrameStream, MediaDecoder};
use crate::config::DecoderConfig;
use crate::error::{Result, ScribeError};
use crate::models::{Frame, UploadArtifact};

const STDERR_LIMIT: usize = 4 * 1024;

/// Decodes video containers through `ffprobe` and an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct VideoDecoder {
    ffmpeg: String,
    ffprobe: String,
    containers: Vec<String>,
    codecs: Vec<String>,
    sampling: SamplingPolicy,
    max_frames: usize,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
}

/// What `ffprobe` told us about the first video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub container: String,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

impl VideoDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            containers: config.video_containers.clone(),
            codecs: config.video_codecs.clone(),
            sampling: config.sampling,
            max_frames: config.max_frames.max(1),
        }
    }

    /// Probe the file and validate container and codec against the allow-lists.
    pub async fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(&self.ffprobe, e))?;

        if !output.status.success() {
            return Err(ScribeError::CorruptMedia(stderr_summary(&output.stderr)));
        }

        let info = parse_probe(&output.stdout)?;

        let container_ok = info
            .container
            .split(',')
            .any(|name| self.containers.iter().any(|c| c == name.trim()));
        if !container_ok {
            return Err(ScribeError::UnsupportedCodec(format!(
                "container '{}' is not enabled",
                info.container
            )));
        }
        if !self.codecs.iter().any(|c| *c == info.codec) {
            return Err(ScribeError::UnsupportedCodec(format!(
                "video codec '{}' is not enabled",
                info.codec
            )));
        }

        Ok(info)
    }

    fn spawn_error(&self, binary: &str, e: std::io::Error) -> ScribeError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ScribeError::DecoderUnavailable(format!("'{binary}' not found"))
        } else {
            ScribeError::DecoderUnavailable(format!("failed to run '{binary}': {e}"))
        }
    }
}

fn parse_probe(stdout: &[u8]) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| ScribeError::CorruptMedia(format!("unreadable probe output: {e}")))?;

    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ScribeError::CorruptMedia("no video stream".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(ScribeError::CorruptMedia(
                "video stream has no dimensions".to_string(),
            ))
        }
    };

    Ok(VideoInfo {
        container: probe
            .format
            .and_then(|f| f.format_name)
            .unwrap_or_default()
            .to_lowercase(),
        codec: stream.codec_name.unwrap_or_default().to_lowercase(),
        width,
        height,
        fps: stream.avg_frame_rate.as_deref().and_then(parse_rate),
    })
}

/// ffprobe rates look like `30000/1001`; `0/0` means unknown.
fn parse_rate(raw: &str) -> Option<f64> {
    let (num, den) = match raw.split_once('/') {
        Some((n, d)) => (n.parse::<f64>().ok()?, d.parse::<f64>().ok()?),
        None => (raw.parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        None
    } else {
        Some(num / den)
    }
}

fn stderr_summary(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(&stderr[..stderr.len().min(STDERR_LIMIT)]);
    let line = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if line.is_empty() {
        "decoder exited with an error".to_string()
    } else {
        line.trim().to_string()
    }
}

/// Fill `buf` from `reader`. Returns the number of bytes read, which is
/// short only at end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl MediaDecoder for VideoDecoder {
    async fn decode(&self, artifact: &UploadArtifact) -> Result<FrameStream> {
        let info = self.probe(&artifact.path).await?;
        debug!(
            artifact_id = %artifact.id,
            container = %info.container,
            codec = %info.codec,
            width = info.width,
            height = info.height,
            "Decoding video"
        );

        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(&artifact.path)
            .args(["-an", "-sn", "-vf"])
            .arg(self.sampling.ffmpeg_filter());
        if matches!(self.sampling, SamplingPolicy::EveryNth(_)) {
            command.args(["-vsync", "vfr"]);
        }
        command
            .args(["-frames:v", &self.max_frames.to_string()])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| self.spawn_error(&self.ffmpeg, e))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScribeError::Internal("ffmpeg stdout not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = (&mut stderr).take(STDERR_LIMIT as u64).read_to_end(&mut buf).await;
                // keep draining so ffmpeg never blocks on a full pipe
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                buf
            })
        });

        let artifact_id = artifact.id.clone();
        let sampling = self.sampling;
        let max_frames = self.max_frames;
        let frame_len = info.width as usize * info.height as usize * 3;

        Ok(Box::pin(async_stream::stream! {
            // owned here so dropping the stream kills ffmpeg
            let mut child = child;
            let mut index = 0u32;

            loop {
                if index as usize >= max_frames {
                    return;
                }
                let mut buf = vec![0u8; frame_len];
                let filled = match read_frame(&mut stdout, &mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        yield Err(ScribeError::CorruptMedia(format!("reading decoded frames failed: {e}")));
                        return;
                    }
                };
                if filled == 0 {
                    break;
                }
                if filled < frame_len {
                    warn!(artifact_id = %artifact_id, index, filled, frame_len, "Truncated raw frame");
                    yield Err(ScribeError::CorruptMedia("video ended mid-frame".to_string()));
                    return;
                }
                let Some(image) = RgbImage::from_raw(info.width, info.height, buf) else {
                    yield Err(ScribeError::Internal("raw frame size mismatch".to_string()));
                    return;
                };
                yield Ok(Frame {
                    artifact_id: artifact_id.clone(),
                    index,
                    timestamp_ms: sampling.emitted_timestamp_ms(index, info.fps),
                    image: DynamicImage::ImageRgb8(image),
                });
                index += 1;
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    yield Err(ScribeError::CorruptMedia(format!("waiting for decoder failed: {e}")));
                    return;
                }
            };
            if !status.success() {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                warn!(artifact_id = %artifact_id, frames = index, %status, "ffmpeg exited with an error");
                yield Err(ScribeError::CorruptMedia(stderr_summary(&stderr)));
            }
        }))
    }
}
