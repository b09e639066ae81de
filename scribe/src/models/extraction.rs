use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ArtifactId, ErrorDetail, RecognitionResult};
use crate::error::ScribeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Partial,
    Failed,
}

/// Merged outcome of one extraction request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    #[schema(value_type = Option<String>)]
    pub artifact_id: Option<ArtifactId>,
    pub media_type: Option<String>,
    pub status: ExtractionStatus,
    pub text: String,
    pub mean_confidence: Option<f32>,
    pub min_confidence: Option<f32>,
    pub frame_count: usize,
    pub frames: Vec<RecognitionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub elapsed_ms: u64,
}

impl ExtractionResult {
    /// Failed result with no frames, for requests that never reached decoding.
    pub fn rejected(
        artifact_id: Option<ArtifactId>,
        media_type: Option<String>,
        err: &ScribeError,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            artifact_id,
            media_type,
            status: ExtractionStatus::Failed,
            text: String::new(),
            mean_confidence: None,
            min_confidence: None,
            frame_count: 0,
            frames: Vec::new(),
            error: Some(ErrorDetail::from(err)),
            elapsed_ms,
        }
    }

    /// Merge per-frame results (already in index order) into a request outcome.
    ///
    /// `decode_error` is the error that ended the frame stream early, if any.
    pub fn aggregate(
        artifact_id: ArtifactId,
        media_type: String,
        frames: Vec<RecognitionResult>,
        decode_error: Option<ScribeError>,
        elapsed_ms: u64,
    ) -> Self {
        let recognized: Vec<&RecognitionResult> =
            frames.iter().filter(|f| f.is_recognized()).collect();

        let status = if recognized.is_empty() {
            ExtractionStatus::Failed
        } else if recognized.len() == frames.len() && decode_error.is_none() {
            ExtractionStatus::Success
        } else {
            ExtractionStatus::Partial
        };

        let error = match status {
            ExtractionStatus::Success => None,
            _ => Some(Self::pick_error(&frames, decode_error.as_ref())),
        };

        let text = recognized
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let scored: Vec<f32> = recognized
            .iter()
            .filter(|f| !f.tokens.is_empty())
            .map(|f| f.confidence)
            .collect();
        let mean_confidence = if scored.is_empty() {
            None
        } else {
            Some(scored.iter().sum::<f32>() / scored.len() as f32)
        };
        let min_confidence = scored.iter().copied().reduce(f32::min);

        Self {
            artifact_id: Some(artifact_id),
            media_type: Some(media_type),
            status,
            text,
            mean_confidence,
            min_confidence,
            frame_count: frames.len(),
            frames,
            error,
            elapsed_ms,
        }
    }

    fn pick_error(frames: &[RecognitionResult], decode_error: Option<&ScribeError>) -> ErrorDetail {
        if let Some(err) = decode_error {
            return ErrorDetail::from(err);
        }
        if frames.is_empty() {
            return ErrorDetail::from(&ScribeError::CorruptMedia(
                "no frames could be decoded".to_string(),
            ));
        }
        frames
            .iter()
            .filter(|f| !f.is_recognized())
            .find_map(|f| f.error.clone())
            .unwrap_or_else(|| {
                ErrorDetail::from(&ScribeError::Internal(
                    "frame failed without detail".to_string(),
                ))
            })
    }
}
