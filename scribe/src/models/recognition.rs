use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::Transformation;
use crate::error::{ErrorCode, ScribeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A recognised word with its position in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Token {
    pub text: String,
    /// Engine confidence rescaled to `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub block: u32,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Recognized,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&ScribeError> for ErrorDetail {
    fn from(err: &ScribeError) -> Self {
        Self {
            code: err.code(),
            message: err.public_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub frame_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    pub text: String,
    pub confidence: f32,
    pub tokens: Vec<Token>,
    pub status: FrameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub transformations: Vec<Transformation>,
}

impl RecognitionResult {
    pub fn recognized(
        frame_index: u32,
        timestamp_ms: Option<u64>,
        text: String,
        tokens: Vec<Token>,
        transformations: Vec<Transformation>,
    ) -> Self {
        let confidence = mean_confidence(&tokens);
        Self {
            frame_index,
            timestamp_ms,
            text,
            confidence,
            tokens,
            status: FrameStatus::Recognized,
            error: None,
            transformations,
        }
    }

    /// Empty, zero-confidence result for a frame the engine gave up on.
    pub fn unrecognized(
        frame_index: u32,
        timestamp_ms: Option<u64>,
        err: &ScribeError,
        transformations: Vec<Transformation>,
    ) -> Self {
        let status = match err {
            ScribeError::RecognitionTimeout { .. } => FrameStatus::TimedOut,
            _ => FrameStatus::Failed,
        };
        Self {
            frame_index,
            timestamp_ms,
            text: String::new(),
            confidence: 0.0,
            tokens: Vec::new(),
            status,
            error: Some(ErrorDetail::from(err)),
            transformations,
        }
    }

    pub fn is_recognized(&self) -> bool {
        self.status == FrameStatus::Recognized
    }
}

pub fn mean_confidence(tokens: &[Token]) -> f32 {
    if tokens.is_empty() {
        return 0.0;
    }
    tokens.iter().map(|t| t.confidence).sum::<f32>() / tokens.len() as f32
}
