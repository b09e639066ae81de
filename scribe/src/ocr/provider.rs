use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::engine::LanguageHints;
use super::pool::EnginePool;
use crate::config::OcrConfig;
use crate::error::ScribeError;
use crate::models::{PreprocessedFrame, RecognitionResult};

/// Runs recognition for single frames on pooled engines, bounded by a
/// per-frame timeout.
#[derive(Clone)]
pub struct OcrProvider {
    pool: EnginePool,
    languages: Arc<Vec<String>>,
    timeout: Duration,
}

impl OcrProvider {
    pub fn new(pool: EnginePool, config: &OcrConfig) -> Self {
        Self {
            pool,
            languages: Arc::new(config.languages.clone()),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Recognize one frame. Failures are folded into the result so a bad
    /// frame never aborts the rest of the artifact.
    ///
    /// The timeout covers the engine call only, not the wait for a free
    /// engine. A call that overruns keeps its engine busy until it returns.
    pub async fn recognize(&self, frame: PreprocessedFrame, hints: &LanguageHints) -> RecognitionResult {
        let PreprocessedFrame {
            artifact_id,
            index,
            timestamp_ms,
            image,
            transformations,
            geometry,
            ..
        } = frame;

        let mut engine = match self.pool.checkout().await {
            Ok(engine) => engine,
            Err(e) => return RecognitionResult::unrecognized(index, timestamp_ms, &e, transformations),
        };

        let languages = hints.resolve(&self.languages);
        let handle = tokio::task::spawn_blocking(move || engine.recognize(&image, &languages));

        let outcome = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(ScribeError::EngineFailure(format!(
                "engine task aborted: {join_err}"
            ))),
            Err(_) => Err(ScribeError::RecognitionTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(output) => {
                debug!(
                    artifact_id = %artifact_id,
                    frame = index,
                    tokens = output.tokens.len(),
                    "Frame recognized"
                );
                let tokens = output
                    .tokens
                    .into_iter()
                    .map(|mut token| {
                        token.bbox = geometry.to_source(&token.bbox);
                        token
                    })
                    .collect();
                RecognitionResult::recognized(
                    index,
                    timestamp_ms,
                    output.text.trim().to_string(),
                    tokens,
                    transformations,
                )
            }
            Err(e) => {
                warn!(artifact_id = %artifact_id, frame = index, error = %e, "Frame recognition failed");
                RecognitionResult::unrecognized(index, timestamp_ms, &e, transformations)
            }
        }
    }
}
