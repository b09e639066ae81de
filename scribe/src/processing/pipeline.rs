use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesOrdered;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::Admission;
use crate::config::{Config, PipelineConfig};
use crate::decode::MediaDecoder;
use crate::error::ScribeError;
use crate::models::{
    ArtifactId, ExtractionResult, ExtractionStatus, Frame, RecognitionResult, UploadMeta,
};
use crate::ocr::{encode_png, LanguageHints, OcrProvider, Preprocessor};
use crate::storage::{ArtifactLease, ArtifactStore};

/// Where a request is in its lifecycle. Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPhase {
    Received,
    Decoding,
    Extracting,
    Aggregating,
    Done,
}

impl fmt::Display for ExtractionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Decoding => "decoding",
            Self::Extracting => "extracting",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(artifact_id: &ArtifactId, phase: ExtractionPhase) {
    debug!(artifact_id = %artifact_id, phase = %phase, "Extraction phase");
}

/// Upload metadata plus per-request options.
#[derive(Debug, Clone, Default)]
pub struct ExtractionRequest {
    pub meta: UploadMeta,
    pub languages: LanguageHints,
}

/// Drives one upload from bytes to an aggregated result:
/// admission, acquisition, decoding, preprocessing, recognition, release.
pub struct ExtractionOrchestrator {
    store: ArtifactStore,
    decoder: Arc<dyn MediaDecoder>,
    preprocessor: Arc<Preprocessor>,
    ocr: OcrProvider,
    admission: Admission,
    config: PipelineConfig,
}

impl ExtractionOrchestrator {
    pub fn new(
        store: ArtifactStore,
        decoder: Arc<dyn MediaDecoder>,
        ocr: OcrProvider,
        config: &Config,
    ) -> Self {
        let pipeline = config.pipeline.clone();
        Self {
            store,
            decoder,
            preprocessor: Arc::new(Preprocessor::new(config.preprocess.clone())),
            ocr,
            admission: Admission::new(
                pipeline.max_concurrent_requests,
                Duration::from_millis(pipeline.queue_timeout_ms),
            ),
            config: pipeline,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ocr(&self) -> &OcrProvider {
        &self.ocr
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Run a full extraction. Never returns an error: every failure is
    /// folded into a `failed` result, and the artifact is released before
    /// this returns on every path.
    pub async fn extract<S, B>(
        &self,
        request: ExtractionRequest,
        body: S,
        cancel: CancellationToken,
    ) -> ExtractionResult
    where
        S: Stream<Item = std::io::Result<B>> + Send + Unpin,
        B: AsRef<[u8]> + Send,
    {
        let started = Instant::now();
        let timeout_secs = self.config.request_timeout_secs;
        let deadline = started + Duration::from_secs(timeout_secs);
        let elapsed = || started.elapsed().as_millis() as u64;

        let ExtractionRequest { meta, languages } = request;
        let declared_type = meta.declared_type.clone();

        let admitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScribeError::Cancelled("request cancelled while queued".to_string())),
            admitted = self.admission.admit() => admitted,
        };
        let _permit = match admitted {
            Ok(permit) => permit,
            Err(e) => return ExtractionResult::rejected(None, declared_type, &e, elapsed()),
        };

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScribeError::Cancelled("request cancelled during upload".to_string())),
            _ = tokio::time::sleep_until(deadline) => Err(ScribeError::DeadlineExceeded { timeout_secs }),
            acquired = self.store.acquire(meta, body) => acquired,
        };
        let mut lease = match acquired {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Upload rejected");
                return ExtractionResult::rejected(None, declared_type, &e, elapsed());
            }
        };

        let artifact_id = lease.id().clone();
        let media_type = lease.artifact().mime_type.clone();
        enter(&artifact_id, ExtractionPhase::Received);

        let outcome = match lease.begin_processing() {
            Ok(()) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ScribeError::Cancelled("request cancelled".to_string())),
                    _ = tokio::time::sleep_until(deadline) => Err(ScribeError::DeadlineExceeded { timeout_secs }),
                    frames = self.run_frames(&lease, &languages) => Ok(frames),
                }
            }
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok((frames, decode_error)) => {
                enter(&artifact_id, ExtractionPhase::Aggregating);
                ExtractionResult::aggregate(
                    artifact_id.clone(),
                    media_type.clone(),
                    frames,
                    decode_error,
                    elapsed(),
                )
            }
            Err(e) => {
                warn!(artifact_id = %artifact_id, error = %e, "Extraction aborted");
                ExtractionResult::rejected(
                    Some(artifact_id.clone()),
                    Some(media_type.clone()),
                    &e,
                    elapsed(),
                )
            }
        };

        if let Err(e) = lease.finish(result.status != ExtractionStatus::Failed) {
            warn!(artifact_id = %artifact_id, error = %e, "Unexpected artifact state");
        }
        let report = self.store.release(lease).await;
        enter(&artifact_id, ExtractionPhase::Done);

        info!(
            artifact_id = %artifact_id,
            media_type = %media_type,
            status = ?result.status,
            frames = result.frame_count,
            removed = report.removed.len(),
            cleanup_failures = report.failures,
            elapsed_ms = result.elapsed_ms,
            "Extraction finished"
        );

        result
    }

    /// Decode and recognize every frame, keeping results in frame order.
    ///
    /// Returns the results plus the error that ended decoding, if any.
    async fn run_frames(
        &self,
        lease: &ArtifactLease,
        languages: &LanguageHints,
    ) -> (Vec<RecognitionResult>, Option<ScribeError>) {
        let artifact_id = lease.id();
        enter(artifact_id, ExtractionPhase::Decoding);

        let stream = match self.decoder.decode(lease.artifact()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(artifact_id = %artifact_id, error = %e, "Decoding failed before first frame");
                return (Vec::new(), Some(e));
            }
        };

        let limit = self.config.frame_concurrency.max(1);
        let mut stream = stream;
        let mut in_flight = FuturesOrdered::new();
        let mut frames = Vec::new();
        let mut decode_error: Option<ScribeError> = None;
        let mut exhausted = false;

        loop {
            let can_pull = !exhausted && in_flight.len() < limit;
            tokio::select! {
                item = stream.next(), if can_pull => match item {
                    Some(Ok(frame)) => {
                        if frames.is_empty() && in_flight.is_empty() {
                            enter(artifact_id, ExtractionPhase::Extracting);
                        }
                        in_flight.push_back(self.process_frame(lease, frame, languages));
                    }
                    Some(Err(e)) => {
                        warn!(artifact_id = %artifact_id, error = %e, "Decoding stopped mid-stream");
                        decode_error = Some(e);
                        exhausted = true;
                    }
                    None => exhausted = true,
                },
                Some(result) = in_flight.next(), if !in_flight.is_empty() => frames.push(result),
                else => break,
            }
        }

        (frames, decode_error)
    }

    async fn process_frame(
        &self,
        lease: &ArtifactLease,
        frame: Frame,
        languages: &LanguageHints,
    ) -> RecognitionResult {
        let index = frame.index;
        let timestamp_ms = frame.timestamp_ms;
        let preprocessor = Arc::clone(&self.preprocessor);
        let dump = self
            .config
            .dump_preprocessed_frames
            .then(|| lease.intermediate(&format!("frame-{index}"), "png"));

        let prepared = tokio::task::spawn_blocking(move || {
            let prepared = preprocessor.process(frame);
            let dumped = dump.map(|writer| {
                let written = encode_png(&prepared.image).and_then(|png| writer.write(&png));
                (writer, written)
            });
            (prepared, dumped)
        })
        .await;

        let (prepared, dumped) = match prepared {
            Ok(done) => done,
            Err(e) => {
                let err = ScribeError::Internal(format!("preprocessing task failed: {e}"));
                warn!(artifact_id = %lease.id(), frame = index, error = %e, "Preprocessing failed");
                return RecognitionResult::unrecognized(index, timestamp_ms, &err, Vec::new());
            }
        };

        match dumped {
            Some((writer, Ok(true))) => {
                debug!(artifact_id = %lease.id(), frame = index, path = %writer.path().display(), "Dumped preprocessed frame");
            }
            Some((_, Ok(false))) => {
                debug!(artifact_id = %lease.id(), frame = index, "Artifact released before frame dump");
            }
            Some((_, Err(e))) => {
                warn!(artifact_id = %lease.id(), frame = index, error = %e, "Could not dump preprocessed frame");
            }
            None => {}
        }

        self.ocr.recognize(prepared, languages).await
    }
}
