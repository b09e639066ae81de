mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::*;
use scribe::error::ErrorCode;
use scribe::models::{BoundingBox, ExtractionStatus, FrameStatus};
use scribe::ocr::LanguageHints;

fn error_code(result: &scribe::models::ExtractionResult) -> Option<ErrorCode> {
    result.error.as_ref().map(|e| e.code)
}

#[tokio::test]
async fn clean_png_invoice_succeeds() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("INVOICE #4521"))).await;

    let png = png_bytes(200, 80);
    let result = orchestrator
        .extract(request("invoice.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert!(result.text.contains("INVOICE #4521"));
    assert!(result.mean_confidence.unwrap() >= 0.85);
    assert_eq!(result.frame_count, 1);
    assert_eq!(result.frames[0].timestamp_ms, None);
    assert_eq!(result.media_type.as_deref(), Some("image/png"));
    assert!(result.error.is_none());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn results_stay_in_frame_order_with_shuffled_delays() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.ocr.pool_size = 4;
    config.pipeline.frame_concurrency = 4;

    let delays = [90u64, 5, 60, 0, 40, 75, 10, 30];
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(delays.len() as u32)),
        script(move |index, _| {
            Step::SleepThenSay(delays[index as usize], format!("frame {index}"))
        }),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    let indices: Vec<u32> = result.frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(indices, (0..8).collect::<Vec<u32>>());
    for frame in &result.frames {
        assert_eq!(frame.text, format!("frame {}", frame.frame_index));
        assert_eq!(frame.timestamp_ms, Some(u64::from(frame.frame_index) * 1000));
    }
    let expected: Vec<String> = (0..8).map(|i| format!("frame {i}")).collect();
    assert_eq!(result.text, expected.join("\n\n"));
}

#[tokio::test]
async fn one_timed_out_frame_makes_result_partial() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.ocr.timeout_ms = 100;

    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(5)),
        script(|index, _| {
            if index == 2 {
                Step::SleepThenSay(600, "too late".to_string())
            } else {
                Step::Say(format!("page {index}"))
            }
        }),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Partial);
    assert_eq!(result.frame_count, 5);
    let late = &result.frames[2];
    assert_eq!(late.status, FrameStatus::TimedOut);
    assert_eq!(late.text, "");
    assert_eq!(late.confidence, 0.0);
    assert_eq!(error_code(&result), Some(ErrorCode::RecognitionTimeout));
    assert!(!result.text.contains("too late"));
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn every_frame_failing_fails_the_request() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(3)),
        script(|_, _| Step::Fail),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(result.frame_count, 3);
    assert_eq!(error_code(&result), Some(ErrorCode::EngineFailure));
    assert!(result.mean_confidence.is_none());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn decode_error_mid_stream_keeps_earlier_frames() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let decoder = FakeDecoder {
        frames: 10,
        fail_after: Some(3),
        reject: false,
    };
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(decoder),
        script(|index, _| Step::Say(format!("line {index}"))),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Partial);
    assert_eq!(result.frame_count, 3);
    assert_eq!(error_code(&result), Some(ErrorCode::CorruptMedia));
    assert_eq!(result.text, "line 0\n\nline 1\n\nline 2");
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn decoder_rejection_fails_before_any_frame() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let decoder = FakeDecoder {
        frames: 10,
        fail_after: None,
        reject: true,
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(decoder),
        script(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Step::say("never")
        }),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(result.frame_count, 0);
    assert_eq!(error_code(&result), Some(ErrorCode::UnsupportedCodec));
    assert!(result.artifact_id.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn disabled_image_codec_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.decoder.image_codecs = vec!["png".to_string()];
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("unused"))).await;

    let jpeg = jpeg_bytes(32, 32);
    let result = orchestrator
        .extract(request("photo.jpg", "image/jpeg", jpeg.len()), body(&jpeg), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(error_code(&result), Some(ErrorCode::UnsupportedCodec));
    assert!(result.frames.is_empty());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn oversized_payload_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.storage.max_upload_bytes = 1024;
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("unused"))).await;

    let mut png = png_bytes(64, 64);
    png.resize(20 * 1024, 0);

    // Undeclared size, so the limit trips mid-stream.
    let mut req = request("big.png", "image/png", 0);
    req.meta.declared_size = None;
    let result = orchestrator
        .extract(req, body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(error_code(&result), Some(ErrorCode::PayloadTooLarge));
    assert_eq!(result.frame_count, 0);
    assert!(result.artifact_id.is_none());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn ten_second_animation_yields_ten_frames_at_one_fps() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("ticker"))).await;

    let gif = gif_bytes(100, 100);
    let result = orchestrator
        .extract(request("ticker.gif", "image/gif", gif.len()), body(&gif), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(result.frame_count, 10);
    let indices: Vec<u32> = result.frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<u32>>());
    let stamps: Vec<Option<u64>> = result.frames.iter().map(|f| f.timestamp_ms).collect();
    assert_eq!(stamps, (0..10).map(|s| Some(s * 1000)).collect::<Vec<_>>());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn multi_page_tiff_recognizes_every_page() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("page text"))).await;

    let tiff = tiff_bytes(&[230, 240]);
    let result = orchestrator
        .extract(request("scan.tiff", "image/tiff", tiff.len()), body(&tiff), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(result.frame_count, 2);
    let indices: Vec<u32> = result.frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(indices, vec![0, 1]);
    assert!(result.frames.iter().all(|f| f.timestamp_ms.is_none()));
    assert_eq!(result.text, "page text\n\npage text");
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn token_boxes_map_back_to_the_uploaded_frame() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    assert_eq!(config.preprocess.max_dimension, 4096);
    let orchestrator = image_orchestrator(&config, script(|_, _| Step::say("WIDE BANNER"))).await;

    let png = png_bytes(6000, 60);
    let result = orchestrator
        .extract(request("banner.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    let boxes: Vec<BoundingBox> = result.frames[0].tokens.iter().map(|t| t.bbox).collect();
    // The engine saw a 4096x40 image; 6000/4096 and 60/40 scale the boxes back.
    assert_eq!(
        boxes,
        vec![
            BoundingBox { x: 0, y: 0, width: 59, height: 18 },
            BoundingBox { x: 73, y: 0, width: 59, height: 18 },
        ]
    );
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn cancellation_releases_the_artifact() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(4)),
        script(|_, _| Step::SleepThenSay(400, "slow".to_string())),
    )
    .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), cancel)
        .await;

    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(error_code(&result), Some(ErrorCode::Cancelled));
    assert!(result.frames.is_empty());
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn request_deadline_fails_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.pipeline.request_timeout_secs = 1;
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(2)),
        script(|_, _| Step::SleepThenSay(2_500, "slow".to_string())),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(error_code(&result), Some(ErrorCode::DeadlineExceeded));
    assert_eq!(result.status, ExtractionStatus::Failed);
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn saturated_service_rejects_without_touching_storage() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.pipeline.max_concurrent_requests = 1;
    config.pipeline.queue_timeout_ms = 50;
    let orchestrator = Arc::new(
        orchestrator_with(
            &config,
            Arc::new(FakeDecoder::frames(1)),
            script(|_, _| Step::SleepThenSay(500, "busy".to_string())),
        )
        .await,
    );

    let png = png_bytes(8, 8);
    let first = {
        let orchestrator = orchestrator.clone();
        let png = png.clone();
        tokio::spawn(async move {
            orchestrator
                .extract(request("a.png", "image/png", png.len()), body(&png), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = orchestrator
        .extract(request("b.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;
    assert_eq!(error_code(&second), Some(ErrorCode::Saturated));
    assert!(second.artifact_id.is_none());

    let first = first.await.unwrap();
    assert_eq!(first.status, ExtractionStatus::Success);
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn cancelling_a_queued_request_does_not_wait_for_the_queue_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.pipeline.max_concurrent_requests = 1;
    config.pipeline.queue_timeout_ms = 10_000;
    let orchestrator = Arc::new(
        orchestrator_with(
            &config,
            Arc::new(FakeDecoder::frames(1)),
            script(|_, _| Step::SleepThenSay(600, "busy".to_string())),
        )
        .await,
    );

    let png = png_bytes(8, 8);
    let first = {
        let orchestrator = orchestrator.clone();
        let png = png.clone();
        tokio::spawn(async move {
            orchestrator
                .extract(request("a.png", "image/png", png.len()), body(&png), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let queued = orchestrator
        .extract(request("b.png", "image/png", png.len()), body(&png), cancel)
        .await;
    assert_eq!(error_code(&queued), Some(ErrorCode::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(first.await.unwrap().status, ExtractionStatus::Success);
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn dumped_frames_exist_during_recognition_and_are_purged() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.pipeline.dump_preprocessed_frames = true;
    config.pipeline.frame_concurrency = 1;

    let root = dir.path().to_path_buf();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(3)),
        script(move |index, _| {
            let dumped = std::fs::read_dir(&root)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .ends_with(&format!(".frame-{index}.png"))
                })
                .count();
            counter.fetch_add(dumped, Ordering::SeqCst);
            Step::Say(format!("frame {index}"))
        }),
    )
    .await;

    let png = png_bytes(8, 8);
    let result = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;

    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(scratch_count(dir.path()), 0);
}

#[tokio::test]
async fn language_hints_select_installed_packs() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let orchestrator = orchestrator_with(
        &config,
        Arc::new(FakeDecoder::frames(1)),
        script(|_, languages| Step::Say(languages.join("+"))),
    )
    .await;

    let png = png_bytes(8, 8);
    let mut req = request("clip.png", "image/png", png.len());
    req.languages = LanguageHints::parse("deu+klingon");
    let hinted = orchestrator
        .extract(req, body(&png), CancellationToken::new())
        .await;
    assert_eq!(hinted.text, "deu");

    let plain = orchestrator
        .extract(request("clip.png", "image/png", png.len()), body(&png), CancellationToken::new())
        .await;
    assert_eq!(plain.text, "eng+deu");
}
