mod common;

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tempfile::TempDir;

use common::{
    harness, harness_with, make_png, metadata_value, test_config, write_png, CountingTransforms,
    MockBehavior, FAILING_WIDTH, SLOW_WIDTH,
};
use scribe::models::{BatchOutcome, RecognitionRequest};

fn no_preprocessing() -> RecognitionRequest {
    RecognitionRequest {
        preprocess: false,
        ..RecognitionRequest::default()
    }
}

fn outcome_code(outcome: &BatchOutcome) -> Option<&str> {
    match outcome {
        BatchOutcome::Failure { code, .. } => Some(code.as_str()),
        BatchOutcome::Success { .. } => None,
    }
}

fn outcome_text(outcome: &BatchOutcome) -> Option<&str> {
    match outcome {
        BatchOutcome::Success { text, .. } => Some(text.as_str()),
        BatchOutcome::Failure { .. } => None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_identical_request_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "page.png", 40, 20);
    let h = harness(test_config());
    let request = RecognitionRequest::default();

    let first = h.service.recognize_path(&path, &request).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.result.text, "40x20");
    assert_eq!(first.result.language, "eng");

    let second = h.service.recognize_path(&path, &request).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.result.text, "40x20");
    assert_eq!(h.engines.recognized(), 1);

    assert_eq!(h.service.stats().cache.size, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_key_includes_language_and_preprocessing() {
    let png = make_png(24, 24);
    let h = harness(test_config());

    h.service
        .recognize_bytes(png.clone(), &RecognitionRequest::default())
        .await
        .unwrap();
    h.service
        .recognize_bytes(png.clone(), &no_preprocessing())
        .await
        .unwrap();
    let japanese = RecognitionRequest {
        language: Some("jpn".to_string()),
        ..RecognitionRequest::default()
    };
    let result = h.service.recognize_bytes(png, &japanese).await.unwrap();

    assert!(!result.cached);
    assert_eq!(result.result.language, "jpn");
    assert_eq!(h.engines.recognized(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_preserves_input_order_with_missing_file() {
    let dir = TempDir::new().unwrap();
    let slow = write_png(dir.path(), "a.png", SLOW_WIDTH, 10);
    let missing = dir.path().join("missing.png").to_string_lossy().into_owned();
    let fast = write_png(dir.path(), "c.png", 30, 10);
    let last = write_png(dir.path(), "d.png", 50, 10);
    let h = harness_with(
        test_config(),
        MockBehavior {
            slow_delay: Duration::from_millis(400),
        },
        CountingTransforms::default(),
    );

    let response = h
        .service
        .recognize_batch(
            vec![slow.clone(), missing.clone(), fast.clone(), last.clone()],
            &no_preprocessing(),
        )
        .await
        .unwrap();

    // The first item finishes last, behind items queued after it.
    assert_eq!(h.engines.completion_order(), vec![30, 50, SLOW_WIDTH]);

    assert_eq!(response.count, 4);
    assert_eq!(response.succeeded, 3);
    assert_eq!(response.failed, 1);

    let paths: Vec<&str> = response.results.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![slow.as_str(), missing.as_str(), fast.as_str(), last.as_str()]
    );
    assert_eq!(
        outcome_text(&response.results[0].outcome),
        Some(format!("{SLOW_WIDTH}x10").as_str())
    );
    assert_eq!(
        outcome_code(&response.results[1].outcome),
        Some("FILE_NOT_FOUND")
    );
    assert_eq!(outcome_text(&response.results[2].outcome), Some("30x10"));
    assert_eq!(outcome_text(&response.results[3].outcome), Some("50x10"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_isolates_engine_failure() {
    let dir = TempDir::new().unwrap();
    let paths = vec![
        write_png(dir.path(), "ok-1.png", 20, 20),
        write_png(dir.path(), "bad.png", FAILING_WIDTH, 20),
        write_png(dir.path(), "ok-2.png", 21, 20),
    ];
    let h = harness(test_config());

    let response = h
        .service
        .recognize_batch(paths, &no_preprocessing())
        .await
        .unwrap();

    assert_eq!(response.succeeded, 2);
    assert_eq!(outcome_text(&response.results[0].outcome), Some("20x20"));
    assert_eq!(
        outcome_code(&response.results[1].outcome),
        Some("OCR_ENGINE_FAILED")
    );
    assert_eq!(outcome_text(&response.results[2].outcome), Some("21x20"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_larger_than_queue_completes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.performance.worker_pool_size = 1;
    config.performance.queue_size = 1;
    let h = harness(config);

    let paths: Vec<String> = (0..6)
        .map(|i| write_png(dir.path(), &format!("page-{i}.png"), 30 + i, 10))
        .collect();

    let response = h
        .service
        .recognize_batch(paths, &no_preprocessing())
        .await
        .unwrap();

    assert_eq!(response.count, 6);
    assert_eq!(response.failed, 0);
    for (i, item) in response.results.iter().enumerate() {
        assert_eq!(
            outcome_text(&item.outcome),
            Some(format!("{}x10", 30 + i).as_str())
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_saturated_batch_gives_up_after_one_shared_deadline() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.performance.worker_pool_size = 1;
    config.performance.queue_size = 1;
    let h = harness(config);

    let paths: Vec<String> = (0..6)
        .map(|i| write_png(dir.path(), &format!("slow-{i}.png"), SLOW_WIDTH, 10 + i))
        .collect();

    let started = Instant::now();
    let response = h
        .service
        .recognize_batch(paths.clone(), &no_preprocessing())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Each admitted item holds the only worker for the full timeout, so the
    // queue cannot drain before the batch deadline passes.
    let rejected: Vec<usize> = response
        .results
        .iter()
        .enumerate()
        .filter(|(_, item)| match &item.outcome {
            BatchOutcome::Failure { code, error } => {
                code == "INTERNAL_ERROR" && error.contains("queue is full")
            }
            BatchOutcome::Success { .. } => false,
        })
        .map(|(i, _)| i)
        .collect();
    assert!(rejected.len() >= 2, "rejected items: {rejected:?}");
    assert!(rejected.iter().all(|&i| i >= 2));
    assert!(elapsed < Duration::from_millis(4500), "batch took {elapsed:?}");

    let returned: Vec<&str> = response.results.iter().map(|r| r.path.as_str()).collect();
    let expected: Vec<&str> = paths.iter().map(String::as_str).collect();
    assert_eq!(returned, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_batch_leaves_no_pending_results() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.performance.worker_pool_size = 1;
    config.performance.queue_size = 1;
    let h = harness_with(
        config,
        MockBehavior {
            slow_delay: Duration::from_millis(400),
        },
        CountingTransforms::default(),
    );

    let paths = vec![
        write_png(dir.path(), "slow.png", SLOW_WIDTH, 10),
        write_png(dir.path(), "a.png", 20, 10),
        write_png(dir.path(), "b.png", 21, 10),
        write_png(dir.path(), "c.png", 22, 10),
    ];

    // Give up while later items are still waiting for queue space.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(150),
        h.service.recognize_batch(paths, &no_preprocessing()),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(h.service.stats().pending_batch_items >= 1);

    // Submitted items drain through the router; unsubmitted ones were dropped.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(h.service.stats().pending_batch_items, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_batch_is_rejected() {
    let h = harness(test_config());
    let err = h
        .service
        .recognize_batch(Vec::new(), &RecognitionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_input_rejected_before_any_work() {
    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "big.png", 64, 64);
    let png = make_png(64, 64);

    let mut config = test_config();
    config.ocr.max_image_size = 32;
    let h = harness(config);

    let err = h
        .service
        .recognize_path(&path, &RecognitionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "IMAGE_TOO_LARGE");

    let err = h
        .service
        .recognize_base64(&STANDARD.encode(&png), &RecognitionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "IMAGE_TOO_LARGE");

    assert_eq!(h.transforms.calls(), 0);
    assert_eq!(h.engines.recognized(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_base64_input_and_data_url() {
    let h = harness(test_config());
    let encoded = STANDARD.encode(make_png(12, 8));

    let plain = h
        .service
        .recognize_base64(&encoded, &no_preprocessing())
        .await
        .unwrap();
    assert_eq!(plain.result.text, "12x8");

    let data_url = format!("data:image/png;base64,{encoded}");
    let cached = h
        .service
        .recognize_base64(&data_url, &no_preprocessing())
        .await
        .unwrap();
    assert!(cached.cached);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_base64_is_invalid_input() {
    let h = harness(test_config());
    let err = h
        .service
        .recognize_base64("%%% not base64 %%%", &RecognitionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
    assert_eq!(h.engines.recognized(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_image_file_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "just some text").unwrap();
    let h = harness(test_config());

    let err = h
        .service
        .recognize_path(&path.to_string_lossy(), &RecognitionRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_directory_and_empty_path_are_invalid_input() {
    let dir = TempDir::new().unwrap();
    let h = harness(test_config());
    let request = RecognitionRequest::default();

    let err = h
        .service
        .recognize_path(&dir.path().to_string_lossy(), &request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let err = h.service.recognize_path("   ", &request).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_language_is_rejected() {
    let h = harness(test_config());
    let request = RecognitionRequest {
        language: Some("eng+klingon".to_string()),
        ..RecognitionRequest::default()
    };

    let err = h
        .service
        .recognize_bytes(make_png(10, 10), &request)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");
    assert_eq!(h.engines.recognized(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_preprocessing_failure_falls_back_to_original() {
    let h = harness_with(
        test_config(),
        MockBehavior::default(),
        CountingTransforms {
            fail: true,
            ..CountingTransforms::default()
        },
    );
    let fixed = RecognitionRequest {
        auto_mode: false,
        ..RecognitionRequest::default()
    };

    let recognition = h
        .service
        .recognize_bytes(make_png(33, 11), &fixed)
        .await
        .unwrap();

    assert_eq!(recognition.result.text, "33x11");
    let metadata = &recognition.result.metadata;
    assert_eq!(
        metadata_value(metadata, "preprocessing_fallback").as_deref(),
        Some("true")
    );
    assert!(metadata_value(metadata, "preprocessing_error").is_some());
    assert!(h.transforms.calls() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fixed_mode_records_applied_steps() {
    let h = harness(test_config());
    let fixed = RecognitionRequest {
        auto_mode: false,
        ..RecognitionRequest::default()
    };

    let recognition = h
        .service
        .recognize_bytes(make_png(40, 40), &fixed)
        .await
        .unwrap();

    let metadata = &recognition.result.metadata;
    assert_eq!(
        metadata_value(metadata, "preprocessing_mode").as_deref(),
        Some("fixed")
    );
    assert!(metadata_value(metadata, "preprocessing_steps")
        .unwrap()
        .contains("grayscale"));
    assert!(metadata_value(metadata, "preprocessing_fallback").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_returns_promptly_and_engine_is_reused() {
    let h = harness(test_config());

    let started = Instant::now();
    let err = h
        .service
        .recognize_bytes(make_png(SLOW_WIDTH, 10), &no_preprocessing())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_millis(1400));

    // The abandoned call finishes in the background and hands the engine back.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let engines = h.service.stats().engines;
    assert_eq!(engines.idle, 1);

    let recognition = h
        .service
        .recognize_bytes(make_png(10, 10), &no_preprocessing())
        .await
        .unwrap();
    assert_eq!(recognition.result.text, "10x10");
    assert_eq!(h.engines.created.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_supported_languages_reports_default() {
    let h = harness(test_config());
    let languages = h.service.supported_languages();
    assert_eq!(languages.default_language, "eng");
    assert_eq!(languages.languages, vec!["eng", "jpn"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_supported_languages_come_from_engine_when_unconfigured() {
    let mut config = test_config();
    config.ocr.supported_languages = vec!["eng".to_string(), "fra".to_string()];
    let h = harness(config);
    assert_eq!(h.service.supported_languages().languages, vec!["eng", "fra"]);

    let mut config = test_config();
    config.ocr.supported_languages.clear();
    let h = harness(config);
    assert_eq!(h.service.supported_languages().languages, vec!["eng", "jpn"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_engines_and_rejects_batches() {
    let mut config = test_config();
    config.ocr.engine_pool_size = 2;
    let h = harness(config);

    h.service
        .recognize_bytes(make_png(10, 10), &no_preprocessing())
        .await
        .unwrap();
    h.service.shutdown().await;

    assert_eq!(h.engines.closed(), 2);
    let stats = h.service.stats();
    assert!(stats.engines.closed);
    assert_eq!(stats.cache.size, 0);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "late.png", 10, 10);
    let response = h
        .service
        .recognize_batch(vec![path], &no_preprocessing())
        .await
        .unwrap();
    assert_eq!(response.failed, 1);
}
