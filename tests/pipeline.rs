//! End-to-end runs of the orchestrator over in-memory stores.
//!
//! The PDF reader and the Infer stage are fakes (see `common`), so these
//! tests exercise the state machine, fan-out/fan-in, retries and the
//! result sink without pdfium or a model endpoint.

mod common;

use common::{fast_config, FailingSink, Harness, LayoutReader, ScriptedInfer};
use edgequake_pdfvision::{
    FailurePolicy, ImageError, ObjectStore, ReadError, RunId, RunStatus, RunStore,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Happy paths ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn describes_every_image_in_page_order() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1, 2]),
        ScriptedInfer::new(),
    );

    let run = h.run_to_end("doc1.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.image_count, Some(3));
    assert_eq!(h.infer.calls(), 3);

    let output = h.output("doc1.pdf").await.expect("output written");
    let positions: Vec<_> = output.results().map(|r| r.image.position()).collect();
    assert_eq!(positions, vec![(0, 0), (1, 0), (1, 1)]);
    assert_eq!(output.pages.len(), 2);
    assert_eq!(output.failed_count, 0);
    for r in output.results() {
        assert_eq!(r.description, ScriptedInfer::description(r.image.position()));
        assert_eq!(r.attempts, 1);
    }
}

#[tokio::test]
async fn every_transition_is_persisted_in_order() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1, 2]),
        ScriptedInfer::new(),
    );
    h.run_to_end("doc1.pdf").await;

    assert_eq!(
        h.runs.statuses("doc1.pdf"),
        vec![
            RunStatus::Pending,
            RunStatus::Extracting,
            RunStatus::Inferring,
            RunStatus::Aggregating,
            RunStatus::Succeeded,
        ]
    );
}

#[tokio::test]
async fn extracted_images_land_in_the_image_bucket() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[0, 2]),
        ScriptedInfer::new(),
    );
    h.run_to_end("doc1.pdf").await;

    let keys = h.objects.list(&h.config.image_bucket, "doc1.pdf/").await.unwrap();
    assert_eq!(
        keys,
        vec![
            "doc1.pdf/page-0001/image-000.png".to_string(),
            "doc1.pdf/page-0001/image-001.png".to_string(),
        ]
    );
    let png = h.objects.get(&h.config.image_bucket, &keys[0]).await.unwrap();
    assert_eq!(&png[..4], b"\x89PNG");
}

#[tokio::test]
async fn document_without_images_succeeds_with_empty_output() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[0, 0, 0]),
        ScriptedInfer::new(),
    );

    let run = h.run_to_end("text-only.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.image_count, Some(0));
    assert_eq!(h.infer.calls(), 0);
    assert!(!h.runs.statuses("text-only.pdf").contains(&RunStatus::Inferring));

    let output = h.output("text-only.pdf").await.expect("output written");
    assert!(output.is_empty());
    assert!(output.pages.is_empty());
}

// ── Fan-out / fan-in ─────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_completion_is_reordered() {
    // The first image is the slowest, the last the fastest.
    let infer = ScriptedInfer::new()
        .delay((0, 0), 60)
        .delay((0, 1), 30)
        .delay((1, 0), 1);
    let h = Harness::new(
        fast_config().infer_concurrency(4).build().unwrap(),
        LayoutReader::pages(&[2, 1]),
        infer,
    );

    h.run_to_end("doc.pdf").await;

    let arrival = h.infer.completion_order.lock().unwrap().clone();
    assert_eq!(arrival, vec![(1, 0), (0, 1), (0, 0)]);

    let output = h.output("doc.pdf").await.unwrap();
    let positions: Vec<_> = output.results().map(|r| r.image.position()).collect();
    assert_eq!(positions, vec![(0, 0), (0, 1), (1, 0)]);
}

#[tokio::test]
async fn aggregation_starts_only_after_all_images_finish() {
    let all = [(0, 0), (0, 1), (0, 2), (1, 0)];
    let infer = ScriptedInfer::new().delay_all(&all, 10).delay((0, 2), 50);
    let h = Harness::new(
        fast_config().infer_concurrency(2).build().unwrap(),
        LayoutReader::pages(&[3, 1]),
        infer,
    );

    h.run_to_end("doc.pdf").await;

    let history = h.runs.history.lock().unwrap().clone();
    let (_, _, completed_at_aggregate) = history
        .iter()
        .find(|(_, s, _)| *s == RunStatus::Aggregating)
        .cloned()
        .expect("Aggregating persisted");
    assert_eq!(completed_at_aggregate, all.len());
}

#[tokio::test]
async fn infer_concurrency_is_bounded() {
    let positions: Vec<_> = (0..10).map(|i| (0, i)).collect();
    let infer = ScriptedInfer::new().delay_all(&positions, 15);
    let h = Harness::new(
        fast_config().infer_concurrency(3).build().unwrap(),
        LayoutReader::pages(&[10]),
        infer,
    );

    let run = h.run_to_end("wide.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.infer.calls(), 10);
    let peak = h.infer.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded the limit");
    assert!(peak >= 2, "images were never described concurrently");
}

// ── Retries and per-image failures ───────────────────────────────────────────

#[tokio::test]
async fn transient_model_errors_are_retried() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[2]),
        ScriptedInfer::new().fail_times((0, 1), 2),
    );

    let run = h.run_to_end("doc.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.infer.calls(), 4);
    let output = h.output("doc.pdf").await.unwrap();
    let flaky = output.results().find(|r| r.image.position() == (0, 1)).unwrap();
    assert!(flaky.is_success());
    assert_eq!(flaky.attempts, 3);
}

#[tokio::test]
async fn partial_success_records_the_failed_image() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1, 2]),
        ScriptedInfer::new().always_fail((1, 0)),
    );

    let run = h.run_to_end("doc.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    // 2 healthy images + 3 attempts on the broken one.
    assert_eq!(h.infer.calls(), 5);

    let output = h.output("doc.pdf").await.unwrap();
    assert_eq!(output.image_count, 3);
    assert_eq!(output.failed_count, 1);
    let failed = output.results().find(|r| !r.is_success()).unwrap();
    assert_eq!(failed.image.position(), (1, 0));
    assert!(failed.description.is_empty());
    assert!(matches!(
        failed.error,
        Some(ImageError::Failed { page: 1, image: 0, attempts: 3, .. })
    ));
}

#[tokio::test]
async fn rejected_image_is_not_retried() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[2]),
        ScriptedInfer::new().reject((0, 0)),
    );

    let run = h.run_to_end("doc.pdf").await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.infer.calls(), 2);
    let output = h.output("doc.pdf").await.unwrap();
    let rejected = output.results().next().unwrap();
    assert!(matches!(rejected.error, Some(ImageError::Rejected { .. })));
    assert_eq!(rejected.attempts, 1);
}

#[tokio::test]
async fn abort_policy_fails_the_run() {
    let h = Harness::new(
        fast_config()
            .failure_policy(FailurePolicy::AbortOnImageFailure)
            .build()
            .unwrap(),
        LayoutReader::pages(&[1, 1]),
        ScriptedInfer::new().always_fail((0, 0)).delay((1, 0), 500),
    );

    let started = Instant::now();
    let run = h.run_to_end("doc.pdf").await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(400),
        "run ended after {elapsed:?}, not when (0,0) gave up"
    );
    assert!(!h.infer.completion_order.lock().unwrap().contains(&(1, 0)));
    assert_eq!(h.infer.completed.load(Ordering::SeqCst), 0);

    // The in-flight sibling was cancelled, not left to finish.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.infer.completed.load(Ordering::SeqCst), 0);

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("aborted"));
    assert!(h.output("doc.pdf").await.is_none());
    assert_eq!(
        h.runs.statuses("doc.pdf").last(),
        Some(&RunStatus::Failed)
    );
    assert!(!h.runs.statuses("doc.pdf").contains(&RunStatus::Aggregating));
}

// ── Run-level failures ───────────────────────────────────────────────────────

#[tokio::test]
async fn unreadable_pdf_fails_without_inference() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::failing(ReadError::Corrupt("xref table missing".into())),
        ScriptedInfer::new(),
    );

    let run = h.run_to_end("broken.pdf").await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("xref table missing"));
    assert_eq!(h.infer.calls(), 0);
    // Input errors are not retried.
    assert_eq!(h.reader.reads.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.runs.statuses("broken.pdf"),
        vec![RunStatus::Pending, RunStatus::Extracting, RunStatus::Failed]
    );

    let key = h.sink.failure_key(&RunId::new("broken.pdf"));
    assert!(h.objects.exists(&h.config.result_bucket, &key).await.unwrap());
}

#[tokio::test]
async fn missing_upload_fails_the_run() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1]),
        ScriptedInfer::new(),
    );

    let source = edgequake_pdfvision::UploadObjectRef::pdf("uploads", "ghost.pdf");
    let outcome = h.orchestrator.start(RunId::new("ghost.pdf"), source).await.unwrap();
    let edgequake_pdfvision::StartOutcome::Started(handle) = outcome else {
        panic!("expected a fresh run");
    };
    let run = handle.wait().await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.reader.reads.load(Ordering::SeqCst), 0);
    assert_eq!(h.infer.calls(), 0);
}

#[tokio::test]
async fn sink_failure_fails_the_run() {
    let sink = Arc::new(FailingSink::default());
    let h = Harness::with_sink(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1]),
        ScriptedInfer::new(),
        sink.clone(),
    );

    let run = h.run_to_end("doc.pdf").await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().starts_with("result sink"));
    assert_eq!(sink.puts.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.runs.statuses("doc.pdf").last(),
        Some(&RunStatus::Failed)
    );
}

#[tokio::test]
async fn failure_records_can_be_disabled() {
    let h = Harness::new(
        fast_config().record_failures(false).build().unwrap(),
        LayoutReader::failing(ReadError::PasswordRequired),
        ScriptedInfer::new(),
    );

    let run = h.run_to_end("locked.pdf").await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(h
        .objects
        .list(&h.config.result_bucket, "")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn stored_run_matches_returned_run() {
    let h = Harness::new(
        fast_config().build().unwrap(),
        LayoutReader::pages(&[1]),
        ScriptedInfer::new(),
    );

    let run = h.run_to_end("doc.pdf").await;
    let stored = h.runs.get(&RunId::new("doc.pdf")).await.unwrap().unwrap();

    assert_eq!(stored, run);
    assert!(stored.ended_at.is_some());
    assert!(stored.duration_ms().is_some());
}
