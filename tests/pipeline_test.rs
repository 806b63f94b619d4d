//! Job lifecycle through gateway, queue, registry and worker, on the
//! in-memory backends with a paused clock.

mod helpers;

use helpers::*;
use std::sync::Arc;
use std::time::Duration;

use stylequeue::config::ScalerSettings;
use stylequeue::controller::{PoolController, ReplicaScaler};
use stylequeue::db::registry::JobRegistry;
use stylequeue::models::job::{output_key, JobId, JobKind, JobState};
use stylequeue::models::submission::JobOutput;
use stylequeue::services::queue::{JobQueue, QueuedJob};
use stylequeue::services::storage::BlobStore;
use stylequeue::worker::pool::LocalPool;
use stylequeue::worker::Outcome;

use JobState::{Completed, Failed, Processing, Queued};

#[tokio::test(start_paused = true)]
async fn test_status_is_queued_right_after_submit() {
    let stack = TestStack::new();
    let job_id = stack.submit_style(0.7, 0.8).await;

    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.status, Queued);
    assert_eq!(status.attempt_count, 0);
    assert!(status.result.is_none());
    assert!(status.error.is_none());
    assert_eq!(stack.queue.stats().await.unwrap().visible, 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_job_reports_processing_time() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![Step::SucceedAfter(Duration::from_secs(12))]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.7, 0.8).await;
    let outcome = worker.poll_once().await.unwrap();
    assert_eq!(outcome, Some(Outcome::Completed));

    assert_eq!(stack.registry.history(job_id), vec![Queued, Processing, Completed]);

    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.status, Completed);
    assert_eq!(status.attempt_count, 1);
    match status.result {
        Some(JobOutput::Image {
            result_image,
            processing_time,
        }) => {
            assert_eq!(result_image, PNG_B64);
            assert!((processing_time - 12.0).abs() < 0.5, "took {}", processing_time);
        }
        other => panic!("expected image result, got {:?}", other),
    }

    let stats = stack.queue.stats().await.unwrap();
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recommendation_job_returns_places() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_recommendation("Bandung", 3).await;
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Completed));

    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.kind, JobKind::Recommendation);
    assert_eq!(status.status, Completed);
    match status.result {
        Some(JobOutput::Recommendations {
            recommendations,
            total_found,
            ..
        }) => {
            assert_eq!(total_found, 3);
            assert!(recommendations.iter().all(|p| p.city == "Bandung"));
        }
        other => panic!("expected recommendations, got {:?}", other),
    }
    assert_eq!(
        stack.store.content_type(&output_key(job_id, 1)).as_deref(),
        Some("application/json")
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retry_until_success() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![
        Step::Transient("CUDA out of memory"),
        Step::Transient("model server unreachable"),
        Step::Succeed,
    ]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Requeued));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Requeued));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Completed));
    assert_eq!(worker.poll_once().await.unwrap(), None);

    let job = stack.registry.read(job_id).await.unwrap();
    assert_eq!(job.state, Completed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(
        stack.registry.history(job_id),
        vec![Queued, Processing, Queued, Processing, Queued, Processing, Completed]
    );
    assert_eq!(stack.result_keys().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_fail_with_reason() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![
        Step::Transient("out of memory"),
        Step::Transient("out of memory"),
        Step::Transient("out of memory"),
    ]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Requeued));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Requeued));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Failed));
    assert_eq!(worker.poll_once().await.unwrap(), None);

    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.status, Failed);
    assert_eq!(status.attempt_count, 3);
    assert!(status.result.is_none());
    let reason = status.error.unwrap();
    assert!(reason.contains("out of memory"), "reason: {}", reason);

    let history = stack.registry.history(job_id);
    let requeues = history.iter().skip(1).filter(|s| **s == Queued).count();
    assert_eq!(requeues, 2);
    assert!(stack.result_keys().is_empty());
    assert_eq!(stack.queue.stats().await.unwrap().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_fails_without_retry() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![Step::Fatal("cannot decode style image")]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Failed));

    let job = stack.registry.read(job_id).await.unwrap();
    assert_eq!(job.state, Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(processor.calls(), 1);
    assert_eq!(worker.poll_once().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_transient() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![Step::Hang, Step::Succeed]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Requeued));
    let job = stack.registry.read(job_id).await.unwrap();
    assert_eq!(job.state, Queued);
    assert!(job.failure_reason.unwrap().contains("timed out"));

    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_missing_input_blob_is_fatal() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    stack
        .store
        .delete(&format!("inputs/{}/style", job_id))
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Failed));
    let job = stack.registry.read(job_id).await.unwrap();
    assert_eq!(job.state, Failed);
    assert!(job.failure_reason.unwrap().contains("missing"));
    assert_eq!(processor.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_completes_once() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![]);
    let worker = stack.worker("w1", processor.clone(), fast_settings());

    let job_id = stack.submit_style(0.5, 0.5).await;
    stack
        .queue
        .enqueue(&QueuedJob::new(job_id, JobKind::StyleTransfer))
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Completed));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Dropped));
    assert_eq!(worker.poll_once().await.unwrap(), None);

    let completions = stack
        .registry
        .history(job_id)
        .into_iter()
        .filter(|s| *s == Completed)
        .count();
    assert_eq!(completions, 1);
    assert_eq!(stack.result_keys().len(), 1);
    assert_eq!(processor.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_while_leased_is_abandoned_then_dropped() {
    let stack = TestStack::new();
    let slow = ScriptedProcessor::new(vec![Step::SucceedAfter(Duration::from_secs(20))]);
    let other = ScriptedProcessor::new(vec![]);
    let settings = fast_settings();
    let first = Arc::new(stack.worker("w1", slow.clone(), settings.clone()));
    let second = stack.worker("w2", other.clone(), settings.clone());

    let job_id = stack.submit_style(0.5, 0.5).await;
    stack
        .queue
        .enqueue(&QueuedJob::new(job_id, JobKind::StyleTransfer))
        .await
        .unwrap();

    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.poll_once().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // No result is visible while the holder is still processing.
    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.status, Processing);
    assert!(status.result.is_none());
    assert!(stack.result_keys().is_empty());

    assert_eq!(second.poll_once().await.unwrap(), Some(Outcome::Abandoned));
    // Released duplicate stays hidden for the abandon delay.
    assert_eq!(second.poll_once().await.unwrap(), None);

    assert_eq!(running.await.unwrap().unwrap(), Some(Outcome::Completed));
    assert_eq!(second.poll_once().await.unwrap(), Some(Outcome::Dropped));

    assert_eq!(other.calls(), 0);
    assert_eq!(stack.result_keys().len(), 1);
    assert_eq!(stack.registry.read(job_id).await.unwrap().attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_job_is_reclaimed() {
    let stack = TestStack::new();
    let settings = fast_settings();
    let doomed = Arc::new(stack.worker(
        "w1",
        ScriptedProcessor::new(vec![Step::Hang]),
        settings.clone(),
    ));
    let rescuer = stack.worker("w2", ScriptedProcessor::new(vec![]), settings.clone());

    let job_id = stack.submit_chat("Who painted The Starry Night?").await;
    let crashed = {
        let doomed = doomed.clone();
        tokio::spawn(async move { doomed.poll_once().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    crashed.abort();
    assert_eq!(stack.registry.read(job_id).await.unwrap().state, Processing);

    // The delivery reappears once visibility lapses; the registry lease is
    // wall-clock based, so expire it explicitly.
    tokio::time::sleep(settings.visibility_timeout).await;
    stack.registry.expire_lease(job_id);

    assert_eq!(rescuer.poll_once().await.unwrap(), Some(Outcome::Completed));
    let status = stack.gateway.get_status(job_id).await.unwrap();
    assert_eq!(status.status, Completed);
    assert_eq!(status.attempt_count, 2);
    match status.result {
        Some(JobOutput::Text { answer, .. }) => assert!(answer.contains("Starry Night")),
        other => panic!("expected text result, got {:?}", other),
    }
    assert_eq!(
        stack.registry.history(job_id),
        vec![Queued, Processing, Queued, Processing, Completed]
    );
}

#[tokio::test(start_paused = true)]
async fn test_late_writer_cannot_replace_published_result() {
    let stack = TestStack::new();
    let settings = fast_settings();
    let slow = Arc::new(stack.worker(
        "w1",
        ScriptedProcessor::new(vec![Step::SucceedAfter(Duration::from_secs(20))]),
        settings.clone(),
    ));
    let rescuer = stack.worker("w2", ScriptedProcessor::new(vec![]), settings.clone());

    let job_id = stack.submit_style(0.5, 0.5).await;
    let late = {
        let slow = slow.clone();
        tokio::spawn(async move { slow.poll_once().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The slow holder looks dead to the registry; a redelivery takes over.
    stack.registry.expire_lease(job_id);
    stack
        .queue
        .enqueue(&QueuedJob::new(job_id, JobKind::StyleTransfer))
        .await
        .unwrap();
    assert_eq!(rescuer.poll_once().await.unwrap(), Some(Outcome::Completed));
    let published = stack.registry.read(job_id).await.unwrap().result.unwrap();
    assert_eq!(published.output_key, output_key(job_id, 2));

    // The first attempt finishes afterwards and must lose the race.
    assert_eq!(late.await.unwrap().unwrap(), Some(Outcome::Abandoned));

    let job = stack.registry.read(job_id).await.unwrap();
    assert_eq!(job.state, Completed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.result, Some(published));
    assert_eq!(stack.result_keys(), vec![output_key(job_id, 2)]);
    assert_eq!(
        stack.registry.history(job_id),
        vec![Queued, Processing, Queued, Processing, Completed]
    );
    assert_eq!(stack.queue.stats().await.unwrap().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_for_unknown_job_is_dropped() {
    let stack = TestStack::new();
    let worker = stack.worker("w1", ScriptedProcessor::new(vec![]), fast_settings());

    stack
        .queue
        .enqueue(&QueuedJob::new(JobId::new(), JobKind::Chat))
        .await
        .unwrap();

    assert_eq!(worker.poll_once().await.unwrap(), Some(Outcome::Dropped));
    assert_eq!(stack.queue.stats().await.unwrap().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_long_job_keeps_its_lease() {
    let stack = TestStack::new();
    // Runs well past the visibility timeout, so the keeper must extend it.
    let settings = stylequeue::config::WorkerSettings {
        job_timeout: Duration::from_secs(200),
        ..fast_settings()
    };
    let worker = Arc::new(stack.worker(
        "w1",
        ScriptedProcessor::new(vec![Step::SucceedAfter(Duration::from_secs(150))]),
        settings.clone(),
    ));
    let other = stack.worker("w2", ScriptedProcessor::new(vec![]), settings.clone());

    let job_id = stack.submit_style(0.5, 0.5).await;
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.poll_once().await })
    };

    tokio::time::sleep(Duration::from_secs(100)).await;
    // Still hidden: the keeper extended visibility past the initial 60s.
    assert_eq!(other.poll_once().await.unwrap(), None);

    assert_eq!(running.await.unwrap().unwrap(), Some(Outcome::Completed));
    assert_eq!(stack.registry.read(job_id).await.unwrap().attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_drained_worker_exits_between_jobs() {
    let stack = TestStack::new();
    let drain = tokio_util::sync::CancellationToken::new();
    let runtime = stylequeue::worker::WorkerRuntime::new(
        "w1",
        stack.context(ScriptedProcessor::new(vec![]), fast_settings()),
        drain.clone(),
    );
    let phase = runtime.subscribe();
    let handle = tokio::spawn(runtime.run());

    let job_id = stack.submit_chat("What is chiaroscuro?").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(stack.registry.read(job_id).await.unwrap().state, Completed);

    drain.cancel();
    let exit = handle.await.unwrap();
    assert_eq!(exit, stylequeue::worker::WorkerExit::Drained);
    assert_eq!(*phase.borrow(), stylequeue::worker::WorkerPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_idle_worker_exits_when_configured() {
    let stack = TestStack::new();
    let settings = stylequeue::config::WorkerSettings {
        idle_exit: Some(Duration::from_secs(120)),
        ..fast_settings()
    };
    let runtime = stack.worker("w1", ScriptedProcessor::new(vec![]), settings);
    let exit = runtime.run().await;
    assert_eq!(exit, stylequeue::worker::WorkerExit::IdleTimeout);
}

#[tokio::test(start_paused = true)]
async fn test_controller_scales_from_zero_and_back() {
    let stack = TestStack::new();
    let processor = ScriptedProcessor::new(vec![
        Step::SucceedAfter(Duration::from_secs(5)),
        Step::SucceedAfter(Duration::from_secs(5)),
    ]);
    let pool = Arc::new(LocalPool::new(stack.context(processor.clone(), fast_settings())));
    let settings = ScalerSettings {
        max_replicas: 4,
        jobs_per_replica: 1,
        idle_grace: Duration::from_secs(120),
        ..ScalerSettings::default()
    };
    let mut controller = PoolController::new(stack.queue.clone(), pool.clone(), settings);

    // Nothing queued, nothing running: no replicas.
    assert_eq!(controller.tick().await.unwrap(), 0);
    assert_eq!(pool.replica_count().await.active, 0);

    let jobs = futures::future::join_all([
        stack.gateway.submit_chat(stylequeue::models::submission::ChatRequest {
            question: "first".to_string(),
        }),
        stack.gateway.submit_chat(stylequeue::models::submission::ChatRequest {
            question: "second".to_string(),
        }),
    ])
    .await;
    let jobs: Vec<JobId> = jobs.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(controller.tick().await.unwrap(), 2);
    assert_eq!(pool.replica_count().await.active, 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    for job_id in &jobs {
        assert_eq!(stack.registry.read(*job_id).await.unwrap().state, Completed);
    }

    // Queue empty: one replica stays warm through the grace period.
    assert_eq!(controller.tick().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_secs(121)).await;
    assert_eq!(controller.tick().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.replica_count().await.active, 0);
    pool.shutdown().await;
    assert_eq!(processor.calls(), 2);
}
