//! Executor tests against a fake engine.
//!
//! The engine is `sh -c <script> sh`, so the render flags land in the
//! script's positional parameters: `$4` is the source file and `$5` the scene.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use mrender_models::{FailureReason, JobId, JobState, JobStatus, RenderEvent};
use mrender_storage::{ArtifactStore, StorageError};
use mrender_worker::{JobExecutor, JobHandle, SuccessPolicy, WorkerConfig, WorkerError};

const RENDER_OK: &str = r#"
echo "Manim Community v0.18.0"
echo "Rendering $5 from $4"
mkdir -p media/videos
printf 'fake mp4' > "media/videos/$5.mp4"
echo "File ready at  media/videos/$5.mp4"
"#;

fn fake_engine(dir: &TempDir, script: &str) -> WorkerConfig {
    WorkerConfig {
        artifacts_dir: dir.path().join("artifacts"),
        engine_program: "sh".to_string(),
        engine_args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        terminate_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

async fn collect(handle: &mut JobHandle) -> Vec<RenderEvent> {
    tokio::time::timeout(Duration::from_secs(20), async {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    })
    .await
    .expect("job stream did not finish")
}

fn log_lines(events: &[RenderEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            RenderEvent::Log { line } => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_successful_render_streams_then_records() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(fake_engine(&dir, RENDER_OK))
        .await
        .unwrap();

    let mut handle = executor.submit("MyScene", "from manim import *").await.unwrap();
    let events = collect(&mut handle).await;

    let lines = log_lines(&events);
    assert_eq!(lines[0], "Manim Community v0.18.0");
    assert!(lines[1].starts_with("Rendering MyScene from "));
    assert!(lines[1].ends_with("input.py"));
    assert_eq!(lines.len(), 3);

    let workspace = executor.workspaces().workspace_path(&handle.job_id);
    let expected = workspace.join("media/videos/MyScene.mp4");
    match events.last().unwrap() {
        RenderEvent::Succeeded {
            job_id,
            download_path,
            artifact_path,
        } => {
            assert_eq!(*job_id, handle.job_id);
            assert_eq!(download_path, &format!("/download/{}", handle.job_id));
            assert_eq!(Path::new(artifact_path), expected);
        }
        other => panic!("expected success, got {:?}", other),
    }

    assert_eq!(
        executor.artifacts().lookup(&handle.job_id).await.unwrap(),
        expected
    );
    assert_eq!(
        std::fs::read_to_string(workspace.join("input.py")).unwrap(),
        "from manim import *"
    );

    let outcome = handle.completion.await.unwrap();
    assert_eq!(outcome.state, JobState::Succeeded);
    assert_eq!(outcome.exit_code, Some(0));

    let status = executor.status(&handle.job_id).await.unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.lines_streamed, 3);
}

#[tokio::test]
async fn test_render_without_marker_fails_and_records_nothing() {
    let dir = TempDir::new().unwrap();
    let script = r#"
echo "Traceback (most recent call last):" >&2
echo "NameError: name 'Circl' is not defined" >&2
exit 1
"#;
    let executor = JobExecutor::from_config(fake_engine(&dir, script))
        .await
        .unwrap();

    let mut handle = executor.submit("Broken", "Circl()").await.unwrap();
    let events = collect(&mut handle).await;

    assert_eq!(
        log_lines(&events),
        vec![
            "Traceback (most recent call last):",
            "NameError: name 'Circl' is not defined"
        ]
    );
    assert_eq!(
        events.last().unwrap(),
        &RenderEvent::failed(handle.job_id, FailureReason::NoArtifact, Some(1))
    );
    assert_eq!(
        events.last().unwrap().to_sentinel_text(),
        "\n::error:: Rendering failed\n"
    );

    let err = executor.artifacts().lookup(&handle.job_id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn test_exit_code_policy() {
    let script = r#"
echo "File ready at  /tmp/elsewhere/$5.mp4"
exit 2
"#;

    let dir = TempDir::new().unwrap();
    let lenient = JobExecutor::from_config(fake_engine(&dir, script)).await.unwrap();
    let mut handle = lenient.submit("MyScene", "code").await.unwrap();
    let events = collect(&mut handle).await;
    assert!(matches!(events.last(), Some(RenderEvent::Succeeded { .. })));

    let dir = TempDir::new().unwrap();
    let strict = JobExecutor::from_config(WorkerConfig {
        success_policy: SuccessPolicy::MarkerAndZeroExit,
        ..fake_engine(&dir, script)
    })
    .await
    .unwrap();
    let mut handle = strict.submit("MyScene", "code").await.unwrap();
    let events = collect(&mut handle).await;
    assert_eq!(
        events.last().unwrap(),
        &RenderEvent::failed(handle.job_id, FailureReason::NonZeroExit, Some(2))
    );
    assert!(strict.artifacts().lookup(&handle.job_id).await.is_err());
}

#[tokio::test]
async fn test_concurrent_jobs_do_not_mix_output() {
    let script = r#"
i=0
while [ $i -lt 20 ]; do
  echo "$5 line $i"
  i=$((i + 1))
done
echo "File ready at  media/$5.mp4"
"#;
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(fake_engine(&dir, script))
        .await
        .unwrap();

    let mut first = executor.submit("SceneA", "a").await.unwrap();
    let mut second = executor.submit("SceneB", "b").await.unwrap();
    assert_ne!(first.job_id, second.job_id);

    let (events_a, events_b) = tokio::join!(collect(&mut first), collect(&mut second));

    for (events, scene) in [(&events_a, "SceneA"), (&events_b, "SceneB")] {
        let lines = log_lines(events);
        assert_eq!(lines.len(), 20);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("{} line {}", scene, i));
        }
        assert!(matches!(events.last(), Some(RenderEvent::Succeeded { .. })));
    }
}

#[tokio::test]
async fn test_full_pool_rejects_with_busy() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        max_concurrent_jobs: 1,
        max_queued_jobs: 0,
        ..fake_engine(&dir, "echo started; exec sleep 30")
    })
    .await
    .unwrap();

    let mut running = executor.submit("Slow", "code").await.unwrap();
    let err = executor.submit("Rejected", "code").await.err().unwrap();
    assert!(matches!(err, WorkerError::Busy { limit: 1 }));
    assert!(err.is_retryable());

    executor.cancel(&running.job_id).await.unwrap();
    let events = collect(&mut running).await;
    assert_eq!(
        events.last().map(|e| matches!(
            e,
            RenderEvent::Failed {
                reason: FailureReason::Cancelled,
                ..
            }
        )),
        Some(true)
    );
    running.completion.await.unwrap();

    assert_eq!(executor.in_flight(), 0);
    assert!(executor.submit("Accepted", "code").await.is_ok());
}

#[tokio::test]
async fn test_cancel_stops_the_engine() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(fake_engine(&dir, "echo started; exec sleep 30"))
        .await
        .unwrap();

    let mut handle = executor.submit("Slow", "code").await.unwrap();
    match handle.events.recv().await {
        Some(RenderEvent::Log { line }) => assert_eq!(line, "started"),
        other => panic!("expected first log line, got {:?}", other),
    }

    let started = std::time::Instant::now();
    executor.cancel(&handle.job_id).await.unwrap();
    let outcome = handle.completion.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert_eq!(
        executor.status(&handle.job_id).await.unwrap().state,
        JobState::Failed
    );
    assert!(matches!(
        executor.cancel(&handle.job_id).await,
        Err(WorkerError::JobNotActive(_))
    ));
}

#[tokio::test]
async fn test_render_timeout() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        render_timeout: Some(Duration::from_millis(300)),
        ..fake_engine(&dir, "exec sleep 30")
    })
    .await
    .unwrap();

    let mut handle = executor.submit("Slow", "code").await.unwrap();
    let events = collect(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(RenderEvent::Failed {
            reason: FailureReason::TimedOut,
            ..
        })
    ));
}

#[tokio::test]
async fn test_missing_engine_fails_at_submit() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        artifacts_dir: dir.path().to_path_buf(),
        engine_program: "mrender-no-such-engine".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();

    let err = executor.submit("MyScene", "code").await.err().unwrap();
    assert!(matches!(err, WorkerError::Engine(_)));
    assert_eq!(executor.in_flight(), 0);
}

#[tokio::test]
async fn test_render_continues_after_caller_disconnects() {
    let dir = TempDir::new().unwrap();
    let script = format!("sleep 0.2\n{}", RENDER_OK);
    let executor = JobExecutor::from_config(fake_engine(&dir, &script))
        .await
        .unwrap();

    let handle = executor.submit("MyScene", "code").await.unwrap();
    let job_id = handle.job_id;
    drop(handle.events);

    let outcome = handle.completion.await.unwrap();
    assert_eq!(outcome.state, JobState::Succeeded);
    assert!(executor.artifacts().lookup(&job_id).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_cancels_and_refuses_new_jobs() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(fake_engine(&dir, "exec sleep 30"))
        .await
        .unwrap();

    let handle = executor.submit("Slow", "code").await.unwrap();
    executor.shutdown().await;

    let outcome = handle.completion.await.unwrap();
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert!(matches!(
        executor.submit("Late", "code").await,
        Err(WorkerError::ShuttingDown)
    ));
}

const CHATTY_THEN_STALL: &str = r#"
i=0
while [ $i -lt 50 ]; do
  echo "line $i"
  i=$((i + 1))
done
exec sleep 30
"#;

/// Wait until the job is decided and no longer holds a pool slot.
async fn wait_until_settled(executor: &JobExecutor, job_id: &JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(status) = executor.status(job_id).await {
                if status.is_terminal() && executor.in_flight() == 0 {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job did not settle")
}

#[tokio::test]
async fn test_timeout_fires_while_caller_is_not_reading() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        event_buffer: 1,
        render_timeout: Some(Duration::from_secs(1)),
        ..fake_engine(&dir, CHATTY_THEN_STALL)
    })
    .await
    .unwrap();

    let mut handle = executor.submit("Chatty", "code").await.unwrap();

    // The stream is left unread until the job has been decided.
    let status = wait_until_settled(&executor, &handle.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure, Some(FailureReason::TimedOut));

    let events = collect(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(RenderEvent::Failed {
            reason: FailureReason::TimedOut,
            ..
        })
    ));
    let outcome = handle.completion.await.unwrap();
    assert_eq!(outcome.failure, Some(FailureReason::TimedOut));
}

#[tokio::test]
async fn test_cancel_reaches_a_job_whose_caller_is_not_reading() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        event_buffer: 1,
        ..fake_engine(&dir, CHATTY_THEN_STALL)
    })
    .await
    .unwrap();

    let mut handle = executor.submit("Chatty", "code").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    executor.cancel(&handle.job_id).await.unwrap();
    let status = wait_until_settled(&executor, &handle.job_id).await;
    assert_eq!(status.failure, Some(FailureReason::Cancelled));

    let events = collect(&mut handle).await;
    assert!(matches!(
        events.last(),
        Some(RenderEvent::Failed {
            reason: FailureReason::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_abandoned_queued_submission_is_not_left_pending() {
    let dir = TempDir::new().unwrap();
    let executor = JobExecutor::from_config(WorkerConfig {
        max_concurrent_jobs: 1,
        max_queued_jobs: 1,
        ..fake_engine(&dir, "echo started; exec sleep 30")
    })
    .await
    .unwrap();

    let mut running = executor.submit("Slow", "code").await.unwrap();

    // The second submit waits for the only slot; dropping it models a client
    // that disconnects while queued.
    let queued =
        tokio::time::timeout(Duration::from_millis(300), executor.submit("Queued", "code")).await;
    assert!(queued.is_err());
    assert_eq!(executor.in_flight(), 1);

    let abandoned: Vec<JobId> = std::fs::read_dir(executor.workspaces().root())
        .unwrap()
        .filter_map(|entry| JobId::parse(&entry.ok()?.file_name().to_string_lossy()))
        .filter(|id| *id != running.job_id)
        .collect();
    assert_eq!(abandoned.len(), 1);
    let abandoned = abandoned[0];

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = executor.status(&abandoned).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("abandoned job stayed pending");
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failure, Some(FailureReason::Cancelled));

    executor.cancel(&running.job_id).await.unwrap();
    collect(&mut running).await;
    running.completion.await.unwrap();
    assert_eq!(executor.in_flight(), 0);
}
