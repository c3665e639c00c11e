
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sisyphus_lite::matrix::BuildMatrixEntry;
use sisyphus_lite::scheduler::{
    AttemptEvent, AttemptOutcome, AttemptRunner, FailureKind, JobEvent, RunnerSettings,
};
use test_harness::{linux_host, matrix, pool, Rule, ScriptedConnector};

fn entry(artifacts: &str) -> Arc<BuildMatrixEntry> {
    let m = matrix(&format!(
        r#"
workspace: /tmp/sisyphus
platforms: [linux-x86_64]
cuda: ["12.4"]
steps:
  - name: build
    run: "build-{{package}}"
    artifacts: [{}]
  - name: test
    run: "test-{{package}}"
packages:
  - name: numpy
"#,
        artifacts
    ));
    m.entries()[0].clone()
}

fn settings(artifact_dir: Option<PathBuf>) -> RunnerSettings {
    RunnerSettings {
        step_timeout: Duration::from_secs(5),
        transfer_timeout: Duration::from_secs(5),
        artifact_dir,
    }
}

async fn run_attempt(
    connector: &ScriptedConnector,
    entry: Arc<BuildMatrixEntry>,
    settings: RunnerSettings,
    cancel: CancellationToken,
) -> Vec<AttemptEvent> {
    let pool = pool(vec![linux_host("gpu-1", 1)], connector);
    let lease = pool.try_acquire(&entry.required_tags).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
    let job_id = Uuid::new_v4();
    AttemptRunner {
        job_id,
        attempt: 1,
        entry,
        settings,
        events: tx,
        cancel,
    }
    .run(lease)
    .await;

    assert_eq!(pool.leased(), 0);
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.attempt, 1);
        events.push(event.event);
    }
    events
}

fn outcome(events: &[AttemptEvent]) -> &AttemptOutcome {
    match events.last() {
        Some(AttemptEvent::Finished(outcome)) => outcome,
        other => panic!("last event is not Finished: {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_attempt_event_order() {
    let connector = ScriptedConnector::new();
    connector
        .script()
        .add(Rule::on("build-numpy").stdout("compiling\nlinking"));

    let events = run_attempt(
        &connector,
        entry(r#""{workdir}/out/*.conda""#),
        settings(None),
        CancellationToken::new(),
    )
    .await;

    let names: Vec<&str> = events
        .iter()
        .map(|e| match e {
            AttemptEvent::Connected => "connected",
            AttemptEvent::StepStarted { .. } => "started",
            AttemptEvent::StepOutput { .. } => "output",
            AttemptEvent::StepCompleted { .. } => "completed",
            AttemptEvent::Finished(_) => "finished",
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "connected", "started", "output", "completed", "started", "output", "completed",
            "finished"
        ]
    );
    assert!(matches!(outcome(&events), AttemptOutcome::Succeeded));

    match &events[2] {
        AttemptEvent::StepOutput { output } => {
            assert_eq!(output.as_string(), "compiling\nlinking\n")
        }
        other => panic!("unexpected event {:?}", other),
    }
    match &events[3] {
        AttemptEvent::StepCompleted { index, artifacts } => {
            assert_eq!(*index, 0);
            assert_eq!(artifacts.len(), 1);
            assert_eq!(
                artifacts[0].remote_path,
                "/tmp/sisyphus/numpy/linux-x86_64-cuda12.4/out/pkg.conda"
            );
            assert!(artifacts[0].local_path.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_step_stops_the_attempt() {
    let connector = ScriptedConnector::new();
    connector
        .script()
        .add(Rule::on("build-numpy").exit(1).stderr("CMake Error"));

    let events = run_attempt(
        &connector,
        entry(""),
        settings(None),
        CancellationToken::new(),
    )
    .await;

    match outcome(&events) {
        AttemptOutcome::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::Execution);
            assert_eq!(failure.exit_code, Some(1));
            assert!(!failure.transient);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(connector.script().commands_matching("test-numpy"), 0);
}

#[tokio::test]
async fn test_workspace_reset_failure() {
    let connector = ScriptedConnector::new();
    connector
        .script()
        .add(Rule::on("rm -rf").exit(1).stderr("Permission denied"));

    let events = run_attempt(
        &connector,
        entry(""),
        settings(None),
        CancellationToken::new(),
    )
    .await;

    match outcome(&events) {
        AttemptOutcome::Failed(failure) => {
            assert!(failure.message.contains("failed to reset workspace"));
            assert!(failure.message.contains("Permission denied"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(connector.script().commands_matching("build-numpy"), 0);
}

#[tokio::test]
async fn test_artifacts_are_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let connector = ScriptedConnector::new();

    let events = run_attempt(
        &connector,
        entry(r#""{workdir}/out/*.conda""#),
        settings(Some(dir.path().to_path_buf())),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(outcome(&events), AttemptOutcome::Succeeded));
    let local = dir
        .path()
        .join("numpy_linux-x86_64_cuda-12.4")
        .join("pkg.conda");
    assert!(local.exists());
    let downloads = connector.script().downloads();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].1, local.display().to_string());
}

#[tokio::test]
async fn test_unwritable_artifact_dir_is_transfer_failure() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let connector = ScriptedConnector::new();

    let events = run_attempt(
        &connector,
        entry(r#""{workdir}/out/*.conda""#),
        settings(Some(file.path().to_path_buf())),
        CancellationToken::new(),
    )
    .await;

    match outcome(&events) {
        AttemptOutcome::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::Transfer);
            assert_eq!(failure.step.as_deref(), Some("build"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_attempt_reports_cancelled() {
    let connector = ScriptedConnector::new();
    connector
        .script()
        .add(Rule::on("build-numpy").delay(Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let events = tokio::time::timeout(
        Duration::from_secs(2),
        run_attempt(&connector, entry(""), settings(None), cancel),
    )
    .await
    .unwrap();

    match outcome(&events) {
        AttemptOutcome::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::Cancelled);
            assert!(!failure.transient);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
