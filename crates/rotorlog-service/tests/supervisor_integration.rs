// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! End-to-end supervisor tests: configuration messages drive recorder lifecycles through a
//! channel-backed bus and a scripted stand-in for the segment writer.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rotorlog_service::{
    bag::BagMetadata,
    config::{TopicSelection, UpdatableConfig},
    diagnostics::DiagnosticsHandle,
    recorder::BagRecorder,
    supervisor::ConfigWatcher,
    test_utils::TestBus,
    upload_manager::UploadManager,
    uploader::{CompressionMode, UploadError, Uploader},
};
use rotorlog_test_utils::{fake_writer_script, wait_until, Result as TestResult};
use tokio_util::sync::CancellationToken;

/// Uploader that records which bags it was asked to upload and leaves the files alone.
#[derive(Debug, Default, Clone)]
struct RecordingUploader {
    uploads: Arc<Mutex<Vec<BagMetadata>>>,
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, bag: &BagMetadata) -> Result<(), UploadError> {
        self.uploads
            .lock()
            .expect("lock is not poisoned")
            .push(bag.clone());
        // Keep the files in place so the test can inspect them afterwards.
        Err(UploadError::Cancelled)
    }

    fn with_compression(&self, _mode: CompressionMode) -> Arc<dyn Uploader> {
        // The recorder ignores compression mode, so switching modes just hands back an
        // uploader sharing the same recorded uploads.
        Arc::new(self.clone())
    }
}

struct Harness {
    watcher_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    subscription_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    config_sender: tokio::sync::mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    uploader: Arc<RecordingUploader>,
    diagnostics: DiagnosticsHandle,
}

impl Harness {
    fn start(script: &Path, bags_dir: &Path, initial: UpdatableConfig) -> Self {
        let (bus, config_sender) = TestBus::new();
        let diagnostics = DiagnosticsHandle::default();
        let uploader = Arc::new(RecordingUploader::default());
        let cancel = CancellationToken::new();
        let upload_manager = UploadManager::new(
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            initial.max_upload_count,
            diagnostics.clone(),
            cancel.child_token(),
        );
        let recorder = BagRecorder::new(script.display().to_string(), bags_dir.to_path_buf());
        let mut watcher = ConfigWatcher::new(
            recorder,
            upload_manager,
            diagnostics.clone(),
            bus,
            Duration::from_millis(200),
            initial,
        );

        let subscription_task = tokio::spawn(watcher.config_subscription(cancel.child_token()));
        let watcher_cancel = cancel.child_token();
        let watcher_task = tokio::spawn(async move { watcher.run(watcher_cancel).await });
        Self {
            watcher_task,
            subscription_task,
            config_sender,
            cancel,
            uploader,
            diagnostics,
        }
    }

    async fn shutdown(self) -> TestResult {
        self.cancel.cancel();
        self.watcher_task.await??;
        self.subscription_task.await??;
        Ok(())
    }
}

fn read_log(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}

async fn wait_for_log_lines(path: &Path, count: usize) -> bool {
    wait_until(Duration::from_secs(10), || {
        let path = path.to_path_buf();
        async move { read_log(&path).len() >= count }
    })
    .await
}

#[tokio::test]
async fn configuration_messages_drive_recorder_phases() -> TestResult {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("invocations.log");
    // The stand-in writer logs its argument vector and start/stop markers, then waits to be
    // interrupted, exiting with the writer's conventional code 2.
    let script_body = format!(
        r#"
echo "start: $@" >> "{log}"
trap 'echo "stop" >> "{log}"; exit 2' INT TERM
while true; do sleep 0.05; done
"#,
        log = log.display()
    );
    let script = fake_writer_script(dir.path(), "writer.sh", &script_body)?;

    let harness = Harness::start(
        &script,
        &dir.path().join("bags"),
        UpdatableConfig {
            topics: TopicSelection::Explicit(vec!["/test/a".into()]),
            ..UpdatableConfig::default()
        },
    );

    // Phase 1: the initial configuration records /test/a.
    assert!(wait_for_log_lines(&log, 1).await);
    assert!(read_log(&log)[0].ends_with("-- /test/a"));

    // Phase 2: switching to all topics stops the current writer and starts a new one.
    harness.config_sender.send("topics: '*'".into())?;
    assert!(wait_for_log_lines(&log, 3).await);
    let lines = read_log(&log);
    assert_eq!(lines[1], "stop");
    assert!(lines[2].ends_with("--all"));

    // Phase 3: an empty topic selection stops recording entirely.
    harness.config_sender.send("topics:".into())?;
    assert!(wait_for_log_lines(&log, 4).await);
    let stopped = wait_until(Duration::from_secs(5), || {
        let diagnostics = harness.diagnostics.clone();
        async move {
            diagnostics
                .build_report("rotorlog")
                .values
                .iter()
                .any(|kv| kv.key == "recorder" && kv.value == "stopped")
        }
    })
    .await;
    assert!(stopped, "the recorder should report being stopped");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(read_log(&log).len(), 4, "no writer may start while stopped");

    // Phase 4: an explicit topic list starts recording again.
    harness.config_sender.send(r#"topics: ["/test/b"]"#.into())?;
    assert!(wait_for_log_lines(&log, 5).await);
    let lines = read_log(&log);
    assert!(lines[4].ends_with("-- /test/b"));

    // Writer lifecycles never overlap: starts and stops strictly alternate.
    for pair in lines.windows(2) {
        let both_starts = pair[0].starts_with("start") && pair[1].starts_with("start");
        assert!(!both_starts, "two writers were alive at once: {lines:?}");
    }

    harness.shutdown().await
}

#[tokio::test]
async fn invalid_configuration_is_dropped_and_reported() -> TestResult {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("invocations.log");
    let script_body = format!(
        r#"
echo "start: $@" >> "{log}"
trap 'exit 2' INT TERM
while true; do sleep 0.05; done
"#,
        log = log.display()
    );
    let script = fake_writer_script(dir.path(), "writer.sh", &script_body)?;

    let harness = Harness::start(
        &script,
        &dir.path().join("bags"),
        UpdatableConfig {
            topics: TopicSelection::Explicit(vec!["/test/a".into()]),
            ..UpdatableConfig::default()
        },
    );
    assert!(wait_for_log_lines(&log, 1).await);

    harness.config_sender.send("topics: alll".into())?;
    let reported = wait_until(Duration::from_secs(5), || {
        let diagnostics = harness.diagnostics.clone();
        async move {
            diagnostics
                .build_report("rotorlog")
                .values
                .iter()
                .any(|kv| kv.key == "config" && kv.value.contains("'topics' must be"))
        }
    })
    .await;
    assert!(reported, "the parse failure should reach diagnostics");
    // The running recorder is unaffected by the bad payload.
    assert_eq!(read_log(&log).len(), 1);

    harness.shutdown().await
}

#[tokio::test]
async fn failing_writer_is_retried() -> TestResult {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("invocations.log");
    let script_body = format!(
        "echo \"start: $@\" >> \"{log}\"\nexit 1\n",
        log = log.display()
    );
    let script = fake_writer_script(dir.path(), "writer.sh", &script_body)?;

    let harness = Harness::start(
        &script,
        &dir.path().join("bags"),
        UpdatableConfig {
            topics: TopicSelection::All,
            ..UpdatableConfig::default()
        },
    );

    // The retry timer re-runs the writer after each failure.
    assert!(wait_for_log_lines(&log, 3).await);
    harness.shutdown().await
}

#[tokio::test]
async fn finalized_segments_flow_into_the_upload_queue() -> TestResult {
    let dir = tempfile::tempdir()?;
    // This writer behaves like the real one: it creates the run directory and rolls segments.
    let script_body = r#"
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output" ]; then out="$2"; shift; fi
    shift
done
trap 'exit 2' INT TERM
mkdir -p "$out"
sleep 0.2
: > "$out/mission_0.db3"
sleep 0.2
: > "$out/mission_1.db3"
sleep 0.2
: > "$out/mission_2.db3"
while true; do sleep 0.05; done
"#;
    let script = fake_writer_script(dir.path(), "writer.sh", script_body)?;

    let harness = Harness::start(
        &script,
        &dir.path().join("bags"),
        UpdatableConfig {
            topics: TopicSelection::All,
            max_upload_count: 1,
            ..UpdatableConfig::default()
        },
    );

    let uploader = Arc::clone(&harness.uploader);
    let observed = wait_until(Duration::from_secs(10), || {
        let uploader = Arc::clone(&uploader);
        async move { uploader.uploads.lock().expect("lock is not poisoned").len() >= 2 }
    })
    .await;
    assert!(observed, "two finalized segments should reach the uploader");

    let uploads = uploader.uploads.lock().expect("lock is not poisoned").clone();
    assert!(uploads.iter().all(|bag| bag.is_new));
    let mut numbers: Vec<u64> = uploads.iter().map(|bag| bag.number).collect();
    numbers.sort_unstable();
    assert_eq!(&numbers[..2], &[0, 1]);

    harness.shutdown().await
}
