// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Supervises one lifecycle of the external segment writer and reports finalized segments.

use std::{path::PathBuf, process::ExitStatus};

use chrono::{SecondsFormat, Utc};
use nix::{sys::signal, unistd::Pid};
use notify::{EventKind, RecursiveMode, Watcher as _};
use tokio::{process::Command, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::bag::BagMetadata;

/// Errors raised while supervising the segment writer.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// The destination directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying failure.
        source: std::io::Error,
    },

    /// The destination directory could not be resolved to an absolute path.
    #[error("failed to resolve directory {path}: {source}")]
    ResolveDir {
        /// The directory that could not be resolved.
        path: PathBuf,
        /// The underlying failure.
        source: std::io::Error,
    },

    /// The filesystem watcher could not be started.
    #[error("failed to start file watching: {0}")]
    Watch(#[from] notify::Error),

    /// The writer process could not be spawned.
    #[error("failed to start the segment writer: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the writer process failed.
    #[error("an error occurred while supervising the segment writer: {0}")]
    Wait(#[source] std::io::Error),

    /// The writer could not be stopped gracefully.
    #[error("failed to stop the segment writer gracefully: {0}")]
    Interrupt(#[source] nix::Error),

    /// The writer exited with a failure status.
    #[error("the segment writer exited with {0}")]
    Recording(ExitStatus),
}

/// Drives `ros2 bag record` (or a compatible writer) and watches its output directory.
///
/// Segment completion is detected through filesystem events rather than by parsing writer
/// output: the writer creates `<prefix>_<N>.db3` the moment it rolls over, at which point
/// segment `N - 1` is final.
#[derive(Debug)]
pub struct BagRecorder {
    /// Command used to spawn the writer.
    pub ros_command: String,
    /// Topics to record; an empty list records everything (`--all`).
    pub topics: Vec<String>,
    /// Size in bytes at which the writer rolls segments; non-positive disables splitting.
    pub size_threshold: i64,
    /// Extra arguments appended verbatim to the writer command line.
    pub extra_args: Vec<String>,
    /// Root directory under which per-run directories are created.
    pub dir: PathBuf,

    /// The per-run output directory of the current (or last) run.
    current_dir: PathBuf,
}

impl BagRecorder {
    /// Creates a recorder writing below `dir`.
    pub fn new(ros_command: String, dir: PathBuf) -> Self {
        Self {
            ros_command,
            topics: Vec::new(),
            size_threshold: 0,
            extra_args: Vec::new(),
            dir,
            current_dir: PathBuf::new(),
        }
    }

    /// Runs one writer lifecycle until the writer exits or `cancel` fires.
    ///
    /// `on_bag_ready` is invoked once, in segment order, for every segment that the writer has
    /// finalized. Returns `Ok(())` when the writer exits cleanly or is cancelled; writer
    /// failures and setup failures are returned as errors and the caller decides whether to
    /// retry.
    pub async fn start<F>(
        &mut self,
        cancel: CancellationToken,
        on_bag_ready: F,
    ) -> Result<(), RecorderError>
    where
        F: Fn(BagMetadata) + Send + Sync + 'static,
    {
        std::fs::create_dir_all(&self.dir).map_err(|source| RecorderError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        // Canonicalize so that paths reported by the watcher compare equal to ours.
        let root = std::fs::canonicalize(&self.dir).map_err(|source| RecorderError::ResolveDir {
            path: self.dir.clone(),
            source,
        })?;
        // A fresh per-run directory isolates this run's segments: create events in it cannot be
        // confused with segments of an earlier run.
        self.current_dir = root.join(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true));

        let watch_cancel = cancel.child_token();
        let watch_task = self.start_watcher(root, watch_cancel.clone(), on_bag_ready)?;

        let result = self.supervise_writer(&cancel).await;

        watch_cancel.cancel();
        let _ = watch_task.await;
        result
    }

    async fn supervise_writer(&self, cancel: &CancellationToken) -> Result<(), RecorderError> {
        let mut child = self.command().spawn().map_err(RecorderError::Spawn)?;
        tracing::info!(
            command = %self.ros_command,
            output = %self.current_dir.display(),
            "started the segment writer",
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(RecorderError::Wait)?;
                // The writer exits with code 2 after finalizing its output on an interrupt;
                // that is a graceful stop, not a failure.
                if status.success() || status.code() == Some(2) {
                    Ok(())
                } else {
                    Err(RecorderError::Recording(status))
                }
            }
            _ = cancel.cancelled() => self.stop_writer(&mut child).await,
        }
    }

    /// Asks the writer to finalize and exit; escalates to a kill when the interrupt cannot be
    /// delivered.
    async fn stop_writer(
        &self,
        child: &mut tokio::process::Child,
    ) -> Result<(), RecorderError> {
        let Some(pid) = child.id() else {
            // The writer exited in the meantime; reap it.
            let _ = child.wait().await;
            return Ok(());
        };
        tracing::debug!(pid, "interrupting the segment writer");
        if let Err(errno) = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGINT) {
            tracing::warn!(%errno, "failed to interrupt the segment writer, killing it");
            child.start_kill().map_err(RecorderError::Wait)?;
            let _ = child.wait().await;
            return Err(RecorderError::Interrupt(errno));
        }
        child.wait().await.map_err(RecorderError::Wait)?;
        Ok(())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.ros_command);
        command.args(["bag", "record", "--output"]).arg(&self.current_dir);
        if self.size_threshold > 0 {
            command.args(["--max-bag-size", &self.size_threshold.to_string()]);
        }
        command.args(&self.extra_args);
        if self.topics.is_empty() {
            command.arg("--all");
        } else {
            command.arg("--");
            command.args(&self.topics);
        }
        command
    }

    /// Starts the two-phase filesystem watch.
    ///
    /// The run directory does not exist until the writer creates it, so the watch begins on its
    /// parent; once the run directory appears, the watch moves inside it and segment-creation
    /// events drive `on_bag_ready`.
    fn start_watcher<F>(
        &self,
        parent: PathBuf,
        cancel: CancellationToken,
        on_bag_ready: F,
    ) -> Result<JoinHandle<()>, RecorderError>
    where
        F: Fn(BagMetadata) + Send + Sync + 'static,
    {
        let current_dir = self.current_dir.clone();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = sender.send(event);
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        Ok(tokio::spawn(async move {
            // The watcher must live as long as this task; dropping it closes the event stream.
            let mut watching_output = false;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        tracing::warn!(%error, "an error occurred during file watching");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_)) {
                    continue;
                }
                for path in &event.paths {
                    if watching_output {
                        notify_if_bag_ready(&on_bag_ready, path);
                    } else if *path == current_dir {
                        if let Err(error) = watcher.unwatch(&parent) {
                            tracing::warn!(%error, "failed to unwatch the parent directory");
                        }
                        if let Err(error) =
                            watcher.watch(&current_dir, RecursiveMode::NonRecursive)
                        {
                            tracing::warn!(%error, "failed to watch the run directory");
                        }
                        watching_output = true;
                    }
                }
            }
        }))
    }
}

/// Reports the segment that became ready, if any, given a path that was just created.
///
/// The created file is segment `N`, which the writer has just opened and is still empty;
/// segment `N - 1` is the one that is now complete. The creation of segment 0 therefore
/// completes nothing.
fn notify_if_bag_ready<F>(on_bag_ready: &F, path: &std::path::Path)
where
    F: Fn(BagMetadata),
{
    if let Some(bag) = BagMetadata::from_path(path, -1, true) {
        on_bag_ready(bag);
    }
}
