// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The configuration watcher: top-level orchestrator of the recording pipeline.
//!
//! One watcher owns the recorder and the upload manager. Configuration messages cancel the
//! running recorder and replace the pending configuration (last writer wins); the main loop
//! then applies the configuration and starts a fresh recorder under a new child token. A
//! failed recorder is retried after a delay, and the retry is abandoned as soon as a newer
//! configuration arrives.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt as _;
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::MessageBus,
    config::{TopicSelection, UpdatableConfig},
    diagnostics::DiagnosticsHandle,
    recorder::BagRecorder,
    upload_manager::UploadManager,
};

/// Watches the configuration topic and runs one recorder at a time.
#[derive(Debug)]
pub struct ConfigWatcher {
    recorder: BagRecorder,
    upload_manager: UploadManager,
    diagnostics: DiagnosticsHandle,
    bus: Arc<dyn MessageBus>,
    /// Delay before restarting a recorder that stopped with an error.
    pub retry_delay: Duration,

    /// Single-slot "latest pending configuration"; senders always replace.
    next_config: Arc<watch::Sender<Option<UpdatableConfig>>>,
    /// Receiver side, taken by [`ConfigWatcher::run`].
    next_config_rx: Option<watch::Receiver<Option<UpdatableConfig>>>,
    /// Cancel handle of the currently running recorder.
    stop_recorder: Arc<Mutex<Option<CancellationToken>>>,
}

impl ConfigWatcher {
    /// Creates a watcher that will start from `initial` and then follow the configuration
    /// topic.
    pub fn new(
        recorder: BagRecorder,
        upload_manager: UploadManager,
        diagnostics: DiagnosticsHandle,
        bus: Arc<dyn MessageBus>,
        retry_delay: Duration,
        initial: UpdatableConfig,
    ) -> Self {
        let (next_config, next_config_rx) = watch::channel(None);
        next_config.send_replace(Some(initial));
        Self {
            recorder,
            upload_manager,
            diagnostics,
            bus,
            retry_delay,
            next_config: Arc::new(next_config),
            next_config_rx: Some(next_config_rx),
            stop_recorder: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the future consuming the configuration topic.
    ///
    /// It runs as its own task so that configuration messages are handled while the main loop
    /// is blocked inside a recorder run: a new message cancels the current recorder *before*
    /// queueing the configuration, which is what guarantees that recorder runs never overlap.
    pub fn config_subscription(
        &self,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static {
        let bus = Arc::clone(&self.bus);
        let next_config = Arc::clone(&self.next_config);
        let stop_recorder = Arc::clone(&self.stop_recorder);
        let diagnostics = self.diagnostics.clone();

        async move {
            let mut updates = bus.config_updates().await?;
            loop {
                let payload = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    payload = updates.next() => match payload {
                        Some(payload) => payload,
                        None => anyhow::bail!("the configuration stream closed unexpectedly"),
                    },
                };
                match UpdatableConfig::parse_yaml(&payload) {
                    Ok(config) => {
                        tracing::info!(config = %payload.trim(), "received new configuration");
                        if let Some(token) =
                            stop_recorder.lock().expect("lock is not poisoned").as_ref()
                        {
                            token.cancel();
                        }
                        next_config.send_replace(Some(config));
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to parse configuration");
                        diagnostics.report_error("config", &error);
                    }
                }
            }
        }
    }

    /// Main loop: reacts to cancellation, the retry timer, and new configurations.
    pub async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        tracing::info!("starting the recording supervisor");
        let mut next_config = self
            .next_config_rx
            .take()
            .expect("the supervisor loop runs only once");

        let retry_timer = sleep(self.retry_delay);
        tokio::pin!(retry_timer);
        let mut retry_armed = false;
        let mut current_config: Option<UpdatableConfig> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = &mut retry_timer, if retry_armed => {
                    retry_armed = false;
                    if let Some(config) = current_config.clone() {
                        if self.start_recorder(&cancel, &config).await.is_err() {
                            retry_timer.as_mut().reset(Instant::now() + self.retry_delay);
                            retry_armed = true;
                        }
                    }
                }
                changed = next_config.changed() => {
                    anyhow::ensure!(changed.is_ok(), "the configuration channel closed");
                    // A newer configuration supersedes any pending retry.
                    retry_armed = false;
                    let Some(config) = next_config.borrow_and_update().clone() else {
                        continue;
                    };
                    current_config = Some(config.clone());
                    if self.start_recorder(&cancel, &config).await.is_err() {
                        retry_timer.as_mut().reset(Instant::now() + self.retry_delay);
                        retry_armed = true;
                    }
                }
            }
        }
    }

    /// Applies `config` and, when it selects any topics, runs one recorder lifecycle.
    ///
    /// Blocks until the recorder exits; a configuration message or shutdown ends the run by
    /// cancelling the child token allocated here. An `Err` return means the caller should
    /// schedule a retry.
    async fn start_recorder(
        &mut self,
        cancel: &CancellationToken,
        config: &UpdatableConfig,
    ) -> Result<(), crate::recorder::RecorderError> {
        let run = self.apply_config(config);
        let run_token = {
            let token = cancel.child_token();
            let mut stop_recorder = self.stop_recorder.lock().expect("lock is not poisoned");
            *stop_recorder = Some(token.clone());
            token
        };
        self.upload_manager.spawn_worker(&run_token);
        if !run {
            self.diagnostics.report_success("recorder", "stopped");
            return Ok(());
        }

        self.diagnostics.report_success("recorder", "running");
        let manager = self.upload_manager.clone();
        let worker_token = run_token.clone();
        let result = self
            .recorder
            .start(run_token, move |bag| manager.add_bag(bag, &worker_token))
            .await;
        match result {
            Ok(()) => {
                self.diagnostics.report_success("recorder", "stopped");
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    retry_in = ?self.retry_delay,
                    "recorder stopped with an error, trying again",
                );
                self.diagnostics
                    .report_error("recorder", format!("failed: {error}"));
                Err(error)
            }
        }
    }

    /// Pushes `config` into the upload manager and the recorder; returns whether the recorder
    /// should run.
    fn apply_config(&mut self, config: &UpdatableConfig) -> bool {
        self.upload_manager
            .set_config(config.max_upload_count, config.compression_mode);
        self.recorder.size_threshold = config.size_threshold;
        self.recorder.extra_args = config.extra_args.clone();
        let run = match &config.topics {
            TopicSelection::All => {
                self.recorder.topics = Vec::new();
                true
            }
            TopicSelection::Explicit(topics) => {
                self.recorder.topics = topics.clone();
                !topics.is_empty()
            }
            TopicSelection::None => {
                self.recorder.topics = Vec::new();
                false
            }
        };
        self.diagnostics.report_success("config", "applied");
        run
    }
}
