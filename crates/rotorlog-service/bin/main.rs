// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Rotorlog recording supervisor entry point.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use rotorlog_service::{
    bus::{zenoh::ZenohBus, MessageBus},
    config::{KeyAlgorithm, NodeConfig, TopicSelection},
    diagnostics::{DiagnosticsHandle, DiagnosticsMonitor},
    recorder::BagRecorder,
    supervisor::ConfigWatcher,
    upload_manager::UploadManager,
    uploader::{BagUploader, CompressionMode},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Node name reported on the diagnostics topic.
const NODE_NAME: &str = "rotorlog";

#[derive(Parser, Debug)]
#[clap(name = env!("CARGO_BIN_NAME"), version)]
#[clap(rename_all = "kebab-case")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Run the recording supervisor.
    Run(NodeArgs),

    /// Load and validate the merged configuration and signing key, then exit.
    Check(NodeArgs),
}

/// Flag overrides; every flag beats the corresponding configuration-file and environment
/// values.
#[derive(Debug, Clone, clap::Args)]
#[clap(rename_all = "kebab-case")]
struct NodeArgs {
    /// Path to the node configuration file.
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// The provisioned device id (required unless configured elsewhere).
    #[clap(long)]
    device_id: Option<String>,
    /// The tenant the device belongs to.
    #[clap(long)]
    tenant_id: Option<String>,
    /// URL of the backend issuing signed upload URLs.
    #[clap(long)]
    backend_url: Option<String>,
    /// The private key used for authentication.
    #[clap(long)]
    private_key: Option<PathBuf>,
    /// Signing algorithm of the private key; RS256 or ES256.
    #[clap(long)]
    key_algorithm: Option<KeyAlgorithm>,
    /// Comma-separated topics to record; "*" records everything, empty records nothing.
    #[clap(long)]
    topics: Option<String>,
    /// Directory where recordings are stored.
    #[clap(long)]
    dest_dir: Option<PathBuf>,
    /// Bags are split when they reach this size in bytes.
    #[clap(long)]
    size_threshold: Option<i64>,
    /// Comma-separated extra arguments appended to the writer command.
    #[clap(long)]
    extra_args: Option<String>,
    /// Maximum number of concurrent uploads.
    #[clap(long)]
    max_upload_count: Option<usize>,
    /// Compression applied to uploaded bags; none, gzip or xz.
    #[clap(long)]
    compression_mode: Option<CompressionMode>,
    /// Command used to spawn the segment writer.
    #[clap(long)]
    ros_command: Option<String>,
    /// Optional zenoh configuration file for the bus session.
    #[clap(long)]
    zenoh_config: Option<PathBuf>,
}

impl NodeArgs {
    fn into_config(self) -> anyhow::Result<(NodeConfig, Option<PathBuf>)> {
        let mut config = NodeConfig::load(self.config_path.as_deref())?;
        config.apply_env()?;

        if let Some(device_id) = self.device_id {
            config.device_id = device_id;
        }
        if let Some(tenant_id) = self.tenant_id {
            config.tenant_id = tenant_id;
        }
        if let Some(backend_url) = self.backend_url {
            config.backend_url = backend_url;
        }
        if let Some(private_key) = self.private_key {
            config.private_key = private_key;
        }
        if let Some(key_algorithm) = self.key_algorithm {
            config.key_algorithm = key_algorithm;
        }
        if let Some(topics) = self.topics.as_deref() {
            config.initial.topics = TopicSelection::parse_flag(topics);
        }
        if let Some(dest_dir) = self.dest_dir {
            config.dest_dir = dest_dir;
        }
        if let Some(size_threshold) = self.size_threshold {
            config.initial.size_threshold = size_threshold;
        }
        if let Some(extra_args) = self.extra_args.as_deref() {
            config.initial.extra_args = rotorlog_service::config::parse_comma_separated(extra_args);
        }
        if let Some(max_upload_count) = self.max_upload_count {
            config.initial.max_upload_count = max_upload_count;
        }
        if let Some(compression_mode) = self.compression_mode {
            config.initial.compression_mode = compression_mode;
        }
        if let Some(ros_command) = self.ros_command {
            config.ros_command = ros_command;
        }

        config.validate()?;
        Ok((config, self.zenoh_config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(node_args) => {
            let (config, zenoh_config) = node_args.into_config()?;
            commands::run(config, zenoh_config).await
        }
        Commands::Check(node_args) => {
            let (config, _) = node_args.into_config()?;
            commands::check(config)
        }
    }
}

mod commands {
    use super::*;

    pub(super) fn check(config: NodeConfig) -> anyhow::Result<()> {
        config
            .key_algorithm
            .load_key(&config.private_key)
            .context("the signing key does not load")?;
        println!(
            "configuration OK: device '{}' uploading to '{}' from '{}'",
            config.device_id,
            config.backend_url,
            config.dest_dir.display(),
        );
        Ok(())
    }

    pub(super) async fn run(
        config: NodeConfig,
        zenoh_config: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting rotorlog");

        let signing_key = config.key_algorithm.load_key(&config.private_key)?;
        let uploader = BagUploader::new(
            config.device_id.clone(),
            config.tenant_id.clone(),
            config.backend_url.clone(),
            signing_key,
            config.key_algorithm,
            config.token_lifetime,
            config.initial.compression_mode,
        );

        let bus: Arc<dyn MessageBus> = Arc::new(
            ZenohBus::connect(config.namespace(), zenoh_config.as_deref()).await?,
        );

        let cancel_token = CancellationToken::new();
        let diagnostics = DiagnosticsHandle::default();
        let upload_manager = UploadManager::new(
            Arc::new(uploader),
            config.initial.max_upload_count,
            diagnostics.clone(),
            cancel_token.child_token(),
        );
        let backlog = upload_manager.load_existing(&config.dest_dir);
        if backlog > 0 {
            tracing::info!(backlog, "queued existing bags for upload");
        }
        upload_manager.start_all_workers(&cancel_token.child_token());

        let recorder = BagRecorder::new(config.ros_command.clone(), config.dest_dir.clone());
        let monitor =
            DiagnosticsMonitor::new(NODE_NAME.to_owned(), diagnostics.clone(), Arc::clone(&bus));
        let mut watcher = ConfigWatcher::new(
            recorder,
            upload_manager.clone(),
            diagnostics,
            Arc::clone(&bus),
            config.retry_delay,
            config.initial.clone(),
        );

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        tasks.spawn(watcher.config_subscription(cancel_token.child_token()));
        tasks.spawn(monitor.run(cancel_token.child_token()));
        let watcher_token = cancel_token.child_token();
        tasks.spawn(async move { watcher.run(watcher_token).await });

        let mut first_error = None;
        tokio::select! {
            biased;
            _ = wait_for_shutdown_signal() => {}
            result = tasks.join_next() => {
                record_task_result(result, &mut first_error);
            }
        }

        cancel_token.cancel();
        while let Some(result) = tasks.join_next().await {
            record_task_result(Some(result), &mut first_error);
        }
        tracing::info!("waiting for in-flight uploads to finish");
        upload_manager.wait().await;

        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn record_task_result(
        result: Option<Result<anyhow::Result<()>, tokio::task::JoinError>>,
        first_error: &mut Option<anyhow::Error>,
    ) {
        let error = match result {
            None | Some(Ok(Ok(()))) => return,
            Some(Ok(Err(error))) => error,
            Some(Err(join_error)) if join_error.is_cancelled() => return,
            Some(Err(join_error)) => anyhow::anyhow!(join_error),
        };
        tracing::error!(%error, "a subsystem exited with an error");
        first_error.get_or_insert(error);
    }
}

/// Wait for SIGINT and SIGTERM (unix only).
async fn wait_for_shutdown_signal() {
    #[cfg(not(unix))]
    async fn wait_for_other_signals() {
        // Disables this branch in the select statement.
        std::future::pending().await
    }

    #[cfg(unix)]
    async fn wait_for_other_signals() {
        use tokio::signal::unix;

        unix::signal(unix::SignalKind::terminate())
            .expect("unable to register for SIGTERM signals")
            .recv()
            .await;
        tracing::info!("received SIGTERM");
    }

    tokio::select! {
        _ = wait_for_other_signals() => (),
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
    }
}
