// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Zenoh-backed message bus.

use std::{path::Path, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt as _};
use zenoh::Session;

use crate::{bus::MessageBus, diagnostics::StatusReport};

/// How long to wait for a retained configuration value when subscribing.
const RETAINED_CONFIG_TIMEOUT: Duration = Duration::from_secs(2);

/// A [`MessageBus`] over a zenoh session.
///
/// Configuration payloads are consumed from `<namespace>/config`; the aggregated status is
/// published as JSON on `<namespace>/diagnostics`.
#[derive(Debug)]
pub struct ZenohBus {
    session: Session,
    namespace: String,
}

impl ZenohBus {
    /// Opens a session, optionally from a zenoh configuration file.
    pub async fn connect(namespace: String, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => zenoh::Config::from_file(path)
                .map_err(|error| anyhow::anyhow!(error))
                .with_context(|| {
                    format!("unable to load zenoh configuration from {}", path.display())
                })?,
            None => zenoh::Config::default(),
        };
        let session = zenoh::open(config)
            .await
            .map_err(|error| anyhow::anyhow!(error))
            .context("unable to open a zenoh session")?;
        tracing::info!(namespace, "connected to the zenoh bus");
        Ok(Self { session, namespace })
    }

    fn config_key(&self) -> String {
        format!("{}/config", self.namespace)
    }

    /// Best-effort fetch of the retained configuration, standing in for transient-local
    /// delivery: a storage answering the query hands late joiners the last published value.
    async fn retained_config(&self) -> Option<String> {
        let replies = match self
            .session
            .get(self.config_key())
            .timeout(RETAINED_CONFIG_TIMEOUT)
            .await
        {
            Ok(replies) => replies,
            Err(error) => {
                tracing::debug!(%error, "query for the retained configuration failed");
                return None;
            }
        };
        let mut latest = None;
        while let Ok(reply) = replies.recv_async().await {
            match reply.result() {
                Ok(sample) => match sample.payload().try_to_string() {
                    Ok(payload) => latest = Some(payload.into_owned()),
                    Err(error) => {
                        tracing::warn!(%error, "retained configuration is not valid UTF-8");
                    }
                },
                Err(error) => {
                    tracing::debug!(error = %error.payload().try_to_string().unwrap_or_default(),
                        "error reply to the retained configuration query");
                }
            }
        }
        latest
    }
}

#[async_trait]
impl MessageBus for ZenohBus {
    async fn config_updates(&self) -> anyhow::Result<BoxStream<'static, String>> {
        let subscriber = self
            .session
            .declare_subscriber(self.config_key())
            .await
            .map_err(|error| anyhow::anyhow!(error))
            .context("unable to subscribe to the configuration topic")?;
        let retained = self.retained_config().await;

        let updates = stream::unfold(subscriber, |subscriber| async move {
            loop {
                match subscriber.recv_async().await {
                    Ok(sample) => match sample.payload().try_to_string() {
                        Ok(payload) => return Some((payload.into_owned(), subscriber)),
                        Err(error) => {
                            tracing::warn!(%error, "configuration payload is not valid UTF-8");
                        }
                    },
                    Err(_closed) => return None,
                }
            }
        });
        Ok(stream::iter(retained).chain(updates).boxed())
    }

    async fn publish_status(&self, report: &StatusReport) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(report).context("unable to serialize the status report")?;
        self.session
            .put(format!("{}/diagnostics", self.namespace), payload)
            .await
            .map_err(|error| anyhow::anyhow!(error))
            .context("unable to publish the status report")
    }
}
