// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Test doubles for exercising the supervisor without a middleware deployment.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt as _};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{bus::MessageBus, diagnostics::StatusReport};

/// In-process [`MessageBus`] driven by a channel.
///
/// Configuration payloads sent through the paired sender appear on the configuration stream;
/// published status reports are collected for inspection.
#[derive(Debug)]
pub struct TestBus {
    config_stream: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    published: Mutex<Vec<StatusReport>>,
}

impl TestBus {
    /// Creates a bus and the sender used to publish configuration payloads onto it.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            config_stream: Mutex::new(Some(receiver)),
            published: Mutex::new(Vec::new()),
        });
        (bus, sender)
    }

    /// Returns every status report published so far.
    pub fn published_reports(&self) -> Vec<StatusReport> {
        self.published
            .lock()
            .expect("lock is not poisoned")
            .clone()
    }
}

#[async_trait]
impl MessageBus for TestBus {
    async fn config_updates(&self) -> anyhow::Result<BoxStream<'static, String>> {
        let receiver = self
            .config_stream
            .lock()
            .expect("lock is not poisoned")
            .take()
            .ok_or_else(|| anyhow::anyhow!("the configuration stream was already taken"))?;
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn publish_status(&self, report: &StatusReport) -> anyhow::Result<()> {
        self.published
            .lock()
            .expect("lock is not poisoned")
            .push(report.clone());
        Ok(())
    }
}
