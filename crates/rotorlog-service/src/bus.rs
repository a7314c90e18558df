// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The seam to the vehicle's pub/sub middleware.
//!
//! The supervisor only needs two things from the bus: the stream of raw configuration payloads
//! published for this node, and a sink for its aggregated diagnostics. Everything else about
//! the middleware stays behind this trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::diagnostics::StatusReport;

pub mod zenoh;

/// Connection to the pub/sub middleware.
#[async_trait]
pub trait MessageBus: std::fmt::Debug + Send + Sync {
    /// Returns the stream of raw configuration payloads for this node.
    ///
    /// The stream must deliver the last retained configuration to a late subscriber, so that a
    /// node (re)starting after the operator published a configuration still picks it up.
    async fn config_updates(&self) -> anyhow::Result<BoxStream<'static, String>>;

    /// Publishes the aggregated node status.
    async fn publish_status(&self, report: &StatusReport) -> anyhow::Result<()>;
}
