//! Status exchange over the broadcast bus.
//!
//! Every node answers `get_slaves_status` and `get_source_status`
//! broadcasts with its local view; the master aggregates the replies for
//! the HTTP surface and the drift detector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scm_broadcast::{Broadcaster, Handler, Params};
use scm_config::{SlaveStatus, SourceStatus};
use tracing::warn;

use crate::registry::Registry;

/// Event asking every node to fetch one source.
pub const SLAVE_FETCH: &str = "slave_fetch";

/// Broadcast RPC: full per-node status.
pub const GET_SLAVES_STATUS: &str = "get_slaves_status";

/// Broadcast RPC: status of one source.
pub const GET_SOURCE_STATUS: &str = "get_source_status";

/// The hostname reported in statuses.
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

struct SlavesStatusHandler {
    registry: Arc<Registry>,
}

#[async_trait]
impl Handler for SlavesStatusHandler {
    async fn handle(&self, _params: Params) -> Option<Params> {
        let status = SlaveStatus {
            hostname: Some(hostname()),
            pid: Some(std::process::id()),
            sources: self.registry.stats().await,
        };
        serde_json::to_value(status).ok()
    }
}

struct SourceStatusHandler {
    registry: Arc<Registry>,
}

#[async_trait]
impl Handler for SourceStatusHandler {
    async fn handle(&self, params: Params) -> Option<Params> {
        let id = params.get("source_id")?.as_str()?;
        let mut status = match self.registry.get_source(id).await {
            Some(engine) => engine.stats().await,
            None => SourceStatus {
                filtered: Some(self.registry.is_filtered(id).await),
                ..SourceStatus::default()
            },
        };
        status.hostname = Some(hostname());
        status.pid = Some(std::process::id());
        serde_json::to_value(status).ok()
    }
}

struct SlaveFetchHandler {
    registry: Arc<Registry>,
}

#[async_trait]
impl Handler for SlaveFetchHandler {
    async fn handle(&self, params: Params) -> Option<Params> {
        let Some(id) = params.get("source_id").and_then(Params::as_str) else {
            warn!("slave_fetch event without a source_id");
            return None;
        };
        self.registry.slave_fetch(id).await;
        None
    }
}

/// Register the bus handlers of a node.
///
/// The status handlers answer on every node; only slaves act on
/// `slave_fetch` (the master just refreshed locally when it emitted one).
pub async fn register_handlers(
    bus: &Arc<dyn Broadcaster>,
    registry: &Arc<Registry>,
) -> Result<()> {
    bus.subscribe(
        GET_SLAVES_STATUS,
        Arc::new(SlavesStatusHandler {
            registry: Arc::clone(registry),
        }),
    )
    .await?;
    bus.subscribe(
        GET_SOURCE_STATUS,
        Arc::new(SourceStatusHandler {
            registry: Arc::clone(registry),
        }),
    )
    .await?;
    if registry.settings().is_slave {
        bus.subscribe(
            SLAVE_FETCH,
            Arc::new(SlaveFetchHandler {
                registry: Arc::clone(registry),
            }),
        )
        .await?;
    }
    Ok(())
}

/// Collect the per-node statuses; non-decodable replies count as `None`.
pub async fn slaves_status(
    bus: &Arc<dyn Broadcaster>,
    timeout: Duration,
) -> Result<Vec<Option<SlaveStatus>>> {
    let replies = bus
        .broadcast(GET_SLAVES_STATUS, serde_json::json!({}), timeout)
        .await?;
    Ok(replies
        .into_iter()
        .map(|reply| reply.and_then(|value| serde_json::from_value(value).ok()))
        .collect())
}

/// Collect the per-node statuses of one source.
pub async fn source_status(
    bus: &Arc<dyn Broadcaster>,
    id: &str,
    timeout: Duration,
) -> Result<Vec<Option<SourceStatus>>> {
    let replies = bus
        .broadcast(
            GET_SOURCE_STATUS,
            serde_json::json!({ "source_id": id }),
            timeout,
        )
        .await?;
    Ok(replies
        .into_iter()
        .map(|reply| reply.and_then(|value| serde_json::from_value(value).ok()))
        .collect())
}
