//! Broadcast bus for master/slave coordination.
//!
//! The core exchanges named events with JSON parameters:
//!
//! - `slave_fetch {source_id}` — fire-and-forget fan-out, every node pulls
//!   the named source;
//! - `get_slaves_status` / `get_source_status {source_id}` — broadcast
//!   RPCs: the caller publishes a request with a correlation id and
//!   collects one reply per responding node until a timeout elapses.
//!
//! Two transports implement the [`Broadcaster`] trait: [`RedisBroadcaster`]
//! over Redis pub/sub for real deployments, and [`LocalBroadcaster`], an
//! in-process dispatcher used when no Redis URL is configured (standalone
//! masters, tests). Handlers are registered on every node, so a node always
//! answers its own broadcasts too.

mod local;
mod redis_bus;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use local::LocalBroadcaster;
pub use redis_bus::RedisBroadcaster;

/// JSON parameters of an event.
pub type Params = serde_json::Value;

/// An event handler registered on a node.
///
/// Returning `Some` answers the broadcast when the sender expects replies;
/// `None` stays silent.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, params: Params) -> Option<Params>;
}

/// Fan-out transport between the nodes.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Register a handler for an event on this node.
    async fn subscribe(&self, event: &str, handler: Arc<dyn Handler>) -> Result<()>;

    /// Publish an event to every node, expecting no reply.
    async fn publish(&self, event: &str, params: Params) -> Result<()>;

    /// Publish an event and collect the replies of every responding node.
    ///
    /// Entries are `None` for handlers that stayed silent; non-responders
    /// simply never show up before the timeout.
    async fn broadcast(
        &self,
        event: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Vec<Option<Params>>>;
}

/// Connect the bus: Redis when a URL is configured, in-process otherwise.
pub async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn Broadcaster>> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisBroadcaster::connect(url).await?)),
        None => Ok(Arc::new(LocalBroadcaster::new())),
    }
}
