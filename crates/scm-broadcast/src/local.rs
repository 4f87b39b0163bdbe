//! In-process bus, used when no Redis URL is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Broadcaster, Handler, Params};

/// Dispatches events to handlers registered in this process.
///
/// A standalone master is its own only node: `broadcast` answers from the
/// local handlers, so status aggregation works unchanged.
#[derive(Default)]
pub struct LocalBroadcaster {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn Handler>>>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn subscribe(&self, event: &str, handler: Arc<dyn Handler>) -> Result<()> {
        self.handlers
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn publish(&self, event: &str, params: Params) -> Result<()> {
        let handlers = self
            .handlers
            .read()
            .await
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            let params = params.clone();
            tokio::spawn(async move {
                handler.handle(params).await;
            });
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        event: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Vec<Option<Params>>> {
        let handlers = self
            .handlers
            .read()
            .await
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut replies = Vec::with_capacity(handlers.len());
        for handler in handlers {
            match tokio::time::timeout(timeout, handler.handle(params.clone())).await {
                Ok(reply) => replies.push(reply),
                Err(_) => replies.push(None),
            }
        }
        Ok(replies)
    }
}
