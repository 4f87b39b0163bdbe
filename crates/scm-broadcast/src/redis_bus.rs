//! Redis pub/sub transport.
//!
//! Events travel on `broadcast_scm:<event>` channels. A broadcast that
//! expects answers subscribes a one-shot `broadcast_scm:reply:<uuid>`
//! channel, stamps it into the envelope and collects whatever lands there
//! before the timeout. Handlers on the receiving side publish their answer
//! back to that channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{Broadcaster, Handler, Params};

/// Channel namespace, shared by every node of a deployment.
const NAMESPACE: &str = "broadcast_scm";

/// Wire format of one event.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    params: Params,
    /// Reply channel, present when the sender expects answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

enum Route {
    Handlers(Vec<Arc<dyn Handler>>),
    Replies(mpsc::UnboundedSender<Params>),
}

/// Bus transport over Redis pub/sub.
pub struct RedisBroadcaster {
    manager: ConnectionManager,
    sink: Mutex<redis::aio::PubSubSink>,
    routes: Arc<RwLock<HashMap<String, Route>>>,
    listener: JoinHandle<()>,
}

impl RedisBroadcaster {
    /// Connect to Redis and start the listener.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .context("failed to open the Redis pub/sub connection")?;
        let (sink, mut stream) = pubsub.split();

        let routes: Arc<RwLock<HashMap<String, Route>>> = Arc::new(RwLock::new(HashMap::new()));

        let listener_routes = Arc::clone(&routes);
        let listener_manager = manager.clone();
        let listener = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!("undecodable payload on {channel}: {error}");
                        continue;
                    }
                };
                dispatch(&listener_routes, &listener_manager, &channel, &payload).await;
            }
            debug!("Redis pub/sub stream closed");
        });

        Ok(Self {
            manager,
            sink: Mutex::new(sink),
            routes,
            listener,
        })
    }

    fn channel(event: &str) -> String {
        format!("{NAMESPACE}:{event}")
    }
}

async fn dispatch(
    routes: &RwLock<HashMap<String, Route>>,
    manager: &ConnectionManager,
    channel: &str,
    payload: &str,
) {
    let guard = routes.read().await;
    match guard.get(channel) {
        Some(Route::Handlers(handlers)) => {
            let envelope: Envelope = match serde_json::from_str(payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!("invalid envelope on {channel}: {error}");
                    return;
                }
            };
            for handler in handlers.iter().cloned() {
                let params = envelope.params.clone();
                let reply_to = envelope.reply_to.clone();
                let manager = manager.clone();
                tokio::spawn(async move {
                    let reply = handler.handle(params).await;
                    if let (Some(reply), Some(reply_to)) = (reply, reply_to) {
                        let payload = match serde_json::to_string(&reply) {
                            Ok(payload) => payload,
                            Err(error) => {
                                error!("unserializable reply: {error}");
                                return;
                            }
                        };
                        let mut conn = manager;
                        if let Err(error) = conn.publish::<_, _, ()>(&reply_to, payload).await {
                            warn!("failed to publish the reply on {reply_to}: {error}");
                        }
                    }
                });
            }
        }
        Some(Route::Replies(tx)) => {
            match serde_json::from_str::<Params>(payload) {
                Ok(params) => {
                    let _ = tx.send(params);
                }
                Err(error) => warn!("invalid reply on {channel}: {error}"),
            };
        }
        None => debug!("no route for channel {channel}"),
    }
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn subscribe(&self, event: &str, handler: Arc<dyn Handler>) -> Result<()> {
        let channel = Self::channel(event);
        {
            let mut routes = self.routes.write().await;
            match routes.get_mut(&channel) {
                Some(Route::Handlers(handlers)) => handlers.push(handler),
                _ => {
                    routes.insert(channel.clone(), Route::Handlers(vec![handler]));
                }
            }
        }
        self.sink
            .lock()
            .await
            .subscribe(&channel)
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;
        Ok(())
    }

    async fn publish(&self, event: &str, params: Params) -> Result<()> {
        let envelope = Envelope {
            params,
            reply_to: None,
        };
        let payload = serde_json::to_string(&envelope).context("unserializable event")?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(Self::channel(event), payload)
            .await
            .with_context(|| format!("failed to publish {event}"))?;
        Ok(())
    }

    async fn broadcast(
        &self,
        event: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Vec<Option<Params>>> {
        let reply_channel = format!("{NAMESPACE}:reply:{}", Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();

        self.routes
            .write()
            .await
            .insert(reply_channel.clone(), Route::Replies(tx));
        self.sink
            .lock()
            .await
            .subscribe(&reply_channel)
            .await
            .with_context(|| format!("failed to subscribe to {reply_channel}"))?;

        let result = async {
            let envelope = Envelope {
                params,
                reply_to: Some(reply_channel.clone()),
            };
            let payload = serde_json::to_string(&envelope).context("unserializable event")?;
            let mut conn = self.manager.clone();
            conn.publish::<_, _, ()>(Self::channel(event), payload)
                .await
                .with_context(|| format!("failed to publish {event}"))?;

            let mut replies = Vec::new();
            let deadline = tokio::time::Instant::now() + timeout;
            while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                replies.push(Some(reply));
            }
            Ok(replies)
        }
        .await;

        self.routes.write().await.remove(&reply_channel);
        if let Err(error) = self.sink.lock().await.unsubscribe(&reply_channel).await {
            warn!("failed to unsubscribe from {reply_channel}: {error}");
        }

        result
    }
}

impl Drop for RedisBroadcaster {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_format() {
        let envelope = Envelope {
            params: json!({"source_id": "s1"}),
            reply_to: None,
        };
        let wire = serde_json::to_string(&envelope).expect("serialize");
        assert_eq!(wire, r#"{"params":{"source_id":"s1"}}"#);

        let envelope = Envelope {
            params: json!({}),
            reply_to: Some(format!("{NAMESPACE}:reply:abc")),
        };
        let wire = serde_json::to_string(&envelope).expect("serialize");
        let back: Envelope = serde_json::from_str(&wire).expect("deserialize");
        assert_eq!(back.reply_to.as_deref(), Some("broadcast_scm:reply:abc"));
    }

    #[test]
    fn channel_names_are_namespaced() {
        assert_eq!(RedisBroadcaster::channel("slave_fetch"), "broadcast_scm:slave_fetch");
    }
}
