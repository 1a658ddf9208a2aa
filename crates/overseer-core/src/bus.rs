//! In-process publish/subscribe and direct-addressed delivery.
//!
//! Each registered participant owns one unbounded inbound channel drained by a
//! dedicated delivery loop, so delivery is strictly ordered per participant and
//! unordered across participants. Handler failures are logged and never reach
//! the publisher.

use crate::{OverseerError, OverseerResult};
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives messages from a bus channel, one at a time.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    async fn handle(&self, message: M) -> OverseerResult<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<M, F> {
    f: F,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<M, F>
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = OverseerResult<()>> + Send,
{
    async fn handle(&self, message: M) -> OverseerResult<()> {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<M, F, Fut>(f: F) -> Arc<dyn MessageHandler<M>>
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = OverseerResult<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

enum Envelope<M> {
    Deliver(M),
    Stop,
}

struct Channel<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
    task: JoinHandle<()>,
}

struct BusState<M> {
    channels: HashMap<String, Channel<M>>,
    topics: HashMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of bus activity counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub channels: usize,
    pub topics: usize,
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Asynchronous message bus shared by the orchestrator and its agents.
///
/// Cloning is cheap; clones share channels and subscriptions.
pub struct MessageBus<M> {
    state: Arc<RwLock<BusState<M>>>,
    counters: Arc<BusCounters>,
}

impl<M> Clone for MessageBus<M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<M> MessageBus<M>
where
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState {
                channels: HashMap::new(),
                topics: HashMap::new(),
            })),
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Create a dedicated inbound channel for `id` and start its delivery loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, id: &str, handler: Arc<dyn MessageHandler<M>>) -> OverseerResult<()> {
        let mut state = self.state.write();
        if state.channels.contains_key(id) {
            return Err(OverseerError::Bus(format!("channel '{id}' already registered")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(delivery_loop(
            id.to_string(),
            rx,
            handler,
            Arc::clone(&self.counters),
        ));
        state.channels.insert(id.to_string(), Channel { tx, task });
        info!(channel = %id, "Bus channel registered");
        Ok(())
    }

    /// Stop the channel's delivery loop and drop its subscriptions.
    ///
    /// Messages queued before the call are still delivered.
    pub async fn unregister(&self, id: &str) -> OverseerResult<()> {
        let channel = {
            let mut state = self.state.write();
            let channel = state
                .channels
                .remove(id)
                .ok_or_else(|| OverseerError::Bus(format!("channel '{id}' not registered")))?;
            for members in state.topics.values_mut() {
                members.remove(id);
            }
            state.topics.retain(|_, members| !members.is_empty());
            channel
        };

        let _ = channel.tx.send(Envelope::Stop);
        if let Err(e) = channel.task.await {
            warn!(channel = %id, error = %e, "Delivery loop ended abnormally");
        }
        info!(channel = %id, "Bus channel unregistered");
        Ok(())
    }

    /// Add `id` to the members of `topic`.
    pub fn subscribe(&self, id: &str, topic: &str) -> OverseerResult<()> {
        let mut state = self.state.write();
        if !state.channels.contains_key(id) {
            return Err(OverseerError::Bus(format!("channel '{id}' not registered")));
        }
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.to_string());
        debug!(channel = %id, topic = %topic, "Subscribed");
        Ok(())
    }

    /// Remove `id` from the members of `topic`. Returns whether it was a member.
    pub fn unsubscribe(&self, id: &str, topic: &str) -> bool {
        let mut state = self.state.write();
        let removed = state
            .topics
            .get_mut(topic)
            .is_some_and(|members| members.remove(id));
        state.topics.retain(|_, members| !members.is_empty());
        removed
    }

    /// Deliver `message` to every channel subscribed to `topic`.
    ///
    /// Returns the number of channels the message was queued on.
    pub fn publish(&self, topic: &str, message: M) -> usize {
        let state = self.state.read();
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let Some(members) = state.topics.get(topic) else {
            debug!(topic = %topic, "No subscribers for topic");
            return 0;
        };

        let mut reached = 0;
        for id in members {
            if let Some(channel) = state.channels.get(id) {
                if channel.tx.send(Envelope::Deliver(message.clone())).is_ok() {
                    reached += 1;
                }
            }
        }
        debug!(topic = %topic, reached, "Published");
        reached
    }

    /// Deliver `message` to exactly one channel, ignoring topics.
    pub fn send_direct(&self, id: &str, message: M) -> OverseerResult<()> {
        let state = self.state.read();
        let channel = state
            .channels
            .get(id)
            .ok_or_else(|| OverseerError::Bus(format!("channel '{id}' not registered")))?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        channel
            .tx
            .send(Envelope::Deliver(message))
            .map_err(|_| OverseerError::Bus(format!("channel '{id}' is closed")))
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.read().channels.contains_key(id)
    }

    /// Members of `topic`, sorted.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BusStats {
        let state = self.state.read();
        BusStats {
            channels: state.channels.len(),
            topics: state.topics.len(),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop every delivery loop and wait for them to finish.
    pub async fn shutdown(&self) {
        let channels: Vec<(String, Channel<M>)> = {
            let mut state = self.state.write();
            state.topics.clear();
            state.channels.drain().collect()
        };
        for (id, channel) in channels {
            let _ = channel.tx.send(Envelope::Stop);
            if let Err(e) = channel.task.await {
                warn!(channel = %id, error = %e, "Delivery loop ended abnormally");
            }
        }
        info!("Message bus shut down");
    }
}

impl<M> Default for MessageBus<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn delivery_loop<M>(
    id: String,
    mut rx: mpsc::UnboundedReceiver<Envelope<M>>,
    handler: Arc<dyn MessageHandler<M>>,
    counters: Arc<BusCounters>,
) where
    M: Send + 'static,
{
    while let Some(envelope) = rx.recv().await {
        let message = match envelope {
            Envelope::Deliver(message) => message,
            Envelope::Stop => break,
        };

        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(channel = %id, error = %e, "Message handler failed");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(channel = %id, "Message handler panicked");
            }
        }
    }
    debug!(channel = %id, "Delivery loop stopped");
}
