use async_trait::async_trait;
use coterie_core::{BusMessage, CoterieError, CoterieResult, MessageKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one subscription, for later removal.
pub type SubscriptionId = Uuid;

/// Async handler invoked for every message of a subscribed kind.
///
/// Handlers run in their own task; a panicking or erroring handler is
/// logged and never affects other subscribers or the delivery loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn on_message(&self, message: BusMessage) -> CoterieResult<()>;
}

/// Configuration for the [`MessageBus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages retained in history; oldest evicted first.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// History query filter. All criteria are conjunctive; `limit` keeps the
/// most recent matches.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Match only this sender.
    pub sender: Option<String>,
    /// Match only this recipient.
    pub recipient: Option<String>,
    /// Match only this kind.
    pub kind: Option<MessageKind>,
    /// Maximum number of results (0 means the default of 100).
    pub limit: usize,
}

impl MessageFilter {
    /// An unfiltered query with the default limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one sender.
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Restrict to one recipient.
    pub fn to_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Restrict to one message kind.
    pub fn of_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Cap the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn matches(&self, message: &BusMessage) -> bool {
        self.sender.as_ref().map_or(true, |s| &message.sender == s)
            && self.recipient.as_ref().map_or(true, |r| &message.recipient == r)
            && self.kind.map_or(true, |k| message.kind == k)
    }
}

/// Counters describing bus activity since construction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Messages the delivery loop has finished with.
    pub processed: u64,
    /// Messages received without error by at least one handler.
    pub delivered: u64,
    /// Handler invocations that errored or panicked.
    pub handler_errors: u64,
    /// Messages published but not yet processed.
    pub queued: u64,
    /// Current number of subscriptions across all kinds.
    pub subscribers: usize,
    /// Processed messages by kind.
    pub by_kind: HashMap<MessageKind, u64>,
}

enum QueueItem {
    Deliver(BusMessage),
    Flush(oneshot::Sender<()>),
}

struct Counters {
    published: u64,
    processed: u64,
    delivered: u64,
    handler_errors: u64,
    by_kind: HashMap<MessageKind, u64>,
}

struct BusInner {
    subscribers: RwLock<HashMap<MessageKind, Vec<(SubscriptionId, Arc<dyn MessageHandler>)>>>,
    history: Mutex<VecDeque<BusMessage>>,
    counters: Mutex<Counters>,
    history_capacity: usize,
}

/// Asynchronous, kind-subscribed message delivery between named
/// participants.
///
/// `publish` is non-blocking and fire-and-forget: messages are queued and a
/// single background loop delivers them in arrival order. FIFO delivery is
/// a deliberate simplification — [`coterie_core::MessagePriority`] rides on
/// the message for consumers, the queue itself is not priority-ordered.
/// Within one publisher's stream, delivery order equals publish order.
///
/// Every processed message is appended to a bounded history, whether or not
/// any handler accepted it.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl MessageBus {
    /// Create the bus and spawn its delivery loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: BusConfig) -> Self {
        let inner = Arc::new(BusInner {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters {
                published: 0,
                processed: 0,
                delivered: 0,
                handler_errors: 0,
                by_kind: HashMap::new(),
            }),
            history_capacity: config.history_capacity,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::delivery_loop(Arc::clone(&inner), rx));

        Self { inner, tx }
    }

    /// Subscribe a handler to one message kind.
    pub fn subscribe(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, kind: MessageKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(handlers) = subscribers.get_mut(&kind) {
            let before = handlers.len();
            handlers.retain(|(sub_id, _)| *sub_id != id);
            return handlers.len() < before;
        }
        false
    }

    /// Enqueue a message for delivery, returning its id immediately.
    pub fn publish(&self, message: BusMessage) -> CoterieResult<Uuid> {
        let id = message.id;
        // Counted before the send so `queued` never observes a processed
        // message that was not yet published.
        self.inner.counters.lock().published += 1;
        if self.tx.send(QueueItem::Deliver(message)).is_err() {
            self.inner.counters.lock().published -= 1;
            return Err(CoterieError::Bus("delivery loop has stopped".into()));
        }
        Ok(id)
    }

    /// Build and publish a message in one step.
    pub fn send(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        content: serde_json::Value,
    ) -> CoterieResult<Uuid> {
        self.publish(BusMessage::new(sender, recipient, kind, content))
    }

    /// Wait until everything published before this call has been processed.
    pub async fn flush(&self) -> CoterieResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::Flush(ack_tx))
            .map_err(|_| CoterieError::Bus("delivery loop has stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| CoterieError::Bus("delivery loop dropped flush ack".into()))
    }

    /// Query retained history, in publish order.
    pub fn history(&self, filter: &MessageFilter) -> Vec<BusMessage> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let history = self.inner.history.lock();
        let matched: Vec<&BusMessage> = history.iter().filter(|m| filter.matches(m)).collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).cloned().collect()
    }

    /// Snapshot of bus activity counters.
    pub fn statistics(&self) -> BusStats {
        let counters = self.inner.counters.lock();
        let subscribers = self
            .inner
            .subscribers
            .read()
            .values()
            .map(Vec::len)
            .sum();
        BusStats {
            published: counters.published,
            processed: counters.processed,
            delivered: counters.delivered,
            handler_errors: counters.handler_errors,
            queued: counters.published.saturating_sub(counters.processed),
            subscribers,
            by_kind: counters.by_kind.clone(),
        }
    }

    async fn delivery_loop(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Deliver(message) => Self::deliver(&inner, message).await,
                QueueItem::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("message bus delivery loop stopped");
    }

    async fn deliver(inner: &Arc<BusInner>, mut message: BusMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = inner
            .subscribers
            .read()
            .get(&message.kind)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut delivered = false;
        let mut handler_errors = 0u64;
        for handler in handlers {
            let msg = message.clone();
            // Each handler runs in its own task so a panic is contained.
            let outcome = tokio::spawn(async move { handler.on_message(msg).await }).await;
            match outcome {
                Ok(Ok(())) => delivered = true,
                Ok(Err(e)) => {
                    handler_errors += 1;
                    warn!(message_id = %message.id, kind = %message.kind, error = %e, "message handler failed");
                }
                Err(join_err) => {
                    handler_errors += 1;
                    warn!(message_id = %message.id, kind = %message.kind, error = %join_err, "message handler panicked");
                }
            }
        }

        message.delivered = delivered;

        {
            let mut history = inner.history.lock();
            if history.len() >= inner.history_capacity {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        let mut counters = inner.counters.lock();
        counters.processed += 1;
        counters.handler_errors += handler_errors;
        if delivered {
            counters.delivered += 1;
        }
        *counters.by_kind.entry(message.kind).or_insert(0) += 1;
    }
}
