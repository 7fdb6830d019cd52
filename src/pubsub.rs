use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::command::{Command, cmd};
use crate::error::{Error, Result};
use crate::metrics;
use crate::resp::RespValue;

/// Which pub/sub namespace a subscription lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_keyword(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_keyword(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// Channel and pattern names are disjoint namespaces; keying the registry
/// by (kind, name) keeps them apart inside one map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    kind: SubscriptionKind,
    name: Bytes,
}

/// Why an unsubscribe callback fired.
#[derive(Debug, Clone)]
pub enum UnsubscribeSource {
    /// The caller asked, or the multiplexer was removed cleanly.
    UserInitiated,
    /// The transport failed underneath the subscription.
    ClientError(Error),
}

/// An inbound published message.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: Bytes,
    /// Set when a pattern subscription matched the message.
    pub pattern: Option<Bytes>,
    pub payload: RespValue,
}

/// Invoked for every message delivered to a subscription.
pub type MessageReceiver = Arc<dyn Fn(PubSubMessage) + Send + Sync>;
/// Invoked once per target when the server acknowledges the subscribe;
/// arguments are the subject and the server-reported subscription count.
pub type SubscribeHandler = Arc<dyn Fn(&[u8], i64) + Send + Sync>;
/// Invoked when a subscription ends, with the subject, the count, and why.
pub type UnsubscribeHandler = Arc<dyn Fn(&[u8], i64, UnsubscribeSource) + Send + Sync>;

/// Resolves a subscription-change request with the post-change count.
pub(crate) type CountSender = oneshot::Sender<Result<i64>>;

struct Subscription {
    kind: SubscriptionKind,
    on_message: MessageReceiver,
    /// One-shot: taken on the subscribe acknowledgement.
    on_subscribe: Option<SubscribeHandler>,
    on_unsubscribe: Option<UnsubscribeHandler>,
}

/// One subscribe/unsubscribe request covering several targets. The server
/// acknowledges each target with its own frame; the caller's future
/// resolves once all of them arrived, with the most recent count.
struct PendingAggregate {
    remaining: usize,
    last_count: Option<i64>,
    reply: CountSender,
}

struct PendingSubscribe {
    aggregate: u64,
    subscription: Subscription,
}

enum MultiplexerState {
    Default,
    Faulted(Error),
    Removed,
}

/// Stateful filter sitting in front of the command channel on the inbound
/// path.
///
/// Server-initiated pub/sub frames (messages and subscription
/// acknowledgements) are consumed here; everything else passes through to
/// the response queue untouched. Outbound subscription changes do not
/// follow the request/response shape, so they are produced here as raw
/// commands and resolved by the acknowledgement frames.
pub(crate) struct PubSubMultiplexer {
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    pending_subscribes: HashMap<SubscriptionKey, PendingSubscribe>,
    pending_unsubscribes: HashMap<SubscriptionKey, u64>,
    /// Distinguished "unsubscribe from all" entries, one slot per kind.
    unsubscribe_all: HashMap<SubscriptionKind, u64>,
    aggregates: HashMap<u64, PendingAggregate>,
    next_aggregate_id: u64,
    state: MultiplexerState,
}

impl PubSubMultiplexer {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            unsubscribe_all: HashMap::new(),
            aggregates: HashMap::new(),
            next_aggregate_id: 0,
            state: MultiplexerState::Default,
        }
    }

    /// Nothing registered and nothing in flight: the connection can leave
    /// subscriber mode.
    pub fn is_idle(&self) -> bool {
        self.subscriptions.is_empty()
            && self.pending_subscribes.is_empty()
            && self.pending_unsubscribes.is_empty()
            && self.unsubscribe_all.is_empty()
            && self.aggregates.is_empty()
    }

    pub fn subscription_count(&self) -> i64 {
        self.subscriptions.len() as i64
    }

    fn has_kind(&self, kind: SubscriptionKind) -> bool {
        self.subscriptions.keys().any(|k| k.kind == kind)
    }

    fn fail_fast_error(&self) -> Option<Error> {
        match &self.state {
            MultiplexerState::Default => None,
            MultiplexerState::Faulted(e) => Some(e.clone()),
            MultiplexerState::Removed => Some(Error::ConnectionClosed),
        }
    }

    /// Register receivers for `targets` and build the SUBSCRIBE/PSUBSCRIBE
    /// command for the ones the server does not know about yet.
    ///
    /// Returns `None` when nothing needs to reach the server; `reply` has
    /// then already been resolved with the current count.
    pub fn add_subscription(
        &mut self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
        reply: CountSender,
    ) -> Option<Command> {
        if let Some(error) = self.fail_fast_error() {
            let _ = reply.send(Err(error));
            return None;
        }

        let mut new_targets = Vec::new();
        for name in targets {
            let key = SubscriptionKey {
                kind,
                name: name.clone(),
            };
            if let Some(existing) = self.subscriptions.get_mut(&key) {
                // already live: the new receiver wins, nothing on the wire
                existing.on_message = on_message.clone();
            } else if !self.pending_subscribes.contains_key(&key) {
                new_targets.push(name);
            }
        }

        if new_targets.is_empty() {
            let _ = reply.send(Ok(self.subscription_count()));
            return None;
        }

        let aggregate = self.new_aggregate(new_targets.len(), reply);
        for name in &new_targets {
            let key = SubscriptionKey {
                kind,
                name: name.clone(),
            };
            self.pending_subscribes.insert(
                key,
                PendingSubscribe {
                    aggregate,
                    subscription: Subscription {
                        kind,
                        on_message: on_message.clone(),
                        on_subscribe: on_subscribe.clone(),
                        on_unsubscribe: on_unsubscribe.clone(),
                    },
                },
            );
        }

        Some(cmd(kind.subscribe_keyword()).args(new_targets))
    }

    /// Build the UNSUBSCRIBE/PUNSUBSCRIBE command for `targets`. An empty
    /// target list means "unsubscribe from all of this kind".
    pub fn remove_subscription(
        &mut self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        reply: CountSender,
    ) -> Option<Command> {
        if let Some(error) = self.fail_fast_error() {
            let _ = reply.send(Err(error));
            return None;
        }

        if targets.is_empty() {
            if !self.has_kind(kind) {
                let _ = reply.send(Ok(self.subscription_count()));
                return None;
            }
            if self.unsubscribe_all.contains_key(&kind) {
                let _ = reply.send(Err(Error::PubSubRaceCondition));
                return None;
            }
            let aggregate = self.new_aggregate(1, reply);
            self.unsubscribe_all.insert(kind, aggregate);
            return Some(cmd(kind.unsubscribe_keyword()));
        }

        let known: Vec<Bytes> = targets
            .into_iter()
            .filter(|name| {
                let key = SubscriptionKey {
                    kind,
                    name: name.clone(),
                };
                self.subscriptions.contains_key(&key)
                    && !self.pending_unsubscribes.contains_key(&key)
            })
            .collect();

        if known.is_empty() {
            let _ = reply.send(Ok(self.subscription_count()));
            return None;
        }

        let aggregate = self.new_aggregate(known.len(), reply);
        for name in &known {
            let key = SubscriptionKey {
                kind,
                name: name.clone(),
            };
            self.pending_unsubscribes.insert(key, aggregate);
        }

        Some(cmd(kind.unsubscribe_keyword()).args(known))
    }

    /// Inspect one decoded inbound frame. Pub/sub traffic is consumed;
    /// anything else is handed back for the response queue.
    pub fn filter_inbound(&mut self, value: RespValue) -> Option<RespValue> {
        let RespValue::Array(items) = value else {
            return Some(value);
        };
        if items.len() < 3 {
            return Some(RespValue::Array(items));
        }
        let Some(keyword) = items[0].as_bytes() else {
            return Some(RespValue::Array(items));
        };

        match keyword {
            b"message" => self.dispatch_message(items),
            b"pmessage" => self.dispatch_pmessage(items),
            b"subscribe" => self.handle_subscribe_ack(SubscriptionKind::Channel, items),
            b"psubscribe" => self.handle_subscribe_ack(SubscriptionKind::Pattern, items),
            b"unsubscribe" => self.handle_unsubscribe_ack(SubscriptionKind::Channel, items),
            b"punsubscribe" => self.handle_unsubscribe_ack(SubscriptionKind::Pattern, items),
            _ => Some(RespValue::Array(items)),
        }
    }

    fn dispatch_message(&mut self, items: Vec<RespValue>) -> Option<RespValue> {
        // [ "message", channel, payload ]
        let mut it = items.into_iter().skip(1);
        let (Some(channel), Some(payload)) = (it.next(), it.next()) else {
            return None;
        };
        let Some(channel) = bulk_bytes(&channel) else {
            tracing::warn!("pub/sub message frame with a non-string channel; dropping");
            return None;
        };

        let key = SubscriptionKey {
            kind: SubscriptionKind::Channel,
            name: channel.clone(),
        };
        match self.subscriptions.get(&key) {
            Some(subscription) => {
                metrics::global().message_received();
                (subscription.on_message)(PubSubMessage {
                    channel,
                    pattern: None,
                    payload,
                });
            }
            None => {
                tracing::debug!(
                    channel = %String::from_utf8_lossy(&channel),
                    "message for a channel with no local subscription"
                );
            }
        }
        None
    }

    fn dispatch_pmessage(&mut self, items: Vec<RespValue>) -> Option<RespValue> {
        // [ "pmessage", pattern, channel, payload ]
        let mut it = items.into_iter().skip(1);
        let (Some(pattern), Some(channel), Some(payload)) = (it.next(), it.next(), it.next())
        else {
            tracing::warn!("pmessage frame with fewer than four elements; dropping");
            return None;
        };
        let (Some(pattern), Some(channel)) = (bulk_bytes(&pattern), bulk_bytes(&channel)) else {
            tracing::warn!("pmessage frame with non-string subjects; dropping");
            return None;
        };

        let key = SubscriptionKey {
            kind: SubscriptionKind::Pattern,
            name: pattern.clone(),
        };
        match self.subscriptions.get(&key) {
            Some(subscription) => {
                metrics::global().message_received();
                (subscription.on_message)(PubSubMessage {
                    channel,
                    pattern: Some(pattern),
                    payload,
                });
            }
            None => {
                tracing::debug!(
                    pattern = %String::from_utf8_lossy(&pattern),
                    "pmessage for a pattern with no local subscription"
                );
            }
        }
        None
    }

    fn handle_subscribe_ack(
        &mut self,
        kind: SubscriptionKind,
        items: Vec<RespValue>,
    ) -> Option<RespValue> {
        let Some((subject, count)) = ack_parts(items) else {
            tracing::warn!("malformed subscribe acknowledgement; dropping");
            return None;
        };
        let key = SubscriptionKey {
            kind,
            name: subject.clone(),
        };

        let Some(pending) = self.pending_subscribes.remove(&key) else {
            tracing::debug!(
                subject = %String::from_utf8_lossy(&subject),
                "subscribe acknowledgement with no pending request"
            );
            return None;
        };

        let mut subscription = pending.subscription;
        if let Some(on_subscribe) = subscription.on_subscribe.take() {
            on_subscribe(&subject, count);
        }
        self.subscriptions.insert(key, subscription);
        metrics::global().subscription_added(kind);
        self.aggregate_target_done(pending.aggregate, count);
        None
    }

    fn handle_unsubscribe_ack(
        &mut self,
        kind: SubscriptionKind,
        items: Vec<RespValue>,
    ) -> Option<RespValue> {
        let Some((subject, count)) = ack_parts(items) else {
            tracing::warn!("malformed unsubscribe acknowledgement; dropping");
            return None;
        };
        let key = SubscriptionKey {
            kind,
            name: subject.clone(),
        };

        if let Some(mut subscription) = self.subscriptions.remove(&key) {
            metrics::global().subscription_removed(kind);
            if let Some(on_unsubscribe) = subscription.on_unsubscribe.take() {
                on_unsubscribe(&subject, count, UnsubscribeSource::UserInitiated);
            }
        }

        if let Some(aggregate) = self.pending_unsubscribes.remove(&key) {
            self.aggregate_target_done(aggregate, count);
        } else if let Some(&aggregate) = self.unsubscribe_all.get(&kind) {
            // "unsubscribe from all": done once the server count hits zero
            // or nothing of this kind remains locally
            if count == 0 || !self.has_kind(kind) {
                self.unsubscribe_all.remove(&kind);
                self.resolve_aggregate(aggregate, Ok(count));
            }
        } else {
            tracing::debug!(
                subject = %String::from_utf8_lossy(&subject),
                "unsubscribe acknowledgement with no pending request"
            );
        }
        None
    }

    fn new_aggregate(&mut self, remaining: usize, reply: CountSender) -> u64 {
        let id = self.next_aggregate_id;
        self.next_aggregate_id += 1;
        self.aggregates.insert(
            id,
            PendingAggregate {
                remaining,
                last_count: None,
                reply,
            },
        );
        id
    }

    fn aggregate_target_done(&mut self, id: u64, count: i64) {
        let finished = {
            let Some(aggregate) = self.aggregates.get_mut(&id) else {
                return;
            };
            aggregate.last_count = Some(count);
            aggregate.remaining = aggregate.remaining.saturating_sub(1);
            aggregate.remaining == 0
        };
        if finished {
            self.resolve_aggregate(id, Ok(count));
        }
    }

    fn resolve_aggregate(&mut self, id: u64, result: Result<i64>) {
        if let Some(aggregate) = self.aggregates.remove(&id) {
            let _ = aggregate.reply.send(result);
        }
    }

    /// Tear the registry down: every subscription's unsubscribe callback
    /// fires with `source` and count 0, every pending change resolves, and
    /// the multiplexer enters a terminal state where all requests fail.
    pub fn drain(&mut self, source: UnsubscribeSource) {
        for (key, mut subscription) in self.subscriptions.drain() {
            metrics::global().subscription_removed(subscription.kind);
            if let Some(on_unsubscribe) = subscription.on_unsubscribe.take() {
                on_unsubscribe(&key.name, 0, source.clone());
            }
        }

        let error = match &source {
            UnsubscribeSource::ClientError(e) => e.clone(),
            UnsubscribeSource::UserInitiated => Error::ConnectionClosed,
        };

        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.unsubscribe_all.clear();
        for (_, aggregate) in self.aggregates.drain() {
            // targets that were acknowledged before the failure still
            // count; a change with no ack at all reports the failure
            let result = match aggregate.last_count {
                Some(count) => Ok(count),
                None => Err(error.clone()),
            };
            let _ = aggregate.reply.send(result);
        }

        self.state = match source {
            UnsubscribeSource::ClientError(e) => MultiplexerState::Faulted(e),
            UnsubscribeSource::UserInitiated => MultiplexerState::Removed,
        };
    }
}

fn bulk_bytes(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::BulkString(Some(b)) | RespValue::SimpleString(b) => Some(b.clone()),
        _ => None,
    }
}

/// Pull `(subject, count)` out of a `[ keyword, subject, count ]` ack.
fn ack_parts(items: Vec<RespValue>) -> Option<(Bytes, i64)> {
    let mut it = items.into_iter().skip(1);
    let subject = bulk_bytes(&it.next()?)?;
    let count = match it.next()? {
        RespValue::Integer(n) => n,
        _ => return None,
    };
    Some((subject, count))
}

/// Buffered receiver over a subscription's messages, for callers that
/// prefer awaiting a stream to installing a callback.
pub struct PubSubStream {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl PubSubStream {
    /// The next message, or `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

/// A message receiver that forwards into a [`PubSubStream`].
pub(crate) fn message_channel() -> (MessageReceiver, PubSubStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let receiver: MessageReceiver = Arc::new(move |message| {
        let _ = tx.send(message);
    });
    (receiver, PubSubStream { rx })
}
