//! Reference-counted subscriptions with debounced wire traffic.
//!
//! Each resource key has one entry. Local consumers bump its reference count;
//! the wire only learns about the *settled* desired state once the debounce
//! window has passed without further requests for that key. Entries are
//! confirmed (`wire_subscribed`) only by a `subscribed` ack received while
//! connected, and every confirmation is forgotten when the connection drops.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionManager;
use crate::dispatcher::{handler, EventDispatcher, HandlerError, HandlerResult, Registration};
use crate::error::RealtimeError;
use crate::protocol::{
    ResourceKey, SubscriptionAck, SubscriptionOp, SubscriptionRejection, SubscriptionRequest,
    SUBSCRIBED_EVENT, SUBSCRIPTION_ERROR_EVENT, SUBSCRIPTION_EVENT, UNSUBSCRIBED_EVENT,
};
use crate::state::{ConnectionState, ConnectionStatus};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Subscribe attempts allowed per entry: the first one plus a single retry.
const MAX_SUBSCRIBE_ATTEMPTS: u8 = 2;

#[derive(Default)]
struct Entry {
    ref_count: u32,
    want_subscribed: bool,
    wire_subscribed: bool,
    awaiting_ack: bool,
    rejections: u8,
    last_rejection: Option<RealtimeError>,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl Entry {
    fn retry_allowed(&self) -> bool {
        self.rejections < MAX_SUBSCRIBE_ATTEMPTS
    }

    fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}

/// Read-only view of one entry, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub key: ResourceKey,
    pub ref_count: u32,
    pub want_subscribed: bool,
    pub wire_subscribed: bool,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connection: ConnectionManager,
    debounce: Duration,
    entries: Mutex<HashMap<ResourceKey, Entry>>,
    registrations: Mutex<Vec<Registration>>,
}

impl SubscriptionRegistry {
    /// Creates the registry and hooks it to `connection`: acks are read from
    /// the connection's dispatcher and every state change triggers replay or
    /// reset.
    pub fn new(connection: ConnectionManager, debounce: Duration) -> Self {
        let inner = Arc::new(RegistryInner {
            connection,
            debounce,
            entries: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.connection.on_state_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.on_status(status);
            }
        });

        let dispatcher = inner.connection.dispatcher().clone();
        let registrations = vec![
            bind(&dispatcher, SUBSCRIBED_EVENT, &inner, RegistryInner::on_subscribed),
            bind(&dispatcher, UNSUBSCRIBED_EVENT, &inner, RegistryInner::on_unsubscribed),
            bind(&dispatcher, SUBSCRIPTION_ERROR_EVENT, &inner, RegistryInner::on_rejected),
        ];
        *inner.registrations.lock() = registrations;

        Self { inner }
    }

    /// Adds one local consumer for `key`. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, key: ResourceKey) {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.ref_count += 1;
        entry.want_subscribed = true;
        debug!(
            target = "riptide.subscriptions",
            key = %key,
            refs = entry.ref_count,
            "subscribe requested"
        );
        self.inner.schedule_flush(&key, entry);
    }

    /// Drops one local consumer for `key`. The wire unsubscribe is scheduled
    /// once the last consumer is gone.
    pub fn unsubscribe(&self, key: &ResourceKey) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key).filter(|entry| entry.ref_count > 0) else {
            warn!(
                target = "riptide.subscriptions",
                key = %key,
                "unsubscribe without a matching subscribe"
            );
            return;
        };
        entry.ref_count -= 1;
        debug!(
            target = "riptide.subscriptions",
            key = %key,
            refs = entry.ref_count,
            "unsubscribe requested"
        );
        if entry.ref_count == 0 {
            entry.want_subscribed = false;
            self.inner.schedule_flush(key, entry);
        }
    }

    /// Whether the server has confirmed `key` on the current connection.
    pub fn is_subscribed(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.wire_subscribed)
    }

    pub fn ref_count(&self, key: &ResourceKey) -> u32 {
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.ref_count)
    }

    pub fn wants_subscribed(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.want_subscribed)
    }

    /// The most recent server rejection for `key`, cleared by a later ack.
    pub fn rejection(&self, key: &ResourceKey) -> Option<RealtimeError> {
        self.inner
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.last_rejection.clone())
    }

    pub fn snapshot(&self) -> Vec<SubscriptionSnapshot> {
        let mut view: Vec<SubscriptionSnapshot> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| SubscriptionSnapshot {
                key: key.clone(),
                ref_count: entry.ref_count,
                want_subscribed: entry.want_subscribed,
                wire_subscribed: entry.wire_subscribed,
            })
            .collect();
        view.sort_by(|a, b| a.key.cmp(&b.key));
        view
    }

    /// Removes the ack handlers from the dispatcher and cancels every pending
    /// debounce timer.
    pub fn detach(&self) {
        for registration in self.inner.registrations.lock().drain(..) {
            registration.unregister();
        }
        for entry in self.inner.entries.lock().values_mut() {
            entry.cancel_pending();
        }
    }
}

fn bind(
    dispatcher: &EventDispatcher,
    event: &str,
    inner: &Arc<RegistryInner>,
    apply: fn(&RegistryInner, &Value) -> HandlerResult,
) -> Registration {
    let weak: Weak<RegistryInner> = Arc::downgrade(inner);
    dispatcher.on(
        event,
        handler(move |payload| match weak.upgrade() {
            Some(inner) => apply(&inner, payload),
            None => Ok(()),
        }),
    )
}

impl RegistryInner {
    fn schedule_flush(self: &Arc<Self>, key: &ResourceKey, entry: &mut Entry) {
        entry.cancel_pending();
        entry.generation = entry.generation.wrapping_add(1);

        let generation = entry.generation;
        let delay = self.debounce;
        let weak = Arc::downgrade(self);
        let key = key.clone();
        entry.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush(&key, generation);
            }
        }));
    }

    /// Reconciles the settled desired state of `key` with the wire.
    fn flush(&self, key: &ResourceKey, generation: u64) {
        let op = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.pending = None;

            if self.connection.state() != ConnectionState::Connected {
                if entry.ref_count == 0 {
                    entries.remove(key);
                    trace!(target = "riptide.subscriptions", key = %key, "dropped while offline");
                } else {
                    trace!(target = "riptide.subscriptions", key = %key, "queued until connected");
                }
                return;
            }

            let effective = entry.wire_subscribed || entry.awaiting_ack;
            match (entry.want_subscribed, effective) {
                (true, false) if entry.retry_allowed() => {
                    entry.awaiting_ack = true;
                    SubscriptionOp::Subscribe
                }
                (true, _) => return,
                (false, true) => {
                    entries.remove(key);
                    SubscriptionOp::Unsubscribe
                }
                (false, false) => {
                    entries.remove(key);
                    trace!(target = "riptide.subscriptions", key = %key, "coalesced to nothing");
                    return;
                }
            }
        };
        self.send(key, op);
    }

    fn send(&self, key: &ResourceKey, op: SubscriptionOp) {
        let request = SubscriptionRequest {
            op,
            resource_key: key.clone(),
        };
        let result = serde_json::to_value(&request)
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                self.connection
                    .send(SUBSCRIPTION_EVENT, payload)
                    .map_err(|err| err.to_string())
            });

        match result {
            Ok(()) => debug!(target = "riptide.subscriptions", key = %key, ?op, "sent"),
            Err(err) => {
                warn!(
                    target = "riptide.subscriptions",
                    key = %key,
                    ?op,
                    error = %err,
                    "subscription frame not sent; will replay on reconnect"
                );
                if op == SubscriptionOp::Subscribe {
                    if let Some(entry) = self.entries.lock().get_mut(key) {
                        entry.awaiting_ack = false;
                    }
                }
            }
        }
    }

    fn on_status(&self, status: &ConnectionStatus) {
        if status.is_connected() {
            self.replay();
            return;
        }
        let mut entries = self.entries.lock();
        for entry in entries.values_mut() {
            entry.wire_subscribed = false;
            entry.awaiting_ack = false;
        }
    }

    fn replay(&self) {
        let keys: Vec<ResourceKey> = {
            let mut entries = self.entries.lock();
            entries.retain(|key, entry| {
                if entry.ref_count > 0 {
                    return true;
                }
                entry.cancel_pending();
                trace!(target = "riptide.subscriptions", key = %key, "pruned on reconnect");
                false
            });
            entries
                .iter_mut()
                .filter(|(_, entry)| {
                    !entry.wire_subscribed && !entry.awaiting_ack && entry.retry_allowed()
                })
                .map(|(key, entry)| {
                    entry.awaiting_ack = true;
                    key.clone()
                })
                .collect()
        };

        if !keys.is_empty() {
            info!(
                target = "riptide.subscriptions",
                count = keys.len(),
                "replaying subscriptions"
            );
        }
        for key in keys {
            self.send(&key, SubscriptionOp::Subscribe);
        }
    }

    fn on_subscribed(&self, payload: &Value) -> HandlerResult {
        let ack: SubscriptionAck = decode(payload)?;
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&ack.resource_key) else {
            trace!(target = "riptide.subscriptions", key = %ack.resource_key, "ack for unknown key");
            return Ok(());
        };
        entry.awaiting_ack = false;
        // The ack reflects the wire even when the last consumer already left;
        // a pending flush then sends the unsubscribe.
        if self.connection.state() == ConnectionState::Connected {
            entry.wire_subscribed = true;
            entry.rejections = 0;
            entry.last_rejection = None;
            debug!(
                target = "riptide.subscriptions",
                key = %ack.resource_key,
                refs = entry.ref_count,
                "confirmed"
            );
        }
        Ok(())
    }

    fn on_unsubscribed(&self, payload: &Value) -> HandlerResult {
        let ack: SubscriptionAck = decode(payload)?;
        let mut entries = self.entries.lock();
        if entries
            .get(&ack.resource_key)
            .is_some_and(|entry| entry.ref_count == 0)
        {
            entries.remove(&ack.resource_key);
        }
        debug!(target = "riptide.subscriptions", key = %ack.resource_key, "unsubscribe confirmed");
        Ok(())
    }

    fn on_rejected(&self, payload: &Value) -> HandlerResult {
        let rejection: SubscriptionRejection = decode(payload)?;
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&rejection.resource_key) else {
            return Ok(());
        };
        entry.wire_subscribed = false;
        entry.awaiting_ack = false;
        entry.rejections = entry.rejections.saturating_add(1);
        let err = RealtimeError::Subscription {
            key: rejection.resource_key,
            reason: rejection.reason,
        };
        warn!(
            target = "riptide.subscriptions",
            error = %err,
            retry = entry.retry_allowed(),
            "subscription rejected"
        );
        entry.last_rejection = Some(err);
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, HandlerError> {
    T::deserialize(payload).map_err(|err| HandlerError::new(format!("malformed ack: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedToken;
    use crate::connection::ConnectionPolicy;
    use riptide_channel::{LocalChannel, WireEvent};
    use serde_json::json;

    struct Fixture {
        channel: Arc<LocalChannel>,
        connection: ConnectionManager,
        registry: SubscriptionRegistry,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(LocalChannel::new());
        let connection = ConnectionManager::new(
            channel.clone(),
            Arc::new(SharedToken::with_token("t")),
            EventDispatcher::new(),
            ConnectionPolicy::default(),
        );
        let registry = SubscriptionRegistry::new(connection.clone(), DEFAULT_DEBOUNCE);
        Fixture {
            channel,
            connection,
            registry,
        }
    }

    async fn connected() -> Fixture {
        let fx = fixture();
        fx.connection.connect().expect("connect");
        fx.connection.wait_for(ConnectionState::Connected).await;
        fx
    }

    fn ticket(id: &str) -> ResourceKey {
        ResourceKey::new("ticket", id)
    }

    fn frame(op: &str, key: &str) -> WireEvent {
        WireEvent::new(SUBSCRIPTION_EVENT, json!({"type": op, "resourceKey": key}))
    }

    async fn settle() {
        tokio::time::sleep(DEFAULT_DEBOUNCE + Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_is_debounced_and_confirmed_by_ack() {
        let fx = connected().await;
        fx.registry.subscribe(ticket("1"));
        assert!(fx.channel.sent().is_empty());

        settle().await;
        assert_eq!(fx.channel.take_sent(), vec![frame("subscribe", "ticket:1")]);
        assert!(!fx.registry.is_subscribed(&ticket("1")));

        fx.channel
            .deliver(SUBSCRIBED_EVENT, json!({"resourceKey": "ticket:1"}));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fx.registry.is_subscribed(&ticket("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_then_unsubscribe_sends_nothing() {
        let fx = connected().await;
        fx.registry.subscribe(ticket("1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.registry.unsubscribe(&ticket("1"));

        settle().await;
        settle().await;
        assert!(fx.channel.sent().is_empty());
        assert!(fx.registry.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_inside_unsubscribe_window_still_unsubscribes() {
        let fx = connected().await;
        fx.registry.subscribe(ticket("1"));
        settle().await;
        fx.registry.unsubscribe(&ticket("1"));

        fx.channel
            .deliver(SUBSCRIBED_EVENT, json!({"resourceKey": "ticket:1"}));
        tokio::time::sleep(Duration::from_millis(1)).await;
        settle().await;
        settle().await;

        assert_eq!(
            fx.channel.take_sent(),
            vec![frame("subscribe", "ticket:1"), frame("unsubscribe", "ticket:1")]
        );
        assert!(fx.registry.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reference_counts_gate_unsubscribe() {
        let fx = connected().await;
        for _ in 0..3 {
            fx.registry.subscribe(ticket("1"));
        }
        fx.registry.unsubscribe(&ticket("1"));
        fx.registry.unsubscribe(&ticket("1"));
        settle().await;

        assert_eq!(fx.registry.ref_count(&ticket("1")), 1);
        assert!(fx.registry.wants_subscribed(&ticket("1")));
        assert_eq!(fx.channel.take_sent(), vec![frame("subscribe", "ticket:1")]);

        fx.registry.unsubscribe(&ticket("1"));
        settle().await;
        assert_eq!(fx.channel.take_sent(), vec![frame("unsubscribe", "ticket:1")]);
        assert_eq!(fx.registry.ref_count(&ticket("1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbalanced_unsubscribe_is_ignored() {
        let fx = connected().await;
        fx.registry.unsubscribe(&ticket("9"));
        settle().await;
        assert!(fx.channel.sent().is_empty());
        assert_eq!(fx.registry.ref_count(&ticket("9")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_requests_are_queued_until_connected() {
        let fx = fixture();
        fx.registry.subscribe(ticket("1"));
        fx.registry.subscribe(ticket("2"));
        fx.registry.unsubscribe(&ticket("2"));
        settle().await;
        assert_eq!(fx.registry.ref_count(&ticket("1")), 1);
        assert_eq!(fx.registry.snapshot().len(), 1);

        fx.connection.connect().expect("connect");
        fx.connection.wait_for(ConnectionState::Connected).await;
        assert_eq!(fx.channel.take_sent(), vec![frame("subscribe", "ticket:1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_retried_once() {
        let fx = connected().await;
        fx.registry.subscribe(ticket("1"));
        settle().await;
        fx.channel.take_sent();

        let reject = json!({"resourceKey": "ticket:1", "reason": "forbidden"});
        fx.channel.deliver(SUBSCRIPTION_ERROR_EVENT, reject.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!fx.registry.is_subscribed(&ticket("1")));
        assert_eq!(
            fx.registry.rejection(&ticket("1")),
            Some(RealtimeError::Subscription {
                key: ticket("1"),
                reason: "forbidden".into()
            })
        );

        fx.registry.subscribe(ticket("1"));
        settle().await;
        assert_eq!(fx.channel.take_sent(), vec![frame("subscribe", "ticket:1")]);

        fx.channel.deliver(SUBSCRIPTION_ERROR_EVENT, reject);
        tokio::time::sleep(Duration::from_millis(1)).await;
        fx.registry.subscribe(ticket("1"));
        settle().await;
        assert!(fx.channel.sent().is_empty());
        assert_eq!(fx.registry.ref_count(&ticket("1")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_clears_confirmation() {
        let fx = connected().await;
        fx.registry.subscribe(ticket("1"));
        settle().await;
        fx.channel
            .deliver(SUBSCRIBED_EVENT, json!({"resourceKey": "ticket:1"}));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fx.registry.is_subscribed(&ticket("1")));

        fx.connection.disconnect().await;
        assert!(!fx.registry.is_subscribed(&ticket("1")));
        assert_eq!(fx.registry.ref_count(&ticket("1")), 1);
    }
}
