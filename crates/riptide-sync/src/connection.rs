//! Connection state machine.
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                        |   ^                  |
//!      |                   failure  |            lost / error
//!      |                        v   |                  v
//!      +--budget exhausted--- Errored --backoff--> Reconnecting
//! ```
//!
//! A single driver task owns every automatic transition. `connect()` and
//! `disconnect()` start and cancel that task; nothing else writes the state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use riptide_channel::{Channel, ChannelError, ChannelEvent};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::auth::CredentialProvider;
use crate::backoff::Backoff;
use crate::dispatcher::{panic_message, EventDispatcher};
use crate::error::{RealtimeError, RealtimeResult};
use crate::protocol::RESYNC_EVENT;
use crate::state::{ConnectionFailure, ConnectionState, ConnectionStatus};

pub type StateHandler = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPolicy {
    /// Bound on one open attempt, handshake included.
    pub connect_timeout: Duration,
    /// Consecutive failed attempts after which automatic retries stop.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_retries: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Owner of the one channel this process keeps to the push source.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn Channel>,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: EventDispatcher,
    policy: ConnectionPolicy,
    status: watch::Sender<ConnectionStatus>,
    observers: Mutex<Vec<(u64, StateHandler)>>,
    next_observer: AtomicU64,
    // Bumped whenever a driver is started or cancelled; stale drivers may not publish.
    epoch: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

enum Attempt {
    Connected,
    Failed(String),
    Unauthenticated(String),
}

impl ConnectionManager {
    pub fn new(
        channel: Arc<dyn Channel>,
        credentials: Arc<dyn CredentialProvider>,
        dispatcher: EventDispatcher,
        policy: ConnectionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                credentials,
                dispatcher,
                policy,
                status: watch::channel(ConnectionStatus::default()).0,
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Starts connecting. A no-op while `Connected` or `Connecting`.
    ///
    /// From `Reconnecting` or `Errored` the pending backoff is cancelled and a
    /// fresh attempt starts immediately, keeping the current retry count.
    ///
    /// Refuses with [`RealtimeError::Unauthenticated`] when no credential is
    /// available; observers then see `Disconnected` with
    /// [`ConnectionFailure::Unauthenticated`].
    pub fn connect(&self) -> RealtimeResult<()> {
        let inner = &self.inner;
        let state = self.state();
        if matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
            trace!(target = "riptide.connection", state = %state, "connect ignored");
            return Ok(());
        }

        if inner.credentials.current_token().is_none() {
            warn!(target = "riptide.connection", "refusing to connect without a credential");
            let mut cancelled = false;
            inner.publish(|current| {
                if matches!(
                    current.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    return None;
                }
                let next = ConnectionStatus::new(
                    ConnectionState::Disconnected,
                    current.attempts,
                    Some(ConnectionFailure::Unauthenticated),
                );
                if current.state != ConnectionState::Disconnected {
                    inner.epoch.fetch_add(1, Ordering::SeqCst);
                    cancelled = true;
                }
                (*current != next).then_some(next)
            });
            if cancelled {
                if let Some(task) = inner.driver.lock().take() {
                    task.abort();
                }
            }
            return Err(RealtimeError::Unauthenticated);
        }

        // The epoch moves under the status lock, so a driver still sleeping in
        // backoff can no longer publish once the claim lands.
        let mut claimed = None;
        inner.publish(|current| match current.state {
            ConnectionState::Connected | ConnectionState::Connecting => None,
            _ => {
                claimed = Some(inner.epoch.fetch_add(1, Ordering::SeqCst) + 1);
                Some(ConnectionStatus::new(
                    ConnectionState::Connecting,
                    current.attempts,
                    None,
                ))
            }
        });
        let Some(epoch) = claimed else {
            return Ok(());
        };
        if state != ConnectionState::Disconnected {
            info!(
                target = "riptide.connection",
                from = %state,
                "connect requested; skipping pending backoff"
            );
        }

        let task = tokio::spawn(drive(Arc::clone(inner), epoch));
        if let Some(previous) = inner.driver.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Tears the channel down and cancels any pending reconnection.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = inner.driver.lock().take() {
            task.abort();
        }
        inner.channel.close().await;
        inner.publish(|current| {
            (current.state != ConnectionState::Disconnected).then(|| {
                ConnectionStatus::new(
                    ConnectionState::Disconnected,
                    current.attempts,
                    Some(ConnectionFailure::Manual),
                )
            })
        });
        info!(target = "riptide.connection", "disconnected");
    }

    /// Stops the driver task without touching the channel. Used on drop, where
    /// nothing can be awaited.
    pub fn shutdown(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.inner.driver.lock().take() {
            task.abort();
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.inner.policy
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Receiver that always holds the latest status.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Suspends until the state equals `state`, returning the matching status.
    pub async fn wait_for(&self, state: ConnectionState) -> ConnectionStatus {
        self.wait_until(|status| status.state == state).await
    }

    pub async fn wait_until<F>(&self, mut predicate: F) -> ConnectionStatus
    where
        F: FnMut(&ConnectionStatus) -> bool,
    {
        let mut rx = self.inner.status.subscribe();
        let matched = rx
            .wait_for(|status| predicate(status))
            .await
            .map(|status| status.clone());
        matched.unwrap_or_else(|_| self.status())
    }

    /// Registers an observer called synchronously on every transition.
    pub fn on_state_change<F>(&self, handler: F) -> StateObserver
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().push((id, Arc::new(handler)));
        StateObserver {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Sends one frame on the channel. Only valid while `Connected`.
    pub fn send(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(RealtimeError::NotConnected);
        }
        self.inner
            .channel
            .send(event, payload)
            .map_err(|err| match err {
                ChannelError::NotConnected => RealtimeError::NotConnected,
                other => RealtimeError::Channel(other),
            })
    }
}

/// Handle returned by [`ConnectionManager::on_state_change`].
pub struct StateObserver {
    inner: Weak<Inner>,
    id: u64,
}

impl StateObserver {
    pub fn unregister(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut observers = inner.observers.lock();
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        observers.len() != before
    }
}

impl Inner {
    fn transition(
        &self,
        epoch: u64,
        state: ConnectionState,
        attempts: u32,
        failure: Option<ConnectionFailure>,
    ) -> bool {
        let next = ConnectionStatus::new(state, attempts, failure);
        self.publish(|current| {
            if self.epoch.load(Ordering::SeqCst) != epoch || *current == next {
                None
            } else {
                Some(next.clone())
            }
        })
    }

    fn publish<F>(&self, decide: F) -> bool
    where
        F: FnOnce(&ConnectionStatus) -> Option<ConnectionStatus>,
    {
        let mut published = None;
        self.status.send_if_modified(|current| match decide(current) {
            Some(next) => {
                *current = next.clone();
                published = Some(next);
                true
            }
            None => false,
        });
        match published {
            Some(status) => {
                self.notify(&status);
                true
            }
            None => false,
        }
    }

    fn notify(&self, status: &ConnectionStatus) {
        debug!(
            target = "riptide.connection",
            state = %status.state,
            attempts = status.attempts,
            failure = ?status.failure,
            "connection state changed"
        );
        let observers: Vec<StateHandler> = self
            .observers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(status))) {
                error!(
                    target = "riptide.connection",
                    panic = %panic_message(&*panic),
                    "connection observer panicked"
                );
            }
        }
    }

    async fn attempt(&self, events: &mut broadcast::Receiver<ChannelEvent>) -> Attempt {
        let Some(token) = self.credentials.current_token() else {
            return Attempt::Unauthenticated("no credential available".to_string());
        };

        let handshake = async {
            match self.channel.open(&token).await {
                Ok(()) => {}
                Err(ChannelError::Unauthorized(detail)) => return Attempt::Unauthenticated(detail),
                Err(err) => return Attempt::Failed(err.to_string()),
            }
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Connected) => return Attempt::Connected,
                    Ok(ChannelEvent::Error { detail }) => return Attempt::Failed(detail),
                    Ok(ChannelEvent::Disconnected { reason }) => return Attempt::Failed(reason),
                    Ok(ChannelEvent::Message(frame)) => {
                        self.dispatcher.emit_locally(&frame.event, &frame.payload);
                    }
                    Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                    Err(RecvError::Closed) => {
                        return Attempt::Failed("channel event stream closed".to_string())
                    }
                }
            }
        };

        match tokio::time::timeout(self.policy.connect_timeout, handshake).await {
            Ok(outcome) => outcome,
            Err(_) => Attempt::Failed(format!(
                "connect timed out after {}ms",
                self.policy.connect_timeout.as_millis()
            )),
        }
    }

    /// Forwards data events until the connection goes away; returns why.
    async fn pump(&self, events: &mut broadcast::Receiver<ChannelEvent>) -> String {
        loop {
            match events.recv().await {
                Ok(ChannelEvent::Message(frame)) => {
                    self.dispatcher.emit_locally(&frame.event, &frame.payload);
                }
                Ok(ChannelEvent::Disconnected { reason }) => return reason,
                Ok(ChannelEvent::Error { detail }) => return detail,
                Ok(ChannelEvent::Connected) => {
                    trace!(target = "riptide.connection", "duplicate connected event");
                }
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return "channel event stream closed".to_string(),
            }
        }
    }

    /// Pushes were lost before dispatch; tell listeners so cached state can be
    /// refetched.
    fn lagged(&self, skipped: u64) {
        warn!(
            target = "riptide.connection",
            skipped, "event receiver lagged; pushes were dropped"
        );
        self.dispatcher
            .emit_locally(RESYNC_EVENT, &json!({ "skipped": skipped }));
    }

    /// Drops lifecycle events left over from a previous connection cycle.
    fn drain_stale(&self, events: &mut broadcast::Receiver<ChannelEvent>) {
        loop {
            match events.try_recv() {
                Ok(ChannelEvent::Message(frame)) => {
                    self.dispatcher.emit_locally(&frame.event, &frame.payload);
                }
                Ok(stale) => {
                    trace!(target = "riptide.connection", event = ?stale, "discarding stale event");
                }
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}

async fn drive(inner: Arc<Inner>, epoch: u64) {
    let mut events = inner.channel.subscribe();
    let mut attempts = inner.status.borrow().attempts;

    loop {
        inner.transition(epoch, ConnectionState::Connecting, attempts, None);
        inner.drain_stale(&mut events);

        match inner.attempt(&mut events).await {
            Attempt::Connected => {
                attempts = 0;
                info!(target = "riptide.connection", "connected");
                inner.transition(epoch, ConnectionState::Connected, 0, None);
                let reason = inner.pump(&mut events).await;
                warn!(target = "riptide.connection", reason = %reason, "connection lost");
                inner.channel.close().await;
                inner.transition(
                    epoch,
                    ConnectionState::Errored,
                    0,
                    Some(ConnectionFailure::Channel(reason)),
                );
            }
            Attempt::Unauthenticated(detail) => {
                warn!(target = "riptide.connection", detail = %detail, "credential rejected");
                inner.channel.close().await;
                inner.transition(
                    epoch,
                    ConnectionState::Disconnected,
                    attempts,
                    Some(ConnectionFailure::Unauthenticated),
                );
                return;
            }
            Attempt::Failed(detail) => {
                attempts = attempts.saturating_add(1);
                warn!(
                    target = "riptide.connection",
                    attempt = attempts,
                    max = inner.policy.max_retries,
                    error = %detail,
                    "connection attempt failed"
                );
                inner.channel.close().await;
                inner.transition(
                    epoch,
                    ConnectionState::Errored,
                    attempts,
                    Some(ConnectionFailure::Channel(detail)),
                );
                if attempts >= inner.policy.max_retries {
                    error!(
                        target = "riptide.connection",
                        attempts, "retry budget exhausted; waiting for an explicit connect"
                    );
                    inner.transition(
                        epoch,
                        ConnectionState::Disconnected,
                        attempts,
                        Some(ConnectionFailure::RetriesExhausted { attempts }),
                    );
                    return;
                }
            }
        }

        let delay = inner.policy.backoff.delay_for(attempts);
        inner.transition(epoch, ConnectionState::Reconnecting, attempts, None);
        debug!(
            target = "riptide.connection",
            delay_ms = delay.as_millis() as u64,
            attempts,
            "reconnect scheduled"
        );
        tokio::time::sleep(delay).await;
    }
}
