use std::sync::Arc;

use riptide_channel::Channel;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::auth::CredentialProvider;
use crate::cache::{CacheChange, CacheStore};
use crate::config::RealtimeConfig;
use crate::connection::{ConnectionManager, StateObserver};
use crate::dispatcher::{handler, EventDispatcher, EventHandler, HandlerError, Registration};
use crate::error::{RealtimeError, RealtimeResult};
use crate::protocol::{ResourceKey, RESYNC_EVENT};
use crate::reconciler::{FetchTicket, UpdateReconciler};
use crate::registry::SubscriptionRegistry;
use crate::state::{ConnectionState, ConnectionStatus};

/// UI-facing entry point: one per process, wrapping one connection.
pub struct RealtimeClient {
    config: RealtimeConfig,
    dispatcher: EventDispatcher,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    reconciler: Arc<UpdateReconciler>,
    push_handlers: Vec<Registration>,
}

impl RealtimeClient {
    /// Wires the components together. Must be called inside a Tokio runtime.
    pub fn new(
        config: RealtimeConfig,
        channel: Arc<dyn Channel>,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<dyn CacheStore>,
    ) -> RealtimeResult<Self> {
        config.validate()?;

        let dispatcher = EventDispatcher::new();
        let connection = ConnectionManager::new(
            channel,
            credentials,
            dispatcher.clone(),
            config.connection_policy(),
        );
        let registry = SubscriptionRegistry::new(connection.clone(), config.debounce);
        let reconciler = Arc::new(UpdateReconciler::new(
            cache,
            config.field_aliases.clone(),
            config.event_capacity,
        ));

        let mut push_handlers: Vec<Registration> = config
            .update_events
            .iter()
            .map(|event| dispatcher.on(event, push_handler(&reconciler)))
            .collect();
        push_handlers.push(dispatcher.on(RESYNC_EVENT, resync_handler(&registry, &reconciler)));

        debug!(
            target = "riptide.client",
            url = %config.url,
            update_events = ?config.update_events,
            "realtime client ready"
        );

        Ok(Self {
            config,
            dispatcher,
            connection,
            registry,
            reconciler,
            push_handlers,
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn connect(&self) -> RealtimeResult<()> {
        self.connection.connect()
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch()
    }

    /// The current connection failure, if any, as a user-facing error.
    pub fn connection_error(&self) -> Option<RealtimeError> {
        self.connection.status().error()
    }

    pub async fn wait_for(&self, state: ConnectionState) -> ConnectionStatus {
        self.connection.wait_for(state).await
    }

    pub fn on_connection_state_change<F>(&self, handler: F) -> StateObserver
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.connection.on_state_change(handler)
    }

    pub fn subscribe(&self, key: ResourceKey) {
        self.registry.subscribe(key);
    }

    pub fn unsubscribe(&self, key: &ResourceKey) {
        self.registry.unsubscribe(key);
    }

    pub fn is_subscribed(&self, key: &ResourceKey) -> bool {
        self.registry.is_subscribed(key)
    }

    /// Why the server last refused `key`, until a later ack clears it.
    pub fn subscription_error(&self, key: &ResourceKey) -> Option<RealtimeError> {
        self.registry.rejection(key)
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> Registration {
        self.dispatcher.on(event, handler)
    }

    pub fn off(&self, event: &str, handler: &EventHandler) -> bool {
        self.dispatcher.off(event, handler)
    }

    /// Sends a user message. Not queued: fails with `NotConnected` when offline.
    pub fn emit(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        self.connection.send(event, payload)
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheChange> {
        self.reconciler.changes()
    }

    pub fn begin_fetch(&self, key: &ResourceKey) -> FetchTicket {
        self.reconciler.begin_fetch(key)
    }

    pub fn complete_fetch(&self, ticket: FetchTicket, entity: Value) {
        self.reconciler.complete_fetch(ticket, entity);
    }

    pub fn reconciler(&self) -> &UpdateReconciler {
        &self.reconciler
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        for registration in self.push_handlers.drain(..) {
            registration.unregister();
        }
        self.registry.detach();
        self.connection.shutdown();
    }
}

fn push_handler(reconciler: &Arc<UpdateReconciler>) -> EventHandler {
    let reconciler = Arc::clone(reconciler);
    handler(move |payload| match reconciler.apply_event(payload) {
        Ok(outcome) => {
            debug!(target = "riptide.client", ?outcome, "push applied");
            Ok(())
        }
        Err(err) => Err(HandlerError::new(format!("push dropped: {err}"))),
    })
}

/// Invalidates every held resource after pushes were lost, so readers refetch.
fn resync_handler(
    registry: &SubscriptionRegistry,
    reconciler: &Arc<UpdateReconciler>,
) -> EventHandler {
    let registry = registry.clone();
    let reconciler = Arc::clone(reconciler);
    handler(move |payload| {
        let keys: Vec<ResourceKey> = registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.ref_count > 0)
            .map(|entry| entry.key)
            .collect();
        warn!(
            target = "riptide.client",
            skipped = %payload["skipped"],
            resources = keys.len(),
            "pushes lost; invalidating subscribed resources"
        );
        for key in &keys {
            reconciler.invalidate(key);
        }
        Ok(())
    })
}
