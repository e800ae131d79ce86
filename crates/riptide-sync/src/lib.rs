//! Realtime subscription and cache synchronization.
//!
//! One [`ConnectionManager`] owns the push channel. The
//! [`SubscriptionRegistry`] keeps reference-counted, debounced subscriptions
//! and replays them after every reconnect. Incoming events fan out through the
//! [`EventDispatcher`]; push updates land in the [`UpdateReconciler`], which
//! drops redeliveries and merges the rest into a [`CacheStore`].
//! [`RealtimeClient`] wires all of it together.

pub mod auth;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod optimistic;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod state;

pub use auth::{CredentialProvider, SharedToken};
pub use backoff::Backoff;
pub use cache::{CacheChange, CacheChangeKind, CacheEntry, CacheStore, MemoryCache};
pub use client::RealtimeClient;
pub use config::RealtimeConfig;
pub use connection::{ConnectionManager, ConnectionPolicy, StateObserver};
pub use dispatcher::{
    handler, DispatchReport, EventDispatcher, EventHandler, HandlerError, HandlerResult,
    Registration,
};
pub use error::{MergeError, RealtimeError, RealtimeResult};
pub use ledger::UpdateLedger;
pub use optimistic::{mutate_with_rollback, Optimistic};
pub use protocol::{PushUpdate, ResourceKey, SubscriptionOp, SubscriptionRequest, UpdateId};
pub use reconciler::{ApplyOutcome, FetchTicket, FieldAliases, UpdateReconciler};
pub use registry::{SubscriptionRegistry, SubscriptionSnapshot};
pub use state::{ConnectionFailure, ConnectionState, ConnectionStatus};

pub use riptide_channel::{Channel, ChannelError, ChannelEvent, LocalChannel, Token, WireEvent};
