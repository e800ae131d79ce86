use std::fmt;

use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Errored,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Errored => "errored",
        };
        f.write_str(label)
    }
}

/// Why the connection is (or just went) down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// `disconnect()` was called.
    Manual,
    /// No credential, or the server refused it. Not retried automatically.
    Unauthenticated,
    /// Automatic retries are used up; only an explicit `connect()` tries again.
    RetriesExhausted { attempts: u32 },
    /// A single attempt or an established connection failed.
    Channel(String),
}

impl ConnectionFailure {
    /// Failures that stop automatic reconnection and need user action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionFailure::Unauthenticated | ConnectionFailure::RetriesExhausted { .. }
        )
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFailure::Manual => f.write_str("disconnected by client"),
            ConnectionFailure::Unauthenticated => f.write_str("unauthenticated"),
            ConnectionFailure::RetriesExhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            ConnectionFailure::Channel(detail) => f.write_str(detail),
        }
    }
}

/// Snapshot published to connection observers on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connection.
    pub attempts: u32,
    pub failure: Option<ConnectionFailure>,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, attempts: u32, failure: Option<ConnectionFailure>) -> Self {
        Self {
            state,
            attempts,
            failure,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The failure as an error a UI can show. `None` while healthy and after a
    /// manual disconnect.
    pub fn error(&self) -> Option<RealtimeError> {
        match self.failure.as_ref()? {
            ConnectionFailure::Manual => None,
            ConnectionFailure::Unauthenticated => Some(RealtimeError::Unauthenticated),
            other => Some(RealtimeError::Connection(other.to_string())),
        }
    }

    /// Disconnected for a reason that needs a manual retry.
    pub fn needs_manual_retry(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.failure.as_ref().is_some_and(ConnectionFailure::is_terminal)
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected, 0, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failures_need_manual_retry() {
        let exhausted = ConnectionStatus::new(
            ConnectionState::Disconnected,
            3,
            Some(ConnectionFailure::RetriesExhausted { attempts: 3 }),
        );
        assert!(exhausted.needs_manual_retry());

        let manual = ConnectionStatus::new(
            ConnectionState::Disconnected,
            0,
            Some(ConnectionFailure::Manual),
        );
        assert!(!manual.needs_manual_retry());
        assert!(!ConnectionStatus::default().needs_manual_retry());
    }

    #[test]
    fn failures_map_to_user_visible_errors() {
        let exhausted = ConnectionStatus::new(
            ConnectionState::Disconnected,
            3,
            Some(ConnectionFailure::RetriesExhausted { attempts: 3 }),
        );
        let err = exhausted.error().expect("exhausted is an error");
        assert_eq!(err, RealtimeError::Connection("gave up after 3 attempts".into()));
        assert!(err.is_user_visible());

        let rejected = ConnectionStatus::new(
            ConnectionState::Disconnected,
            0,
            Some(ConnectionFailure::Unauthenticated),
        );
        assert_eq!(rejected.error(), Some(RealtimeError::Unauthenticated));

        let manual = ConnectionStatus::new(
            ConnectionState::Disconnected,
            0,
            Some(ConnectionFailure::Manual),
        );
        assert_eq!(manual.error(), None);
        assert_eq!(ConnectionStatus::default().error(), None);
    }
}
