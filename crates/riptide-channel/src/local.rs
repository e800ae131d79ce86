use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    Channel, ChannelError, ChannelEvent, ChannelResult, Token, WireEvent, DEFAULT_EVENT_CAPACITY,
};

/// What the next [`LocalChannel::open`] call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Emit `Connected`.
    Accept,
    /// Emit `Error { detail }`.
    Fail(String),
    /// Return [`ChannelError::Unauthorized`].
    Reject(String),
    /// Emit nothing; the caller's connect timeout has to fire.
    Hang,
}

#[derive(Debug, Default)]
struct LocalState {
    open: bool,
    script: VecDeque<OpenOutcome>,
    sent: Vec<WireEvent>,
    opens: usize,
    last_token: Option<Token>,
}

/// In-memory channel for tests and non-network embedders.
///
/// Outbound frames are recorded instead of written anywhere; the test plays
/// the server by injecting pushes and connection drops.
#[derive(Debug)]
pub struct LocalChannel {
    events: broadcast::Sender<ChannelEvent>,
    state: Mutex<LocalState>,
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity.max(1)).0,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Queues the outcome of a future `open` call. Unscripted opens accept.
    pub fn script_open(&self, outcome: OpenOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    pub fn script_opens(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Plays a server push.
    pub fn deliver(&self, event: &str, payload: serde_json::Value) {
        self.emit(ChannelEvent::Message(WireEvent::new(event, payload)));
    }

    /// Simulates the peer closing the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.state.lock().open = false;
        self.emit(ChannelEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Simulates a transport error on an established connection.
    pub fn fail_connection(&self, detail: &str) {
        self.state.lock().open = false;
        self.emit(ChannelEvent::Error {
            detail: detail.to_string(),
        });
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn sent(&self) -> Vec<WireEvent> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<WireEvent> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn last_token(&self) -> Option<Token> {
        self.state.lock().last_token.clone()
    }

    fn emit(&self, event: ChannelEvent) {
        // No receivers simply means nobody is listening yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn open(&self, token: &Token) -> ChannelResult<()> {
        let outcome = {
            let mut state = self.state.lock();
            state.opens += 1;
            state.last_token = Some(token.clone());
            let outcome = state.script.pop_front().unwrap_or(OpenOutcome::Accept);
            if outcome == OpenOutcome::Accept {
                state.open = true;
            }
            outcome
        };
        trace!(target = "riptide.channel", ?outcome, "local open");
        match outcome {
            OpenOutcome::Accept => self.emit(ChannelEvent::Connected),
            OpenOutcome::Fail(detail) => self.emit(ChannelEvent::Error { detail }),
            OpenOutcome::Reject(reason) => return Err(ChannelError::Unauthorized(reason)),
            OpenOutcome::Hang => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().open = false;
    }

    fn send(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        state.sent.push(WireEvent::new(event, payload));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn accepts_by_default_and_records_sends() {
        let channel = LocalChannel::new();
        let mut rx = channel.subscribe();

        assert_eq!(
            channel.send("early", json!(1)),
            Err(ChannelError::NotConnected)
        );

        channel.open(&Token::new("t")).await.expect("open");
        assert_eq!(rx.recv().await.expect("event"), ChannelEvent::Connected);
        assert!(channel.is_open());

        channel.send("comment", json!({"body": "hi"})).expect("send");
        assert_eq!(
            channel.take_sent(),
            vec![WireEvent::new("comment", json!({"body": "hi"}))]
        );
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn scripted_outcomes_apply_in_order() {
        let channel = LocalChannel::new();
        let mut rx = channel.subscribe();
        channel.script_opens([
            OpenOutcome::Fail("refused".into()),
            OpenOutcome::Reject("expired".into()),
        ]);

        channel.open(&Token::new("a")).await.expect("open initiates");
        assert_eq!(
            rx.recv().await.expect("event"),
            ChannelEvent::Error {
                detail: "refused".into()
            }
        );

        let err = channel.open(&Token::new("b")).await.expect_err("rejected");
        assert_eq!(err, ChannelError::Unauthorized("expired".into()));
        assert_eq!(channel.open_count(), 2);
        assert_eq!(channel.last_token(), Some(Token::new("b")));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn drop_connection_closes_and_reports() {
        let channel = LocalChannel::new();
        channel.open(&Token::new("t")).await.expect("open");
        let mut rx = channel.subscribe();

        channel.deliver("resource_update", json!({"resourceKey": "ticket:1"}));
        channel.drop_connection("server restart");

        assert!(matches!(rx.recv().await, Ok(ChannelEvent::Message(_))));
        assert_eq!(
            rx.recv().await.expect("event"),
            ChannelEvent::Disconnected {
                reason: "server restart".into()
            }
        );
        assert!(!channel.is_open());
    }
}
