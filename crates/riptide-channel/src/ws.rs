use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    Channel, ChannelError, ChannelEvent, ChannelResult, Token, WireEvent, DEFAULT_EVENT_CAPACITY,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// WebSocket implementation of [`Channel`].
///
/// Frames are JSON text messages shaped like [`WireEvent`]. The credential is
/// passed as a `token` query parameter.
pub struct WsChannel {
    url: Url,
    events: broadcast::Sender<ChannelEvent>,
    session: Mutex<Option<Session>>,
}

impl WsChannel {
    pub fn new(url: &str) -> ChannelResult<Self> {
        Self::with_capacity(url, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(url: &str, capacity: usize) -> ChannelResult<Self> {
        let url = Url::parse(url).map_err(|err| ChannelError::Transport(err.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ChannelError::Transport(format!(
                    "unsupported url scheme {other}"
                )))
            }
        }
        Ok(Self {
            url,
            events: broadcast::channel(capacity.max(1)).0,
            session: Mutex::new(None),
        })
    }

    fn endpoint(&self, token: &Token) -> Url {
        let mut endpoint = self.url.clone();
        endpoint.query_pairs_mut().append_pair("token", token.as_str());
        endpoint
    }

    fn teardown(&self) {
        if let Some(session) = self.session.lock().take() {
            let _ = session.outbound.send(Message::Close(None));
            session.task.abort();
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn open(&self, token: &Token) -> ChannelResult<()> {
        self.teardown();
        let endpoint = self.endpoint(token);
        debug!(target = "riptide.channel", host = ?self.url.host_str(), "opening websocket");

        let stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                return Err(ChannelError::Unauthorized(format!(
                    "handshake refused with status {}",
                    response.status()
                )));
            }
            Err(err) => {
                let _ = self.events.send(ChannelEvent::Error {
                    detail: err.to_string(),
                });
                return Ok(());
            }
        };

        let (outbound, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(stream, rx, self.events.clone()));
        *self.session.lock() = Some(Session { outbound, task });
        let _ = self.events.send(ChannelEvent::Connected);
        Ok(())
    }

    async fn close(&self) {
        self.teardown();
    }

    fn send(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()> {
        let text = serde_json::to_string(&WireEvent::new(event, payload))
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(ChannelError::NotConnected)?;
        session
            .outbound
            .send(Message::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

async fn run_session(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Sender<ChannelEvent>,
) {
    let (mut sink, mut source) = stream.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(err) = sink.send(message).await {
                debug!(target = "riptide.channel", error = %err, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let lifecycle = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WireEvent>(&text) {
                Ok(frame) => {
                    let _ = events.send(ChannelEvent::Message(frame));
                }
                Err(err) => {
                    warn!(target = "riptide.channel", error = %err, "dropping undecodable frame");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|frame| frame.reason.into_owned())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by peer".to_string());
                break ChannelEvent::Disconnected { reason };
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                break ChannelEvent::Error {
                    detail: err.to_string(),
                }
            }
            None => {
                break ChannelEvent::Disconnected {
                    reason: "stream ended".to_string(),
                }
            }
        }
    };

    writer.abort();
    let _ = events.send(lifecycle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            WsChannel::new("http://example.com/realtime"),
            Err(ChannelError::Transport(_))
        ));
        assert!(matches!(
            WsChannel::new("not a url"),
            Err(ChannelError::Transport(_))
        ));
    }

    #[test]
    fn endpoint_carries_token_query() {
        let channel = WsChannel::new("wss://push.example.com/realtime?v=2").expect("channel");
        let endpoint = channel.endpoint(&Token::new("abc def"));
        assert_eq!(
            endpoint.as_str(),
            "wss://push.example.com/realtime?v=2&token=abc+def"
        );
    }

    #[test]
    fn send_before_open_is_not_connected() {
        let channel = WsChannel::new("ws://127.0.0.1:9/realtime").expect("channel");
        assert_eq!(
            channel.send("ping", serde_json::Value::Null),
            Err(ChannelError::NotConnected)
        );
    }
}
