//! Persistent WebSocket control connection
//!
//! The connection drives an explicit `ConnectionHandler` (open / message /
//! tick / error / close). Frames are read and handled one at a time, so a
//! handler never sees two messages concurrently.

use crate::protocol::Outbound;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Authenticated,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("reposerver URL is not an http(s) URL: {0}")]
    InvalidUrl(String),
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("connection is closed")]
    Closed,
}

/// Outbound side of the connection as seen by a handler.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, message: &Outbound) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait ConnectionHandler: Send {
    async fn on_open(&mut self, out: &dyn Outbox);

    async fn on_message(&mut self, out: &dyn Outbox, text: &str);

    /// Called on every tick of the connection loop while open.
    async fn on_tick(&mut self, _out: &dyn Outbox) {}

    async fn on_error(&mut self, error: &ChannelError);

    async fn on_close(&mut self, code: Option<u16>, reason: &str);
}

/// `http://host` becomes `ws://host/ws`, `https://host` becomes `wss://host/ws`.
pub fn websocket_url(server_url: &str) -> Result<String, ChannelError> {
    let trimmed = server_url.trim().trim_end_matches('/');
    let url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ChannelError::InvalidUrl(server_url.to_string()));
    };
    Ok(format!("{url}/ws"))
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsOutbox {
    sink: Mutex<WsSink>,
}

impl WsOutbox {
    fn new(sink: WsSink) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl Outbox for WsOutbox {
    async fn send(&self, message: &Outbound) -> Result<(), ChannelError> {
        let text = message.to_json();
        debug!("Sending: {}", text);
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

pub struct ControlConnection {
    url: String,
    tick: Duration,
}

impl ControlConnection {
    pub fn new(url: String, tick: Duration) -> Self {
        Self { url, tick }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect and drive `handler` until the connection ends.
    pub async fn run<H>(&self, handler: &mut H) -> Result<(), ChannelError>
    where
        H: ConnectionHandler + ?Sized,
    {
        let (stream, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                let error = ChannelError::Connect {
                    url: self.url.clone(),
                    reason: e.to_string(),
                };
                handler.on_error(&error).await;
                return Err(error);
            }
        };

        info!("Opening connection with reposerver: {}", self.url);
        let (sink, mut reader) = stream.split();
        let outbox = WsOutbox::new(sink);
        handler.on_open(&outbox).await;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.tick().await;

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => handler.on_message(&outbox, &text).await,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handler.on_message(&outbox, &text).await,
                        Err(_) => debug!("Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (Some(u16::from(frame.code)), frame.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        handler.on_close(code, &reason).await;
                        outbox.close().await;
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let error = ChannelError::Transport(e.to_string());
                        handler.on_error(&error).await;
                        return Err(error);
                    }
                    None => {
                        handler.on_close(None, "stream ended").await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => handler.on_tick(&outbox).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(websocket_url("https://repo.example.com").unwrap(), "wss://repo.example.com/ws");
        assert_eq!(websocket_url("http://10.0.0.1:8080/").unwrap(), "ws://10.0.0.1:8080/ws");
        assert!(matches!(websocket_url("ftp://repo"), Err(ChannelError::InvalidUrl(_))));
    }

    struct Recorder {
        errors: Vec<String>,
    }

    #[async_trait]
    impl ConnectionHandler for Recorder {
        async fn on_open(&mut self, _out: &dyn Outbox) {}
        async fn on_message(&mut self, _out: &dyn Outbox, _text: &str) {}
        async fn on_error(&mut self, error: &ChannelError) {
            self.errors.push(error.to_string());
        }
        async fn on_close(&mut self, _code: Option<u16>, _reason: &str) {}
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_handler() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connection = ControlConnection::new(format!("ws://127.0.0.1:{port}/ws"), Duration::from_secs(5));
        let mut recorder = Recorder { errors: Vec::new() };
        let result = connection.run(&mut recorder).await;

        assert!(matches!(result, Err(ChannelError::Connect { .. })));
        assert_eq!(recorder.errors.len(), 1);
    }
}
