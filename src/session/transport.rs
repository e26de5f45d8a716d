//! # Transport
//!
//! The bidirectional message stream to the remote agent.
//!
//! ## Contract:
//! `open` sends the setup message and returns only once the server has
//! acknowledged it (`setupComplete`), or fails. After that the link is three
//! channels:
//! - `outbound`: control messages (greeting, tool responses), never dropped
//! - `audio`: microphone frames, bounded; a frame that does not fit is dropped
//! - `inbound`: [`TransportEvent`]s from the server
//!
//! Control messages are written before queued audio. Dropping both senders
//! closes the stream.

use crate::config::SessionConfig;
use crate::error::{AppResult, SessionError};
use crate::session::protocol::{binary_frame_text, ClientMessage, SetupPayload};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// Microphone frames waiting for the socket. One tick in flight, nothing behind it.
pub const AUDIO_QUEUE_FRAMES: usize = 1;

/// Something that happened on the inbound side of an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One JSON message from the server
    Message(String),
    /// The server closed the stream, with its reason if it gave one
    Closed(Option<String>),
    /// The stream failed
    Error(String),
}

/// An open link to the remote agent.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub audio: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, send `setup`, and wait for the server to acknowledge it.
    async fn open(&self, setup: SetupPayload) -> AppResult<TransportLink>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gemini Live over a WebSocket.
pub struct WebSocketTransport {
    endpoint: String,
    api_key: String,
    setup_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            setup_timeout: Duration::from_secs(config.setup_timeout_secs),
        }
    }

    async fn await_setup_complete(ws: &mut WsStream) -> AppResult<()> {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(WsMessage::Text(text)) if text.contains("setupComplete") => return Ok(()),
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    if binary_frame_text(&data)?.contains("setupComplete") {
                        return Ok(());
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(SessionError::Transport(format!(
                        "closed before setup completed: {}",
                        close_reason(frame.as_ref()).unwrap_or_default()
                    )));
                }
                Err(e) => {
                    return Err(SessionError::Transport(format!("error before setup completed: {}", e)));
                }
                Ok(other) => debug!(frame = ?other, "Ignoring frame during setup"),
            }
        }
        Err(SessionError::Transport("stream ended before setup completed".to_string()))
    }

    /// `endpoint` with the API key appended as an escaped `key` query parameter.
    fn request_url(&self) -> AppResult<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| SessionError::Config(format!("invalid endpoint '{}': {}", self.endpoint, e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    async fn outbound_loop(
        mut control: mpsc::UnboundedReceiver<ClientMessage>,
        mut audio: mpsc::Receiver<ClientMessage>,
        mut sink: SplitSink<WsStream, WsMessage>,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                Some(message) = control.recv() => message,
                Some(message) = audio.recv() => message,
                else => break,
            };
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Dropping unserializable outbound message");
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::Text(json)).await {
                warn!(error = %e, "WebSocket send failed, closing outbound loop");
                return;
            }
        }

        // Both senders dropped: the session is over
        let _ = sink.send(WsMessage::Close(None)).await;
        debug!("Outbound loop terminated");
    }

    async fn inbound_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
        let terminal = loop {
            let event = match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => TransportEvent::Message(text),
                Some(Ok(WsMessage::Binary(data))) => match binary_frame_text(&data) {
                    Ok(text) => TransportEvent::Message(text.to_string()),
                    Err(e) => {
                        warn!(len = data.len(), error = %e, "Skipping non-JSON binary frame");
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break TransportEvent::Closed(close_reason(frame.as_ref()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                None => break TransportEvent::Closed(None),
            };

            if events.send(event).await.is_err() {
                debug!("Event receiver dropped, closing inbound loop");
                return;
            }
        };

        let _ = events.send(terminal).await;
        debug!("Inbound loop terminated");
    }
}

fn close_reason(frame: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>) -> Option<String> {
    frame
        .map(|f| f.reason.to_string())
        .filter(|reason| !reason.is_empty())
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, setup: SetupPayload) -> AppResult<TransportLink> {
        if self.api_key.is_empty() {
            return Err(SessionError::Config(
                "no API key configured (set GEMINI_API_KEY)".to_string(),
            ));
        }

        let url = self.request_url()?;
        info!(endpoint = %self.endpoint, model = %setup.model, "Connecting to remote agent");

        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Transport(format!("connect failed: {}", e)))?;

        let setup_json = ClientMessage::Setup(setup).to_json()?;
        ws.send(WsMessage::Text(setup_json))
            .await
            .map_err(|e| SessionError::Transport(format!("failed to send setup: {}", e)))?;

        match tokio::time::timeout(self.setup_timeout, Self::await_setup_complete(&mut ws)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::Transport(format!(
                    "setup not acknowledged within {}s",
                    self.setup_timeout.as_secs()
                )))
            }
        }
        info!("Remote agent setup complete");

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_FRAMES);
        let (event_tx, event_rx) = mpsc::channel(256);

        tokio::spawn(Self::outbound_loop(outbound_rx, audio_rx, sink));
        tokio::spawn(Self::inbound_loop(stream, event_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            audio: audio_tx,
            inbound: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    async fn local_config(listener: &TcpListener) -> SessionConfig {
        let addr = listener.local_addr().unwrap();
        let mut config = AppConfig::default().session;
        config.endpoint = format!("ws://{}", addr);
        config.api_key = "test-key".to_string();
        config.setup_timeout_secs = 2;
        config
    }

    fn check_request(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
        assert_eq!(req.uri().path(), "/");
        assert_eq!(req.uri().query(), Some("key=test-key"));
        Ok(resp)
    }

    fn setup() -> SetupPayload {
        SetupPayload::new(&AppConfig::default(), Vec::new())
    }

    #[tokio::test]
    async fn test_open_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener).await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, check_request).await.unwrap();

            let first = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(first.contains("\"setup\""));
            ws.send(WsMessage::Binary(br#"{"setupComplete":{}}"#.to_vec())).await.unwrap();

            let greeting = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(greeting.contains("\"text\":\"hello\""));
            let frame = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(frame.contains("audio/pcm;rate=16000"));
            ws.send(WsMessage::Binary(br#"{"serverContent":{"turnComplete":true}}"#.to_vec()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let transport = WebSocketTransport::new(&config);
        let mut link = transport.open(setup()).await.unwrap();
        link.outbound.send(ClientMessage::text("hello")).unwrap();
        link.audio
            .send(ClientMessage::audio("AAA=".into(), "audio/pcm;rate=16000".into()))
            .await
            .unwrap();

        assert_eq!(
            link.inbound.recv().await,
            Some(TransportEvent::Message(r#"{"serverContent":{"turnComplete":true}}"#.to_string()))
        );
        assert!(matches!(link.inbound.recv().await, Some(TransportEvent::Closed(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_times_out_without_setup_complete() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config(&listener).await;
        config.setup_timeout_secs = 1;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let result = WebSocketTransport::new(&config).open(setup()).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        server.abort();
    }

    #[test]
    fn test_request_url_escapes_key_and_keeps_query() {
        let mut config = AppConfig::default().session;
        config.endpoint = "ws://127.0.0.1:9000".to_string();
        config.api_key = "a b&c=d".to_string();
        let url = WebSocketTransport::new(&config).request_url().unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/?key=a+b%26c%3Dd");

        config.endpoint = "wss://example.test/ws/live?alt=json".to_string();
        config.api_key = "k".to_string();
        let url = WebSocketTransport::new(&config).request_url().unwrap();
        assert_eq!(url.as_str(), "wss://example.test/ws/live?alt=json&key=k");

        config.endpoint = "not a url".to_string();
        assert!(matches!(
            WebSocketTransport::new(&config).request_url(),
            Err(SessionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_open_requires_api_key() {
        let mut config = AppConfig::default().session;
        config.api_key.clear();
        let result = WebSocketTransport::new(&config).open(setup()).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
