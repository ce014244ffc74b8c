//! # Live Agent Channel
//!
//! `AgentConnector` over a real WebSocket (tokio-tungstenite). One task per session
//! multiplexes three things:
//! - outbound audio frames from the capture encoder
//! - inbound agent messages, translated into `TransportEvent`s
//! - a local close request from the controller
//!
//! The task ends on the first of: local close, socket close, socket error. Only the
//! last two produce a terminal event; a local close is silent because the
//! controller already knows.

use crate::config::SharedConfig;
use crate::error::VoiceError;
use crate::transport::protocol::{parse_server_message, ClientMessage};
use crate::transport::{
    AgentConnector, SessionEndpoint, SessionHandle, SessionSetup, TransportEvent,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct LiveAgentConnector {
    config: SharedConfig,
}

impl LiveAgentConnector {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentConnector for LiveAgentConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<SessionHandle, VoiceError> {
        let (endpoint, api_key, capacity, horizon) = {
            let config = self.config.read();
            (
                config.agent.endpoint.clone(),
                config.agent.api_key.clone(),
                config.audio.send_queue_capacity,
                config.send_horizon(),
            )
        };

        if api_key.is_empty() {
            warn!("No API key configured; the agent will most likely refuse the session");
        }

        info!(
            endpoint = %endpoint,
            model = %setup.model,
            voice = %setup.voice,
            "Connecting to agent"
        );
        let url = format!("{}?key={}", endpoint, api_key);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| VoiceError::Transport(format!("connect failed: {}", e)))?;

        let (mut write, read) = socket.split();
        let setup_message = ClientMessage::setup(setup).to_json()?;
        write
            .send(Message::Text(setup_message))
            .await
            .map_err(|e| VoiceError::Transport(format!("setup failed: {}", e)))?;
        debug!("Session setup sent, waiting for agent");

        let (handle, session_endpoint) = SessionHandle::channel(capacity, horizon);
        tokio::spawn(run_channel(write, read, session_endpoint, events));
        Ok(handle)
    }
}

async fn run_channel(
    mut write: SplitSink<AgentSocket, Message>,
    mut read: SplitStream<AgentSocket>,
    mut endpoint: SessionEndpoint,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let close_signal = endpoint.close_signal();

    let terminal = loop {
        tokio::select! {
            _ = close_signal.wait() => {
                debug!("Agent channel closed locally");
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
            frame = endpoint.next_frame() => {
                let Some(frame) = frame else {
                    // Handle dropped without an explicit close.
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                };
                let text = match ClientMessage::audio(&frame).to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    break Some(TransportEvent::Error(e.to_string()));
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(text.as_bytes(), &events),
                Some(Ok(Message::Binary(bytes))) => dispatch(&bytes, &events),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    info!(reason = ?reason, "Agent closed the session");
                    break Some(TransportEvent::Closed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Agent channel error: {}", e);
                    break Some(TransportEvent::Error(e.to_string()));
                }
                None => break Some(TransportEvent::Closed),
            }
        }
    };

    endpoint.mark_closed();
    if let Some(event) = terminal {
        let _ = events.send(event);
    }
}

fn dispatch(payload: &[u8], events: &mpsc::UnboundedSender<TransportEvent>) {
    match parse_server_message(payload) {
        Ok(parsed) => {
            for event in parsed {
                let _ = events.send(event);
            }
        }
        Err(e) => warn!("Ignoring unparseable agent message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{FrameCodec, FrameFormat};
    use crate::config::AppConfig;
    use crate::transport::SendOutcome;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(3);

    type AgentEnd = WebSocketStream<TcpStream>;

    /// Bind a local agent and return a connector pointed at it, plus the accept task.
    async fn local_agent() -> (LiveAgentConnector, JoinHandle<AgentEnd>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept_async(stream).await.unwrap()
        });

        let mut config = AppConfig::default();
        config.agent.endpoint = format!("ws://{}/live", addr);
        config.agent.api_key = "test-key".to_string();
        (LiveAgentConnector::new(Arc::new(RwLock::new(config))), accept)
    }

    async fn open_session() -> (
        SessionHandle,
        mpsc::UnboundedReceiver<TransportEvent>,
        AgentEnd,
        SessionSetup,
    ) {
        let (connector, accept) = local_agent().await;
        let setup = AppConfig::default().session_setup();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = timeout(WAIT, connector.connect(&setup, tx)).await.unwrap().unwrap();
        let agent = accept.await.unwrap();
        (handle, rx, agent, setup)
    }

    async fn next_text(agent: &mut AgentEnd) -> serde_json::Value {
        let message = timeout(WAIT, agent.next()).await.unwrap().unwrap().unwrap();
        serde_json::from_str(&message.into_text().unwrap()).unwrap()
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Option<TransportEvent> {
        timeout(WAIT, rx.recv()).await.unwrap()
    }

    #[tokio::test]
    async fn test_setup_first_then_audio_then_remote_close() {
        let (handle, mut rx, mut agent, setup) = open_session().await;

        let first = next_text(&mut agent).await;
        assert_eq!(first["setup"]["model"], setup.model.as_str());
        assert_eq!(first["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");

        let frame = FrameCodec::encode_outbound(&[0.25; 64], FrameFormat::pcm16(16000, 1));
        let sender = handle.sender();
        assert_eq!(sender.send(frame.clone()), SendOutcome::Queued);
        let audio = next_text(&mut agent).await;
        let chunk = &audio["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], frame.data());

        agent
            .send(Message::Text(r#"{"setupComplete": {}}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut rx).await, Some(TransportEvent::Open));

        agent.close(None).await.unwrap();
        assert_eq!(next_event(&mut rx).await, Some(TransportEvent::Closed));
        assert_eq!(next_event(&mut rx).await, None);
        assert_eq!(sender.send(frame), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_socket_error_is_reported_once() {
        let (handle, mut rx, mut agent, _) = open_session().await;
        next_text(&mut agent).await;

        // A server frame with a reserved control opcode.
        agent.get_mut().write_all(&[0x8B, 0x00]).await.unwrap();
        agent.get_mut().flush().await.unwrap();

        assert!(matches!(next_event(&mut rx).await, Some(TransportEvent::Error(_))));
        assert_eq!(next_event(&mut rx).await, None);
        let frame = FrameCodec::encode_outbound(&[0.0; 8], FrameFormat::pcm16(16000, 1));
        assert_eq!(handle.sender().send(frame), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_local_close_is_silent() {
        let (handle, mut rx, mut agent, _) = open_session().await;
        next_text(&mut agent).await;
        let sender = handle.sender();

        assert!(handle.close());
        let message = timeout(WAIT, agent.next()).await.unwrap().unwrap().unwrap();
        assert!(message.is_close());

        // The channel task ends without a terminal event.
        assert_eq!(next_event(&mut rx).await, None);
        let frame = FrameCodec::encode_outbound(&[0.0; 8], FrameFormat::pcm16(16000, 1));
        assert_eq!(sender.send(frame), SendOutcome::Closed);
    }
}
