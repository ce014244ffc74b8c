//! # Session WebSocket
//!
//! Live view of the voice session for the dashboard. Clients connect to `/ws/session`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current snapshot is pushed immediately
//! 2. **Updates**: a new `snapshot` message on every state, transcript or playback change
//! 3. **Lifecycle**: `transition`, `transcript` and `cleanup` messages as the controller
//!    reports them; `cleanup` carries the outcome of each closing step
//! 4. **Commands**: clients send `{"type": "start"}`, `{"type": "stop"}` or
//!    `{"type": "acknowledge"}`
//! 5. **Heartbeat**: protocol pings every 30 s; a client silent for 60 s is dropped
//!
//! Closing the socket does not stop the voice session; the session belongs to the
//! process, not to a dashboard tab.

use crate::session::transcript::TranscriptTurn;
use crate::session::{
    CleanupReport, SessionEvent, SessionSnapshot, SessionState, VoiceSessionHandle,
};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages a dashboard client sends.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketMessage {
    Start,
    Stop,
    Acknowledge,
    /// Application-level ping for clients that cannot send protocol pings
    Ping { timestamp: u64 },
}

/// Messages pushed to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot(SessionSnapshot),
    Transition { from: SessionState, to: SessionState },
    Transcript(TranscriptTurn),
    Cleanup(CleanupReport),
    Pong { timestamp: u64 },
    Error { code: String, message: String },
}

pub struct SessionWebSocket {
    voice: VoiceSessionHandle,
    last_heartbeat: Instant,
}

impl SessionWebSocket {
    pub fn new(voice: VoiceSessionHandle) -> Self {
        Self {
            voice,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize WebSocket message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_command(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let command = match serde_json::from_str::<WebSocketMessage>(text) {
            Ok(command) => command,
            Err(err) => {
                self.send_error(ctx, "invalid_json", &format!("Invalid message: {}", err));
                return;
            }
        };

        debug!(?command, "Dashboard command received");
        let result = match command {
            WebSocketMessage::Start => self.voice.start(),
            WebSocketMessage::Stop => self.voice.stop(),
            WebSocketMessage::Acknowledge => self.voice.acknowledge(),
            WebSocketMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                self.send(ctx, &ServerMessage::Pong { timestamp });
                Ok(())
            }
        };

        if let Err(err) = result {
            self.send_error(ctx, "session_unavailable", &err.to_string());
        }
    }
}

impl Actor for SessionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Session WebSocket connected");

        ctx.add_stream(WatchStream::new(self.voice.subscribe()));
        ctx.add_stream(BroadcastStream::new(self.voice.events()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Session WebSocket disconnected");
    }
}

/// Snapshots from the controller's watch channel.
impl StreamHandler<SessionSnapshot> for SessionWebSocket {
    fn handle(&mut self, snapshot: SessionSnapshot, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::Snapshot(snapshot));
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        warn!("Voice session controller stopped, closing WebSocket");
        ctx.stop();
    }
}

/// Lifecycle events from the controller's broadcast channel.
impl StreamHandler<Result<SessionEvent, BroadcastStreamRecvError>> for SessionWebSocket {
    fn handle(
        &mut self,
        event: Result<SessionEvent, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        let message = match event {
            Ok(SessionEvent::StateChanged { from, to }) => ServerMessage::Transition { from, to },
            Ok(SessionEvent::TranscriptUpdated(turn)) => ServerMessage::Transcript(turn),
            Ok(SessionEvent::CleanupCompleted(report)) => ServerMessage::Cleanup(report),
            Err(err) => {
                warn!("Dashboard fell behind on session events: {}", err);
                return;
            }
        };
        self.send(ctx, &message);
    }

    // The snapshot stream ends at the same time and closes the socket.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_command(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary messages are not supported");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/session` to a WebSocket.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New session WebSocket from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(SessionWebSocket::new(app_state.voice.clone()), &req, stream)
}
