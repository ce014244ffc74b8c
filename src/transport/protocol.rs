//! # Agent Channel Protocol
//!
//! JSON messages exchanged with the remote agent over the WebSocket.
//!
//! ## Client → Agent:
//! ```json
//! {"setup": {"model": "...", "generationConfig": {"responseModalities": ["AUDIO"], ...}}}
//! {"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}
//! ```
//!
//! ## Agent → Client:
//! ```json
//! {"setupComplete": {}}
//! {"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "..."}}]}}}
//! {"serverContent": {"inputTranscription": {"text": "..."}}}
//! {"serverContent": {"outputTranscription": {"text": "..."}}}
//! {"serverContent": {"interrupted": true}}
//! {"serverContent": {"turnComplete": true}}
//! {"goAway": {"timeLeft": "10s"}}
//! ```

use crate::audio::codec::WireFrame;
use crate::error::VoiceError;
use crate::transport::{SessionSetup, Speaker, TransportEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const AUDIO_MODALITY: &str = "AUDIO";

/// Messages this side sends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Presence enables transcription; there are no options.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        ClientMessage::Setup(SetupPayload {
            model: setup.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![AUDIO_MODALITY.to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            input_audio_transcription: setup.input_transcription.then(|| TranscriptionConfig {}),
            output_audio_transcription: setup.output_transcription.then(|| TranscriptionConfig {}),
        })
    }

    pub fn audio(frame: &WireFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.mime_type(),
                data: frame.data().to_string(),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Translate one agent message into transport events, in delivery order.
///
/// A message may carry several things at once (audio plus a transcript delta);
/// each becomes its own event. Unknown fields are ignored.
pub fn parse_server_message(payload: &[u8]) -> Result<Vec<TransportEvent>, VoiceError> {
    let message: ServerMessage = serde_json::from_slice(payload)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Open);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    events.push(TransportEvent::AudioDelta {
                        mime_type: inline.mime_type,
                        data: inline.data,
                    });
                }
            }
        }

        let transcripts = [
            (Speaker::User, content.input_transcription),
            (Speaker::Agent, content.output_transcription),
        ];
        for (speaker, transcription) in transcripts {
            if let Some(text) = transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
                events.push(TransportEvent::TranscriptDelta { speaker, text });
            }
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        warn!(time_left = ?go_away.time_left, "Agent announced it will close the session");
    }

    if events.is_empty() {
        debug!("Agent message produced no events");
    }
    Ok(events)
}
