//! Wire codecs: typed frames ⇄ WebSocket text messages.
//!
//! Two protocols are supported:
//!
//! - [`GeminiLiveCodec`] speaks the Gemini Live `BidiGenerateContent` JSON
//!   messages (setup handshake, `realtimeInput` audio, `serverContent`).
//! - [`TaggedCodec`] speaks a minimal `{"type": ...}` framing with the tags
//!   `audio`, `interrupt`, `end-of-turn` outbound and `audio`,
//!   `turn-complete`, `interrupted`, `error` inbound.
//!
//! Audio payloads are little-endian 16-bit PCM, base64-encoded inside JSON.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::CodecError;
use crate::audio::AudioChunk;
use crate::config::{SessionConfig, WireProtocol};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// What the session asks a codec to put on the wire.
#[derive(Debug, Clone, Copy)]
pub enum OutboundFrame<'a> {
    Audio(&'a AudioChunk),
    /// Ask the model to abandon the response it is generating. Protocols
    /// whose server detects barge-in by itself put nothing on the wire.
    Interrupt,
    /// The user stopped talking.
    EndOfTurn,
}

/// What a codec found in one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    SetupComplete,
    Audio { payload: Bytes, sample_rate: u32 },
    TurnComplete,
    Interrupted,
    Error(String),
}

/// Converts between frames and the text messages of one protocol.
pub trait FrameCodec: Send + Sync {
    /// First message sent after the socket opens; `None` if the protocol has
    /// no handshake and audio may flow immediately.
    fn setup_message(&self) -> Result<Option<String>, CodecError>;

    /// `None` when the protocol has no message for `frame`.
    fn encode(&self, frame: OutboundFrame<'_>) -> Result<Option<String>, CodecError>;

    /// One message may carry several frames, or none worth reporting.
    fn decode(&self, message: &[u8]) -> Result<Vec<InboundFrame>, CodecError>;
}

/// Build the codec selected by `session.protocol`.
pub fn codec_for(session: &SessionConfig, default_output_rate: u32) -> Box<dyn FrameCodec> {
    match session.protocol {
        WireProtocol::GeminiLive => Box::new(GeminiLiveCodec::new(
            session.model.clone(),
            session.instructions.clone(),
            default_output_rate,
        )),
        WireProtocol::Tagged => Box::new(TaggedCodec::new(default_output_rate)),
    }
}

// ---------------------------------------------------------------------------
// Gemini Live
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum GeminiClientMessage<'a> {
    Setup(GeminiSetup<'a>),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiSetup<'a> {
    model: String,
    generation_config: GenerationConfig,
    realtime_input_config: RealtimeInputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputConfig {
    automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Serialize)]
struct AutomaticActivityDetection {
    disabled: bool,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_chunks: Vec<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_stream_end: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

#[derive(Deserialize)]
struct GeminiError {
    message: Option<String>,
}

/// Gemini Live `BidiGenerateContent` protocol.
///
/// The session runs with the server's automatic activity detection on: user
/// turns end with `audioStreamEnd`, and the server notices barge-in from the
/// forwarded speech and answers with `serverContent.interrupted`. Explicit
/// `activityStart`/`activityEnd` signals are rejected in that mode, so
/// [`OutboundFrame::Interrupt`] encodes to nothing.
#[derive(Debug, Clone)]
pub struct GeminiLiveCodec {
    model: String,
    instructions: Option<String>,
    default_output_rate: u32,
}

impl GeminiLiveCodec {
    /// `model` may be given with or without the `models/` prefix.
    pub fn new(model: String, instructions: Option<String>, default_output_rate: u32) -> Self {
        Self {
            model,
            instructions,
            default_output_rate,
        }
    }

    fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

impl FrameCodec for GeminiLiveCodec {
    fn setup_message(&self) -> Result<Option<String>, CodecError> {
        let setup = GeminiSetup {
            model: self.model_path(),
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection { disabled: false },
            },
            system_instruction: self.instructions.as_deref().map(|text| Content {
                parts: [TextPart { text }],
            }),
        };
        Ok(Some(serde_json::to_string(&GeminiClientMessage::Setup(
            setup,
        ))?))
    }

    fn encode(&self, frame: OutboundFrame<'_>) -> Result<Option<String>, CodecError> {
        let input = match frame {
            OutboundFrame::Audio(chunk) => RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: format!("audio/pcm;rate={}", chunk.sample_rate()),
                    data: BASE64_STANDARD.encode(chunk.payload()),
                }],
                ..RealtimeInput::default()
            },
            OutboundFrame::Interrupt => return Ok(None),
            OutboundFrame::EndOfTurn => RealtimeInput {
                audio_stream_end: Some(true),
                ..RealtimeInput::default()
            },
        };
        Ok(Some(serde_json::to_string(
            &GeminiClientMessage::RealtimeInput(input),
        )?))
    }

    fn decode(&self, message: &[u8]) -> Result<Vec<InboundFrame>, CodecError> {
        let msg: GeminiServerMessage = serde_json::from_slice(message)?;
        let mut frames = Vec::new();

        if msg.setup_complete.is_some() {
            frames.push(InboundFrame::SetupComplete);
        }
        if let Some(content) = msg.server_content {
            let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
            for inline in parts.into_iter().filter_map(|p| p.inline_data) {
                let sample_rate = inline
                    .mime_type
                    .as_deref()
                    .and_then(pcm_rate)
                    .unwrap_or(self.default_output_rate);
                let payload = BASE64_STANDARD.decode(inline.data.as_bytes())?;
                frames.push(InboundFrame::Audio {
                    payload: Bytes::from(payload),
                    sample_rate,
                });
            }
            if content.interrupted {
                frames.push(InboundFrame::Interrupted);
            }
            if content.turn_complete {
                frames.push(InboundFrame::TurnComplete);
            }
        }
        if let Some(go_away) = msg.go_away {
            let left = go_away.time_left.unwrap_or_else(|| "unknown".into());
            frames.push(InboundFrame::Error(format!(
                "server is going away (time left: {left})"
            )));
        }
        if let Some(error) = msg.error {
            frames.push(InboundFrame::Error(
                error.message.unwrap_or_else(|| "unspecified error".into()),
            ));
        }
        Ok(frames)
    }
}

/// Parse the `rate=` parameter of an `audio/pcm;rate=24000` MIME type.
fn pcm_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

// ---------------------------------------------------------------------------
// Tagged
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TaggedFrame {
    Audio {
        data: String,
        #[serde(rename = "sampleRate", default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },
    Interrupt,
    EndOfTurn,
    TurnComplete,
    Interrupted,
    Error {
        message: String,
    },
}

/// Minimal tagged framing with no handshake.
#[derive(Debug, Clone)]
pub struct TaggedCodec {
    default_output_rate: u32,
}

impl TaggedCodec {
    pub fn new(default_output_rate: u32) -> Self {
        Self {
            default_output_rate,
        }
    }
}

impl FrameCodec for TaggedCodec {
    fn setup_message(&self) -> Result<Option<String>, CodecError> {
        Ok(None)
    }

    fn encode(&self, frame: OutboundFrame<'_>) -> Result<Option<String>, CodecError> {
        let tagged = match frame {
            OutboundFrame::Audio(chunk) => TaggedFrame::Audio {
                data: BASE64_STANDARD.encode(chunk.payload()),
                sample_rate: Some(chunk.sample_rate()),
            },
            OutboundFrame::Interrupt => TaggedFrame::Interrupt,
            OutboundFrame::EndOfTurn => TaggedFrame::EndOfTurn,
        };
        Ok(Some(serde_json::to_string(&tagged)?))
    }

    fn decode(&self, message: &[u8]) -> Result<Vec<InboundFrame>, CodecError> {
        let frame = match serde_json::from_slice::<TaggedFrame>(message)? {
            TaggedFrame::Audio { data, sample_rate } => InboundFrame::Audio {
                payload: Bytes::from(BASE64_STANDARD.decode(data.as_bytes())?),
                sample_rate: sample_rate.unwrap_or(self.default_output_rate),
            },
            TaggedFrame::TurnComplete => InboundFrame::TurnComplete,
            TaggedFrame::Interrupted => InboundFrame::Interrupted,
            TaggedFrame::Error { message } => InboundFrame::Error(message),
            TaggedFrame::Interrupt | TaggedFrame::EndOfTurn => {
                return Err(CodecError::Unexpected(
                    "client control frame received from server".into(),
                ))
            }
        };
        Ok(vec![frame])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn gemini() -> GeminiLiveCodec {
        GeminiLiveCodec::new("gemini-2.0-flash-exp".into(), None, 24_000)
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    fn encoded(codec: &dyn FrameCodec, frame: OutboundFrame<'_>) -> Value {
        parse(&codec.encode(frame).unwrap().expect("frame has a wire form"))
    }

    #[test]
    fn gemini_setup_names_model_and_audio_modality() {
        let setup = parse(&gemini().setup_message().unwrap().unwrap());
        assert_eq!(
            setup,
            json!({
                "setup": {
                    "model": "models/gemini-2.0-flash-exp",
                    "generationConfig": { "responseModalities": ["AUDIO"] },
                    "realtimeInputConfig": {
                        "automaticActivityDetection": { "disabled": false }
                    }
                }
            })
        );
    }

    #[test]
    fn gemini_setup_carries_instructions() {
        let codec = GeminiLiveCodec::new(
            "models/custom".into(),
            Some("Be brief.".into()),
            24_000,
        );
        let setup = parse(&codec.setup_message().unwrap().unwrap());
        assert_eq!(setup["setup"]["model"], "models/custom");
        assert_eq!(
            setup["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn gemini_audio_is_base64_pcm_media_chunk() {
        let chunk = AudioChunk::from_samples(&[1, 2], 16_000, 0);
        let msg = encoded(&gemini(), OutboundFrame::Audio(&chunk));
        let media = &msg["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], BASE64_STANDARD.encode([1u8, 0, 2, 0]));
    }

    #[test]
    fn gemini_control_frames_match_automatic_activity_detection() {
        let codec = gemini();
        let setup = parse(&codec.setup_message().unwrap().unwrap());
        assert_eq!(
            setup["setup"]["realtimeInputConfig"]["automaticActivityDetection"]["disabled"],
            false
        );

        // audioStreamEnd is the end-of-turn signal in automatic mode.
        let end = encoded(&codec, OutboundFrame::EndOfTurn);
        assert_eq!(end, json!({ "realtimeInput": { "audioStreamEnd": true } }));

        // Manual activity signals are refused in automatic mode; the server
        // detects barge-in from the speech itself.
        assert_eq!(codec.encode(OutboundFrame::Interrupt).unwrap(), None);
    }

    #[test]
    fn gemini_decodes_setup_ack() {
        let frames = gemini().decode(br#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(frames, vec![InboundFrame::SetupComplete]);
    }

    #[test]
    fn gemini_decodes_audio_parts_then_turn_complete() {
        let data = BASE64_STANDARD.encode([0u8, 1, 2, 3]);
        let msg = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": data } },
                    { "text": "ignored" },
                    { "inlineData": { "data": data } }
                ]},
                "turnComplete": true
            }
        });
        let frames = gemini().decode(msg.to_string().as_bytes()).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0],
            InboundFrame::Audio {
                payload: Bytes::from_static(&[0, 1, 2, 3]),
                sample_rate: 24_000
            }
        );
        assert!(matches!(frames[1], InboundFrame::Audio { .. }));
        assert_eq!(frames[2], InboundFrame::TurnComplete);
    }

    #[test]
    fn gemini_reads_rate_from_mime_type() {
        let data = BASE64_STANDARD.encode([0u8, 0]);
        let msg = json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm; rate=16000", "data": data } }
        ]}}});
        match &gemini().decode(msg.to_string().as_bytes()).unwrap()[0] {
            InboundFrame::Audio { sample_rate, .. } => assert_eq!(*sample_rate, 16_000),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn gemini_interrupted_and_go_away() {
        let frames = gemini()
            .decode(br#"{"serverContent":{"interrupted":true}}"#)
            .unwrap();
        assert_eq!(frames, vec![InboundFrame::Interrupted]);

        let frames = gemini().decode(br#"{"goAway":{"timeLeft":"5s"}}"#).unwrap();
        assert!(matches!(&frames[0], InboundFrame::Error(m) if m.contains("5s")));
    }

    #[test]
    fn gemini_unknown_messages_yield_nothing() {
        let frames = gemini()
            .decode(br#"{"usageMetadata":{"totalTokenCount":3}}"#)
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn gemini_rejects_bad_base64() {
        let msg = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"@@@"}}]}}}"#;
        assert!(matches!(
            gemini().decode(msg),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn tagged_frames_use_type_tag() {
        let codec = TaggedCodec::new(24_000);
        assert_eq!(codec.setup_message().unwrap(), None);
        assert_eq!(
            encoded(&codec, OutboundFrame::EndOfTurn),
            json!({ "type": "end-of-turn" })
        );
        assert_eq!(
            encoded(&codec, OutboundFrame::Interrupt),
            json!({ "type": "interrupt" })
        );
        let chunk = AudioChunk::from_samples(&[7], 16_000, 0);
        assert_eq!(
            encoded(&codec, OutboundFrame::Audio(&chunk)),
            json!({ "type": "audio", "data": BASE64_STANDARD.encode([7u8, 0]), "sampleRate": 16000 })
        );
    }

    #[test]
    fn tagged_decodes_inbound_tags() {
        let codec = TaggedCodec::new(24_000);
        assert_eq!(
            codec.decode(br#"{"type":"turn-complete"}"#).unwrap(),
            vec![InboundFrame::TurnComplete]
        );
        assert_eq!(
            codec.decode(br#"{"type":"interrupted"}"#).unwrap(),
            vec![InboundFrame::Interrupted]
        );
        assert_eq!(
            codec.decode(br#"{"type":"error","message":"quota"}"#).unwrap(),
            vec![InboundFrame::Error("quota".into())]
        );
        let audio = codec.decode(br#"{"type":"audio","data":"AAA="}"#).unwrap();
        assert_eq!(
            audio,
            vec![InboundFrame::Audio {
                payload: Bytes::from_static(&[0, 0]),
                sample_rate: 24_000
            }]
        );
    }

    #[test]
    fn tagged_rejects_client_tags_and_unknown_types() {
        let codec = TaggedCodec::new(24_000);
        assert!(matches!(
            codec.decode(br#"{"type":"interrupt"}"#),
            Err(CodecError::Unexpected(_))
        ));
        assert!(matches!(
            codec.decode(br#"{"type":"hello"}"#),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn codec_for_follows_protocol() {
        let mut session = SessionConfig::default();
        assert!(codec_for(&session, 24_000).setup_message().unwrap().is_some());
        session.protocol = WireProtocol::Tagged;
        assert!(codec_for(&session, 24_000).setup_message().unwrap().is_none());
    }
}
