//! Wire protocol between a client session and the relay hub. Frames are
//! JSON envelopes carried as WebSocket text messages.

use crate::actor::{ActorId, PairingCode, Preferences, PulsePayload};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "1";
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Sender id the hub uses for frames it originates itself.
pub const HUB_SENDER_ID: &str = "pulselink-hub";

pub mod error_codes {
    pub const CODE_NOT_FOUND: &str = "code_not_found";
    pub const SELF_LINK: &str = "self_link";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_CODE: &str = "invalid_code";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const LINK_FAILED: &str = "link_failed";
    pub const UNEXPECTED_HELLO: &str = "unexpected_hello";
    pub const UNEXPECTED_MESSAGE: &str = "unexpected_message";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    pub version: String,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(sender_id: impl Into<String>, msg: WireMsg) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    // client -> hub
    Hello(HelloPayload),
    Link(LinkPayload),
    Unlink(UnlinkPayload),
    Pulse(PulseFrame),
    Heartbeat(HeartbeatPayload),
    StatusPoll(StatusPollPayload),
    SetPreferences(SetPreferencesPayload),
    // hub -> client
    Welcome(WelcomePayload),
    LinkChanged(LinkChangedPayload),
    PeerStatus(PeerStatusPayload),
    Error(ErrorPayload),
}

/// First frame on every connection. `actor_id` is the locally retained
/// identity, absent on a client's very first appearance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    #[serde(default)]
    pub actor_id: Option<ActorId>,
}

/// The code travels as a raw string so the hub can answer a typed
/// `invalid_code` error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkPayload {
    pub code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnlinkPayload {}

/// Inbound pulses leave `from_id` empty (the session identifies the
/// sender); the hub fills it on delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PulseFrame {
    #[serde(default)]
    pub from_id: Option<ActorId>,
    pub payload: PulsePayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPollPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetPreferencesPayload {
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub actor: ActorSnapshot,
}

/// What a client needs to know about its own record after handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorSnapshot {
    pub id: ActorId,
    pub pairing_code: PairingCode,
    #[serde(default)]
    pub peer_id: Option<ActorId>,
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkChangedPayload {
    #[serde(default)]
    pub peer_id: Option<ActorId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerStatusPayload {
    #[serde(default)]
    pub peer_id: Option<ActorId>,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

pub fn validate_envelope(envelope: &WireEnvelope) -> Result<(), &'static str> {
    if envelope.version.is_empty() || envelope.sender_id.is_empty() || envelope.timestamp.is_empty()
    {
        return Err("missing_required_fields");
    }
    if envelope.version != PROTOCOL_VERSION {
        return Err("unsupported_version");
    }
    if chrono::DateTime::parse_from_rfc3339(&envelope.timestamp).is_err() {
        return Err("invalid_timestamp");
    }
    Ok(())
}

/// Best-effort peek at the `type` field of a raw frame, for log context
/// on frames that fail full deserialization.
pub fn frame_type(raw: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
}
