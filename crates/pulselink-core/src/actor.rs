use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A peer is considered offline once its last liveness refresh is older
/// than this.
pub const OFFLINE_THRESHOLD_SECS: i64 = 120;

/// How often a live client refreshes its own `last_seen`. Must stay well
/// under `OFFLINE_THRESHOLD_SECS` so a live peer reads as online between
/// refreshes.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// How often peer status is re-evaluated for a session.
pub const STATUS_POLL_INTERVAL_SECS: u64 = 30;

pub const CODE_LEN: usize = 6;

/// Pairing-code alphabet. Codes get read aloud between people, so the
/// confusable glyphs I, L, O, 0 and 1 are left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ActorId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("pairing code must be {CODE_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("pairing code contains unsupported character '{0}'")]
    BadChar(char),
}

/// Short human-shareable code used to discover and link to one actor.
/// Stored and compared in normalized (uppercase) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PairingCode(String);

impl PairingCode {
    /// Normalize user input (trim, uppercase) and validate shape.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let normalized: String = input.trim().to_uppercase();
        if normalized.chars().count() != CODE_LEN {
            return Err(CodeError::BadLength(normalized.chars().count()));
        }
        for ch in normalized.chars() {
            if !ch.is_ascii_alphanumeric() {
                return Err(CodeError::BadChar(ch));
            }
        }
        Ok(Self(normalized))
    }

    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PairingCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PairingCode> for String {
    fn from(code: PairingCode) -> Self {
        code.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulsePattern {
    #[default]
    Gentle,
    Steady,
    Sync,
}

impl PulsePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gentle => "gentle",
            Self::Steady => "steady",
            Self::Sync => "sync",
        }
    }
}

impl FromStr for PulsePattern {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "gentle" => Ok(Self::Gentle),
            "steady" => Ok(Self::Steady),
            "sync" => Ok(Self::Sync),
            other => Err(format!("unknown pulse pattern '{other}'")),
        }
    }
}

/// Visual settings owned by one actor's UI. Replicated to the registry so
/// a returning client restores them; never consulted by pairing or
/// presence logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub color: String,
    pub intensity: u8,
    pub pattern: PulsePattern,
    pub sound_enabled: bool,
}

impl Preferences {
    /// Intensity is a 0-100 percentage.
    pub fn clamped(mut self) -> Self {
        self.intensity = self.intensity.min(100);
        self
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            color: "#ff6b9d".to_string(),
            intensity: 70,
            pattern: PulsePattern::Gentle,
            sound_enabled: false,
        }
    }
}

/// The ephemeral body of a pulse: the sender's preferences snapshot plus
/// the send time. Never persisted anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulsePayload {
    pub preferences: Preferences,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRecord {
    pub id: ActorId,
    pub pairing_code: PairingCode,
    pub peer_id: Option<ActorId>,
    pub last_seen: DateTime<Utc>,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    /// Derived on read, never stored: online iff the last refresh is more
    /// recent than the offline threshold.
    pub fn derive(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now - last_seen < Duration::seconds(OFFLINE_THRESHOLD_SECS) {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}
