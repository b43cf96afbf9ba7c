pub mod actor;
pub mod wire;

pub use actor::{
    ActorId, ActorRecord, PairingCode, Preferences, PresenceStatus, PulsePattern, PulsePayload,
    CODE_LEN, HEARTBEAT_INTERVAL_SECS, OFFLINE_THRESHOLD_SECS, STATUS_POLL_INTERVAL_SECS,
};
