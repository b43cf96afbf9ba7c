//! Actor registry backed by sqlite: one row per actor holding its pairing
//! code, nullable peer pointer, liveness timestamp and preferences.
//! Pairing (link/unlink) runs as a single transaction here so the
//! symmetric-link invariant is never observable half-applied.

use chrono::{DateTime, SecondsFormat, Utc};
use pulselink_core::{ActorId, ActorRecord, PairingCode, Preferences, PulsePattern};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

const CODE_RETRY_LIMIT: usize = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("corrupt actor id in store: {0}")]
    Id(String),
    #[error("corrupt pairing code in store: {0}")]
    Code(String),
    #[error("corrupt pulse pattern in store: {0}")]
    Pattern(String),
    #[error("actor row missing: {0}")]
    MissingActor(String),
    #[error("could not allocate a unique pairing code after {attempts} attempts")]
    CodeGeneration { attempts: usize },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("no actor holds that pairing code")]
    CodeNotFound,
    #[error("an actor cannot link to itself")]
    SelfLink,
    #[error("unknown actor {0}")]
    NotFound(ActorId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of a successful `link`: both partners, plus any actors whose
/// previous link got replaced and who now need an unlink notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub requester: ActorId,
    pub peer: ActorId,
    pub displaced: Vec<ActorId>,
}

pub struct ActorStore {
    conn: Connection,
}

impl ActorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_actors.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Idempotent upsert: a known id returns its stored row untouched
    /// (including `last_seen`); an unknown or absent id inserts a fresh
    /// actor with a newly generated pairing code.
    pub fn create_or_load(&self, local_id: Option<ActorId>) -> Result<ActorRecord, StorageError> {
        if let Some(id) = local_id {
            if let Some(existing) = self.get(&id)? {
                return Ok(existing);
            }
        }

        let id = local_id.unwrap_or_else(ActorId::generate);
        let prefs = Preferences::default();
        let mut rng = rand::thread_rng();

        for _ in 0..CODE_RETRY_LIMIT {
            let code = PairingCode::generate(&mut rng);
            let now = fmt_ts(Utc::now());
            let inserted = self.conn.execute(
                "INSERT INTO actors
                     (id, pairing_code, peer_id, last_seen,
                      color, intensity, pattern, sound_enabled,
                      created_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?3, ?3)",
                params![
                    id.to_string(),
                    code.as_str(),
                    now,
                    prefs.color,
                    prefs.intensity as i64,
                    prefs.pattern.as_str(),
                    prefs.sound_enabled,
                ],
            );
            match inserted {
                Ok(_) => {
                    return self
                        .get(&id)?
                        .ok_or_else(|| StorageError::MissingActor(id.to_string()))
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // Either a concurrent first call won the insert for
                    // this id, or the generated code collided.
                    if let Some(existing) = self.get(&id)? {
                        return Ok(existing);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StorageError::CodeGeneration {
            attempts: CODE_RETRY_LIMIT,
        })
    }

    pub fn get(&self, id: &ActorId) -> Result<Option<ActorRecord>, StorageError> {
        self.conn
            .query_row(
                &format!("{SELECT_ACTOR} WHERE id = ?1"),
                params![id.to_string()],
                row_to_actor,
            )
            .optional()?
            .transpose()
    }

    /// Exact match on the stored (normalized) code; `PairingCode::parse`
    /// already handled case folding on the way in.
    pub fn find_by_code(&self, code: &PairingCode) -> Result<Option<ActorRecord>, StorageError> {
        self.conn
            .query_row(
                &format!("{SELECT_ACTOR} WHERE pairing_code = ?1"),
                params![code.as_str()],
                row_to_actor,
            )
            .optional()?
            .transpose()
    }

    /// Liveness refresh. `last_seen` never moves backwards, so a delayed
    /// heartbeat cannot shadow a fresher one.
    pub fn touch_last_seen(&self, id: &ActorId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let ts = fmt_ts(now);
        self.conn.execute(
            "UPDATE actors SET last_seen = ?2, updated_at = ?2
             WHERE id = ?1 AND last_seen < ?2",
            params![id.to_string(), ts],
        )?;
        Ok(())
    }

    /// Raw pointer write. Symmetry is the resolver's job; use `link` and
    /// `unlink` unless you are the resolver.
    pub fn set_peer(&self, id: &ActorId, peer: Option<&ActorId>) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE actors SET peer_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                peer.map(ActorId::to_string),
                fmt_ts(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::MissingActor(id.to_string()));
        }
        Ok(())
    }

    pub fn update_preferences(
        &self,
        id: &ActorId,
        prefs: &Preferences,
    ) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE actors
             SET color = ?2, intensity = ?3, pattern = ?4, sound_enabled = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                id.to_string(),
                prefs.color,
                prefs.intensity as i64,
                prefs.pattern.as_str(),
                prefs.sound_enabled,
                fmt_ts(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::MissingActor(id.to_string()));
        }
        Ok(())
    }

    /// Resolve a code and establish a symmetric link in one transaction.
    /// An existing link on either side is replaced, and the displaced
    /// partner's pointer is cleared in the same transaction so it never
    /// dangles. Any failed write rolls the whole thing back.
    pub fn link(
        &self,
        requester: &ActorId,
        code: &PairingCode,
    ) -> Result<LinkOutcome, PairingError> {
        let tx = self.conn.unchecked_transaction().map_err(StorageError::from)?;

        let target = self.find_by_code(code)?.ok_or(PairingError::CodeNotFound)?;
        if target.id == *requester {
            return Err(PairingError::SelfLink);
        }
        let requester_row = self
            .get(requester)?
            .ok_or(PairingError::NotFound(*requester))?;

        if requester_row.peer_id == Some(target.id) {
            // Already linked to each other; nothing to rewrite.
            return Ok(LinkOutcome {
                requester: *requester,
                peer: target.id,
                displaced: Vec::new(),
            });
        }

        let mut displaced = Vec::new();
        if let Some(old) = requester_row.peer_id {
            displaced.push(old);
        }
        if let Some(old) = target.peer_id {
            if old != *requester {
                displaced.push(old);
            }
        }
        for actor in &displaced {
            self.clear_peer_in_tx(actor)?;
        }

        self.write_peer_in_tx(requester, &target.id)?;
        self.write_peer_in_tx(&target.id, requester)?;

        tx.commit().map_err(StorageError::from)?;
        Ok(LinkOutcome {
            requester: *requester,
            peer: target.id,
            displaced,
        })
    }

    /// Clear the link on both sides. Idempotent: an already-unlinked
    /// actor is a no-op (`Ok(None)`). Returns the former peer so callers
    /// can notify it.
    pub fn unlink(&self, id: &ActorId) -> Result<Option<ActorId>, PairingError> {
        let tx = self.conn.unchecked_transaction().map_err(StorageError::from)?;

        let row = self.get(id)?.ok_or(PairingError::NotFound(*id))?;
        let Some(peer) = row.peer_id else {
            return Ok(None);
        };

        self.clear_peer_in_tx(id)?;
        // Only clear the peer's pointer if it actually points back; the
        // peer's row is the only record of the relationship.
        self.conn
            .execute(
                "UPDATE actors SET peer_id = NULL, updated_at = ?3
                 WHERE id = ?1 AND peer_id = ?2",
                params![peer.to_string(), id.to_string(), fmt_ts(Utc::now())],
            )
            .map_err(StorageError::from)?;

        tx.commit().map_err(StorageError::from)?;
        Ok(Some(peer))
    }

    fn clear_peer_in_tx(&self, id: &ActorId) -> Result<(), PairingError> {
        let updated = self
            .conn
            .execute(
                "UPDATE actors SET peer_id = NULL, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .map_err(StorageError::from)?;
        if updated == 0 {
            return Err(StorageError::MissingActor(id.to_string()).into());
        }
        Ok(())
    }

    fn write_peer_in_tx(&self, id: &ActorId, peer: &ActorId) -> Result<(), PairingError> {
        let updated = self
            .conn
            .execute(
                "UPDATE actors SET peer_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), peer.to_string(), fmt_ts(Utc::now())],
            )
            .map_err(StorageError::from)?;
        if updated == 0 {
            return Err(StorageError::MissingActor(id.to_string()).into());
        }
        Ok(())
    }
}

const SELECT_ACTOR: &str = "SELECT id, pairing_code, peer_id, last_seen,
        color, intensity, pattern, sound_enabled, created_at, updated_at
 FROM actors";

/// Fixed-width UTC timestamps so lexicographic order in SQL matches
/// chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

fn row_to_actor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ActorRecord, StorageError>> {
    let id: String = row.get(0)?;
    let code: String = row.get(1)?;
    let peer: Option<String> = row.get(2)?;
    let last_seen: String = row.get(3)?;
    let color: String = row.get(4)?;
    let intensity: i64 = row.get(5)?;
    let pattern: String = row.get(6)?;
    let sound_enabled: bool = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(build_actor(
        id,
        code,
        peer,
        last_seen,
        color,
        intensity,
        pattern,
        sound_enabled,
        created_at,
        updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_actor(
    id: String,
    code: String,
    peer: Option<String>,
    last_seen: String,
    color: String,
    intensity: i64,
    pattern: String,
    sound_enabled: bool,
    created_at: String,
    updated_at: String,
) -> Result<ActorRecord, StorageError> {
    let id = id
        .parse::<ActorId>()
        .map_err(|err| StorageError::Id(format!("{id}: {err}")))?;
    let peer_id = peer
        .map(|raw| {
            raw.parse::<ActorId>()
                .map_err(|err| StorageError::Id(format!("{raw}: {err}")))
        })
        .transpose()?;
    let pairing_code =
        PairingCode::parse(&code).map_err(|err| StorageError::Code(format!("{code}: {err}")))?;
    let pattern = pattern
        .parse::<PulsePattern>()
        .map_err(StorageError::Pattern)?;

    Ok(ActorRecord {
        id,
        pairing_code,
        peer_id,
        last_seen: parse_ts(&last_seen)?,
        preferences: Preferences {
            color,
            intensity: intensity.clamp(0, 100) as u8,
            pattern,
            sound_enabled,
        },
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}
