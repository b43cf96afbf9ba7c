//! Session registry and frame routing. Every connected client gets a
//! mailbox keyed by its actor id; pulses fan out only to the sessions of
//! the one peer they are addressed to.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pulselink_core::wire::{
    error_codes, validate_envelope, ActorSnapshot, HelloPayload, PulseFrame, WelcomePayload,
    WireEnvelope, WireMsg, HUB_SENDER_ID, MAX_ENVELOPE_BYTES,
};
use pulselink_core::{ActorId, ActorRecord, PairingCode, STATUS_POLL_INTERVAL_SECS};
use pulselink_storage::{ActorStore, PairingError, StorageError};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

const MAILBOX_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub debug: bool,
    pub stale_after: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub status_poll_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debug: false,
            stale_after: Duration::from_secs(180),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(2),
            status_poll_interval: Duration::from_secs(STATUS_POLL_INTERVAL_SECS),
        }
    }
}

/// What a session mailbox carries: protocol frames, plus the keepalive
/// pings the write task turns into `Message::Ping`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(WireEnvelope),
    Ping,
}

/// One connected client. Several sessions may share an actor id (the
/// same person with two tabs open); each gets its own mailbox.
pub struct SessionHandle {
    pub conn_id: String,
    pub actor_id: ActorId,
    sender: mpsc::Sender<Outbound>,
    last_seen: AsyncMutex<Instant>,
    closed_tx: watch::Sender<bool>,
}

impl SessionHandle {
    pub async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    pub async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    pub async fn send(&self, envelope: WireEnvelope) -> bool {
        self.sender.send(Outbound::Frame(envelope)).await.is_ok()
    }

    pub async fn ping(&self) -> bool {
        self.sender.send(Outbound::Ping).await.is_ok()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

pub struct HubState {
    pub(crate) config: HubConfig,
    pub(crate) store: AsyncMutex<ActorStore>,
    conn_counter: AtomicU64,
    sessions: RwLock<HashMap<ActorId, HashMap<String, Arc<SessionHandle>>>>,
}

impl HubState {
    pub fn new(config: HubConfig, store: ActorStore) -> Self {
        Self {
            config,
            store: AsyncMutex::new(store),
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("sess-{id}")
    }

    /// Handshake half of a connection: resolve (or mint) the actor and
    /// register the session mailbox for it.
    pub async fn open_session(
        &self,
        hello: &HelloPayload,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<(Arc<SessionHandle>, ActorRecord), StorageError> {
        let actor = {
            let store = self.store.lock().await;
            store.create_or_load(hello.actor_id)?
        };

        let session = Arc::new(SessionHandle {
            conn_id: self.next_conn_id(),
            actor_id: actor.id,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
            closed_tx: watch::channel(false).0,
        });

        self.sessions
            .write()
            .await
            .entry(actor.id)
            .or_default()
            .insert(session.conn_id.clone(), session.clone());

        info!(
            event = "session_opened",
            conn_id = %session.conn_id,
            actor_id = %actor.id,
            linked = actor.peer_id.is_some()
        );
        Ok((session, actor))
    }

    pub async fn remove_session(&self, session: &SessionHandle, reason: &str) {
        session.close();
        let mut removed = false;
        {
            let mut sessions = self.sessions.write().await;
            if let Some(entries) = sessions.get_mut(&session.actor_id) {
                removed = entries.remove(&session.conn_id).is_some();
                if entries.is_empty() {
                    sessions.remove(&session.actor_id);
                }
            }
        }
        if removed {
            info!(
                event = "session_closed",
                conn_id = %session.conn_id,
                actor_id = %session.actor_id,
                reason = reason
            );
        }
    }

    pub async fn actor(&self, actor_id: &ActorId) -> Result<Option<ActorRecord>, StorageError> {
        let store = self.store.lock().await;
        store.get(actor_id)
    }

    async fn sessions_for(&self, actor_id: &ActorId) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(actor_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Best-effort fan-out to every active session of one actor. No
    /// active session means the frame is simply dropped.
    async fn deliver(&self, actor_id: &ActorId, envelope: WireEnvelope) {
        for session in self.sessions_for(actor_id).await {
            if !session.send(envelope.clone()).await {
                warn!(event = "delivery_failed", conn_id = %session.conn_id);
                self.remove_session(&session, "delivery_failed").await;
            }
        }
    }

    pub async fn handle_frame(&self, session: &Arc<SessionHandle>, envelope: WireEnvelope) {
        session.touch().await;
        let request_id = envelope.request_id.clone();
        match envelope.msg {
            WireMsg::Link(payload) => {
                let code = match PairingCode::parse(&payload.code) {
                    Ok(code) => code,
                    Err(err) => {
                        self.send_error(
                            session,
                            error_codes::INVALID_CODE,
                            &err.to_string(),
                            request_id,
                        )
                        .await;
                        return;
                    }
                };
                let outcome = {
                    let store = self.store.lock().await;
                    store.link(&session.actor_id, &code)
                };
                match outcome {
                    Ok(outcome) => {
                        info!(
                            event = "linked",
                            requester = %outcome.requester,
                            peer = %outcome.peer,
                            displaced = outcome.displaced.len()
                        );
                        self.deliver(&outcome.requester, link_changed(Some(outcome.peer)))
                            .await;
                        self.deliver(&outcome.peer, link_changed(Some(outcome.requester)))
                            .await;
                        for actor in &outcome.displaced {
                            self.deliver(actor, link_changed(None)).await;
                        }
                    }
                    Err(err) => {
                        warn!(event = "link_rejected", actor_id = %session.actor_id, error = %err);
                        self.send_error(session, pairing_error_code(&err), &err.to_string(), request_id)
                            .await;
                    }
                }
            }
            WireMsg::Unlink(_) => {
                let result = {
                    let store = self.store.lock().await;
                    store.unlink(&session.actor_id)
                };
                match result {
                    Ok(Some(former)) => {
                        info!(event = "unlinked", actor_id = %session.actor_id, former = %former);
                        self.deliver(&session.actor_id, link_changed(None)).await;
                        self.deliver(&former, link_changed(None)).await;
                    }
                    Ok(None) => {
                        debug!(event = "unlink_noop", actor_id = %session.actor_id);
                    }
                    Err(err) => {
                        warn!(event = "unlink_rejected", actor_id = %session.actor_id, error = %err);
                        self.send_error(session, pairing_error_code(&err), &err.to_string(), request_id)
                            .await;
                    }
                }
            }
            WireMsg::Pulse(frame) => {
                let row = match self.actor(&session.actor_id).await {
                    Ok(Some(row)) => row,
                    Ok(None) => {
                        self.send_error(
                            session,
                            error_codes::NOT_FOUND,
                            "unknown actor",
                            request_id,
                        )
                        .await;
                        return;
                    }
                    Err(err) => {
                        warn!(event = "pulse_lookup_failed", actor_id = %session.actor_id, error = %err);
                        return;
                    }
                };
                let out = WireEnvelope::new(
                    HUB_SENDER_ID,
                    WireMsg::Pulse(PulseFrame {
                        from_id: Some(session.actor_id),
                        payload: pulselink_core::PulsePayload {
                            preferences: frame.payload.preferences.clamped(),
                            sent_at: frame.payload.sent_at,
                        },
                    }),
                );
                match row.peer_id {
                    Some(peer) => {
                        debug!(event = "pulse_routed", from = %session.actor_id, to = %peer);
                        self.deliver(&peer, out).await;
                    }
                    None => {
                        // Unlinked sender: local echo so the UI can still
                        // react, never fanned out to anyone else.
                        debug!(event = "pulse_echo", actor_id = %session.actor_id);
                        self.deliver(&session.actor_id, out).await;
                    }
                }
            }
            WireMsg::Heartbeat(_) => {
                let result = {
                    let store = self.store.lock().await;
                    store.touch_last_seen(&session.actor_id, Utc::now())
                };
                // Best-effort: a failed refresh is retried on the next
                // timer tick, never surfaced to the client.
                if let Err(err) = result {
                    warn!(event = "heartbeat_failed", actor_id = %session.actor_id, error = %err);
                }
            }
            WireMsg::StatusPoll(_) => match self.peer_status_of(&session.actor_id).await {
                Ok(status) => {
                    let env = WireEnvelope::new(HUB_SENDER_ID, WireMsg::PeerStatus(status))
                        .with_request_id(request_id);
                    if !session.send(env).await {
                        self.remove_session(session, "delivery_failed").await;
                    }
                }
                Err(err) => {
                    warn!(event = "status_poll_failed", actor_id = %session.actor_id, error = %err);
                }
            },
            WireMsg::SetPreferences(payload) => {
                let prefs = payload.preferences.clamped();
                let result = {
                    let store = self.store.lock().await;
                    store.update_preferences(&session.actor_id, &prefs)
                };
                if let Err(err) = result {
                    warn!(event = "preferences_update_failed", actor_id = %session.actor_id, error = %err);
                    self.send_error(
                        session,
                        error_codes::NOT_FOUND,
                        &err.to_string(),
                        request_id,
                    )
                    .await;
                }
            }
            WireMsg::Hello(_) => {
                self.send_error(
                    session,
                    error_codes::UNEXPECTED_HELLO,
                    "hello is only valid as the first frame",
                    request_id,
                )
                .await;
            }
            WireMsg::Welcome(_)
            | WireMsg::LinkChanged(_)
            | WireMsg::PeerStatus(_)
            | WireMsg::Error(_) => {
                warn!(event = "unexpected_message", conn_id = %session.conn_id);
                self.send_error(
                    session,
                    error_codes::UNEXPECTED_MESSAGE,
                    "hub-originated frame sent by client",
                    request_id,
                )
                .await;
            }
        }
    }

    pub async fn send_error(
        &self,
        session: &SessionHandle,
        code: &str,
        message: &str,
        request_id: Option<String>,
    ) {
        let envelope = WireEnvelope::new(
            HUB_SENDER_ID,
            WireMsg::Error(pulselink_core::wire::ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
        .with_request_id(request_id);
        let _ = session.send(envelope).await;
    }

    /// Close sessions that stopped sending anything (frames or
    /// heartbeats) for longer than the stale window.
    pub fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_after.is_zero() {
            return;
        }
        let stale_after = self.config.stale_after;
        let interval = stale_after / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let all: Vec<Arc<SessionHandle>> = {
                    let sessions = self.sessions.read().await;
                    sessions
                        .values()
                        .flat_map(|entries| entries.values().cloned())
                        .collect()
                };
                for session in all {
                    if session.last_seen().await.elapsed() > stale_after {
                        warn!(event = "stale_close", conn_id = %session.conn_id);
                        self.remove_session(&session, "stale").await;
                    }
                }
            }
        });
    }

    /// Keepalive pings for one session. Pong replies count as activity
    /// in the read loop, so a quiet but reachable client never trips the
    /// stale reaper.
    pub fn start_ping(self: Arc<Self>, session: Arc<SessionHandle>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut closed = session.closed();
            loop {
                tokio::select! {
                    _ = closed.changed() => return,
                    _ = ticker.tick() => {}
                }
                if session.is_closed() {
                    return;
                }
                if !session.ping().await {
                    warn!(event = "ping_failed", conn_id = %session.conn_id);
                    self.remove_session(&session, "ping_failed").await;
                    return;
                }
            }
        });
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(MAILBOX_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let message = match out {
                    Outbound::Frame(envelope) => match serde_json::to_string(&envelope) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            warn!(event = "encode_error", error = %err);
                            continue;
                        }
                    },
                    Outbound::Ping => Message::Ping(Vec::new()),
                };
                let send = ws_sender.send(message);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    // Timed-out or failed writes end the session; the
                    // dropped receiver makes later sends fail fast.
                    _ => return,
                }
            }
        });

        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return,
        };
        let data = match message_bytes(first) {
            Some(bytes) => bytes,
            None => return,
        };
        if data.len() > MAX_ENVELOPE_BYTES {
            warn!(event = "hello_too_large", size = data.len());
            return;
        }
        let envelope: WireEnvelope = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hello_parse", error = %err);
                return;
            }
        };
        if let Err(err) = validate_envelope(&envelope) {
            warn!(event = "hello_envelope", error = err);
            return;
        }
        let hello = match envelope.msg {
            WireMsg::Hello(payload) => payload,
            _ => {
                warn!(event = "expected_hello");
                return;
            }
        };

        let (session, actor) = match self.open_session(&hello, tx.clone()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "handshake_failed", error = %err);
                return;
            }
        };

        let welcome = WireEnvelope::new(
            HUB_SENDER_ID,
            WireMsg::Welcome(WelcomePayload {
                actor: snapshot(&actor),
            }),
        );
        if !session.send(welcome).await {
            self.remove_session(&session, "delivery_failed").await;
            return;
        }
        if let Ok(status) = self.peer_status_of(&session.actor_id).await {
            let env = WireEnvelope::new(HUB_SENDER_ID, WireMsg::PeerStatus(status));
            let _ = session.send(env).await;
        }
        self.clone().start_ping(session.clone());
        self.clone().start_status_ticker(session.clone());

        let mut closed = session.closed();
        loop {
            if session.is_closed() {
                break;
            }
            let msg = tokio::select! {
                _ = closed.changed() => break,
                next = ws_receiver.next() => match next {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %session.conn_id, error = %err);
                        break;
                    }
                    None => break,
                },
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %session.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    session.touch().await;
                    continue;
                }
            };
            if data.len() > MAX_ENVELOPE_BYTES {
                warn!(event = "message_too_large", conn_id = %session.conn_id, size = data.len());
                continue;
            }
            if self.config.debug {
                debug!(event = "message_received", conn_id = %session.conn_id, raw = %String::from_utf8_lossy(&data));
            }
            let envelope: WireEnvelope = match serde_json::from_slice(&data) {
                Ok(value) => value,
                Err(err) => {
                    let kind = pulselink_core::wire::frame_type(&data).unwrap_or_default();
                    warn!(event = "message_invalid", conn_id = %session.conn_id, r#type = %kind, error = %err);
                    continue;
                }
            };
            if let Err(err) = validate_envelope(&envelope) {
                warn!(event = "message_invalid", conn_id = %session.conn_id, error = err);
                continue;
            }
            self.handle_frame(&session, envelope).await;
        }

        self.remove_session(&session, "disconnect").await;
        drop(tx);
        let _ = write_task.await;
    }
}

fn snapshot(actor: &ActorRecord) -> ActorSnapshot {
    ActorSnapshot {
        id: actor.id,
        pairing_code: actor.pairing_code.clone(),
        peer_id: actor.peer_id,
        preferences: actor.preferences.clone(),
    }
}

fn link_changed(peer_id: Option<ActorId>) -> WireEnvelope {
    WireEnvelope::new(
        HUB_SENDER_ID,
        WireMsg::LinkChanged(pulselink_core::wire::LinkChangedPayload { peer_id }),
    )
}

fn pairing_error_code(err: &PairingError) -> &'static str {
    match err {
        PairingError::CodeNotFound => error_codes::CODE_NOT_FOUND,
        PairingError::SelfLink => error_codes::SELF_LINK,
        PairingError::NotFound(_) => error_codes::NOT_FOUND,
        PairingError::Storage(_) => error_codes::LINK_FAILED,
    }
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}
