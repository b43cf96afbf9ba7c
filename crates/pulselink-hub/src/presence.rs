//! Peer-status evaluation. Status is derived from `last_seen` recency on
//! every read; nothing is stored. Each session gets a ticker that
//! re-evaluates on a fixed interval and pushes a frame only when the
//! verdict changes.

use crate::hub::{HubState, SessionHandle};
use chrono::Utc;
use pulselink_core::wire::{PeerStatusPayload, WireEnvelope, WireMsg, HUB_SENDER_ID};
use pulselink_core::{ActorId, PresenceStatus};
use pulselink_storage::StorageError;
use std::sync::Arc;
use tracing::warn;

impl HubState {
    pub async fn peer_status_of(
        &self,
        actor_id: &ActorId,
    ) -> Result<PeerStatusPayload, StorageError> {
        let store = self.store.lock().await;
        let row = store
            .get(actor_id)?
            .ok_or_else(|| StorageError::MissingActor(actor_id.to_string()))?;
        let Some(peer) = row.peer_id else {
            return Ok(PeerStatusPayload {
                peer_id: None,
                online: false,
            });
        };
        let online = store
            .get(&peer)?
            .map(|peer_row| PresenceStatus::derive(peer_row.last_seen, Utc::now()).is_online())
            .unwrap_or(false);
        Ok(PeerStatusPayload {
            peer_id: Some(peer),
            online,
        })
    }

    /// Periodic re-evaluation for one session. Evaluation failures are
    /// logged and retried on the next tick. The task ends when the
    /// session's mailbox goes away.
    pub fn start_status_ticker(self: Arc<Self>, session: Arc<SessionHandle>) {
        let interval = self.config.status_poll_interval;
        if interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The handshake already sent the initial status.
            ticker.tick().await;
            let mut closed = session.closed();
            let mut last: Option<PeerStatusPayload> = None;
            loop {
                tokio::select! {
                    _ = closed.changed() => return,
                    _ = ticker.tick() => {}
                }
                if session.is_closed() {
                    return;
                }
                let status = match self.peer_status_of(&session.actor_id).await {
                    Ok(status) => status,
                    Err(err) => {
                        warn!(event = "status_tick_failed", actor_id = %session.actor_id, error = %err);
                        continue;
                    }
                };
                if last.as_ref() == Some(&status) {
                    continue;
                }
                let envelope =
                    WireEnvelope::new(HUB_SENDER_ID, WireMsg::PeerStatus(status.clone()));
                if !session.send(envelope).await {
                    self.remove_session(&session, "delivery_failed").await;
                    return;
                }
                last = Some(status);
            }
        });
    }
}
