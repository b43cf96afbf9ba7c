use chrono::Utc;
use pulselink_core::wire::{
    HeartbeatPayload, HelloPayload, LinkPayload, PulseFrame, StatusPollPayload, UnlinkPayload,
    WireEnvelope, WireMsg,
};
use pulselink_core::{ActorId, ActorRecord, Preferences, PulsePayload};
use pulselink_hub::hub::{HubConfig, HubState, Outbound, SessionHandle};
use pulselink_storage::ActorStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn hub() -> Arc<HubState> {
    hub_with(HubConfig::default())
}

fn hub_with(config: HubConfig) -> Arc<HubState> {
    let store = ActorStore::open_in_memory().expect("open store");
    Arc::new(HubState::new(config, store))
}

async fn attach(
    hub: &Arc<HubState>,
    actor_id: Option<ActorId>,
) -> (Arc<SessionHandle>, mpsc::Receiver<Outbound>, ActorRecord) {
    let (tx, rx) = mpsc::channel(32);
    let (session, actor) = hub
        .open_session(&HelloPayload { actor_id }, tx)
        .await
        .expect("open session");
    (session, rx, actor)
}

fn client_frame(msg: WireMsg) -> WireEnvelope {
    WireEnvelope::new("client", msg)
}

fn pulse_payload(color: &str, intensity: u8) -> PulsePayload {
    PulsePayload {
        preferences: Preferences {
            color: color.to_string(),
            intensity,
            ..Preferences::default()
        },
        sent_at: Utc::now(),
    }
}

async fn recv_out(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open")
}

async fn recv(rx: &mut mpsc::Receiver<Outbound>) -> WireEnvelope {
    match recv_out(rx).await {
        Outbound::Frame(envelope) => envelope,
        Outbound::Ping => panic!("expected a frame, got a ping"),
    }
}

fn expect_empty(rx: &mut mpsc::Receiver<Outbound>) {
    assert!(
        matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty)),
        "expected no pending frames"
    );
}

fn peer_of(envelope: &WireEnvelope) -> Option<ActorId> {
    match &envelope.msg {
        WireMsg::LinkChanged(payload) => payload.peer_id,
        other => panic!("expected link_changed, got {other:?}"),
    }
}

#[tokio::test]
async fn link_pulse_unlink_scenario() {
    let hub = hub();
    let (session_a, mut rx_a, actor_a) = attach(&hub, None).await;
    let (session_b, mut rx_b, _actor_b) = attach(&hub, None).await;

    // B enters A's code as a human would type it.
    let typed = actor_a.pairing_code.as_str().to_lowercase();
    hub.handle_frame(
        &session_b,
        client_frame(WireMsg::Link(LinkPayload { code: typed })),
    )
    .await;

    let to_b = recv(&mut rx_b).await;
    assert_eq!(peer_of(&to_b), Some(actor_a.id));
    let to_a = recv(&mut rx_a).await;
    assert_eq!(peer_of(&to_a), Some(session_b.actor_id));

    // A pulses; B receives exactly that payload exactly once.
    let payload = pulse_payload("#ff6b9d", 80);
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Pulse(PulseFrame {
            from_id: None,
            payload: payload.clone(),
        })),
    )
    .await;

    let delivered = recv(&mut rx_b).await;
    match delivered.msg {
        WireMsg::Pulse(frame) => {
            assert_eq!(frame.from_id, Some(actor_a.id));
            assert_eq!(frame.payload, payload);
        }
        other => panic!("expected pulse, got {other:?}"),
    }
    expect_empty(&mut rx_b);
    expect_empty(&mut rx_a);

    // A unlinks; both sides hear about it.
    hub.handle_frame(&session_a, client_frame(WireMsg::Unlink(UnlinkPayload {})))
        .await;
    assert_eq!(peer_of(&recv(&mut rx_a).await), None);
    assert_eq!(peer_of(&recv(&mut rx_b).await), None);

    // A further send from A stays local.
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Pulse(PulseFrame {
            from_id: None,
            payload: pulse_payload("#ff6b9d", 70),
        })),
    )
    .await;
    assert!(matches!(recv(&mut rx_a).await.msg, WireMsg::Pulse(_)));
    expect_empty(&mut rx_b);
}

#[tokio::test]
async fn unlinked_send_echoes_to_all_own_sessions_only() {
    let hub = hub();
    let (session_a, mut rx_a, actor_a) = attach(&hub, None).await;
    // Same actor, second tab.
    let (_session_a2, mut rx_a2, _) = attach(&hub, Some(actor_a.id)).await;
    let (_session_b, mut rx_b, _) = attach(&hub, None).await;

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Pulse(PulseFrame {
            from_id: None,
            payload: pulse_payload("#4ecdc4", 50),
        })),
    )
    .await;

    assert!(matches!(recv(&mut rx_a).await.msg, WireMsg::Pulse(_)));
    assert!(matches!(recv(&mut rx_a2).await.msg, WireMsg::Pulse(_)));
    expect_empty(&mut rx_b);
}

#[tokio::test]
async fn self_link_yields_error_frame_and_no_state_change() {
    let hub = hub();
    let (session_a, mut rx_a, actor_a) = attach(&hub, None).await;

    let frame = client_frame(WireMsg::Link(LinkPayload {
        code: actor_a.pairing_code.as_str().to_string(),
    }))
    .with_request_id(Some("req-1".to_string()));
    hub.handle_frame(&session_a, frame).await;

    let reply = recv(&mut rx_a).await;
    assert_eq!(reply.request_id.as_deref(), Some("req-1"));
    match reply.msg {
        WireMsg::Error(payload) => assert_eq!(payload.code, "self_link"),
        other => panic!("expected error, got {other:?}"),
    }

    let status = hub.peer_status_of(&actor_a.id).await.expect("status");
    assert_eq!(status.peer_id, None);
}

#[tokio::test]
async fn bad_codes_yield_typed_errors() {
    let hub = hub();
    let (session_a, mut rx_a, _) = attach(&hub, None).await;

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: "ZZZZZZ".to_string(),
        })),
    )
    .await;
    match recv(&mut rx_a).await.msg {
        WireMsg::Error(payload) => assert_eq!(payload.code, "code_not_found"),
        other => panic!("expected error, got {other:?}"),
    }

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: "abc".to_string(),
        })),
    )
    .await;
    match recv(&mut rx_a).await.msg {
        WireMsg::Error(payload) => assert_eq!(payload.code, "invalid_code"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn relink_notifies_displaced_partner() {
    let hub = hub();
    let (session_a, mut rx_a, _actor_a) = attach(&hub, None).await;
    let (session_b, mut rx_b, actor_b) = attach(&hub, None).await;
    let (_session_c, mut rx_c, actor_c) = attach(&hub, None).await;

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: actor_b.pairing_code.as_str().to_string(),
        })),
    )
    .await;
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    // A walks away to C; B must not be left dangling.
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: actor_c.pairing_code.as_str().to_string(),
        })),
    )
    .await;

    assert_eq!(peer_of(&recv(&mut rx_a).await), Some(actor_c.id));
    assert_eq!(peer_of(&recv(&mut rx_c).await), Some(session_a.actor_id));
    assert_eq!(peer_of(&recv(&mut rx_b).await), None);

    // B is unlinked now: its pulses stay local.
    hub.handle_frame(
        &session_b,
        client_frame(WireMsg::Pulse(PulseFrame {
            from_id: None,
            payload: pulse_payload("#feca57", 60),
        })),
    )
    .await;
    assert!(matches!(recv(&mut rx_b).await.msg, WireMsg::Pulse(_)));
    expect_empty(&mut rx_a);
    expect_empty(&mut rx_c);
}

#[tokio::test]
async fn status_poll_reports_peer_liveness() {
    let hub = hub();
    let (session_a, mut rx_a, _actor_a) = attach(&hub, None).await;
    let (_session_b, mut rx_b, actor_b) = attach(&hub, None).await;

    // Unlinked: no peer, reads offline.
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::StatusPoll(StatusPollPayload {})),
    )
    .await;
    match recv(&mut rx_a).await.msg {
        WireMsg::PeerStatus(payload) => {
            assert_eq!(payload.peer_id, None);
            assert!(!payload.online);
        }
        other => panic!("expected peer_status, got {other:?}"),
    }

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: actor_b.pairing_code.as_str().to_string(),
        })),
    )
    .await;
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    // B was just created, so its last refresh is within the threshold.
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::StatusPoll(StatusPollPayload {})),
    )
    .await;
    match recv(&mut rx_a).await.msg {
        WireMsg::PeerStatus(payload) => {
            assert_eq!(payload.peer_id, Some(actor_b.id));
            assert!(payload.online);
        }
        other => panic!("expected peer_status, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_unlink_is_silent() {
    let hub = hub();
    let (session_a, mut rx_a, _) = attach(&hub, None).await;
    let (_session_b, mut rx_b, actor_b) = attach(&hub, None).await;

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: actor_b.pairing_code.as_str().to_string(),
        })),
    )
    .await;
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    hub.handle_frame(&session_a, client_frame(WireMsg::Unlink(UnlinkPayload {})))
        .await;
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    hub.handle_frame(&session_a, client_frame(WireMsg::Unlink(UnlinkPayload {})))
        .await;
    expect_empty(&mut rx_a);
    expect_empty(&mut rx_b);
}

#[tokio::test]
async fn keepalive_pings_flow_until_session_closes() {
    let hub = hub_with(HubConfig {
        ping_interval: Duration::from_millis(20),
        ..HubConfig::default()
    });
    let (session, mut rx, _) = attach(&hub, None).await;
    hub.clone().start_ping(session.clone());

    assert_eq!(recv_out(&mut rx).await, Outbound::Ping);
    assert_eq!(recv_out(&mut rx).await, Outbound::Ping);

    hub.remove_session(&session, "test_teardown").await;
    // One more tick may already be in flight; after that the task is gone.
    let _ = rx.try_recv();
    tokio::time::sleep(Duration::from_millis(100)).await;
    expect_empty(&mut rx);
}

#[tokio::test]
async fn status_ticker_pushes_only_when_the_verdict_changes() {
    let hub = hub_with(HubConfig {
        status_poll_interval: Duration::from_millis(50),
        ..HubConfig::default()
    });
    let (session_a, mut rx_a, _) = attach(&hub, None).await;
    let (session_b, mut rx_b, actor_b) = attach(&hub, None).await;

    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Link(LinkPayload {
            code: actor_b.pairing_code.as_str().to_string(),
        })),
    )
    .await;
    let _ = recv(&mut rx_a).await;
    let _ = recv(&mut rx_b).await;

    hub.clone().start_status_ticker(session_a.clone());

    // First evaluation reports the linked, recently seen peer.
    match recv(&mut rx_a).await.msg {
        WireMsg::PeerStatus(payload) => {
            assert_eq!(payload.peer_id, Some(actor_b.id));
            assert!(payload.online);
        }
        other => panic!("expected peer_status, got {other:?}"),
    }

    // The verdict has not changed, so later ticks stay quiet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    expect_empty(&mut rx_a);

    // Unlinking changes it; the ticker pushes the new verdict. The
    // link_changed notice and the ticker run concurrently, so accept
    // the two frames in either order.
    hub.handle_frame(&session_b, client_frame(WireMsg::Unlink(UnlinkPayload {})))
        .await;
    assert_eq!(peer_of(&recv(&mut rx_b).await), None);
    let mut saw_link_changed = false;
    let mut saw_status = false;
    for _ in 0..2 {
        match recv(&mut rx_a).await.msg {
            WireMsg::LinkChanged(payload) => {
                assert_eq!(payload.peer_id, None);
                saw_link_changed = true;
            }
            WireMsg::PeerStatus(payload) => {
                assert_eq!(payload.peer_id, None);
                assert!(!payload.online);
                saw_status = true;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(saw_link_changed && saw_status);
}

#[tokio::test]
async fn heartbeat_advances_the_actors_last_seen() {
    let hub = hub();
    let (session_a, mut rx_a, actor_a) = attach(&hub, None).await;

    let before = hub
        .actor(&actor_a.id)
        .await
        .expect("lookup")
        .expect("row")
        .last_seen;
    tokio::time::sleep(Duration::from_millis(10)).await;
    hub.handle_frame(
        &session_a,
        client_frame(WireMsg::Heartbeat(HeartbeatPayload {})),
    )
    .await;

    let after = hub
        .actor(&actor_a.id)
        .await
        .expect("lookup")
        .expect("row")
        .last_seen;
    assert!(after > before);
    // Heartbeats are one-way; nothing comes back.
    expect_empty(&mut rx_a);
}

#[tokio::test]
async fn reconnect_restores_identity_and_code() {
    let hub = hub();
    let (session_a, _rx_a, actor_a) = attach(&hub, None).await;
    hub.remove_session(&session_a, "test_teardown").await;

    let (_session, _rx, restored) = attach(&hub, Some(actor_a.id)).await;
    assert_eq!(restored.id, actor_a.id);
    assert_eq!(restored.pairing_code, actor_a.pairing_code);
}
