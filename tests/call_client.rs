mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use video_call::channel::{ChannelStatus, Credentials, StaticCredentials};
use video_call::types::state::CallingState;
use video_call::JoinOptions;

fn ring_from(caller: &str, id: &str) -> serde_json::Value {
    json!({
        "type": "call.ring",
        "call_cid": format!("default:{id}"),
        "call": call_json(id, caller, true),
        "members": [{"user": {"id": caller}}, {"user": {"id": ME}}],
        "video": true,
    })
}

fn created_by(creator: &str, id: &str) -> serde_json::Value {
    json!({
        "type": "call.created",
        "call_cid": format!("default:{id}"),
        "call": call_json(id, creator, true),
        "members": [{"user": {"id": creator}}, {"user": {"id": ME}}],
    })
}

fn rejected_by(user: &str, creator: &str, id: &str) -> serde_json::Value {
    json!({
        "type": "call.rejected",
        "call_cid": format!("default:{id}"),
        "user": {"id": user},
        "call": call_json(id, creator, true),
    })
}

#[tokio::test(start_paused = true)]
async fn created_and_ring_in_either_order_ring_once() {
    let h = harness(fast_config());
    let mut changes = h.client.bus().calling_state_changed.subscribe();

    h.client.dispatch(event(created_by("bob", "first"))).await;
    h.client.dispatch(event(ring_from("bob", "first"))).await;
    h.client.dispatch(event(ring_from("bob", "second"))).await;
    h.client.dispatch(event(created_by("bob", "second"))).await;

    for id in ["first", "second"] {
        let call = h.client.call("default", id);
        assert_eq!(call.calling_state(), CallingState::Ringing);
        assert_eq!(call.state().borrow().metadata.as_ref().unwrap().created_by.id, "bob");
    }
    let rings = drain(&mut changes)
        .iter()
        .filter(|c| c.current == CallingState::Ringing)
        .count();
    assert_eq!(rings, 2);
}

#[tokio::test(start_paused = true)]
async fn calls_created_by_me_do_not_ring() {
    let h = harness(fast_config());

    h.client.dispatch(event(created_by(ME, "mine"))).await;
    h.client.dispatch(event(ring_from(ME, "mine"))).await;

    assert_eq!(h.client.call("default", "mine").calling_state(), CallingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn events_for_unknown_calls_are_ignored() {
    let h = harness(fast_config());

    h.client.dispatch(event(rejected_by("bob", "bob", "ghost"))).await;

    assert!(h.client.registry().get("default:ghost").is_none());
}

#[tokio::test(start_paused = true)]
async fn caller_cancelling_ends_the_incoming_ring() {
    let h = harness(fast_config());
    h.client.dispatch(event(ring_from("bob", "cancelled"))).await;
    let call = h.client.call("default", "cancelled");
    assert_eq!(call.calling_state(), CallingState::Ringing);

    h.client.dispatch(event(rejected_by("carol", "bob", "cancelled"))).await;
    assert_eq!(call.calling_state(), CallingState::Ringing);

    h.client.dispatch(event(rejected_by("bob", "bob", "cancelled"))).await;
    assert_eq!(call.calling_state(), CallingState::Left);
    assert!(h.coordinator.rejects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outgoing_ring_ends_once_every_callee_rejected() {
    let h = harness(fast_config());
    let call = h.client.call("default", "outgoing");
    call.ring(vec!["bob".into(), "carol".into()], false).await.unwrap();
    assert_eq!(call.calling_state(), CallingState::Ringing);

    h.client.dispatch(event(rejected_by("bob", ME, "outgoing"))).await;
    assert_eq!(call.calling_state(), CallingState::Ringing);

    h.client.dispatch(event(rejected_by("carol", ME, "outgoing"))).await;
    assert_eq!(call.calling_state(), CallingState::Left);
    assert!(h.coordinator.rejects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_ring_is_rejected_after_the_timeout() {
    let mut config = fast_config();
    config.ring.auto_reject_timeout = Duration::from_secs(30);
    let h = harness(config);

    h.client.dispatch(event(ring_from("bob", "unanswered"))).await;
    let call = h.client.call("default", "unanswered");

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(call.calling_state(), CallingState::Ringing);
    wait_for_state(&call, CallingState::Left).await;
    assert_eq!(h.coordinator.rejects(), vec![Some("timeout".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn joining_cancels_the_pending_auto_reject() {
    let mut config = fast_config();
    config.ring.auto_reject_timeout = Duration::from_secs(30);
    let h = harness(config);
    h.client.dispatch(event(ring_from("bob", "answered"))).await;
    let call = h.client.call("default", "answered");

    call.accept().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(call.calling_state(), CallingState::Joined);
    assert_eq!(h.coordinator.accepts(), 1);
    assert!(h.coordinator.rejects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ring_while_in_another_call_is_rejected_as_busy() {
    let mut config = fast_config();
    config.ring.auto_reject_when_in_call = true;
    let h = harness(config);
    let current = h.client.call("default", "current");
    current.join(JoinOptions::default()).await.unwrap();

    h.client.dispatch(event(ring_from("bob", "incoming"))).await;
    let incoming = h.client.call("default", "incoming");

    wait_for_state(&incoming, CallingState::Left).await;
    assert_eq!(h.coordinator.rejects(), vec![Some("busy".to_string())]);
    assert_eq!(current.calling_state(), CallingState::Joined);
}

#[tokio::test(start_paused = true)]
async fn leaving_a_ring_declines_or_cancels_it() {
    let h = harness(fast_config());
    h.client.dispatch(event(ring_from("bob", "declined"))).await;
    h.client.call("default", "declined").leave("not now").await.unwrap();

    let outgoing = h.client.call("default", "cancelled");
    outgoing.ring(vec!["bob".into()], true).await.unwrap();
    outgoing.leave("hung up").await.unwrap();

    assert_eq!(
        h.coordinator.rejects(),
        vec![Some("decline".to_string()), Some("cancel".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn ended_event_leaves_the_call() {
    let h = harness(fast_config());
    let call = h.client.call("default", "ended");
    call.join(JoinOptions::default()).await.unwrap();

    h.client
        .dispatch(event(json!({
            "type": "call.ended",
            "call_cid": "default:ended",
            "user": {"id": "bob"},
        })))
        .await;

    assert_eq!(call.calling_state(), CallingState::Left);
    assert!(h.connector.link(0).is_closed());
    assert!(h.client.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn permission_updates_for_me_change_capabilities() {
    let h = harness(fast_config());
    let call = h.client.call("default", "perms");
    call.join(JoinOptions::default()).await.unwrap();

    h.client
        .dispatch(event(json!({
            "type": "call.permissions_updated",
            "call_cid": "default:perms",
            "user": {"id": ME},
            "own_capabilities": ["send-audio"],
        })))
        .await;

    assert_eq!(call.state().borrow().own_capabilities, vec!["send-audio".to_string()]);
}

#[tokio::test]
async fn coordinator_channel_routes_events_to_calls() {
    let h = harness(fast_config());
    let server = CoordinatorServer::new();
    let mut status = h.client.bus().channel_status.subscribe();

    h.client
        .connect(Arc::new(StaticCredentials(Credentials::new("user-token"))), server.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut status).await, ChannelStatus::Connected);

    server.push(ring_from("bob", "pushed")).await;
    let call = h.client.call("default", "pushed");
    wait_for_state(&call, CallingState::Ringing).await;

    h.client.disconnect().await;
    assert_eq!(call.calling_state(), CallingState::Left);
}
