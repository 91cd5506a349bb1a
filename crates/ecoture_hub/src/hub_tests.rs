#![forbid(unsafe_code)]

use std::time::Duration;

use ecoture_domain::{ConnectionId, Identity};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::hub::{HubEvent, RelayHub, RelayHubConfig};

fn hub() -> RelayHub {
	RelayHub::new(RelayHubConfig {
		outbound_queue_capacity: 16,
		debug_logs: false,
	})
}

fn conn(id: u64) -> ConnectionId {
	ConnectionId::new(id)
}

fn ident(s: &str) -> Identity {
	Identity::new(s).expect("valid identity")
}

/// Drain everything already queued on a connection's outbound channel.
fn drain(rx: &mut mpsc::Receiver<HubEvent>) -> Vec<HubEvent> {
	let mut out = Vec::new();
	while let Ok(ev) = rx.try_recv() {
		out.push(ev);
	}
	out
}

async fn recv(rx: &mut mpsc::Receiver<HubEvent>) -> HubEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

fn messages_of(events: &[HubEvent]) -> Vec<(Identity, String)> {
	events
		.iter()
		.filter_map(|ev| match ev {
			HubEvent::Message { sender, body } => Some((sender.clone(), body.clone())),
			HubEvent::Roster { .. } => None,
		})
		.collect()
}

fn last_roster_of(events: &[HubEvent]) -> Option<Vec<Identity>> {
	events
		.iter()
		.rev()
		.find_map(|ev| match ev {
			HubEvent::Roster { identities } => Some(identities.clone()),
			HubEvent::Message { .. } => None,
		})
}

#[tokio::test]
async fn directory_registers_at_most_one_connection_per_identity() {
	let hub = hub();

	let (_, _rx1) = hub.on_connect(conn(1), Some("bob")).await;
	let (_, _rx2) = hub.on_connect(conn(2), Some("bob")).await;

	assert_eq!(hub.resolve(&ident("bob")).await, Some(conn(2)));
	assert_eq!(hub.roster().await, vec![ident("bob")]);
	assert_eq!(hub.active_connections().await, 2);
}

#[tokio::test]
async fn last_connect_wins_for_directed_sends() {
	let hub = hub();

	let (_, mut rx_old) = hub.on_connect(conn(1), Some("bob")).await;
	let (_, mut rx_new) = hub.on_connect(conn(2), Some("bob")).await;
	let (_, _rx_alice) = hub.on_connect(conn(3), Some("alice")).await;

	drain(&mut rx_old);
	drain(&mut rx_new);

	hub.send_to_identity(conn(3), ident("alice"), &ident("bob"), "hi").await;

	let got = recv(&mut rx_new).await;
	assert_eq!(
		got,
		HubEvent::Message {
			sender: ident("alice"),
			body: "hi".to_string(),
		}
	);

	assert!(
		drain(&mut rx_old).is_empty(),
		"orphaned connection must not receive identity-addressed messages"
	);
}

#[tokio::test]
async fn stale_disconnect_does_not_clobber_newer_registration() {
	let hub = hub();

	let (_, _rx1) = hub.on_connect(conn(1), Some("bob")).await;
	let (_, _rx2) = hub.on_connect(conn(2), Some("bob")).await;
	let (_, mut rx_alice) = hub.on_connect(conn(3), Some("alice")).await;

	drain(&mut rx_alice);

	// The old connection's disconnect arrives after the reconnect.
	hub.on_disconnect(conn(1)).await;

	assert_eq!(hub.resolve(&ident("bob")).await, Some(conn(2)));
	assert_eq!(hub.roster().await, vec![ident("alice"), ident("bob")]);

	assert!(
		drain(&mut rx_alice).is_empty(),
		"a stale disconnect must not emit a presence notice"
	);
}

#[tokio::test]
async fn broadcast_excludes_sender() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	let (_, mut rx_bob) = hub.on_connect(conn(2), Some("bob")).await;
	let (_, mut rx_carol) = hub.on_connect(conn(3), Some("carol")).await;

	drain(&mut rx_alice);
	drain(&mut rx_bob);
	drain(&mut rx_carol);

	hub.send_broadcast(conn(1), "hello all").await;

	let expected = HubEvent::Message {
		sender: ident("alice"),
		body: "hello all".to_string(),
	};
	assert_eq!(recv(&mut rx_bob).await, expected);
	assert_eq!(recv(&mut rx_carol).await, expected);
	assert!(drain(&mut rx_alice).is_empty(), "sender must not receive its own broadcast");
}

#[tokio::test]
async fn broadcast_with_no_peers_is_a_silent_no_op() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	drain(&mut rx_alice);

	hub.send_broadcast(conn(1), "anyone there?").await;

	assert!(drain(&mut rx_alice).is_empty());
}

#[tokio::test]
async fn unreachable_target_notifies_sender_only() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	let (_, mut rx_bob) = hub.on_connect(conn(2), Some("bob")).await;

	drain(&mut rx_alice);
	drain(&mut rx_bob);

	hub.send_to_identity(conn(1), ident("alice"), &ident("ghost"), "hi").await;

	let alice_events = drain(&mut rx_alice);
	assert_eq!(
		messages_of(&alice_events),
		vec![(Identity::system(), "ghost is not online.".to_string())]
	);
	assert!(drain(&mut rx_bob).is_empty(), "no message may be delivered anywhere else");
}

#[tokio::test]
async fn roster_is_computed_at_broadcast_time() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	let (_, mut rx_bob) = hub.on_connect(conn(2), Some("bob")).await;

	// alice sees bob arrive with the full roster.
	let alice_events = drain(&mut rx_alice);
	assert_eq!(last_roster_of(&alice_events), Some(vec![ident("alice"), ident("bob")]));

	hub.on_disconnect(conn(1)).await;

	let bob_events = drain(&mut rx_bob);
	assert_eq!(
		messages_of(&bob_events),
		vec![(Identity::system(), "alice disconnected".to_string())]
	);
	assert_eq!(last_roster_of(&bob_events), Some(vec![ident("bob")]));
}

#[tokio::test]
async fn duplicate_disconnect_is_idempotent() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	let (_, _rx_bob) = hub.on_connect(conn(2), Some("bob")).await;

	drain(&mut rx_alice);

	hub.on_disconnect(conn(2)).await;
	hub.on_disconnect(conn(2)).await;

	let alice_events = drain(&mut rx_alice);
	assert_eq!(
		messages_of(&alice_events),
		vec![(Identity::system(), "bob disconnected".to_string())],
		"a duplicate disconnect must not emit a second presence notice"
	);
	assert_eq!(hub.active_connections().await, 1);
}

#[tokio::test]
async fn empty_claim_falls_back_to_guest_identity() {
	let hub = hub();

	let (identity, mut rx_guest) = hub.on_connect(conn(7), None).await;
	assert_eq!(identity, ident("guest-7"));

	let (_, _rx_alice) = hub.on_connect(conn(8), Some("alice")).await;
	drain(&mut rx_guest);

	hub.send_to_identity(conn(8), ident("alice"), &ident("guest-7"), "hi").await;

	assert_eq!(
		recv(&mut rx_guest).await,
		HubEvent::Message {
			sender: ident("alice"),
			body: "hi".to_string(),
		}
	);
}

#[tokio::test]
async fn self_addressed_send_echoes_back() {
	let hub = hub();

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	drain(&mut rx_alice);

	hub.send_to_identity(conn(1), ident("alice"), &ident("alice"), "note to self")
		.await;

	assert_eq!(
		recv(&mut rx_alice).await,
		HubEvent::Message {
			sender: ident("alice"),
			body: "note to self".to_string(),
		}
	);
}

#[tokio::test]
async fn full_peer_queue_does_not_abort_fanout() {
	let hub = RelayHub::new(RelayHubConfig {
		outbound_queue_capacity: 1,
		debug_logs: false,
	});

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	let (_, _rx_bob) = hub.on_connect(conn(2), Some("bob")).await;
	let (_, mut rx_carol) = hub.on_connect(conn(3), Some("carol")).await;

	// bob's queue is already full of presence traffic and is never drained.
	drain(&mut rx_alice);
	drain(&mut rx_carol);

	hub.send_broadcast(conn(1), "still going").await;

	assert_eq!(
		recv(&mut rx_carol).await,
		HubEvent::Message {
			sender: ident("alice"),
			body: "still going".to_string(),
		}
	);
}

#[tokio::test]
async fn dropped_receiver_is_treated_as_unreachable_for_directed_sends() {
	let hub = hub();

	let (_, rx_bob) = hub.on_connect(conn(2), Some("bob")).await;
	drop(rx_bob);

	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	drain(&mut rx_alice);

	hub.send_to_identity(conn(1), ident("alice"), &ident("bob"), "hi").await;

	let alice_events = drain(&mut rx_alice);
	assert_eq!(
		messages_of(&alice_events),
		vec![(Identity::system(), "bob is not online.".to_string())]
	);
}

#[tokio::test]
async fn end_to_end_presence_and_relay_scenario() {
	let hub = hub();

	// 1. alice connects alone: no peers, so no notifications anywhere.
	let (_, mut rx_alice) = hub.on_connect(conn(1), Some("alice")).await;
	assert!(drain(&mut rx_alice).is_empty());

	// 2. bob connects: alice sees the notice plus the {alice, bob} roster.
	let (_, mut rx_bob) = hub.on_connect(conn(2), Some("bob")).await;
	let alice_events = drain(&mut rx_alice);
	assert_eq!(
		messages_of(&alice_events),
		vec![(Identity::system(), "bob connected".to_string())]
	);
	assert_eq!(last_roster_of(&alice_events), Some(vec![ident("alice"), ident("bob")]));
	assert!(drain(&mut rx_bob).is_empty());

	// 3. alice -> bob direct message.
	hub.send_to_identity(conn(1), ident("alice"), &ident("bob"), "hi").await;
	assert_eq!(
		recv(&mut rx_bob).await,
		HubEvent::Message {
			sender: ident("alice"),
			body: "hi".to_string(),
		}
	);
	assert!(drain(&mut rx_alice).is_empty());

	// 4. alice -> carol, who never connected.
	hub.send_to_identity(conn(1), ident("alice"), &ident("carol"), "hi").await;
	assert_eq!(
		messages_of(&drain(&mut rx_alice)),
		vec![(Identity::system(), "carol is not online.".to_string())]
	);
	assert!(drain(&mut rx_bob).is_empty());

	// 5. bob disconnects: alice sees the notice plus the {alice} roster.
	hub.on_disconnect(conn(2)).await;
	let alice_events = drain(&mut rx_alice);
	assert_eq!(
		messages_of(&alice_events),
		vec![(Identity::system(), "bob disconnected".to_string())]
	);
	assert_eq!(last_roster_of(&alice_events), Some(vec![ident("alice")]));
}
