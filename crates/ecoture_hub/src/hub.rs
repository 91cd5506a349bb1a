#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ecoture_domain::{ConnectionId, Identity};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Presence-tracked message relay.
///
/// The hub owns the identity -> connection directory and the outbound queue
/// of every live connection. At most one connection is registered per
/// identity at any instant; a newer connection claiming the same identity
/// replaces the older registration (last-connect-wins), and the older
/// connection stays transport-connected but unreachable by identity until it
/// disconnects or re-registers.
#[derive(Debug, Clone)]
pub struct RelayHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RelayHubConfig,
}

/// Configuration for `RelayHub`.
#[derive(Debug, Clone)]
pub struct RelayHubConfig {
	/// Maximum number of queued outbound events per connection.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RelayHubConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Events emitted on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
	/// A relayed chat message (`ReceiveMessage` on the wire). Presence
	/// notices and unreachable-target notices use the `System` sender.
	Message { sender: Identity, body: String },

	/// Snapshot of all registered identities (`Connections` on the wire),
	/// sent to peers after every presence change.
	Roster { identities: Vec<Identity> },
}

impl RelayHub {
	pub fn new(cfg: RelayHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a connection and its claimed identity.
	///
	/// Never fails. An empty or absent claim resolves to a guest fallback
	/// derived from the connection id so the session stays addressable.
	/// Peers are notified of the presence change and receive a fresh roster;
	/// the new connection itself receives nothing at connect time.
	///
	/// Returns the resolved identity and the outbound event receiver the
	/// transport layer must drain for this connection.
	pub async fn on_connect(&self, conn: ConnectionId, claimed: Option<&str>) -> (Identity, mpsc::Receiver<HubEvent>) {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity);
		let identity = Identity::from_claimed(claimed, conn);

		let mut inner = self.inner.lock().await;
		inner.connections.insert(
			conn,
			PeerEntry {
				identity: identity.clone(),
				tx,
				connected_at: Instant::now(),
			},
		);

		if let Some(prev) = inner.directory.insert(identity.clone(), conn)
			&& self.cfg.debug_logs
		{
			debug!(
				identity = %identity,
				prev_conn = %prev,
				conn = %conn,
				"identity re-registered; prior connection is now presence-orphaned"
			);
		}

		metrics::counter!("ecoture_hub_connects_total").increment(1);
		metrics::gauge!("ecoture_hub_active_connections").increment(1.0);

		inner.notify_peers(conn, format!("{identity} connected"));

		if self.cfg.debug_logs {
			debug!(conn = %conn, identity = %identity, peers = inner.connections.len(), "hub: connected");
		}

		(identity, rx)
	}

	/// Deregister a connection.
	///
	/// Idempotent: a duplicate disconnect for the same connection id is a
	/// no-op. The directory entry is removed only if it still points at this
	/// exact connection, so a late disconnect event can never erase a newer
	/// registration for the same identity.
	pub async fn on_disconnect(&self, conn: ConnectionId) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.connections.remove(&conn) else {
			return;
		};

		metrics::counter!("ecoture_hub_disconnects_total").increment(1);
		metrics::gauge!("ecoture_hub_active_connections").decrement(1.0);

		if self.cfg.debug_logs {
			debug!(
				conn = %conn,
				identity = %entry.identity,
				session_secs = entry.connected_at.elapsed().as_secs(),
				"hub: disconnected"
			);
		}

		match inner.directory.get(&entry.identity) {
			Some(current) if *current == conn => {
				inner.directory.remove(&entry.identity);
				inner.notify_peers(conn, format!("{} disconnected", entry.identity));
			}
			_ => {
				// Stale disconnect: the identity was re-registered by a newer
				// connection before this event arrived. Leave it alone.
				if self.cfg.debug_logs {
					debug!(conn = %conn, identity = %entry.identity, "hub: stale disconnect ignored");
				}
			}
		}
	}

	/// Relay `body` from the given connection to every other live connection.
	///
	/// The sender tag is the connection's registered identity. Zero
	/// recipients is a silent no-op; per-recipient queue failures are skipped
	/// without aborting delivery to the rest.
	pub async fn send_broadcast(&self, sender_conn: ConnectionId, body: impl Into<String>) {
		let body = body.into();

		let inner = self.inner.lock().await;
		let Some(sender_entry) = inner.connections.get(&sender_conn) else {
			// The sending connection raced its own disconnect; nothing to relay.
			if self.cfg.debug_logs {
				debug!(conn = %sender_conn, "hub: broadcast from unknown connection dropped");
			}
			return;
		};
		let sender = sender_entry.identity.clone();

		metrics::counter!("ecoture_hub_messages_broadcast_total").increment(1);

		let mut dropped: u64 = 0;
		for (conn, entry) in inner.connections.iter() {
			if *conn == sender_conn {
				continue;
			}

			let event = HubEvent::Message {
				sender: sender.clone(),
				body: body.clone(),
			};
			if entry.tx.try_send(event).is_err() {
				dropped += 1;
			}
		}

		if dropped > 0 {
			metrics::counter!("ecoture_hub_events_dropped_total").increment(dropped);
			if self.cfg.debug_logs {
				debug!(sender = %sender, dropped, "hub: broadcast dropped for unreachable or lagging peers");
			}
		}
	}

	/// Relay `body` to the connection currently registered for `target`.
	///
	/// The sender label is taken from the request as-is (client-supplied,
	/// unauthenticated). If the target has no live registration, or its
	/// outbound channel is gone, the sender alone receives a `System` notice;
	/// target absence is an expected condition, not a hub fault.
	/// Self-addressed sends are permitted and deliver normally.
	pub async fn send_to_identity(
		&self,
		sender_conn: ConnectionId,
		sender: Identity,
		target: &Identity,
		body: impl Into<String>,
	) {
		let body = body.into();

		let inner = self.inner.lock().await;
		let target_entry = inner.directory.get(target).and_then(|conn| inner.connections.get(conn));

		match target_entry {
			Some(entry) => match entry.tx.try_send(HubEvent::Message { sender, body }) {
				Ok(()) => {
					metrics::counter!("ecoture_hub_messages_directed_total").increment(1);
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					// Recipient is lagging; best-effort delivery drops the event.
					metrics::counter!("ecoture_hub_events_dropped_total").increment(1);
					if self.cfg.debug_logs {
						debug!(target = %target, "hub: directed message dropped for lagging peer");
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					inner.notify_sender_unreachable(sender_conn, target);
				}
			},
			None => {
				inner.notify_sender_unreachable(sender_conn, target);
			}
		}
	}

	/// Snapshot of all registered identities, sorted.
	pub async fn roster(&self) -> Vec<Identity> {
		let inner = self.inner.lock().await;
		inner.roster()
	}

	/// Connection currently registered for `identity`, if any.
	pub async fn resolve(&self, identity: &Identity) -> Option<ConnectionId> {
		let inner = self.inner.lock().await;
		inner.directory.get(identity).copied()
	}

	/// Number of live connections, including presence-orphaned ones.
	pub async fn active_connections(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.connections.len()
	}
}

#[derive(Debug, Default)]
struct Inner {
	/// identity -> currently registered connection. At most one entry per
	/// identity; mutated only under the hub lock.
	directory: HashMap<Identity, ConnectionId>,

	connections: HashMap<ConnectionId, PeerEntry>,
}

#[derive(Debug)]
struct PeerEntry {
	identity: Identity,
	tx: mpsc::Sender<HubEvent>,
	connected_at: Instant,
}

impl Inner {
	fn roster(&self) -> Vec<Identity> {
		let mut identities: Vec<Identity> = self.directory.keys().cloned().collect();
		identities.sort();
		identities
	}

	/// Send a presence notice plus a fresh roster to every connection except
	/// `exclude`. The roster is computed here, under the same lock as the
	/// directory mutation that triggered it.
	fn notify_peers(&self, exclude: ConnectionId, notice: String) {
		let identities = self.roster();

		let mut dropped: u64 = 0;
		for (conn, entry) in self.connections.iter() {
			if *conn == exclude {
				continue;
			}

			let notice = HubEvent::Message {
				sender: Identity::system(),
				body: notice.clone(),
			};
			if entry.tx.try_send(notice).is_err() {
				dropped += 1;
			}

			let roster = HubEvent::Roster {
				identities: identities.clone(),
			};
			if entry.tx.try_send(roster).is_err() {
				dropped += 1;
			}
		}

		if dropped > 0 {
			metrics::counter!("ecoture_hub_events_dropped_total").increment(dropped);
		}
	}

	/// Report an unreachable target back to the sending connection only.
	fn notify_sender_unreachable(&self, sender_conn: ConnectionId, target: &Identity) {
		metrics::counter!("ecoture_hub_directed_unreachable_total").increment(1);

		if let Some(sender_entry) = self.connections.get(&sender_conn) {
			let notice = HubEvent::Message {
				sender: Identity::system(),
				body: format!("{target} is not online."),
			};
			let _ = sender_entry.tx.try_send(notice);
		}
	}
}
