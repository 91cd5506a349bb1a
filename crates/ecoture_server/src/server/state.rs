#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ecoture_domain::ConnectionId;
use ecoture_hub::RelayHub;

use crate::server::health::HealthState;

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
	pub max_frame_bytes: usize,
}

impl Default for TransportSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: ecoture_protocol::DEFAULT_MAX_FRAME_BYTES,
		}
	}
}

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
	pub hub: RelayHub,
	pub health: HealthState,
	pub settings: TransportSettings,

	/// Connection ids are never reused while the process lives.
	next_conn_id: Arc<AtomicU64>,
}

impl AppState {
	pub fn new(hub: RelayHub, settings: TransportSettings) -> Self {
		Self {
			hub,
			health: HealthState::new(),
			settings,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn next_connection_id(&self) -> ConnectionId {
		ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
	}
}
