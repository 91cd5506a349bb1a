#![forbid(unsafe_code)]

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use ecoture_domain::{ConnectionId, Identity};
use ecoture_hub::HubEvent;
use ecoture_protocol::{ClientFrame, ServerFrame, decode_client_frame, encode_server_frame};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::health::{healthz, readyz};
use crate::server::state::AppState;

/// All routes served on the main listener.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/chat", get(chat_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state(state)
}

/// Connect-time metadata. The claimed identity arrives as a query parameter
/// and is treated as an opaque, untrusted label.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectQuery {
	pub username: Option<String>,
}

async fn chat_handler(State(state): State<AppState>, Query(query): Query<ConnectQuery>, ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
	let conn = state.next_connection_id();
	let (identity, mut events) = state.hub.on_connect(conn, query.username.as_deref()).await;
	info!(conn = %conn, identity = %identity, "chat connection established");

	let (mut socket_tx, mut socket_rx) = socket.split();

	// Writer: drain the hub's outbound queue onto the socket.
	let send_task = tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			let text = match encode_server_frame(&server_frame(event)) {
				Ok(text) => text,
				Err(e) => {
					warn!(error = %e, "failed to encode server frame");
					continue;
				}
			};

			metrics::counter!("ecoture_server_frames_out_total").increment(1);

			if socket_tx.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	while let Some(msg) = socket_rx.next().await {
		let msg = match msg {
			Ok(msg) => msg,
			Err(e) => {
				debug!(conn = %conn, error = %e, "socket read failed");
				break;
			}
		};

		match msg {
			Message::Text(text) => {
				metrics::counter!("ecoture_server_frames_in_total").increment(1);

				match decode_client_frame(text.as_str(), state.settings.max_frame_bytes) {
					Ok(frame) => handle_frame(&state, conn, &identity, frame).await,
					Err(e) => {
						metrics::counter!("ecoture_server_frame_decode_errors_total").increment(1);
						warn!(conn = %conn, error = %e, "ignoring bad frame");
					}
				}
			}
			Message::Binary(_) => {
				debug!(conn = %conn, "ignoring binary frame");
			}
			Message::Close(_) => break,
			Message::Ping(_) | Message::Pong(_) => {}
		}
	}

	// Disconnect exactly once, from the socket task that owns the session.
	state.hub.on_disconnect(conn).await;
	send_task.abort();
	info!(conn = %conn, identity = %identity, "chat connection closed");
}

async fn handle_frame(state: &AppState, conn: ConnectionId, identity: &Identity, frame: ClientFrame) {
	match frame {
		ClientFrame::SendMessage { message } => {
			state.hub.send_broadcast(conn, message).await;
		}
		ClientFrame::SendMessageToUser { target, sender, message } => {
			let Ok(target) = Identity::new(target) else {
				warn!(conn = %conn, "directed send with empty target ignored");
				return;
			};

			// An empty sender label falls back to the registered identity.
			let sender = Identity::new(sender).unwrap_or_else(|_| identity.clone());
			state.hub.send_to_identity(conn, sender, &target, message).await;
		}
	}
}

fn server_frame(event: HubEvent) -> ServerFrame {
	match event {
		HubEvent::Message { sender, body } => ServerFrame::ReceiveMessage {
			sender: sender.into_string(),
			body,
		},
		HubEvent::Roster { identities } => ServerFrame::Connections {
			identities: identities.into_iter().map(Identity::into_string).collect(),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn message_events_map_to_receive_message() {
		let frame = server_frame(HubEvent::Message {
			sender: Identity::system(),
			body: "bob connected".to_string(),
		});
		assert_eq!(
			frame,
			ServerFrame::ReceiveMessage {
				sender: "System".to_string(),
				body: "bob connected".to_string(),
			}
		);
	}

	#[test]
	fn roster_events_preserve_identity_order() {
		let frame = server_frame(HubEvent::Roster {
			identities: vec![Identity::new("alice").unwrap(), Identity::new("bob").unwrap()],
		});
		assert_eq!(
			frame,
			ServerFrame::Connections {
				identities: vec!["alice".to_string(), "bob".to_string()],
			}
		);
	}
}
