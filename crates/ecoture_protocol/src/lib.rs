#![forbid(unsafe_code)]

//! JSON wire frames for the relay's WebSocket endpoint.
//!
//! One frame per text message, tagged with `type`. Method and event names
//! match the hub's invocation surface: clients invoke `SendMessage` or
//! `SendMessageToUser`; the server emits `ReceiveMessage` and `Connections`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum accepted text frame size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("invalid frame: {0}")]
	Decode(#[from] serde_json::Error),
}

/// Client -> server invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
	/// Broadcast to every other connected client.
	SendMessage {
		message: String,
	},

	/// Directed send to one identity. The sender label is client-supplied
	/// and unauthenticated; the hub relays it as-is.
	SendMessageToUser {
		target: String,
		sender: String,
		message: String,
	},
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
	/// A relayed message; presence and error notices use the `System` sender.
	ReceiveMessage {
		sender: String,
		body: String,
	},

	/// Roster of all registered identities, sent after presence changes.
	Connections {
		identities: Vec<String>,
	},
}

/// Decode one client text frame, enforcing the size limit first.
pub fn decode_client_frame(text: &str, max_frame_bytes: usize) -> Result<ClientFrame, FrameError> {
	if text.len() > max_frame_bytes {
		return Err(FrameError::FrameTooLarge {
			len: text.len(),
			max: max_frame_bytes,
		});
	}

	Ok(serde_json::from_str(text)?)
}

/// Encode a server frame as a JSON text message.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, FrameError> {
	Ok(serde_json::to_string(frame)?)
}
