#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Opaque identifier for one live transport session.
///
/// Assigned by the transport layer at connect time and never reused while the
/// session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Client-supplied addressing label.
///
/// Identities are opaque and unauthenticated: they arrive as connection
/// metadata and nothing binds them to a principal. Anyone can claim any
/// label; the newest claim wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
	/// Reserved sender label for hub-generated notices.
	pub const SYSTEM: &'static str = "System";

	/// Create a non-empty `Identity`. Surrounding whitespace is trimmed.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	/// The hub's own sender identity for presence and error notices.
	pub fn system() -> Self {
		Self(Self::SYSTEM.to_string())
	}

	/// Fallback identity for a connection that supplied no usable label,
	/// derived from the connection id so the session stays addressable.
	pub fn fallback_for(conn: ConnectionId) -> Self {
		Self(format!("guest-{}", conn.as_u64()))
	}

	/// Resolve a claimed label, falling back to [`Identity::fallback_for`]
	/// when the claim is absent or empty.
	pub fn from_claimed(claimed: Option<&str>, conn: ConnectionId) -> Self {
		match claimed {
			Some(s) => Self::new(s).unwrap_or_else(|_| Self::fallback_for(conn)),
			None => Self::fallback_for(conn),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identity::new(s)
	}
}
