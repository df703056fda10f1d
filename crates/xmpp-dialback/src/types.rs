//! Dialback data types: server identities, stream IDs, and verification outcomes.

use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

// ─── Server identity ─────────────────────────────────────────────────────────

/// A server domain name (e.g. `a.example`).
///
/// Identities compare case-insensitively; no other normalisation is applied.
/// The original spelling is kept for use on the wire.
#[derive(Debug, Clone)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new(domain: impl Into<String>) -> Self {
        Self(domain.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form, used as a lookup key.
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for ServerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ServerIdentity {}

impl Hash for ServerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ServerIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─── Stream ID ───────────────────────────────────────────────────────────────

/// Opaque stream identifier generated by the Receiving Server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a newly accepted stream.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Result of asking an Authoritative Server to verify a dialback key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialbackOutcome {
    Valid,
    Invalid,
    /// The authoritative stream failed, or the verification could not be sent.
    Error(String),
    TimedOut,
}

impl DialbackOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}
