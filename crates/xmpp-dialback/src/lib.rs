//! # xmpp-dialback
//!
//! Server Dialback (XEP-0220) for XMPP server-to-server streams: weak identity
//! verification between servers without certificates.
//!
//! ## Architecture
//!
//! Three servers take part in every exchange:
//!
//! ```text
//!  a.example (Originating)        b.example (Receiving)        a.example (Authoritative)
//!       │                               │                               │
//!       ├── <result>KEY</result> ─────► │                               │
//!       │                               ├── <verify id=SID>KEY ───────► │
//!       │                               │ ◄──── <verify type=valid/> ───┤
//!       │ ◄──── <result type=valid/> ───┤                               │
//! ```
//!
//! ## Key concepts
//!
//! - **Key derivation** (`keys.rs`): XEP-0185 HMAC-SHA-256 over
//!   `receiving originating stream-id`, keyed by the hashed shared secret.
//! - **Sessions** (`session.rs`): per-stream state machine for the Originating
//!   and Receiving roles, resolving a one-shot [`DialbackAttempt`].
//! - **Coordinator** (`coordinator.rs`): in-flight verify requests, their
//!   timeouts, and the reused outbound streams to Authoritative Servers.
//! - **Authoritative check** (`authoritative.rs`): stateless answer to
//!   `<verify/>` requests.
//! - **Facade** (`facade.rs`): what the stream layer calls.
//!
//! The crate never touches sockets or XML; it sees streams only through
//! [`XmlStream`].

pub mod authoritative;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod facade;
pub mod keys;
pub mod secrets;
pub mod session;
pub mod stanza;
pub mod stream;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::DialbackConfig;
pub use coordinator::{PendingOutcome, PendingVerification, VerificationCoordinator};
pub use error::{DialbackError, DialbackResult};
pub use facade::DialbackFacade;
pub use keys::derive_key;
pub use secrets::{SecretResolver, StaticSecrets};
pub use session::{DialbackAttempt, DialbackSession, Role, SessionState, StreamEvent};
pub use stanza::{DialbackStanza, StanzaKind, NS_DIALBACK};
pub use stream::{AuthoritativeConnector, XmlStream};
pub use types::{DialbackOutcome, ServerIdentity, StreamId};
