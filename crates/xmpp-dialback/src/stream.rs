//! Abstract stream capability consumed by the dialback core.
//!
//! The transport layer (TCP, TLS, stream negotiation, XML framing) lives
//! outside this crate. It hands the core an [`XmlStream`] per open
//! server-to-server stream, and feeds inbound dialback stanzas and stream
//! failures back through [`crate::facade::DialbackFacade`].

use std::sync::Arc;

use crate::{
    error::DialbackResult,
    stanza::DialbackStanza,
    types::{ServerIdentity, StreamId},
};

/// One open server-to-server stream.
pub trait XmlStream: Send + Sync {
    /// Our side of the stream.
    fn this_host(&self) -> &ServerIdentity;

    /// The peer's claimed identity.
    fn other_host(&self) -> &ServerIdentity;

    /// Stream ID from the Receiving Server's stream header, once known.
    fn stream_id(&self) -> Option<&StreamId>;

    /// Queue a stanza for transmission. Fails with
    /// [`crate::DialbackError::StreamClosed`] once the stream is gone.
    fn send(&self, stanza: DialbackStanza) -> DialbackResult<()>;

    /// `false` once the stream has closed or errored.
    fn is_usable(&self) -> bool;
}

/// Opens outbound streams to Authoritative Servers on behalf of the
/// verification coordinator.
///
/// Returning a handle does not imply the connection is up; the transport may
/// queue sends until negotiation finishes and report failure through
/// [`crate::facade::DialbackFacade::stream_error`].
pub trait AuthoritativeConnector: Send + Sync {
    fn open(
        &self,
        local: &ServerIdentity,
        remote: &ServerIdentity,
    ) -> DialbackResult<Arc<dyn XmlStream>>;
}
