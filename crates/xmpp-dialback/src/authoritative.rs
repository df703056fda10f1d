//! Authoritative Server side: answer `<verify/>` requests.
//!
//! The check is synchronous and stateless. The key is recomputed from the
//! secret this server holds for the claimed originating domain and compared
//! with the presented one.

use tracing::{debug, warn};

use crate::{
    error::{DialbackError, DialbackResult},
    keys::check_key,
    secrets::SecretResolver,
    stanza::{DialbackStanza, StanzaKind},
};

/// Build the `<verify type=valid|invalid/>` answer for one verify request.
///
/// Malformed requests (missing `id` or key) are protocol violations; an
/// unknown domain simply gets `invalid`.
pub fn answer_verify(
    secrets: &dyn SecretResolver,
    request: &DialbackStanza,
) -> DialbackResult<DialbackStanza> {
    if request.kind() != StanzaKind::VerifyRequest {
        return Err(DialbackError::ProtocolViolation(format!(
            "expected a verify request, got {:?}",
            request.kind()
        )));
    }
    let stream_id = request
        .id
        .clone()
        .ok_or_else(|| DialbackError::ProtocolViolation("verify request without id".into()))?;
    let presented = request
        .key
        .as_deref()
        .ok_or_else(|| DialbackError::ProtocolViolation("verify request without key".into()))?;

    // The requester is the Receiving Server; we answer for `to`.
    let originating = &request.to;
    let receiving = &request.from;

    let valid = match secrets.secret_for(originating, receiving) {
        Some(secret) => check_key(
            &secret,
            receiving.as_str(),
            originating.as_str(),
            stream_id.as_str(),
            presented,
        ),
        None => {
            warn!("Dialback: verify request for {} but no secret is configured", originating);
            false
        }
    };

    debug!(
        "Dialback: verify {} -> {} (stream {}): {}",
        originating,
        receiving,
        stream_id,
        if valid { "valid" } else { "invalid" }
    );

    Ok(DialbackStanza::verify_response(originating.clone(), receiving.clone(), stream_id, valid))
}
