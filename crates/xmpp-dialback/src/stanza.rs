//! Dialback wire elements in the `jabber:server:dialback` namespace.
//!
//! ```text
//! <db:result from='a.example' to='b.example'>KEY</db:result>           key send
//! <db:result from='b.example' to='a.example' type='valid'/>            result
//! <db:verify from='b.example' to='a.example' id='SID'>KEY</db:verify>  verify request
//! <db:verify from='a.example' to='b.example' id='SID' type='valid'/>   verify response
//! ```
//!
//! XML parsing and serialisation belong to the stream layer; this module only
//! models the fields the dialback exchange reads and writes.

use crate::types::{ServerIdentity, StreamId};

/// XML namespace of every dialback element.
pub const NS_DIALBACK: &str = "jabber:server:dialback";

const TYPE_VALID: &str = "valid";
const TYPE_INVALID: &str = "invalid";

/// Local name of a dialback element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackElement {
    Result,
    Verify,
}

impl DialbackElement {
    pub fn name(self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Verify => "verify",
        }
    }
}

/// What role a received dialback stanza plays in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// Originating → Receiving: here is my key.
    ResultRequest,
    /// Receiving → Originating: your key was (not) accepted.
    ResultResponse,
    /// Receiving → Authoritative: is this key right?
    VerifyRequest,
    /// Authoritative → Receiving: the key is (not) right.
    VerifyResponse,
}

/// One dialback stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialbackStanza {
    pub element: DialbackElement,
    pub from: ServerIdentity,
    pub to: ServerIdentity,
    /// Stream ID; only carried by `verify`.
    pub id: Option<StreamId>,
    /// `type` attribute; absent on requests.
    pub stanza_type: Option<String>,
    /// Dialback key text content; absent on responses.
    pub key: Option<String>,
}

impl DialbackStanza {
    /// `<result from=originating to=receiving>key</result>`
    pub fn result_request(
        from: ServerIdentity,
        to: ServerIdentity,
        key: impl Into<String>,
    ) -> Self {
        Self {
            element: DialbackElement::Result,
            from,
            to,
            id: None,
            stanza_type: None,
            key: Some(key.into()),
        }
    }

    /// `<result from=receiving to=originating type=valid|invalid/>`
    pub fn result_response(from: ServerIdentity, to: ServerIdentity, valid: bool) -> Self {
        Self {
            element: DialbackElement::Result,
            from,
            to,
            id: None,
            stanza_type: Some(type_attr(valid).to_owned()),
            key: None,
        }
    }

    /// `<verify from=receiving to=originating id=sid>key</verify>`
    pub fn verify_request(
        from: ServerIdentity,
        to: ServerIdentity,
        id: StreamId,
        key: impl Into<String>,
    ) -> Self {
        Self {
            element: DialbackElement::Verify,
            from,
            to,
            id: Some(id),
            stanza_type: None,
            key: Some(key.into()),
        }
    }

    /// `<verify from=originating to=receiving id=sid type=valid|invalid/>`
    pub fn verify_response(
        from: ServerIdentity,
        to: ServerIdentity,
        id: StreamId,
        valid: bool,
    ) -> Self {
        Self {
            element: DialbackElement::Verify,
            from,
            to,
            id: Some(id),
            stanza_type: Some(type_attr(valid).to_owned()),
            key: None,
        }
    }

    /// Requests carry no `type` attribute; responses always do.
    pub fn kind(&self) -> StanzaKind {
        match (self.element, self.stanza_type.is_some()) {
            (DialbackElement::Result, false) => StanzaKind::ResultRequest,
            (DialbackElement::Result, true) => StanzaKind::ResultResponse,
            (DialbackElement::Verify, false) => StanzaKind::VerifyRequest,
            (DialbackElement::Verify, true) => StanzaKind::VerifyResponse,
        }
    }

    /// `type="valid"` means success; any other value is a failure.
    pub fn is_valid(&self) -> bool {
        self.stanza_type.as_deref() == Some(TYPE_VALID)
    }
}

fn type_attr(valid: bool) -> &'static str {
    if valid { TYPE_VALID } else { TYPE_INVALID }
}
