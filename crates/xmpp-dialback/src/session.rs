//! Per-stream dialback state machine.
//!
//! ```text
//! Originating:  Idle ──initialize──► ResultPending ──result──► Verified | Failed
//! Receiving:    Idle ──await_verification──► VerifyPending ──outcome──► Verified | Failed
//!               any non-terminal state ──stream error / close──► Failed
//! ```
//!
//! Each session keeps a small table of the stream events it currently
//! observes. The table is filled on entry to a waiting state and cleared in
//! the same step that reaches a terminal state, so a late event can never
//! reopen a finished session.
//!
//! The Authoritative role is a stateless request/response check and lives in
//! [`crate::authoritative`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bitflags::bitflags;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    error::{DialbackError, DialbackResult},
    keys::derive_key,
    stanza::{DialbackStanza, StanzaKind},
    stream::XmlStream,
    types::{DialbackOutcome, ServerIdentity, StreamId},
};

// ─── Events ──────────────────────────────────────────────────────────────────

bitflags! {
    /// Stream event kinds a session can observe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Observed: u8 {
        const RESULT        = 0b001;
        const STREAM_ERROR  = 0b010;
        const STREAM_CLOSED = 0b100;
    }
}

/// An inbound event on the stream a session is bound to.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A `<result type=…/>` response from the Receiving Server.
    Result(DialbackStanza),
    /// A stream-level error.
    Error(String),
    /// The stream closed.
    Closed,
}

impl StreamEvent {
    fn kind(&self) -> Observed {
        match self {
            Self::Result(_) => Observed::RESULT,
            Self::Error(_) => Observed::STREAM_ERROR,
            Self::Closed => Observed::STREAM_CLOSED,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Originating,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Originating: key sent, waiting for the result.
    ResultPending,
    /// Receiving: key forwarded to the Authoritative Server.
    VerifyPending,
    Verified,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

// ─── Completion ──────────────────────────────────────────────────────────────

/// Resolves exactly once with the outcome of one dialback attempt.
#[must_use = "a dialback attempt does nothing unless awaited"]
pub struct DialbackAttempt {
    rx: oneshot::Receiver<DialbackResult<()>>,
}

impl DialbackAttempt {
    fn channel() -> (oneshot::Sender<DialbackResult<()>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for DialbackAttempt {
    type Output = DialbackResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the session was discarded without resolving.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(DialbackError::StreamClosed)))
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One dialback exchange on one stream.
pub struct DialbackSession {
    role: Role,
    state: SessionState,
    stream: Arc<dyn XmlStream>,
    stream_id: StreamId,
    originating: ServerIdentity,
    receiving: ServerIdentity,
    observed: Observed,
    completion: Option<oneshot::Sender<DialbackResult<()>>>,
}

impl DialbackSession {
    /// Session for a stream we opened and must now authenticate.
    pub fn originating(stream: Arc<dyn XmlStream>) -> DialbackResult<(Self, DialbackAttempt)> {
        let stream_id = stream.stream_id().cloned().ok_or(DialbackError::MissingStreamId)?;
        let (tx, attempt) = DialbackAttempt::channel();
        let session = Self {
            role: Role::Originating,
            state: SessionState::Idle,
            originating: stream.this_host().clone(),
            receiving: stream.other_host().clone(),
            stream,
            stream_id,
            observed: Observed::empty(),
            completion: Some(tx),
        };
        Ok((session, attempt))
    }

    /// Session for a key an Originating Server sent on a stream we accepted.
    pub fn receiving(
        stream: Arc<dyn XmlStream>,
        request: &DialbackStanza,
    ) -> DialbackResult<(Self, DialbackAttempt)> {
        if request.kind() != StanzaKind::ResultRequest {
            return Err(DialbackError::ProtocolViolation(format!(
                "expected a dialback key, got {:?}",
                request.kind()
            )));
        }
        if request.key.as_deref().is_none_or(str::is_empty) {
            return Err(DialbackError::ProtocolViolation("dialback key is empty".into()));
        }
        if &request.to != stream.this_host() {
            return Err(DialbackError::ProtocolViolation(format!(
                "dialback key addressed to '{}' on a stream for '{}'",
                request.to,
                stream.this_host()
            )));
        }
        let stream_id = stream.stream_id().cloned().ok_or(DialbackError::MissingStreamId)?;

        let (tx, attempt) = DialbackAttempt::channel();
        let session = Self {
            role: Role::Receiving,
            state: SessionState::Idle,
            originating: request.from.clone(),
            receiving: request.to.clone(),
            stream,
            stream_id,
            observed: Observed::empty(),
            completion: Some(tx),
        };
        Ok((session, attempt))
    }

    // ── Originating ──────────────────────────────────────────────────────────

    /// Derive the key and send it, then wait for the result.
    ///
    /// Returns an error only for an out-of-sequence call; a failed send is
    /// reported through the session's [`DialbackAttempt`].
    pub fn initialize(&mut self, secret: &str) -> DialbackResult<()> {
        if self.role != Role::Originating || self.state != SessionState::Idle {
            warn!(
                "Dialback: key send requested in state {:?} for {} -> {} (stream {})",
                self.state, self.originating, self.receiving, self.stream_id
            );
            return Err(DialbackError::ProtocolViolation(format!(
                "key already sent or session in state {:?}",
                self.state
            )));
        }

        let key = derive_key(
            secret,
            self.receiving.as_str(),
            self.originating.as_str(),
            self.stream_id.as_str(),
        );

        self.observed = Observed::RESULT | Observed::STREAM_ERROR | Observed::STREAM_CLOSED;
        self.state = SessionState::ResultPending;

        let request =
            DialbackStanza::result_request(self.originating.clone(), self.receiving.clone(), key);
        if let Err(e) = self.stream.send(request) {
            self.finish(SessionState::Failed, Err(e));
            return Ok(());
        }
        debug!(
            "Dialback: sent key for {} -> {} (stream {})",
            self.originating, self.receiving, self.stream_id
        );
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Mark the key as forwarded to the Authoritative Server.
    pub fn await_verification(&mut self) -> DialbackResult<()> {
        if self.role != Role::Receiving || self.state != SessionState::Idle {
            return Err(DialbackError::ProtocolViolation(format!(
                "verification already requested or session in state {:?}",
                self.state
            )));
        }
        self.observed = Observed::STREAM_ERROR | Observed::STREAM_CLOSED;
        self.state = SessionState::VerifyPending;
        Ok(())
    }

    /// Apply the Authoritative Server's verdict and answer the Originating Server.
    ///
    /// Returns `false` when the session had already finished.
    pub fn complete_verification(&mut self, outcome: DialbackOutcome) -> bool {
        if self.state != SessionState::VerifyPending {
            debug!(
                "Dialback: dropping {:?} for finished session {} -> {} (stream {})",
                outcome, self.originating, self.receiving, self.stream_id
            );
            return false;
        }

        let response = DialbackStanza::result_response(
            self.receiving.clone(),
            self.originating.clone(),
            outcome.is_valid(),
        );
        if let Err(e) = self.stream.send(response) {
            self.finish(SessionState::Failed, Err(e));
            return true;
        }

        match outcome {
            DialbackOutcome::Valid => self.finish(SessionState::Verified, Ok(())),
            DialbackOutcome::Invalid => {
                self.finish(SessionState::Failed, Err(DialbackError::DialbackFailed))
            }
            DialbackOutcome::Error(reason) => {
                self.finish(SessionState::Failed, Err(DialbackError::StreamError(reason)))
            }
            DialbackOutcome::TimedOut => {
                self.finish(SessionState::Failed, Err(DialbackError::VerificationTimeout))
            }
        }
        true
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Feed one stream event. Events the session is not observing are ignored.
    ///
    /// Returns `true` when the event caused a transition.
    pub fn handle_event(&mut self, event: StreamEvent) -> bool {
        if !self.observed.contains(event.kind()) {
            debug!(
                "Dialback: ignoring {:?} in state {:?} (stream {})",
                event.kind(),
                self.state,
                self.stream_id
            );
            return false;
        }

        match event {
            StreamEvent::Result(stanza) => {
                if stanza.kind() != StanzaKind::ResultResponse
                    || stanza.from != self.receiving
                    || stanza.to != self.originating
                {
                    debug!(
                        "Dialback: result {} -> {} does not match session {} -> {}",
                        stanza.from, stanza.to, self.originating, self.receiving
                    );
                    return false;
                }
                if stanza.is_valid() {
                    self.finish(SessionState::Verified, Ok(()));
                } else {
                    self.finish(SessionState::Failed, Err(DialbackError::DialbackFailed));
                }
            }
            StreamEvent::Error(reason) => {
                self.finish(SessionState::Failed, Err(DialbackError::StreamError(reason)));
            }
            StreamEvent::Closed => {
                self.finish(SessionState::Failed, Err(DialbackError::StreamClosed));
            }
        }
        true
    }

    /// Deregister every observer and resolve the completion in one step.
    fn finish(&mut self, state: SessionState, result: DialbackResult<()>) {
        self.observed = Observed::empty();
        self.state = state;
        match &result {
            Ok(()) => info!(
                "Dialback: {} verified for {} ({:?}, stream {})",
                self.originating, self.receiving, self.role, self.stream_id
            ),
            Err(e) => warn!(
                "Dialback: {} -> {} failed ({:?}, stream {}): {}",
                self.originating, self.receiving, self.role, self.stream_id, e
            ),
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn observed(&self) -> Observed {
        self.observed
    }

    pub fn stream(&self) -> &Arc<dyn XmlStream> {
        &self.stream
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn originating_domain(&self) -> &ServerIdentity {
        &self.originating
    }

    pub fn receiving_domain(&self) -> &ServerIdentity {
        &self.receiving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStream;

    fn originating_session() -> (Arc<MockStream>, DialbackSession, DialbackAttempt) {
        let stream = MockStream::new("a.example", "b.example", Some("stream123"));
        let (session, attempt) = DialbackSession::originating(stream.clone()).unwrap();
        (stream, session, attempt)
    }

    fn valid_result() -> DialbackStanza {
        DialbackStanza::result_response("b.example".into(), "a.example".into(), true)
    }

    #[tokio::test]
    async fn initialize_sends_derived_key() {
        let (stream, mut session, _attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();

        assert_eq!(session.state(), SessionState::ResultPending);
        let sent = stream.last_sent().unwrap();
        assert_eq!(sent.kind(), StanzaKind::ResultRequest);
        assert_eq!(sent.from.as_str(), "a.example");
        assert_eq!(sent.to.as_str(), "b.example");
        assert_eq!(
            sent.key.as_deref(),
            Some(derive_key("s3cr3t", "b.example", "a.example", "stream123").as_str())
        );
    }

    #[tokio::test]
    async fn valid_result_verifies() {
        let (_stream, mut session, attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();

        assert!(session.handle_event(StreamEvent::Result(valid_result())));
        assert_eq!(session.state(), SessionState::Verified);
        assert!(session.observed().is_empty());
        assert!(attempt.await.is_ok());
    }

    #[tokio::test]
    async fn invalid_result_fails_with_dialback_failed() {
        let (_stream, mut session, attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();

        let rejected =
            DialbackStanza::result_response("b.example".into(), "a.example".into(), false);
        session.handle_event(StreamEvent::Result(rejected));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(attempt.await, Err(DialbackError::DialbackFailed)));
    }

    #[tokio::test]
    async fn first_event_wins() {
        let (_stream, mut session, attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();

        assert!(session.handle_event(StreamEvent::Error("connection reset".into())));
        // Late result after the stream error is ignored.
        assert!(!session.handle_event(StreamEvent::Result(valid_result())));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(attempt.await, Err(DialbackError::StreamError(r)) if r == "connection reset"));
    }

    #[tokio::test]
    async fn result_after_terminal_is_idempotent() {
        let (_stream, mut session, _attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();
        session.handle_event(StreamEvent::Result(valid_result()));

        let rejected =
            DialbackStanza::result_response("b.example".into(), "a.example".into(), false);
        assert!(!session.handle_event(StreamEvent::Result(rejected)));
        assert_eq!(session.state(), SessionState::Verified);
    }

    #[tokio::test]
    async fn second_initialize_is_protocol_violation() {
        let (stream, mut session, _attempt) = originating_session();
        session.initialize("s3cr3t").unwrap();
        let err = session.initialize("s3cr3t").unwrap_err();
        assert!(matches!(err, DialbackError::ProtocolViolation(_)));
        assert_eq!(session.state(), SessionState::ResultPending);
        assert_eq!(stream.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_on_closed_stream_fails_attempt() {
        let (stream, mut session, attempt) = originating_session();
        stream.close();
        session.initialize("s3cr3t").unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(attempt.await, Err(DialbackError::StreamClosed)));
    }

    #[tokio::test]
    async fn result_before_initialize_is_ignored() {
        let (_stream, mut session, _attempt) = originating_session();
        assert!(!session.handle_event(StreamEvent::Result(valid_result())));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn originating_requires_stream_id() {
        let stream = MockStream::new("a.example", "b.example", None);
        assert!(matches!(
            DialbackSession::originating(stream),
            Err(DialbackError::MissingStreamId)
        ));
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    fn key_request() -> DialbackStanza {
        DialbackStanza::result_request("a.example".into(), "b.example".into(), "abc123")
    }

    #[test]
    fn domains_follow_role() {
        let (_stream, session, _attempt) = originating_session();
        assert_eq!(session.role(), Role::Originating);
        assert_eq!(session.originating_domain().as_str(), "a.example");
        assert_eq!(session.receiving_domain().as_str(), "b.example");

        let stream = MockStream::new("b.example", "a.example", Some("stream123"));
        let (session, _attempt) = DialbackSession::receiving(stream, &key_request()).unwrap();
        assert_eq!(session.role(), Role::Receiving);
        assert_eq!(session.originating_domain().as_str(), "a.example");
        assert_eq!(session.receiving_domain().as_str(), "b.example");
        assert_eq!(session.stream_id().as_str(), "stream123");
    }

    #[tokio::test]
    async fn receiving_answers_with_outcome() {
        let stream = MockStream::new("b.example", "a.example", Some("stream123"));
        let (mut session, attempt) = DialbackSession::receiving(stream.clone(), &key_request()).unwrap();
        session.await_verification().unwrap();
        assert_eq!(session.state(), SessionState::VerifyPending);

        assert!(session.complete_verification(DialbackOutcome::Valid));
        assert_eq!(session.state(), SessionState::Verified);
        assert!(attempt.await.is_ok());

        let sent = stream.last_sent().unwrap();
        assert_eq!(sent.kind(), StanzaKind::ResultResponse);
        assert!(sent.is_valid());
        assert_eq!(sent.from.as_str(), "b.example");
        assert_eq!(sent.to.as_str(), "a.example");
    }

    #[tokio::test]
    async fn receiving_timeout_sends_failure() {
        let stream = MockStream::new("b.example", "a.example", Some("stream123"));
        let (mut session, attempt) = DialbackSession::receiving(stream.clone(), &key_request()).unwrap();
        session.await_verification().unwrap();

        session.complete_verification(DialbackOutcome::TimedOut);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!stream.last_sent().unwrap().is_valid());
        assert!(matches!(attempt.await, Err(DialbackError::VerificationTimeout)));
    }

    #[tokio::test]
    async fn closed_receiving_session_ignores_late_outcome() {
        let stream = MockStream::new("b.example", "a.example", Some("stream123"));
        let (mut session, attempt) = DialbackSession::receiving(stream.clone(), &key_request()).unwrap();
        session.await_verification().unwrap();

        assert!(session.handle_event(StreamEvent::Closed));
        assert!(!session.complete_verification(DialbackOutcome::Valid));
        assert!(stream.sent().is_empty());
        assert!(matches!(attempt.await, Err(DialbackError::StreamClosed)));
    }

    #[test]
    fn receiving_rejects_malformed_requests() {
        let stream = MockStream::new("b.example", "a.example", Some("stream123"));

        let wrong_host = DialbackStanza::result_request("a.example".into(), "c.example".into(), "k");
        assert!(matches!(
            DialbackSession::receiving(stream.clone(), &wrong_host),
            Err(DialbackError::ProtocolViolation(_))
        ));

        let empty_key = DialbackStanza::result_request("a.example".into(), "b.example".into(), "");
        assert!(DialbackSession::receiving(stream.clone(), &empty_key).is_err());

        let response = DialbackStanza::result_response("a.example".into(), "b.example".into(), true);
        assert!(DialbackSession::receiving(stream, &response).is_err());
    }
}
