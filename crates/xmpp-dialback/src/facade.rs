//! Entry point for the surrounding server.
//!
//! The stream layer calls into [`DialbackFacade`] for three things:
//!
//! - **Originating**: [`start_outbound`](DialbackFacade::start_outbound) once a
//!   stream we opened has its stream ID; the returned [`DialbackAttempt`]
//!   resolves once with success or a typed failure.
//! - **Inbound stanzas**: [`dispatch`](DialbackFacade::dispatch) for every
//!   `jabber:server:dialback` element received on any stream; it routes key
//!   sends (Receiving), results (Originating), verify requests (Authoritative)
//!   and verify responses (coordinator).
//! - **Stream failures**: [`stream_error`](DialbackFacade::stream_error) and
//!   [`stream_closed`](DialbackFacade::stream_closed).
//!
//! A failed attempt is reported once. Retrying is up to the caller.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    authoritative::answer_verify,
    config::DialbackConfig,
    coordinator::{PendingVerification, VerificationCoordinator},
    error::{DialbackError, DialbackResult},
    secrets::SecretResolver,
    session::{DialbackAttempt, DialbackSession, Role, StreamEvent},
    stanza::{DialbackStanza, StanzaKind},
    stream::{AuthoritativeConnector, XmlStream},
    types::{DialbackOutcome, ServerIdentity, StreamId},
};

type SessionHandle = Arc<Mutex<DialbackSession>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    role: Role,
    stream_id: StreamId,
    originating: ServerIdentity,
}

struct Registered {
    stream: Arc<dyn XmlStream>,
    session: SessionHandle,
}

type Registry = Arc<RwLock<HashMap<SessionKey, Registered>>>;

// ─── Facade ──────────────────────────────────────────────────────────────────

/// Wires dialback sessions to streams, secrets and the verification coordinator.
pub struct DialbackFacade {
    secrets: Arc<dyn SecretResolver>,
    coordinator: VerificationCoordinator,
    /// Non-terminal sessions only.
    sessions: Registry,
}

impl DialbackFacade {
    pub fn new(
        secrets: Arc<dyn SecretResolver>,
        connector: Arc<dyn AuthoritativeConnector>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            secrets,
            coordinator: VerificationCoordinator::with_timeout(connector, verify_timeout),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &DialbackConfig, connector: Arc<dyn AuthoritativeConnector>) -> Self {
        Self::new(Arc::new(config.secret_table()), connector, config.verify_timeout())
    }

    pub fn coordinator(&self) -> &VerificationCoordinator {
        &self.coordinator
    }

    /// Number of dialback exchanges still in progress.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ── Originating ──────────────────────────────────────────────────────────

    /// Send our dialback key on a stream we opened.
    pub async fn start_outbound(&self, stream: Arc<dyn XmlStream>) -> DialbackResult<DialbackAttempt> {
        let (mut session, attempt) = DialbackSession::originating(stream.clone())?;
        let secret = self
            .secrets
            .secret_for(session.originating_domain(), session.receiving_domain())
            .ok_or_else(|| DialbackError::NoSecret(session.originating_domain().to_string()))?;

        let key = SessionKey {
            role: Role::Originating,
            stream_id: session.stream_id().clone(),
            originating: session.originating_domain().clone(),
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            warn!(
                "Dialback: {} already sent a key on stream {}",
                key.originating, key.stream_id
            );
            return Err(DialbackError::ProtocolViolation(format!(
                "dialback for {} already in progress on stream {}",
                key.originating, key.stream_id
            )));
        }

        session.initialize(&secret)?;
        if !session.is_terminal() {
            sessions.insert(key, Registered { stream, session: Arc::new(Mutex::new(session)) });
        }
        Ok(attempt)
    }

    /// Apply a `<result type=…/>` from the Receiving Server.
    ///
    /// Returns `false` if no session was waiting for it.
    pub async fn handle_result_response(
        &self,
        stream: &Arc<dyn XmlStream>,
        response: &DialbackStanza,
    ) -> DialbackResult<bool> {
        let stream_id = stream.stream_id().ok_or(DialbackError::MissingStreamId)?;
        let key = SessionKey {
            role: Role::Originating,
            stream_id: stream_id.clone(),
            originating: response.to.clone(),
        };

        let handle = self.sessions.read().await.get(&key).map(|r| r.session.clone());
        let Some(handle) = handle else {
            debug!(
                "Dialback: result for {} on stream {} with no session waiting",
                key.originating, key.stream_id
            );
            return Ok(false);
        };

        let transitioned = handle.lock().await.handle_event(StreamEvent::Result(response.clone()));
        if transitioned {
            unregister(&self.sessions, &key, &handle).await;
        }
        Ok(transitioned)
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Accept a dialback key from an Originating Server and have it verified.
    ///
    /// A second key for the same domain on the same stream while the first is
    /// still being verified is rejected without touching the first.
    pub async fn handle_result_request(
        &self,
        stream: Arc<dyn XmlStream>,
        request: &DialbackStanza,
    ) -> DialbackResult<DialbackAttempt> {
        let (mut session, attempt) = DialbackSession::receiving(stream.clone(), request)?;
        let key = SessionKey {
            role: Role::Receiving,
            stream_id: session.stream_id().clone(),
            originating: session.originating_domain().clone(),
        };
        let pending = PendingVerification::new(
            session.stream_id().clone(),
            session.originating_domain().clone(),
            session.receiving_domain().clone(),
            request.key.clone().unwrap_or_default(),
        );

        let handle = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&key) {
                warn!(
                    "Dialback: second key from {} on stream {} while verification is pending",
                    key.originating, key.stream_id
                );
                return Err(DialbackError::ProtocolViolation(format!(
                    "duplicate dialback key from {} on stream {}",
                    key.originating, key.stream_id
                )));
            }
            session.await_verification()?;
            let handle = Arc::new(Mutex::new(session));
            sessions.insert(key.clone(), Registered { stream, session: handle.clone() });
            handle
        };

        let outcome = match self.coordinator.submit(pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dialback: could not send verify for {}: {}", key.originating, e);
                handle.lock().await.complete_verification(DialbackOutcome::Error(e.to_string()));
                unregister(&self.sessions, &key, &handle).await;
                return Ok(attempt);
            }
        };

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let verdict = outcome.await;
            handle.lock().await.complete_verification(verdict);
            unregister(&sessions, &key, &handle).await;
        });

        Ok(attempt)
    }

    // ── Authoritative ────────────────────────────────────────────────────────

    /// Answer a `<verify/>` request on the stream it arrived on.
    pub fn handle_verify_request(
        &self,
        stream: &dyn XmlStream,
        request: &DialbackStanza,
    ) -> DialbackResult<()> {
        if &request.to != stream.this_host() {
            warn!(
                "Dialback: verify for {} arrived on a stream for {}",
                request.to,
                stream.this_host()
            );
            return Err(DialbackError::ProtocolViolation(format!(
                "verify request addressed to '{}' on a stream for '{}'",
                request.to,
                stream.this_host()
            )));
        }
        let answer = answer_verify(self.secrets.as_ref(), request)?;
        stream.send(answer)
    }

    /// Hand a `<verify type=…/>` answer to the coordinator.
    ///
    /// Returns `false` if nothing was pending for it, or if it did not arrive
    /// on the authoritative stream the request went out on.
    pub async fn handle_verify_response(
        &self,
        stream: &Arc<dyn XmlStream>,
        response: &DialbackStanza,
    ) -> DialbackResult<bool> {
        if response.kind() != StanzaKind::VerifyResponse {
            return Err(DialbackError::ProtocolViolation(format!(
                "expected a verify response, got {:?}",
                response.kind()
            )));
        }
        let stream_id = response
            .id
            .as_ref()
            .ok_or_else(|| DialbackError::ProtocolViolation("verify response without id".into()))?;
        let outcome =
            if response.is_valid() { DialbackOutcome::Valid } else { DialbackOutcome::Invalid };
        Ok(self
            .coordinator
            .resolve(stream, stream_id, &response.from, &response.to, outcome)
            .await)
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    /// Route any inbound dialback stanza. Returns an attempt handle when the
    /// stanza started a Receiving-side verification.
    pub async fn dispatch(
        &self,
        stream: &Arc<dyn XmlStream>,
        stanza: &DialbackStanza,
    ) -> DialbackResult<Option<DialbackAttempt>> {
        match stanza.kind() {
            StanzaKind::ResultRequest => {
                self.handle_result_request(stream.clone(), stanza).await.map(Some)
            }
            StanzaKind::ResultResponse => {
                self.handle_result_response(stream, stanza).await.map(|_| None)
            }
            StanzaKind::VerifyRequest => {
                self.handle_verify_request(stream.as_ref(), stanza).map(|_| None)
            }
            StanzaKind::VerifyResponse => {
                self.handle_verify_response(stream, stanza).await.map(|_| None)
            }
        }
    }

    // ── Stream failures ──────────────────────────────────────────────────────

    /// A stream reported an error. Fails every session bound to it and every
    /// verification sent on it. Returns how many were failed.
    pub async fn stream_error(&self, stream: &Arc<dyn XmlStream>, reason: &str) -> usize {
        let sessions = self.fail_bound_sessions(stream, StreamEvent::Error(reason.to_owned())).await;
        sessions + self.coordinator.stream_failed(stream, reason).await
    }

    /// A stream closed. Same as [`stream_error`](Self::stream_error) with a
    /// `StreamClosed` failure.
    pub async fn stream_closed(&self, stream: &Arc<dyn XmlStream>) -> usize {
        let sessions = self.fail_bound_sessions(stream, StreamEvent::Closed).await;
        sessions + self.coordinator.stream_failed(stream, "stream closed").await
    }

    async fn fail_bound_sessions(&self, stream: &Arc<dyn XmlStream>, event: StreamEvent) -> usize {
        let bound: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, r)| Arc::ptr_eq(&r.stream, stream))
                .map(|(k, _)| k.clone())
                .collect();
            let removed: Vec<SessionHandle> =
                keys.iter().filter_map(|k| sessions.remove(k)).map(|r| r.session).collect();
            removed
        };

        let mut failed = 0;
        for handle in bound {
            if handle.lock().await.handle_event(event.clone()) {
                failed += 1;
            }
        }
        failed
    }
}

/// Drop `key` from the registry if it still points at `handle`.
async fn unregister(sessions: &Registry, key: &SessionKey, handle: &SessionHandle) {
    let mut sessions = sessions.write().await;
    if sessions.get(key).is_some_and(|r| Arc::ptr_eq(&r.session, handle)) {
        sessions.remove(key);
    }
}
