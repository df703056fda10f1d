//! Receiving-side verification coordinator.
//!
//! Tracks every verify request this server has sent to an Authoritative
//! Server, keyed by `(stream id, originating domain)`, and hands the verdict
//! back to whoever is waiting on it.
//!
//! ```text
//!  receiving session ──submit──► coordinator ──<verify/>──► authoritative stream
//!          ▲                         │  ▲                          │
//!          └──── PendingOutcome ◄────┘  └──── resolve / timeout ◄──┘
//! ```
//!
//! Outbound streams to Authoritative Servers are cached per
//! `(local, authoritative)` pair and shared by concurrent verifications; a new
//! one is opened only when the cached stream is no longer usable.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{sync::oneshot, sync::Mutex, task::AbortHandle};
use tracing::{debug, info, warn};

use crate::{
    config::DEFAULT_VERIFY_TIMEOUT_SECS,
    error::{DialbackError, DialbackResult},
    stanza::DialbackStanza,
    stream::{AuthoritativeConnector, XmlStream},
    types::{DialbackOutcome, ServerIdentity, StreamId},
};

// ─── Pending verification ────────────────────────────────────────────────────

/// A dialback key waiting for the Authoritative Server's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerification {
    pub stream_id: StreamId,
    pub originating: ServerIdentity,
    pub receiving: ServerIdentity,
    pub key: String,
}

impl PendingVerification {
    pub fn new(
        stream_id: StreamId,
        originating: ServerIdentity,
        receiving: ServerIdentity,
        key: impl Into<String>,
    ) -> Self {
        Self { stream_id, originating, receiving, key: key.into() }
    }

    fn lookup_key(&self) -> PendingKey {
        PendingKey { stream_id: self.stream_id.clone(), originating: self.originating.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    stream_id: StreamId,
    originating: ServerIdentity,
}

struct PendingEntry {
    request: PendingVerification,
    /// Stream the verify request went out on.
    stream: Arc<dyn XmlStream>,
    waiters: Vec<oneshot::Sender<DialbackOutcome>>,
    serial: u64,
    timer: AbortHandle,
}

impl PendingEntry {
    fn finish(self, outcome: DialbackOutcome) {
        self.timer.abort();
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Resolves once with the verdict for one submitted verification.
#[must_use = "a pending outcome does nothing unless awaited"]
pub struct PendingOutcome {
    rx: oneshot::Receiver<DialbackOutcome>,
}

impl Future for PendingOutcome {
    type Output = DialbackOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| DialbackOutcome::Error("verification abandoned".into())))
    }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

/// Owns all in-flight verify requests and the streams they were sent on.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct VerificationCoordinator {
    connector: Arc<dyn AuthoritativeConnector>,
    timeout: Duration,
    pending: Arc<Mutex<HashMap<PendingKey, PendingEntry>>>,
    /// (local, authoritative) → outbound stream
    streams: Arc<Mutex<HashMap<(ServerIdentity, ServerIdentity), Arc<dyn XmlStream>>>>,
    next_serial: Arc<AtomicU64>,
}

impl VerificationCoordinator {
    pub fn new(connector: Arc<dyn AuthoritativeConnector>) -> Self {
        Self::with_timeout(connector, Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS))
    }

    pub fn with_timeout(connector: Arc<dyn AuthoritativeConnector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_serial: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a verify request and return a handle to its verdict.
    ///
    /// A second submission for the same `(stream id, originating)` while the
    /// first is in flight joins it instead of sending another request. A
    /// second submission carrying a different key is rejected.
    pub async fn submit(&self, request: PendingVerification) -> DialbackResult<PendingOutcome> {
        let lookup = request.lookup_key();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().await;

        if let Some(entry) = pending.get_mut(&lookup) {
            if entry.request.key != request.key {
                return Err(DialbackError::ProtocolViolation(format!(
                    "conflicting dialback key for {} on stream {}",
                    request.originating, request.stream_id
                )));
            }
            debug!(
                "Dialback: joining in-flight verification for {} (stream {})",
                request.originating, request.stream_id
            );
            entry.waiters.push(tx);
            return Ok(PendingOutcome { rx });
        }

        let stream = self.authoritative_stream(&request.receiving, &request.originating).await?;
        let verify = DialbackStanza::verify_request(
            request.receiving.clone(),
            request.originating.clone(),
            request.stream_id.clone(),
            request.key.clone(),
        );
        if let Err(e) = stream.send(verify) {
            self.evict_stream(&stream).await;
            return Err(e);
        }
        debug!(
            "Dialback: verify sent to {} for stream {}",
            request.originating, request.stream_id
        );

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let timer = self.spawn_timer(lookup.clone(), serial);
        pending.insert(
            lookup,
            PendingEntry { request, stream, waiters: vec![tx], serial, timer },
        );

        Ok(PendingOutcome { rx })
    }

    /// Deliver a verdict that arrived on `stream`, addressed to `receiving`.
    ///
    /// Only the authoritative stream the request went out on may answer it,
    /// and only for the domain that asked. Anything else is discarded and
    /// leaves the pending entry in place. Returns `false` (and logs) when
    /// nothing was resolved.
    pub async fn resolve(
        &self,
        stream: &Arc<dyn XmlStream>,
        stream_id: &StreamId,
        originating: &ServerIdentity,
        receiving: &ServerIdentity,
        outcome: DialbackOutcome,
    ) -> bool {
        let lookup = PendingKey { stream_id: stream_id.clone(), originating: originating.clone() };
        let entry = {
            let mut pending = self.pending.lock().await;
            match pending.get(&lookup) {
                None => {
                    warn!(
                        "Dialback: discarding {:?} from {} for stream {}: nothing pending",
                        outcome, originating, stream_id
                    );
                    return false;
                }
                Some(entry) if !Arc::ptr_eq(&entry.stream, stream) => {
                    warn!(
                        "Dialback: discarding {:?} from {} for stream {}: not received on the authoritative stream",
                        outcome, originating, stream_id
                    );
                    return false;
                }
                Some(entry) if &entry.request.receiving != receiving => {
                    warn!(
                        "Dialback: discarding {:?} from {} for stream {}: addressed to {}, not {}",
                        outcome, originating, stream_id, receiving, entry.request.receiving
                    );
                    return false;
                }
                Some(_) => {}
            }
            pending.remove(&lookup)
        };

        let Some(entry) = entry else {
            return false;
        };
        debug!("Dialback: {:?} from {} for stream {}", outcome, originating, stream_id);
        entry.finish(outcome);
        true
    }

    /// An authoritative stream errored or closed: fail everything sent on it
    /// and forget the stream. Returns how many verifications were failed.
    pub async fn stream_failed(&self, stream: &Arc<dyn XmlStream>, reason: &str) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, entry)| Arc::ptr_eq(&entry.stream, stream))
                .map(|(key, _)| key.clone())
                .collect();
            let removed: Vec<PendingEntry> =
                keys.iter().filter_map(|key| pending.remove(key)).collect();
            removed
        };
        self.evict_stream(stream).await;

        let count = failed.len();
        if count > 0 {
            warn!(
                "Dialback: authoritative stream to {} failed ({}), failing {} verification(s)",
                stream.other_host(),
                reason,
                count
            );
        }
        for entry in failed {
            entry.finish(DialbackOutcome::Error(reason.to_owned()));
        }
        count
    }

    /// Whether `stream` is one of our cached authoritative streams.
    pub async fn owns_stream(&self, stream: &Arc<dyn XmlStream>) -> bool {
        self.streams.lock().await.values().any(|s| Arc::ptr_eq(s, stream))
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn authoritative_stream(
        &self,
        local: &ServerIdentity,
        remote: &ServerIdentity,
    ) -> DialbackResult<Arc<dyn XmlStream>> {
        let mut streams = self.streams.lock().await;
        let slot = (local.clone(), remote.clone());

        if let Some(stream) = streams.get(&slot) {
            if stream.is_usable() {
                return Ok(stream.clone());
            }
            debug!("Dialback: cached stream to {} is no longer usable", remote);
        }

        info!("Dialback: opening authoritative stream {} -> {}", local, remote);
        let stream = self.connector.open(local, remote)?;
        streams.insert(slot, stream.clone());
        Ok(stream)
    }

    async fn evict_stream(&self, stream: &Arc<dyn XmlStream>) {
        self.streams.lock().await.retain(|_, s| !Arc::ptr_eq(s, stream));
    }

    fn spawn_timer(&self, lookup: PendingKey, serial: u64) -> AbortHandle {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.timeout).await;
            this.expire(lookup, serial).await;
        })
        .abort_handle()
    }

    async fn expire(&self, lookup: PendingKey, serial: u64) {
        let entry = {
            let mut pending = self.pending.lock().await;
            // A newer submission may reuse the key after this one resolved.
            let current = pending.get(&lookup).is_some_and(|entry| entry.serial == serial);
            if current { pending.remove(&lookup) } else { None }
        };
        if let Some(entry) = entry {
            warn!(
                "Dialback: verify for {} (stream {}) timed out after {:?}",
                lookup.originating, lookup.stream_id, self.timeout
            );
            entry.finish(DialbackOutcome::TimedOut);
        }
    }
}
