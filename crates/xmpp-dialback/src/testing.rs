//! In-memory stream doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::{
    error::{DialbackError, DialbackResult},
    stanza::DialbackStanza,
    stream::{AuthoritativeConnector, XmlStream},
    types::{ServerIdentity, StreamId},
};

/// Records every stanza sent on it.
pub struct MockStream {
    this_host: ServerIdentity,
    other_host: ServerIdentity,
    stream_id: Option<StreamId>,
    sent: Mutex<Vec<DialbackStanza>>,
    open: AtomicBool,
}

impl MockStream {
    pub fn new(this_host: &str, other_host: &str, stream_id: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            this_host: this_host.into(),
            other_host: other_host.into(),
            stream_id: stream_id.map(StreamId::from),
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<DialbackStanza> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Option<DialbackStanza> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl XmlStream for MockStream {
    fn this_host(&self) -> &ServerIdentity {
        &self.this_host
    }

    fn other_host(&self) -> &ServerIdentity {
        &self.other_host
    }

    fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    fn send(&self, stanza: DialbackStanza) -> DialbackResult<()> {
        if !self.is_usable() {
            return Err(DialbackError::StreamClosed);
        }
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Hands out [`MockStream`]s and remembers them.
#[derive(Default)]
pub struct MockConnector {
    opened: Mutex<Vec<Arc<MockStream>>>,
    unreachable: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> Vec<Arc<MockStream>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }
}

impl AuthoritativeConnector for MockConnector {
    fn open(
        &self,
        local: &ServerIdentity,
        remote: &ServerIdentity,
    ) -> DialbackResult<Arc<dyn XmlStream>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("connection to {remote} refused").into());
        }
        let stream = MockStream::new(local.as_str(), remote.as_str(), None);
        self.opened.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}
