//! Boundary to the chain transport.
//!
//! [`Connector`] is what the engine consumes: an ordered, replayable event
//! stream and a submission endpoint for signed instructions. The
//! [`ChannelConnector`] is the in-process implementation: an external indexer
//! pushes raw records in, an external relayer drains the outbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use w3b2_shared::error::DecodeError;
use w3b2_shared::events::{BridgeEvent, RawEvent};
use w3b2_shared::protocol::{SignedSubmission, SubmissionId};
use w3b2_shared::types::EventPosition;

use crate::error::BridgeError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Submission rejected: {0}")]
    Rejected(String),
}

impl From<ConnectorError> for BridgeError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Unavailable(reason) => BridgeError::ChainUnavailable(reason),
            ConnectorError::Rejected(reason) => BridgeError::Rejected(reason),
        }
    }
}

pub type EventStream = BoxStream<'static, Result<RawEvent, ConnectorError>>;

/// Chain transport consumed by the engine.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Ordered raw records strictly after `from`. Delivery is at-least-once.
    async fn stream_events(&self, from: EventPosition) -> Result<EventStream, ConnectorError>;

    /// Hand a signed instruction over for broadcast.
    async fn submit_transaction(
        &self,
        submission: SignedSubmission,
    ) -> Result<SubmissionId, ConnectorError>;
}

struct Inner {
    log: Mutex<Vec<RawEvent>>,
    outbox: Mutex<Vec<(SubmissionId, SignedSubmission)>>,
    online: AtomicBool,
    appended: watch::Sender<usize>,
}

/// In-process connector backed by an append-only buffer.
#[derive(Clone)]
pub struct ChannelConnector {
    inner: Arc<Inner>,
}

impl Default for ChannelConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelConnector {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(Vec::new()),
                outbox: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                appended,
            }),
        }
    }

    fn log(&self) -> MutexGuard<'_, Vec<RawEvent>> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbox(&self) -> MutexGuard<'_, Vec<(SubmissionId, SignedSubmission)>> {
        self.inner
            .outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a raw record as delivered by the indexer. Duplicates and
    /// out-of-order records are buffered as given.
    pub fn push_event(&self, raw: RawEvent) {
        let len = {
            let mut log = self.log();
            log.push(raw);
            log.len()
        };
        self.inner.appended.send_replace(len);
    }

    /// Encode and append `event` at the next sequence number.
    pub fn emit(&self, event: &BridgeEvent) -> Result<EventPosition, DecodeError> {
        let position = {
            let log = self.log();
            let seq = log.iter().map(|e| e.position.seq).max().unwrap_or(0) + 1;
            EventPosition {
                slot: seq * 2,
                seq,
                signature: format!("sim-{seq:08}"),
            }
        };
        self.push_event(event.to_raw(position.clone())?);
        Ok(position)
    }

    /// Simulate the transport going down or coming back.
    pub fn set_online(&self, online: bool) {
        info!(online, "channel connector availability changed");
        self.inner.online.store(online, Ordering::SeqCst);
        // Wake streams so they notice the change.
        let len = self.log().len();
        self.inner.appended.send_replace(len);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn event_count(&self) -> usize {
        self.log().len()
    }

    /// Take every queued submission, oldest first.
    pub fn drain_outbox(&self) -> Vec<(SubmissionId, SignedSubmission)> {
        std::mem::take(&mut *self.outbox())
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox().len()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn stream_events(&self, from: EventPosition) -> Result<EventStream, ConnectorError> {
        if !self.is_online() {
            return Err(ConnectorError::Unavailable("connector offline".into()));
        }
        debug!(from_seq = from.seq, "opening event stream");

        let after = from.seq;
        let state = (self.clone(), 0usize, self.inner.appended.subscribe());
        let events = stream::unfold(state, move |(connector, mut index, mut rx)| {
            async move {
                loop {
                    if !connector.is_online() {
                        let err = ConnectorError::Unavailable("connector offline".into());
                        return Some((Err(err), (connector, index, rx)));
                    }

                    let next = {
                        let log = connector.log();
                        let mut found = None;
                        while index < log.len() {
                            let raw = &log[index];
                            index += 1;
                            if raw.position.seq > after {
                                found = Some(raw.clone());
                                break;
                            }
                        }
                        found
                    };
                    if let Some(raw) = next {
                        return Some((Ok(raw), (connector, index, rx)));
                    }

                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    async fn submit_transaction(
        &self,
        submission: SignedSubmission,
    ) -> Result<SubmissionId, ConnectorError> {
        if !self.is_online() {
            return Err(ConnectorError::Unavailable("connector offline".into()));
        }
        if submission.verify().is_err() {
            return Err(ConnectorError::Rejected("bad signature".into()));
        }

        let id = SubmissionId(uuid::Uuid::new_v4().to_string());
        debug!(submission = %id, signer = %submission.signer.short(), "submission queued");
        self.outbox().push((id.clone(), submission));
        Ok(id)
    }
}
