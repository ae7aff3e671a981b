//! Chain listener: turns the connector's raw record stream into an ordered,
//! restartable sequence of decoded events.
//!
//! The sequence never ends on its own. Transport failures surface as
//! [`ListenerItem::Unavailable`] markers, followed by a reconnect from the
//! furthest position seen after an exponential backoff delay.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, info, warn};

use w3b2_shared::events::{decode, Decoded, EventEnvelope};
use w3b2_shared::types::EventPosition;

use crate::connector::{Connector, EventStream};
use crate::error::BridgeError;

/// Reconnect delay policy: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Why a record produced no event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownTag(String),
    Malformed(String),
}

#[derive(Debug, Clone)]
pub enum ListenerItem {
    Event(EventEnvelope),
    /// A record that decoded to nothing. Still advances the checkpoint.
    Skipped {
        position: EventPosition,
        reason: SkipReason,
    },
    /// The transport failed; the listener reconnects after `retry_in`.
    Unavailable {
        attempt: u32,
        retry_in: Duration,
        error: String,
    },
}

impl ListenerItem {
    pub fn position(&self) -> Option<&EventPosition> {
        match self {
            Self::Event(envelope) => Some(&envelope.position),
            Self::Skipped { position, .. } => Some(position),
            Self::Unavailable { .. } => None,
        }
    }
}

struct ListenerState {
    connector: Arc<dyn Connector>,
    resume_from: EventPosition,
    events: Option<EventStream>,
    attempt: u32,
    pending_delay: Option<Duration>,
    backoff: Backoff,
}

impl ListenerState {
    fn fail(&mut self, error: BridgeError) -> ListenerItem {
        let retry_in = self.backoff.delay(self.attempt);
        warn!(
            attempt = self.attempt,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %error,
            "chain transport failed, backing off"
        );
        let item = ListenerItem::Unavailable {
            attempt: self.attempt,
            retry_in,
            error: error.to_string(),
        };
        self.events = None;
        self.attempt = self.attempt.saturating_add(1);
        self.pending_delay = Some(retry_in);
        item
    }
}

/// Start listening strictly after `checkpoint`.
pub fn resume(
    connector: Arc<dyn Connector>,
    checkpoint: EventPosition,
    backoff: Backoff,
) -> impl Stream<Item = ListenerItem> + Send + 'static {
    info!(seq = checkpoint.seq, slot = checkpoint.slot, "chain listener resuming");

    let state = ListenerState {
        connector,
        resume_from: checkpoint,
        events: None,
        attempt: 0,
        pending_delay: None,
        backoff,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delay) = state.pending_delay.take() {
                tokio::time::sleep(delay).await;
            }

            let events = match state.events.as_mut() {
                Some(events) => events,
                None => {
                    match state
                        .connector
                        .stream_events(state.resume_from.clone())
                        .await
                    {
                        Ok(events) => {
                            if state.attempt > 0 {
                                info!(attempts = state.attempt, "chain transport reconnected");
                            }
                            state.attempt = 0;
                            state.events = Some(events);
                            continue;
                        }
                        Err(e) => {
                            let item = state.fail(BridgeError::ChainUnavailable(e.to_string()));
                            return Some((item, state));
                        }
                    }
                }
            };

            match events.next().await {
                Some(Ok(raw)) => {
                    if raw.position.seq > state.resume_from.seq {
                        state.resume_from = raw.position.clone();
                    }
                    let item = match decode(&raw) {
                        Ok(Decoded::Known(event)) => ListenerItem::Event(EventEnvelope {
                            position: raw.position,
                            event,
                        }),
                        Ok(Decoded::Unknown(tag)) => {
                            debug!(
                                seq = raw.position.seq,
                                tag = %tag,
                                "skipping unknown event tag"
                            );
                            ListenerItem::Skipped {
                                position: raw.position,
                                reason: SkipReason::UnknownTag(tag),
                            }
                        }
                        Err(e) => {
                            let err = BridgeError::InvalidEvent {
                                seq: raw.position.seq,
                                reason: e.to_string(),
                            };
                            warn!(error = %err, "skipping undecodable event");
                            ListenerItem::Skipped {
                                position: raw.position,
                                reason: SkipReason::Malformed(e.to_string()),
                            }
                        }
                    };
                    return Some((item, state));
                }
                Some(Err(e)) => {
                    let item = state.fail(BridgeError::ChainUnavailable(e.to_string()));
                    return Some((item, state));
                }
                None => {
                    let item = state.fail(BridgeError::ChainUnavailable(
                        "event stream ended".into(),
                    ));
                    return Some((item, state));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use w3b2_shared::events::{AdminProfileClosed, BridgeEvent, RawEvent};
    use w3b2_shared::types::Pubkey;

    use super::*;
    use crate::connector::ChannelConnector;

    fn backoff() -> Backoff {
        Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        }
    }

    fn closed(byte: u8) -> BridgeEvent {
        BridgeEvent::AdminProfileClosed(AdminProfileClosed {
            authority: Pubkey([byte; 32]),
            ts: 0,
        })
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = Backoff {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_decodes_and_skips_in_order() {
        let connector = ChannelConnector::new();
        connector.emit(&closed(1)).unwrap();
        connector.push_event(RawEvent {
            position: EventPosition {
                slot: 4,
                seq: 2,
                signature: "x".into(),
            },
            tag: "FutureEvent".into(),
            data: vec![],
        });
        connector.emit(&closed(3)).unwrap();

        let items: Vec<_> = resume(Arc::new(connector), EventPosition::genesis(), backoff())
            .take(3)
            .collect()
            .await;

        assert!(matches!(&items[0], ListenerItem::Event(e) if e.seq() == 1));
        assert!(matches!(
            &items[1],
            ListenerItem::Skipped {
                reason: SkipReason::UnknownTag(tag),
                ..
            } if tag == "FutureEvent"
        ));
        assert!(matches!(&items[2], ListenerItem::Event(e) if e.seq() == 3));
    }

    #[tokio::test]
    async fn test_reconnects_after_outage() {
        let connector = ChannelConnector::new();
        connector.emit(&closed(1)).unwrap();
        connector.set_online(false);

        let mut items = Box::pin(resume(
            Arc::new(connector.clone()),
            EventPosition::genesis(),
            backoff(),
        ));

        let first = items.next().await.unwrap();
        assert!(matches!(first, ListenerItem::Unavailable { attempt: 0, .. }));
        let second = items.next().await.unwrap();
        assert!(matches!(second, ListenerItem::Unavailable { attempt: 1, .. }));

        connector.set_online(true);
        let next = loop {
            match items.next().await.unwrap() {
                ListenerItem::Unavailable { .. } => continue,
                other => break other,
            }
        };
        assert_eq!(next.position().map(|p| p.seq), Some(1));
    }
}
