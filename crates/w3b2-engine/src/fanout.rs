//! Real-time notification fan-out.
//!
//! One `tokio::sync::broadcast` channel per topic. Publishing never blocks;
//! a subscriber that falls behind loses its oldest unread records and sees a
//! single [`NotificationRecord::Gap`] in their place.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use w3b2_shared::error::IdentityError;
use w3b2_shared::events::{BridgeEvent, EventEnvelope};
use w3b2_shared::types::{EventPosition, Pubkey, SessionId, SessionStatus};
use w3b2_store::{DispatchKey, DispatchRecord};

/// Subscription topic: everything, or records involving one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    All,
    Account(Pubkey),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::All => f.write_str("all"),
            Topic::Account(key) => write!(f, "account:{key}"),
        }
    }
}

impl FromStr for Topic {
    type Err = IdentityError;

    /// `all`, `account:<hex>` or a bare hex key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(Topic::All),
            other => {
                let hex = other.strip_prefix("account:").unwrap_or(other);
                Ok(Topic::Account(Pubkey::from_hex(hex)?))
            }
        }
    }
}

/// Listener / mirror health, served on demand and pushed on change.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncStatus {
    pub checkpoint: EventPosition,
    pub connected: bool,
    pub halted: bool,
    pub divergence: Option<String>,
    pub applied_events: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            checkpoint: EventPosition::genesis(),
            connected: false,
            halted: false,
            divergence: None,
            applied_events: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Session and command lifecycle notices.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    DispatchUpdated {
        record: DispatchRecord,
    },
    SessionOpened {
        session_id: SessionId,
        user: Pubkey,
        admin: Pubkey,
        expires_at: DateTime<Utc>,
    },
    SessionEnded {
        session_id: SessionId,
        user: Pubkey,
        admin: Pubkey,
        status: SessionStatus,
    },
    /// A confirmation for a dispatch that had already failed locally.
    ReconciliationAnomaly {
        key: DispatchKey,
        detail: String,
    },
}

impl Notice {
    fn accounts(&self) -> [Pubkey; 2] {
        match self {
            Notice::DispatchUpdated { record } => [record.key.user, record.key.admin],
            Notice::SessionOpened { user, admin, .. }
            | Notice::SessionEnded { user, admin, .. } => [*user, *admin],
            Notice::ReconciliationAnomaly { key, .. } => [key.user, key.admin],
        }
    }
}

/// Record delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationRecord {
    BlockchainEvent {
        position: EventPosition,
        event: BridgeEvent,
    },
    Notification {
        notice: Notice,
    },
    Status {
        status: SyncStatus,
    },
    /// `missed` records were dropped because the subscriber fell behind.
    Gap {
        missed: u64,
    },
}

pub type Subscription = BoxStream<'static, NotificationRecord>;

type Senders = HashMap<Topic, broadcast::Sender<NotificationRecord>>;

pub struct NotificationHub {
    capacity: usize,
    topics: RwLock<Senders>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topics_mut(&self) -> RwLockWriteGuard<'_, Senders> {
        self.topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lazy stream of records for `topic`. Ends when the hub is dropped.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = self
            .topics_mut()
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(%topic, "subscriber attached");

        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(record) => Some((record, rx)),
                Err(RecvError::Lagged(missed)) => Some((NotificationRecord::Gap { missed }, rx)),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }

    /// Non-blocking publish. Topics nobody listens to are dropped.
    pub fn publish(&self, topics: &[Topic], record: NotificationRecord) {
        let mut dead = Vec::new();
        {
            let guard = self
                .topics
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for topic in topics {
                if let Some(tx) = guard.get(topic) {
                    if tx.send(record.clone()).is_err() {
                        dead.push(*topic);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut guard = self.topics_mut();
            for topic in dead {
                if guard.get(&topic).is_some_and(|tx| tx.receiver_count() == 0) {
                    guard.remove(&topic);
                }
            }
        }
    }

    pub fn publish_event(&self, envelope: &EventEnvelope) {
        let mut topics = vec![Topic::All];
        for key in envelope.event.involved_keys() {
            let topic = Topic::Account(key);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        self.publish(
            &topics,
            NotificationRecord::BlockchainEvent {
                position: envelope.position.clone(),
                event: envelope.event.clone(),
            },
        );
    }

    pub fn publish_notice(&self, notice: Notice) {
        let [a, b] = notice.accounts();
        let mut topics = vec![Topic::All, Topic::Account(a)];
        if b != a {
            topics.push(Topic::Account(b));
        }
        self.publish(&topics, NotificationRecord::Notification { notice });
    }

    pub fn publish_status(&self, status: SyncStatus) {
        self.publish(&[Topic::All], NotificationRecord::Status { status });
    }

    pub fn subscriber_count(&self) -> usize {
        self.topics
            .read()
            .map(|guard| guard.values().map(|tx| tx.receiver_count()).sum())
            .unwrap_or(0)
    }
}
