//! Bridge runtime: wires the components together and drives the listener.
//!
//! One driver task owns the listener. It applies events in batches, with
//! dispatch matching committed in the same transaction, and publishes what
//! changed once the batch is durable. A mirror divergence parks the driver
//! until [`Bridge::resync`] is called.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use w3b2_shared::types::EventPosition;
use w3b2_store::{Database, StoreStats};

use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::error::{BridgeError, Result};
use crate::fanout::{NotificationHub, Subscription, SyncStatus, Topic};
use crate::keystore::{Keystore, MasterKey};
use crate::listener::{self, Backoff, ListenerItem};
use crate::mirror::MirrorStore;
use crate::router::CommandRouter;
use crate::session::SessionManager;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub live_sessions: usize,
    pub subscribers: usize,
    pub checkpoint: EventPosition,
}

pub struct Bridge {
    config: EngineConfig,
    mirror: Arc<MirrorStore>,
    sessions: Arc<SessionManager>,
    router: Arc<CommandRouter>,
    keystore: Arc<Keystore>,
    hub: Arc<NotificationHub>,
    connector: Arc<dyn Connector>,
    status: RwLock<SyncStatus>,
    resync: Notify,
}

impl Bridge {
    pub fn new(
        db: Database,
        connector: Arc<dyn Connector>,
        master_key: MasterKey,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        // Session keys did not survive the restart.
        let stale = db.expire_stale_sessions()?;
        if stale > 0 {
            info!(count = stale, "sessions from previous run expired");
        }

        let store = Store::new(db);
        let mirror = Arc::new(MirrorStore::new(store.clone()));
        let keystore = Arc::new(Keystore::new(store, master_key));
        let hub = Arc::new(NotificationHub::new(config.notification_buffer));
        let sessions = Arc::new(SessionManager::new(
            mirror.clone(),
            hub.clone(),
            config.session_idle,
        ));
        let router = Arc::new(CommandRouter::new(
            mirror.clone(),
            sessions.clone(),
            connector.clone(),
            keystore.clone(),
            hub.clone(),
            config.confirmation_timeout,
        ));

        let status = SyncStatus {
            checkpoint: mirror.checkpoint()?,
            ..SyncStatus::default()
        };

        Ok(Arc::new(Self {
            config,
            mirror,
            sessions,
            router,
            keystore,
            hub,
            connector,
            status: RwLock::new(status),
            resync: Notify::new(),
        }))
    }

    /// Resume pending dispatches and spawn the listener driver.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.router.resume_pending()?;
        let bridge = self.clone();
        Ok(tokio::spawn(async move { bridge.drive().await }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mirror(&self) -> &Arc<MirrorStore> {
        &self.mirror
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.hub.subscribe(topic)
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = self
            .status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        status.halted = self.mirror.is_halted();
        status.divergence = self.mirror.divergence();
        status
    }

    pub async fn stats(&self) -> Result<BridgeStats> {
        Ok(BridgeStats {
            store: self.mirror.stats()?,
            live_sessions: self.sessions.active_count().await,
            subscribers: self.hub.subscriber_count(),
            checkpoint: self.mirror.checkpoint()?,
        })
    }

    /// Operator re-sync: wipe the mirror and replay the chain from genesis.
    pub fn resync(&self) -> Result<()> {
        warn!("mirror re-sync from genesis requested");
        self.mirror.reset_to_genesis()?;
        self.update_status(|status| {
            status.checkpoint = EventPosition::genesis();
            status.applied_events = 0;
            status.halted = false;
            status.divergence = None;
        });
        self.resync.notify_one();
        Ok(())
    }

    /// Periodic housekeeping: idle sessions and overdue confirmations.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let sessions = self.sessions.expire_idle(now).await?;
        let dispatches = self.router.expire_overdue(now)?;
        if sessions + dispatches > 0 {
            debug!(sessions, dispatches, "sweep finished");
        }
        Ok((sessions, dispatches))
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut status);
            status.updated_at = Utc::now();
            status.clone()
        };
        self.hub.publish_status(snapshot);
    }

    async fn drive(self: Arc<Self>) {
        let backoff = Backoff {
            initial: self.config.backoff_initial,
            max: self.config.backoff_max,
        };
        let batch_size = self.config.apply_batch_size.max(1);

        loop {
            if self.mirror.is_halted() {
                let divergence = self.mirror.divergence();
                self.update_status(|status| {
                    status.halted = true;
                    status.divergence = divergence;
                });
                error!("listener parked until re-sync");
                self.resync.notified().await;
                continue;
            }

            let generation = self.mirror.generation();
            let checkpoint = match self.mirror.checkpoint() {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(error = %e, "failed to load checkpoint");
                    tokio::time::sleep(backoff.max).await;
                    continue;
                }
            };

            let mut batches = Box::pin(
                listener::resume(self.connector.clone(), checkpoint, backoff)
                    .ready_chunks(batch_size),
            );

            loop {
                let batch = tokio::select! {
                    batch = batches.next() => batch,
                    _ = self.resync.notified() => {
                        info!("restarting listener after re-sync");
                        break;
                    }
                };
                let Some(batch) = batch else { break };

                match self.process(generation, &batch) {
                    Ok(()) => {}
                    Err(BridgeError::MirrorDivergence(_)) => break,
                    Err(BridgeError::Rejected(reason)) => {
                        debug!(reason = %reason, "dropping stale batch");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "batch apply failed, replaying from checkpoint");
                        self.update_status(|status| status.last_error = Some(e.to_string()));
                        tokio::time::sleep(backoff.initial).await;
                        break;
                    }
                }
            }
        }
    }

    fn process(&self, generation: u64, batch: &[ListenerItem]) -> Result<()> {
        let outage = batch.iter().rev().find_map(|item| match item {
            ListenerItem::Unavailable { error, .. } => Some(error.clone()),
            _ => None,
        });
        let connected = !matches!(batch.last(), Some(ListenerItem::Unavailable { .. }));

        let report = match self.mirror.apply_batch(generation, batch) {
            Ok(report) => report,
            Err(BridgeError::MirrorDivergence(reason)) => {
                self.update_status(|status| {
                    status.halted = true;
                    status.divergence = Some(reason.clone());
                    status.last_error = Some(reason.clone());
                });
                return Err(BridgeError::MirrorDivergence(reason));
            }
            Err(e) => return Err(e),
        };

        let mut applied = 0u64;
        for envelope in report.applied() {
            self.hub.publish_event(envelope);
            applied += 1;
        }
        self.router.publish(&report.dispatches);

        self.update_status(|status| {
            if let Some(checkpoint) = report.checkpoint {
                status.checkpoint = checkpoint;
            }
            status.applied_events = status.applied_events.saturating_add(applied);
            status.connected = connected;
            if outage.is_some() {
                status.last_error = outage;
            }
        });
        Ok(())
    }
}
