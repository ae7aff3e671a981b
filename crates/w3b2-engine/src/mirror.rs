//! Off-chain mirror of the bridge program's accounts.
//!
//! Events are applied idempotently: every row keeps the sequence number of
//! the last event applied to it, and an event at or below that sequence is a
//! no-op. Balance arithmetic is checked; an underflow, an overflow or a
//! disagreement with the balance the chain reports is a divergence. A
//! divergence halts the mirror until an operator re-syncs it from genesis.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use w3b2_shared::events::{BridgeEvent, EventEnvelope};
use w3b2_shared::types::{EventPosition, FundingStatus, Pubkey};
use w3b2_store::{AdminProfile, Database, FundingRequest, StoreStats, UserProfile};

use crate::error::{BridgeError, Result};
use crate::listener::ListenerItem;
use crate::router::{track_event, DispatchUpdate};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected in the mirror.
    Duplicate,
}

/// Result of applying one listener batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Every decoded event of the batch in arrival order.
    pub events: Vec<(EventEnvelope, ApplyOutcome)>,
    /// Dispatch transitions committed with the batch.
    pub dispatches: Vec<DispatchUpdate>,
    pub rejected: usize,
    pub skipped: usize,
    /// Checkpoint written at the end of the batch.
    pub checkpoint: Option<EventPosition>,
}

impl BatchReport {
    /// Events that changed (or were first seen by) the mirror.
    pub fn applied(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.events
            .iter()
            .filter(|(_, outcome)| *outcome == ApplyOutcome::Applied)
            .map(|(envelope, _)| envelope)
    }
}

pub struct MirrorStore {
    store: Store,
    halted: AtomicBool,
    divergence: Mutex<Option<String>>,
    /// Bumped by every reset so batches from a stale listener are refused.
    generation: AtomicU64,
}

impl MirrorStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            halted: AtomicBool::new(false),
            divergence: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn divergence(&self) -> Option<String> {
        self.divergence
            .lock()
            .map(|reason| reason.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            let reason = self
                .divergence()
                .unwrap_or_else(|| "mirror halted".to_string());
            return Err(BridgeError::MirrorDivergence(reason));
        }
        Ok(())
    }

    fn halt(&self, reason: &str) {
        error!(reason, "mirror divergence detected, apply halted until re-sync");
        if let Ok(mut slot) = self.divergence.lock() {
            *slot = Some(reason.to_string());
        }
        self.halted.store(true, Ordering::SeqCst);
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(BridgeError::MirrorDivergence(reason)) = &result {
            self.halt(reason);
        }
        result
    }

    /// Apply a single event in its own transaction. The checkpoint is untouched
    /// and dispatch tracking is left to the caller.
    pub fn apply(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome> {
        self.ensure_running()?;
        let result = self.store.write(|db| apply_event(db, envelope));
        self.observe(result)
    }

    /// Apply a listener batch atomically and advance the checkpoint past it.
    ///
    /// Dispatches confirmed or failed by the batch's events move in the same
    /// transaction; the caller publishes `BatchReport::dispatches` afterwards.
    /// `Rejected` events are logged and skipped; any other failure rolls the
    /// whole batch back and leaves the checkpoint where it was.
    pub fn apply_batch(&self, generation: u64, items: &[ListenerItem]) -> Result<BatchReport> {
        self.ensure_running()?;

        let result = self.store.write(|db| {
            if self.generation() != generation {
                return Err(BridgeError::Rejected(
                    "batch from a listener older than the last re-sync".into(),
                ));
            }

            let mut report = BatchReport::default();
            let mut checkpoint = db.load_checkpoint()?;
            let start = checkpoint.seq;

            for item in items {
                match item {
                    ListenerItem::Event(envelope) => match apply_event(db, envelope) {
                        Ok(outcome) => {
                            if outcome == ApplyOutcome::Duplicate {
                                debug!(
                                    seq = envelope.seq(),
                                    tag = envelope.event.tag(),
                                    "duplicate event"
                                );
                            }
                            // Committed or rolled back together with the event.
                            if let Some(update) = track_event(db, envelope)? {
                                report.dispatches.push(update);
                            }
                            report.events.push((envelope.clone(), outcome));
                        }
                        Err(BridgeError::Rejected(reason)) => {
                            warn!(
                                seq = envelope.seq(),
                                tag = envelope.event.tag(),
                                reason = %reason,
                                "event rejected by mirror"
                            );
                            report.rejected += 1;
                        }
                        Err(e) => return Err(e),
                    },
                    ListenerItem::Skipped { .. } => report.skipped += 1,
                    ListenerItem::Unavailable { .. } => continue,
                }

                if let Some(position) = item.position() {
                    if position.seq > checkpoint.seq {
                        checkpoint = position.clone();
                    }
                }
            }

            if checkpoint.seq > start {
                db.save_checkpoint(&checkpoint)?;
                report.checkpoint = Some(checkpoint);
            }
            Ok(report)
        });
        self.observe(result)
    }

    /// Drop all mirrored state and the checkpoint, clear the halt flag, and
    /// invalidate in-flight batches. The listener must restart from genesis.
    pub fn reset_to_genesis(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store.read(|db| db.reset_mirror())?;
        if let Ok(mut slot) = self.divergence.lock() {
            *slot = None;
        }
        self.halted.store(false, Ordering::SeqCst);
        info!(generation = self.generation(), "mirror reset to genesis");
        Ok(())
    }

    // --- Queries ---

    pub fn checkpoint(&self) -> Result<EventPosition> {
        self.store.read(|db| db.load_checkpoint())
    }

    /// An open admin profile.
    pub fn get_admin(&self, authority: &Pubkey) -> Result<AdminProfile> {
        match self.store.read(|db| db.find_admin(authority))? {
            Some(admin) if !admin.closed => Ok(admin),
            _ => Err(BridgeError::NoSuchProfile(format!("admin {authority}"))),
        }
    }

    pub fn list_admins(&self) -> Result<Vec<AdminProfile>> {
        self.store.read(|db| db.list_admins(false))
    }

    /// An open user profile for the (user, admin) pair.
    pub fn get_user(&self, user: &Pubkey, admin: &Pubkey) -> Result<UserProfile> {
        match self.store.read(|db| db.find_user(user, admin))? {
            Some(profile) if !profile.closed => Ok(profile),
            _ => Err(BridgeError::NoSuchProfile(format!(
                "user {user} for admin {admin}"
            ))),
        }
    }

    pub fn list_users(&self, admin: &Pubkey) -> Result<Vec<UserProfile>> {
        self.store.read(|db| db.list_users_for_admin(admin))
    }

    pub fn get_funding(&self, request: &Pubkey) -> Result<FundingRequest> {
        self.store
            .read(|db| db.find_funding(request))?
            .ok_or_else(|| BridgeError::NotFound(format!("funding request {request}")))
    }

    pub fn list_funding(
        &self,
        admin: &Pubkey,
        status: Option<FundingStatus>,
    ) -> Result<Vec<FundingRequest>> {
        self.store.read(|db| db.list_funding_for_admin(admin, status))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.read(|db| db.stats())
    }
}

// ---------------------------------------------------------------------------
// Event application
// ---------------------------------------------------------------------------

fn event_time(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

fn rejected(msg: impl Into<String>) -> BridgeError {
    BridgeError::Rejected(msg.into())
}

fn divergence(msg: impl Into<String>) -> BridgeError {
    BridgeError::MirrorDivergence(msg.into())
}

/// Load an open admin for an event at `seq`. `Ok(None)` means the event is
/// already reflected.
fn live_admin(db: &Database, authority: &Pubkey, seq: u64) -> Result<Option<AdminProfile>> {
    match db.find_admin(authority)? {
        Some(admin) if seq <= admin.last_seq => Ok(None),
        Some(admin) if !admin.closed => Ok(Some(admin)),
        Some(_) => Err(rejected(format!("admin {} is closed", authority.short()))),
        None => Err(rejected(format!("unknown admin {}", authority.short()))),
    }
}

fn live_user(
    db: &Database,
    authority: &Pubkey,
    admin: &Pubkey,
    seq: u64,
) -> Result<Option<UserProfile>> {
    match db.find_user(authority, admin)? {
        Some(user) if seq <= user.last_seq => Ok(None),
        Some(user) if !user.closed => Ok(Some(user)),
        Some(_) => Err(rejected(format!(
            "user {} of admin {} is closed",
            authority.short(),
            admin.short()
        ))),
        None => Err(rejected(format!(
            "unknown user {} of admin {}",
            authority.short(),
            admin.short()
        ))),
    }
}

/// Open admin regardless of its own sequence (counterparty of a user event).
fn counterparty_admin(db: &Database, authority: &Pubkey) -> Result<AdminProfile> {
    match db.find_admin(authority)? {
        Some(admin) if !admin.closed => Ok(admin),
        _ => Err(rejected(format!("unknown admin {}", authority.short()))),
    }
}

macro_rules! or_duplicate {
    ($expr:expr) => {
        match $expr? {
            Some(value) => value,
            None => return Ok(ApplyOutcome::Duplicate),
        }
    };
}

/// Validate and apply one event. All validation happens before any write, so
/// a `Rejected` event leaves no trace.
fn apply_event(db: &Database, envelope: &EventEnvelope) -> Result<ApplyOutcome> {
    let seq = envelope.seq();

    match &envelope.event {
        BridgeEvent::AdminProfileRegistered(e) => {
            let at = event_time(e.ts);
            match db.find_admin(&e.authority)? {
                Some(existing) if seq <= existing.last_seq => return Ok(ApplyOutcome::Duplicate),
                Some(existing) if !existing.closed => {
                    return Err(rejected(format!(
                        "admin {} already registered",
                        e.authority.short()
                    )))
                }
                _ => {}
            }
            db.upsert_admin(&AdminProfile {
                authority: e.authority,
                communication_pubkey: e.communication_pubkey,
                prices: Vec::new(),
                balance: 0,
                last_seq: seq,
                closed: false,
                created_at: at,
                updated_at: at,
            })?;
        }

        BridgeEvent::AdminCommKeyUpdated(e) => {
            let mut admin = or_duplicate!(live_admin(db, &e.authority, seq));
            admin.communication_pubkey = e.new_comm_pubkey;
            admin.last_seq = seq;
            admin.updated_at = event_time(e.ts);
            db.upsert_admin(&admin)?;
        }

        BridgeEvent::AdminPricesUpdated(e) => {
            let mut admin = or_duplicate!(live_admin(db, &e.authority, seq));
            admin.prices = e.new_prices.iter().copied().map(Into::into).collect();
            admin.last_seq = seq;
            admin.updated_at = event_time(e.ts);
            db.upsert_admin(&admin)?;
        }

        BridgeEvent::AdminFundsWithdrawn(e) => {
            let mut admin = or_duplicate!(live_admin(db, &e.authority, seq));
            admin.balance = admin.balance.checked_sub(e.amount).ok_or_else(|| {
                divergence(format!(
                    "admin {} withdrew {} with balance {}",
                    e.authority.short(),
                    e.amount,
                    admin.balance
                ))
            })?;
            admin.last_seq = seq;
            admin.updated_at = event_time(e.ts);
            db.upsert_admin(&admin)?;
        }

        BridgeEvent::AdminProfileClosed(e) => {
            let mut admin = or_duplicate!(live_admin(db, &e.authority, seq));
            admin.closed = true;
            admin.last_seq = seq;
            admin.updated_at = event_time(e.ts);
            db.upsert_admin(&admin)?;
        }

        BridgeEvent::UserProfileCreated(e) => {
            let at = event_time(e.ts);
            match db.find_user(&e.authority, &e.target_admin)? {
                Some(existing) if seq <= existing.last_seq => return Ok(ApplyOutcome::Duplicate),
                Some(existing) if !existing.closed => {
                    return Err(rejected(format!(
                        "user {} already linked to admin {}",
                        e.authority.short(),
                        e.target_admin.short()
                    )))
                }
                _ => {}
            }
            counterparty_admin(db, &e.target_admin)?;
            db.upsert_user(&UserProfile {
                authority: e.authority,
                admin: e.target_admin,
                communication_pubkey: e.communication_pubkey,
                deposit: 0,
                last_seq: seq,
                closed: false,
                created_at: at,
                updated_at: at,
            })?;
        }

        BridgeEvent::UserCommKeyUpdated(e) => {
            let mut user = or_duplicate!(live_user(db, &e.authority, &e.target_admin, seq));
            user.communication_pubkey = e.new_comm_pubkey;
            user.last_seq = seq;
            user.updated_at = event_time(e.ts);
            db.upsert_user(&user)?;
        }

        BridgeEvent::UserFundsDeposited(e) => {
            let mut user = or_duplicate!(live_user(db, &e.authority, &e.target_admin, seq));
            let deposit = user.deposit.checked_add(e.amount).ok_or_else(|| {
                divergence(format!("deposit overflow for user {}", e.authority.short()))
            })?;
            if deposit != e.new_deposit_balance {
                return Err(divergence(format!(
                    "user {} deposit mirrors {} but chain reports {}",
                    e.authority.short(),
                    deposit,
                    e.new_deposit_balance
                )));
            }
            user.deposit = deposit;
            user.last_seq = seq;
            user.updated_at = event_time(e.ts);
            db.upsert_user(&user)?;
        }

        BridgeEvent::UserFundsWithdrawn(e) => {
            let mut user = or_duplicate!(live_user(db, &e.authority, &e.target_admin, seq));
            let deposit = user.deposit.checked_sub(e.amount).ok_or_else(|| {
                divergence(format!(
                    "user {} withdrew {} with deposit {}",
                    e.authority.short(),
                    e.amount,
                    user.deposit
                ))
            })?;
            if deposit != e.new_deposit_balance {
                return Err(divergence(format!(
                    "user {} deposit mirrors {} but chain reports {}",
                    e.authority.short(),
                    deposit,
                    e.new_deposit_balance
                )));
            }
            user.deposit = deposit;
            user.last_seq = seq;
            user.updated_at = event_time(e.ts);
            db.upsert_user(&user)?;
        }

        BridgeEvent::UserProfileClosed(e) => {
            let mut user = or_duplicate!(live_user(db, &e.authority, &e.target_admin, seq));
            user.closed = true;
            user.last_seq = seq;
            user.updated_at = event_time(e.ts);
            db.upsert_user(&user)?;
        }

        // Idempotency is tracked on the paying user's row; the admin is
        // credited whenever the debit applies.
        BridgeEvent::UserCommandDispatched(e) => {
            let mut user = or_duplicate!(live_user(db, &e.sender, &e.target_admin, seq));
            let mut admin = counterparty_admin(db, &e.target_admin)?;
            let at = event_time(e.ts);

            user.deposit = user.deposit.checked_sub(e.price_paid).ok_or_else(|| {
                divergence(format!(
                    "user {} paid {} with deposit {}",
                    e.sender.short(),
                    e.price_paid,
                    user.deposit
                ))
            })?;
            admin.balance = admin.balance.checked_add(e.price_paid).ok_or_else(|| {
                divergence(format!("balance overflow for admin {}", e.target_admin.short()))
            })?;

            user.last_seq = seq;
            user.updated_at = at;
            admin.last_seq = admin.last_seq.max(seq);
            admin.updated_at = at;
            db.upsert_user(&user)?;
            db.upsert_admin(&admin)?;
        }

        BridgeEvent::AdminCommandDispatched(e) => {
            counterparty_admin(db, &e.sender)?;
            match db.find_user(&e.target_user, &e.sender)? {
                Some(user) if !user.closed => {}
                _ => {
                    return Err(rejected(format!(
                        "admin {} pushed to unknown user {}",
                        e.sender.short(),
                        e.target_user.short()
                    )))
                }
            }
        }

        // Router-level signals; nothing to mirror.
        BridgeEvent::CommandFailed(_) | BridgeEvent::OffChainActionLogged(_) => {}

        BridgeEvent::FundingRequested(e) => {
            if let Some(existing) = db.find_funding(&e.request)? {
                if seq <= existing.last_seq {
                    return Ok(ApplyOutcome::Duplicate);
                }
                return Err(rejected(format!(
                    "funding request {} already exists",
                    e.request.short()
                )));
            }
            counterparty_admin(db, &e.target_admin)?;
            db.upsert_funding(&FundingRequest {
                request: e.request,
                requester: e.requester,
                target_admin: e.target_admin,
                amount: e.amount,
                status: FundingStatus::Pending,
                last_seq: seq,
                created_at: event_time(e.ts),
                resolved_at: None,
            })?;
        }

        BridgeEvent::FundingResolved(e) => {
            let mut funding = match db.find_funding(&e.request)? {
                Some(funding) if seq <= funding.last_seq => return Ok(ApplyOutcome::Duplicate),
                Some(funding) => funding,
                None => {
                    return Err(rejected(format!(
                        "unknown funding request {}",
                        e.request.short()
                    )))
                }
            };
            if funding.status.is_terminal() {
                return Err(rejected(format!(
                    "funding request {} already {}",
                    e.request.short(),
                    funding.status
                )));
            }
            if !e.status.is_terminal() {
                return Err(rejected("funding resolved back to pending"));
            }

            if e.status == FundingStatus::Approved {
                let mut admin = counterparty_admin(db, &funding.target_admin)?;
                admin.balance = admin.balance.checked_sub(funding.amount).ok_or_else(|| {
                    divergence(format!(
                        "admin {} approved funding {} with balance {}",
                        funding.target_admin.short(),
                        funding.amount,
                        admin.balance
                    ))
                })?;
                admin.last_seq = admin.last_seq.max(seq);
                admin.updated_at = event_time(e.ts);
                db.upsert_admin(&admin)?;
            }

            funding.status = e.status;
            funding.last_seq = seq;
            funding.resolved_at = Some(event_time(e.ts));
            db.upsert_funding(&funding)?;
        }
    }

    debug!(seq, tag = envelope.event.tag(), "event applied");
    Ok(ApplyOutcome::Applied)
}
