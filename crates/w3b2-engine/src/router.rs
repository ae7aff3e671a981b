//! Command router: validates, encrypts and submits dispatches, then tracks
//! them to a final outcome driven by chain events.
//!
//! A dispatch moves `Submitted -> AwaitingConfirmation -> {Confirmed, Failed}`.
//! Only a chain event (or the confirmation deadline) finalizes it. Nothing
//! that carries a payment is ever resubmitted automatically.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use w3b2_shared::constants::MAX_PAYLOAD_SIZE;
use w3b2_shared::crypto::payload_reference;
use w3b2_shared::events::{BridgeEvent, EventEnvelope};
use w3b2_shared::protocol::{Instruction, SignedSubmission, SubmissionId};
use w3b2_shared::types::{
    CommandId, CorrelationId, Direction, DispatchStatus, FundingStatus, Pubkey,
};
use w3b2_store::{CardScope, Database, DispatchKey, DispatchRecord, StoreError, UserProfile};

use crate::connector::Connector;
use crate::error::{BridgeError, Result};
use crate::fanout::{Notice, NotificationHub};
use crate::keystore::Keystore;
use crate::mirror::MirrorStore;
use crate::session::SessionManager;

/// Failure text recorded on a dispatch cancelled before broadcast.
pub const CANCELLED: &str = "cancelled";

/// A dispatch transition driven by a chain event.
#[derive(Debug, Clone)]
pub enum DispatchUpdate {
    Confirmed { record: DispatchRecord, seq: u64 },
    FailedOnChain { record: DispatchRecord, seq: u64 },
    /// Confirmed on chain after the bridge had already failed it.
    LateConfirmation { record: DispatchRecord, seq: u64 },
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub direction: Direction,
    pub user: Pubkey,
    pub admin: Pubkey,
    pub command_id: CommandId,
    pub correlation_id: CorrelationId,
    /// Plaintext; encrypted under the pair's session before it leaves.
    pub payload: Vec<u8>,
}

impl DispatchRequest {
    pub fn key(&self) -> DispatchKey {
        DispatchKey {
            user: self.user,
            admin: self.admin,
            command_id: self.command_id,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Keys currently being handed to the connector. Removed on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<DispatchKey>>,
    key: DispatchKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self
            .set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.key);
    }
}

pub struct CommandRouter {
    mirror: Arc<MirrorStore>,
    sessions: Arc<SessionManager>,
    connector: Arc<dyn Connector>,
    keystore: Arc<Keystore>,
    hub: Arc<NotificationHub>,
    confirmation_timeout: chrono::Duration,
    submitting: Mutex<HashSet<DispatchKey>>,
}

impl CommandRouter {
    pub fn new(
        mirror: Arc<MirrorStore>,
        sessions: Arc<SessionManager>,
        connector: Arc<dyn Connector>,
        keystore: Arc<Keystore>,
        hub: Arc<NotificationHub>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            mirror,
            sessions,
            connector,
            keystore,
            hub,
            confirmation_timeout: chrono::Duration::from_std(confirmation_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            submitting: Mutex::new(HashSet::new()),
        }
    }

    fn submitting(&self) -> MutexGuard<'_, HashSet<DispatchKey>> {
        self.submitting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and submit a dispatch.
    ///
    /// Returns the record as it stands once the connector has acknowledged
    /// (normally `AwaitingConfirmation`). A connector failure marks the
    /// record `Failed` and is returned as an error; it is not retried.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchRecord> {
        if request.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BridgeError::Rejected(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                request.payload.len()
            )));
        }

        let key = request.key();
        let admin = self.mirror.get_admin(&request.admin)?;
        let user = self.mirror.get_user(&request.user, &request.admin)?;

        let price = match request.direction {
            Direction::UserToAdmin => admin
                .price_of(request.command_id)
                .ok_or(BridgeError::UnknownCommand(request.command_id))?,
            Direction::AdminToUser => 0,
        };
        if price > 0 {
            let available = self
                .mirror
                .store()
                .read(|db| available_deposit(db, &user, &key))?;
            if price > available {
                return Err(BridgeError::InsufficientDeposit {
                    required: price,
                    available,
                });
            }
        }

        let session_id = match self.sessions.active_for(&request.user, &request.admin).await {
            Some(id) => id,
            None => self.sessions.open(&request.user, &request.admin).await?.session_id,
        };
        let ciphertext = self.sessions.encrypt(&session_id, &request.payload).await?;

        let now = Utc::now();
        let record = DispatchRecord {
            key: key.clone(),
            direction: request.direction,
            payload_ref: payload_reference(&ciphertext),
            price,
            status: DispatchStatus::Submitted,
            submission_id: None,
            failure: None,
            late_confirmation: false,
            deadline: None,
            created_at: now,
            updated_at: now,
        };

        // Re-check against the reservation index and claim the key in one
        // transaction so concurrent requests cannot overspend.
        self.mirror.store().write(|db| {
            if price > 0 {
                let current = db
                    .find_user(&request.user, &request.admin)?
                    .filter(|u| !u.closed)
                    .ok_or_else(|| {
                        BridgeError::NoSuchProfile(format!(
                            "user {} for admin {}",
                            request.user, request.admin
                        ))
                    })?;
                let available = available_deposit(db, &current, &key)?;
                if price > available {
                    return Err(BridgeError::InsufficientDeposit {
                        required: price,
                        available,
                    });
                }
            }
            db.insert_dispatch(&record).map_err(|e| match e {
                StoreError::Duplicate(key) => BridgeError::DuplicateCommand(key),
                other => other.into(),
            })
        })?;
        info!(
            dispatch = %key,
            direction = %request.direction,
            price,
            "dispatch submitted"
        );
        self.notify(&record);

        let _in_flight = {
            let mut submitting = self.submitting();
            let current = self.mirror.store().read(|db| db.get_dispatch(&key))?;
            if current.status != DispatchStatus::Submitted {
                return Ok(current);
            }
            submitting.insert(key.clone());
            InFlight {
                set: &self.submitting,
                key: key.clone(),
            }
        };

        let (sender, recipient) = match request.direction {
            Direction::UserToAdmin => (request.user, request.admin),
            Direction::AdminToUser => (request.admin, request.user),
        };
        // Admin pushes sign with the admin's own card.
        let card = self.keystore.card_for(CardScope {
            holder: sender,
            service: request.admin,
        })?;
        let submission = SignedSubmission::sign(
            &card,
            &Instruction::DispatchCommand {
                sender,
                recipient,
                command_id: request.command_id,
                max_price: price,
                correlation_id: request.correlation_id.clone(),
                payload: ciphertext,
            },
        )?;

        match self.connector.submit_transaction(submission).await {
            Ok(submission_id) => self.acknowledge(&key, submission_id),
            Err(e) => {
                let error = BridgeError::from(e);
                warn!(dispatch = %key, error = %error, "dispatch broadcast failed");
                self.finalize_open(&key, DispatchStatus::Failed, Some(error.to_string()))?;
                Err(error)
            }
        }
    }

    fn acknowledge(
        &self,
        key: &DispatchKey,
        submission_id: SubmissionId,
    ) -> Result<DispatchRecord> {
        let deadline = Utc::now() + self.confirmation_timeout;
        let record = self.mirror.store().write(|db| {
            let mut record = db.get_dispatch(key)?;
            record.submission_id = Some(submission_id.0.clone());
            // A confirmation may already have arrived.
            if record.status == DispatchStatus::Submitted {
                record.status = DispatchStatus::AwaitingConfirmation;
                record.deadline = Some(deadline);
            }
            record.updated_at = Utc::now();
            db.update_dispatch(&record)?;
            Ok(record)
        })?;

        debug!(
            dispatch = %key,
            submission = %submission_id,
            status = %record.status,
            "broadcast acknowledged"
        );
        self.notify(&record);
        Ok(record)
    }

    pub fn get_dispatch(&self, key: &DispatchKey) -> Result<DispatchRecord> {
        self.mirror
            .store()
            .read(|db| db.find_dispatch(key))?
            .ok_or_else(|| BridgeError::NotFound(format!("dispatch {key}")))
    }

    pub fn pending(&self) -> Result<Vec<DispatchRecord>> {
        self.mirror.store().read(|db| db.list_pending_dispatches())
    }

    /// Cancel a dispatch that has not been handed to the connector yet.
    pub fn cancel(&self, key: &DispatchKey) -> Result<DispatchRecord> {
        let record = {
            let submitting = self.submitting();
            if submitting.contains(key) {
                return Err(BridgeError::NotCancellable(DispatchStatus::Submitted));
            }
            self.mirror.store().write(|db| {
                let mut record = db
                    .find_dispatch(key)?
                    .ok_or_else(|| BridgeError::NotFound(format!("dispatch {key}")))?;
                if record.status != DispatchStatus::Submitted {
                    return Err(BridgeError::NotCancellable(record.status));
                }
                record.status = DispatchStatus::Failed;
                record.failure = Some(CANCELLED.to_string());
                record.updated_at = Utc::now();
                db.update_dispatch(&record)?;
                Ok(record)
            })?
        };

        info!(dispatch = %key, "dispatch cancelled");
        self.notify(&record);
        Ok(record)
    }

    /// Match a chain event applied outside a listener batch and publish the
    /// resulting transition.
    pub fn on_event(&self, envelope: &EventEnvelope) -> Result<()> {
        if let Some(update) = self.mirror.store().write(|db| track_event(db, envelope))? {
            self.publish(std::slice::from_ref(&update));
        }
        Ok(())
    }

    /// Announce transitions that are already committed.
    pub fn publish(&self, updates: &[DispatchUpdate]) {
        for update in updates {
            match update {
                DispatchUpdate::Confirmed { record, seq } => {
                    info!(dispatch = %record.key, seq, "dispatch confirmed");
                    self.notify(record);
                }
                DispatchUpdate::FailedOnChain { record, seq } => {
                    info!(
                        dispatch = %record.key,
                        seq,
                        reason = record.failure.as_deref().unwrap_or_default(),
                        "dispatch failed on chain"
                    );
                    self.notify(record);
                }
                DispatchUpdate::LateConfirmation { record, seq } => {
                    let detail = format!(
                        "confirmed at seq {seq} after local failure: {}",
                        record.failure.as_deref().unwrap_or("unknown")
                    );
                    warn!(dispatch = %record.key, seq, detail = %detail, "reconciliation anomaly");
                    self.notify(record);
                    self.hub.publish_notice(Notice::ReconciliationAnomaly {
                        key: record.key.clone(),
                        detail,
                    });
                }
            }
        }
    }

    /// Move an open dispatch to a terminal status. `None` if it was not open.
    fn finalize_open(
        &self,
        key: &DispatchKey,
        status: DispatchStatus,
        failure: Option<String>,
    ) -> Result<Option<DispatchRecord>> {
        let record = self
            .mirror
            .store()
            .write(|db| finalize_in(db, key, status, failure))?;

        if let Some(record) = &record {
            self.notify(record);
        }
        Ok(record)
    }

    /// Fail every awaiting dispatch whose deadline has passed.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.mirror.store().write(|db| {
            let mut expired = Vec::new();
            for mut record in db.list_overdue_dispatches(now)? {
                record.status = DispatchStatus::Failed;
                record.failure =
                    Some(BridgeError::ConfirmationTimeout(record.key.to_string()).to_string());
                record.updated_at = now;
                db.update_dispatch(&record)?;
                expired.push(record);
            }
            Ok(expired)
        })?;

        for record in &expired {
            warn!(dispatch = %record.key, "dispatch confirmation timed out");
            self.notify(record);
        }
        Ok(expired.len())
    }

    /// Rebuild tracking from the durable pending index after a restart.
    ///
    /// A record left in `Submitted` may or may not have been broadcast, so it
    /// waits for confirmation like any other and fails at its deadline.
    pub fn resume_pending(&self) -> Result<usize> {
        let deadline = Utc::now() + self.confirmation_timeout;
        let resumed = self.mirror.store().write(|db| {
            let mut resumed = 0;
            for mut record in db.list_pending_dispatches()? {
                if record.status == DispatchStatus::AwaitingConfirmation
                    && record.deadline.is_some()
                {
                    continue;
                }
                record.status = DispatchStatus::AwaitingConfirmation;
                record.deadline = Some(deadline);
                record.updated_at = Utc::now();
                db.update_dispatch(&record)?;
                resumed += 1;
            }
            Ok(resumed)
        })?;

        if resumed > 0 {
            info!(count = resumed, "pending dispatches resumed");
        }
        Ok(resumed)
    }

    // --- Other instructions ---

    /// Validate an instruction against the mirror, sign it and hand it over.
    /// Its effect is observed later through chain events.
    pub async fn submit_instruction(&self, instruction: Instruction) -> Result<SubmissionId> {
        self.validate(&instruction)?;

        let card = self.keystore.card_for(signing_scope(&instruction))?;
        let submission = SignedSubmission::sign(&card, &instruction)?;
        let id = self.connector.submit_transaction(submission).await?;
        info!(
            instruction = instruction.name(),
            authority = %instruction.authority().short(),
            submission = %id,
            "instruction submitted"
        );
        Ok(id)
    }

    /// Approve or reject a pending funding request on behalf of its admin.
    pub async fn resolve_funding(&self, request: &Pubkey, approve: bool) -> Result<SubmissionId> {
        let funding = self.mirror.get_funding(request)?;
        self.submit_instruction(Instruction::ResolveFunding {
            authority: funding.target_admin,
            request: *request,
            approve,
        })
        .await
    }

    fn validate(&self, instruction: &Instruction) -> Result<()> {
        match instruction {
            Instruction::AdminRegister { authority, .. } => {
                if self.mirror.get_admin(authority).is_ok() {
                    return Err(BridgeError::Rejected(format!(
                        "admin {authority} already registered"
                    )));
                }
            }
            Instruction::AdminUpdateCommKey { authority, .. }
            | Instruction::AdminUpdatePrices { authority, .. }
            | Instruction::AdminClose { authority } => {
                self.mirror.get_admin(authority)?;
            }
            Instruction::AdminWithdraw {
                authority, amount, ..
            } => {
                let admin = self.mirror.get_admin(authority)?;
                require_positive(*amount)?;
                if *amount > admin.balance {
                    return Err(BridgeError::InsufficientDeposit {
                        required: *amount,
                        available: admin.balance,
                    });
                }
            }
            Instruction::UserCreate {
                authority,
                target_admin,
                ..
            } => {
                self.mirror.get_admin(target_admin)?;
                if self.mirror.get_user(authority, target_admin).is_ok() {
                    return Err(BridgeError::Rejected(format!(
                        "user {authority} already linked to admin {target_admin}"
                    )));
                }
            }
            Instruction::UserUpdateCommKey {
                authority,
                target_admin,
                ..
            }
            | Instruction::UserClose {
                authority,
                target_admin,
            } => {
                self.mirror.get_user(authority, target_admin)?;
            }
            Instruction::UserDeposit {
                authority,
                target_admin,
                amount,
            } => {
                self.mirror.get_user(authority, target_admin)?;
                require_positive(*amount)?;
            }
            Instruction::UserWithdraw {
                authority,
                target_admin,
                amount,
                ..
            } => {
                let user = self.mirror.get_user(authority, target_admin)?;
                require_positive(*amount)?;
                let available = self.mirror.store().read(|db| {
                    let reserved = db.reserved_amount(authority, target_admin)?;
                    Ok(user.deposit.saturating_sub(reserved))
                })?;
                if *amount > available {
                    return Err(BridgeError::InsufficientDeposit {
                        required: *amount,
                        available,
                    });
                }
            }
            Instruction::RequestFunding {
                target_admin,
                amount,
                ..
            } => {
                self.mirror.get_admin(target_admin)?;
                require_positive(*amount)?;
            }
            Instruction::ResolveFunding {
                authority, request, ..
            } => {
                let funding = self.mirror.get_funding(request)?;
                if funding.target_admin != *authority {
                    return Err(BridgeError::Rejected(format!(
                        "funding request {request} belongs to another admin"
                    )));
                }
                if funding.status != FundingStatus::Pending {
                    return Err(BridgeError::Rejected(format!(
                        "funding request {request} already {}",
                        funding.status
                    )));
                }
            }
            Instruction::DispatchCommand { .. } => {
                return Err(BridgeError::Rejected(
                    "command dispatches go through the dispatch endpoint".into(),
                ));
            }
            Instruction::LogAction { .. } => {}
        }
        Ok(())
    }

    fn notify(&self, record: &DispatchRecord) {
        self.hub.publish_notice(Notice::DispatchUpdated {
            record: record.clone(),
        });
    }
}

/// Match a chain event against the pending index inside the caller's
/// transaction. The returned transition is published once that commits.
pub(crate) fn track_event(
    db: &Database,
    envelope: &EventEnvelope,
) -> Result<Option<DispatchUpdate>> {
    let seq = envelope.seq();
    match &envelope.event {
        BridgeEvent::UserCommandDispatched(e) => confirm_in(
            db,
            &DispatchKey {
                user: e.sender,
                admin: e.target_admin,
                command_id: e.command_id,
                correlation_id: e.correlation_id.clone(),
            },
            seq,
        ),
        BridgeEvent::AdminCommandDispatched(e) => confirm_in(
            db,
            &DispatchKey {
                user: e.target_user,
                admin: e.sender,
                command_id: e.command_id,
                correlation_id: e.correlation_id.clone(),
            },
            seq,
        ),
        BridgeEvent::CommandFailed(e) => {
            let key = DispatchKey {
                user: e.user,
                admin: e.admin,
                command_id: e.command_id,
                correlation_id: e.correlation_id.clone(),
            };
            let failed = finalize_in(db, &key, DispatchStatus::Failed, Some(e.reason.clone()))?;
            Ok(failed.map(|record| DispatchUpdate::FailedOnChain { record, seq }))
        }
        _ => Ok(None),
    }
}

fn confirm_in(db: &Database, key: &DispatchKey, seq: u64) -> Result<Option<DispatchUpdate>> {
    let Some(mut record) = db.find_dispatch(key)? else {
        debug!(dispatch = %key, seq, "confirmation for no open dispatch");
        return Ok(None);
    };
    let late = match record.status {
        DispatchStatus::Submitted | DispatchStatus::AwaitingConfirmation => {
            record.status = DispatchStatus::Confirmed;
            record.deadline = None;
            false
        }
        DispatchStatus::Failed if !record.late_confirmation => {
            record.late_confirmation = true;
            true
        }
        _ => return Ok(None),
    };
    record.updated_at = Utc::now();
    db.update_dispatch(&record)?;

    Ok(Some(if late {
        DispatchUpdate::LateConfirmation { record, seq }
    } else {
        DispatchUpdate::Confirmed { record, seq }
    }))
}

fn finalize_in(
    db: &Database,
    key: &DispatchKey,
    status: DispatchStatus,
    failure: Option<String>,
) -> Result<Option<DispatchRecord>> {
    let Some(mut record) = db.find_dispatch(key)? else {
        return Ok(None);
    };
    if record.status.is_terminal() {
        return Ok(None);
    }
    record.status = status;
    record.failure = failure;
    record.updated_at = Utc::now();
    db.update_dispatch(&record)?;
    Ok(Some(record))
}

/// The relationship whose card signs an instruction.
fn signing_scope(instruction: &Instruction) -> CardScope {
    let holder = *instruction.authority();
    let service = match instruction {
        Instruction::UserCreate { target_admin, .. }
        | Instruction::UserUpdateCommKey { target_admin, .. }
        | Instruction::UserDeposit { target_admin, .. }
        | Instruction::UserWithdraw { target_admin, .. }
        | Instruction::UserClose { target_admin, .. }
        | Instruction::RequestFunding { target_admin, .. } => *target_admin,
        _ => holder,
    };
    CardScope { holder, service }
}

fn require_positive(amount: u64) -> Result<()> {
    if amount == 0 {
        return Err(BridgeError::Rejected("amount must be positive".into()));
    }
    Ok(())
}

/// Deposit not yet reserved by other in-flight dispatches of the pair.
fn available_deposit(
    db: &Database,
    user: &UserProfile,
    key: &DispatchKey,
) -> std::result::Result<u64, StoreError> {
    let mut reserved = db.reserved_amount(&user.authority, &user.admin)?;
    if let Some(existing) = db.find_dispatch(key)? {
        if existing.direction == Direction::UserToAdmin && !existing.status.is_terminal() {
            reserved = reserved.saturating_sub(existing.price);
        }
    }
    Ok(user.deposit.saturating_sub(reserved))
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, StreamExt};
    use w3b2_shared::crypto::{comm_public_key, generate_comm_secret};
    use w3b2_shared::events::*;
    use w3b2_shared::types::EventPosition;

    use super::*;
    use crate::connector::ChannelConnector;
    use crate::fanout::{NotificationRecord, Topic};
    use crate::keystore::MasterKey;
    use crate::store::Store;

    const ADMIN: Pubkey = Pubkey([2; 32]);
    const USER: Pubkey = Pubkey([1; 32]);

    struct Fixture {
        router: CommandRouter,
        mirror: Arc<MirrorStore>,
        connector: ChannelConnector,
        hub: Arc<NotificationHub>,
        keystore: Arc<Keystore>,
        seq: u64,
    }

    impl Fixture {
        fn apply(&mut self, event: BridgeEvent) -> EventEnvelope {
            self.seq += 1;
            let envelope = EventEnvelope {
                position: EventPosition {
                    slot: self.seq,
                    seq: self.seq,
                    signature: String::new(),
                },
                event,
            };
            self.mirror.apply(&envelope).unwrap();
            envelope
        }
    }

    fn fixture(deposit: u64) -> Fixture {
        let store = Store::new(Database::open_in_memory().unwrap());
        let mirror = Arc::new(MirrorStore::new(store.clone()));
        let keystore = Arc::new(Keystore::new(store, MasterKey::ephemeral()));
        let hub = Arc::new(NotificationHub::new(64));
        let sessions = Arc::new(SessionManager::new(
            mirror.clone(),
            hub.clone(),
            Duration::from_secs(60),
        ));
        let connector = ChannelConnector::new();
        let router = CommandRouter::new(
            mirror.clone(),
            sessions,
            Arc::new(connector.clone()),
            keystore.clone(),
            hub.clone(),
            Duration::from_secs(60),
        );

        let mut f = Fixture {
            router,
            mirror,
            connector,
            hub,
            keystore,
            seq: 0,
        };
        f.apply(BridgeEvent::AdminProfileRegistered(AdminProfileRegistered {
            authority: ADMIN,
            communication_pubkey: comm_public_key(&generate_comm_secret()),
            ts: 0,
        }));
        f.apply(BridgeEvent::AdminPricesUpdated(AdminPricesUpdated {
            authority: ADMIN,
            new_prices: vec![(5, 300_000), (6, 0)],
            ts: 0,
        }));
        f.apply(BridgeEvent::UserProfileCreated(UserProfileCreated {
            authority: USER,
            target_admin: ADMIN,
            communication_pubkey: comm_public_key(&generate_comm_secret()),
            ts: 0,
        }));
        if deposit > 0 {
            f.apply(BridgeEvent::UserFundsDeposited(UserFundsDeposited {
                authority: USER,
                target_admin: ADMIN,
                amount: deposit,
                new_deposit_balance: deposit,
                ts: 0,
            }));
        }
        f
    }

    fn request(command_id: CommandId, correlation: &str) -> DispatchRequest {
        DispatchRequest {
            direction: Direction::UserToAdmin,
            user: USER,
            admin: ADMIN,
            command_id,
            correlation_id: CorrelationId::new(correlation).unwrap(),
            payload: b"do the thing".to_vec(),
        }
    }

    fn confirmation(command_id: CommandId, correlation: &str, price: u64) -> BridgeEvent {
        BridgeEvent::UserCommandDispatched(UserCommandDispatched {
            sender: USER,
            target_admin: ADMIN,
            command_id,
            price_paid: price,
            correlation_id: CorrelationId::new(correlation).unwrap(),
            payload: vec![],
            ts: 0,
        })
    }

    #[tokio::test]
    async fn test_dispatch_awaits_then_confirms() {
        let mut f = fixture(1_000_000);
        let record = f.router.dispatch(request(5, "c1")).await.unwrap();
        assert_eq!(record.status, DispatchStatus::AwaitingConfirmation);
        assert_eq!(record.price, 300_000);
        assert!(record.deadline.is_some());
        assert_eq!(f.connector.outbox_len(), 1);

        let (_, submission) = f.connector.drain_outbox().remove(0);
        match submission.decode_instruction().unwrap() {
            Instruction::DispatchCommand {
                sender,
                max_price,
                payload,
                ..
            } => {
                assert_eq!(sender, USER);
                assert_eq!(max_price, 300_000);
                assert_ne!(payload, b"do the thing".to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }

        let envelope = f.apply(confirmation(5, "c1", 300_000));
        f.router.on_event(&envelope).unwrap();

        let record = f.router.get_dispatch(&record.key).unwrap();
        assert_eq!(record.status, DispatchStatus::Confirmed);
        assert_eq!(f.mirror.get_user(&USER, &ADMIN).unwrap().deposit, 700_000);
    }

    #[tokio::test]
    async fn test_submissions_signed_by_relationship_card() {
        let f = fixture(1_000_000);
        f.router.dispatch(request(5, "mine")).await.unwrap();
        let mut push = request(6, "theirs");
        push.direction = Direction::AdminToUser;
        f.router.dispatch(push).await.unwrap();
        f.router
            .submit_instruction(Instruction::UserDeposit {
                authority: USER,
                target_admin: ADMIN,
                amount: 10,
            })
            .await
            .unwrap();

        let user_card = f.keystore.load(&CardScope { holder: USER, service: ADMIN }).unwrap();
        let admin_card = f.keystore.load(&CardScope { holder: ADMIN, service: ADMIN }).unwrap();
        assert_ne!(user_card.pubkey(), admin_card.pubkey());

        let signers: Vec<Pubkey> = f
            .connector
            .drain_outbox()
            .into_iter()
            .map(|(_, submission)| {
                submission.verify().unwrap();
                submission.signer
            })
            .collect();
        assert_eq!(
            signers,
            vec![user_card.pubkey(), admin_card.pubkey(), user_card.pubkey()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let f = fixture(1_000_000);
        f.router.dispatch(request(5, "same")).await.unwrap();
        assert!(matches!(
            f.router.dispatch(request(5, "same")).await,
            Err(BridgeError::DuplicateCommand(_))
        ));
        assert_eq!(f.connector.outbox_len(), 1);
    }

    #[tokio::test]
    async fn test_validation_order() {
        let f = fixture(100);

        let mut unknown_user = request(5, "a");
        unknown_user.user = Pubkey([9; 32]);
        assert!(matches!(
            f.router.dispatch(unknown_user).await,
            Err(BridgeError::NoSuchProfile(_))
        ));
        assert!(matches!(
            f.router.dispatch(request(77, "b")).await,
            Err(BridgeError::UnknownCommand(77))
        ));
        assert!(matches!(
            f.router.dispatch(request(5, "c")).await,
            Err(BridgeError::InsufficientDeposit {
                required: 300_000,
                available: 100
            })
        ));
        assert_eq!(f.connector.outbox_len(), 0);

        // Free commands and admin pushes need no deposit.
        f.router.dispatch(request(6, "d")).await.unwrap();
        let mut push = request(999, "e");
        push.direction = Direction::AdminToUser;
        f.router.dispatch(push).await.unwrap();
        assert_eq!(f.connector.outbox_len(), 2);
    }

    #[tokio::test]
    async fn test_reservations_prevent_overspend() {
        let f = fixture(500_000);
        f.router.dispatch(request(5, "one")).await.unwrap();
        assert!(matches!(
            f.router.dispatch(request(5, "two")).await,
            Err(BridgeError::InsufficientDeposit {
                available: 200_000,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connector_failure_marks_failed() {
        let f = fixture(1_000_000);
        f.connector.set_online(false);
        assert!(matches!(
            f.router.dispatch(request(5, "down")).await,
            Err(BridgeError::ChainUnavailable(_))
        ));

        let key = request(5, "down").key();
        let record = f.router.get_dispatch(&key).unwrap();
        assert_eq!(record.status, DispatchStatus::Failed);
        // No automatic retry, and the key stays taken.
        f.connector.set_online(true);
        assert!(matches!(
            f.router.dispatch(request(5, "down")).await,
            Err(BridgeError::DuplicateCommand(_))
        ));
        assert_eq!(f.connector.outbox_len(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_confirmation_is_anomaly() {
        let mut f = fixture(1_000_000);
        let mut notices = f.hub.subscribe(Topic::Account(USER));
        let record = f.router.dispatch(request(5, "late")).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(f.router.expire_overdue(later).unwrap(), 1);
        let failed = f.router.get_dispatch(&record.key).unwrap();
        assert_eq!(failed.status, DispatchStatus::Failed);
        assert!(failed.failure.unwrap().contains("Confirmation timeout"));

        let envelope = f.apply(confirmation(5, "late", 300_000));
        f.router.on_event(&envelope).unwrap();
        let after = f.router.get_dispatch(&record.key).unwrap();
        assert_eq!(after.status, DispatchStatus::Failed);
        assert!(after.late_confirmation);

        let mut saw_anomaly = false;
        while let Some(Some(item)) = notices.next().now_or_never() {
            if let NotificationRecord::Notification {
                notice: Notice::ReconciliationAnomaly { key, .. },
            } = item
            {
                assert_eq!(key, record.key);
                saw_anomaly = true;
            }
        }
        assert!(saw_anomaly);
    }

    #[tokio::test]
    async fn test_chain_failure_event_fails_dispatch() {
        let mut f = fixture(1_000_000);
        let record = f.router.dispatch(request(5, "f")).await.unwrap();
        let envelope = f.apply(BridgeEvent::CommandFailed(CommandFailed {
            user: USER,
            admin: ADMIN,
            command_id: 5,
            correlation_id: CorrelationId::new("f").unwrap(),
            reason: "insufficient funds".into(),
            ts: 0,
        }));
        f.router.on_event(&envelope).unwrap();

        let record = f.router.get_dispatch(&record.key).unwrap();
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test]
    async fn test_cancel_only_before_awaiting() {
        let f = fixture(1_000_000);
        let record = f.router.dispatch(request(5, "x")).await.unwrap();
        assert!(matches!(
            f.router.cancel(&record.key),
            Err(BridgeError::NotCancellable(
                DispatchStatus::AwaitingConfirmation
            ))
        ));

        // A record persisted but never handed over (e.g. before a crash).
        let key = request(5, "y").key();
        f.mirror
            .store()
            .read(|db| {
                db.insert_dispatch(&DispatchRecord {
                    key: key.clone(),
                    direction: Direction::UserToAdmin,
                    payload_ref: String::new(),
                    price: 300_000,
                    status: DispatchStatus::Submitted,
                    submission_id: None,
                    failure: None,
                    late_confirmation: false,
                    deadline: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
            })
            .unwrap();
        let cancelled = f.router.cancel(&key).unwrap();
        assert_eq!(cancelled.status, DispatchStatus::Failed);
        assert_eq!(cancelled.failure.as_deref(), Some(CANCELLED));
    }

    #[tokio::test]
    async fn test_resume_pending_sets_deadlines() {
        let f = fixture(1_000_000);
        let key = request(5, "crash").key();
        f.mirror
            .store()
            .read(|db| {
                db.insert_dispatch(&DispatchRecord {
                    key: key.clone(),
                    direction: Direction::UserToAdmin,
                    payload_ref: String::new(),
                    price: 300_000,
                    status: DispatchStatus::Submitted,
                    submission_id: None,
                    failure: None,
                    late_confirmation: false,
                    deadline: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
            })
            .unwrap();

        assert_eq!(f.router.resume_pending().unwrap(), 1);
        let record = f.router.get_dispatch(&key).unwrap();
        assert_eq!(record.status, DispatchStatus::AwaitingConfirmation);
        assert!(record.deadline.is_some());
        assert_eq!(f.router.resume_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_instruction_validation() {
        let mut f = fixture(1_000);

        assert!(matches!(
            f.router
                .submit_instruction(Instruction::AdminRegister {
                    authority: ADMIN,
                    communication_pubkey: Pubkey([3; 32]),
                })
                .await,
            Err(BridgeError::Rejected(_))
        ));
        assert!(matches!(
            f.router
                .submit_instruction(Instruction::UserWithdraw {
                    authority: USER,
                    target_admin: ADMIN,
                    amount: 5_000,
                    destination: USER,
                })
                .await,
            Err(BridgeError::InsufficientDeposit { .. })
        ));
        assert!(matches!(
            f.router
                .submit_instruction(Instruction::RequestFunding {
                    requester: USER,
                    target_admin: Pubkey([8; 32]),
                    amount: 10,
                })
                .await,
            Err(BridgeError::NoSuchProfile(_))
        ));

        f.router
            .submit_instruction(Instruction::RequestFunding {
                requester: USER,
                target_admin: ADMIN,
                amount: 10,
            })
            .await
            .unwrap();
        assert_eq!(f.connector.outbox_len(), 1);

        let request = Pubkey([4; 32]);
        f.apply(BridgeEvent::FundingRequested(FundingRequested {
            request,
            requester: USER,
            target_admin: ADMIN,
            amount: 10,
            ts: 0,
        }));
        f.router.resolve_funding(&request, false).await.unwrap();
        f.apply(BridgeEvent::FundingResolved(FundingResolved {
            request,
            target_admin: ADMIN,
            status: FundingStatus::Rejected,
            ts: 0,
        }));
        assert!(matches!(
            f.router.resolve_funding(&request, true).await,
            Err(BridgeError::Rejected(_))
        ));
    }
}
