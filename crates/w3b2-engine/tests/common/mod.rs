#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use w3b2_engine::{Bridge, ChannelConnector, EngineConfig, MasterKey};
use w3b2_shared::crypto::{comm_public_key, generate_comm_secret};
use w3b2_shared::events::*;
use w3b2_shared::protocol::Instruction;
use w3b2_shared::types::Pubkey;
use w3b2_store::Database;

pub const ADMIN: Pubkey = Pubkey([0xad; 32]);
pub const USER: Pubkey = Pubkey([0x05; 32]);

pub fn config() -> EngineConfig {
    EngineConfig {
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        ..EngineConfig::default()
    }
}

/// Stable across restarts so stored cards stay readable.
pub fn master_key() -> MasterKey {
    MasterKey::from_passphrase("w3b2 test keystore")
}

pub fn start(db: Database, connector: &ChannelConnector) -> Arc<Bridge> {
    let bridge = Bridge::new(db, Arc::new(connector.clone()), master_key(), config()).unwrap();
    bridge.start().unwrap();
    bridge
}

/// Wait until the mirror checkpoint reaches `seq`.
pub async fn synced(bridge: &Bridge, seq: u64) {
    for _ in 0..500 {
        if bridge.mirror().checkpoint().unwrap().seq >= seq {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mirror never reached seq {seq}");
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

/// Admin with command 5 priced at 300_000 and one user holding `deposit`.
/// Returns the last emitted sequence number.
pub fn seed(connector: &ChannelConnector, deposit: u64) -> u64 {
    connector
        .emit(&BridgeEvent::AdminProfileRegistered(AdminProfileRegistered {
            authority: ADMIN,
            communication_pubkey: comm_public_key(&generate_comm_secret()),
            ts: 1_700_000_000,
        }))
        .unwrap();
    connector
        .emit(&BridgeEvent::AdminPricesUpdated(AdminPricesUpdated {
            authority: ADMIN,
            new_prices: vec![(5, 300_000), (7, 0)],
            ts: 1_700_000_001,
        }))
        .unwrap();
    connector
        .emit(&BridgeEvent::UserProfileCreated(UserProfileCreated {
            authority: USER,
            target_admin: ADMIN,
            communication_pubkey: comm_public_key(&generate_comm_secret()),
            ts: 1_700_000_002,
        }))
        .unwrap();
    connector
        .emit(&BridgeEvent::UserFundsDeposited(UserFundsDeposited {
            authority: USER,
            target_admin: ADMIN,
            amount: deposit,
            new_deposit_balance: deposit,
            ts: 1_700_000_003,
        }))
        .unwrap()
        .seq
}

/// The chain's confirmation of the oldest queued dispatch, at the price the
/// sender accepted. Not emitted.
pub fn next_confirmation(connector: &ChannelConnector) -> BridgeEvent {
    let mut outbox = connector.drain_outbox();
    assert!(!outbox.is_empty(), "nothing was submitted");
    let (_, submission) = outbox.remove(0);
    match submission.decode_instruction().unwrap() {
        Instruction::DispatchCommand {
            sender,
            recipient,
            command_id,
            max_price,
            correlation_id,
            payload,
        } => BridgeEvent::UserCommandDispatched(UserCommandDispatched {
            sender,
            target_admin: recipient,
            command_id,
            price_paid: max_price,
            correlation_id,
            payload,
            ts: 1_700_000_100,
        }),
        other => panic!("unexpected instruction {other:?}"),
    }
}

/// Play the chain: emit the confirmation of the oldest queued dispatch.
pub fn confirm_next(connector: &ChannelConnector) -> u64 {
    connector.emit(&next_confirmation(connector)).unwrap().seq
}
