//! Per-relationship ChainCards.
//!
//! Every (holder, service) pair signs with its own card. Secrets are sealed
//! under a wrap key derived from the master key and the pair, and are only
//! opened in memory to sign a submission.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use w3b2_shared::constants::KDF_CONTEXT_KEYSTORE_MASTER;
use w3b2_shared::crypto::{
    derive_key_from_passphrase, generate_symmetric_key, open_card_secret, seal_card_secret,
    SymmetricKey,
};
use w3b2_shared::identity::ChainCard;
use w3b2_shared::types::Pubkey;
use w3b2_store::{CardRecord, CardScope, Database, StoreError};

use crate::error::{BridgeError, Result};
use crate::store::Store;

/// Master key the card secrets are sealed under.
#[derive(Clone)]
pub struct MasterKey(SymmetricKey);

impl MasterKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(derive_key_from_passphrase(
            passphrase.as_bytes(),
            KDF_CONTEXT_KEYSTORE_MASTER,
        ))
    }

    /// A key that lives only as long as the process. Cards sealed under it
    /// cannot be opened after a restart.
    pub fn ephemeral() -> Self {
        Self(generate_symmetric_key())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Change to a card's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataUpdate {
    Replace(BTreeMap<String, String>),
    Set { key: String, value: String },
    Delete(String),
}

/// Public view of a stored card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    pub holder: Pubkey,
    pub service: Pubkey,
    pub card_pubkey: Pubkey,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CardRecord> for CardInfo {
    fn from(record: CardRecord) -> Self {
        Self {
            holder: record.scope.holder,
            service: record.scope.service,
            card_pubkey: record.card_pubkey,
            metadata: record.metadata,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub struct Keystore {
    store: Store,
    master: MasterKey,
}

impl Keystore {
    pub fn new(store: Store, master: MasterKey) -> Self {
        Self { store, master }
    }

    /// Issue a card for a relationship that has none.
    pub fn create(&self, scope: CardScope, metadata: BTreeMap<String, String>) -> Result<CardInfo> {
        let (record, _) = self.store.write(|db| {
            if db.find_card(&scope)?.is_some() {
                return Err(BridgeError::Rejected(format!("card for {scope} already exists")));
            }
            self.issue(db, scope, metadata)
        })?;
        Ok(record.into())
    }

    /// Open the card of a relationship.
    pub fn load(&self, scope: &CardScope) -> Result<ChainCard> {
        let record = self.find(scope)?;
        self.open(&record)
    }

    /// The relationship's card, issued on first use.
    pub fn card_for(&self, scope: CardScope) -> Result<ChainCard> {
        if let Some(record) = self.store.read(|db| db.find_card(&scope))? {
            return self.open(&record);
        }
        self.store.write(|db| match db.find_card(&scope)? {
            Some(record) => self.open(&record),
            None => self
                .issue(db, scope, BTreeMap::new())
                .map(|(_, card)| card),
        })
    }

    pub fn get(&self, scope: &CardScope) -> Result<CardInfo> {
        self.find(scope).map(Into::into)
    }

    pub fn list(&self, holder: Option<&Pubkey>) -> Result<Vec<CardInfo>> {
        let cards = self.store.read(|db| db.list_cards(holder))?;
        Ok(cards.into_iter().map(Into::into).collect())
    }

    pub fn update_metadata(&self, scope: &CardScope, update: MetadataUpdate) -> Result<CardInfo> {
        let record = self.store.write(|db| {
            let mut record = db
                .find_card(scope)?
                .ok_or_else(|| BridgeError::NotFound(format!("card for {scope}")))?;
            match update {
                MetadataUpdate::Replace(metadata) => record.metadata = metadata,
                MetadataUpdate::Set { key, value } => {
                    record.metadata.insert(key, value);
                }
                MetadataUpdate::Delete(key) => {
                    record.metadata.remove(&key);
                }
            }
            record.updated_at = Utc::now();
            db.replace_card_metadata(scope, &record.metadata, record.updated_at)?;
            Ok(record)
        })?;
        Ok(record.into())
    }

    /// Forget a card. The relationship gets a fresh one on its next use.
    pub fn delete(&self, scope: &CardScope) -> Result<()> {
        if !self.store.write(|db| Ok(db.delete_card(scope)?))? {
            return Err(BridgeError::NotFound(format!("card for {scope}")));
        }
        info!(%scope, "chain card deleted");
        Ok(())
    }

    fn find(&self, scope: &CardScope) -> Result<CardRecord> {
        self.store
            .read(|db| db.find_card(scope))?
            .ok_or_else(|| BridgeError::NotFound(format!("card for {scope}")))
    }

    fn open(&self, record: &CardRecord) -> Result<ChainCard> {
        let secret = open_card_secret(
            &self.master.0,
            &record.scope.holder,
            &record.scope.service,
            &record.sealed_secret,
        )?;
        Ok(ChainCard::from_secret_bytes(&secret))
    }

    fn issue(
        &self,
        db: &Database,
        scope: CardScope,
        metadata: BTreeMap<String, String>,
    ) -> Result<(CardRecord, ChainCard)> {
        let card = ChainCard::generate();
        let now = Utc::now();
        let record = CardRecord {
            scope,
            card_pubkey: card.pubkey(),
            sealed_secret: seal_card_secret(
                &self.master.0,
                &scope.holder,
                &scope.service,
                card.secret_bytes(),
            )?,
            metadata,
            created_at: now,
            updated_at: now,
        };
        db.insert_card(&record).map_err(|e| match e {
            StoreError::Duplicate(key) => {
                BridgeError::Rejected(format!("card for {key} already exists"))
            }
            other => other.into(),
        })?;
        info!(%scope, card = %card.pubkey().short(), "chain card issued");
        Ok((record, card))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: Pubkey = Pubkey([1; 32]);
    const ADMIN: Pubkey = Pubkey([2; 32]);
    const OTHER_ADMIN: Pubkey = Pubkey([3; 32]);

    fn scope(holder: Pubkey, service: Pubkey) -> CardScope {
        CardScope { holder, service }
    }

    fn keystore() -> (Keystore, Store) {
        let store = Store::new(Database::open_in_memory().unwrap());
        (
            Keystore::new(store.clone(), MasterKey::from_passphrase("correct horse")),
            store,
        )
    }

    #[test]
    fn test_each_relationship_gets_its_own_card() {
        let (keystore, _) = keystore();
        let first = keystore.card_for(scope(USER, ADMIN)).unwrap();
        let again = keystore.card_for(scope(USER, ADMIN)).unwrap();
        let elsewhere = keystore.card_for(scope(USER, OTHER_ADMIN)).unwrap();
        let admin_own = keystore.card_for(scope(ADMIN, ADMIN)).unwrap();

        assert_eq!(first.pubkey(), again.pubkey());
        assert_ne!(first.pubkey(), elsewhere.pubkey());
        assert_ne!(first.pubkey(), admin_own.pubkey());
        assert_eq!(keystore.list(Some(&USER)).unwrap().len(), 2);
        assert_eq!(keystore.list(None).unwrap().len(), 3);
    }

    #[test]
    fn test_secret_is_sealed_at_rest() {
        let (keystore, store) = keystore();
        let card = keystore.card_for(scope(USER, ADMIN)).unwrap();

        let record = store
            .read(|db| db.find_card(&scope(USER, ADMIN)))
            .unwrap()
            .unwrap();
        assert_eq!(record.card_pubkey, card.pubkey());
        assert!(!record
            .sealed_secret
            .windows(32)
            .any(|w| w == card.secret_bytes()));

        // Same database, different master key.
        let stranger = Keystore::new(store, MasterKey::from_passphrase("wrong"));
        assert!(matches!(
            stranger.load(&scope(USER, ADMIN)),
            Err(BridgeError::Crypto(_))
        ));
        assert_eq!(
            keystore.load(&scope(USER, ADMIN)).unwrap().pubkey(),
            card.pubkey()
        );
    }

    #[test]
    fn test_create_refuses_existing_relationship() {
        let (keystore, _) = keystore();
        let info = keystore
            .create(
                scope(USER, ADMIN),
                BTreeMap::from([("label".to_string(), "phone".to_string())]),
            )
            .unwrap();
        assert_eq!(info.metadata["label"], "phone");
        assert!(matches!(
            keystore.create(scope(USER, ADMIN), BTreeMap::new()),
            Err(BridgeError::Rejected(_))
        ));
        assert_eq!(
            keystore.card_for(scope(USER, ADMIN)).unwrap().pubkey(),
            info.card_pubkey
        );
    }

    #[test]
    fn test_metadata_updates() {
        let (keystore, _) = keystore();
        let pair = scope(USER, ADMIN);
        keystore.card_for(pair).unwrap();

        let set = MetadataUpdate::Set {
            key: "label".into(),
            value: "laptop".into(),
        };
        keystore.update_metadata(&pair, set).unwrap();
        let info = keystore
            .update_metadata(
                &pair,
                MetadataUpdate::Set {
                    key: "os".into(),
                    value: "linux".into(),
                },
            )
            .unwrap();
        assert_eq!(info.metadata.len(), 2);

        let info = keystore
            .update_metadata(&pair, MetadataUpdate::Delete("label".into()))
            .unwrap();
        assert_eq!(info.metadata.keys().collect::<Vec<_>>(), vec!["os"]);

        let info = keystore
            .update_metadata(&pair, MetadataUpdate::Replace(BTreeMap::new()))
            .unwrap();
        assert!(info.metadata.is_empty());
        assert_eq!(keystore.get(&pair).unwrap(), info);

        let missing = MetadataUpdate::Delete("x".into());
        assert!(matches!(
            keystore.update_metadata(&scope(USER, OTHER_ADMIN), missing),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_deleted_card_is_replaced_on_next_use() {
        let (keystore, _) = keystore();
        let pair = scope(USER, ADMIN);
        let old = keystore.card_for(pair).unwrap();

        keystore.delete(&pair).unwrap();
        assert!(matches!(keystore.load(&pair), Err(BridgeError::NotFound(_))));
        assert!(matches!(keystore.delete(&pair), Err(BridgeError::NotFound(_))));

        let fresh = keystore.card_for(pair).unwrap();
        assert_ne!(fresh.pubkey(), old.pubkey());
    }

    #[test]
    fn test_master_key_debug_is_redacted() {
        let rendered = format!("{:?}", MasterKey::from_passphrase("hunter2"));
        assert_eq!(rendered, "MasterKey(..)");
    }
}
