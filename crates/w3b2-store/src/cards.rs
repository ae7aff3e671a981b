use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use w3b2_shared::types::Pubkey;

use crate::codec::{pubkey_at, timestamp_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{CardRecord, CardScope};

const SELECT_CARD: &str =
    "SELECT holder, service, card_pubkey, sealed_secret, created_at, updated_at
     FROM chain_cards";

impl Database {
    /// Store a new card with its metadata. Fails with
    /// [`StoreError::Duplicate`] when the relationship already has one.
    pub fn insert_card(&self, card: &CardRecord) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO chain_cards
                (holder, service, card_pubkey, sealed_secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                card.scope.holder.to_hex(),
                card.scope.service.to_hex(),
                card.card_pubkey.to_hex(),
                card.sealed_secret,
                card.created_at.to_rfc3339(),
                card.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => self.write_card_metadata(&card.scope, &card.metadata),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(card.scope.to_string()))
            }
            Err(other) => Err(StoreError::Sqlite(other)),
        }
    }

    pub fn find_card(&self, scope: &CardScope) -> Result<Option<CardRecord>> {
        let card = self
            .conn()
            .query_row(
                &format!("{SELECT_CARD} WHERE holder = ?1 AND service = ?2"),
                params![scope.holder.to_hex(), scope.service.to_hex()],
                row_to_card,
            )
            .optional()?;

        match card {
            Some(mut card) => {
                card.metadata = self.card_metadata(scope)?;
                Ok(Some(card))
            }
            None => Ok(None),
        }
    }

    /// Cards ordered by creation, optionally only those of one holder.
    pub fn list_cards(&self, holder: Option<&Pubkey>) -> Result<Vec<CardRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_CARD} WHERE (?1 IS NULL OR holder = ?1)
             ORDER BY created_at ASC, holder ASC, service ASC"
        ))?;
        let rows = stmt.query_map(params![holder.map(Pubkey::to_hex)], row_to_card)?;

        let mut cards = Vec::new();
        for row in rows {
            let mut card = row?;
            card.metadata = self.card_metadata(&card.scope)?;
            cards.push(card);
        }
        Ok(cards)
    }

    /// Replace a card's metadata. Returns `false` when no such card exists.
    pub fn replace_card_metadata(
        &self,
        scope: &CardScope,
        metadata: &BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE chain_cards SET updated_at = ?3 WHERE holder = ?1 AND service = ?2",
            params![
                scope.holder.to_hex(),
                scope.service.to_hex(),
                updated_at.to_rfc3339()
            ],
        )?;
        if affected == 0 {
            return Ok(false);
        }
        self.write_card_metadata(scope, metadata)?;
        Ok(true)
    }

    /// Returns `false` when no such card exists. Metadata goes with it.
    pub fn delete_card(&self, scope: &CardScope) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM chain_cards WHERE holder = ?1 AND service = ?2",
            params![scope.holder.to_hex(), scope.service.to_hex()],
        )?;
        Ok(affected > 0)
    }

    fn write_card_metadata(
        &self,
        scope: &CardScope,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (holder, service) = (scope.holder.to_hex(), scope.service.to_hex());
        self.conn().execute(
            "DELETE FROM chain_card_metadata WHERE holder = ?1 AND service = ?2",
            params![holder, service],
        )?;
        let mut stmt = self.conn().prepare(
            "INSERT INTO chain_card_metadata (holder, service, key, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (key, value) in metadata {
            stmt.execute(params![holder, service, key, value])?;
        }
        Ok(())
    }

    fn card_metadata(&self, scope: &CardScope) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn().prepare(
            "SELECT key, value FROM chain_card_metadata WHERE holder = ?1 AND service = ?2",
        )?;
        let rows = stmt.query_map(
            params![scope.holder.to_hex(), scope.service.to_hex()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<CardRecord> {
    Ok(CardRecord {
        scope: CardScope {
            holder: pubkey_at(row, 0)?,
            service: pubkey_at(row, 1)?,
        },
        card_pubkey: pubkey_at(row, 2)?,
        sealed_secret: row.get(3)?,
        metadata: BTreeMap::new(),
        created_at: timestamp_at(row, 4)?,
        updated_at: timestamp_at(row, 5)?,
    })
}
