//! Column conversions shared by the per-entity modules.
//!
//! Keys are stored as hex text, timestamps as RFC-3339 text and amounts as
//! INTEGER. SQLite integers are signed, so every u64 crossing the boundary is
//! range-checked in both directions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use w3b2_shared::types::Pubkey;

use crate::error::{Result, StoreError};

fn conversion_error<E>(idx: usize, ty: Type, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

/// u64 -> i64 for writes.
pub(crate) fn amount(value: u64, column: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::Overflow(column))
}

pub(crate) fn amount_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| conversion_error(idx, Type::Integer, e))
}

pub(crate) fn pubkey_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Pubkey> {
    let hex: String = row.get(idx)?;
    Pubkey::from_hex(&hex).map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(idx, &text)
}

pub(crate) fn opt_timestamp_at(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_timestamp(idx, &t)).transpose()
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

/// Parse a text column through `FromStr` (status enums, correlation ids).
pub(crate) fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

pub(crate) fn millis_to_timestamp(
    idx: usize,
    millis: Option<i64>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match millis {
        None => Ok(None),
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
    }
}
