//! Translates decoded pgoutput messages (from `postgres_protocol`) into
//! [`Change`](crate::model::Change) values, the way
//! `backend/replication/logical/subscriber/stream.rs` dispatches on decoded
//! logical-replication payloads, except here each variant produces a row
//! change instead of a forwarded statement.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use postgres_protocol::message::backend::{
    DeleteBody, InsertBody, RelationBody, Tuple, TupleData, UpdateBody,
};
use serde_json::Value;

use crate::model::Table;

use super::Error;

/// Microseconds since the Postgres epoch (2000-01-01), as used by
/// `BeginBody::timestamp`/`CommitBody::timestamp`.
fn pg_timestamp(micros: i64) -> DateTime<Utc> {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    epoch + chrono::Duration::microseconds(micros)
}

pub(super) fn decode_timestamp(micros: i64) -> DateTime<Utc> {
    pg_timestamp(micros)
}

#[derive(Debug, Clone)]
struct RelationInfo {
    table: Option<Table>,
    columns: Vec<String>,
}

/// Tracks `Relation` messages so later Insert/Update/Delete messages (which
/// carry only an oid) can be mapped back to column names and to one of our
/// known tables. Publications may include tables we don't model; those are
/// tracked with `table: None` and silently skipped.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, body: &RelationBody) -> Result<(), Error> {
        let name = body.name().map_err(|e| Error::Decode(e.to_string()))?;
        let table = Table::from_str(name).ok();

        let mut columns = Vec::with_capacity(body.columns().len());
        for column in body.columns() {
            columns.push(column.name().map_err(|e| Error::Decode(e.to_string()))?.to_string());
        }

        self.relations.insert(body.rel_id(), RelationInfo { table, columns });
        Ok(())
    }

    fn get(&self, rel_id: u32) -> Result<&RelationInfo, Error> {
        self.relations.get(&rel_id).ok_or(Error::UnknownRelation(rel_id))
    }
}

/// The mirrored tables (see `submission::ensure_schema`) store the complete
/// application row -- the same camelCase object a client submitted, with
/// `id`/`clientId`/`updatedAt` already embedded -- in a single `data jsonb`
/// column; the remaining SQL columns (`parent_id`, `client_id`,
/// `updated_at`) are denormalized copies kept only for indexing and the
/// LWW guard in `submission::apply_one`. So a replicated row is recovered
/// by locating that column and parsing its text representation as JSON,
/// not by building a synthetic object out of every physical column.
fn extract_row_data(columns: &[String], tuple: &Tuple) -> Result<Value, Error> {
    let values = tuple.tuple_data();
    if values.len() != columns.len() {
        return Err(Error::Decode(format!(
            "tuple has {} values but relation has {} columns",
            values.len(),
            columns.len()
        )));
    }

    let index = columns
        .iter()
        .position(|name| name == "data")
        .ok_or_else(|| Error::Decode("replicated relation has no \"data\" column".into()))?;

    match &values[index] {
        TupleData::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| Error::Decode(e.to_string()))?;
            serde_json::from_str(text).map_err(|e| Error::Decode(e.to_string()))
        }
        TupleData::Null => Err(Error::Decode("\"data\" column was null".into())),
        TupleData::UnchangedToast => Err(Error::Decode(
            "\"data\" column was TOASTed and not sent; table needs REPLICA IDENTITY FULL".into(),
        )),
    }
}

/// One decoded row-level event, not yet stamped with its transaction's
/// commit LSN (that happens when the enclosing `Commit` message arrives,
/// see [`super::ingester`]).
pub struct DecodedRow {
    pub table: Table,
    pub op: crate::model::Op,
    pub data: Value,
}

pub fn decode_insert(cache: &RelationCache, body: &InsertBody) -> Result<Option<DecodedRow>, Error> {
    let relation = cache.get(body.rel_id())?;
    let Some(table) = relation.table else {
        return Ok(None);
    };
    let data = extract_row_data(&relation.columns, body.tuple())?;
    Ok(Some(DecodedRow { table, op: crate::model::Op::Insert, data }))
}

pub fn decode_update(cache: &RelationCache, body: &UpdateBody) -> Result<Option<DecodedRow>, Error> {
    let relation = cache.get(body.rel_id())?;
    let Some(table) = relation.table else {
        return Ok(None);
    };
    let data = extract_row_data(&relation.columns, body.new_tuple())?;
    Ok(Some(DecodedRow { table, op: crate::model::Op::Update, data }))
}

pub fn decode_delete(cache: &RelationCache, body: &DeleteBody) -> Result<Option<DecodedRow>, Error> {
    let relation = cache.get(body.rel_id())?;
    let Some(table) = relation.table else {
        return Ok(None);
    };
    // The mirrored tables are created with REPLICA IDENTITY FULL
    // (`submission::ensure_schema`), so deletes always carry the old row,
    // including its `data` column -- needed to recover `clientId` for
    // origin filtering on a delete the same as on an insert or update.
    let tuple = body
        .old_tuple()
        .or_else(|| body.key_tuple())
        .ok_or_else(|| Error::Decode("delete carried neither old nor key tuple".into()))?;
    let data = extract_row_data(&relation.columns, tuple)?;
    Ok(Some(DecodedRow { table, op: crate::model::Op::Delete, data }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pg_epoch_timestamp_converts_correctly() {
        let ts = pg_timestamp(0);
        assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:00+00:00");

        let one_second_later = pg_timestamp(1_000_000);
        assert_eq!((one_second_later - ts).num_seconds(), 1);
    }
}
