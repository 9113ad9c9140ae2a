//! Replication slot lifecycle, grounded in
//! `backend/replication/logical/publisher/slot.rs`'s `ReplicationSlot`, but
//! built on `tokio_postgres`'s own replication protocol commands instead of
//! the teacher's hand-rolled simple-query wire frames.

use tokio_postgres::Client;

use crate::lsn::Lsn;

use super::Error;

/// Status of a replication slot as reported by `pg_replication_slots`.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    pub slot_name: String,
    pub active: bool,
    pub restart_lsn: Option<Lsn>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// Create the slot if it doesn't already exist. Returns the LSN at which a
/// brand-new slot starts (its `consistent_point`), or `None` if the slot
/// already existed (the caller should resume from its own ledger checkpoint
/// instead).
pub async fn ensure_slot(client: &Client, slot_name: &str) -> Result<Option<Lsn>, Error> {
    let existing = client
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    if existing.is_some() {
        return Ok(None);
    }

    let rows = client
        .simple_query(&format!(
            r#"CREATE_REPLICATION_SLOT "{slot_name}" LOGICAL "pgoutput""#
        ))
        .await?;

    let row = rows
        .into_iter()
        .find_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .ok_or_else(|| Error::Decode("CREATE_REPLICATION_SLOT returned no row".into()))?;

    let consistent_point = row
        .get("consistent_point")
        .ok_or_else(|| Error::Decode("CREATE_REPLICATION_SLOT row missing consistent_point".into()))?;

    Ok(Some(Lsn::parse(consistent_point)?))
}

pub async fn drop_slot(client: &Client, slot_name: &str) -> Result<(), Error> {
    client
        .simple_query(&format!(r#"DROP_REPLICATION_SLOT "{slot_name}""#))
        .await?;
    Ok(())
}

pub async fn slot_status(client: &Client, slot_name: &str) -> Result<Option<SlotStatus>, Error> {
    let row = client
        .query_opt(
            "SELECT active, restart_lsn::text, confirmed_flush_lsn::text \
             FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let restart_lsn: Option<String> = row.get(1);
    let confirmed_flush_lsn: Option<String> = row.get(2);

    Ok(Some(SlotStatus {
        slot_name: slot_name.to_string(),
        active: row.get(0),
        restart_lsn: restart_lsn.map(|s| Lsn::parse(&s)).transpose()?,
        confirmed_flush_lsn: confirmed_flush_lsn.map(|s| Lsn::parse(&s)).transpose()?,
    }))
}
