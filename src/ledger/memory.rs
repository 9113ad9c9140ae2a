//! In-process change-history ledger, used in unit tests and as a building
//! block for the Postgres-backed implementation's write-behind cache.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::lsn::Lsn;
use crate::model::Change;

use super::{ChangeLedger, Error};

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    // Keyed by the LSN's u64 encoding so range scans stay ordered and O(log n).
    entries: RwLock<BTreeMap<u64, Change>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl ChangeLedger for InMemoryLedger {
    async fn append(&self, change: Change) -> Result<(), Error> {
        let mut entries = self.entries.write();
        entries.entry(change.lsn.as_u64()).or_insert(change);
        Ok(())
    }

    async fn head_lsn(&self) -> Result<Lsn, Error> {
        Ok(self
            .entries
            .read()
            .keys()
            .next_back()
            .copied()
            .map(Lsn::from_u64)
            .unwrap_or(Lsn::ZERO))
    }

    async fn read_after(&self, from: Lsn, limit: usize) -> Result<Vec<Change>, Error> {
        let entries = self.entries.read();
        Ok(entries
            .range((
                std::ops::Bound::Excluded(from.as_u64()),
                std::ops::Bound::Unbounded,
            ))
            .take(limit)
            .map(|(_, change)| change.clone())
            .collect())
    }

    async fn count_after(&self, from: Lsn) -> Result<u64, Error> {
        let entries = self.entries.read();
        Ok(entries
            .range((
                std::ops::Bound::Excluded(from.as_u64()),
                std::ops::Bound::Unbounded,
            ))
            .count() as u64)
    }

    async fn truncate_before(&self, lsn: Lsn) -> Result<(), Error> {
        let mut entries = self.entries.write();
        *entries = entries.split_off(&lsn.as_u64());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Op, Table};
    use chrono::Utc;
    use serde_json::json;

    fn change(lsn: &str, id: &str) -> Change {
        Change::new(
            Table::Tasks,
            Op::Insert,
            json!({"id": id}),
            Lsn::parse(lsn).unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn append_is_idempotent_on_lsn() {
        let ledger = InMemoryLedger::new();
        ledger.append(change("0/1", "a")).await.unwrap();
        ledger.append(change("0/1", "a")).await.unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn head_lsn_is_max_stored() {
        let ledger = InMemoryLedger::new();
        assert_eq!(ledger.head_lsn().await.unwrap(), Lsn::ZERO);
        ledger.append(change("0/5", "a")).await.unwrap();
        ledger.append(change("0/2", "b")).await.unwrap();
        assert_eq!(ledger.head_lsn().await.unwrap(), Lsn::parse("0/5").unwrap());
    }

    #[tokio::test]
    async fn read_after_is_gap_free_across_pagination() {
        let ledger = InMemoryLedger::new();
        for i in 1..=10u32 {
            ledger
                .append(change(&format!("0/{i}"), &format!("row{i}")))
                .await
                .unwrap();
        }

        let first = ledger.read_after(Lsn::ZERO, 4).await.unwrap();
        assert_eq!(first.len(), 4);
        let second = ledger
            .read_after(first.last().unwrap().lsn, 4)
            .await
            .unwrap();
        assert_eq!(second.len(), 4);
        let third = ledger
            .read_after(second.last().unwrap().lsn, 4)
            .await
            .unwrap();
        assert_eq!(third.len(), 2);

        let mut all: Vec<Lsn> = first
            .iter()
            .chain(second.iter())
            .chain(third.iter())
            .map(|c| c.lsn)
            .collect();
        let mut expected: Vec<Lsn> = (1..=10u32)
            .map(|i| Lsn::parse(&format!("0/{i}")).unwrap())
            .collect();
        all.sort();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn count_after_matches_read_after_len() {
        let ledger = InMemoryLedger::new();
        for i in 1..=5u32 {
            ledger.append(change(&format!("0/{i}"), &format!("row{i}"))).await.unwrap();
        }
        assert_eq!(ledger.count_after(Lsn::parse("0/2").unwrap()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn truncate_before_discards_older_entries() {
        let ledger = InMemoryLedger::new();
        ledger.append(change("0/1", "a")).await.unwrap();
        ledger.append(change("0/2", "b")).await.unwrap();
        ledger.append(change("0/3", "c")).await.unwrap();

        ledger.truncate_before(Lsn::parse("0/2").unwrap()).await.unwrap();
        let remaining = ledger.read_after(Lsn::ZERO, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].lsn, Lsn::parse("0/2").unwrap());
    }
}
