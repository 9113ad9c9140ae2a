use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::lsn::Lsn;

use super::{ClientRecord, ClientRegistry, Error};

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    clients: DashMap<Uuid, ClientRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRegistry for InMemoryRegistry {
    async fn get(&self, client_id: Uuid) -> Result<Option<ClientRecord>, Error> {
        Ok(self.clients.get(&client_id).map(|r| r.clone()))
    }

    async fn upsert(&self, record: ClientRecord) -> Result<(), Error> {
        self.clients
            .entry(record.client_id)
            .and_modify(|existing| {
                existing.profile_id = record.profile_id;
                existing.subject_id = record.subject_id.clone();
                existing.updated_at = record.updated_at;
            })
            .or_insert(record);
        Ok(())
    }

    async fn update_last_ack_lsn(&self, client_id: Uuid, lsn: Lsn) -> Result<(), Error> {
        if let Some(mut record) = self.clients.get_mut(&client_id) {
            if Lsn::compare(&lsn, &record.last_ack_lsn) > 0 {
                record.last_ack_lsn = lsn;
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientRecord>, Error> {
        Ok(self.clients.iter().map(|r| r.clone()).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn last_ack_lsn_only_advances() {
        let registry = InMemoryRegistry::new();
        let client_id = Uuid::new_v4();
        registry
            .upsert(ClientRecord::new(client_id, Uuid::new_v4(), None, Utc::now()))
            .await
            .unwrap();

        registry
            .update_last_ack_lsn(client_id, Lsn::parse("0/10").unwrap())
            .await
            .unwrap();
        registry
            .update_last_ack_lsn(client_id, Lsn::parse("0/5").unwrap())
            .await
            .unwrap();

        let record = registry.get(client_id).await.unwrap().unwrap();
        assert_eq!(record.last_ack_lsn, Lsn::parse("0/10").unwrap());
    }

    #[tokio::test]
    async fn upsert_preserves_last_ack_lsn() {
        let registry = InMemoryRegistry::new();
        let client_id = Uuid::new_v4();
        let profile = Uuid::new_v4();
        registry
            .upsert(ClientRecord::new(client_id, profile, None, Utc::now()))
            .await
            .unwrap();
        registry
            .update_last_ack_lsn(client_id, Lsn::parse("0/10").unwrap())
            .await
            .unwrap();

        // Reconnect: upsert again (e.g. new session), last_ack_lsn survives.
        registry
            .upsert(ClientRecord::new(client_id, profile, Some("sub".into()), Utc::now()))
            .await
            .unwrap();

        let record = registry.get(client_id).await.unwrap().unwrap();
        assert_eq!(record.last_ack_lsn, Lsn::parse("0/10").unwrap());
        assert_eq!(record.subject_id.as_deref(), Some("sub"));
    }
}
