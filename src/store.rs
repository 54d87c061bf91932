//! Ledger store abstraction
//!
//! Durable keyed storage for Escrow and Stream records. The store persists
//! and retrieves records and must never apply business rules; all status and
//! amount mutations happen in [`crate::engine`]. Implementations serialize
//! writes to the same record. The store is constructed by the process entry
//! point and passed into the service explicitly.

use crate::models::{Escrow, Stream};
use crate::EscrowResult;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Query filter for escrow records
#[derive(Debug, Clone, Default)]
pub struct EscrowFilter {
    pub job_id: Option<String>,
    pub payer: Option<String>,
    pub payee: Option<String>,
}

/// Query filter for stream records
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub escrow_id: Option<Uuid>,
}

/// Injected persistence for escrow and stream records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_escrow(&self, id: Uuid) -> EscrowResult<Option<Escrow>>;
    async fn put_escrow(&self, escrow: &Escrow) -> EscrowResult<()>;
    async fn list_escrows(&self, filter: &EscrowFilter) -> EscrowResult<Vec<Escrow>>;

    async fn get_stream(&self, id: Uuid) -> EscrowResult<Option<Stream>>;
    async fn put_stream(&self, stream: &Stream) -> EscrowResult<()>;
    async fn list_streams(&self, filter: &StreamFilter) -> EscrowResult<Vec<Stream>>;

    /// Streams are one-to-one with escrows; at most one record matches
    async fn find_stream_by_escrow(&self, escrow_id: Uuid) -> EscrowResult<Option<Stream>> {
        let matches = self
            .list_streams(&StreamFilter {
                escrow_id: Some(escrow_id),
                ..Default::default()
            })
            .await?;
        Ok(matches.into_iter().next())
    }
}

/// In-memory ledger store
pub struct MemoryLedger {
    escrows: RwLock<HashMap<Uuid, Escrow>>,
    streams: RwLock<HashMap<Uuid, Stream>>,
}

impl MemoryLedger {
    /// Open an empty in-memory ledger
    pub fn open() -> Self {
        Self {
            escrows: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::open()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_escrow(&self, id: Uuid) -> EscrowResult<Option<Escrow>> {
        Ok(self.escrows.read().await.get(&id).cloned())
    }

    async fn put_escrow(&self, escrow: &Escrow) -> EscrowResult<()> {
        self.escrows.write().await.insert(escrow.id, escrow.clone());
        Ok(())
    }

    async fn list_escrows(&self, filter: &EscrowFilter) -> EscrowResult<Vec<Escrow>> {
        let escrows = self.escrows.read().await;
        let mut matches: Vec<Escrow> = escrows
            .values()
            .filter(|e| {
                filter.job_id.as_ref().map_or(true, |j| &e.job_id == j)
                    && filter.payer.as_ref().map_or(true, |p| &e.payer == p)
                    && filter.payee.as_ref().map_or(true, |p| &e.payee == p)
            })
            .cloned()
            .collect();
        // Newest first, matching the marketplace listing order
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn get_stream(&self, id: Uuid) -> EscrowResult<Option<Stream>> {
        Ok(self.streams.read().await.get(&id).cloned())
    }

    async fn put_stream(&self, stream: &Stream) -> EscrowResult<()> {
        self.streams.write().await.insert(stream.id, stream.clone());
        Ok(())
    }

    async fn list_streams(&self, filter: &StreamFilter) -> EscrowResult<Vec<Stream>> {
        let streams = self.streams.read().await;
        let mut matches: Vec<Stream> = streams
            .values()
            .filter(|s| {
                filter.sender.as_ref().map_or(true, |v| &s.sender == v)
                    && filter.recipient.as_ref().map_or(true, |v| &s.recipient == v)
                    && filter.escrow_id.map_or(true, |id| s.escrow_id == id)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Escrow;

    fn sample(job: &str, payer: &str) -> Escrow {
        Escrow::new(
            job.into(),
            "app-1".into(),
            payer.into(),
            "freelancer".into(),
            500,
        )
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryLedger::open();
        let escrow = sample("job-1", "client-a");
        store.put_escrow(&escrow).await.unwrap();

        let loaded = store.get_escrow(escrow.id).await.unwrap().unwrap();
        assert_eq!(loaded, escrow);
        assert!(store.get_escrow(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filters_match_job_and_parties() {
        let store = MemoryLedger::open();
        store.put_escrow(&sample("job-1", "client-a")).await.unwrap();
        store.put_escrow(&sample("job-2", "client-a")).await.unwrap();
        store.put_escrow(&sample("job-2", "client-b")).await.unwrap();

        let by_job = store
            .list_escrows(&EscrowFilter {
                job_id: Some("job-2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_job.len(), 2);

        let by_payer = store
            .list_escrows(&EscrowFilter {
                payer: Some("client-a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_payer.len(), 2);
    }

    #[tokio::test]
    async fn find_stream_by_escrow_returns_the_attached_stream() {
        let store = MemoryLedger::open();
        let escrow = sample("job-1", "client-a");
        let stream = Stream::new(
            escrow.id,
            escrow.payer.clone(),
            escrow.payee.clone(),
            500,
            100,
            200,
            None,
        );
        store.put_stream(&stream).await.unwrap();

        let found = store.find_stream_by_escrow(escrow.id).await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(stream.id));
        assert!(store
            .find_stream_by_escrow(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
