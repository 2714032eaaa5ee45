//! In-memory swap registry
//!
//! Owns the bridge state: swap records, the pending-secret index, the
//! append-only event log and per-chain sync watermarks. Every mutation of a
//! swap goes through that swap's lock, so two mutations of the same swap
//! never interleave while different swaps proceed independently.

use super::journal::{EventJournal, JournalEntry};
use crate::chain::ChainId;
use crate::coordination::swap::{SwapConfig, SwapRecord, SwapStatus};
use crate::crypto::{self, Hash};
use crate::error::{SwapError, SwapResult};
use crate::events::{CrossChainEvent, EventKind};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Point-in-time copy of the whole bridge state
#[derive(Debug, Clone)]
pub struct BridgeState {
    pub transactions: HashMap<String, SwapRecord>,
    pub pending_secrets: HashMap<Hash, String>,
    pub event_log: Vec<CrossChainEvent>,
    pub last_sync_block: HashMap<ChainId, u64>,
}

/// Authoritative holder of all swap records
pub struct SwapRegistry {
    swaps: DashMap<String, Arc<Mutex<SwapRecord>>>,
    /// hashlock -> secret, until the secret is revealed
    pending_secrets: DashMap<Hash, String>,
    /// hashlock -> owning swap; a hashlock is never shared between swaps
    hashlocks: DashMap<Hash, String>,
    event_log: RwLock<Vec<CrossChainEvent>>,
    last_sync_block: DashMap<ChainId, u64>,
    journal: Option<EventJournal>,
    nonce: AtomicU64,
}

impl SwapRegistry {
    pub fn new() -> Self {
        Self {
            swaps: DashMap::new(),
            pending_secrets: DashMap::new(),
            hashlocks: DashMap::new(),
            event_log: RwLock::new(Vec::new()),
            last_sync_block: DashMap::new(),
            journal: None,
            nonce: AtomicU64::new(0),
        }
    }

    /// Registry that journals every committed mutation
    pub fn with_journal(journal: EventJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    /// Rebuild from a journal file and keep appending to it.
    ///
    /// Pending secrets are never journaled, so they start empty.
    pub fn restore(path: impl AsRef<Path>) -> SwapResult<Self> {
        let entries = EventJournal::replay(path.as_ref())?;
        let mut registry = Self::with_journal(EventJournal::open(path.as_ref())?);

        let mut log = Vec::with_capacity(entries.len());
        for entry in entries {
            if let (Some(chain_id), Some(block)) = (&entry.event.chain_id, entry.event.block_number) {
                registry.advance_sync_block(chain_id, block);
            }
            registry
                .hashlocks
                .insert(entry.record.hashlock(), entry.record.id.clone());
            registry
                .swaps
                .insert(entry.record.id.clone(), Arc::new(Mutex::new(entry.record)));
            log.push(entry.event);
        }

        registry.nonce.store(log.len() as u64, Ordering::SeqCst);
        info!(
            "Restored {} swaps and {} events from journal",
            registry.swaps.len(),
            log.len()
        );
        *registry.event_log.get_mut() = log;
        Ok(registry)
    }

    /// Validate a configuration and store a fresh `pending` record.
    ///
    /// A secret already used by another swap is rejected: revealing it for
    /// one swap would unlock the escrows of the other.
    pub async fn create(&self, config: &SwapConfig) -> SwapResult<String> {
        config.validate()?;

        let created_at = Utc::now();
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let id = swap_id(config, created_at.timestamp_millis(), nonce);

        let record = SwapRecord::new(id.clone(), config, created_at);
        let hashlock = record.hashlock();
        let event = CrossChainEvent::new(&id, EventKind::SwapCreated).with_data(serde_json::json!({
            "srcChain": config.src_chain,
            "dstChain": config.dst_chain,
            "hashlock": crypto::to_hex(&hashlock),
            "partialFills": config.enable_partial_fills,
        }));

        if self.swaps.contains_key(&id) {
            return Err(SwapError::Internal(format!("swap id collision on {}", id)));
        }
        match self.hashlocks.entry(hashlock) {
            Entry::Occupied(owner) => {
                return Err(SwapError::InvalidConfig(format!(
                    "hashlock {} is already used by swap {}",
                    crypto::to_hex(&hashlock),
                    owner.get()
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }
        if let Err(e) = self.persist(&event, &record) {
            self.hashlocks.remove(&hashlock);
            return Err(e);
        }
        self.swaps.insert(id.clone(), Arc::new(Mutex::new(record)));
        self.pending_secrets.insert(hashlock, config.secret.clone());
        self.event_log.write().await.push(event);

        crate::metrics::record_swap_created();
        crate::metrics::record_status(SwapStatus::Pending);
        debug!("Created swap {}", id);
        Ok(id)
    }

    /// Current record of a swap
    pub async fn get(&self, swap_id: &str) -> SwapResult<SwapRecord> {
        let entry = self.entry(swap_id)?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// Take the swap's lock for a sequence of reads and mutations
    pub async fn lock(&self, swap_id: &str) -> SwapResult<SwapGuard<'_>> {
        let entry = self.entry(swap_id)?;
        Ok(SwapGuard {
            registry: self,
            record: entry.lock_owned().await,
        })
    }

    /// Apply one transition under the swap's lock
    pub async fn update<T, F>(&self, swap_id: &str, event: CrossChainEvent, mutate: F) -> SwapResult<T>
    where
        F: FnOnce(&mut SwapRecord) -> SwapResult<T>,
    {
        let mut guard = self.lock(swap_id).await?;
        guard.apply(event, mutate).await
    }

    /// Swaps with escrows live on-chain
    pub async fn list_active(&self) -> Vec<SwapRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|r| matches!(r.status, SwapStatus::Deployed | SwapStatus::Active))
            .collect()
    }

    /// Every record, oldest first
    pub async fn list(&self) -> Vec<SwapRecord> {
        let entries: Vec<_> = self.swaps.iter().map(|e| e.value().clone()).collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.clone());
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn pending_secret(&self, hashlock: &Hash) -> Option<String> {
        self.pending_secrets.get(hashlock).map(|s| s.value().clone())
    }

    /// Drop a pending secret once revealed. Removing twice is a no-op.
    pub fn remove_pending_secret(&self, hashlock: &Hash) -> bool {
        self.pending_secrets.remove(hashlock).is_some()
    }

    pub fn pending_secret_count(&self) -> usize {
        self.pending_secrets.len()
    }

    /// Advance a chain's sync watermark; it never moves backwards
    pub fn advance_sync_block(&self, chain_id: &ChainId, block: u64) -> u64 {
        let mut entry = self.last_sync_block.entry(chain_id.clone()).or_insert(0);
        if block > *entry {
            *entry = block;
        }
        *entry
    }

    pub fn last_sync_block(&self, chain_id: &ChainId) -> u64 {
        self.last_sync_block.get(chain_id).map(|b| *b).unwrap_or(0)
    }

    /// Append an event that does not mutate any record
    pub async fn record_event(&self, event: CrossChainEvent) -> SwapResult<()> {
        let record = self.get(&event.swap_id).await?;
        self.persist(&event, &record)?;
        self.event_log.write().await.push(event);
        Ok(())
    }

    /// Full event log
    pub async fn events(&self) -> Vec<CrossChainEvent> {
        self.event_log.read().await.clone()
    }

    /// Events of one swap, in log order
    pub async fn events_for(&self, swap_id: &str) -> Vec<CrossChainEvent> {
        self.event_log
            .read()
            .await
            .iter()
            .filter(|e| e.swap_id == swap_id)
            .cloned()
            .collect()
    }

    /// Snapshot of everything the registry holds
    pub async fn bridge_state(&self) -> BridgeState {
        let transactions = self
            .list()
            .await
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        BridgeState {
            transactions,
            pending_secrets: self
                .pending_secrets
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            event_log: self.events().await,
            last_sync_block: self
                .last_sync_block
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    fn entry(&self, swap_id: &str) -> SwapResult<Arc<Mutex<SwapRecord>>> {
        self.swaps
            .get(swap_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SwapError::SwapNotFound {
                swap_id: swap_id.to_string(),
            })
    }

    fn persist(&self, event: &CrossChainEvent, record: &SwapRecord) -> SwapResult<()> {
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry {
                event: event.clone(),
                record: record.clone(),
            })?;
        }
        Ok(())
    }
}

impl Default for SwapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one swap record
pub struct SwapGuard<'a> {
    registry: &'a SwapRegistry,
    record: OwnedMutexGuard<SwapRecord>,
}

impl SwapGuard<'_> {
    pub fn record(&self) -> &SwapRecord {
        &self.record
    }

    /// Log an event that leaves the record as it is
    pub async fn record_event(&self, mut event: CrossChainEvent) -> SwapResult<()> {
        event.swap_id = self.record.id.clone();
        self.registry.persist(&event, &self.record)?;
        self.registry.event_log.write().await.push(event);
        Ok(())
    }

    /// Run `mutate` on a working copy and commit it only on success.
    ///
    /// A successful call that changes nothing (a replayed event) commits
    /// nothing and logs nothing.
    pub async fn apply<T, F>(&mut self, mut event: CrossChainEvent, mutate: F) -> SwapResult<T>
    where
        F: FnOnce(&mut SwapRecord) -> SwapResult<T>,
    {
        let mut working = self.record.clone();
        let output = mutate(&mut working)?;

        if working == *self.record {
            return Ok(output);
        }

        let now = Utc::now();
        working.updated_at = now;
        event.swap_id = working.id.clone();
        event.timestamp = now;

        self.registry.persist(&event, &working)?;

        let previous_status = self.record.status;
        *self.record = working;

        if let (Some(chain_id), Some(block)) = (&event.chain_id, event.block_number) {
            self.registry.advance_sync_block(chain_id, block);
        }
        self.registry.event_log.write().await.push(event);

        if self.record.status != previous_status {
            info!(
                "Swap {} status {} -> {}",
                self.record.id, previous_status, self.record.status
            );
            crate::metrics::record_status(self.record.status);
        }

        Ok(output)
    }
}

/// Deterministic id from the swap's identity, creation time and a
/// registry-local nonce
fn swap_id(config: &SwapConfig, created_at_millis: i64, nonce: u64) -> String {
    let material = serde_json::json!({
        "srcChain": config.src_chain,
        "dstChain": config.dst_chain,
        "maker": config.maker,
        "taker": config.taker,
        "srcAmount": config.src_amount.to_string(),
        "dstAmount": config.dst_amount.to_string(),
        "createdAt": created_at_millis,
        "nonce": nonce,
    });
    let digest = crypto::keccak256(material.to_string().as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::machine;
    use crate::coordination::swap::fixtures::config;
    use crate::coordination::swap::{EscrowUpdate, Side};
    use tokio_test::assert_ok;

    fn deploy_event(id: &str) -> CrossChainEvent {
        CrossChainEvent::new(id, EventKind::EscrowDeployed)
    }

    #[tokio::test]
    async fn test_create_indexes_pending_secret() {
        let registry = SwapRegistry::new();
        let id = assert_ok!(registry.create(&config("s1")).await);

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, SwapStatus::Pending);
        assert_eq!(registry.pending_secret(&record.hashlock()).as_deref(), Some("s1"));
        assert_eq!(registry.events_for(&id).await.len(), 1);
        assert_eq!(id.len(), 32);
    }

    #[tokio::test]
    async fn test_identical_terms_get_distinct_ids() {
        let registry = SwapRegistry::new();
        let a = registry.create(&config("s1")).await.unwrap();
        let b = registry.create(&config("s2")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_reused_secret_is_rejected() {
        let registry = SwapRegistry::new();
        let a = registry.create(&config("s1")).await.unwrap();

        let mut other = config("s1");
        other.src_amount = 99;
        let err = registry.create(&other).await.unwrap_err();
        assert!(matches!(err, SwapError::InvalidConfig(_)));

        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(registry.pending_secret_count(), 1);
        assert_eq!(registry.events().await.len(), 1);

        // still rejected once the first swap's secret is out
        let hashlock = registry.get(&a).await.unwrap().hashlock();
        assert!(registry.remove_pending_secret(&hashlock));
        assert!(matches!(registry.create(&other).await, Err(SwapError::InvalidConfig(_))));

        let b = registry.create(&config("s2")).await.unwrap();
        let b_hashlock = registry.get(&b).await.unwrap().hashlock();
        assert_eq!(registry.pending_secret(&b_hashlock).as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let registry = SwapRegistry::new();
        let mut cfg = config("s1");
        cfg.dst_chain = cfg.src_chain.clone();

        assert!(matches!(registry.create(&cfg).await, Err(SwapError::InvalidConfig(_))));
        assert!(registry.list().await.is_empty());
        assert!(registry.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_swap() {
        let registry = SwapRegistry::new();
        assert!(matches!(registry.get("missing").await, Err(SwapError::SwapNotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_logs_and_bumps_updated_at() {
        let registry = SwapRegistry::new();
        let id = registry.create(&config("s1")).await.unwrap();
        let created = registry.get(&id).await.unwrap();

        registry
            .update(&id, deploy_event(&id), |r| {
                machine::apply_escrow_update(r, Side::Source, &EscrowUpdate::deployed("0xsrc", 5))
            })
            .await
            .unwrap();

        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, SwapStatus::Deployed);
        assert!(record.updated_at >= created.updated_at);
        assert_eq!(registry.events_for(&id).await.len(), 2);
        assert_eq!(registry.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_and_replay_leave_no_trace() {
        let registry = SwapRegistry::new();
        let id = registry.create(&config("s1")).await.unwrap();
        let before = registry.get(&id).await.unwrap();

        let err = registry
            .update(&id, deploy_event(&id), |r| machine::reveal_secret(r, "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::SecretMismatch { .. }));

        registry
            .update(&id, deploy_event(&id), |r| Ok(machine::recompute_status(r)))
            .await
            .unwrap();

        assert_eq!(registry.get(&id).await.unwrap(), before);
        assert_eq!(registry.events_for(&id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_secret_removal_is_idempotent() {
        let registry = SwapRegistry::new();
        let id = registry.create(&config("s1")).await.unwrap();
        let hashlock = registry.get(&id).await.unwrap().hashlock();

        assert!(registry.remove_pending_secret(&hashlock));
        assert!(!registry.remove_pending_secret(&hashlock));
        assert_eq!(registry.pending_secret_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_watermark_is_monotonic() {
        let registry = SwapRegistry::new();
        let chain = ChainId::from("near");

        assert_eq!(registry.advance_sync_block(&chain, 10), 10);
        assert_eq!(registry.advance_sync_block(&chain, 4), 10);
        assert_eq!(registry.last_sync_block(&chain), 10);
        assert_eq!(registry.last_sync_block(&ChainId::from("ethereum")), 0);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_records_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");

        let id = {
            let registry = SwapRegistry::with_journal(EventJournal::open(&path).unwrap());
            let id = registry.create(&config("s1")).await.unwrap();
            let event = deploy_event(&id)
                .on(Side::Source, &ChainId::from("ethereum"), "0xsrc")
                .at(Some(77), "0xdeploy");
            registry
                .update(&id, event, |r| {
                    machine::apply_escrow_update(r, Side::Source, &EscrowUpdate::deployed("0xsrc", 5))
                })
                .await
                .unwrap();
            id
        };

        let restored = SwapRegistry::restore(&path).unwrap();
        let record = restored.get(&id).await.unwrap();
        assert_eq!(record.status, SwapStatus::Deployed);
        assert_eq!(record.src_escrow.contract_address, "0xsrc");
        assert_eq!(restored.events_for(&id).await.len(), 2);
        assert_eq!(restored.last_sync_block(&ChainId::from("ethereum")), 77);
        assert_eq!(restored.pending_secret_count(), 0);

        // the restored registry keeps journaling and still owns the old hashlock
        assert!(matches!(restored.create(&config("s1")).await, Err(SwapError::InvalidConfig(_))));
        restored.create(&config("s2")).await.unwrap();
        assert_eq!(EventJournal::replay(&path).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lock_serializes_mutations() {
        let registry = Arc::new(SwapRegistry::new());
        let id = registry.create(&config("s1")).await.unwrap();

        let guard = registry.lock(&id).await.unwrap();
        let contender = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .update(&id, deploy_event(&id), |r| {
                        machine::apply_escrow_update(r, Side::Destination, &EscrowUpdate::deployed("dst.near", 9))
                    })
                    .await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        assert_eq!(guard.record().status, SwapStatus::Pending);
        drop(guard);

        contender.await.unwrap().unwrap();
        assert_eq!(registry.get(&id).await.unwrap().status, SwapStatus::Deployed);
    }
}
