//! Chain module - the capability boundary between the coordinator and each ledger
//!
//! This module provides:
//! - The `ChainClient` trait every chain adapter implements
//! - Strongly-typed escrow parameters shared by all adapters
//! - A `ChainManager` holding one client per configured chain
//! - Per-escrow monitoring and timelock stage projection

pub mod monitor;
pub mod simulated;
pub mod timelock;

pub use monitor::{EscrowMonitor, MonitorPayload, MonitorUpdate};
pub use simulated::SimulatedChain;
pub use timelock::{TimelockSchedule, TimelockStage};

use crate::config::{ChainConfig, ChainKind, Settings};
use crate::coordination::swap::{MerkleProof, Side};
use crate::crypto::Hash;
use crate::error::{ChainError, ChainResult};
use crate::events::ChainEvent;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Opaque chain identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChainId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChainId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partial-fill parameters baked into a destination escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFillParams {
    #[serde(with = "crate::crypto::serde_hex")]
    pub merkle_root: Hash,
    pub total_parts: u32,
}

/// Escrow parameters, validated once at the coordinator boundary and
/// handed unchanged to whichever chain deploys the escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowParams {
    pub chain_id: ChainId,
    /// Selects the stage track the escrow's timelocks follow
    pub side: Side,
    #[serde(with = "crate::crypto::serde_hex")]
    pub hashlock: Hash,
    pub token: String,
    pub amount: u128,
    pub maker: String,
    pub taker: String,
    pub safety_deposit: u128,
    pub timelock_duration: u64,
    pub partial_fills: Option<PartialFillParams>,
}

/// Confirmation state of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Confirmed,
    /// Broadcast but not yet final; must not be treated as settled
    Pending,
}

/// Reference to a transaction on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub chain_id: ChainId,
    pub hash: String,
    pub status: TxStatus,
}

impl TxRef {
    pub fn is_confirmed(&self) -> bool {
        self.status == TxStatus::Confirmed
    }
}

/// Result of a confirmed escrow deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub address: String,
    /// Chain-native timestamp of the deploying block
    pub deployed_at: u64,
    pub tx_hash: String,
}

/// Escrow state as read back from the chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub address: String,
    pub deployed_at: u64,
    pub withdrawn: bool,
    pub cancelled: bool,
    pub revealed_secret: Option<String>,
    pub used_indices: Vec<u32>,
    /// Chain height the snapshot was read at
    pub block_number: u64,
}

/// Stream of escrow events delivered at-least-once
pub type EventStream = mpsc::UnboundedReceiver<ChainEvent>;

/// Operations the coordinator needs from a chain.
///
/// Implementations must return from `deploy`, `withdraw` and `cancel` only
/// once the transaction is confirmed, or report `TxStatus::Pending`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain this client talks to
    fn chain_id(&self) -> ChainId;

    /// Address `deploy` will produce for these parameters
    fn predict_address(&self, params: &EscrowParams) -> String;

    async fn deploy(&self, params: &EscrowParams) -> ChainResult<Deployment>;

    async fn withdraw(&self, address: &str, secret: &str) -> ChainResult<TxRef>;

    async fn withdraw_partial(
        &self,
        address: &str,
        secret: &str,
        proof: &MerkleProof,
    ) -> ChainResult<TxRef>;

    async fn cancel(&self, address: &str) -> ChainResult<TxRef>;

    async fn get_state(&self, address: &str) -> ChainResult<EscrowSnapshot>;

    async fn current_stage(&self, address: &str) -> ChainResult<TimelockStage>;

    /// Subscribe to `Withdrawn | Cancelled | SecretRevealed | PartialFilled`
    /// events of one escrow. Duplicates are possible.
    async fn subscribe(&self, address: &str) -> ChainResult<EventStream>;

    /// Liveness check
    async fn health_check(&self) -> bool;
}

/// Run a chain call under a deadline. Elapsed calls are reported as
/// `NetworkUnavailable`, since the transaction may still land.
pub async fn with_timeout<T, F>(
    chain_id: &ChainId,
    operation: &'static str,
    limit: Duration,
    call: F,
) -> ChainResult<T>
where
    F: Future<Output = ChainResult<T>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Chain {} {} timed out after {}ms",
                chain_id,
                operation,
                limit.as_millis()
            );
            Err(ChainError::NetworkUnavailable {
                chain_id: chain_id.clone(),
                message: format!("{} timed out after {}ms", operation, limit.as_millis()),
            })
        }
    };

    crate::metrics::record_chain_call(
        chain_id.as_str(),
        operation,
        &result,
        started.elapsed().as_secs_f64(),
    );
    result
}

/// Holds one client per configured chain
pub struct ChainManager {
    clients: DashMap<ChainId, Arc<dyn ChainClient>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Build clients for all enabled chains in the settings
    pub fn from_settings(settings: &Settings) -> Self {
        let manager = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );
            let client = Self::build_client(chain_config, &settings.timelocks);
            manager.register(client);
        }

        manager
    }

    fn build_client(config: &ChainConfig, schedule: &TimelockSchedule) -> Arc<dyn ChainClient> {
        match config.kind {
            ChainKind::Simulated => Arc::new(SimulatedChain::new(
                ChainId::new(config.chain_id.clone()),
                schedule.clone(),
            )),
        }
    }

    /// Add or replace the client for its chain
    pub fn register(&self, client: Arc<dyn ChainClient>) {
        let chain_id = client.chain_id();
        debug!("Registered client for chain {}", chain_id);
        self.clients.insert(chain_id, client);
    }

    /// Get client for a specific chain
    pub fn get(&self, chain_id: &ChainId) -> Option<Arc<dyn ChainClient>> {
        self.clients.get(chain_id).map(|c| c.value().clone())
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.clients.contains_key(chain_id)
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.clients.iter().map(|e| e.key().clone()).collect();
        chains.sort();
        chains
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(clients.len());
        for (chain_id, client) in clients {
            let healthy = client.health_check().await;
            crate::metrics::record_chain_health(chain_id.as_str(), healthy);
            results.push((chain_id, healthy));
        }
        results
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_network_unavailable() {
        let chain_id = ChainId::from("slow");
        let result: ChainResult<()> = with_timeout(&chain_id, "deploy", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(e @ ChainError::NetworkUnavailable { .. }) => assert!(e.is_retryable()),
            other => panic!("expected NetworkUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manager_registers_by_chain_id() {
        let manager = ChainManager::new();
        manager.register(Arc::new(SimulatedChain::new(
            ChainId::from("near"),
            TimelockSchedule::default(),
        )));
        manager.register(Arc::new(SimulatedChain::new(
            ChainId::from("ethereum"),
            TimelockSchedule::default(),
        )));

        assert!(manager.contains(&ChainId::from("near")));
        assert!(manager.get(&ChainId::from("solana")).is_none());
        assert_eq!(
            manager.connected_chains(),
            vec![ChainId::from("ethereum"), ChainId::from("near")]
        );
        assert!(manager.health_check().await.iter().all(|(_, h)| *h));
    }
}
