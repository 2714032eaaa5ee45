//! Event types
//!
//! `ChainEvent`s are what chain clients deliver about a single escrow.
//! `CrossChainEvent`s form the coordinator's append-only audit log, one per
//! successful swap mutation.

use crate::chain::ChainId;
use crate::coordination::swap::Side;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to an escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EscrowEventKind {
    /// Funds released; carries the secret when the chain exposes it
    Withdrawn { secret: Option<String> },
    /// Funds returned to their owner
    Cancelled,
    /// Secret observed on-chain
    SecretRevealed { secret: String },
    /// One part of a partially fillable escrow claimed
    PartialFilled { index: u32 },
}

/// Event emitted by a chain about one escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain_id: ChainId,
    pub address: String,
    pub kind: EscrowEventKind,
    pub block_number: u64,
    pub tx_hash: String,
}

impl ChainEvent {
    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            EscrowEventKind::Withdrawn { .. } => "withdrawn",
            EscrowEventKind::Cancelled => "cancelled",
            EscrowEventKind::SecretRevealed { .. } => "secret_revealed",
            EscrowEventKind::PartialFilled { .. } => "partial_filled",
        }
    }
}

/// Kind of entry in the coordinator's event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SwapCreated,
    EscrowDeployed,
    Withdrawn,
    Cancelled,
    SecretRevealed,
    PartialFill,
    Reconciled,
    Desynchronized,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SwapCreated => "swap_created",
            EventKind::EscrowDeployed => "escrow_deployed",
            EventKind::Withdrawn => "withdrawn",
            EventKind::Cancelled => "cancelled",
            EventKind::SecretRevealed => "secret_revealed",
            EventKind::PartialFill => "partial_fill",
            EventKind::Reconciled => "reconciled",
            EventKind::Desynchronized => "desynchronized",
            EventKind::Failed => "failed",
        }
    }
}

/// Entry in the append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossChainEvent {
    pub id: Uuid,
    pub swap_id: String,
    pub kind: EventKind,
    pub side: Option<Side>,
    pub chain_id: Option<ChainId>,
    pub contract_address: Option<String>,
    pub block_number: Option<u64>,
    pub tx_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl CrossChainEvent {
    pub fn new(swap_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            swap_id: swap_id.into(),
            kind,
            side: None,
            chain_id: None,
            contract_address: None,
            block_number: None,
            tx_hash: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    /// Attach the escrow the event concerns
    pub fn on(mut self, side: Side, chain_id: &ChainId, address: &str) -> Self {
        self.side = Some(side);
        self.chain_id = Some(chain_id.clone());
        if !address.is_empty() {
            self.contract_address = Some(address.to_string());
        }
        self
    }

    /// Attach the chain transaction behind the event
    pub fn at(mut self, block_number: Option<u64>, tx_hash: impl Into<String>) -> Self {
        self.block_number = block_number;
        self.tx_hash = Some(tx_hash.into());
        self
    }

    /// Attach the chain height an observation was read at
    pub fn at_block(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
