//! Error types for the swap coordinator

use crate::chain::ChainId;
use crate::coordination::swap::{Side, SwapStatus};
use thiserror::Error;

/// Failures reported by a `ChainClient` implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Network unavailable on chain {chain_id}: {message}")]
    NetworkUnavailable { chain_id: ChainId, message: String },

    #[error("Insufficient funds on chain {chain_id}: {message}")]
    InsufficientFunds { chain_id: ChainId, message: String },

    #[error("Insufficient gas on chain {chain_id}")]
    InsufficientGas { chain_id: ChainId },

    #[error("Transaction reverted on chain {chain_id}: {reason}")]
    TransactionReverted { chain_id: ChainId, reason: String },

    #[error("No escrow deployed at {address} on chain {chain_id}")]
    NotFound { chain_id: ChainId, address: String },

    #[error("Chain {chain_id} rejected the secret")]
    InvalidSecret { chain_id: ChainId },

    #[error("Deployed address {actual} does not match predicted address {predicted}")]
    AddressMismatch { predicted: String, actual: String },
}

impl ChainError {
    /// Check if error is retryable with the same inputs
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::NetworkUnavailable { .. })
    }

    /// Label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::NetworkUnavailable { .. } => "network_unavailable",
            ChainError::InsufficientFunds { .. } => "insufficient_funds",
            ChainError::InsufficientGas { .. } => "insufficient_gas",
            ChainError::TransactionReverted { .. } => "transaction_reverted",
            ChainError::NotFound { .. } => "not_found",
            ChainError::InvalidSecret { .. } => "invalid_secret",
            ChainError::AddressMismatch { .. } => "address_mismatch",
        }
    }
}

/// Main error type for coordinator operations
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Invalid swap configuration: {0}")]
    InvalidConfig(String),

    #[error("Swap {swap_id} not found")]
    SwapNotFound { swap_id: String },

    #[error("{side} escrow of swap {swap_id} is not deployed")]
    EscrowNotFound { swap_id: String, side: Side },

    #[error("Secret does not match the hashlock of swap {swap_id}")]
    SecretMismatch { swap_id: String },

    #[error("Invalid Merkle proof: {0}")]
    InvalidProof(String),

    #[error("Out-of-order partial fill: expected index {expected}, got {got}")]
    OutOfOrderFill { expected: u32, got: u32 },

    #[error("Partial fill index {index} already used")]
    DuplicateFill { index: u32 },

    #[error("Swap {swap_id} does not accept partial fills")]
    PartialFillsDisabled { swap_id: String },

    #[error("Deployment of the {side} escrow failed: {cause}")]
    DeploymentFailed {
        side: Side,
        #[source]
        cause: ChainError,
    },

    #[error("{side} chain call failed: {source}")]
    Chain {
        side: Side,
        #[source]
        source: ChainError,
    },

    #[error("Swap {swap_id} is already {status}")]
    AlreadyTerminal { swap_id: String, status: SwapStatus },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Journal error: {0}")]
    Journal(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SwapError::Chain { source, .. } => source.is_retryable(),
            SwapError::DeploymentFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Check if the error was raised before any chain call was issued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SwapError::InvalidConfig(_)
                | SwapError::SecretMismatch { .. }
                | SwapError::InvalidProof(_)
                | SwapError::OutOfOrderFill { .. }
                | SwapError::DuplicateFill { .. }
                | SwapError::PartialFillsDisabled { .. }
        )
    }
}

/// Result type for coordinator operations
pub type SwapResult<T> = Result<T, SwapError>;

/// Result type for chain client operations
pub type ChainResult<T> = Result<T, ChainError>;
