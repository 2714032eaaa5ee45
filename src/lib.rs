//! Atomic swap coordinator
//!
//! Coordinates hashlock/timelock escrows on two chains so that either both
//! legs of a swap settle or both are refunded. The `Orchestrator` is the
//! command/query surface; chains are reached through the `ChainClient`
//! capability trait.

pub mod chain;
pub mod config;
pub mod coordination;
pub mod crypto;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;

pub use chain::{ChainClient, ChainId, ChainManager, SimulatedChain, TimelockSchedule, TimelockStage};
pub use config::Settings;
pub use coordination::{CancelOutcome, MerkleProof, Orchestrator, Side, SideCancellation, SwapConfig, SwapRecord, SwapStatus};
pub use error::{ChainError, SwapError, SwapResult};
pub use state::SwapRegistry;
