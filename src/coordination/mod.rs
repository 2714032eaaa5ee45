//! Swap coordination
//!
//! The coordination layer:
//! 1. Models swaps and their two escrows (`swap`)
//! 2. Computes status transitions and validates secrets and proofs (`machine`)
//! 3. Deploys, settles and cancels escrows across chains (`engine`)
//! 4. Applies monitored chain events back into the registry

pub mod engine;
pub mod machine;
pub mod swap;

pub use engine::{CancelOutcome, Orchestrator, SideCancellation};
pub use swap::{
    EscrowState, EscrowUpdate, MerkleProof, PartialFillInfo, Side, SwapConfig, SwapRecord,
    SwapStatus,
};
