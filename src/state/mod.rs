//! Swap state with optional journal persistence
//!
//! Handles:
//! - Swap records behind per-swap locks
//! - Pending secrets and the audit event log
//! - Per-chain sync watermarks
//! - JSON-lines journaling and restart recovery

mod journal;
mod registry;

pub use journal::{EventJournal, JournalEntry};
pub use registry::{BridgeState, SwapGuard, SwapRegistry};
