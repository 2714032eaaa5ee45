//! Timelock stages and their projection from elapsed time
//!
//! A stage is never stored as truth. It is recomputed from an escrow's
//! `deployed_at` and the current chain time, so for a given `deployed_at`
//! it can only move forward.
//!
//! The configured schedule fixes the proportions between stages. Each
//! escrow stretches it so that source cancellation opens exactly
//! `timelock_duration` seconds after deployment. Source escrows walk the
//! `Src*` stages; destination escrows walk the `Dst*` stages, measured
//! from their own deployment.

use crate::coordination::swap::Side;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered timelock stages across both escrows of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimelockStage {
    SrcWithdrawal,
    SrcPublicWithdrawal,
    SrcCancellation,
    SrcPublicCancellation,
    DstWithdrawal,
    DstPublicWithdrawal,
    DstCancellation,
}

impl TimelockStage {
    /// All stages in protocol order
    pub const ALL: [TimelockStage; 7] = [
        TimelockStage::SrcWithdrawal,
        TimelockStage::SrcPublicWithdrawal,
        TimelockStage::SrcCancellation,
        TimelockStage::SrcPublicCancellation,
        TimelockStage::DstWithdrawal,
        TimelockStage::DstPublicWithdrawal,
        TimelockStage::DstCancellation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimelockStage::SrcWithdrawal => "src_withdrawal",
            TimelockStage::SrcPublicWithdrawal => "src_public_withdrawal",
            TimelockStage::SrcCancellation => "src_cancellation",
            TimelockStage::SrcPublicCancellation => "src_public_cancellation",
            TimelockStage::DstWithdrawal => "dst_withdrawal",
            TimelockStage::DstPublicWithdrawal => "dst_public_withdrawal",
            TimelockStage::DstCancellation => "dst_cancellation",
        }
    }

    /// Whether cancellation is permitted on the escrow in this stage
    pub fn allows_cancellation(&self) -> bool {
        matches!(
            self,
            TimelockStage::SrcCancellation
                | TimelockStage::SrcPublicCancellation
                | TimelockStage::DstCancellation
        )
    }
}

impl fmt::Display for TimelockStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage start offsets in seconds, relative to escrow deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockSchedule {
    pub src_withdrawal: u64,
    pub src_public_withdrawal: u64,
    pub src_cancellation: u64,
    pub src_public_cancellation: u64,
    pub dst_withdrawal: u64,
    pub dst_public_withdrawal: u64,
    pub dst_cancellation: u64,
}

impl TimelockSchedule {
    /// Offsets in stage order
    pub fn offsets(&self) -> [u64; 7] {
        [
            self.src_withdrawal,
            self.src_public_withdrawal,
            self.src_cancellation,
            self.src_public_cancellation,
            self.dst_withdrawal,
            self.dst_public_withdrawal,
            self.dst_cancellation,
        ]
    }

    /// The first stage must start at deployment, source cancellation must
    /// come after it and offsets must not decrease
    pub fn validate(&self) -> Result<(), String> {
        let offsets = self.offsets();
        if offsets[0] != 0 {
            return Err("src_withdrawal offset must be 0".to_string());
        }
        if self.src_cancellation == 0 {
            return Err("src_cancellation offset must be positive".to_string());
        }
        for (i, pair) in offsets.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(format!(
                    "timelock offset for {} is earlier than {}",
                    TimelockStage::ALL[i + 1],
                    TimelockStage::ALL[i]
                ));
            }
        }
        Ok(())
    }

    /// Stages an escrow on `side` passes through, each with its start
    /// offset from that escrow's deployment
    pub fn escrow_offsets(&self, side: Side, timelock_duration: u64) -> Vec<(u64, TimelockStage)> {
        let offsets = self.offsets();
        let (stages, base) = match side {
            Side::Source => (0..4, 0),
            Side::Destination => (4..7, self.dst_withdrawal),
        };

        stages
            .map(|i| {
                let offset = self.stretch(offsets[i].saturating_sub(base), timelock_duration);
                (offset, TimelockStage::ALL[i])
            })
            .collect()
    }

    /// Seconds after deployment at which the escrow on `side` may be cancelled
    pub fn cancellation_opens(&self, side: Side, timelock_duration: u64) -> u64 {
        self.escrow_offsets(side, timelock_duration)
            .into_iter()
            .find(|(_, stage)| stage.allows_cancellation())
            .map(|(offset, _)| offset)
            .unwrap_or(u64::MAX)
    }

    /// Stage of the escrow on `side` deployed at `deployed_at`, observed at `now`
    pub fn stage_at(&self, side: Side, timelock_duration: u64, deployed_at: u64, now: u64) -> TimelockStage {
        let elapsed = now.saturating_sub(deployed_at);

        self.escrow_offsets(side, timelock_duration)
            .into_iter()
            .filter(|(offset, _)| *offset <= elapsed)
            .map(|(_, stage)| stage)
            .last()
            .unwrap_or_else(|| first_stage(side))
    }

    fn stretch(&self, offset: u64, timelock_duration: u64) -> u64 {
        if self.src_cancellation == 0 {
            return offset;
        }
        let scaled = offset as u128 * timelock_duration as u128 / self.src_cancellation as u128;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

/// Stage an escrow on `side` starts in
pub fn first_stage(side: Side) -> TimelockStage {
    match side {
        Side::Source => TimelockStage::SrcWithdrawal,
        Side::Destination => TimelockStage::DstWithdrawal,
    }
}

impl Default for TimelockSchedule {
    fn default() -> Self {
        Self {
            src_withdrawal: 0,
            src_public_withdrawal: 600,
            src_cancellation: 1_800,
            src_public_cancellation: 2_400,
            dst_withdrawal: 3_000,
            dst_public_withdrawal: 3_600,
            dst_cancellation: 4_800,
        }
    }
}
