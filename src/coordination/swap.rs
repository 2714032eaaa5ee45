//! Swap data model: configuration, per-chain escrow state and the swap record

use crate::chain::timelock::TimelockStage;
use crate::chain::{ChainId, EscrowParams, PartialFillParams};
use crate::crypto::{self, Hash};
use crate::error::{SwapError, SwapResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which leg of the swap an escrow belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Maker's funds, locked first
    Source,
    /// Taker's funds, locked under the same hashlock
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }

    pub fn other(&self) -> Side {
        match self {
            Side::Source => Side::Destination,
            Side::Destination => Side::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Swap lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStatus {
    Pending,
    Deployed,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "pending",
            SwapStatus::Deployed => "deployed",
            SwapStatus::Active => "active",
            SwapStatus::Completed => "completed",
            SwapStatus::Cancelled => "cancelled",
            SwapStatus::Failed => "failed",
        }
    }

    /// Terminal statuses are retained for audit but never left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Cancelled | SwapStatus::Failed
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied swap parameters, immutable once accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapConfig {
    pub src_chain: ChainId,
    pub dst_chain: ChainId,
    pub src_token: String,
    pub dst_token: String,
    /// Minor units
    pub src_amount: i128,
    pub dst_amount: i128,
    pub maker: String,
    pub taker: String,
    /// Pre-image chosen by the initiator
    pub secret: String,
    pub safety_deposit: i128,
    pub timelock_duration: u64,
    #[serde(default)]
    pub enable_partial_fills: bool,
    #[serde(default)]
    pub total_parts: Option<u32>,
    /// Root over the per-part secret hashes, required with partial fills
    #[serde(default)]
    pub merkle_root: Option<String>,
}

impl SwapConfig {
    /// Reject configurations no escrow could be deployed for
    pub fn validate(&self) -> SwapResult<()> {
        if self.src_chain == self.dst_chain {
            return Err(invalid(format!(
                "source and destination chain are both {}",
                self.src_chain
            )));
        }
        if self.src_amount <= 0 {
            return Err(invalid(format!("srcAmount must be positive, got {}", self.src_amount)));
        }
        if self.dst_amount <= 0 {
            return Err(invalid(format!("dstAmount must be positive, got {}", self.dst_amount)));
        }
        if self.safety_deposit < 0 {
            return Err(invalid("safetyDeposit must not be negative"));
        }
        if self.timelock_duration == 0 {
            return Err(invalid("timelockDuration must be positive"));
        }
        if self.src_token.trim().is_empty() || self.dst_token.trim().is_empty() {
            return Err(invalid("token identifiers must not be empty"));
        }
        if self.secret.is_empty() {
            return Err(invalid("secret must not be empty"));
        }
        for (role, address) in [("maker", &self.maker), ("taker", &self.taker)] {
            if !is_valid_address(address) {
                return Err(invalid(format!("malformed {} address {:?}", role, address)));
            }
        }

        if let Some(parts) = self.total_parts {
            if parts < 2 {
                return Err(invalid(format!("totalParts must be at least 2, got {}", parts)));
            }
        }
        if self.enable_partial_fills {
            if self.total_parts.is_none() {
                return Err(invalid("partial fills require totalParts"));
            }
            match self.merkle_root.as_deref() {
                Some(root) if crypto::parse_hash(root).is_some() => {}
                Some(root) => return Err(invalid(format!("malformed merkleRoot {:?}", root))),
                None => return Err(invalid("partial fills require merkleRoot")),
            }
        }

        Ok(())
    }

    /// Canonical hashlock of this swap's secret
    pub fn hashlock(&self) -> Hash {
        crypto::hashlock(&self.secret)
    }

    /// Typed escrow parameters for one side. Roles are reversed on the
    /// destination, where the taker locks funds for the maker.
    pub fn escrow_params(&self, side: Side) -> EscrowParams {
        let hashlock = self.hashlock();
        let safety_deposit = self.safety_deposit.max(0) as u128;

        match side {
            Side::Source => EscrowParams {
                chain_id: self.src_chain.clone(),
                side,
                hashlock,
                token: self.src_token.clone(),
                amount: self.src_amount.max(0) as u128,
                maker: self.maker.clone(),
                taker: self.taker.clone(),
                safety_deposit,
                timelock_duration: self.timelock_duration,
                partial_fills: None,
            },
            Side::Destination => EscrowParams {
                chain_id: self.dst_chain.clone(),
                side,
                hashlock,
                token: self.dst_token.clone(),
                amount: self.dst_amount.max(0) as u128,
                maker: self.taker.clone(),
                taker: self.maker.clone(),
                safety_deposit,
                timelock_duration: self.timelock_duration,
                partial_fills: self.partial_fill_params(),
            },
        }
    }

    fn partial_fill_params(&self) -> Option<PartialFillParams> {
        if !self.enable_partial_fills {
            return None;
        }
        let total_parts = self.total_parts?;
        let merkle_root = self.merkle_root.as_deref().and_then(crypto::parse_hash)?;
        Some(PartialFillParams {
            merkle_root,
            total_parts,
        })
    }
}

fn invalid(message: impl Into<String>) -> SwapError {
    SwapError::InvalidConfig(message.into())
}

/// Opaque account identifiers are accepted as long as they are printable
/// and bounded; `0x` identifiers must be 20-byte hex addresses.
pub fn is_valid_address(address: &str) -> bool {
    if address.is_empty() || address.len() > 128 {
        return false;
    }
    if !address.chars().all(|c| c.is_ascii_graphic()) {
        return false;
    }
    match address.strip_prefix("0x") {
        Some(hex_part) => hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit()),
        None => true,
    }
}

/// Partial-fill bookkeeping on the destination escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFillInfo {
    #[serde(with = "crate::crypto::serde_hex")]
    pub merkle_root: Hash,
    pub total_parts: u32,
    /// Strictly growing; an index is never reused
    pub used_indices: Vec<u32>,
    pub filled_amount: u128,
    pub last_validated: Option<DateTime<Utc>>,
}

impl PartialFillInfo {
    pub fn new(params: &PartialFillParams) -> Self {
        Self {
            merkle_root: params.merkle_root,
            total_parts: params.total_parts,
            used_indices: Vec::new(),
            filled_amount: 0,
            last_validated: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_indices.len() as u32 >= self.total_parts
    }

    /// Amount released after `used` parts; the last part absorbs rounding
    pub fn amount_after(&self, total_amount: u128, used: u32) -> u128 {
        if used >= self.total_parts {
            total_amount
        } else {
            total_amount / self.total_parts as u128 * used as u128
        }
    }
}

/// Proof supplied with a partial withdrawal; never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub index: u32,
    /// Leaf hash for this index, hex
    pub secret_hash: String,
    /// Sibling hashes from leaf to root, hex
    pub proof: Vec<String>,
}

/// One chain side of a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowState {
    pub chain_id: ChainId,
    /// Empty until deployed
    pub contract_address: String,
    #[serde(with = "crate::crypto::serde_hex")]
    pub hashlock: Hash,
    pub amount: u128,
    pub token: String,
    pub maker: String,
    pub taker: String,
    pub safety_deposit: u128,
    pub timelock_duration: u64,
    /// Chain-native timestamp, 0 until deployed
    pub deployed_at: u64,
    pub withdrawn: bool,
    pub cancelled: bool,
    pub revealed_secret: Option<String>,
    pub partial_fill: Option<PartialFillInfo>,
}

impl EscrowState {
    pub fn from_params(params: &EscrowParams) -> Self {
        Self {
            chain_id: params.chain_id.clone(),
            contract_address: String::new(),
            hashlock: params.hashlock,
            amount: params.amount,
            token: params.token.clone(),
            maker: params.maker.clone(),
            taker: params.taker.clone(),
            safety_deposit: params.safety_deposit,
            timelock_duration: params.timelock_duration,
            deployed_at: 0,
            withdrawn: false,
            cancelled: false,
            revealed_secret: None,
            partial_fill: params.partial_fills.as_ref().map(PartialFillInfo::new),
        }
    }

    pub fn is_deployed(&self) -> bool {
        !self.contract_address.is_empty()
    }

    pub fn is_settled(&self) -> bool {
        self.withdrawn || self.cancelled
    }
}

/// Field-wise merge applied to one escrow side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowUpdate {
    pub contract_address: Option<String>,
    pub deployed_at: Option<u64>,
    pub withdrawn: Option<bool>,
    pub cancelled: Option<bool>,
}

impl EscrowUpdate {
    pub fn deployed(address: impl Into<String>, deployed_at: u64) -> Self {
        Self {
            contract_address: Some(address.into()),
            deployed_at: Some(deployed_at),
            ..Default::default()
        }
    }

    pub fn withdrawn() -> Self {
        Self {
            withdrawn: Some(true),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: Some(true),
            ..Default::default()
        }
    }
}

/// Authoritative record of one swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRecord {
    pub id: String,
    pub src_escrow: EscrowState,
    pub dst_escrow: EscrowState,
    pub status: SwapStatus,
    /// Projection refreshed on read, never authoritative
    pub stage: TimelockStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapRecord {
    /// Fresh record in `pending` with the same hashlock on both sides
    pub fn new(id: String, config: &SwapConfig, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            src_escrow: EscrowState::from_params(&config.escrow_params(Side::Source)),
            dst_escrow: EscrowState::from_params(&config.escrow_params(Side::Destination)),
            status: SwapStatus::Pending,
            stage: TimelockStage::SrcWithdrawal,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn escrow(&self, side: Side) -> &EscrowState {
        match side {
            Side::Source => &self.src_escrow,
            Side::Destination => &self.dst_escrow,
        }
    }

    pub fn escrow_mut(&mut self, side: Side) -> &mut EscrowState {
        match side {
            Side::Source => &mut self.src_escrow,
            Side::Destination => &mut self.dst_escrow,
        }
    }

    pub fn hashlock(&self) -> Hash {
        self.src_escrow.hashlock
    }

    /// Side whose escrow lives at `address`, if any
    pub fn side_of(&self, address: &str) -> Option<Side> {
        if address.is_empty() {
            return None;
        }
        if self.src_escrow.contract_address == address {
            Some(Side::Source)
        } else if self.dst_escrow.contract_address == address {
            Some(Side::Destination)
        } else {
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_valid_config() {
        assert!(config("s1").validate().is_ok());
    }

    #[test]
    fn test_same_chain_rejected() {
        let mut cfg = config("s1");
        cfg.dst_chain = cfg.src_chain.clone();
        assert!(matches!(cfg.validate(), Err(SwapError::InvalidConfig(_))));
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        for amount in [0, -5] {
            let mut cfg = config("s1");
            cfg.src_amount = amount;
            assert!(matches!(cfg.validate(), Err(SwapError::InvalidConfig(_))));

            let mut cfg = config("s1");
            cfg.dst_amount = amount;
            assert!(matches!(cfg.validate(), Err(SwapError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        for bad in ["", "has space.near", "0x1234", "0xZZ11111111111111111111111111111111111111"] {
            let mut cfg = config("s1");
            cfg.maker = bad.to_string();
            assert!(cfg.validate().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_partial_fill_requirements() {
        let mut cfg = config("s1");
        cfg.enable_partial_fills = true;
        cfg.total_parts = Some(4);
        assert!(cfg.validate().is_err(), "missing merkle root accepted");

        let cfg = partial_config("s1", &[7u8; 32], 1);
        assert!(cfg.validate().is_err(), "single part accepted");

        let cfg = partial_config("s1", &[7u8; 32], 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_record_shares_hashlock_and_reverses_roles() {
        let cfg = config("s1");
        let record = SwapRecord::new("id".into(), &cfg, Utc::now());

        assert_eq!(record.status, SwapStatus::Pending);
        assert_eq!(record.src_escrow.hashlock, record.dst_escrow.hashlock);
        assert_eq!(record.src_escrow.hashlock, crypto::hashlock("s1"));
        assert_eq!(record.dst_escrow.maker, cfg.taker);
        assert_eq!(record.dst_escrow.taker, cfg.maker);
        assert!(record.src_escrow.partial_fill.is_none());
    }

    #[test]
    fn test_partial_fill_only_on_destination() {
        let cfg = partial_config("s1", &[9u8; 32], 4);
        let record = SwapRecord::new("id".into(), &cfg, Utc::now());

        assert!(record.src_escrow.partial_fill.is_none());
        let info = record.dst_escrow.partial_fill.as_ref().unwrap();
        assert_eq!(info.total_parts, 4);
        assert_eq!(info.amount_after(100, 1), 25);
        assert_eq!(info.amount_after(103, 4), 103);
    }
}
