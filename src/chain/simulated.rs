//! In-memory chain
//!
//! A single-process ledger implementing `ChainClient` with hashlock and
//! timelock enforcement. Used by the binary's simulated chains and by tests,
//! which can advance its clock, act as an outside party and inject faults.

use super::{
    ChainClient, ChainId, Deployment, EscrowParams, EscrowSnapshot, EventStream, TimelockSchedule,
    TimelockStage, TxRef, TxStatus,
};
use crate::coordination::swap::MerkleProof;
use crate::crypto;
use crate::error::{ChainError, ChainResult};
use crate::events::{ChainEvent, EscrowEventKind};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
struct SimEscrow {
    params: EscrowParams,
    deployed_at: u64,
    withdrawn: bool,
    cancelled: bool,
    revealed_secret: Option<String>,
    used_indices: Vec<u32>,
}

impl SimEscrow {
    fn stage(&self, schedule: &TimelockSchedule, now: u64) -> TimelockStage {
        schedule.stage_at(self.params.side, self.params.timelock_duration, self.deployed_at, now)
    }
}

#[derive(Default)]
struct Ledger {
    /// Seconds the clock has been advanced past wall time
    clock_offset: u64,
    block: u64,
    escrows: HashMap<String, SimEscrow>,
    subscribers: Vec<(String, mpsc::UnboundedSender<ChainEvent>)>,
    faults: HashMap<&'static str, VecDeque<ChainError>>,
    pending_next: bool,
    redirect_next_deploy: Option<String>,
    duplicate_events: bool,
    latency: Option<Duration>,
    healthy: bool,
}

impl Ledger {
    fn now(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp().max(0) as u64;
        wall + self.clock_offset
    }
}

/// In-memory `ChainClient`
pub struct SimulatedChain {
    chain_id: ChainId,
    schedule: TimelockSchedule,
    ledger: Mutex<Ledger>,
}

impl SimulatedChain {
    pub fn new(chain_id: ChainId, schedule: TimelockSchedule) -> Self {
        Self {
            chain_id,
            schedule,
            ledger: Mutex::new(Ledger {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    /// Current chain time, unix seconds
    pub fn now(&self) -> u64 {
        self.ledger().now()
    }

    pub fn block_number(&self) -> u64 {
        self.ledger().block
    }

    /// Move the chain clock forward
    pub fn advance_time(&self, seconds: u64) {
        let mut ledger = self.ledger();
        ledger.clock_offset += seconds;
        ledger.block += 1;
    }

    /// Fail the next call of `operation` with `error`
    pub fn fail_next(&self, operation: &'static str, error: ChainError) {
        self.ledger()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Report the next withdraw or cancel as broadcast but unconfirmed
    pub fn respond_pending_next(&self) {
        self.ledger().pending_next = true;
    }

    /// Deploy the next escrow somewhere other than its predicted address
    pub fn redirect_next_deploy(&self, address: impl Into<String>) {
        self.ledger().redirect_next_deploy = Some(address.into());
    }

    /// Deliver every event twice
    pub fn set_duplicate_events(&self, duplicate: bool) {
        self.ledger().duplicate_events = duplicate;
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.ledger().latency = latency;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.ledger().healthy = healthy;
    }

    /// A counterparty withdraws directly on this chain
    pub fn external_withdraw(&self, address: &str, secret: &str) -> ChainResult<TxRef> {
        self.do_withdraw(address, secret)
    }

    /// A counterparty cancels directly on this chain
    pub fn external_cancel(&self, address: &str) -> ChainResult<TxRef> {
        self.do_cancel(address)
    }

    /// Publish a secret without settling, as a relayer broadcast would
    pub fn external_reveal(&self, address: &str, secret: &str) -> ChainResult<()> {
        let mut ledger = self.ledger();
        let block = ledger.block + 1;
        let chain_id = self.chain_id.clone();
        let escrow = ledger
            .escrows
            .get_mut(address)
            .ok_or_else(|| ChainError::NotFound {
                chain_id: chain_id.clone(),
                address: address.to_string(),
            })?;
        escrow.revealed_secret = Some(secret.to_string());
        ledger.block = block;

        let event = ChainEvent {
            chain_id,
            address: address.to_string(),
            kind: EscrowEventKind::SecretRevealed {
                secret: secret.to_string(),
            },
            block_number: block,
            tx_hash: tx_hash(block),
        };
        Self::emit(&mut ledger, event);
        Ok(())
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // a panic while holding the lock leaves the ledger consistent
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, operation: &'static str) -> ChainResult<()> {
        let latency = self.ledger().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut ledger = self.ledger();
        match ledger.faults.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(error) => {
                debug!("Simulated {} fault on {}: {}", operation, self.chain_id, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn revert(&self, reason: impl Into<String>) -> ChainError {
        ChainError::TransactionReverted {
            chain_id: self.chain_id.clone(),
            reason: reason.into(),
        }
    }

    fn not_found(&self, address: &str) -> ChainError {
        ChainError::NotFound {
            chain_id: self.chain_id.clone(),
            address: address.to_string(),
        }
    }

    fn emit(ledger: &mut Ledger, event: ChainEvent) {
        let copies = if ledger.duplicate_events { 2 } else { 1 };
        ledger.subscribers.retain(|(address, tx)| {
            if address != &event.address {
                return !tx.is_closed();
            }
            (0..copies).all(|_| tx.send(event.clone()).is_ok())
        });
    }

    fn receipt(&self, ledger: &mut Ledger) -> (TxRef, u64) {
        ledger.block += 1;
        let status = if std::mem::take(&mut ledger.pending_next) {
            TxStatus::Pending
        } else {
            TxStatus::Confirmed
        };
        let tx = TxRef {
            chain_id: self.chain_id.clone(),
            hash: tx_hash(ledger.block),
            status,
        };
        (tx, ledger.block)
    }

    fn do_withdraw(&self, address: &str, secret: &str) -> ChainResult<TxRef> {
        let mut ledger = self.ledger();
        let escrow = ledger.escrows.get(address).ok_or_else(|| self.not_found(address))?;

        if crypto::hashlock(secret) != escrow.params.hashlock {
            return Err(ChainError::InvalidSecret {
                chain_id: self.chain_id.clone(),
            });
        }
        if escrow.withdrawn {
            return Err(self.revert("escrow already withdrawn"));
        }
        if escrow.cancelled {
            return Err(self.revert("escrow already cancelled"));
        }

        let (tx, block) = self.receipt(&mut ledger);
        if let Some(escrow) = ledger.escrows.get_mut(address) {
            escrow.withdrawn = true;
            escrow.revealed_secret = Some(secret.to_string());
        }

        let event = ChainEvent {
            chain_id: self.chain_id.clone(),
            address: address.to_string(),
            kind: EscrowEventKind::Withdrawn {
                secret: Some(secret.to_string()),
            },
            block_number: block,
            tx_hash: tx.hash.clone(),
        };
        Self::emit(&mut ledger, event);
        Ok(tx)
    }

    fn do_cancel(&self, address: &str) -> ChainResult<TxRef> {
        let mut ledger = self.ledger();
        let escrow = ledger.escrows.get(address).ok_or_else(|| self.not_found(address))?;

        if escrow.cancelled {
            return Err(self.revert("escrow already cancelled"));
        }
        if escrow.withdrawn {
            return Err(self.revert("escrow already withdrawn"));
        }
        let stage = escrow.stage(&self.schedule, ledger.now());
        if !stage.allows_cancellation() {
            return Err(self.revert(format!("cancellation not allowed during {}", stage)));
        }

        let (tx, block) = self.receipt(&mut ledger);
        if let Some(escrow) = ledger.escrows.get_mut(address) {
            escrow.cancelled = true;
        }

        let event = ChainEvent {
            chain_id: self.chain_id.clone(),
            address: address.to_string(),
            kind: EscrowEventKind::Cancelled,
            block_number: block,
            tx_hash: tx.hash.clone(),
        };
        Self::emit(&mut ledger, event);
        Ok(tx)
    }
}

fn tx_hash(block: u64) -> String {
    format!("0x{:064x}", block)
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> ChainId {
        self.chain_id.clone()
    }

    fn predict_address(&self, params: &EscrowParams) -> String {
        let mut material = self.chain_id.as_str().as_bytes().to_vec();
        material.extend_from_slice(&params.hashlock);
        material.extend_from_slice(params.maker.as_bytes());
        material.extend_from_slice(params.taker.as_bytes());
        material.extend_from_slice(params.token.as_bytes());
        material.extend_from_slice(&params.amount.to_be_bytes());
        let digest = crypto::keccak256(&material);
        format!("0x{}", hex::encode(&digest[12..]))
    }

    async fn deploy(&self, params: &EscrowParams) -> ChainResult<Deployment> {
        self.enter("deploy").await?;

        if params.chain_id != self.chain_id {
            return Err(self.revert(format!("escrow parameters target chain {}", params.chain_id)));
        }
        if params.amount == 0 {
            return Err(ChainError::InsufficientFunds {
                chain_id: self.chain_id.clone(),
                message: "zero amount".to_string(),
            });
        }

        let predicted = self.predict_address(params);
        let mut ledger = self.ledger();
        let address = ledger.redirect_next_deploy.take().unwrap_or(predicted);
        if ledger.escrows.contains_key(&address) {
            return Err(self.revert(format!("escrow already exists at {}", address)));
        }

        let (tx, _) = self.receipt(&mut ledger);
        let deployed_at = ledger.now();
        ledger.escrows.insert(
            address.clone(),
            SimEscrow {
                params: params.clone(),
                deployed_at,
                withdrawn: false,
                cancelled: false,
                revealed_secret: None,
                used_indices: Vec::new(),
            },
        );
        debug!("Simulated escrow deployed on {} at {}", self.chain_id, address);

        Ok(Deployment {
            address,
            deployed_at,
            tx_hash: tx.hash,
        })
    }

    async fn withdraw(&self, address: &str, secret: &str) -> ChainResult<TxRef> {
        self.enter("withdraw").await?;
        self.do_withdraw(address, secret)
    }

    async fn withdraw_partial(
        &self,
        address: &str,
        secret: &str,
        proof: &MerkleProof,
    ) -> ChainResult<TxRef> {
        self.enter("withdraw_partial").await?;

        let mut ledger = self.ledger();
        let escrow = ledger.escrows.get(address).ok_or_else(|| self.not_found(address))?;
        let partial = escrow
            .params
            .partial_fills
            .clone()
            .ok_or_else(|| self.revert("escrow is not partially fillable"))?;

        let leaf = crypto::hashlock(secret);
        let siblings = proof
            .proof
            .iter()
            .map(|s| crypto::parse_hash(s))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| self.revert("malformed proof"))?;
        if crypto::root_from_proof(&leaf, proof.index, &siblings) != partial.merkle_root {
            return Err(ChainError::InvalidSecret {
                chain_id: self.chain_id.clone(),
            });
        }
        if escrow.withdrawn || escrow.cancelled {
            return Err(self.revert("escrow already settled"));
        }
        if escrow.used_indices.contains(&proof.index) {
            return Err(self.revert(format!("part {} already filled", proof.index)));
        }
        if proof.index as usize != escrow.used_indices.len() {
            return Err(self.revert(format!("part {} filled out of order", proof.index)));
        }

        let (tx, block) = self.receipt(&mut ledger);
        let mut exhausted = false;
        if let Some(escrow) = ledger.escrows.get_mut(address) {
            escrow.used_indices.push(proof.index);
            exhausted = escrow.used_indices.len() as u32 >= partial.total_parts;
            escrow.withdrawn = exhausted;
        }

        let mut events = vec![EscrowEventKind::PartialFilled { index: proof.index }];
        if exhausted {
            events.push(EscrowEventKind::Withdrawn { secret: None });
        }
        for kind in events {
            let event = ChainEvent {
                chain_id: self.chain_id.clone(),
                address: address.to_string(),
                kind,
                block_number: block,
                tx_hash: tx.hash.clone(),
            };
            Self::emit(&mut ledger, event);
        }
        Ok(tx)
    }

    async fn cancel(&self, address: &str) -> ChainResult<TxRef> {
        self.enter("cancel").await?;
        self.do_cancel(address)
    }

    async fn get_state(&self, address: &str) -> ChainResult<EscrowSnapshot> {
        self.enter("get_state").await?;

        let ledger = self.ledger();
        let escrow = ledger.escrows.get(address).ok_or_else(|| self.not_found(address))?;
        Ok(EscrowSnapshot {
            address: address.to_string(),
            deployed_at: escrow.deployed_at,
            withdrawn: escrow.withdrawn,
            cancelled: escrow.cancelled,
            revealed_secret: escrow.revealed_secret.clone(),
            used_indices: escrow.used_indices.clone(),
            block_number: ledger.block,
        })
    }

    async fn current_stage(&self, address: &str) -> ChainResult<TimelockStage> {
        self.enter("current_stage").await?;

        let ledger = self.ledger();
        let escrow = ledger.escrows.get(address).ok_or_else(|| self.not_found(address))?;
        Ok(escrow.stage(&self.schedule, ledger.now()))
    }

    async fn subscribe(&self, address: &str) -> ChainResult<EventStream> {
        self.enter("subscribe").await?;

        let mut ledger = self.ledger();
        if !ledger.escrows.contains_key(address) {
            return Err(self.not_found(address));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        ledger.subscribers.push((address.to_string(), tx));
        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        self.ledger().healthy
    }
}
