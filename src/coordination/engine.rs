//! Main coordination engine for cross-chain atomic swaps

use super::machine;
use super::swap::{EscrowUpdate, MerkleProof, Side, SwapConfig, SwapRecord, SwapStatus};
use crate::chain::{
    with_timeout, ChainClient, ChainId, ChainManager, EscrowMonitor, EscrowParams, EscrowSnapshot,
    MonitorPayload, MonitorUpdate, TimelockSchedule, TxRef,
};
use crate::config::CoordinatorConfig;
use crate::crypto;
use crate::error::{ChainError, SwapError, SwapResult};
use crate::events::{ChainEvent, CrossChainEvent, EscrowEventKind, EventKind};
use crate::state::{SwapGuard, SwapRegistry};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Result of cancelling one side of a swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideCancellation {
    /// Cancellation submitted by this call
    Cancelled(TxRef),
    AlreadyCancelled,
    /// Funds were released to the counterparty; nothing to cancel
    AlreadyWithdrawn,
    NotDeployed,
    Failed(ChainError),
}

impl SideCancellation {
    /// The side holds no refundable funds any more
    pub fn is_settled(&self) -> bool {
        !matches!(self, SideCancellation::Failed(_))
    }

    pub fn tx(&self) -> Option<&TxRef> {
        match self {
            SideCancellation::Cancelled(tx) => Some(tx),
            _ => None,
        }
    }
}

/// Per-side outcome of `cancel_swap`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub src: SideCancellation,
    pub dst: SideCancellation,
}

impl CancelOutcome {
    pub fn side(&self, side: Side) -> &SideCancellation {
        match side {
            Side::Source => &self.src,
            Side::Destination => &self.dst,
        }
    }
}

/// Shutdown flag and tasks of one swap's monitors
struct SwapMonitors {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Cross-chain swap orchestrator
pub struct Orchestrator {
    /// Coordinator configuration
    config: CoordinatorConfig,
    /// Stage offsets used for local projection
    schedule: TimelockSchedule,
    /// Authoritative swap state
    registry: Arc<SwapRegistry>,
    /// Chain manager for multi-chain access
    chains: Arc<ChainManager>,
    /// Monitor output, consumed by `run`
    updates_tx: mpsc::UnboundedSender<MonitorUpdate>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<MonitorUpdate>>>,
    /// Running monitors by swap id
    monitors: DashMap<String, SwapMonitors>,
    /// Shutdown flag
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create a new orchestrator over an explicit registry and chain set
    pub fn new(
        config: CoordinatorConfig,
        schedule: TimelockSchedule,
        registry: Arc<SwapRegistry>,
        chains: Arc<ChainManager>,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            schedule,
            registry,
            chains,
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            monitors: DashMap::new(),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SwapRegistry> {
        &self.registry
    }

    /// Start the event applier on the runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<SwapResult<()>> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.run().await })
    }

    /// Event application loop: the single path through which chain
    /// observations mutate swap records
    pub async fn run(&self) -> SwapResult<()> {
        let mut updates = self
            .updates_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SwapError::Internal("orchestrator is already running".into()))?;
        let mut shutdown = self.shutdown.subscribe();

        let mut health_interval =
            interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Orchestrator {} started", self.config.instance_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}

                Some(update) = updates.recv() => {
                    let swap_id = update.swap_id.clone();
                    if let Err(e) = self.apply_update(update).await {
                        error!("Error applying update for swap {}: {}", swap_id, e);
                    }
                }

                _ = health_interval.tick() => {
                    for (chain_id, healthy) in self.chains.health_check().await {
                        if !healthy {
                            warn!("Chain {} failed health check", chain_id);
                        }
                    }
                }
            }
        }

        info!("Orchestrator {} stopped", self.config.instance_id);
        Ok(())
    }

    /// Stop the applier and every monitor
    pub fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.send_replace(true);

        let swap_ids: Vec<_> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for swap_id in swap_ids {
            self.stop_monitors(&swap_id);
        }
    }

    /// Register a swap, deploy both escrows concurrently and start monitoring
    pub async fn initiate_swap(&self, config: SwapConfig) -> SwapResult<String> {
        config.validate()?;
        let src_client = self.client(&config.src_chain)?;
        let dst_client = self.client(&config.dst_chain)?;

        let swap_id = self.registry.create(&config).await?;
        info!(
            "Initiating swap {}: {} {} -> {} {}",
            swap_id, config.src_amount, config.src_chain, config.dst_amount, config.dst_chain
        );

        let src_params = config.escrow_params(Side::Source);
        let dst_params = config.escrow_params(Side::Destination);
        let (src, dst) = futures::join!(
            self.deploy_side(&swap_id, Side::Source, &src_client, &src_params),
            self.deploy_side(&swap_id, Side::Destination, &dst_client, &dst_params),
        );

        match (src, dst) {
            (Ok(()), Ok(())) => {
                info!("Swap {} active on both chains", swap_id);
                Ok(swap_id)
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Swap {} left for inspection: {}", swap_id, e);
                Err(e)
            }
        }
    }

    async fn deploy_side(
        &self,
        swap_id: &str,
        side: Side,
        client: &Arc<dyn ChainClient>,
        params: &EscrowParams,
    ) -> SwapResult<()> {
        let chain_id = client.chain_id();
        let predicted = client.predict_address(params);
        debug!("Deploying {} escrow of swap {} at {}", side, swap_id, predicted);

        let deployment = with_timeout(
            &chain_id,
            "deploy",
            self.config.call_timeout(),
            client.deploy(params),
        )
        .await
        .map_err(|cause| {
            warn!("Deploying {} escrow of swap {} failed: {}", side, swap_id, cause);
            SwapError::DeploymentFailed { side, cause }
        })?;

        let event = CrossChainEvent::new(swap_id, EventKind::EscrowDeployed)
            .on(side, &chain_id, &deployment.address)
            .at(None, deployment.tx_hash.clone())
            .with_data(serde_json::json!({
                "predictedAddress": predicted,
                "deployedAt": deployment.deployed_at,
            }));
        let update = EscrowUpdate::deployed(deployment.address.clone(), deployment.deployed_at);
        self.registry
            .update(swap_id, event, |r| machine::apply_escrow_update(r, side, &update))
            .await?;

        // funds are locked wherever the escrow landed, so it is watched either way
        self.start_monitor(swap_id, side, &deployment.address, client.clone());

        if deployment.address != predicted {
            error!(
                "{} escrow of swap {} deployed at {} instead of {}",
                side, swap_id, deployment.address, predicted
            );
            return Err(SwapError::DeploymentFailed {
                side,
                cause: ChainError::AddressMismatch {
                    predicted,
                    actual: deployment.address,
                },
            });
        }

        info!("{} escrow of swap {} deployed at {}", side, swap_id, deployment.address);
        Ok(())
    }

    /// Withdraw the destination escrow with the swap secret
    pub async fn complete_withdrawal(&self, swap_id: &str, secret: &str) -> SwapResult<TxRef> {
        let record = self.registry.get(swap_id).await?;
        ensure_open(&record)?;

        let side = Side::Destination;
        let escrow = record.escrow(side);
        if !escrow.is_deployed() {
            return Err(SwapError::EscrowNotFound {
                swap_id: swap_id.to_string(),
                side,
            });
        }
        if crypto::hashlock(secret) != record.hashlock() {
            return Err(SwapError::SecretMismatch {
                swap_id: swap_id.to_string(),
            });
        }

        let client = self.client(&escrow.chain_id)?;
        let tx = with_timeout(
            &escrow.chain_id,
            "withdraw",
            self.config.call_timeout(),
            client.withdraw(&escrow.contract_address, secret),
        )
        .await
        .map_err(|e| chain_failure(swap_id, side, e))?;

        let confirmed = tx.is_confirmed();
        let kind = if confirmed {
            EventKind::Withdrawn
        } else {
            EventKind::SecretRevealed
        };
        let event = CrossChainEvent::new(swap_id, kind)
            .on(side, &escrow.chain_id, &escrow.contract_address)
            .at(None, tx.hash.clone())
            .with_data(serde_json::json!({ "confirmed": confirmed }));

        // a pending withdrawal has made the secret public but settles later
        let status = self
            .registry
            .update(swap_id, event, |r| {
                machine::reveal_secret(r, secret)?;
                if confirmed {
                    machine::apply_escrow_update(r, side, &EscrowUpdate::withdrawn())?;
                }
                Ok(r.status)
            })
            .await?;
        self.registry.remove_pending_secret(&record.hashlock());

        info!(
            "Withdrawal on {} for swap {} {} (tx {})",
            escrow.chain_id,
            swap_id,
            if confirmed { "confirmed" } else { "pending" },
            tx.hash
        );
        self.stop_if_terminal(swap_id, status);
        Ok(tx)
    }

    /// Claim one part of a partially fillable destination escrow
    pub async fn execute_partial_withdrawal(
        &self,
        swap_id: &str,
        secret: &str,
        proof: MerkleProof,
    ) -> SwapResult<TxRef> {
        let side = Side::Destination;

        // held across the chain call so attempts on the same swap serialize
        let mut guard = self.registry.lock(swap_id).await?;
        ensure_open(guard.record())?;

        let fill = machine::check_partial_fill(guard.record(), side, &proof)?;
        let escrow = guard.record().escrow(side).clone();
        if !escrow.is_deployed() {
            return Err(SwapError::EscrowNotFound {
                swap_id: swap_id.to_string(),
                side,
            });
        }
        if crypto::hashlock(secret) != fill.leaf {
            return Err(SwapError::SecretMismatch {
                swap_id: swap_id.to_string(),
            });
        }

        let client = self.client(&escrow.chain_id)?;
        let tx = with_timeout(
            &escrow.chain_id,
            "withdraw_partial",
            self.config.call_timeout(),
            client.withdraw_partial(&escrow.contract_address, secret, &proof),
        )
        .await
        .map_err(|e| chain_failure(swap_id, side, e))?;

        if !tx.is_confirmed() {
            info!(
                "Partial fill {} of swap {} pending (tx {})",
                fill.index, swap_id, tx.hash
            );
            return Ok(tx);
        }

        let event = CrossChainEvent::new(swap_id, EventKind::PartialFill)
            .on(side, &escrow.chain_id, &escrow.contract_address)
            .at(None, tx.hash.clone())
            .with_data(serde_json::json!({
                "index": fill.index,
                "secretHash": crypto::to_hex(&fill.leaf),
            }));
        let now = Utc::now();
        guard
            .apply(event, |r| machine::record_partial_fill(r, side, fill.index, now))
            .await?;
        let status = guard.record().status;
        drop(guard);

        info!("Partial fill {} of swap {} confirmed", fill.index, swap_id);
        self.stop_if_terminal(swap_id, status);
        Ok(tx)
    }

    /// Cancel both escrows independently. Sides already settled are
    /// reported, not retried.
    pub async fn cancel_swap(&self, swap_id: &str) -> SwapResult<CancelOutcome> {
        let mut guard = self.registry.lock(swap_id).await?;
        let status = guard.record().status;
        if matches!(status, SwapStatus::Completed | SwapStatus::Failed) {
            return Err(SwapError::AlreadyTerminal {
                swap_id: swap_id.to_string(),
                status,
            });
        }

        let src = self.cancel_side(&mut guard, Side::Source).await;
        let dst = self.cancel_side(&mut guard, Side::Destination).await;
        let status = guard.record().status;
        drop(guard);

        info!("Cancel of swap {}: src {:?}, dst {:?}", swap_id, src, dst);
        self.stop_if_terminal(swap_id, status);
        Ok(CancelOutcome { src, dst })
    }

    async fn cancel_side(&self, guard: &mut SwapGuard<'_>, side: Side) -> SideCancellation {
        let swap_id = guard.record().id.clone();
        let escrow = guard.record().escrow(side).clone();

        if !escrow.is_deployed() {
            return SideCancellation::NotDeployed;
        }
        if escrow.cancelled {
            return SideCancellation::AlreadyCancelled;
        }
        if escrow.withdrawn {
            return SideCancellation::AlreadyWithdrawn;
        }

        let client = match self.chains.get(&escrow.chain_id) {
            Some(client) => client,
            None => {
                return SideCancellation::Failed(ChainError::NetworkUnavailable {
                    chain_id: escrow.chain_id.clone(),
                    message: "chain not connected".to_string(),
                })
            }
        };

        let result = with_timeout(
            &escrow.chain_id,
            "cancel",
            self.config.call_timeout(),
            client.cancel(&escrow.contract_address),
        )
        .await;

        match result {
            Ok(tx) => {
                if tx.is_confirmed() {
                    let event = CrossChainEvent::new(&swap_id, EventKind::Cancelled)
                        .on(side, &escrow.chain_id, &escrow.contract_address)
                        .at(None, tx.hash.clone());
                    if let Err(e) = guard
                        .apply(event, |r| {
                            machine::apply_escrow_update(r, side, &EscrowUpdate::cancelled())
                        })
                        .await
                    {
                        error!("Recording cancel of {} escrow of swap {} failed: {}", side, swap_id, e);
                    }
                }
                SideCancellation::Cancelled(tx)
            }
            Err(e) => {
                warn!("Cancel of {} escrow of swap {} failed: {}", side, swap_id, e);
                self.recheck_cancelled(guard, side, &client, e).await
            }
        }
    }

    /// After a failed cancel, ask the chain whether the escrow is already
    /// settled and fold that in
    async fn recheck_cancelled(
        &self,
        guard: &mut SwapGuard<'_>,
        side: Side,
        client: &Arc<dyn ChainClient>,
        cause: ChainError,
    ) -> SideCancellation {
        let escrow = guard.record().escrow(side).clone();
        let snapshot = match with_timeout(
            &escrow.chain_id,
            "get_state",
            self.config.call_timeout(),
            client.get_state(&escrow.contract_address),
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Re-reading {} escrow failed: {}", side, e);
                return SideCancellation::Failed(cause);
            }
        };

        if !snapshot.cancelled && !snapshot.withdrawn {
            return SideCancellation::Failed(cause);
        }

        self.merge_snapshot(guard, side, &escrow.chain_id, snapshot.clone()).await;
        if snapshot.cancelled {
            SideCancellation::AlreadyCancelled
        } else {
            SideCancellation::AlreadyWithdrawn
        }
    }

    /// Operator path to `failed`
    pub async fn mark_failed(&self, swap_id: &str, reason: &str) -> SwapResult<()> {
        let event = CrossChainEvent::new(swap_id, EventKind::Failed)
            .with_data(serde_json::json!({ "reason": reason }));
        self.registry.update(swap_id, event, machine::mark_failed).await?;

        warn!("Swap {} marked failed: {}", swap_id, reason);
        self.stop_monitors(swap_id);
        Ok(())
    }

    /// Current record with its timelock stage projected for now
    pub async fn get_status(&self, swap_id: &str) -> SwapResult<SwapRecord> {
        let mut record = self.registry.get(swap_id).await?;
        record.stage = self.project_stage(&record).await;
        Ok(record)
    }

    pub async fn is_synchronized(&self, swap_id: &str) -> SwapResult<bool> {
        let record = self.registry.get(swap_id).await?;
        Ok(machine::is_synchronized(&record))
    }

    pub async fn list_active(&self) -> Vec<SwapRecord> {
        self.registry.list_active().await
    }

    /// Ask the anchor escrow's chain for its stage, projecting locally if
    /// the chain cannot answer
    async fn project_stage(&self, record: &SwapRecord) -> crate::chain::TimelockStage {
        let anchor = if record.src_escrow.is_deployed() {
            &record.src_escrow
        } else {
            &record.dst_escrow
        };

        if anchor.is_deployed() {
            if let Some(client) = self.chains.get(&anchor.chain_id) {
                let stage = with_timeout(
                    &anchor.chain_id,
                    "current_stage",
                    self.config.call_timeout(),
                    client.current_stage(&anchor.contract_address),
                )
                .await;
                match stage {
                    Ok(stage) => return stage,
                    Err(e) => debug!("Falling back to local stage projection: {}", e),
                }
            }
        }

        let now = Utc::now().timestamp().max(0) as u64;
        machine::swap_stage(record, &self.schedule, now)
    }

    /// Restart monitors for swaps recovered from a journal
    pub async fn resume_monitors(&self) {
        for record in self.registry.list_active().await {
            for side in [Side::Source, Side::Destination] {
                let escrow = record.escrow(side);
                if !escrow.is_deployed() || escrow.is_settled() {
                    continue;
                }
                match self.chains.get(&escrow.chain_id) {
                    Some(client) => {
                        self.start_monitor(&record.id, side, &escrow.contract_address, client)
                    }
                    None => warn!(
                        "Cannot resume monitoring swap {}: chain {} not connected",
                        record.id, escrow.chain_id
                    ),
                }
            }
        }
    }

    fn start_monitor(&self, swap_id: &str, side: Side, address: &str, client: Arc<dyn ChainClient>) {
        let mut entry = self
            .monitors
            .entry(swap_id.to_string())
            .or_insert_with(|| SwapMonitors {
                shutdown: watch::channel(false).0,
                handles: Vec::new(),
            });

        let monitor = EscrowMonitor::new(
            swap_id.to_string(),
            side,
            address.to_string(),
            client,
            self.config.clone(),
            self.updates_tx.clone(),
            entry.shutdown.subscribe(),
        );
        entry.handles.push(monitor.spawn());
    }

    /// Flip a swap's shutdown flag; monitors exit at their next wait
    pub fn stop_monitors(&self, swap_id: &str) {
        if let Some((_, monitors)) = self.monitors.remove(swap_id) {
            debug!(
                "Stopping {} monitors of swap {}",
                monitors.handles.len(),
                swap_id
            );
            monitors.shutdown.send_replace(true);
        }
    }

    pub fn monitored_swaps(&self) -> usize {
        self.monitors.len()
    }

    fn stop_if_terminal(&self, swap_id: &str, status: SwapStatus) {
        if status.is_terminal() {
            info!("Swap {} reached {}", swap_id, status);
            self.stop_monitors(swap_id);
        }
    }

    async fn apply_update(&self, update: MonitorUpdate) -> SwapResult<()> {
        let MonitorUpdate {
            swap_id,
            side,
            chain_id,
            payload,
        } = update;

        let mut guard = self.registry.lock(&swap_id).await?;
        match payload {
            MonitorPayload::Event(event) => {
                let block = event.block_number;
                self.apply_event(&mut guard, side, event).await;
                self.registry.advance_sync_block(&chain_id, block);
            }
            MonitorPayload::Snapshot(snapshot) => {
                let block = snapshot.block_number;
                self.merge_snapshot(&mut guard, side, &chain_id, snapshot).await;
                self.registry.advance_sync_block(&chain_id, block);
            }
        }

        let status = guard.record().status;
        drop(guard);
        self.stop_if_terminal(&swap_id, status);
        Ok(())
    }

    async fn apply_event(&self, guard: &mut SwapGuard<'_>, side: Side, event: ChainEvent) {
        let swap_id = guard.record().id.clone();
        if guard.record().escrow(side).contract_address != event.address {
            warn!(
                "Ignoring {} event for {}: not the {} escrow of swap {}",
                event.name(),
                event.address,
                side,
                swap_id
            );
            return;
        }
        debug!("Applying {} on {} to swap {}", event.name(), event.chain_id, swap_id);
        crate::metrics::record_event_applied(event.chain_id.as_str(), event.name());

        let base = |kind| {
            CrossChainEvent::new(&swap_id, kind)
                .on(side, &event.chain_id, &event.address)
                .at(Some(event.block_number), event.tx_hash.clone())
        };

        let result = match &event.kind {
            EscrowEventKind::Withdrawn { secret } => {
                if let Some(secret) = secret {
                    self.observe_secret(guard, side, secret, base(EventKind::SecretRevealed))
                        .await;
                }
                guard
                    .apply(base(EventKind::Withdrawn), |r| {
                        machine::apply_escrow_update(r, side, &EscrowUpdate::withdrawn())
                    })
                    .await
                    .map(|_| ())
            }
            EscrowEventKind::Cancelled => guard
                .apply(base(EventKind::Cancelled), |r| {
                    machine::apply_escrow_update(r, side, &EscrowUpdate::cancelled())
                })
                .await
                .map(|_| ()),
            EscrowEventKind::SecretRevealed { secret } => {
                self.observe_secret(guard, side, secret, base(EventKind::SecretRevealed))
                    .await;
                Ok(())
            }
            EscrowEventKind::PartialFilled { index } => {
                let now = Utc::now();
                let index = *index;
                guard
                    .apply(
                        base(EventKind::PartialFill).with_data(serde_json::json!({ "index": index })),
                        |r| machine::record_partial_fill(r, side, index, now),
                    )
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            self.report_desync(guard, side, &event.chain_id, &e.to_string()).await;
        }
        self.check_synchronized(guard, side, &event.chain_id).await;
    }

    /// Reveal a secret seen on-chain, or report it if it does not open
    /// the hashlock
    async fn observe_secret(
        &self,
        guard: &mut SwapGuard<'_>,
        side: Side,
        secret: &str,
        event: CrossChainEvent,
    ) {
        let chain_id = guard.record().escrow(side).chain_id.clone();
        match guard
            .apply(event, |r| machine::reveal_secret(r, secret))
            .await
        {
            Ok(_) => {
                let hashlock = guard.record().hashlock();
                if self.registry.remove_pending_secret(&hashlock) {
                    info!("Secret of swap {} revealed on {}", guard.record().id, chain_id);
                }
            }
            Err(e) => self.report_desync(guard, side, &chain_id, &e.to_string()).await,
        }
    }

    async fn merge_snapshot(
        &self,
        guard: &mut SwapGuard<'_>,
        side: Side,
        chain_id: &ChainId,
        mut snapshot: EscrowSnapshot,
    ) {
        let hashlock = guard.record().hashlock();
        if let Some(secret) = snapshot.revealed_secret.take() {
            if crypto::hashlock(&secret) == hashlock {
                snapshot.revealed_secret = Some(secret);
            } else {
                self.report_desync(guard, side, chain_id, "chain reports a secret that does not open the hashlock")
                    .await;
            }
        }

        let swap_id = guard.record().id.clone();
        let event = CrossChainEvent::new(&swap_id, EventKind::Reconciled)
            .on(side, chain_id, &snapshot.address)
            .at_block(snapshot.block_number);
        let now = Utc::now();

        match guard
            .apply(event, |r| machine::merge_snapshot(r, side, &snapshot, now))
            .await
        {
            Ok(true) => {
                debug!("Reconciled {} escrow of swap {} from chain state", side, swap_id);
                if guard.record().escrow(side).revealed_secret.is_some() {
                    self.registry.remove_pending_secret(&hashlock);
                }
            }
            Ok(false) => {}
            Err(e) => self.report_desync(guard, side, chain_id, &e.to_string()).await,
        }
        self.check_synchronized(guard, side, chain_id).await;
    }

    async fn check_synchronized(&self, guard: &mut SwapGuard<'_>, side: Side, chain_id: &ChainId) {
        if !machine::is_synchronized(guard.record()) {
            self.report_desync(guard, side, chain_id, "sides disagree on the revealed secret")
                .await;
        }
    }

    /// Desynchronization is logged, counted and recorded; it does not fail
    /// the swap by itself
    async fn report_desync(&self, guard: &mut SwapGuard<'_>, side: Side, chain_id: &ChainId, reason: &str) {
        let swap_id = guard.record().id.clone();
        error!(
            "Swap {} desynchronized on {} ({}): {}",
            swap_id, chain_id, side, reason
        );
        crate::metrics::record_desync(chain_id.as_str());

        let address = guard.record().escrow(side).contract_address.clone();
        let event = CrossChainEvent::new(&swap_id, EventKind::Desynchronized)
            .on(side, chain_id, &address)
            .with_data(serde_json::json!({ "reason": reason }));
        if let Err(e) = guard.record_event(event).await {
            error!("Failed to record desync of swap {}: {}", swap_id, e);
        }
    }

    fn client(&self, chain_id: &ChainId) -> SwapResult<Arc<dyn ChainClient>> {
        self.chains
            .get(chain_id)
            .ok_or_else(|| SwapError::InvalidConfig(format!("chain {} is not connected", chain_id)))
    }
}

/// Completed and cancelled swaps accept no further settlement
fn ensure_open(record: &SwapRecord) -> SwapResult<()> {
    match record.status {
        SwapStatus::Completed | SwapStatus::Cancelled => Err(SwapError::AlreadyTerminal {
            swap_id: record.id.clone(),
            status: record.status,
        }),
        _ => Ok(()),
    }
}

fn chain_failure(swap_id: &str, side: Side, error: ChainError) -> SwapError {
    match error {
        ChainError::InvalidSecret { .. } => SwapError::SecretMismatch {
            swap_id: swap_id.to_string(),
        },
        source => SwapError::Chain { side, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Deployment, EventStream, SimulatedChain, TimelockStage};
    use crate::coordination::swap::fixtures::config;
    use crate::error::ChainResult;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        pub Chain {}

        #[async_trait]
        impl ChainClient for Chain {
            fn chain_id(&self) -> ChainId;
            fn predict_address(&self, params: &EscrowParams) -> String;
            async fn deploy(&self, params: &EscrowParams) -> ChainResult<Deployment>;
            async fn withdraw(&self, address: &str, secret: &str) -> ChainResult<TxRef>;
            async fn withdraw_partial(&self, address: &str, secret: &str, proof: &MerkleProof) -> ChainResult<TxRef>;
            async fn cancel(&self, address: &str) -> ChainResult<TxRef>;
            async fn get_state(&self, address: &str) -> ChainResult<EscrowSnapshot>;
            async fn current_stage(&self, address: &str) -> ChainResult<TimelockStage>;
            async fn subscribe(&self, address: &str) -> ChainResult<EventStream>;
            async fn health_check(&self) -> bool;
        }
    }

    const MOCK_ADDRESS: &str = "escrow.near";

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_ms: 20,
            call_timeout_ms: 500,
            retry_delay_ms: 5,
            max_backoff_ms: 20,
            ..Default::default()
        }
    }

    /// Destination mock that deploys fine and never delivers events
    fn near_mock() -> MockChain {
        let mut near = MockChain::new();
        near.expect_chain_id().returning(|| ChainId::from("near"));
        near.expect_predict_address().returning(|_| MOCK_ADDRESS.to_string());
        near.expect_deploy().returning(|_| {
            Ok(Deployment {
                address: MOCK_ADDRESS.to_string(),
                deployed_at: 1,
                tx_hash: "0xdeploy".to_string(),
            })
        });
        near.expect_subscribe().returning(|address| {
            Err(ChainError::NotFound {
                chain_id: ChainId::from("near"),
                address: address.to_string(),
            })
        });
        near.expect_current_stage().returning(|_| Ok(TimelockStage::SrcWithdrawal));
        near.expect_health_check().returning(|| true);
        near
    }

    fn orchestrator(near: MockChain) -> (Orchestrator, Arc<SimulatedChain>) {
        let eth = Arc::new(SimulatedChain::new(ChainId::from("ethereum"), TimelockSchedule::default()));
        let chains = Arc::new(ChainManager::new());
        chains.register(eth.clone());
        chains.register(Arc::new(near));

        let orchestrator = Orchestrator::new(
            fast_config(),
            TimelockSchedule::default(),
            Arc::new(SwapRegistry::new()),
            chains,
        );
        (orchestrator, eth)
    }

    #[tokio::test]
    async fn test_destination_deploy_failure_keeps_source() {
        let mut near = MockChain::new();
        near.expect_chain_id().returning(|| ChainId::from("near"));
        near.expect_predict_address().returning(|_| MOCK_ADDRESS.to_string());
        near.expect_deploy().returning(|_| {
            Err(ChainError::InsufficientFunds {
                chain_id: ChainId::from("near"),
                message: "taker balance too low".into(),
            })
        });
        let (orchestrator, _eth) = orchestrator(near);

        let err = orchestrator.initiate_swap(config("s1")).await.unwrap_err();
        assert!(matches!(
            err,
            SwapError::DeploymentFailed {
                side: Side::Destination,
                cause: ChainError::InsufficientFunds { .. }
            }
        ));

        let records = orchestrator.registry().list().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SwapStatus::Deployed);
        assert!(records[0].src_escrow.is_deployed());
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_network_failure_on_withdraw_is_retryable_and_harmless() {
        let mut near = near_mock();
        near.expect_withdraw().times(1).returning(|_, _| {
            Err(ChainError::NetworkUnavailable {
                chain_id: ChainId::from("near"),
                message: "rpc timeout".into(),
            })
        });
        let (orchestrator, _eth) = orchestrator(near);

        let id = orchestrator.initiate_swap(config("s1")).await.unwrap();
        let before = orchestrator.registry().get(&id).await.unwrap();

        let err = orchestrator.complete_withdrawal(&id, "s1").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SwapError::Chain { side: Side::Destination, .. }));
        assert_eq!(orchestrator.registry().get(&id).await.unwrap(), before);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_secret_never_reaches_chain() {
        let mut near = near_mock();
        near.expect_withdraw().never();
        let (orchestrator, _eth) = orchestrator(near);

        let id = orchestrator.initiate_swap(config("s1")).await.unwrap();
        let err = orchestrator.complete_withdrawal(&id, "wrong").await.unwrap_err();
        assert!(matches!(err, SwapError::SecretMismatch { .. }));
        assert_eq!(orchestrator.get_status(&id).await.unwrap().status, SwapStatus::Active);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_pending_withdrawal_reveals_without_settling() {
        let mut near = near_mock();
        near.expect_withdraw().returning(|_, _| {
            Ok(TxRef {
                chain_id: ChainId::from("near"),
                hash: "0xpending".into(),
                status: crate::chain::TxStatus::Pending,
            })
        });
        let (orchestrator, _eth) = orchestrator(near);

        let id = orchestrator.initiate_swap(config("s1")).await.unwrap();
        let tx = orchestrator.complete_withdrawal(&id, "s1").await.unwrap();
        assert!(!tx.is_confirmed());

        let record = orchestrator.registry().get(&id).await.unwrap();
        assert_eq!(record.src_escrow.revealed_secret.as_deref(), Some("s1"));
        assert!(!record.dst_escrow.withdrawn);
        assert_eq!(record.status, SwapStatus::Active);
        assert_eq!(orchestrator.registry().pending_secret_count(), 0);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_failed_cancel_rechecks_chain_state() {
        let mut near = near_mock();
        near.expect_cancel().returning(|_| {
            Err(ChainError::TransactionReverted {
                chain_id: ChainId::from("near"),
                reason: "escrow already cancelled".into(),
            })
        });
        near.expect_get_state().returning(|address| {
            Ok(EscrowSnapshot {
                address: address.to_string(),
                deployed_at: 1,
                cancelled: true,
                block_number: 12,
                ..Default::default()
            })
        });
        let (orchestrator, eth) = orchestrator(near);

        let id = orchestrator.initiate_swap(config("s1")).await.unwrap();
        eth.advance_time(TimelockSchedule::default().cancellation_opens(Side::Source, config("s1").timelock_duration));

        let outcome = orchestrator.cancel_swap(&id).await.unwrap();
        assert!(matches!(outcome.src, SideCancellation::Cancelled(_)));
        assert_eq!(outcome.dst, SideCancellation::AlreadyCancelled);

        let record = orchestrator.registry().get(&id).await.unwrap();
        assert!(record.src_escrow.cancelled && record.dst_escrow.cancelled);
        assert_eq!(record.status, SwapStatus::Cancelled);
        assert_eq!(orchestrator.monitored_swaps(), 0);
    }

    #[tokio::test]
    async fn test_address_mismatch_is_reported_and_recorded() {
        let (orchestrator, eth) = orchestrator(near_mock());
        eth.redirect_next_deploy("0xdeadbeef");

        let err = orchestrator.initiate_swap(config("s1")).await.unwrap_err();
        assert!(matches!(
            err,
            SwapError::DeploymentFailed {
                side: Side::Source,
                cause: ChainError::AddressMismatch { .. }
            }
        ));

        let record = &orchestrator.registry().list().await[0];
        assert_eq!(record.src_escrow.contract_address, "0xdeadbeef");
        assert_eq!(record.status, SwapStatus::Active);
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_mark_failed_stops_monitors() {
        let (orchestrator, _eth) = orchestrator(near_mock());
        let id = orchestrator.initiate_swap(config("s1")).await.unwrap();
        assert_eq!(orchestrator.monitored_swaps(), 1);

        orchestrator.mark_failed(&id, "operator abort").await.unwrap();
        assert_eq!(orchestrator.get_status(&id).await.unwrap().status, SwapStatus::Failed);
        assert_eq!(orchestrator.monitored_swaps(), 0);

        let err = orchestrator.cancel_swap(&id).await.unwrap_err();
        assert!(matches!(err, SwapError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_unknown_chain_rejected_before_registration() {
        let (orchestrator, _eth) = orchestrator(near_mock());
        let mut cfg = config("s1");
        cfg.dst_chain = ChainId::from("solana");

        assert!(matches!(orchestrator.initiate_swap(cfg).await, Err(SwapError::InvalidConfig(_))));
        assert!(orchestrator.registry().list().await.is_empty());
    }
}
