//! Per-escrow monitor with event streaming and state polling
//!
//! Each deployed escrow gets one task. It forwards chain events and periodic
//! `get_state` snapshots to the orchestrator's update queue; it never
//! mutates swap records itself.

use super::{with_timeout, ChainClient, ChainId, EscrowSnapshot, EventStream};
use crate::config::CoordinatorConfig;
use crate::coordination::swap::Side;
use crate::events::ChainEvent;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Something a monitor observed about one escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorPayload {
    Event(ChainEvent),
    Snapshot(EscrowSnapshot),
}

/// Observation tagged with the swap side it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorUpdate {
    pub swap_id: String,
    pub side: Side,
    pub chain_id: ChainId,
    pub payload: MonitorPayload,
}

/// Watches one escrow until the swap's shutdown flag flips
pub struct EscrowMonitor {
    swap_id: String,
    side: Side,
    address: String,
    client: Arc<dyn ChainClient>,
    config: CoordinatorConfig,
    updates: mpsc::UnboundedSender<MonitorUpdate>,
    shutdown: watch::Receiver<bool>,
}

impl EscrowMonitor {
    pub fn new(
        swap_id: String,
        side: Side,
        address: String,
        client: Arc<dyn ChainClient>,
        config: CoordinatorConfig,
        updates: mpsc::UnboundedSender<MonitorUpdate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            swap_id,
            side,
            address,
            client,
            config,
            updates,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main monitoring loop
    pub async fn run(mut self) {
        let chain_id = self.client.chain_id();
        info!(
            "Monitoring {} escrow {} of swap {} on {}",
            self.side, self.address, self.swap_id, chain_id
        );
        crate::metrics::record_monitor_started();

        let mut stream: Option<EventStream> = None;
        let mut attempt: u32 = 0;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if stream.is_none() {
                match self.subscribe(&chain_id).await {
                    Some(events) => {
                        stream = Some(events);
                    }
                    None => {
                        let delay = self.config.backoff(attempt);
                        attempt = attempt.saturating_add(1);
                        tokio::select! {
                            changed = self.shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                }
            }

            let Some(events) = stream.as_mut() else {
                continue;
            };

            let mut stream_closed = false;
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        attempt = 0;
                        debug!("{} escrow {} event: {}", self.side, self.address, event.name());
                        if !self.forward(&chain_id, MonitorPayload::Event(event)) {
                            break;
                        }
                    }
                    None => {
                        warn!("Event stream for {} on {} closed, resubscribing", self.address, chain_id);
                        crate::metrics::record_monitor_error(chain_id.as_str());
                        stream_closed = true;
                    }
                },
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.poll(&chain_id).await {
                        if !self.forward(&chain_id, MonitorPayload::Snapshot(snapshot)) {
                            break;
                        }
                    }
                }
            }

            if stream_closed {
                stream = None;
                let delay = self.config.backoff(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    changed = self.shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        crate::metrics::record_monitor_stopped();
        info!("Stopped monitoring {} escrow {} of swap {}", self.side, self.address, self.swap_id);
    }

    async fn subscribe(&self, chain_id: &ChainId) -> Option<EventStream> {
        let result = with_timeout(
            chain_id,
            "subscribe",
            self.config.call_timeout(),
            self.client.subscribe(&self.address),
        )
        .await;

        match result {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("Failed to subscribe to {} on {}: {}", self.address, chain_id, e);
                crate::metrics::record_monitor_error(chain_id.as_str());
                None
            }
        }
    }

    async fn poll(&self, chain_id: &ChainId) -> Option<EscrowSnapshot> {
        let result = with_timeout(
            chain_id,
            "get_state",
            self.config.call_timeout(),
            self.client.get_state(&self.address),
        )
        .await;

        match result {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to poll {} on {}: {}", self.address, chain_id, e);
                crate::metrics::record_monitor_error(chain_id.as_str());
                None
            }
        }
    }

    /// False once the orchestrator has gone away
    fn forward(&self, chain_id: &ChainId, payload: MonitorPayload) -> bool {
        let update = MonitorUpdate {
            swap_id: self.swap_id.clone(),
            side: self.side,
            chain_id: chain_id.clone(),
            payload,
        };
        self.updates.send(update).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{SimulatedChain, TimelockSchedule};
    use crate::coordination::swap::fixtures::config;
    use crate::error::ChainError;
    use crate::events::EscrowEventKind;
    use std::time::Duration;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_ms: 20,
            call_timeout_ms: 500,
            retry_delay_ms: 5,
            max_backoff_ms: 20,
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<SimulatedChain>, String) {
        let chain = Arc::new(SimulatedChain::new(ChainId::from("near"), TimelockSchedule::default()));
        let params = config("s1").escrow_params(Side::Destination);
        let address = chain.deploy(&params).await.unwrap().address;
        (chain, address)
    }

    #[tokio::test]
    async fn test_forwards_events_and_snapshots() {
        let (chain, address) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);

        let handle = EscrowMonitor::new("swap".into(), Side::Destination, address.clone(), chain.clone(), fast_config(), tx, shutdown).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.external_withdraw(&address, "s1").unwrap();

        let mut saw_event = false;
        let mut saw_snapshot = false;
        while !(saw_event && saw_snapshot) {
            let update = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(update.swap_id, "swap");
            match update.payload {
                MonitorPayload::Event(event) => {
                    assert!(matches!(event.kind, EscrowEventKind::Withdrawn { .. }));
                    saw_event = true;
                }
                MonitorPayload::Snapshot(_) => saw_snapshot = true,
            }
        }

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retries_failed_subscription() {
        let (chain, address) = setup().await;
        chain.fail_next(
            "subscribe",
            ChainError::NetworkUnavailable {
                chain_id: ChainId::from("near"),
                message: "ws down".into(),
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);

        let handle = EscrowMonitor::new("swap".into(), Side::Destination, address.clone(), chain.clone(), fast_config(), tx, shutdown).spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        chain.external_reveal(&address, "s1").unwrap();

        let revealed = loop {
            let update = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            if let MonitorPayload::Event(event) = update.payload {
                break event;
            }
        };
        assert_eq!(revealed.kind, EscrowEventKind::SecretRevealed { secret: "s1".into() });

        drop(stop);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
