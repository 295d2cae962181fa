//! # Transport Selector
//!
//! Picks the active transport and keeps watching it.
//!
//! ## Selection Rule
//! The available transport with the lowest rank wins. The cloud relay is
//! always available, so there is always a winner.
//!
//! ## Health Monitoring
//! ```text
//! every health interval (15 s):
//!   probe(active)
//!     ok    ──► Healthy, failures = 0
//!     fail  ──► Degraded, failures += 1
//!               failures == threshold (3) ──► Unavailable, leaves the
//!                                             available set, failover
//!
//! every upgrade interval (60 s):
//!   probe_all(transports ranked above active)
//!     any reachable ──► switch up without waiting for active to fail
//! ```
//!
//! [`SelectorState`] is the synchronous state machine; [`TransportSelector`]
//! is the worker that owns one and drives it from timers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::probe::Prober;
use crate::config::TransportSettings;
use crate::error::{SyncError, SyncResult};
use tandem_core::{TransportHealthStatus, TransportKind, TransportProbeResult, TransportState};

/// Weight of the newest sample in the latency average.
const LATENCY_SMOOTHING: f64 = 0.3;

// =============================================================================
// Change Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// First selection after start.
    Initial,
    /// The active transport failed its health checks.
    Failover,
    /// A better transport became reachable.
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportChange {
    pub from: TransportKind,
    pub to: TransportKind,
    pub reason: ChangeReason,
}

/// Point-in-time view of the selector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub active: TransportKind,
    pub states: BTreeMap<TransportKind, TransportState>,
    pub health: Vec<TransportHealthStatus>,
    pub endpoints: BTreeMap<TransportKind, String>,
}

impl TransportSnapshot {
    pub fn available(&self) -> Vec<TransportKind> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_available())
            .map(|(kind, _)| *kind)
            .collect()
    }
}

// =============================================================================
// Selector State
// =============================================================================

#[derive(Debug, Clone)]
pub struct SelectorState {
    states: BTreeMap<TransportKind, TransportState>,
    health: BTreeMap<TransportKind, TransportHealthStatus>,
    endpoints: BTreeMap<TransportKind, String>,
    active: TransportKind,
    failure_threshold: u32,
}

impl SelectorState {
    /// Everything unprobed except the cloud relay, which starts active.
    pub fn new(failure_threshold: u32) -> Self {
        let mut states = BTreeMap::new();
        let mut health = BTreeMap::new();
        for kind in TransportKind::ALL {
            let state = if kind.requires_probe() {
                TransportState::Unprobed
            } else {
                TransportState::Available
            };
            states.insert(kind, state);
            health.insert(kind, TransportHealthStatus::new(kind));
        }
        if let Some(cloud) = health.get_mut(&TransportKind::CloudRelay) {
            cloud.healthy = true;
        }

        SelectorState {
            states,
            health,
            endpoints: BTreeMap::new(),
            active: TransportKind::CloudRelay,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn active(&self) -> TransportKind {
        self.active
    }

    pub fn state(&self, kind: TransportKind) -> TransportState {
        self.states.get(&kind).copied().unwrap_or(TransportState::Unprobed)
    }

    pub fn endpoint(&self, kind: TransportKind) -> Option<&str> {
        self.endpoints.get(&kind).map(String::as_str)
    }

    /// Transports in the available set, best first.
    pub fn available(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(|kind| self.state(*kind).is_available())
            .collect()
    }

    /// Best available transport. Never fails: the cloud relay is always a
    /// candidate.
    pub fn select(&self) -> TransportKind {
        TransportKind::ALL
            .into_iter()
            .find(|kind| !kind.requires_probe() || self.state(*kind).is_available())
            .unwrap_or(TransportKind::CloudRelay)
    }

    /// Applies a discovery or upgrade probe.
    pub fn apply_probe(&mut self, result: &TransportProbeResult) {
        let kind = result.transport;
        if !kind.requires_probe() {
            return;
        }

        let current = self.state(kind);
        let next = match (result.available, current) {
            (true, TransportState::Unprobed | TransportState::Unavailable) => {
                TransportState::Available
            }
            (true, state) => state,
            (false, TransportState::Healthy | TransportState::Degraded) if kind == self.active => {
                current
            }
            (false, _) => TransportState::Unavailable,
        };
        self.states.insert(kind, next);

        match (&result.endpoint, next.is_available()) {
            (Some(endpoint), true) => {
                self.endpoints.insert(kind, endpoint.clone());
            }
            (_, false) => {
                self.endpoints.remove(&kind);
            }
            _ => {}
        }

        self.touch_health(result);
    }

    /// Applies a health check of the active transport.
    ///
    /// Returns the failover, if the check pushed the transport over the
    /// failure threshold.
    pub fn record_health(&mut self, result: &TransportProbeResult) -> Option<TransportChange> {
        let kind = result.transport;
        if !kind.requires_probe() {
            return None;
        }

        let failures = self.touch_health(result);
        if result.available {
            self.states.insert(kind, TransportState::Healthy);
            if let Some(endpoint) = &result.endpoint {
                self.endpoints.insert(kind, endpoint.clone());
            }
            return None;
        }

        if failures < self.failure_threshold {
            self.states.insert(kind, TransportState::Degraded);
            debug!(transport = %kind, failures, "Health check failed");
            return None;
        }

        warn!(transport = %kind, failures, "Transport failed health checks, removing it");
        self.states.insert(kind, TransportState::Unavailable);
        self.endpoints.remove(&kind);
        self.reselect(ChangeReason::Failover)
    }

    /// Switches to the best available transport if it is not the active one.
    pub fn reselect(&mut self, reason: ChangeReason) -> Option<TransportChange> {
        let best = self.select();
        if best == self.active {
            return None;
        }
        let change = TransportChange {
            from: self.active,
            to: best,
            reason,
        };
        self.active = best;
        Some(change)
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            active: self.active,
            states: self.states.clone(),
            health: self.health.values().cloned().collect(),
            endpoints: self.endpoints.clone(),
        }
    }

    /// Updates the rolling health record and returns the failure streak.
    fn touch_health(&mut self, result: &TransportProbeResult) -> u32 {
        let health = self
            .health
            .entry(result.transport)
            .or_insert_with(|| TransportHealthStatus::new(result.transport));

        health.last_checked_at = Some(result.probed_at);
        health.healthy = result.available;
        if result.available {
            health.consecutive_failures = 0;
            if let Some(sample) = result.latency_ms.map(|ms| ms as f64) {
                health.average_latency_ms = Some(match health.average_latency_ms {
                    Some(avg) => avg + LATENCY_SMOOTHING * (sample - avg),
                    None => sample,
                });
            }
        } else {
            health.consecutive_failures += 1;
        }
        health.consecutive_failures
    }
}

// =============================================================================
// Selector Worker
// =============================================================================

enum SelectorCommand {
    Snapshot(oneshot::Sender<TransportSnapshot>),
    ProbeNow(oneshot::Sender<TransportKind>),
    Shutdown,
}

/// Handle for querying and controlling the transport selector.
#[derive(Clone)]
pub struct TransportSelectorHandle {
    command_tx: mpsc::Sender<SelectorCommand>,
    active_rx: watch::Receiver<TransportKind>,
    change_tx: broadcast::Sender<TransportChange>,
}

impl TransportSelectorHandle {
    /// Currently active transport.
    pub fn active(&self) -> TransportKind {
        *self.active_rx.borrow()
    }

    /// Receiver that always holds the active transport.
    pub fn watch_active(&self) -> watch::Receiver<TransportKind> {
        self.active_rx.clone()
    }

    pub fn changes(&self) -> broadcast::Receiver<TransportChange> {
        self.change_tx.subscribe()
    }

    pub async fn snapshot(&self) -> SyncResult<TransportSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SelectorCommand::Snapshot(tx))
            .await
            .map_err(|_| SyncError::ChannelError("Transport selector stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::ChannelError("Transport selector dropped reply".into()))
    }

    /// Re-probes every transport now and returns the resulting selection.
    pub async fn probe_now(&self) -> SyncResult<TransportKind> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SelectorCommand::ProbeNow(tx))
            .await
            .map_err(|_| SyncError::ChannelError("Transport selector stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::ChannelError("Transport selector dropped reply".into()))
    }

    /// Stops the health and upgrade loops.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SelectorCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelError("Transport selector already stopped".into()))
    }
}

/// Worker that owns the selector state.
pub struct TransportSelector {
    prober: Arc<dyn Prober>,
    state: SelectorState,
    health_interval: Duration,
    upgrade_interval: Duration,
    command_rx: mpsc::Receiver<SelectorCommand>,
    active_tx: watch::Sender<TransportKind>,
    change_tx: broadcast::Sender<TransportChange>,
}

impl TransportSelector {
    /// Spawns the selector. The first probe of every transport starts
    /// immediately.
    pub fn spawn(prober: Arc<dyn Prober>, settings: &TransportSettings) -> TransportSelectorHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (active_tx, active_rx) = watch::channel(TransportKind::CloudRelay);
        let (change_tx, _) = broadcast::channel(32);

        let selector = TransportSelector {
            prober,
            state: SelectorState::new(settings.failure_threshold),
            health_interval: settings.health_interval(),
            upgrade_interval: settings.upgrade_interval(),
            command_rx,
            active_tx,
            change_tx: change_tx.clone(),
        };
        tokio::spawn(selector.run());

        TransportSelectorHandle {
            command_tx,
            active_rx,
            change_tx,
        }
    }

    async fn run(mut self) {
        info!(
            health_interval = ?self.health_interval,
            upgrade_interval = ?self.upgrade_interval,
            "Transport selector starting"
        );

        self.probe_and_select(&TransportKind::ALL, ChangeReason::Initial).await;

        let mut health_tick =
            interval_at(Instant::now() + self.health_interval, self.health_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut upgrade_tick =
            interval_at(Instant::now() + self.upgrade_interval, self.upgrade_interval);
        upgrade_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = health_tick.tick() => self.check_health().await,
                _ = upgrade_tick.tick() => self.try_upgrade().await,
                command = self.command_rx.recv() => match command {
                    Some(SelectorCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.state.snapshot());
                    }
                    Some(SelectorCommand::ProbeNow(reply)) => {
                        self.probe_and_select(&TransportKind::ALL, ChangeReason::Upgrade).await;
                        let _ = reply.send(self.state.active());
                    }
                    Some(SelectorCommand::Shutdown) | None => break,
                },
            }
        }

        info!("Transport selector stopped");
    }

    async fn probe_and_select(&mut self, kinds: &[TransportKind], reason: ChangeReason) {
        for result in self.prober.probe_all(kinds).await {
            self.state.apply_probe(&result);
        }
        if let Some(change) = self.state.reselect(reason) {
            self.publish(change);
        }
    }

    async fn check_health(&mut self) {
        let active = self.state.active();
        if !active.requires_probe() {
            return;
        }

        let result = self.prober.probe(active).await;
        if let Some(change) = self.state.record_health(&result) {
            self.publish(change);
        }
    }

    async fn try_upgrade(&mut self) {
        let candidates: Vec<TransportKind> = self.state.active().better_than().collect();
        if candidates.is_empty() {
            return;
        }
        debug!(candidates = ?candidates, "Probing for a better transport");
        self.probe_and_select(&candidates, ChangeReason::Upgrade).await;
    }

    fn publish(&self, change: TransportChange) {
        info!(
            from = %change.from,
            to = %change.to,
            reason = ?change.reason,
            endpoint = ?self.state.endpoint(change.to),
            "Active transport changed"
        );
        self.active_tx.send_replace(change.to);
        let _ = self.change_tx.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn ok(kind: TransportKind) -> TransportProbeResult {
        TransportProbeResult::reachable(kind, 5, format!("{}-peer:18790", kind))
    }

    fn fail(kind: TransportKind) -> TransportProbeResult {
        TransportProbeResult::unreachable(kind)
    }

    #[test]
    fn test_cloud_only_selects_cloud() {
        let mut state = SelectorState::new(3);
        let fast = [TransportKind::Direct, TransportKind::LocalNetwork, TransportKind::VpnOverlay];
        for kind in fast {
            state.apply_probe(&fail(kind));
        }
        assert_eq!(state.select(), TransportKind::CloudRelay);
        assert_eq!(state.available(), vec![TransportKind::CloudRelay]);
        assert_eq!(state.reselect(ChangeReason::Initial), None);
    }

    #[test]
    fn test_lowest_rank_wins() {
        let mut state = SelectorState::new(3);
        state.apply_probe(&ok(TransportKind::LocalNetwork));
        state.apply_probe(&fail(TransportKind::Direct));
        state.apply_probe(&ok(TransportKind::VpnOverlay));

        assert_eq!(state.select(), TransportKind::LocalNetwork);
        assert_eq!(
            state.reselect(ChangeReason::Initial),
            Some(TransportChange {
                from: TransportKind::CloudRelay,
                to: TransportKind::LocalNetwork,
                reason: ChangeReason::Initial,
            })
        );
        assert_eq!(state.endpoint(TransportKind::LocalNetwork), Some("local_network-peer:18790"));
    }

    #[test]
    fn test_failover_after_threshold() {
        let mut state = SelectorState::new(3);
        state.apply_probe(&ok(TransportKind::LocalNetwork));
        state.apply_probe(&ok(TransportKind::VpnOverlay));
        state.reselect(ChangeReason::Initial);

        assert_eq!(state.record_health(&ok(TransportKind::LocalNetwork)), None);
        assert_eq!(state.state(TransportKind::LocalNetwork), TransportState::Healthy);

        assert_eq!(state.record_health(&fail(TransportKind::LocalNetwork)), None);
        assert_eq!(state.record_health(&fail(TransportKind::LocalNetwork)), None);
        assert_eq!(state.state(TransportKind::LocalNetwork), TransportState::Degraded);
        assert_eq!(state.active(), TransportKind::LocalNetwork);

        let change = state.record_health(&fail(TransportKind::LocalNetwork)).unwrap();
        assert_eq!(change.to, TransportKind::VpnOverlay);
        assert_eq!(change.reason, ChangeReason::Failover);
        assert!(!state.available().contains(&TransportKind::LocalNetwork));
        assert_eq!(state.endpoint(TransportKind::LocalNetwork), None);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut state = SelectorState::new(3);
        state.apply_probe(&ok(TransportKind::Direct));
        state.reselect(ChangeReason::Initial);

        for _ in 0..5 {
            state.record_health(&fail(TransportKind::Direct));
            state.record_health(&fail(TransportKind::Direct));
            state.record_health(&ok(TransportKind::Direct));
        }
        assert_eq!(state.active(), TransportKind::Direct);

        let health = state.snapshot().health;
        let direct = health.iter().find(|h| h.transport == TransportKind::Direct).unwrap();
        assert_eq!(direct.consecutive_failures, 0);
        assert!(direct.healthy);
        assert_eq!(direct.average_latency_ms, Some(5.0));
    }

    #[test]
    fn test_failed_upgrade_probe_keeps_active() {
        let mut state = SelectorState::new(3);
        state.apply_probe(&ok(TransportKind::VpnOverlay));
        state.reselect(ChangeReason::Initial);

        state.apply_probe(&fail(TransportKind::Direct));
        state.apply_probe(&fail(TransportKind::LocalNetwork));
        assert_eq!(state.reselect(ChangeReason::Upgrade), None);

        state.apply_probe(&ok(TransportKind::Direct));
        assert_eq!(
            state.reselect(ChangeReason::Upgrade).map(|c| c.to),
            Some(TransportKind::Direct)
        );
    }

    /// Prober whose answers the test flips at will.
    #[derive(Default)]
    struct ScriptedProber {
        reachable: Mutex<HashSet<TransportKind>>,
        probes: Mutex<Vec<TransportKind>>,
    }

    impl ScriptedProber {
        fn set(&self, kind: TransportKind, up: bool) {
            let mut reachable = self.reachable.lock();
            if up {
                reachable.insert(kind);
            } else {
                reachable.remove(&kind);
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, kind: TransportKind) -> TransportProbeResult {
            self.probes.lock().push(kind);
            if !kind.requires_probe() {
                return TransportProbeResult::cloud_relay();
            }
            if self.reachable.lock().contains(&kind) {
                ok(kind)
            } else {
                fail(kind)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_fails_over_and_upgrades() {
        let prober = Arc::new(ScriptedProber::default());
        prober.set(TransportKind::LocalNetwork, true);

        let handle = TransportSelector::spawn(prober.clone(), &TransportSettings::default());

        let snapshot = handle.snapshot().await.unwrap();
        let mut changes = handle.changes();
        assert_eq!(snapshot.active, TransportKind::LocalNetwork);
        assert_eq!(handle.active(), TransportKind::LocalNetwork);
        assert_eq!(
            snapshot.available(),
            vec![TransportKind::LocalNetwork, TransportKind::CloudRelay]
        );

        // Three health ticks at 15 s, 30 s, 45 s all fail.
        prober.set(TransportKind::LocalNetwork, false);
        tokio::time::sleep(Duration::from_secs(46)).await;

        let failover = changes.recv().await.unwrap();
        assert_eq!(failover.from, TransportKind::LocalNetwork);
        assert_eq!(failover.to, TransportKind::CloudRelay);
        assert_eq!(failover.reason, ChangeReason::Failover);
        assert_eq!(handle.active(), TransportKind::CloudRelay);

        // The upgrade tick at 60 s finds the LAN peer again.
        prober.set(TransportKind::LocalNetwork, true);
        tokio::time::sleep(Duration::from_secs(15)).await;

        let upgrade = changes.recv().await.unwrap();
        assert_eq!(upgrade.to, TransportKind::LocalNetwork);
        assert_eq!(upgrade.reason, ChangeReason::Upgrade);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_is_not_health_checked() {
        let prober = Arc::new(ScriptedProber::default());
        let handle = TransportSelector::spawn(prober.clone(), &TransportSettings::default());

        assert_eq!(handle.snapshot().await.unwrap().active, TransportKind::CloudRelay);
        let after_start = prober.probes.lock().len();

        tokio::time::sleep(Duration::from_secs(50)).await;
        handle.snapshot().await.unwrap();
        assert_eq!(prober.probes.lock().len(), after_start);

        assert_eq!(handle.probe_now().await.unwrap(), TransportKind::CloudRelay);
    }
}
