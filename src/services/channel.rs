//! Acquisition channel - one acceptor line, its decoder, and its running total
//!
//! Pulses flow from the edge callback through a bounded queue into a single
//! finalizer task that owns the decoder. The finalizer is the only producer
//! of credits; the ledger lock is held just long enough to add a value.
//!
//! The ledger also knows whether a session is currently open and when it
//! opened. A credit belongs to a session only if its first pulse arrived
//! after that session opened. Anything else (a bill still in its quiet period
//! when the session stopped or restarted, a coin dropped between customers)
//! is kept as an unattributed credit for the operator instead of being added
//! to a total.

use crate::domain::types::{
    ChannelKind, Denomination, DenominationTable, PulseEvent, UnattributedCredit,
};
use crate::hal::gpio::{GpioRegistry, HalError, Pin};
use crate::infra::config::{Config, DecoderPolicy};
use crate::infra::metrics::Metrics;
use crate::services::decoder::{
    BurstCountDecoder, DenominationDecoder, DirectEdgeDecoder, Resolution,
};
use crate::services::pulse_line::PulseLine;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long the finalizer sleeps when no burst is open
const IDLE_WAKE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("hardware: {0}")]
    Hal(#[from] HalError),
    #[error("{0} channel uses burst counting but its denomination table is empty")]
    EmptyTable(ChannelKind),
    #[error("armed denomination must be positive, got {0}")]
    InvalidArmedValue(Decimal),
    #[error("{0} channel does not use direct-edge decoding")]
    NotDirectEdge(ChannelKind),
}

/// Everything needed to bring up one channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub pin: Pin,
    pub policy: DecoderPolicy,
    pub debounce: Duration,
    pub quiet_period: Duration,
    pub max_burst: Duration,
    pub table: DenominationTable,
    /// Initial armed denomination (direct-edge only)
    pub armed: Option<Denomination>,
    pub queue_capacity: usize,
}

impl ChannelConfig {
    pub fn coin(config: &Config) -> Self {
        let table = config.coin_table().clone();
        let value = config.coin_armed_value();
        let armed = table
            .pulses_for(value)
            .and_then(|pulses| table.lookup(pulses))
            .cloned()
            .unwrap_or_else(|| Denomination::new(value, format!("{value} coin")));

        Self {
            kind: ChannelKind::Coin,
            pin: Pin(config.coin_pin()),
            policy: config.coin_policy(),
            debounce: Duration::from_millis(config.coin_debounce_ms()),
            quiet_period: Duration::from_millis(config.coin_quiet_period_ms()),
            max_burst: Duration::from_millis(config.coin_max_burst_ms()),
            table,
            armed: Some(armed),
            queue_capacity: config.pulse_queue_capacity(),
        }
    }

    /// Bill validators only speak pulse counts
    pub fn bill(config: &Config) -> Self {
        Self {
            kind: ChannelKind::Bill,
            pin: Pin(config.bill_pin()),
            policy: DecoderPolicy::BurstCount,
            debounce: Duration::from_millis(config.bill_debounce_ms()),
            quiet_period: Duration::from_millis(config.bill_quiet_period_ms()),
            max_burst: Duration::from_millis(config.bill_max_burst_ms()),
            table: config.bill_table().clone(),
            armed: None,
            queue_capacity: config.pulse_queue_capacity(),
        }
    }
}

#[derive(Default)]
struct LedgerState {
    received: Decimal,
    accepting: bool,
    opened_at: Option<Instant>,
    unattributed: Vec<UnattributedCredit>,
}

/// Session total for one channel
struct Ledger {
    kind: ChannelKind,
    state: Mutex<LedgerState>,
    metrics: Arc<Metrics>,
}

impl Ledger {
    fn new(kind: ChannelKind, metrics: Arc<Metrics>) -> Self {
        Self { kind, state: Mutex::new(LedgerState::default()), metrics }
    }

    /// Sole credit path. Returns the new total, or None if the credit was
    /// set aside as unattributed.
    fn on_resolved(&self, denomination: &Denomination, started: Instant) -> Option<Decimal> {
        let mut state = self.state.lock();
        let owned = state.accepting && state.opened_at.is_some_and(|opened| started >= opened);
        if owned {
            state.received += denomination.value;
            Some(state.received)
        } else {
            state.unattributed.push(UnattributedCredit {
                channel: self.kind,
                denomination: denomination.clone(),
                recorded_at: chrono::Utc::now(),
            });
            None
        }
    }

    fn apply(&self, resolution: Resolution) {
        match resolution {
            Resolution::Credit { denomination, pulses, started, last_pulse } => {
                let finalize_ms = last_pulse.elapsed().as_millis() as u64;
                match self.on_resolved(&denomination, started) {
                    Some(total) => {
                        self.metrics.record_credit(denomination.value, finalize_ms);
                        info!(
                            channel = %self.kind,
                            denomination = %denomination.label,
                            value = %denomination.value,
                            pulses = %pulses,
                            total = %total,
                            finalize_ms = %finalize_ms,
                            "burst_resolved"
                        );
                    }
                    None => {
                        self.metrics.record_unattributed();
                        warn!(
                            channel = %self.kind,
                            denomination = %denomination.label,
                            value = %denomination.value,
                            "unattributed_credit"
                        );
                    }
                }
            }
            Resolution::Noise { pulses, reason } => {
                self.metrics.record_noise_burst();
                debug!(channel = %self.kind, pulses = %pulses, reason = %reason.as_str(), "burst_noise");
            }
        }
    }
}

pub struct AcquisitionChannel {
    kind: ChannelKind,
    policy: DecoderPolicy,
    line: PulseLine,
    ledger: Arc<Ledger>,
    armed: Option<watch::Sender<Denomination>>,
    shutdown_tx: watch::Sender<bool>,
    finalizer: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionChannel {
    /// Arm the line and start the finalizer task. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        config: ChannelConfig,
        registry: GpioRegistry,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ChannelError> {
        let (decoder, armed): (Box<dyn DenominationDecoder>, _) = match config.policy {
            DecoderPolicy::DirectEdge => {
                let initial = config
                    .armed
                    .clone()
                    .unwrap_or_else(|| Denomination::new(Decimal::ONE, "1 coin"));
                if initial.value <= Decimal::ZERO {
                    return Err(ChannelError::InvalidArmedValue(initial.value));
                }
                let (tx, rx) = watch::channel(initial);
                (Box::new(DirectEdgeDecoder::new(rx)), Some(tx))
            }
            DecoderPolicy::BurstCount => {
                if config.table.is_empty() {
                    return Err(ChannelError::EmptyTable(config.kind));
                }
                let decoder =
                    BurstCountDecoder::new(config.table.clone(), config.quiet_period, config.max_burst);
                (Box::new(decoder), None)
            }
        };

        let ledger = Arc::new(Ledger::new(config.kind, metrics.clone()));
        let line = PulseLine::new(registry, config.kind, config.pin, config.debounce);
        let (pulse_tx, pulse_rx) = mpsc::channel(config.queue_capacity.max(1));
        line.arm(pulse_tx, metrics)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let finalizer = tokio::spawn(run_finalizer(
            config.kind,
            decoder,
            pulse_rx,
            ledger.clone(),
            shutdown_rx,
        ));

        info!(
            channel = %config.kind,
            pin = %config.pin,
            policy = %config.policy.as_str(),
            quiet_period_ms = %config.quiet_period.as_millis(),
            "channel_started"
        );

        Ok(Self {
            kind: config.kind,
            policy: config.policy,
            line,
            ledger,
            armed,
            shutdown_tx,
            finalizer: Mutex::new(Some(finalizer)),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn policy(&self) -> DecoderPolicy {
        self.policy
    }

    pub fn pin(&self) -> Pin {
        self.line.pin()
    }

    /// Money credited since the last reset
    pub fn current_amount(&self) -> Decimal {
        self.ledger.state.lock().received
    }

    pub fn reset(&self) {
        self.ledger.state.lock().received = Decimal::ZERO;
    }

    /// Reset and start attributing credits. Bursts already under way belong
    /// to no one and end up unattributed.
    pub fn open(&self) {
        let mut state = self.ledger.state.lock();
        state.received = Decimal::ZERO;
        state.accepting = true;
        state.opened_at = Some(Instant::now());
    }

    /// Stop attributing credits; returns the captured total and resets it
    pub fn close(&self) -> Decimal {
        let mut state = self.ledger.state.lock();
        state.accepting = false;
        std::mem::take(&mut state.received)
    }

    pub fn is_open(&self) -> bool {
        self.ledger.state.lock().accepting
    }

    /// Set the value credited per edge on a direct-edge line
    pub fn arm_denomination(&self, denomination: Denomination) -> Result<(), ChannelError> {
        let Some(ref armed) = self.armed else {
            return Err(ChannelError::NotDirectEdge(self.kind));
        };
        if denomination.value <= Decimal::ZERO {
            return Err(ChannelError::InvalidArmedValue(denomination.value));
        }
        info!(channel = %self.kind, denomination = %denomination.label, value = %denomination.value, "denomination_armed");
        armed.send_replace(denomination);
        Ok(())
    }

    /// Drain credits that arrived while the channel was closed
    pub fn take_unattributed(&self) -> Vec<UnattributedCredit> {
        std::mem::take(&mut self.ledger.state.lock().unattributed)
    }

    /// Edges swallowed by the debounce window
    pub fn suppressed_pulses(&self) -> u64 {
        self.line.suppressed()
    }

    /// Disarm the line, let the finalizer resolve what it already has, and
    /// wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.line.disarm();
        let _ = self.shutdown_tx.send(true);

        let handle = self.finalizer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(channel = %self.kind, error = %e, "finalizer_join_failed");
            }
            info!(channel = %self.kind, "channel_stopped");
        }
    }
}

impl Drop for AcquisitionChannel {
    fn drop(&mut self) {
        self.line.disarm();
    }
}

async fn run_finalizer(
    kind: ChannelKind,
    mut decoder: Box<dyn DenominationDecoder>,
    mut pulse_rx: mpsc::Receiver<PulseEvent>,
    ledger: Arc<Ledger>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(channel = %kind, policy = %decoder.policy().as_str(), "finalizer_started");

    loop {
        let wake_at = decoder.deadline();
        let sleep_target = wake_at.unwrap_or_else(|| Instant::now() + IDLE_WAKE);

        tokio::select! {
            biased;
            maybe_pulse = pulse_rx.recv() => {
                match maybe_pulse {
                    Some(pulse) => {
                        if let Some(resolution) = decoder.on_pulse(pulse.at) {
                            ledger.apply(resolution);
                        }
                    }
                    // Line disarmed and queue drained
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(sleep_target), if wake_at.is_some() => {
                if let Some(resolution) = decoder.on_deadline(Instant::now()) {
                    ledger.apply(resolution);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(pulse) = pulse_rx.try_recv() {
                        if let Some(resolution) = decoder.on_pulse(pulse.at) {
                            ledger.apply(resolution);
                        }
                    }
                    break;
                }
            }
        }
    }

    if let Some(resolution) = decoder.flush() {
        ledger.apply(resolution);
    }
    debug!(channel = %kind, "finalizer_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{self, PulseInjector};
    use rust_decimal_macros::dec;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn coin_config(policy: DecoderPolicy) -> ChannelConfig {
        ChannelConfig::coin(&Config::default().with_coin_policy(policy))
    }

    fn start(config: ChannelConfig) -> (AcquisitionChannel, PulseInjector, Arc<Metrics>) {
        let (registry, injector) = sim::simulated();
        let metrics = Arc::new(Metrics::new());
        let channel = AcquisitionChannel::spawn(config, registry, metrics.clone()).unwrap();
        (channel, injector, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_edge_credits_each_pulse() {
        let (channel, injector, _) = start(coin_config(DecoderPolicy::DirectEdge));
        channel.open();
        channel.arm_denomination(Denomination::new(dec!(5), "5 Peso Coin")).unwrap();

        injector.inject_burst(channel.pin(), 4, ms(100)).await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(channel.current_amount(), dec!(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_visible_only_after_quiet_period() {
        let (channel, injector, _) = start(coin_config(DecoderPolicy::BurstCount));
        channel.open();

        injector.inject_burst(channel.pin(), 3, ms(100)).await.unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(channel.current_amount(), dec!(0));

        tokio::time::sleep(ms(450)).await;
        assert_eq!(channel.current_amount(), dec!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmapped_burst_leaves_total_unchanged() {
        let (channel, injector, metrics) = start(coin_config(DecoderPolicy::BurstCount));
        channel.open();

        injector.inject_burst(channel.pin(), 1, ms(100)).await.unwrap();
        tokio::time::sleep(ms(600)).await;
        injector.inject_burst(channel.pin(), 8, ms(100)).await.unwrap();
        tokio::time::sleep(ms(600)).await;

        assert_eq!(channel.current_amount(), dec!(1));
        assert_eq!(metrics.noise_bursts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_pulses_coalesced_by_debounce() {
        let (channel, injector, _) = start(coin_config(DecoderPolicy::DirectEdge));
        channel.open();

        let handles: Vec<_> =
            (0..50).map(|i| injector.inject_pulse(channel.pin(), Some(ms(i * 10)))).collect();
        for handle in handles {
            handle.await.unwrap();
        }
        tokio::time::sleep(ms(10)).await;

        // Accepted at 0, 50, ..., 450 ms
        assert_eq!(channel.current_amount(), dec!(10));
        assert_eq!(channel.suppressed_pulses(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_records_unattributed() {
        let (channel, injector, metrics) = start(coin_config(DecoderPolicy::BurstCount));
        channel.open();
        injector.inject_burst(channel.pin(), 3, ms(100)).await.unwrap();

        // Session closes while the burst is still in its quiet period
        assert_eq!(channel.close(), dec!(0));
        tokio::time::sleep(ms(600)).await;

        assert_eq!(channel.current_amount(), dec!(0));
        let orphans = channel.take_unattributed();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].denomination.value, dec!(5));
        assert_eq!(metrics.unattributed_total(), 1);
        assert!(channel.take_unattributed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_started_before_reopen_is_unattributed() {
        let (channel, injector, metrics) = start(coin_config(DecoderPolicy::BurstCount));
        channel.open();
        injector.inject_burst(channel.pin(), 3, ms(100)).await.unwrap();

        // Reopened inside the quiet period
        channel.open();
        tokio::time::sleep(ms(600)).await;

        assert!(channel.is_open());
        assert_eq!(channel.current_amount(), dec!(0));
        let orphans = channel.take_unattributed();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].denomination.value, dec!(5));

        // A burst that starts after the reopen is credited normally
        injector.inject_burst(channel.pin(), 2, ms(100)).await.unwrap();
        tokio::time::sleep(ms(600)).await;
        assert_eq!(channel.current_amount(), dec!(1));
        assert_eq!(metrics.unattributed_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattributed_credit_not_counted_as_credited() {
        let (channel, injector, metrics) = start(coin_config(DecoderPolicy::BurstCount));
        injector.inject_burst(channel.pin(), 4, ms(100)).await.unwrap();
        tokio::time::sleep(ms(600)).await;

        assert_eq!(metrics.unattributed_total(), 1);
        assert_eq!(metrics.credits_total(), 0);
        assert_eq!(metrics.report().credited, dec!(0));

        channel.open();
        injector.inject_burst(channel.pin(), 4, ms(100)).await.unwrap();
        tokio::time::sleep(ms(600)).await;

        assert_eq!(metrics.credits_total(), 1);
        assert_eq!(metrics.report().credited, dec!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_captures_and_resets() {
        let (channel, injector, _) = start(coin_config(DecoderPolicy::DirectEdge));
        channel.open();
        injector.inject_burst(channel.pin(), 3, ms(100)).await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(channel.close(), dec!(3));
        assert_eq!(channel.current_amount(), dec!(0));
        assert!(!channel.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_burst() {
        let (channel, injector, _) = start(coin_config(DecoderPolicy::BurstCount));
        channel.open();
        injector.inject_burst(channel.pin(), 4, ms(100)).await.unwrap();

        channel.shutdown().await;
        assert_eq!(channel.current_amount(), dec!(5));
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_arm_denomination_rejected_on_burst_channel() {
        let (channel, _, _) = start(coin_config(DecoderPolicy::BurstCount));
        let err = channel.arm_denomination(Denomination::new(dec!(5), "5")).unwrap_err();
        assert_eq!(err, ChannelError::NotDirectEdge(ChannelKind::Coin));
    }

    #[tokio::test]
    async fn test_empty_table_rejected() {
        let (registry, _) = sim::simulated();
        let mut config = coin_config(DecoderPolicy::BurstCount);
        config.table = DenominationTable::default();
        let result = AcquisitionChannel::spawn(config, registry, Arc::new(Metrics::new()));
        assert!(matches!(result, Err(ChannelError::EmptyTable(ChannelKind::Coin))));
    }
}
