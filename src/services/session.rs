//! Payment session - one customer transaction over a set of channels
//!
//! The session owns its channels and an optional change dispenser. It does
//! not run a loop of its own: the caller polls at whatever rate its UI needs
//! and decides when to give up on a customer who stopped inserting money.

use crate::domain::types::{ChangeResult, ChannelKind, Settlement, UnattributedCredit};
use crate::hal::gpio::GpioRegistry;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::channel::{AcquisitionChannel, ChannelConfig, ChannelError};
use crate::services::dispenser::{ChangeDispenser, DispenseProgress, DispenserConfig};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    required: Decimal,
    id: Option<Uuid>,
}

/// What `stop` saw when it closed the session
struct Stopped {
    id: Option<Uuid>,
    required: Decimal,
    received: Option<Decimal>,
}

pub struct PaymentSession {
    channels: Vec<AcquisitionChannel>,
    dispenser: Option<ChangeDispenser>,
    metrics: Arc<Metrics>,
    state: Mutex<SessionState>,
    cleaned_up: AtomicBool,
}

impl PaymentSession {
    pub fn new(
        channels: Vec<AcquisitionChannel>,
        dispenser: Option<ChangeDispenser>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            channels,
            dispenser,
            metrics,
            state: Mutex::new(SessionState::default()),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Bring up every enabled channel and, if configured, the dispenser.
    /// A dispenser that fails to initialize leaves the session running
    /// without change support.
    pub fn from_config(
        config: &Config,
        registry: &GpioRegistry,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ChannelError> {
        let mut channels = Vec::with_capacity(2);
        if config.coin_enabled() {
            channels.push(AcquisitionChannel::spawn(
                ChannelConfig::coin(config),
                registry.clone(),
                metrics.clone(),
            )?);
        }
        if config.bill_enabled() {
            channels.push(AcquisitionChannel::spawn(
                ChannelConfig::bill(config),
                registry.clone(),
                metrics.clone(),
            )?);
        }

        let dispenser = if config.hopper_enabled() {
            match ChangeDispenser::new(
                DispenserConfig::from_config(config),
                registry.clone(),
                metrics.clone(),
            ) {
                Ok(dispenser) => Some(dispenser),
                Err(e) => {
                    warn!(error = %e, "dispenser_unavailable");
                    None
                }
            }
        } else {
            None
        };

        info!(
            site_id = %config.site_id(),
            channels = ?channels.iter().map(|c| c.kind().as_str()).collect::<Vec<_>>(),
            dispenser = %dispenser.is_some(),
            "payment_session_ready"
        );
        Ok(Self::new(channels, dispenser, metrics))
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&AcquisitionChannel> {
        self.channels.iter().find(|c| c.kind() == kind)
    }

    pub fn dispenser(&self) -> Option<&ChangeDispenser> {
        self.dispenser.as_ref()
    }

    /// Begin accepting money toward `required`. Starting while active
    /// discards the running total and begins afresh.
    pub fn start(&self, required: Decimal) {
        let mut state = self.state.lock();
        if state.active {
            let discarded = self.sum();
            warn!(
                session_id = ?state.id,
                discarded = %discarded,
                "session_restarted"
            );
        }
        for channel in &self.channels {
            channel.open();
        }
        let id = Uuid::now_v7();
        state.active = true;
        state.required = required;
        state.id = Some(id);
        drop(state);

        self.metrics.record_session_started();
        info!(session_id = %id, required = %required, "session_started");
    }

    /// Money received so far
    pub fn poll(&self) -> Decimal {
        self.sum()
    }

    fn sum(&self) -> Decimal {
        self.channels.iter().map(|c| c.current_amount()).sum()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_complete(&self) -> bool {
        let required = {
            let state = self.state.lock();
            if !state.active {
                return false;
            }
            state.required
        };
        self.poll() >= required
    }

    pub fn required_amount(&self) -> Decimal {
        self.state.lock().required
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.state.lock().id
    }

    /// End the session and return what was received. Returns zero when no
    /// session is active, so the total is reported exactly once.
    pub fn stop(&self) -> Decimal {
        self.stop_inner().received.unwrap_or(Decimal::ZERO)
    }

    /// Close the session and capture what it was under the same lock.
    /// `received` is None when no session was active.
    fn stop_inner(&self) -> Stopped {
        let mut state = self.state.lock();
        if !state.active {
            debug!("session_stop_without_start");
            return Stopped { id: state.id, required: state.required, received: None };
        }
        state.active = false;
        let total: Decimal = self.channels.iter().map(|c| c.close()).sum();
        info!(
            session_id = ?state.id,
            required = %state.required,
            received = %total,
            "session_stopped"
        );
        Stopped { id: state.id, required: state.required, received: Some(total) }
    }

    /// Stop, then pay out any change owed
    pub async fn stop_and_settle(&self) -> Settlement {
        let stopped = self.stop_inner();
        let (session_id, required) = (stopped.id, stopped.required);
        let was_active = stopped.received.is_some();
        let received = stopped.received.unwrap_or(Decimal::ZERO);

        let mut settlement = Settlement {
            session_id,
            required,
            received,
            change_due: Decimal::ZERO,
            change_dispensed: Decimal::ZERO,
            status: String::new(),
        };

        if !was_active {
            settlement.status = "no_session".to_string();
        } else if received < required {
            settlement.status = "incomplete".to_string();
            warn!(
                session_id = ?session_id,
                required = %required,
                received = %received,
                "payment_incomplete"
            );
        } else if received == required {
            settlement.status = "paid".to_string();
        } else {
            let change_due = received - required;
            let result = self
                .dispense_change(change_due, |p| {
                    debug!(session_id = ?session_id, progress = %p, "change_progress")
                })
                .await;
            settlement.change_due = change_due;
            settlement.change_dispensed = result.dispensed_amount;
            settlement.status = if result.success {
                "change_dispensed".to_string()
            } else if self.dispenser.is_none() {
                "change_unavailable".to_string()
            } else {
                "change_shortfall".to_string()
            };
        }

        info!(
            session_id = ?session_id,
            status = %settlement.status,
            received = %settlement.received,
            change_dispensed = %settlement.change_dispensed,
            owed_to_customer = %settlement.owed_to_customer(),
            "session_settled"
        );
        settlement
    }

    pub async fn dispense_change<P>(&self, amount: Decimal, progress: P) -> ChangeResult
    where
        P: FnMut(&DispenseProgress),
    {
        if amount <= Decimal::ZERO {
            return ChangeResult::nothing_due(amount.max(Decimal::ZERO));
        }
        match &self.dispenser {
            Some(dispenser) => dispenser.dispense(amount, progress).await,
            None => {
                warn!(amount = %amount, "change_dispenser_missing");
                ChangeResult::unavailable(amount)
            }
        }
    }

    /// Credits that resolved outside any session, across all channels
    pub fn take_unattributed(&self) -> Vec<UnattributedCredit> {
        self.channels.iter().flat_map(|c| c.take_unattributed()).collect()
    }

    /// Stop any active session, shut down every channel and release the
    /// hoppers. Safe to call more than once.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let received = self.stop();
        for channel in &self.channels {
            channel.shutdown().await;
        }
        if let Some(dispenser) = &self.dispenser {
            dispenser.cleanup();
        }

        let orphans = self.take_unattributed();
        for orphan in &orphans {
            warn!(
                channel = %orphan.channel,
                value = %orphan.denomination.value,
                recorded_at = %orphan.recorded_at.to_rfc3339(),
                "unattributed_credit_at_shutdown"
            );
        }
        info!(received = %received, unattributed = %orphans.len(), "payment_session_cleaned_up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::gpio::Pin;
    use crate::hal::sim;
    use crate::infra::config::{DecoderPolicy, HopperUnitConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn session() -> (PaymentSession, sim::PulseInjector) {
        let (registry, injector) = sim::simulated();
        let config = Config::default().with_coin_policy(DecoderPolicy::DirectEdge);
        let session =
            PaymentSession::from_config(&config, &registry, Arc::new(Metrics::new())).unwrap();
        (session, injector)
    }

    #[tokio::test]
    async fn test_stop_without_start_is_zero() {
        let (session, _) = session();
        assert_eq!(session.stop(), dec!(0));
        assert!(!session.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_discards_partial_total() {
        let (session, injector) = session();
        session.start(dec!(10));
        let first = session.session_id();

        injector.inject_burst(Pin(17), 3, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.poll(), dec!(3));

        session.start(dec!(10));
        assert_eq!(session.poll(), dec!(0));
        assert_ne!(session.session_id(), first);
    }

    #[tokio::test]
    async fn test_stop_reports_total_once() {
        let (session, _) = session();
        session.start(dec!(5));
        assert_eq!(session.stop(), dec!(0));
        assert_eq!(session.stop(), dec!(0));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_settle_incomplete_owes_everything_back() {
        let (session, _) = session();
        session.start(dec!(20));
        let settlement = session.stop_and_settle().await;
        assert_eq!(settlement.status, "incomplete");
        assert_eq!(settlement.owed_to_customer(), dec!(0));
    }

    #[tokio::test]
    async fn test_settle_after_stop_is_no_session() {
        let (session, _) = session();
        session.start(dec!(20));
        let id = session.session_id();
        session.stop();

        let settlement = session.stop_and_settle().await;
        assert_eq!(settlement.status, "no_session");
        assert_eq!(settlement.session_id, id);
        assert_eq!(settlement.received, dec!(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_stop_and_settle_agree() {
        let (session, injector) = session();
        let session = Arc::new(session);
        session
            .channel(ChannelKind::Coin)
            .unwrap()
            .arm_denomination(crate::domain::types::Denomination::new(dec!(3), "3 coin"))
            .unwrap();

        for _ in 0..20 {
            session.start(dec!(3));
            injector.inject_pulse(Pin(17), None).await.unwrap();
            for _ in 0..200 {
                if session.poll() >= dec!(3) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(session.poll(), dec!(3));

            let racer = {
                let session = session.clone();
                std::thread::spawn(move || session.stop())
            };
            let settlement = session.stop_and_settle().await;
            let stopped = racer.join().unwrap();

            // Exactly one side sees the money
            match settlement.status.as_str() {
                "paid" => assert_eq!(stopped, dec!(0)),
                "no_session" => assert_eq!(stopped, dec!(3)),
                other => panic!("unexpected settlement status {other}"),
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
    }

    #[tokio::test]
    async fn test_change_without_dispenser() {
        let session = PaymentSession::new(Vec::new(), None, Arc::new(Metrics::new()));

        let result = session.dispense_change(dec!(4), |_| {}).await;
        assert_eq!(result, ChangeResult::unavailable(dec!(4)));
        assert!(session.dispense_change(dec!(0), |_| {}).await.success);
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let (registry, _) = sim::simulated();
        let config = Config::default();
        let session =
            PaymentSession::from_config(&config, &registry, Arc::new(Metrics::new())).unwrap();
        session.start(dec!(1));

        session.cleanup().await;
        session.cleanup().await;

        assert!(!registry.is_registered(Pin(17)));
        assert!(!registry.is_registered(Pin(27)));
        assert!(!registry.is_registered(Pin(24)));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_dispenser_failure_leaves_session_usable() {
        let (registry, _) = sim::simulated();
        // Hopper sensor on the coin line's pin
        let config = Config::default().with_hopper_units(vec![
            HopperUnitConfig {
                value: dec!(1),
                label: None,
                motor_pin: 5,
                sensor_pin: 17,
            },
        ]);
        let session =
            PaymentSession::from_config(&config, &registry, Arc::new(Metrics::new())).unwrap();

        assert!(session.dispenser().is_none());
        assert!(session.channel(ChannelKind::Coin).is_some());
    }
}
