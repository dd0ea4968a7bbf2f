//! Change dispenser - coin hoppers driven by a motor output and counted by a
//! chute sensor
//!
//! One dispense runs at a time. For each hopper in the plan the sensor count
//! is reset, the motor is switched on, and the count is polled until it
//! reaches the target, the timeout passes, or the caller cancels. The motor is
//! held through a `MotorGuard`, so it goes off on every exit path: early
//! return, error, panic, or the future being dropped mid-wait.

use crate::domain::types::{ChangeResult, Denomination};
use crate::hal::gpio::{Edge, EdgeCallback, GpioRegistry, HalError, Level, Pin, Pull};
use crate::infra::config::{Config, SensorLevel};
use crate::infra::metrics::Metrics;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispenserError {
    #[error("no hopper units configured")]
    NoHoppers,
    #[error("hopper denomination must be positive, got {0}")]
    InvalidDenomination(Decimal),
    #[error("more than one hopper dispenses {0}")]
    DuplicateDenomination(Decimal),
    #[error("hardware: {0}")]
    Hal(#[from] HalError),
}

/// One motor/sensor pair and the coin it holds
#[derive(Debug, Clone)]
pub struct HopperUnit {
    pub denomination: Denomination,
    pub motor: Pin,
    pub sensor: Pin,
}

#[derive(Debug, Clone)]
pub struct DispenserConfig {
    pub units: Vec<HopperUnit>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Sensor level while a coin is in the chute
    pub coin_present: Level,
}

impl DispenserConfig {
    pub fn from_config(config: &Config) -> Self {
        let units = config
            .hopper_units()
            .iter()
            .map(|unit| HopperUnit {
                denomination: Denomination::new(
                    unit.value,
                    unit.label.clone().unwrap_or_else(|| format!("{} coin", unit.value)),
                ),
                motor: Pin(unit.motor_pin),
                sensor: Pin(unit.sensor_pin),
            })
            .collect();

        Self {
            units,
            timeout: Duration::from_secs(config.hopper_timeout_secs()),
            poll_interval: Duration::from_millis(config.hopper_poll_interval_ms()),
            coin_present: match config.hopper_coin_present() {
                SensorLevel::High => Level::High,
                SensorLevel::Low => Level::Low,
            },
        }
    }
}

/// Greedy split of an amount over the hopper set, largest coin first
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    /// One entry per hopper, zero counts included
    pub parts: SmallVec<[(Denomination, u32); 4]>,
    /// What the hoppers cannot represent
    pub remainder: Decimal,
}

impl Decomposition {
    pub fn count_for(&self, value: Decimal) -> u32 {
        self.parts.iter().find(|(d, _)| d.value == value).map(|(_, n)| *n).unwrap_or(0)
    }

    pub fn total(&self) -> Decimal {
        self.parts.iter().map(|(d, n)| d.value * Decimal::from(*n)).sum()
    }
}

/// Reported each time a hopper's sensor count moves
#[derive(Debug, Clone)]
pub struct DispenseProgress {
    pub denomination: Denomination,
    pub coins: u32,
    pub target: u32,
    /// Total paid out so far across all hoppers
    pub dispensed_amount: Decimal,
}

impl std::fmt::Display for DispenseProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}/{} (total {})",
            self.denomination.label, self.coins, self.target, self.dispensed_amount
        )
    }
}

/// Point-in-time view of one hopper
#[derive(Debug, Clone, PartialEq)]
pub struct HopperSnapshot {
    pub denomination: Denomination,
    pub motor_on: bool,
    pub sensor_count: u32,
    /// None if the sensor pin could not be read
    pub last_sensor_level: Option<Level>,
}

struct Hopper {
    denomination: Denomination,
    motor: Pin,
    sensor: Pin,
    count: Arc<AtomicU32>,
}

/// Motor held on for the lifetime of the guard
struct MotorGuard<'a> {
    registry: &'a GpioRegistry,
    pin: Pin,
    engaged: bool,
}

impl<'a> MotorGuard<'a> {
    fn engage(registry: &'a GpioRegistry, pin: Pin) -> Result<Self, HalError> {
        if let Err(e) = registry.write(pin, Level::High) {
            force_off(registry, pin);
            return Err(e);
        }
        debug!(motor = %pin, "motor_on");
        Ok(Self { registry, pin, engaged: true })
    }

    /// Switch off and surface the write result
    fn release(mut self) -> Result<(), HalError> {
        self.engaged = false;
        self.registry.write(self.pin, Level::Low)?;
        debug!(motor = %self.pin, "motor_off");
        Ok(())
    }
}

impl Drop for MotorGuard<'_> {
    fn drop(&mut self) {
        if self.engaged {
            force_off(self.registry, self.pin);
        }
    }
}

fn force_off(registry: &GpioRegistry, pin: Pin) {
    match registry.write(pin, Level::Low) {
        Ok(()) => debug!(motor = %pin, "motor_off"),
        Err(e) => error!(motor = %pin, error = %e, "motor_off_failed"),
    }
}

enum Stop {
    Timeout,
    Cancelled,
    Hal(HalError),
}

pub struct ChangeDispenser {
    hoppers: Vec<Hopper>,
    registry: GpioRegistry,
    timeout: Duration,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
    exclusive: tokio::sync::Mutex<()>,
    released: AtomicBool,
}

impl ChangeDispenser {
    /// Configure every motor off and register the sensor counters. On failure
    /// whatever was already registered is released again.
    pub fn new(
        config: DispenserConfig,
        registry: GpioRegistry,
        metrics: Arc<Metrics>,
    ) -> Result<Self, DispenserError> {
        if config.units.is_empty() {
            return Err(DispenserError::NoHoppers);
        }
        let mut units = config.units;
        for unit in &units {
            if unit.denomination.value <= Decimal::ZERO {
                return Err(DispenserError::InvalidDenomination(unit.denomination.value));
            }
        }
        units.sort_by(|a, b| b.denomination.value.cmp(&a.denomination.value));
        if let Some(pair) = units.windows(2).find(|w| w[0].denomination.value == w[1].denomination.value) {
            return Err(DispenserError::DuplicateDenomination(pair[0].denomination.value));
        }
        if !is_divisor_chain(&units) {
            warn!(
                denominations = ?units.iter().map(|u| u.denomination.value).collect::<Vec<_>>(),
                "hopper_denominations_not_divisor_chain"
            );
        }

        let mut hoppers: Vec<Hopper> = Vec::with_capacity(units.len());
        for unit in units {
            match register_hopper(&registry, unit, config.coin_present) {
                Ok(hopper) => hoppers.push(hopper),
                Err(e) => {
                    release_hoppers(&registry, &hoppers);
                    return Err(e.into());
                }
            }
        }

        info!(
            hoppers = %hoppers.len(),
            timeout_secs = %config.timeout.as_secs(),
            coin_present = %config.coin_present.as_str(),
            "dispenser_ready"
        );

        Ok(Self {
            hoppers,
            registry,
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            metrics,
            exclusive: tokio::sync::Mutex::new(()),
            released: AtomicBool::new(false),
        })
    }

    pub fn is_available(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    /// Hopper denominations, largest first
    pub fn denominations(&self) -> Vec<Denomination> {
        self.hoppers.iter().map(|h| h.denomination.clone()).collect()
    }

    pub fn compute_decomposition(&self, amount: Decimal) -> Decomposition {
        let mut rest = amount.max(Decimal::ZERO);
        let mut parts = SmallVec::new();
        for hopper in &self.hoppers {
            let value = hopper.denomination.value;
            let count = (rest / value).trunc().to_u32().unwrap_or(u32::MAX);
            rest -= value * Decimal::from(count);
            parts.push((hopper.denomination.clone(), count));
        }
        Decomposition { parts, remainder: rest }
    }

    pub fn hopper_state(&self, value: Decimal) -> Option<HopperSnapshot> {
        let hopper = self.hoppers.iter().find(|h| h.denomination.value == value)?;
        Some(HopperSnapshot {
            denomination: hopper.denomination.clone(),
            motor_on: self.registry.read(hopper.motor) == Ok(Level::High),
            sensor_count: hopper.count.load(Ordering::Acquire),
            last_sensor_level: self.registry.read(hopper.sensor).ok(),
        })
    }

    /// Pay out `amount`. Waits for any dispense already in progress.
    pub async fn dispense<P>(&self, amount: Decimal, progress: P) -> ChangeResult
    where
        P: FnMut(&DispenseProgress),
    {
        let (_never, cancel) = watch::channel(false);
        self.dispense_until(amount, progress, cancel).await
    }

    /// Like `dispense`, but stops with a "cancelled" result once `cancel`
    /// turns true
    pub async fn dispense_until<P>(
        &self,
        amount: Decimal,
        mut progress: P,
        cancel: watch::Receiver<bool>,
    ) -> ChangeResult
    where
        P: FnMut(&DispenseProgress),
    {
        if amount <= Decimal::ZERO {
            return ChangeResult::nothing_due(amount.max(Decimal::ZERO));
        }
        if !self.is_available() {
            return ChangeResult::unavailable(amount);
        }

        let _exclusive = self.exclusive.lock().await;
        let plan = self.compute_decomposition(amount);
        if !plan.remainder.is_zero() {
            warn!(amount = %amount, remainder = %plan.remainder, "change_not_representable");
        }
        info!(
            amount = %amount,
            plan = ?plan.parts.iter().map(|(d, n)| (d.value, *n)).collect::<Vec<_>>(),
            "dispense_started"
        );

        let mut dispensed = Decimal::ZERO;
        let mut coins_total = 0u64;
        for (hopper, (_, target)) in self.hoppers.iter().zip(plan.parts.iter()) {
            if *target == 0 {
                continue;
            }
            let (coins, stop) =
                self.run_hopper(hopper, *target, dispensed, &mut progress, &cancel).await;
            dispensed += hopper.denomination.value * Decimal::from(coins);
            coins_total += u64::from(coins);

            if let Some(stop) = stop {
                let detail = match stop {
                    Stop::Timeout => format!("timeout on {}", hopper.denomination.label),
                    Stop::Cancelled => "cancelled".to_string(),
                    Stop::Hal(e) => format!("error: {e}"),
                };
                return self.finish(ChangeResult::failed(amount, dispensed, detail), coins_total);
            }
        }

        let result = if plan.remainder.is_zero() {
            ChangeResult::dispensed(amount)
        } else {
            ChangeResult::failed(
                amount,
                dispensed,
                format!("cannot dispense remainder {}", plan.remainder),
            )
        };
        self.finish(result, coins_total)
    }

    fn finish(&self, result: ChangeResult, coins: u64) -> ChangeResult {
        self.metrics.record_dispense(result.success);
        self.metrics.record_coins_dispensed(coins);
        if result.success {
            info!(amount = %result.amount_due, coins = %coins, "change_dispensed");
        } else {
            warn!(
                amount_due = %result.amount_due,
                dispensed = %result.dispensed_amount,
                shortfall = %result.shortfall(),
                detail = %result.detail,
                "change_incomplete"
            );
        }
        result
    }

    /// Run one hopper until `target` coins are counted. Returns the coins
    /// paid out and why it stopped early, if it did.
    async fn run_hopper<P>(
        &self,
        hopper: &Hopper,
        target: u32,
        paid_before: Decimal,
        progress: &mut P,
        cancel: &watch::Receiver<bool>,
    ) -> (u32, Option<Stop>)
    where
        P: FnMut(&DispenseProgress),
    {
        hopper.count.store(0, Ordering::Release);
        let guard = match MotorGuard::engage(&self.registry, hopper.motor) {
            Ok(guard) => guard,
            Err(e) => {
                error!(hopper = %hopper.denomination.label, error = %e, "hopper_motor_fault");
                return (0, Some(Stop::Hal(e)));
            }
        };

        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reported = 0;

        let (coins, stop) = loop {
            ticker.tick().await;
            let counted = hopper.count.load(Ordering::Acquire);

            if counted != reported {
                reported = counted;
                progress(&DispenseProgress {
                    denomination: hopper.denomination.clone(),
                    coins: counted.min(target),
                    target,
                    dispensed_amount: paid_before
                        + hopper.denomination.value * Decimal::from(counted.min(target)),
                });
            }

            if counted >= target {
                if counted > target {
                    error!(
                        hopper = %hopper.denomination.label,
                        requested = %target,
                        counted = %counted,
                        "hopper_overcount"
                    );
                }
                break (target, None);
            }
            let cancelled = *cancel.borrow();
            if cancelled {
                info!(hopper = %hopper.denomination.label, coins = %counted, "dispense_cancelled");
                break (counted, Some(Stop::Cancelled));
            }
            if Instant::now() >= deadline {
                warn!(
                    hopper = %hopper.denomination.label,
                    coins = %counted,
                    target = %target,
                    timeout_secs = %self.timeout.as_secs(),
                    "hopper_timeout"
                );
                break (counted, Some(Stop::Timeout));
            }
        };

        if let Err(e) = guard.release() {
            error!(hopper = %hopper.denomination.label, error = %e, "hopper_motor_fault");
            return (coins, stop.or(Some(Stop::Hal(e))));
        }
        (coins, stop)
    }

    /// Force every motor off and drop the sensor callbacks. Idempotent.
    pub fn cleanup(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        release_hoppers(&self.registry, &self.hoppers);
        info!(hoppers = %self.hoppers.len(), "dispenser_released");
    }
}

impl Drop for ChangeDispenser {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_divisor_chain(units: &[HopperUnit]) -> bool {
    units
        .windows(2)
        .all(|w| (w[0].denomination.value % w[1].denomination.value).is_zero())
}

fn register_hopper(
    registry: &GpioRegistry,
    unit: HopperUnit,
    coin_present: Level,
) -> Result<Hopper, HalError> {
    if registry.is_registered(unit.sensor) {
        return Err(HalError::PinBusy(unit.sensor));
    }
    registry.setup_output(unit.motor, Level::Low)?;
    let pull = match coin_present {
        Level::High => Pull::Down,
        Level::Low => Pull::Up,
    };
    registry.setup_input(unit.sensor, pull)?;

    // Only transitions into the coin-present level count. No debounce: a
    // dropped edge here would lose a coin.
    let edge = match coin_present {
        Level::High => Edge::Rising,
        Level::Low => Edge::Falling,
    };
    let count = Arc::new(AtomicU32::new(0));
    let counter = count.clone();
    let callback: EdgeCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::AcqRel);
    });
    if let Err(e) = registry.add_event_detect(unit.sensor, edge, Duration::ZERO, callback) {
        force_off(registry, unit.motor);
        return Err(e);
    }

    debug!(
        hopper = %unit.denomination.label,
        motor = %unit.motor,
        sensor = %unit.sensor,
        "hopper_registered"
    );
    Ok(Hopper { denomination: unit.denomination, motor: unit.motor, sensor: unit.sensor, count })
}

fn release_hoppers(registry: &GpioRegistry, hoppers: &[Hopper]) {
    for hopper in hoppers {
        force_off(registry, hopper.motor);
        registry.remove_event_detect(hopper.sensor);
    }
}
