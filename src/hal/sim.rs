//! Software stand-in for kiosk GPIO
//!
//! `SimulatedGpio` keeps pin levels in memory. `PulseInjector` drives it the
//! way the acceptors and hoppers would: level changes are reported through
//! the registry, and injected pulses are delivered from a spawned task so the
//! callback never runs on the caller's context.

use super::gpio::{GpioBackend, GpioRegistry, HalError, Level, Pin, Pull};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy)]
struct SimPin {
    mode: Mode,
    level: Level,
}

#[derive(Default)]
struct SimState {
    pins: FxHashMap<Pin, SimPin>,
    failing_writes: FxHashSet<Pin>,
}

/// In-memory GPIO backend
#[derive(Default)]
pub struct SimulatedGpio {
    state: Mutex<SimState>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of any configured pin
    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.state.lock().pins.get(&pin).map(|p| p.level)
    }

    /// Make every write to `pin` fail until cleared
    pub fn set_write_failure(&self, pin: Pin, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_writes.insert(pin);
        } else {
            state.failing_writes.remove(&pin);
        }
    }

    /// Drive an input pin. Returns the previous level, or None if the pin
    /// is not configured as an input.
    fn drive_input(&self, pin: Pin, level: Level) -> Option<Level> {
        let mut state = self.state.lock();
        let p = state.pins.get_mut(&pin).filter(|p| p.mode == Mode::Input)?;
        let previous = p.level;
        p.level = level;
        Some(previous)
    }
}

impl GpioBackend for SimulatedGpio {
    fn setup_input(&self, pin: Pin, pull: Pull) -> Result<(), HalError> {
        let level = match pull {
            Pull::Up => Level::High,
            Pull::Down | Pull::Off => Level::Low,
        };
        self.state.lock().pins.insert(pin, SimPin { mode: Mode::Input, level });
        Ok(())
    }

    fn setup_output(&self, pin: Pin, initial: Level) -> Result<(), HalError> {
        self.state.lock().pins.insert(pin, SimPin { mode: Mode::Output, level: initial });
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, HalError> {
        self.state
            .lock()
            .pins
            .get(&pin)
            .map(|p| p.level)
            .ok_or(HalError::NotConfigured { pin, expected: "input" })
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.failing_writes.contains(&pin) {
            return Err(HalError::WriteFailed { pin, reason: "simulated driver fault".to_string() });
        }
        match state.pins.get_mut(&pin) {
            Some(p) if p.mode == Mode::Output => {
                p.level = level;
                Ok(())
            }
            _ => Err(HalError::NotConfigured { pin, expected: "output" }),
        }
    }
}

/// Simulated hopper behaviour
#[derive(Debug, Clone, Copy)]
pub struct SimHopperConfig {
    /// Time between coins while the motor runs
    pub coin_interval: Duration,
    /// Coins left in the hopper; None means unlimited
    pub stock: Option<u32>,
    /// Sensor level while a coin passes
    pub coin_present: Level,
}

impl Default for SimHopperConfig {
    fn default() -> Self {
        Self { coin_interval: Duration::from_millis(200), stock: None, coin_present: Level::High }
    }
}

/// Test and demo driver for a `SimulatedGpio`
#[derive(Clone)]
pub struct PulseInjector {
    registry: GpioRegistry,
    gpio: Arc<SimulatedGpio>,
}

impl PulseInjector {
    pub fn new(registry: GpioRegistry, gpio: Arc<SimulatedGpio>) -> Self {
        Self { registry, gpio }
    }

    pub fn gpio(&self) -> &Arc<SimulatedGpio> {
        &self.gpio
    }

    /// Set an input level and report the transition, if any.
    /// Returns true if a registered callback ran.
    pub fn set_input(&self, pin: Pin, level: Level) -> bool {
        match self.gpio.drive_input(pin, level) {
            Some(previous) if previous != level => {
                self.registry.dispatch(pin, level, Instant::now())
            }
            _ => false,
        }
    }

    /// One active-low pulse (high → low → high) on `pin` after `delay`,
    /// delivered from a separate task
    pub fn inject_pulse(&self, pin: Pin, delay: Option<Duration>) -> JoinHandle<()> {
        let injector = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            injector.pulse_now(pin);
        })
    }

    /// `count` pulses spaced `spacing` apart, in order, from one task
    pub fn inject_burst(&self, pin: Pin, count: u32, spacing: Duration) -> JoinHandle<()> {
        let injector = self.clone();
        tokio::spawn(async move {
            for i in 0..count {
                if i > 0 {
                    tokio::time::sleep(spacing).await;
                }
                injector.pulse_now(pin);
            }
            debug!(pin = %pin, count = %count, "sim_burst_injected");
        })
    }

    fn pulse_now(&self, pin: Pin) {
        // Inputs idle high behind the pull-up
        self.set_input(pin, Level::High);
        self.set_input(pin, Level::Low);
        self.set_input(pin, Level::High);
    }

    /// Current level of an output pin
    pub fn output_level(&self, pin: Pin) -> Option<Level> {
        self.gpio.level(pin)
    }

    /// Emulate a hopper: while `motor` is driven high, emit one sensor pulse
    /// every `coin_interval` until stock runs out
    pub fn attach_hopper(&self, motor: Pin, sensor: Pin, config: SimHopperConfig) -> JoinHandle<()> {
        let injector = self.clone();
        tokio::spawn(async move {
            let mut stock = config.stock;
            let idle = config.coin_present.inverted();
            loop {
                tokio::time::sleep(config.coin_interval).await;
                if injector.output_level(motor) != Some(Level::High) {
                    continue;
                }
                match stock {
                    Some(0) => continue,
                    Some(ref mut left) => *left -= 1,
                    None => {}
                }
                injector.set_input(sensor, config.coin_present);
                injector.set_input(sensor, idle);
                if stock == Some(0) {
                    info!(motor = %motor, "sim_hopper_empty");
                }
            }
        })
    }
}

/// Registry backed by a fresh simulated GPIO, plus its injector
pub fn simulated() -> (GpioRegistry, PulseInjector) {
    let gpio = Arc::new(SimulatedGpio::new());
    let registry = GpioRegistry::new(gpio.clone());
    let injector = PulseInjector::new(registry.clone(), gpio);
    (registry, injector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::gpio::Edge;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_write_requires_output() {
        let gpio = SimulatedGpio::new();
        assert!(matches!(gpio.write(Pin(5), Level::High), Err(HalError::NotConfigured { .. })));

        gpio.setup_output(Pin(5), Level::Low).unwrap();
        gpio.write(Pin(5), Level::High).unwrap();
        assert_eq!(gpio.level(Pin(5)), Some(Level::High));
    }

    #[test]
    fn test_write_failure_injection() {
        let gpio = SimulatedGpio::new();
        gpio.setup_output(Pin(5), Level::Low).unwrap();
        gpio.set_write_failure(Pin(5), true);
        assert!(matches!(gpio.write(Pin(5), Level::High), Err(HalError::WriteFailed { .. })));
        gpio.set_write_failure(Pin(5), false);
        assert!(gpio.write(Pin(5), Level::High).is_ok());
    }

    #[test]
    fn test_pull_sets_idle_level() {
        let gpio = SimulatedGpio::new();
        gpio.setup_input(Pin(17), Pull::Up).unwrap();
        gpio.setup_input(Pin(24), Pull::Down).unwrap();
        assert_eq!(gpio.read(Pin(17)), Ok(Level::High));
        assert_eq!(gpio.read(Pin(24)), Ok(Level::Low));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_pulse_runs_callback() {
        let (registry, injector) = simulated();
        registry.setup_input(Pin(17), Pull::Up).unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        registry
            .add_event_detect(
                Pin(17),
                Edge::Falling,
                Duration::ZERO,
                Arc::new(move |_| {
                    h.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        injector.inject_pulse(Pin(17), Some(Duration::from_millis(100))).await.unwrap();
        injector.inject_burst(Pin(17), 3, Duration::from_millis(100)).await.unwrap();

        assert_eq!(hits.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_hopper_respects_stock() {
        let (registry, injector) = simulated();
        registry.setup_output(Pin(23), Level::Low).unwrap();
        registry.setup_input(Pin(24), Pull::Down).unwrap();

        let coins = Arc::new(AtomicU32::new(0));
        let c = coins.clone();
        registry
            .add_event_detect(
                Pin(24),
                Edge::Rising,
                Duration::ZERO,
                Arc::new(move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        let config = SimHopperConfig { stock: Some(2), ..Default::default() };
        let hopper = injector.attach_hopper(Pin(23), Pin(24), config);

        registry.write(Pin(23), Level::High).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        hopper.abort();

        assert_eq!(coins.load(Ordering::Relaxed), 2);
    }
}
