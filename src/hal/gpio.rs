//! GPIO access and the process-wide edge callback registry
//!
//! The registry is the single owner of "one callback per pin" state. It is
//! created once by the process and cloned into every channel and hopper that
//! needs hardware access. Platform backends report level changes through
//! `GpioRegistry::dispatch`, which applies the per-pin debounce window before
//! invoking the registered callback outside the table lock.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// BCM pin number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pin(pub u8);

impl std::fmt::Display for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::High => "high",
        }
    }

    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Which level transitions fire a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Falling,
    Rising,
    Both,
}

impl Edge {
    /// Whether a transition to `new_level` is an edge of this kind
    fn matches(self, new_level: Level) -> bool {
        match self {
            Edge::Falling => new_level == Level::Low,
            Edge::Rising => new_level == Level::High,
            Edge::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Up,
    Down,
    Off,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HalError {
    #[error("pin {0} already has an edge callback registered")]
    PinBusy(Pin),
    #[error("pin {pin} is not configured as {expected}")]
    NotConfigured { pin: Pin, expected: &'static str },
    #[error("write to pin {pin} failed: {reason}")]
    WriteFailed { pin: Pin, reason: String },
    #[error("read from pin {pin} failed: {reason}")]
    ReadFailed { pin: Pin, reason: String },
}

/// Level control supplied by the platform layer
pub trait GpioBackend: Send + Sync {
    fn setup_input(&self, pin: Pin, pull: Pull) -> Result<(), HalError>;
    fn setup_output(&self, pin: Pin, initial: Level) -> Result<(), HalError>;
    fn read(&self, pin: Pin) -> Result<Level, HalError>;
    fn write(&self, pin: Pin, level: Level) -> Result<(), HalError>;
}

/// An accepted edge, delivered to the registered callback
#[derive(Debug, Clone, Copy)]
pub struct EdgeEvent {
    pub pin: Pin,
    pub level: Level,
    pub at: Instant,
}

pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

struct Registration {
    edge: Edge,
    debounce: Duration,
    last_accepted: Option<Instant>,
    suppressed: u64,
    callback: EdgeCallback,
}

/// Process-wide GPIO handle. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct GpioRegistry {
    backend: Arc<dyn GpioBackend>,
    callbacks: Arc<Mutex<FxHashMap<Pin, Registration>>>,
}

impl GpioRegistry {
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self { backend, callbacks: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    pub fn setup_input(&self, pin: Pin, pull: Pull) -> Result<(), HalError> {
        self.backend.setup_input(pin, pull)
    }

    pub fn setup_output(&self, pin: Pin, initial: Level) -> Result<(), HalError> {
        self.backend.setup_output(pin, initial)
    }

    pub fn read(&self, pin: Pin) -> Result<Level, HalError> {
        self.backend.read(pin)
    }

    pub fn write(&self, pin: Pin, level: Level) -> Result<(), HalError> {
        self.backend.write(pin, level)
    }

    /// Register an edge callback. Edges closer than `debounce` to the last
    /// accepted edge on the same pin are suppressed.
    pub fn add_event_detect(
        &self,
        pin: Pin,
        edge: Edge,
        debounce: Duration,
        callback: EdgeCallback,
    ) -> Result<(), HalError> {
        let mut callbacks = self.callbacks.lock();
        if callbacks.contains_key(&pin) {
            return Err(HalError::PinBusy(pin));
        }
        callbacks.insert(
            pin,
            Registration { edge, debounce, last_accepted: None, suppressed: 0, callback },
        );
        debug!(pin = %pin, edge = ?edge, debounce_ms = %debounce.as_millis(), "gpio_event_registered");
        Ok(())
    }

    /// Remove the callback for `pin`. Returns false if none was registered.
    pub fn remove_event_detect(&self, pin: Pin) -> bool {
        let removed = self.callbacks.lock().remove(&pin).is_some();
        if removed {
            debug!(pin = %pin, "gpio_event_removed");
        }
        removed
    }

    pub fn is_registered(&self, pin: Pin) -> bool {
        self.callbacks.lock().contains_key(&pin)
    }

    /// Edges rejected by the debounce window since registration
    pub fn suppressed_edges(&self, pin: Pin) -> u64 {
        self.callbacks.lock().get(&pin).map(|r| r.suppressed).unwrap_or(0)
    }

    /// Deliver a level change on `pin` observed at `at`.
    ///
    /// Returns true if a callback ran. The callback is invoked after the
    /// table lock is released, so it may itself touch the registry.
    pub fn dispatch(&self, pin: Pin, level: Level, at: Instant) -> bool {
        let callback = {
            let mut callbacks = self.callbacks.lock();
            let Some(reg) = callbacks.get_mut(&pin) else {
                trace!(pin = %pin, level = %level.as_str(), "gpio_edge_unregistered");
                return false;
            };
            if !reg.edge.matches(level) {
                return false;
            }
            if let Some(last) = reg.last_accepted {
                if at.saturating_duration_since(last) < reg.debounce {
                    reg.suppressed += 1;
                    trace!(pin = %pin, "gpio_edge_debounced");
                    return false;
                }
            }
            reg.last_accepted = Some(at);
            reg.callback.clone()
        };

        callback(EdgeEvent { pin, level, at });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimulatedGpio;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> GpioRegistry {
        GpioRegistry::new(Arc::new(SimulatedGpio::new()))
    }

    fn counting_callback() -> (EdgeCallback, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let cb: EdgeCallback = Arc::new(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        (cb, hits)
    }

    #[test]
    fn test_second_registration_rejected() {
        let gpio = registry();
        let (cb, _) = counting_callback();
        gpio.add_event_detect(Pin(17), Edge::Falling, Duration::ZERO, cb.clone()).unwrap();

        let err = gpio.add_event_detect(Pin(17), Edge::Falling, Duration::ZERO, cb).unwrap_err();
        assert_eq!(err, HalError::PinBusy(Pin(17)));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let gpio = registry();
        assert!(!gpio.remove_event_detect(Pin(4)));

        let (cb, _) = counting_callback();
        gpio.add_event_detect(Pin(4), Edge::Both, Duration::ZERO, cb).unwrap();
        assert!(gpio.remove_event_detect(Pin(4)));
        assert!(!gpio.remove_event_detect(Pin(4)));
        assert!(!gpio.is_registered(Pin(4)));
    }

    #[test]
    fn test_edge_filter() {
        let gpio = registry();
        let (cb, hits) = counting_callback();
        gpio.add_event_detect(Pin(17), Edge::Falling, Duration::ZERO, cb).unwrap();

        let now = Instant::now();
        assert!(!gpio.dispatch(Pin(17), Level::High, now));
        assert!(gpio.dispatch(Pin(17), Level::Low, now));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_debounce_window() {
        let gpio = registry();
        let (cb, hits) = counting_callback();
        gpio.add_event_detect(Pin(17), Edge::Falling, Duration::from_millis(50), cb).unwrap();

        let t0 = Instant::now();
        assert!(gpio.dispatch(Pin(17), Level::Low, t0));
        assert!(!gpio.dispatch(Pin(17), Level::Low, t0 + Duration::from_millis(20)));
        assert!(!gpio.dispatch(Pin(17), Level::Low, t0 + Duration::from_millis(49)));
        assert!(gpio.dispatch(Pin(17), Level::Low, t0 + Duration::from_millis(50)));

        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(gpio.suppressed_edges(Pin(17)), 2);
    }

    #[test]
    fn test_unregistered_pin_ignored() {
        let gpio = registry();
        assert!(!gpio.dispatch(Pin(9), Level::Low, Instant::now()));
    }
}
