//! Monitored acceptor input line
//!
//! The edge callback only timestamps and enqueues. It never blocks: a full
//! queue drops the pulse and records it, since waiting here would stall the
//! platform's interrupt dispatch.

use crate::domain::types::{ChannelKind, PulseEvent};
use crate::hal::gpio::{Edge, EdgeCallback, EdgeEvent, GpioRegistry, HalError, Pin, Pull};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Shortest debounce window a line may be armed with
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(50);

pub struct PulseLine {
    channel: ChannelKind,
    pin: Pin,
    debounce: Duration,
    registry: GpioRegistry,
}

impl PulseLine {
    pub fn new(registry: GpioRegistry, channel: ChannelKind, pin: Pin, debounce: Duration) -> Self {
        if debounce < MIN_DEBOUNCE {
            warn!(
                channel = %channel,
                pin = %pin,
                requested_ms = %debounce.as_millis(),
                min_ms = %MIN_DEBOUNCE.as_millis(),
                "pulse_line_debounce_raised"
            );
        }
        Self { channel, pin, debounce: debounce.max(MIN_DEBOUNCE), registry }
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Configure the pin and register the falling-edge callback
    pub fn arm(&self, tx: mpsc::Sender<PulseEvent>, metrics: Arc<Metrics>) -> Result<(), HalError> {
        // Reconfiguring a pin someone else owns would change its idle level
        if self.registry.is_registered(self.pin) {
            return Err(HalError::PinBusy(self.pin));
        }
        self.registry.setup_input(self.pin, Pull::Up)?;

        let channel = self.channel;
        let callback: EdgeCallback = Arc::new(move |edge: EdgeEvent| {
            match tx.try_send(PulseEvent { channel, at: edge.at }) {
                Ok(()) => {
                    metrics.record_pulse();
                    debug!(channel = %channel, pin = %edge.pin, "pulse");
                }
                Err(TrySendError::Full(_)) => {
                    metrics.record_pulse_dropped();
                    error!(channel = %channel, pin = %edge.pin, "pulse_dropped_queue_full");
                }
                Err(TrySendError::Closed(_)) => {
                    metrics.record_pulse_dropped();
                    warn!(channel = %channel, pin = %edge.pin, "pulse_dropped_line_closed");
                }
            }
        });

        self.registry.add_event_detect(self.pin, Edge::Falling, self.debounce, callback)?;
        info!(
            channel = %self.channel,
            pin = %self.pin,
            debounce_ms = %self.debounce.as_millis(),
            "pulse_line_armed"
        );
        Ok(())
    }

    /// Deregister the callback. Safe to call when never armed or repeatedly.
    pub fn disarm(&self) {
        if self.registry.remove_event_detect(self.pin) {
            info!(channel = %self.channel, pin = %self.pin, "pulse_line_disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.registry.is_registered(self.pin)
    }

    /// Edges swallowed by the debounce window
    pub fn suppressed(&self) -> u64 {
        self.registry.suppressed_edges(self.pin)
    }
}
