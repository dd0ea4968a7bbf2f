//! Pulse → denomination decoding
//!
//! Two incompatible readings of an acceptor line live behind one trait:
//! - `DirectEdgeDecoder`: each edge is worth whatever denomination is armed.
//!   It cannot tell coins apart by itself.
//! - `BurstCountDecoder`: pulses are grouped into bursts separated by a quiet
//!   period; the pulse count selects the denomination from a table.
//!
//! Decoders are driven by a single finalizer task and hold no locks. Time
//! always comes from the pulse timestamps or the caller, never from the
//! scheduler, so a pulse that arrives just before a late-firing timer still
//! extends its burst.

use crate::domain::types::{Denomination, DenominationTable};
use crate::infra::config::DecoderPolicy;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseReason {
    /// Pulse count has no table entry
    Unmapped,
    /// Burst kept going past the maximum burst duration
    Overlong,
}

impl NoiseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseReason::Unmapped => "unmapped",
            NoiseReason::Overlong => "overlong",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// `started` is the burst's first pulse; it decides which session owns
    /// the credit
    Credit { denomination: Denomination, pulses: u32, started: Instant, last_pulse: Instant },
    Noise { pulses: u32, reason: NoiseReason },
}

pub trait DenominationDecoder: Send {
    fn policy(&self) -> DecoderPolicy;

    /// Feed one debounced pulse. May resolve a previous burst.
    fn on_pulse(&mut self, at: Instant) -> Option<Resolution>;

    /// When the decoder next needs `on_deadline`, if at all
    fn deadline(&self) -> Option<Instant>;

    /// Called once `now` has reached `deadline()`
    fn on_deadline(&mut self, now: Instant) -> Option<Resolution>;

    /// Resolve whatever is in progress immediately
    fn flush(&mut self) -> Option<Resolution>;
}

/// Credits the armed denomination on every edge
pub struct DirectEdgeDecoder {
    armed: watch::Receiver<Denomination>,
}

impl DirectEdgeDecoder {
    pub fn new(armed: watch::Receiver<Denomination>) -> Self {
        Self { armed }
    }
}

impl DenominationDecoder for DirectEdgeDecoder {
    fn policy(&self) -> DecoderPolicy {
        DecoderPolicy::DirectEdge
    }

    fn on_pulse(&mut self, at: Instant) -> Option<Resolution> {
        let denomination = self.armed.borrow().clone();
        Some(Resolution::Credit { denomination, pulses: 1, started: at, last_pulse: at })
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&mut self, _now: Instant) -> Option<Resolution> {
        None
    }

    fn flush(&mut self) -> Option<Resolution> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Burst {
    pulses: u32,
    started: Instant,
    last: Instant,
}

/// Counts pulses until the line has been quiet for `quiet`
pub struct BurstCountDecoder {
    table: DenominationTable,
    quiet: Duration,
    max_burst: Duration,
    burst: Option<Burst>,
}

impl BurstCountDecoder {
    pub fn new(table: DenominationTable, quiet: Duration, max_burst: Duration) -> Self {
        Self { table, quiet, max_burst, burst: None }
    }

    /// Pulses counted in the open burst
    pub fn pending_pulses(&self) -> u32 {
        self.burst.map(|b| b.pulses).unwrap_or(0)
    }

    fn close(&mut self) -> Option<Resolution> {
        let burst = self.burst.take()?;
        Some(match self.table.lookup(burst.pulses) {
            Some(denomination) => Resolution::Credit {
                denomination: denomination.clone(),
                pulses: burst.pulses,
                started: burst.started,
                last_pulse: burst.last,
            },
            None => Resolution::Noise { pulses: burst.pulses, reason: NoiseReason::Unmapped },
        })
    }
}

impl DenominationDecoder for BurstCountDecoder {
    fn policy(&self) -> DecoderPolicy {
        DecoderPolicy::BurstCount
    }

    fn on_pulse(&mut self, at: Instant) -> Option<Resolution> {
        let mut resolved = None;

        if let Some(burst) = self.burst {
            if at.saturating_duration_since(burst.last) >= self.quiet {
                resolved = self.close();
            } else if at.saturating_duration_since(burst.started) > self.max_burst {
                self.burst = None;
                resolved =
                    Some(Resolution::Noise { pulses: burst.pulses, reason: NoiseReason::Overlong });
            }
        }

        match self.burst.as_mut() {
            Some(burst) => {
                burst.pulses += 1;
                burst.last = at;
            }
            None => self.burst = Some(Burst { pulses: 1, started: at, last: at }),
        }

        resolved
    }

    fn deadline(&self) -> Option<Instant> {
        self.burst.map(|b| b.last + self.quiet)
    }

    fn on_deadline(&mut self, now: Instant) -> Option<Resolution> {
        match self.burst {
            Some(burst) if now.saturating_duration_since(burst.last) >= self.quiet => self.close(),
            _ => None,
        }
    }

    fn flush(&mut self) -> Option<Resolution> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn coin_decoder() -> BurstCountDecoder {
        BurstCountDecoder::new(DenominationTable::default_coins(), ms(500), ms(5000))
    }

    fn credited_value(resolution: Option<Resolution>) -> Option<rust_decimal::Decimal> {
        match resolution {
            Some(Resolution::Credit { denomination, .. }) => Some(denomination.value),
            _ => None,
        }
    }

    #[test]
    fn test_direct_edge_uses_armed_value() {
        let (tx, rx) = watch::channel(Denomination::new(dec!(1), "1 Peso Coin"));
        let mut decoder = DirectEdgeDecoder::new(rx);
        let t0 = Instant::now();

        assert_eq!(credited_value(decoder.on_pulse(t0)), Some(dec!(1)));

        tx.send_replace(Denomination::new(dec!(10), "10 Peso Coin"));
        assert_eq!(credited_value(decoder.on_pulse(t0 + ms(100))), Some(dec!(10)));
        assert!(decoder.deadline().is_none());
    }

    #[test]
    fn test_burst_resolves_after_quiet_period() {
        let mut decoder = coin_decoder();
        let t0 = Instant::now();

        for i in 0..4 {
            assert!(decoder.on_pulse(t0 + ms(i * 100)).is_none());
        }
        assert_eq!(decoder.pending_pulses(), 4);
        assert_eq!(decoder.deadline(), Some(t0 + ms(800)));

        assert!(decoder.on_deadline(t0 + ms(799)).is_none());
        assert_eq!(credited_value(decoder.on_deadline(t0 + ms(800))), Some(dec!(5)));
        assert!(decoder.deadline().is_none());
    }

    #[test]
    fn test_credit_carries_first_pulse_instant() {
        let mut decoder = coin_decoder();
        let t0 = Instant::now();
        for i in 0..3 {
            decoder.on_pulse(t0 + ms(i * 100));
        }
        match decoder.on_deadline(t0 + ms(700)) {
            Some(Resolution::Credit { started, last_pulse, .. }) => {
                assert_eq!(started, t0);
                assert_eq!(last_pulse, t0 + ms(200));
            }
            other => panic!("expected credit, got {other:?}"),
        }
    }

    #[test]
    fn test_late_pulse_extends_burst() {
        let mut decoder = coin_decoder();
        let t0 = Instant::now();

        decoder.on_pulse(t0);
        // Timer is due at t0+500 but the pulse at t0+499 lands first
        assert!(decoder.on_pulse(t0 + ms(499)).is_none());
        assert!(decoder.on_deadline(t0 + ms(500)).is_none());
        assert_eq!(decoder.pending_pulses(), 2);
        assert_eq!(credited_value(decoder.on_deadline(t0 + ms(999))), Some(dec!(1)));
    }

    #[test]
    fn test_pulse_after_quiet_starts_new_burst() {
        let mut decoder = coin_decoder();
        let t0 = Instant::now();

        decoder.on_pulse(t0);
        decoder.on_pulse(t0 + ms(100));
        decoder.on_pulse(t0 + ms(200));
        // Finalizer has not run yet, but the gap already closed the burst
        let resolved = decoder.on_pulse(t0 + ms(900));
        assert_eq!(credited_value(resolved), Some(dec!(5)));
        assert_eq!(decoder.pending_pulses(), 1);
    }

    #[test]
    fn test_unmapped_count_is_noise() {
        let mut decoder = coin_decoder();
        let t0 = Instant::now();
        for i in 0..9 {
            decoder.on_pulse(t0 + ms(i * 60));
        }
        let resolved = decoder.on_deadline(t0 + ms(2000));
        assert_eq!(resolved, Some(Resolution::Noise { pulses: 9, reason: NoiseReason::Unmapped }));
    }

    #[test]
    fn test_overlong_burst_discarded() {
        let mut decoder =
            BurstCountDecoder::new(DenominationTable::default_coins(), ms(500), ms(1000));
        let t0 = Instant::now();
        for i in 0..5 {
            decoder.on_pulse(t0 + ms(i * 200));
        }
        let resolved = decoder.on_pulse(t0 + ms(1100));
        assert_eq!(resolved, Some(Resolution::Noise { pulses: 5, reason: NoiseReason::Overlong }));
        assert_eq!(decoder.pending_pulses(), 1);
    }

    #[test]
    fn test_flush_resolves_open_burst() {
        let mut decoder = coin_decoder();
        decoder.on_pulse(Instant::now());
        assert_eq!(credited_value(decoder.flush()), Some(dec!(1)));
        assert!(decoder.flush().is_none());
    }
}
