//! Shared types for the cash subsystem

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;
use uuid::Uuid;

/// Which acceptor a pulse line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Coin,
    Bill,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Coin => "coin",
            ChannelKind::Bill => "bill",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of currency the hardware can accept or pay out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denomination {
    pub value: Decimal,
    pub label: String,
}

impl Denomination {
    pub fn new(value: Decimal, label: impl Into<String>) -> Self {
        Self { value, label: label.into() }
    }
}

impl std::fmt::Display for Denomination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.value)
    }
}

/// One row of a pulse-count table as it appears in configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableEntry {
    pub pulses: u32,
    pub value: Decimal,
    pub label: String,
}

/// Pulse count → denomination lookup for one acceptor type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DenominationTable {
    entries: BTreeMap<u32, Denomination>,
}

impl DenominationTable {
    /// Build a table from config rows. Rows with a zero pulse count or a
    /// non-positive value are skipped; a later row wins on duplicate counts.
    pub fn from_entries(entries: &[TableEntry]) -> Self {
        let entries = entries
            .iter()
            .filter(|e| e.pulses > 0 && e.value > Decimal::ZERO)
            .map(|e| (e.pulses, Denomination::new(e.value, e.label.clone())))
            .collect();
        Self { entries }
    }

    /// Allan 123A-Pro calibration: six programmed channels, old and new
    /// variants of each coin share a value
    pub fn default_coins() -> Self {
        Self::from_entries(&[
            entry(1, 1, "Old 1 Peso Coin"),
            entry(2, 1, "New 1 Peso Coin"),
            entry(3, 5, "Old 5 Peso Coin"),
            entry(4, 5, "New 5 Peso Coin"),
            entry(5, 10, "Old 10 Peso Coin"),
            entry(6, 10, "New 10 Peso Coin"),
        ])
    }

    /// Bill validator in pulse-per-10 mode
    pub fn default_bills() -> Self {
        Self::from_entries(&[
            entry(2, 20, "20 Peso Bill"),
            entry(5, 50, "50 Peso Bill"),
            entry(10, 100, "100 Peso Bill"),
            entry(20, 200, "200 Peso Bill"),
            entry(50, 500, "500 Peso Bill"),
            entry(100, 1000, "1000 Peso Bill"),
        ])
    }

    pub fn lookup(&self, pulses: u32) -> Option<&Denomination> {
        self.entries.get(&pulses)
    }

    /// Largest pulse count with an entry
    pub fn max_pulses(&self) -> u32 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// Pulse count that encodes `value` (first match)
    pub fn pulses_for(&self, value: Decimal) -> Option<u32> {
        self.entries.iter().find(|(_, d)| d.value == value).map(|(p, _)| *p)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn entry(pulses: u32, value: i64, label: &str) -> TableEntry {
    TableEntry { pulses, value: Decimal::from(value), label: label.to_string() }
}

/// A debounced falling edge on an acceptor line
#[derive(Debug, Clone, Copy)]
pub struct PulseEvent {
    pub channel: ChannelKind,
    pub at: Instant,
}

/// A credit that resolved while no session was accepting money.
///
/// Kept for the operator; never added to a session total.
#[derive(Debug, Clone, Serialize)]
pub struct UnattributedCredit {
    pub channel: ChannelKind,
    pub denomination: Denomination,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a change request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeResult {
    pub success: bool,
    pub amount_due: Decimal,
    pub dispensed_amount: Decimal,
    pub detail: String,
}

impl ChangeResult {
    pub fn dispensed(amount: Decimal) -> Self {
        Self {
            success: true,
            amount_due: amount,
            dispensed_amount: amount,
            detail: "dispensed".to_string(),
        }
    }

    pub fn nothing_due(amount_due: Decimal) -> Self {
        Self {
            success: true,
            amount_due,
            dispensed_amount: Decimal::ZERO,
            detail: "no change due".to_string(),
        }
    }

    pub fn failed(amount_due: Decimal, dispensed_amount: Decimal, detail: String) -> Self {
        Self { success: false, amount_due, dispensed_amount, detail }
    }

    pub fn unavailable(amount_due: Decimal) -> Self {
        Self::failed(amount_due, Decimal::ZERO, "change dispenser not available".to_string())
    }

    /// Change owed to the customer that did not come out of the hoppers
    pub fn shortfall(&self) -> Decimal {
        (self.amount_due - self.dispensed_amount).max(Decimal::ZERO)
    }
}

/// Result of closing a session and paying out change
#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub session_id: Option<Uuid>,
    pub required: Decimal,
    pub received: Decimal,
    pub change_due: Decimal,
    pub change_dispensed: Decimal,
    pub status: String,
}

impl Settlement {
    /// Money the operator must hand back manually
    pub fn owed_to_customer(&self) -> Decimal {
        if self.received < self.required {
            // incomplete payment: everything goes back
            self.received
        } else {
            (self.change_due - self.change_dispensed).max(Decimal::ZERO)
        }
    }
}
