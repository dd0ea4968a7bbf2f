//! Domain models - money and hardware event types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Denomination` / `DenominationTable` - accepted currency and pulse tables
//! - `PulseEvent` - a debounced edge from an acceptor line
//! - `UnattributedCredit` - money that resolved outside a session
//! - `ChangeResult` / `Settlement` - payout and session close outcomes

pub mod types;

pub use types::{
    ChangeResult, ChannelKind, Denomination, DenominationTable, PulseEvent, Settlement,
    TableEntry, UnattributedCredit,
};
