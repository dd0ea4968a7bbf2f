//! Services - cash acceptance and change dispensing
//!
//! Built bottom-up, each layer owning the one below:
//! - `pulse_line` - Debounced acceptor input feeding a bounded queue
//! - `decoder` - Direct-edge and burst-count pulse decoding
//! - `channel` - Finalizer task and running total for one acceptor
//! - `session` - Customer transaction over all channels
//! - `dispenser` - Hopper control for change payout

pub mod channel;
pub mod decoder;
pub mod dispenser;
pub mod pulse_line;
pub mod session;

// Re-export commonly used types
pub use channel::{AcquisitionChannel, ChannelConfig, ChannelError};
pub use decoder::{BurstCountDecoder, DenominationDecoder, DirectEdgeDecoder, Resolution};
pub use dispenser::{
    ChangeDispenser, Decomposition, DispenseProgress, DispenserConfig, DispenserError, HopperUnit,
};
pub use pulse_line::PulseLine;
pub use session::PaymentSession;
