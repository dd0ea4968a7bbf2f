//! Hardware access - GPIO registry and the simulated platform
//!
//! - `gpio` - pin types, the `GpioBackend` trait, and the edge callback registry
//! - `sim` - in-memory backend with pulse injection and hopper emulation

pub mod gpio;
pub mod sim;

pub use gpio::{Edge, EdgeCallback, EdgeEvent, GpioBackend, GpioRegistry, HalError, Level, Pin, Pull};
pub use sim::{PulseInjector, SimHopperConfig, SimulatedGpio};
