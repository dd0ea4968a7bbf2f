//! Kiosk cash library
//!
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod hal;
pub mod infra;
pub mod services;
