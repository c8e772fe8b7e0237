//! Common support code shared across the Bluetooth stack crates.

#[cfg(test)]
#[macro_use]
mod asserts;

mod logging;
pub mod time;

pub use logging::*;
