//! Utilities module for expctl.
//!
//! Shared helpers used across the engine components and the drivers.

pub mod error_handling;

pub use error_handling::{lock_unpoisoned, panic_message, retry_blocking};
