//! Shared types and constants for the SNAT race connection tester
//!
//! This crate provides the sample type exchanged between probe workers and
//! the aggregator, along with the defaults and limits both sides agree on.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::Sample;
