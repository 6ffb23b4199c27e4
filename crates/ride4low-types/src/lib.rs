//! Shared vocabulary for the Ride4Low rider core.
//!
//! This crate holds the plain data types that both the trip event stream and the
//! deferred-payment protocol speak. It carries no protocol logic of its own.
//!
//! # Modules
//!
//! - [`chain`] - CAIP-2 chain identifiers and EIP-155 chain references
//! - [`config`] - Environment-variable aware configuration values
//! - [`networks`] - Registry of well-known networks and their wallet descriptors
//! - [`ride`] - Coordinates, drivers, fares, trip and user identifiers
//! - [`timestamp`] - Unix timestamps for payment authorization windows
//! - [`util`] - Base64 helpers

pub mod chain;
pub mod config;
pub mod networks;
pub mod ride;
pub mod timestamp;
pub mod util;
