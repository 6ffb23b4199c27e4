//! Rider-side core of the Ride4Low ride-hailing client.
//!
//! A rider follows one trip at a time. The backend pushes trip events over a
//! per-rider event stream, the [`trip`] state machine folds them together with
//! the rider's own actions, and crypto payments are settled through the x402
//! deferred-payment flow in [`ride4low_x402`].
//!
//! # Modules
//!
//! - [`config`] - JSON configuration with environment fallbacks for the headless rider.
//! - [`session`] - [`RiderSession`](session::RiderSession), which wires stream, trip and payments together.
//! - [`trip`] - The trip lifecycle state machine.
//! - [`util`] - Telemetry and signal handling for the binary.
//!
//! The building blocks live in their own crates:
//!
//! - [`ride4low_types`] - Coordinates, trips, drivers, CAIP-2 chain ids and timestamps.
//! - [`ride4low_stream`] - The trip event stream client and its wire frames.
//! - [`ride4low_x402`] - Quotes, EIP-3009 authorizations and signing authorities.

pub mod config;
pub mod session;
pub mod trip;
pub mod util;

pub use ride4low_stream;
pub use ride4low_types;
pub use ride4low_x402;

pub use session::{RiderSession, SessionError, SessionEvent};
pub use trip::{Transition, TripState, TripStateMachine};
