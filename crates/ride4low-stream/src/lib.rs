//! Duplex event stream between a rider and the trip-coordination backend.
//!
//! [`TripEventStream`] owns one WebSocket channel per signed-in rider. Inbound
//! frames become [`StreamEvent`]s delivered in arrival order; outbound rider
//! intents are [`ClientFrame`]s.

mod error;
pub mod frames;
mod stream;

pub use error::StreamError;
pub use frames::{ClientFrame, EventKind, FrameError, PaymentSelection, ServerEvent};
pub use stream::{StreamConfig, StreamEvent, TripEventStream};
