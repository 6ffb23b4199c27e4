//! Wire frames exchanged with the trip-coordination backend.
//!
//! Every frame in either direction is a JSON object `{type, data}`. Inbound
//! frames decode into the closed [`ServerEvent`] union; outbound intents are
//! [`ClientFrame`]s.

use ride4low_types::ride::{
    Coordinate, DriverSnapshot, PaymentMethod, PaymentSession, TripId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The `type` tag of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DriverLocation,
    PaymentSessionCreated,
    DriverAssigned,
    TripCreated,
    NoDriversFound,
    TripCompleted,
    TripCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::DriverLocation,
        EventKind::PaymentSessionCreated,
        EventKind::DriverAssigned,
        EventKind::TripCreated,
        EventKind::NoDriversFound,
        EventKind::TripCompleted,
        EventKind::TripCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DriverLocation => "driver_location",
            EventKind::PaymentSessionCreated => "payment_session_created",
            EventKind::DriverAssigned => "driver_assigned",
            EventKind::TripCreated => "trip_created",
            EventKind::NoDriversFound => "no_drivers_found",
            EventKind::TripCompleted => "trip_completed",
            EventKind::TripCancelled => "trip_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| FrameError::UnknownType(s.to_string()))
    }
}

/// A decoded server-pushed event. Exactly one per frame.
///
/// Trip ids are kept as the backend sent them; validating them against the
/// active trip is the state machine's job.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Nearby drivers and their latest positions.
    DriverLocation(Vec<DriverSnapshot>),
    /// The card checkout session for the trip is ready.
    PaymentSessionCreated(PaymentSession),
    DriverAssigned {
        driver: DriverSnapshot,
        trip_id: String,
    },
    TripCreated {
        trip_id: Option<String>,
    },
    NoDriversFound {
        trip_id: Option<String>,
    },
    TripCompleted {
        trip_id: Option<String>,
    },
    TripCancelled {
        trip_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct DriverAssignedData {
    driver: DriverSnapshot,
    id: String,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::DriverLocation(_) => EventKind::DriverLocation,
            ServerEvent::PaymentSessionCreated(_) => EventKind::PaymentSessionCreated,
            ServerEvent::DriverAssigned { .. } => EventKind::DriverAssigned,
            ServerEvent::TripCreated { .. } => EventKind::TripCreated,
            ServerEvent::NoDriversFound { .. } => EventKind::NoDriversFound,
            ServerEvent::TripCompleted { .. } => EventKind::TripCompleted,
            ServerEvent::TripCancelled { .. } => EventKind::TripCancelled,
        }
    }

    /// The trip this event refers to, when the backend says.
    pub fn trip_id(&self) -> Option<&str> {
        match self {
            ServerEvent::DriverLocation(_) => None,
            ServerEvent::PaymentSessionCreated(session) => Some(session.trip_id.as_str()),
            ServerEvent::DriverAssigned { trip_id, .. } => Some(trip_id.as_str()),
            ServerEvent::TripCreated { trip_id }
            | ServerEvent::NoDriversFound { trip_id }
            | ServerEvent::TripCompleted { trip_id }
            | ServerEvent::TripCancelled { trip_id } => trip_id.as_deref(),
        }
    }

    /// Decodes one text frame.
    ///
    /// Invalid JSON is [`FrameError::Malformed`]; anything else that is not a
    /// known `{type, data}` event is one of the protocol variants.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
        let Value::Object(mut frame) = value else {
            return Err(FrameError::InvalidShape);
        };
        let kind = match frame.get("type") {
            Some(Value::String(kind)) => kind.parse::<EventKind>()?,
            _ => return Err(FrameError::InvalidShape),
        };
        let data = frame.remove("data").unwrap_or(Value::Null);
        Self::from_data(kind, data)
    }

    fn from_data(kind: EventKind, data: Value) -> Result<Self, FrameError> {
        let invalid = |source| FrameError::InvalidPayload { kind, source };
        let event = match kind {
            EventKind::DriverLocation => {
                ServerEvent::DriverLocation(serde_json::from_value(data).map_err(invalid)?)
            }
            EventKind::PaymentSessionCreated => {
                ServerEvent::PaymentSessionCreated(serde_json::from_value(data).map_err(invalid)?)
            }
            EventKind::DriverAssigned => {
                let data: DriverAssignedData = serde_json::from_value(data).map_err(invalid)?;
                ServerEvent::DriverAssigned {
                    driver: data.driver,
                    trip_id: data.id,
                }
            }
            EventKind::TripCreated => ServerEvent::TripCreated {
                trip_id: status_trip_id(kind, &data)?,
            },
            EventKind::NoDriversFound => ServerEvent::NoDriversFound {
                trip_id: status_trip_id(kind, &data)?,
            },
            EventKind::TripCompleted => ServerEvent::TripCompleted {
                trip_id: status_trip_id(kind, &data)?,
            },
            EventKind::TripCancelled => ServerEvent::TripCancelled {
                trip_id: status_trip_id(kind, &data)?,
            },
        };
        Ok(event)
    }
}

/// Status-only events carry no data, or an object that may name the trip.
fn status_trip_id(kind: EventKind, data: &Value) -> Result<Option<String>, FrameError> {
    match data {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(["tripID", "tripId", "id"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string)),
        _ => Err(FrameError::InvalidStatusPayload(kind)),
    }
}

/// Why an inbound frame could not become a [`ServerEvent`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Not JSON at all.
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Frame is not a {{type, data}} object")]
    InvalidShape,
    #[error("Unknown message type \"{0}\"")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid {0} payload: expected an object or nothing")]
    InvalidStatusPayload(EventKind),
}

impl FrameError {
    /// Transport-level decode failure, as opposed to a well-formed but
    /// unrecognized message.
    pub fn is_transport(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

/// Rider's choice of payment method for a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSelection {
    #[serde(rename = "tripID")]
    pub trip_id: TripId,
    #[serde(rename = "userID")]
    pub user_id: UserId,
}

/// An outbound rider intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    DriverLocation { location: Coordinate },
    PaymentSelectCard(PaymentSelection),
    PaymentSelectCrypto(PaymentSelection),
}

impl ClientFrame {
    pub fn payment_selection(method: PaymentMethod, trip_id: TripId, user_id: UserId) -> Self {
        let selection = PaymentSelection { trip_id, user_id };
        match method {
            PaymentMethod::Card => ClientFrame::PaymentSelectCard(selection),
            PaymentMethod::Crypto => ClientFrame::PaymentSelectCrypto(selection),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
