//! Trip lifecycle.
//!
//! [`TripStateMachine`] is a synchronous reducer. Every decoded server event,
//! rider action and payment outcome goes through [`TripStateMachine::apply`]
//! in arrival order and the resulting [`TripSession`] is what a UI renders.
//!
//! ```text
//! Idle -> RouteSelection -> Created -> DriverAssigned -> PaymentRequired -> Completed
//!                                  \-> NoDriversFound
//! ```
//!
//! `Cancelled` is reachable from every non-terminal state, `Error` from a
//! malformed assignment, and `Reset` returns to `Idle` from anywhere.

use ride4low_stream::ServerEvent;
use ride4low_types::ride::{DriverSnapshot, PaymentMethod, PaymentSession, RouteFare, TripId};
use ride4low_x402::{ErrorCategory, PaymentQuote};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TripState {
    #[default]
    Idle,
    RouteSelection,
    Created,
    DriverAssigned,
    NoDriversFound,
    PaymentRequired,
    Completed,
    Cancelled,
    Error,
}

impl TripState {
    /// `Completed` and `Cancelled` end a trip; only a reset leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripState::Completed | TripState::Cancelled)
    }
}

impl fmt::Display for TripState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TripState::Idle => "idle",
            TripState::RouteSelection => "route_selection",
            TripState::Created => "created",
            TripState::DriverAssigned => "driver_assigned",
            TripState::NoDriversFound => "no_drivers_found",
            TripState::PaymentRequired => "payment_required",
            TripState::Completed => "completed",
            TripState::Cancelled => "cancelled",
            TripState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Something the rider did.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    SelectRoute(RouteFare),
    SelectPaymentMethod(PaymentMethod),
    /// Back out of the payment screen to pick another method.
    ClearPaymentMethod,
    Cancel,
    /// "Go back": forget the trip.
    Reset,
}

/// Progress of a crypto payment attempt, reported by whoever runs it.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    QuoteReceived(PaymentQuote),
    Succeeded(Value),
    Failed {
        category: ErrorCategory,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TripInput {
    Server(ServerEvent),
    Action(UserAction),
    Payment(PaymentOutcome),
}

impl From<ServerEvent> for TripInput {
    fn from(event: ServerEvent) -> Self {
        TripInput::Server(event)
    }
}

impl From<UserAction> for TripInput {
    fn from(action: UserAction) -> Self {
        TripInput::Action(action)
    }
}

impl From<PaymentOutcome> for TripInput {
    fn from(outcome: PaymentOutcome) -> Self {
        TripInput::Payment(outcome)
    }
}

/// What [`TripStateMachine::apply`] did with an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Moved { from: TripState, to: TripState },
    /// Same state, new data (drivers, quote, checkout session).
    Updated(TripState),
    /// Nothing changed.
    Ignored { state: TripState, reason: String },
}

impl Transition {
    pub fn state(&self) -> TripState {
        match self {
            Transition::Moved { to, .. } => *to,
            Transition::Updated(state) | Transition::Ignored { state, .. } => *state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TripError {
    #[error("Cannot select a payment method before the trip has an id")]
    MissingTripId,
    #[error("Trip is not awaiting a crypto payment (state {0})")]
    NotAwaitingCryptoPayment(TripState),
}

/// Everything the rider flow knows about the current trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripSession {
    pub state: TripState,
    pub fare: Option<RouteFare>,
    pub trip_id: Option<TripId>,
    pub driver: Option<DriverSnapshot>,
    /// Latest snapshot per driver id.
    pub nearby_drivers: HashMap<String, DriverSnapshot>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_session: Option<PaymentSession>,
    /// Quote of the crypto attempt in progress.
    pub quote: Option<PaymentQuote>,
    pub last_error: Option<String>,
}

impl TripSession {
    fn discard_payment(&mut self) {
        self.payment_session = None;
        self.quote = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct TripStateMachine {
    session: TripSession,
}

impl TripStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &TripSession {
        &self.session
    }

    pub fn state(&self) -> TripState {
        self.session.state
    }

    pub fn trip_id(&self) -> Option<&TripId> {
        self.session.trip_id.as_ref()
    }

    /// Applies one input.
    ///
    /// The only error is selecting a payment method before a trip id exists.
    /// Inputs that do not fit the current state come back as
    /// [`Transition::Ignored`] and leave the session untouched.
    pub fn apply(&mut self, input: impl Into<TripInput>) -> Result<Transition, TripError> {
        let transition = match input.into() {
            TripInput::Server(event) => self.on_server(event),
            TripInput::Action(action) => self.on_action(action)?,
            TripInput::Payment(outcome) => self.on_payment(outcome),
        };
        match &transition {
            Transition::Moved { from, to } => {
                tracing::info!(%from, %to, trip_id = ?self.session.trip_id, "Trip state changed")
            }
            Transition::Updated(_) => {}
            Transition::Ignored { state, reason } => {
                tracing::debug!(%state, reason, "Trip input ignored")
            }
        }
        Ok(transition)
    }

    fn on_server(&mut self, event: ServerEvent) -> Transition {
        let state = self.session.state;
        let event = match event {
            ServerEvent::DriverLocation(drivers) => {
                for driver in drivers {
                    self.session.nearby_drivers.insert(driver.id.clone(), driver);
                }
                return Transition::Updated(state);
            }
            other => other,
        };

        if let ServerEvent::DriverAssigned { trip_id, .. } = &event {
            if trip_id.trim().is_empty() && !state.is_terminal() {
                self.session.last_error = Some("driver assigned without a trip id".to_string());
                return self.move_to(TripState::Error);
            }
        }
        if let (Some(current), Some(referenced)) = (&self.session.trip_id, event.trip_id()) {
            if current.as_str() != referenced {
                tracing::warn!(
                    current = %current,
                    referenced,
                    kind = %event.kind(),
                    "Dropping event for another trip"
                );
                return ignored(state, format!("event for trip {referenced}"));
            }
        }

        match (state, event) {
            (TripState::RouteSelection, ServerEvent::TripCreated { trip_id }) => {
                if let Some(trip_id) = trip_id.and_then(|id| TripId::new(id).ok()) {
                    self.session.trip_id = Some(trip_id);
                }
                self.move_to(TripState::Created)
            }
            (TripState::Created, ServerEvent::DriverAssigned { driver, trip_id }) => {
                match TripId::new(trip_id) {
                    Ok(trip_id) => {
                        self.session.trip_id = Some(trip_id);
                        self.session.driver = Some(driver);
                        self.move_to(TripState::DriverAssigned)
                    }
                    Err(err) => {
                        self.session.last_error = Some(err.to_string());
                        self.move_to(TripState::Error)
                    }
                }
            }
            (TripState::Created, ServerEvent::NoDriversFound { .. }) => {
                self.move_to(TripState::NoDriversFound)
            }
            (TripState::PaymentRequired, ServerEvent::PaymentSessionCreated(session)) => {
                self.session.payment_session = Some(session);
                Transition::Updated(state)
            }
            (TripState::PaymentRequired, ServerEvent::TripCompleted { .. }) => {
                self.move_to(TripState::Completed)
            }
            (state, ServerEvent::TripCancelled { .. }) if !state.is_terminal() => {
                self.move_to(TripState::Cancelled)
            }
            (state, event) => ignored(state, format!("{} not expected", event.kind())),
        }
    }

    fn on_action(&mut self, action: UserAction) -> Result<Transition, TripError> {
        let state = self.session.state;
        let transition = match (state, action) {
            (_, UserAction::Reset) => {
                let nearby_drivers = std::mem::take(&mut self.session.nearby_drivers);
                self.session = TripSession {
                    nearby_drivers,
                    ..TripSession::default()
                };
                Transition::Moved {
                    from: state,
                    to: TripState::Idle,
                }
            }
            (TripState::Idle, UserAction::SelectRoute(fare)) => {
                self.session.fare = Some(fare);
                self.move_to(TripState::RouteSelection)
            }
            (TripState::RouteSelection, UserAction::SelectRoute(fare)) => {
                self.session.fare = Some(fare);
                Transition::Updated(state)
            }
            (state, UserAction::SelectPaymentMethod(method)) => {
                if self.session.trip_id.is_none() {
                    return Err(TripError::MissingTripId);
                }
                if state != TripState::DriverAssigned {
                    return Ok(ignored(state, format!("{method} selected while {state}")));
                }
                self.session.payment_method = Some(method);
                self.move_to(TripState::PaymentRequired)
            }
            (TripState::PaymentRequired, UserAction::ClearPaymentMethod) => {
                self.session.payment_method = None;
                self.session.discard_payment();
                self.move_to(TripState::DriverAssigned)
            }
            (TripState::Idle, UserAction::Cancel) => ignored(state, "no trip to cancel".into()),
            (state, UserAction::Cancel) if !state.is_terminal() => {
                self.move_to(TripState::Cancelled)
            }
            (state, action) => ignored(state, format!("{action:?} not expected")),
        };
        Ok(transition)
    }

    fn on_payment(&mut self, outcome: PaymentOutcome) -> Transition {
        let state = self.session.state;
        if state != TripState::PaymentRequired {
            return ignored(state, "no payment in progress".into());
        }
        match outcome {
            PaymentOutcome::QuoteReceived(quote) => {
                self.session.quote = Some(quote);
                Transition::Updated(state)
            }
            PaymentOutcome::Succeeded(_) => self.move_to(TripState::Completed),
            PaymentOutcome::Failed { category, reason } => {
                self.session.quote = None;
                self.session.last_error = Some(format!("{category}: {reason}"));
                Transition::Updated(state)
            }
        }
    }

    fn move_to(&mut self, to: TripState) -> Transition {
        let from = self.session.state;
        self.session.state = to;
        if to.is_terminal() {
            self.session.discard_payment();
        }
        Transition::Moved { from, to }
    }
}

fn ignored(state: TripState, reason: String) -> Transition {
    Transition::Ignored { state, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride4low_stream::EventKind;
    use ride4low_types::ride::{Coordinate, PaymentSession};
    use ride4low_types::timestamp::UnixTimestamp;
    use ride4low_types::util::Base64Bytes;
    use serde_json::json;

    fn fare() -> RouteFare {
        RouteFare {
            id: "f1".into(),
            package_slug: "sedan".into(),
            total_price_in_cents: 1250,
        }
    }

    fn driver(id: &str) -> DriverSnapshot {
        DriverSnapshot {
            id: id.into(),
            location: Coordinate::new(1.0, 2.0),
            name: None,
            car_plate: None,
            profile_picture: None,
            package_slug: None,
            geohash: None,
            heading: None,
        }
    }

    fn assigned(trip_id: &str) -> ServerEvent {
        ServerEvent::DriverAssigned {
            driver: driver("d1"),
            trip_id: trip_id.into(),
        }
    }

    fn quote() -> PaymentQuote {
        let header = Base64Bytes::encode_json(&json!({
            "accepts": [{"amount": "1000000", "asset": "0xabc", "network": "eip155:84532",
                         "payTo": "0xdef", "maxTimeoutSeconds": 120}],
            "resource": "r1"
        }))
        .unwrap()
        .to_string();
        PaymentQuote::decode(&header, UnixTimestamp::from_secs(1_700_000_000)).unwrap()
    }

    fn machine_in(state: TripState) -> TripStateMachine {
        let mut machine = TripStateMachine::new();
        let steps: Vec<TripInput> = vec![
            UserAction::SelectRoute(fare()).into(),
            ServerEvent::TripCreated { trip_id: None }.into(),
            assigned("t1").into(),
            UserAction::SelectPaymentMethod(PaymentMethod::Crypto).into(),
        ];
        for step in steps {
            if machine.state() == state {
                break;
            }
            machine.apply(step).unwrap();
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn test_happy_path_to_completed() {
        let mut machine = machine_in(TripState::PaymentRequired);
        assert_eq!(machine.trip_id().unwrap().as_str(), "t1");
        assert_eq!(machine.session().driver.as_ref().unwrap().id, "d1");
        assert_eq!(machine.session().payment_method, Some(PaymentMethod::Crypto));

        machine
            .apply(PaymentOutcome::QuoteReceived(quote()))
            .unwrap();
        assert!(machine.session().quote.is_some());
        let transition = machine
            .apply(PaymentOutcome::Succeeded(json!({"status": "paid"})))
            .unwrap();
        assert_eq!(
            transition,
            Transition::Moved {
                from: TripState::PaymentRequired,
                to: TripState::Completed
            }
        );
        assert!(machine.session().quote.is_none());
    }

    #[test]
    fn test_trip_created_adopts_trip_id() {
        let mut machine = machine_in(TripState::RouteSelection);
        machine
            .apply(ServerEvent::TripCreated {
                trip_id: Some("t9".into()),
            })
            .unwrap();
        assert_eq!(machine.trip_id().unwrap().as_str(), "t9");
        let transition = machine.apply(assigned("t1")).unwrap();
        assert!(matches!(transition, Transition::Ignored { .. }));
        assert_eq!(machine.state(), TripState::Created);
    }

    #[test]
    fn test_no_drivers_found_blocks_assignment_until_reset() {
        let mut machine = machine_in(TripState::Created);
        machine
            .apply(ServerEvent::NoDriversFound { trip_id: None })
            .unwrap();
        assert_eq!(machine.state(), TripState::NoDriversFound);

        let transition = machine.apply(assigned("t1")).unwrap();
        assert!(matches!(transition, Transition::Ignored { .. }));
        assert_eq!(machine.state(), TripState::NoDriversFound);
        assert!(machine.session().driver.is_none());

        machine.apply(UserAction::Reset).unwrap();
        assert_eq!(machine.state(), TripState::Idle);
        assert_eq!(machine.session().fare, None);
    }

    #[test]
    fn test_card_checkout_completed_by_server() {
        let mut machine = machine_in(TripState::DriverAssigned);
        machine
            .apply(UserAction::SelectPaymentMethod(PaymentMethod::Card))
            .unwrap();
        let session = PaymentSession {
            trip_id: "t1".into(),
            session_id: Some("cs_1".into()),
            amount: 12.5,
            currency: "USD".into(),
        };
        let transition = machine
            .apply(ServerEvent::PaymentSessionCreated(session.clone()))
            .unwrap();
        assert_eq!(transition, Transition::Updated(TripState::PaymentRequired));
        assert_eq!(machine.session().payment_session, Some(session));

        machine
            .apply(ServerEvent::TripCompleted {
                trip_id: Some("t1".into()),
            })
            .unwrap();
        assert_eq!(machine.state(), TripState::Completed);
        assert!(machine.session().payment_session.is_none());
    }

    #[test]
    fn test_events_for_other_trips_are_dropped() {
        let mut machine = machine_in(TripState::PaymentRequired);
        let before = machine.session().clone();
        for event in [
            ServerEvent::TripCompleted {
                trip_id: Some("other".into()),
            },
            ServerEvent::TripCancelled {
                trip_id: Some("other".into()),
            },
            assigned("other"),
        ] {
            let transition = machine.apply(event).unwrap();
            assert!(matches!(transition, Transition::Ignored { .. }));
        }
        assert_eq!(machine.session(), &before);
    }

    #[test]
    fn test_selection_requires_trip_id() {
        let mut machine = machine_in(TripState::Created);
        assert_eq!(
            machine.apply(UserAction::SelectPaymentMethod(PaymentMethod::Card)),
            Err(TripError::MissingTripId)
        );
        assert_eq!(machine.state(), TripState::Created);
    }

    #[test]
    fn test_failed_payment_keeps_payment_required() {
        let mut machine = machine_in(TripState::PaymentRequired);
        machine
            .apply(PaymentOutcome::QuoteReceived(quote()))
            .unwrap();
        machine
            .apply(PaymentOutcome::Failed {
                category: ErrorCategory::SigningRejected,
                reason: "User denied message signature.".into(),
            })
            .unwrap();
        assert_eq!(machine.state(), TripState::PaymentRequired);
        assert!(machine.session().quote.is_none());
        assert!(
            machine
                .session()
                .last_error
                .as_deref()
                .unwrap()
                .starts_with("signing_rejected")
        );
    }

    #[test]
    fn test_change_payment_method() {
        let mut machine = machine_in(TripState::PaymentRequired);
        machine
            .apply(PaymentOutcome::QuoteReceived(quote()))
            .unwrap();
        machine.apply(UserAction::ClearPaymentMethod).unwrap();
        assert_eq!(machine.state(), TripState::DriverAssigned);
        assert_eq!(machine.session().payment_method, None);
        assert!(machine.session().quote.is_none());
        machine
            .apply(UserAction::SelectPaymentMethod(PaymentMethod::Card))
            .unwrap();
        assert_eq!(machine.state(), TripState::PaymentRequired);
    }

    #[test]
    fn test_cancel_from_every_non_terminal_state() {
        for state in [
            TripState::RouteSelection,
            TripState::Created,
            TripState::DriverAssigned,
            TripState::PaymentRequired,
        ] {
            let mut machine = machine_in(state);
            machine.apply(UserAction::Cancel).unwrap();
            assert_eq!(machine.state(), TripState::Cancelled, "from {state}");

            let mut machine = machine_in(state);
            machine
                .apply(ServerEvent::TripCancelled { trip_id: None })
                .unwrap();
            assert_eq!(machine.state(), TripState::Cancelled, "from {state}");
        }
    }

    #[test]
    fn test_terminal_states_only_leave_by_reset() {
        let mut machine = machine_in(TripState::PaymentRequired);
        machine.apply(UserAction::Cancel).unwrap();
        for input in [
            TripInput::from(UserAction::Cancel),
            PaymentOutcome::Succeeded(Value::Null).into(),
            ServerEvent::TripCompleted { trip_id: None }.into(),
            assigned("").into(),
        ] {
            let transition = machine.apply(input).unwrap();
            assert!(matches!(transition, Transition::Ignored { .. }));
            assert_eq!(machine.state(), TripState::Cancelled);
        }
        machine.apply(UserAction::Reset).unwrap();
        assert_eq!(machine.state(), TripState::Idle);
    }

    #[test]
    fn test_assignment_without_trip_id_is_error() {
        let mut machine = machine_in(TripState::Created);
        machine.apply(assigned(" ")).unwrap();
        assert_eq!(machine.state(), TripState::Error);
        assert!(machine.session().last_error.is_some());
        machine.apply(UserAction::Cancel).unwrap();
        assert_eq!(machine.state(), TripState::Cancelled);
    }

    #[test]
    fn test_driver_locations_keep_latest_per_driver() {
        let mut machine = machine_in(TripState::Created);
        let mut moved = driver("d1");
        moved.location = Coordinate::new(5.0, 6.0);
        machine
            .apply(ServerEvent::DriverLocation(vec![driver("d1"), driver("d2")]))
            .unwrap();
        let transition = machine
            .apply(ServerEvent::DriverLocation(vec![moved.clone()]))
            .unwrap();
        assert_eq!(transition, Transition::Updated(TripState::Created));
        let nearby = &machine.session().nearby_drivers;
        assert_eq!(nearby.len(), 2);
        assert_eq!(nearby["d1"], moved);
    }

    #[test]
    fn test_every_event_kind_is_handled_in_every_state() {
        let events = [
            ServerEvent::DriverLocation(vec![]),
            ServerEvent::PaymentSessionCreated(PaymentSession {
                trip_id: "t1".into(),
                session_id: None,
                amount: 1.0,
                currency: "USD".into(),
            }),
            assigned("t1"),
            ServerEvent::TripCreated { trip_id: None },
            ServerEvent::NoDriversFound { trip_id: None },
            ServerEvent::TripCompleted { trip_id: None },
            ServerEvent::TripCancelled { trip_id: None },
        ];
        assert_eq!(events.len(), EventKind::ALL.len());
        for state in [
            TripState::Idle,
            TripState::RouteSelection,
            TripState::Created,
            TripState::DriverAssigned,
            TripState::PaymentRequired,
        ] {
            for event in &events {
                let mut machine = machine_in(state);
                assert!(machine.apply(event.clone()).is_ok());
            }
        }
    }

    #[test]
    fn test_server_events_alone_never_complete_a_trip() {
        let events = [
            ServerEvent::TripCreated {
                trip_id: Some("t1".into()),
            },
            ServerEvent::TripCompleted { trip_id: None },
            assigned("t1"),
            ServerEvent::TripCompleted {
                trip_id: Some("t1".into()),
            },
            ServerEvent::NoDriversFound { trip_id: None },
            ServerEvent::TripCompleted { trip_id: None },
        ];
        let mut machine = TripStateMachine::new();
        machine.apply(UserAction::SelectRoute(fare())).unwrap();
        for event in events {
            machine.apply(event).unwrap();
            assert_ne!(machine.state(), TripState::Completed);
        }
        assert_eq!(machine.state(), TripState::DriverAssigned);
    }
}
