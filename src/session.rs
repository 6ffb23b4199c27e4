//! One signed-in rider: event stream, trip machine and payments wired together.

use ride4low_stream::{StreamError, StreamEvent, TripEventStream};
use ride4low_types::ride::{Coordinate, PaymentMethod, RouteFare, UserId};
use ride4low_x402::{
    ErrorCategory, PaymentAttempt, PaymentAuthorizationProtocol, PaymentError, ProtectedRequest,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::trip::{
    PaymentOutcome, Transition, TripError, TripSession, TripState, TripStateMachine, UserAction,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Trip(#[from] TripError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// An inbound stream event and what it did to the trip.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub event: StreamEvent,
    /// `None` for events that never reach the state machine.
    pub transition: Option<Transition>,
}

/// Drives a rider's trip from route selection to payment.
///
/// Stream events reach the state machine strictly in arrival order through
/// [`RiderSession::next_event`]. Crypto payments run inline: the session
/// suspends until the attempt finishes, then reports the outcome to the
/// machine.
pub struct RiderSession {
    stream: TripEventStream,
    machine: TripStateMachine,
    payments: PaymentAuthorizationProtocol,
    payment_url: Url,
    user_id: Option<UserId>,
}

impl RiderSession {
    pub fn new(
        stream: TripEventStream,
        payments: PaymentAuthorizationProtocol,
        payment_url: Url,
    ) -> Self {
        Self {
            stream,
            machine: TripStateMachine::new(),
            payments,
            payment_url,
            user_id: None,
        }
    }

    pub fn state(&self) -> TripState {
        self.machine.state()
    }

    pub fn trip(&self) -> &TripSession {
        self.machine.session()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_open()
    }

    /// Opens the event stream for `user_id`. An empty id connects nothing.
    pub async fn start(
        &mut self,
        user_id: &str,
        location: Option<Coordinate>,
    ) -> Result<(), SessionError> {
        self.stream.open(user_id, location).await?;
        self.user_id = UserId::new(user_id).ok();
        Ok(())
    }

    pub fn send_location(&self, location: Coordinate) -> Result<(), SessionError> {
        Ok(self.stream.send_location(location)?)
    }

    /// Waits for the next inbound event and applies it. `None` once the
    /// stream is closed or was never opened.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.stream.next_event().await?;
        let transition = match &event {
            StreamEvent::Server(server) => self.machine.apply(server.clone()).ok(),
            StreamEvent::UnknownMessage { raw, reason } => {
                tracing::warn!(raw, reason, "Unknown message on event stream");
                None
            }
            StreamEvent::TransportError { reason } => {
                tracing::warn!(reason, "Event stream transport error");
                None
            }
            StreamEvent::Closed { reason } => {
                tracing::info!(?reason, "Event stream closed by backend");
                None
            }
        };
        Some(SessionEvent { event, transition })
    }

    pub fn select_route(&mut self, fare: RouteFare) -> Result<Transition, SessionError> {
        Ok(self.machine.apply(UserAction::SelectRoute(fare))?)
    }

    /// Card selection is announced to the backend, which answers with a
    /// checkout session. Crypto selection pays right away.
    pub async fn select_payment_method(
        &mut self,
        method: PaymentMethod,
    ) -> Result<Transition, SessionError> {
        let transition = self
            .machine
            .apply(UserAction::SelectPaymentMethod(method))?;
        if !matches!(
            transition,
            Transition::Moved {
                to: TripState::PaymentRequired,
                ..
            }
        ) {
            return Ok(transition);
        }
        match method {
            PaymentMethod::Card => {
                let trip_id = self.machine.trip_id().ok_or(TripError::MissingTripId)?;
                self.stream.send_payment_method_selection(method, trip_id)?;
                Ok(transition)
            }
            PaymentMethod::Crypto => self.pay_with_crypto().await,
        }
    }

    /// [`Self::select_payment_method`], abandoned when `cancel` fires first.
    ///
    /// An abandoned crypto payment is recorded as a failure, so the trip stays
    /// in `PaymentRequired` without a quote and can be paid again later.
    /// Returns `Ok(None)` when abandoned.
    pub async fn select_payment_method_until(
        &mut self,
        method: PaymentMethod,
        cancel: &CancellationToken,
    ) -> Result<Option<Transition>, SessionError> {
        let selected = tokio::select! {
            _ = cancel.cancelled() => None,
            selected = self.select_payment_method(method) => Some(selected),
        };
        match selected {
            Some(selected) => selected.map(Some),
            None => {
                tracing::info!(%method, "Payment method selection abandoned");
                if self.state() == TripState::PaymentRequired {
                    self.machine.apply(PaymentOutcome::Failed {
                        category: ErrorCategory::Usage,
                        reason: "payment abandoned".into(),
                    })?;
                }
                Ok(None)
            }
        }
    }

    /// Runs one crypto payment attempt for the current trip. Call again to
    /// retry after a failure; every call quotes and signs afresh.
    ///
    /// Refused before any request is sent unless the trip is in
    /// `PaymentRequired` with crypto selected.
    #[tracing::instrument(skip_all, fields(trip_id = ?self.machine.trip_id()), err)]
    pub async fn pay_with_crypto(&mut self) -> Result<Transition, SessionError> {
        let trip = self.machine.session();
        if trip.state != TripState::PaymentRequired
            || trip.payment_method != Some(PaymentMethod::Crypto)
        {
            return Err(TripError::NotAwaitingCryptoPayment(trip.state).into());
        }
        let trip_id = self
            .machine
            .trip_id()
            .cloned()
            .ok_or(TripError::MissingTripId)?;
        let body = json!({
            "tripID": trip_id,
            "userID": self.user_id,
        });
        let request = ProtectedRequest::post(self.payment_url.clone()).with_json(body);
        let mut attempt = self.payments.begin(request)?;
        match self.drive(&mut attempt).await {
            Ok(body) => {
                let transition = self.machine.apply(PaymentOutcome::Succeeded(body))?;
                self.stream
                    .send_payment_method_selection(PaymentMethod::Crypto, &trip_id)?;
                Ok(transition)
            }
            Err(err) => {
                self.machine.apply(PaymentOutcome::Failed {
                    category: err.category(),
                    reason: err.to_string(),
                })?;
                Err(err.into())
            }
        }
    }

    async fn drive(&mut self, attempt: &mut PaymentAttempt) -> Result<Value, PaymentError> {
        let quote = attempt.request_quote().await?.clone();
        if let Ok(transition) = self.machine.apply(PaymentOutcome::QuoteReceived(quote)) {
            tracing::debug!(?transition, "Quote attached to trip");
        }
        attempt.authorize().await?;
        attempt.submit().await
    }

    pub fn change_payment_method(&mut self) -> Result<Transition, SessionError> {
        Ok(self.machine.apply(UserAction::ClearPaymentMethod)?)
    }

    pub fn cancel(&mut self) -> Result<Transition, SessionError> {
        Ok(self.machine.apply(UserAction::Cancel)?)
    }

    pub fn reset(&mut self) -> Result<Transition, SessionError> {
        Ok(self.machine.apply(UserAction::Reset)?)
    }

    /// Closes the event stream. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.stream.close().await;
    }
}
