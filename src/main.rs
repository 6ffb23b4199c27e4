//! Headless Ride4Low rider.
//!
//! Connects to the coordination backend as one rider, optionally picks the
//! configured route, then follows the trip until it completes or is cancelled.
//! When a driver is assigned and a payment method is configured, the rider
//! selects it; crypto selection pays through the x402 flow right away.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` points at the JSON config file (default `config.json`)
//! - `WEBSOCKET_URL`, `API_URL`, `WALLET_RPC_URL` override the default endpoints
//! - `RUST_LOG` controls log verbosity
//! - `OTEL_*` variables enable trace and metric export

use dotenvy::dotenv;
use ride4low::config::Config;
use ride4low::session::RiderSession;
use ride4low::trip::TripState;
use ride4low::util::{SigDown, Telemetry};
use ride4low_stream::{StreamConfig, TripEventStream};
use ride4low_x402::PaymentAuthorizationProtocol;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    // Initialize rustls crypto provider (ring) for wss:// event streams
    if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = Config::load()?;

    let authority = config.signing_authority()?;
    let payments =
        PaymentAuthorizationProtocol::new(authority).with_policy(config.quote_policy().clone());
    let stream = TripEventStream::new(StreamConfig::new(config.websocket_url().clone()));
    let mut session = RiderSession::new(stream, payments, config.payment_url()?);

    if config.user_id().is_empty() {
        tracing::warn!("No user_id configured, the event stream stays closed");
    }
    session.start(config.user_id(), config.location()).await?;
    if let Some(fare) = config.fare() {
        session.select_route(fare.clone())?;
    }

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    let mut payment_selected = false;
    loop {
        let event = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            event = session.next_event() => event,
        };
        let Some(event) = event else {
            tracing::info!("Event stream ended");
            break;
        };
        tracing::debug!(?event, "Session event");

        let state = session.state();
        if state == TripState::DriverAssigned && !payment_selected {
            if let Some(method) = config.payment_method() {
                payment_selected = true;
                // A wallet may hold the signing prompt open indefinitely.
                match session
                    .select_payment_method_until(method, &cancellation_token)
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => tracing::error!(error = %err, %method, "Payment failed"),
                }
            }
        }
        if session.state().is_terminal() {
            tracing::info!(state = %session.state(), "Trip finished");
            break;
        }
    }

    session.shutdown().await;
    sig_down.shutdown().await;
    Ok(())
}
