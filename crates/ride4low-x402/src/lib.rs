//! HTTP 402 deferred payments for Ride4Low riders.
//!
//! A protected endpoint (trip payment, typically `POST /trip/pay`) answers an
//! unpaid request with `402 Payment Required` and a quote. This crate turns
//! that quote into an EIP-3009 `transferWithAuthorization` signed by the
//! rider's [`SigningAuthority`] and resends the request with the proof
//! attached.
//!
//! ```no_run
//! use ride4low_types::chain::Eip155ChainReference;
//! use ride4low_x402::{LocalAuthority, PaymentAuthorizationProtocol, ProtectedRequest};
//! use std::sync::Arc;
//!
//! # async fn pay() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = "0x...".parse()?;
//! let authority = LocalAuthority::new(signer, Eip155ChainReference::new(84532));
//! let protocol = PaymentAuthorizationProtocol::new(Arc::new(authority));
//! let url = "https://api.ride4low.example/trip/pay".parse()?;
//! let body = protocol
//!     .pay(ProtectedRequest::post(url).with_json(serde_json::json!({"tripID": "t1"})))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`proto`] - Header wire format: quotes, authorizations, payment payloads
//! - [`authority`] - The [`SigningAuthority`] seam and EIP-712 typed data
//! - [`local`] - In-process private key authority
//! - [`eip1193`] - Wallet authority over JSON-RPC
//! - [`policy`] - Rider-side limits on what gets signed
//! - [`protocol`] - The attempt state machine

pub mod authority;
pub mod eip1193;
mod error;
pub mod local;
pub mod policy;
pub mod proto;
pub mod protocol;

pub use authority::{AuthorityError, SigningAuthority, TokenDomain, TypedDataRequest};
pub use eip1193::Eip1193Authority;
pub use error::{ErrorCategory, PaymentError};
pub use local::LocalAuthority;
pub use policy::{PolicyViolation, QuotePolicy};
pub use proto::{PaymentAuthorization, PaymentPayload, PaymentQuote, QuoteOption, TokenAmount};
pub use protocol::{
    AttemptPhase, PaymentAttempt, PaymentAuthorizationProtocol, ProtectedRequest,
    build_authorization,
};
