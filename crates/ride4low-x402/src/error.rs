use http::StatusCode;
use ride4low_types::chain::ChainId;
use std::fmt;
use url::Url;

use crate::authority::AuthorityError;
use crate::policy::PolicyViolation;
use crate::protocol::AttemptPhase;

/// Why a payment attempt did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {0} while requesting a quote")]
    UnexpectedStatus(StatusCode),
    /// The resource answered 2xx without a payment.
    #[error("Payment not required for this resource")]
    PaymentNotRequired,
    #[error("Quote is missing, expired or invalid: {0}")]
    QuoteExpiredOrInvalid(String),
    #[error("Quote refused: {0}")]
    QuoteNotAllowed(#[from] PolicyViolation),
    #[error("Signing rejected: {0}")]
    SigningRejected(String),
    #[error("Network {network} unavailable: {reason}")]
    NetworkUnavailable { network: ChainId, reason: String },
    #[error("Payment rejected with HTTP {status}: {body}")]
    SubmissionRejected { status: StatusCode, body: String },
    #[error("Failed to encode payment payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("A payment attempt for {0} is already in flight")]
    AttemptInFlight(Url),
    #[error("Cannot {operation} while the attempt is {phase}")]
    OutOfOrder {
        operation: &'static str,
        phase: AttemptPhase,
    },
}

/// Coarse failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Channel or network failure.
    Transport,
    /// A well-formed exchange that did not follow the protocol.
    ProtocolDecode,
    /// The signing authority declined an account, network or signature request.
    SigningRejected,
    /// No usable quote; nothing was signed.
    QuoteExpiredOrInvalid,
    /// The server refused the payment proof.
    SubmissionRejected,
    /// The caller used the attempt wrongly.
    Usage,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::ProtocolDecode => "protocol_decode",
            ErrorCategory::SigningRejected => "signing_rejected",
            ErrorCategory::QuoteExpiredOrInvalid => "quote_expired_or_invalid",
            ErrorCategory::SubmissionRejected => "submission_rejected",
            ErrorCategory::Usage => "usage",
        };
        f.write_str(name)
    }
}

impl PaymentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PaymentError::Transport(_) | PaymentError::UnexpectedStatus(_) => {
                ErrorCategory::Transport
            }
            PaymentError::PaymentNotRequired | PaymentError::Encode(_) => {
                ErrorCategory::ProtocolDecode
            }
            PaymentError::QuoteExpiredOrInvalid(_) | PaymentError::QuoteNotAllowed(_) => {
                ErrorCategory::QuoteExpiredOrInvalid
            }
            PaymentError::SigningRejected(_) | PaymentError::NetworkUnavailable { .. } => {
                ErrorCategory::SigningRejected
            }
            PaymentError::SubmissionRejected { .. } => ErrorCategory::SubmissionRejected,
            PaymentError::AttemptInFlight(_) | PaymentError::OutOfOrder { .. } => {
                ErrorCategory::Usage
            }
        }
    }

    /// Failure of a network switch or registration on `network`.
    pub(crate) fn network(network: &ChainId, error: AuthorityError) -> Self {
        match error {
            AuthorityError::Rejected(reason) => PaymentError::SigningRejected(reason),
            other => PaymentError::NetworkUnavailable {
                network: network.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<AuthorityError> for PaymentError {
    fn from(error: AuthorityError) -> Self {
        match error {
            AuthorityError::Rejected(reason) => PaymentError::SigningRejected(reason),
            other => PaymentError::SigningRejected(other.to_string()),
        }
    }
}
