//! One payment attempt: quote, sign, submit.
//!
//! [`PaymentAuthorizationProtocol::begin`] claims the target URL and returns a
//! [`PaymentAttempt`]. The attempt moves strictly forward through
//! [`AttemptPhase`]; any failure ends it in [`AttemptPhase::Failed`] with the
//! quote and authorization dropped, and a retry is a fresh attempt with a
//! fresh nonce.

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use rand::{Rng, rng};
use ride4low_types::chain::Eip155ChainReference;
use ride4low_types::networks::well_known_test_network;
use ride4low_types::timestamp::UnixTimestamp;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::authority::{SigningAuthority, TokenDomain, TypedDataRequest};
use crate::error::PaymentError;
use crate::policy::QuotePolicy;
use crate::proto::{
    PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER, PaymentAuthorization, PaymentPayload,
    PaymentQuote, QuoteOption, ValidityWindow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptPhase {
    NotStarted,
    QuoteRequested,
    QuoteReceived,
    Signing,
    Submitted,
    Succeeded,
    Failed,
}

impl AttemptPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptPhase::Succeeded | AttemptPhase::Failed)
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptPhase::NotStarted => "not started",
            AttemptPhase::QuoteRequested => "waiting for a quote",
            AttemptPhase::QuoteReceived => "quoted",
            AttemptPhase::Signing => "signing",
            AttemptPhase::Submitted => "submitted",
            AttemptPhase::Succeeded => "succeeded",
            AttemptPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The request a payment unlocks. Sent once for the quote and once more with
/// the payment attached.
#[derive(Debug, Clone)]
pub struct ProtectedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

impl ProtectedRequest {
    pub fn post(url: Url) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Builds an authorization for `option` valid from `now`.
///
/// The window is exactly `maxTimeoutSeconds` long and the nonce is 32 fresh
/// random bytes.
pub fn build_authorization(
    from: Address,
    to: Address,
    option: &QuoteOption,
    now: UnixTimestamp,
) -> PaymentAuthorization {
    let window = ValidityWindow::starting_at(now, option.max_timeout_seconds);
    let nonce: [u8; 32] = rng().random();
    PaymentAuthorization {
        from: from.into(),
        to: to.into(),
        value: option.amount,
        valid_after: window.valid_after,
        valid_before: window.valid_before,
        nonce: B256::from(nonce),
    }
}

/// Deferred-payment client. Cheap to clone; clones share the in-flight registry.
#[derive(Clone)]
pub struct PaymentAuthorizationProtocol {
    http: reqwest::Client,
    authority: Arc<dyn SigningAuthority>,
    policy: QuotePolicy,
    in_flight: Arc<DashMap<Url, ()>>,
}

impl PaymentAuthorizationProtocol {
    pub fn new(authority: Arc<dyn SigningAuthority>) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority,
            policy: QuotePolicy::default(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_policy(mut self, policy: QuotePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &QuotePolicy {
        &self.policy
    }

    pub fn is_in_flight(&self, url: &Url) -> bool {
        self.in_flight.contains_key(url)
    }

    /// Starts an attempt for `request`. Rejected while another attempt for the
    /// same URL has not finished.
    pub fn begin(&self, request: ProtectedRequest) -> Result<PaymentAttempt, PaymentError> {
        match self.in_flight.entry(request.url.clone()) {
            Entry::Occupied(_) => return Err(PaymentError::AttemptInFlight(request.url)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let slot = InFlightSlot {
            registry: Arc::clone(&self.in_flight),
            url: Some(request.url.clone()),
        };
        Ok(PaymentAttempt {
            http: self.http.clone(),
            authority: Arc::clone(&self.authority),
            policy: self.policy.clone(),
            request,
            phase: AttemptPhase::NotStarted,
            quote: None,
            payload: None,
            slot,
        })
    }

    /// Runs a whole attempt and returns the unlocked response body.
    pub async fn pay(&self, request: ProtectedRequest) -> Result<Value, PaymentError> {
        self.begin(request)?.run().await
    }
}

/// Holds a URL in the in-flight registry until released or dropped.
struct InFlightSlot {
    registry: Arc<DashMap<Url, ()>>,
    url: Option<Url>,
}

impl InFlightSlot {
    fn release(&mut self) {
        if let Some(url) = self.url.take() {
            self.registry.remove(&url);
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct PaymentAttempt {
    http: reqwest::Client,
    authority: Arc<dyn SigningAuthority>,
    policy: QuotePolicy,
    request: ProtectedRequest,
    phase: AttemptPhase,
    quote: Option<PaymentQuote>,
    payload: Option<PaymentPayload>,
    slot: InFlightSlot,
}

impl fmt::Debug for PaymentAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentAttempt")
            .field("url", &self.request.url.as_str())
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl PaymentAttempt {
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    pub fn quote(&self) -> Option<&PaymentQuote> {
        self.quote.as_ref()
    }

    pub fn authorization(&self) -> Option<&PaymentAuthorization> {
        self.payload.as_ref().map(|p| &p.payload.authorization)
    }

    pub fn url(&self) -> &Url {
        &self.request.url
    }

    /// Sends the request without payment and expects a 402 quote back.
    #[cfg_attr(feature = "telemetry", instrument(name = "ride4low.x402.request_quote", skip_all, fields(url = %self.request.url), err))]
    pub async fn request_quote(&mut self) -> Result<&PaymentQuote, PaymentError> {
        self.expect_phase(AttemptPhase::NotStarted, "request a quote")?;
        self.phase = AttemptPhase::QuoteRequested;
        match self.fetch_quote().await {
            Ok(quote) => {
                self.phase = AttemptPhase::QuoteReceived;
                Ok(&*self.quote.insert(quote))
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Gets the quote's first option signed by the signing authority.
    #[cfg_attr(feature = "telemetry", instrument(name = "ride4low.x402.authorize", skip_all, fields(url = %self.request.url), err))]
    pub async fn authorize(&mut self) -> Result<&PaymentPayload, PaymentError> {
        self.expect_phase(AttemptPhase::QuoteReceived, "authorize")?;
        self.phase = AttemptPhase::Signing;
        match self.sign().await {
            Ok(payload) => Ok(&*self.payload.insert(payload)),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Resends the original request with the signed payment attached.
    #[cfg_attr(feature = "telemetry", instrument(name = "ride4low.x402.submit", skip_all, fields(url = %self.request.url), err))]
    pub async fn submit(&mut self) -> Result<Value, PaymentError> {
        self.expect_phase(AttemptPhase::Signing, "submit")?;
        let header = match self.payload.as_ref() {
            Some(payload) => payload.to_header_value(),
            None => {
                return Err(PaymentError::OutOfOrder {
                    operation: "submit",
                    phase: self.phase,
                });
            }
        };
        let header = match header {
            Ok(header) => header,
            Err(err) => return Err(self.fail(err.into())),
        };
        self.phase = AttemptPhase::Submitted;
        match self.deliver(&header).await {
            Ok(body) => {
                self.phase = AttemptPhase::Succeeded;
                self.slot.release();
                #[cfg(feature = "telemetry")]
                tracing::info!(url = %self.request.url, "Payment accepted");
                Ok(body)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Quote, sign and submit in order.
    pub async fn run(mut self) -> Result<Value, PaymentError> {
        self.request_quote().await?;
        self.authorize().await?;
        self.submit().await
    }

    fn expect_phase(
        &self,
        expected: AttemptPhase,
        operation: &'static str,
    ) -> Result<(), PaymentError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(PaymentError::OutOfOrder {
                operation,
                phase: self.phase,
            })
        }
    }

    fn fail(&mut self, err: PaymentError) -> PaymentError {
        #[cfg(feature = "telemetry")]
        tracing::warn!(url = %self.request.url, phase = %self.phase, category = %err.category(), error = %err, "Payment attempt failed");
        self.phase = AttemptPhase::Failed;
        self.quote = None;
        self.payload = None;
        self.slot.release();
        err
    }

    async fn send(&self, payment: Option<&str>) -> Result<reqwest::Response, PaymentError> {
        let mut builder = self
            .http
            .request(self.request.method.clone(), self.request.url.clone())
            .headers(self.request.headers.clone());
        if let Some(body) = &self.request.body {
            builder = builder.json(body);
        }
        if let Some(payment) = payment {
            builder = builder.header(PAYMENT_SIGNATURE_HEADER, payment);
        }
        Ok(builder.send().await?)
    }

    async fn fetch_quote(&self) -> Result<PaymentQuote, PaymentError> {
        let response = self.send(None).await?;
        let status = response.status();
        if status.is_success() {
            return Err(PaymentError::PaymentNotRequired);
        }
        if status != StatusCode::PAYMENT_REQUIRED {
            return Err(PaymentError::UnexpectedStatus(status));
        }
        let header = response
            .headers()
            .get(PAYMENT_REQUIRED_HEADER)
            .ok_or_else(|| {
                PaymentError::QuoteExpiredOrInvalid(format!("402 without {PAYMENT_REQUIRED_HEADER} header"))
            })?
            .to_str()
            .map_err(|e| PaymentError::QuoteExpiredOrInvalid(e.to_string()))?;
        let quote = PaymentQuote::decode(header, UnixTimestamp::now())
            .map_err(|e| PaymentError::QuoteExpiredOrInvalid(e.to_string()))?;
        #[cfg(feature = "telemetry")]
        tracing::debug!(options = quote.accepts.len(), "Received payment quote");
        Ok(quote)
    }

    async fn sign(&self) -> Result<PaymentPayload, PaymentError> {
        let quote = self
            .quote
            .as_ref()
            .ok_or_else(|| PaymentError::QuoteExpiredOrInvalid("no quote".into()))?;
        let option = quote.active_option();
        self.policy.check(option)?;

        let now = UnixTimestamp::now();
        if quote.is_stale_at(option, now) {
            return Err(PaymentError::QuoteExpiredOrInvalid(format!(
                "quote received at {} expired after {}s",
                quote.received_at, option.max_timeout_seconds
            )));
        }
        let invalid = |e: &dyn fmt::Display| PaymentError::QuoteExpiredOrInvalid(e.to_string());
        let chain_id = Eip155ChainReference::try_from(&option.network).map_err(|e| invalid(&e))?;
        let asset: Address = option.asset.parse().map_err(|e| invalid(&e))?;
        let pay_to: Address = option.pay_to.parse().map_err(|e| invalid(&e))?;

        self.ensure_network(chain_id, option).await?;

        let from = self
            .authority
            .request_accounts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PaymentError::SigningRejected("no account connected".into()))?;

        let authorization = build_authorization(from, pay_to, option, UnixTimestamp::now());
        let request = TypedDataRequest {
            domain: TokenDomain::for_option(option, chain_id, asset),
            authorization,
        };
        #[cfg(feature = "telemetry")]
        tracing::debug!(?authorization, "Requesting authorization signature");
        let signature = self.authority.sign_typed_data(&request).await?;
        Ok(PaymentPayload::new(authorization, signature, option, quote))
    }

    /// Puts the signing authority on `target`, registering it first when it is
    /// a well-known test network the authority has not heard of.
    async fn ensure_network(
        &self,
        target: Eip155ChainReference,
        option: &QuoteOption,
    ) -> Result<(), PaymentError> {
        let network = &option.network;
        let current = self
            .authority
            .current_network()
            .await
            .map_err(|e| PaymentError::network(network, e))?;
        if current == target {
            return Ok(());
        }
        #[cfg(feature = "telemetry")]
        tracing::info!(%current, %target, "Switching signing authority network");
        match self.authority.switch_network(target).await {
            Ok(()) => Ok(()),
            Err(crate::authority::AuthorityError::UnknownNetwork(reason)) => {
                let Some(descriptor) = well_known_test_network(target) else {
                    return Err(PaymentError::NetworkUnavailable {
                        network: network.clone(),
                        reason,
                    });
                };
                #[cfg(feature = "telemetry")]
                tracing::info!(chain_name = %descriptor.chain_name, "Registering test network");
                self.authority
                    .add_network(&descriptor)
                    .await
                    .map_err(|e| PaymentError::network(network, e))?;
                self.authority
                    .switch_network(target)
                    .await
                    .map_err(|e| PaymentError::network(network, e))
            }
            Err(err) => Err(PaymentError::network(network, err)),
        }
    }

    async fn deliver(&self, header: &str) -> Result<Value, PaymentError> {
        let response = self.send(Some(header)).await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(PaymentError::SubmissionRejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityError;
    use crate::error::ErrorCategory;
    use crate::local::LocalAuthority;
    use crate::proto::TokenAmount;
    use alloy_primitives::{Bytes, Signature};
    use alloy_signer_local::PrivateKeySigner;
    use async_trait::async_trait;
    use ride4low_types::networks::NetworkDescriptor;
    use ride4low_types::util::Base64Bytes;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USDC_BASE_SEPOLIA: &str = "0x036CbD53842c5426634e7929541eC2318f3dCF7e";
    const PAY_TO: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";
    const BASE_SEPOLIA: Eip155ChainReference = Eip155ChainReference::new(84532);

    fn quote_header(network: &str, max_timeout_seconds: u64) -> String {
        Base64Bytes::encode_json(&json!({
            "x402Version": 2,
            "accepts": [{
                "scheme": "exact",
                "amount": "1000000",
                "asset": USDC_BASE_SEPOLIA,
                "network": network,
                "payTo": PAY_TO,
                "maxTimeoutSeconds": max_timeout_seconds,
                "extra": {"name": "USDC", "version": "2"}
            }],
            "resource": {"url": "/trip/pay"}
        }))
        .unwrap()
        .to_string()
    }

    fn without_payment(req: &wiremock::Request) -> bool {
        !req.headers.contains_key(PAYMENT_SIGNATURE_HEADER)
    }

    async fn mount_quote(server: &MockServer, header: String) {
        Mock::given(method("POST"))
            .and(path("/trip/pay"))
            .and(without_payment)
            .respond_with(ResponseTemplate::new(402).insert_header(PAYMENT_REQUIRED_HEADER, header))
            .mount(server)
            .await;
    }

    async fn mount_settlement(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/trip/pay"))
            .and(header_exists(PAYMENT_SIGNATURE_HEADER))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn pay_url(server: &MockServer) -> Url {
        Url::parse(&format!("{}/trip/pay", server.uri())).unwrap()
    }

    fn local(home: Eip155ChainReference) -> Arc<LocalAuthority> {
        Arc::new(LocalAuthority::new(PrivateKeySigner::random(), home))
    }

    /// Delegates to a local key but refuses to sign.
    struct RefusingAuthority(LocalAuthority);

    #[async_trait]
    impl SigningAuthority for RefusingAuthority {
        async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError> {
            self.0.request_accounts().await
        }
        async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError> {
            self.0.current_network().await
        }
        async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError> {
            self.0.switch_network(network).await
        }
        async fn add_network(&self, network: &NetworkDescriptor) -> Result<(), AuthorityError> {
            self.0.add_network(network).await
        }
        async fn sign_typed_data(&self, _: &TypedDataRequest) -> Result<Bytes, AuthorityError> {
            Err(AuthorityError::Rejected("User denied message signature.".into()))
        }
    }

    #[tokio::test]
    async fn test_quote_received_and_window() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;

        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let mut attempt = protocol.begin(ProtectedRequest::post(pay_url(&server))).unwrap();
        assert_eq!(attempt.phase(), AttemptPhase::NotStarted);
        let quote = attempt.request_quote().await.unwrap().clone();
        assert_eq!(attempt.phase(), AttemptPhase::QuoteReceived);
        let option = quote.active_option();
        assert_eq!(option.amount, TokenAmount::new(1_000_000));

        attempt.authorize().await.unwrap();
        assert_eq!(attempt.phase(), AttemptPhase::Signing);
        let authorization = attempt.authorization().unwrap();
        assert_eq!(
            authorization.valid_before.seconds_since(authorization.valid_after),
            120
        );
        assert!(authorization.valid_after >= quote.received_at);
    }

    #[tokio::test]
    async fn test_full_payment_succeeds() {
        let server = MockServer::start().await;
        mount_settlement(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"status": "paid", "tripID": "t1"})),
        )
        .await;
        mount_quote(&server, quote_header("eip155:84532", 300)).await;

        let authority = local(BASE_SEPOLIA);
        let protocol = PaymentAuthorizationProtocol::new(authority.clone());
        let body = protocol
            .pay(ProtectedRequest::post(pay_url(&server)).with_json(json!({"tripID": "t1"})))
            .await
            .unwrap();
        assert_eq!(body, json!({"status": "paid", "tripID": "t1"}));
        assert!(!protocol.is_in_flight(&pay_url(&server)));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let paid = &requests[1];
        assert_eq!(paid.body_json::<Value>().unwrap(), json!({"tripID": "t1"}));
        let header = paid.headers.get(PAYMENT_SIGNATURE_HEADER).unwrap().to_str().unwrap();
        let payload: PaymentPayload = Base64Bytes::from(header).decode_json().unwrap();
        assert!(payload.accepted.as_str().contains(PAY_TO));
        assert_eq!(payload.payload.authorization.from.0, authority.address());

        let request = TypedDataRequest {
            domain: TokenDomain {
                name: "USDC".into(),
                version: "2".into(),
                chain_id: BASE_SEPOLIA,
                verifying_contract: USDC_BASE_SEPOLIA.parse().unwrap(),
            },
            authorization: payload.payload.authorization,
        };
        let signature = Signature::try_from(payload.payload.signature.as_ref()).unwrap();
        let recovered = signature
            .recover_address_from_prehash(&request.signing_hash())
            .unwrap();
        assert_eq!(recovered, authority.address());
    }

    #[tokio::test]
    async fn test_signing_rejected_discards_attempt_state() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;

        let authority = RefusingAuthority(LocalAuthority::new(PrivateKeySigner::random(), BASE_SEPOLIA));
        let protocol = PaymentAuthorizationProtocol::new(Arc::new(authority));
        let url = pay_url(&server);
        let mut attempt = protocol.begin(ProtectedRequest::post(url.clone())).unwrap();
        attempt.request_quote().await.unwrap();
        let err = attempt.authorize().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::SigningRejected);
        assert_eq!(attempt.phase(), AttemptPhase::Failed);
        assert!(attempt.quote().is_none());
        assert!(attempt.authorization().is_none());
        assert!(!protocol.is_in_flight(&url));

        let err = attempt.submit().await.unwrap_err();
        assert!(matches!(err, PaymentError::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn test_success_at_quote_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&server)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::PaymentNotRequired));
        assert_eq!(err.category(), ErrorCategory::ProtocolDecode);
    }

    #[tokio::test]
    async fn test_missing_or_bad_quote_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402))
            .mount(&server)
            .await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&server)))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::QuoteExpiredOrInvalid);

        let garbled = MockServer::start().await;
        mount_quote(&garbled, "bm90IGpzb24=".to_string()).await;
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&garbled)))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::QuoteExpiredOrInvalid);
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&server)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnexpectedStatus(StatusCode::INTERNAL_SERVER_ERROR)));
        assert_eq!(err.category(), ErrorCategory::Transport);
    }

    #[tokio::test]
    async fn test_submission_rejected() {
        let server = MockServer::start().await;
        mount_settlement(&server, ResponseTemplate::new(402).set_body_string("nonce already used")).await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&server)))
            .await
            .unwrap_err();
        match err {
            PaymentError::SubmissionRejected { status, body } => {
                assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
                assert_eq!(body, "nonce already used");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_test_network_is_added_then_switched() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;
        let authority = local(Eip155ChainReference::new(1));
        let protocol = PaymentAuthorizationProtocol::new(authority.clone());
        let mut attempt = protocol.begin(ProtectedRequest::post(pay_url(&server))).unwrap();
        attempt.request_quote().await.unwrap();
        attempt.authorize().await.unwrap();
        assert_eq!(authority.current_network().await.unwrap(), BASE_SEPOLIA);
    }

    /// Accepts every added network but never manages to switch to one.
    #[derive(Default)]
    struct StuckAuthority {
        switches: AtomicUsize,
        additions: AtomicUsize,
    }

    #[async_trait]
    impl SigningAuthority for StuckAuthority {
        async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError> {
            Ok(vec![PAY_TO.parse().unwrap()])
        }
        async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError> {
            Ok(Eip155ChainReference::new(1))
        }
        async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            Err(AuthorityError::UnknownNetwork(format!("Unrecognized chain ID {network}")))
        }
        async fn add_network(&self, _: &NetworkDescriptor) -> Result<(), AuthorityError> {
            self.additions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn sign_typed_data(&self, _: &TypedDataRequest) -> Result<Bytes, AuthorityError> {
            panic!("must not sign without the quoted network")
        }
    }

    #[tokio::test]
    async fn test_switch_is_retried_only_once_after_adding() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;
        let authority = Arc::new(StuckAuthority::default());
        let protocol = PaymentAuthorizationProtocol::new(authority.clone());
        let mut attempt = protocol.begin(ProtectedRequest::post(pay_url(&server))).unwrap();
        attempt.request_quote().await.unwrap();

        let err = attempt.authorize().await.unwrap_err();
        assert!(matches!(err, PaymentError::NetworkUnavailable { .. }));
        assert_eq!(attempt.phase(), AttemptPhase::Failed);
        assert!(attempt.quote().is_none());
        assert_eq!(authority.additions.load(Ordering::SeqCst), 1);
        assert_eq!(authority.switches.load(Ordering::SeqCst), 2);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_mainnet_is_not_added() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:8453", 120)).await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let mut attempt = protocol.begin(ProtectedRequest::post(pay_url(&server))).unwrap();
        attempt.request_quote().await.unwrap();
        let err = attempt.authorize().await.unwrap_err();
        assert!(matches!(err, PaymentError::NetworkUnavailable { .. }));
        assert_eq!(attempt.phase(), AttemptPhase::Failed);
    }

    #[tokio::test]
    async fn test_policy_refuses_before_signing() {
        let server = MockServer::start().await;
        mount_quote(&server, quote_header("eip155:84532", 120)).await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA))
            .with_policy(QuotePolicy::default().max_amount(TokenAmount::new(999_999)));
        let err = protocol
            .pay(ProtectedRequest::post(pay_url(&server)))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::QuoteNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_one_attempt_in_flight_per_url() {
        let server = MockServer::start().await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let url = pay_url(&server);
        let first = protocol.begin(ProtectedRequest::post(url.clone())).unwrap();
        let err = protocol.begin(ProtectedRequest::post(url.clone())).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);

        let other = Url::parse(&format!("{}/trip/other", server.uri())).unwrap();
        assert!(protocol.begin(ProtectedRequest::post(other)).is_ok());

        drop(first);
        assert!(protocol.begin(ProtectedRequest::post(url)).is_ok());
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_refused() {
        let server = MockServer::start().await;
        let protocol = PaymentAuthorizationProtocol::new(local(BASE_SEPOLIA));
        let mut attempt = protocol.begin(ProtectedRequest::post(pay_url(&server))).unwrap();
        assert!(matches!(
            attempt.authorize().await,
            Err(PaymentError::OutOfOrder { .. })
        ));
        assert!(matches!(
            attempt.submit().await,
            Err(PaymentError::OutOfOrder { .. })
        ));
        assert_eq!(attempt.phase(), AttemptPhase::NotStarted);
    }

    #[test]
    fn test_nonces_are_unique() {
        let header = quote_header("eip155:84532", 60);
        let quote = PaymentQuote::decode(&header, UnixTimestamp::from_secs(0)).unwrap();
        let option = quote.active_option();
        let now = UnixTimestamp::from_secs(1_700_000_000);
        let nonces: std::collections::HashSet<B256> = (0..64)
            .map(|_| build_authorization(Address::ZERO, Address::ZERO, option, now).nonce)
            .collect();
        assert_eq!(nonces.len(), 64);
    }

    #[test]
    fn test_window_never_exceeds_timeout() {
        let header = quote_header("eip155:84532", 45);
        let quote = PaymentQuote::decode(&header, UnixTimestamp::from_secs(0)).unwrap();
        let option = quote.active_option();
        for now in [0u64, 1, 1_700_000_000, u64::MAX - 10] {
            let auth = build_authorization(Address::ZERO, Address::ZERO, option, UnixTimestamp::from_secs(now));
            assert!(auth.valid_before.seconds_since(auth.valid_after) <= 45);
            assert_eq!(auth.valid_after, UnixTimestamp::from_secs(now));
        }
    }
}
