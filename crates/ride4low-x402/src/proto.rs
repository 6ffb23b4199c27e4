//! Wire format of the HTTP 402 exchange.
//!
//! A protected resource answers the first request with `402 Payment Required`
//! and a `PAYMENT-REQUIRED` header: base64 JSON of a [`PaymentQuote`]. The rider
//! resends the same request with a `PAYMENT-SIGNATURE` header: base64 JSON of a
//! [`PaymentPayload`] carrying a signed EIP-3009 [`PaymentAuthorization`].
//!
//! The chosen option and the resource descriptor are echoed back exactly as the
//! server sent them, so both are kept as [`OriginalJson`].

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::sol;
use ride4low_types::chain::ChainId;
use ride4low_types::timestamp::UnixTimestamp;
use ride4low_types::util::{Base64Bytes, b64::Base64JsonError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;

/// Response header carrying the quote.
pub const PAYMENT_REQUIRED_HEADER: &str = "PAYMENT-REQUIRED";
/// Request header carrying the signed payment.
pub const PAYMENT_SIGNATURE_HEADER: &str = "PAYMENT-SIGNATURE";

/// Version marker that serializes as `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

impl X402Version2 {
    pub const VALUE: u8 = 2;
}

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = u8::deserialize(deserializer)?;
        if version == Self::VALUE {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected x402Version 2, got {version}"
            )))
        }
    }
}

/// Verbatim JSON, echoed back to the server unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalJson(pub Box<RawValue>);

impl OriginalJson {
    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for OriginalJson {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

/// Token amount in minor units, a decimal string on the wire (`"1000000"` is 1 USDC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub fn new(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid token amount {0}, expected a decimal integer")]
pub struct TokenAmountParseError(String);

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| TokenAmountParseError(s.to_string()))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An Ethereum address that serializes with EIP-55 checksum encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChecksummedAddress(pub Address);

impl FromStr for ChecksummedAddress {
    type Err = alloy_primitives::hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_str(s).map(Self)
    }
}

impl fmt::Display for ChecksummedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_checksum(None))
    }
}

impl Serialize for ChecksummedAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_checksum(None))
    }
}

impl<'de> Deserialize<'de> for ChecksummedAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<Address> for ChecksummedAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl From<ChecksummedAddress> for Address {
    fn from(value: ChecksummedAddress) -> Self {
        value.0
    }
}

/// Token contract's EIP-712 domain name and version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One way of paying that the server accepts.
///
/// Addresses stay as the server wrote them; they are only parsed when an
/// authorization is built, so a quote naming a foreign address format still
/// decodes.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteOption {
    pub scheme: Option<String>,
    pub amount: TokenAmount,
    pub asset: String,
    pub network: ChainId,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub extra: Option<AssetMetadata>,
    /// The option exactly as received.
    pub original: OriginalJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteOptionFields {
    #[serde(default)]
    scheme: Option<String>,
    amount: TokenAmount,
    asset: String,
    network: ChainId,
    pay_to: String,
    max_timeout_seconds: u64,
    #[serde(default)]
    extra: Option<AssetMetadata>,
}

impl TryFrom<&OriginalJson> for QuoteOption {
    type Error = serde_json::Error;

    fn try_from(value: &OriginalJson) -> Result<Self, Self::Error> {
        let fields: QuoteOptionFields = serde_json::from_str(value.as_str())?;
        Ok(QuoteOption {
            scheme: fields.scheme,
            amount: fields.amount,
            asset: fields.asset,
            network: fields.network,
            pay_to: fields.pay_to,
            max_timeout_seconds: fields.max_timeout_seconds,
            extra: fields.extra,
            original: value.clone(),
        })
    }
}

impl QuoteOption {
    /// EIP-712 domain name, `USDC` unless the option says otherwise.
    pub fn domain_name(&self) -> &str {
        self.extra
            .as_ref()
            .and_then(|e| e.name.as_deref())
            .unwrap_or(DEFAULT_DOMAIN_NAME)
    }

    /// EIP-712 domain version, `2` unless the option says otherwise.
    pub fn domain_version(&self) -> &str {
        self.extra
            .as_ref()
            .and_then(|e| e.version.as_deref())
            .unwrap_or(DEFAULT_DOMAIN_VERSION)
    }
}

pub const DEFAULT_DOMAIN_NAME: &str = "USDC";
pub const DEFAULT_DOMAIN_VERSION: &str = "2";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequiredWire {
    #[serde(default)]
    x402_version: Option<u8>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    resource: Option<OriginalJson>,
    #[serde(default)]
    accepts: Vec<OriginalJson>,
}

/// Payment terms decoded from a `PAYMENT-REQUIRED` header.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentQuote {
    /// Every option the server listed, verbatim.
    pub accepts: Vec<OriginalJson>,
    /// `accepts[0]`, decoded. The only option ever paid.
    pub option: QuoteOption,
    /// Resource descriptor, opaque to the rider.
    pub resource: Option<OriginalJson>,
    pub x402_version: Option<u8>,
    /// Server-side explanation, if it sent one.
    pub error: Option<String>,
    /// Local clock when the quote arrived.
    pub received_at: UnixTimestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum QuoteDecodeError {
    #[error("Failed to decode PAYMENT-REQUIRED header: {0}")]
    Header(#[from] Base64JsonError),
    #[error("Quote offers no payment option")]
    NoOptions,
    #[error("First payment option is unusable: {0}")]
    FirstOption(#[source] serde_json::Error),
}

impl PaymentQuote {
    /// Decodes the header value. The first listed option is authoritative:
    /// when it does not fit the EVM "exact" shape the whole quote is refused,
    /// whatever the later options say.
    pub fn decode(header: &str, received_at: UnixTimestamp) -> Result<Self, QuoteDecodeError> {
        let wire: PaymentRequiredWire = Base64Bytes::from(header).decode_json()?;
        let first = wire.accepts.first().ok_or(QuoteDecodeError::NoOptions)?;
        let option = QuoteOption::try_from(first).map_err(QuoteDecodeError::FirstOption)?;
        Ok(PaymentQuote {
            option,
            accepts: wire.accepts,
            resource: wire.resource,
            x402_version: wire.x402_version,
            error: wire.error,
            received_at,
        })
    }

    /// The option to pay with.
    pub fn active_option(&self) -> &QuoteOption {
        &self.option
    }

    /// A quote is stale once `received_at + maxTimeoutSeconds` has passed.
    pub fn is_stale_at(&self, option: &QuoteOption, now: UnixTimestamp) -> bool {
        now > self.received_at + option.max_timeout_seconds
    }
}

/// Time bounds of an authorization. Never wider than the quote allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
}

impl ValidityWindow {
    pub fn starting_at(now: UnixTimestamp, max_timeout_seconds: u64) -> Self {
        Self {
            valid_after: now,
            valid_before: now + max_timeout_seconds,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        self.valid_before.seconds_since(self.valid_after)
    }
}

/// EIP-3009 `transferWithAuthorization` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub from: ChecksummedAddress,
    pub to: ChecksummedAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
}

impl PaymentAuthorization {
    /// The struct whose EIP-712 hash gets signed. Must mirror `self` exactly:
    /// the verifier rebuilds it from the authorization.
    pub fn to_typed_struct(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from.0,
            to: self.to.0,
            value: self.value.0,
            validAfter: U256::from(self.valid_after.as_secs()),
            validBefore: U256::from(self.valid_before.as_secs()),
            nonce: self.nonce,
        }
    }
}

sol!(
    /// ERC-3009 `transferWithAuthorization` as EIP-712 typed data.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

/// Signed authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactPayload {
    pub authorization: PaymentAuthorization,
    pub signature: Bytes,
}

/// Body of the `PAYMENT-SIGNATURE` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version2,
    pub payload: ExactPayload,
    pub accepted: OriginalJson,
    pub resource: Option<OriginalJson>,
}

impl PaymentPayload {
    pub fn new(
        authorization: PaymentAuthorization,
        signature: Bytes,
        option: &QuoteOption,
        quote: &PaymentQuote,
    ) -> Self {
        Self {
            x402_version: X402Version2,
            payload: ExactPayload {
                authorization,
                signature,
            },
            accepted: option.original.clone(),
            resource: quote.resource.clone(),
        }
    }

    /// Base64 JSON, ready for the `PAYMENT-SIGNATURE` header.
    pub fn to_header_value(&self) -> Result<String, serde_json::Error> {
        Ok(Base64Bytes::encode_json(self)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(value: serde_json::Value) -> String {
        Base64Bytes::encode_json(&value).unwrap().to_string()
    }

    #[test]
    fn test_decode_quote_with_short_addresses() {
        let header = header(json!({
            "accepts": [{
                "amount": "1000000",
                "asset": "0xabc",
                "network": "eip155:84532",
                "payTo": "0xdef",
                "maxTimeoutSeconds": 120
            }],
            "resource": "r1"
        }));
        let received_at = UnixTimestamp::from_secs(1_700_000_000);
        let quote = PaymentQuote::decode(&header, received_at).unwrap();
        let option = quote.active_option();
        assert_eq!(option.amount, TokenAmount::new(1_000_000));
        assert_eq!(option.network, ChainId::new("eip155", "84532"));
        assert_eq!(option.asset, "0xabc");
        assert_eq!(option.domain_name(), "USDC");
        assert_eq!(option.domain_version(), "2");
        assert_eq!(quote.resource.as_ref().unwrap().as_str(), "\"r1\"");

        let window = ValidityWindow::starting_at(received_at, option.max_timeout_seconds);
        assert_eq!(window.valid_before, received_at + 120);
    }

    #[test]
    fn test_first_option_is_authoritative() {
        let header = header(json!({
            "x402Version": 2,
            "accepts": [
                {"amount": "5", "asset": "a", "network": "eip155:8453", "payTo": "b", "maxTimeoutSeconds": 60,
                 "extra": {"name": "USD Coin", "version": "1"}},
                {"amount": "99000000", "asset": "a", "network": "eip155:84532", "payTo": "b", "maxTimeoutSeconds": 60}
            ]
        }));
        let quote = PaymentQuote::decode(&header, UnixTimestamp::from_secs(0)).unwrap();
        assert_eq!(quote.accepts.len(), 2);
        assert_eq!(quote.x402_version, Some(2));
        let option = quote.active_option();
        assert_eq!(option.network, ChainId::new("eip155", "8453"));
        assert_eq!(option.amount, TokenAmount::new(5));
        assert_eq!(option.domain_name(), "USD Coin");
        assert_eq!(option.domain_version(), "1");
    }

    #[test]
    fn test_unusable_first_option_refuses_quote() {
        let header = header(json!({
            "accepts": [
                {"amount": "1.5", "asset": "a", "network": "eip155:8453", "payTo": "b", "maxTimeoutSeconds": 60},
                {"amount": "99000000", "asset": "a", "network": "eip155:84532", "payTo": "b", "maxTimeoutSeconds": 60}
            ]
        }));
        assert!(matches!(
            PaymentQuote::decode(&header, UnixTimestamp::from_secs(0)),
            Err(QuoteDecodeError::FirstOption(_))
        ));
    }

    #[test]
    fn test_decode_quote_errors() {
        assert!(matches!(
            PaymentQuote::decode("%%%", UnixTimestamp::from_secs(0)),
            Err(QuoteDecodeError::Header(_))
        ));
        let empty = header(json!({"accepts": [], "resource": null}));
        assert!(matches!(
            PaymentQuote::decode(&empty, UnixTimestamp::from_secs(0)),
            Err(QuoteDecodeError::NoOptions)
        ));
    }

    #[test]
    fn test_quote_staleness() {
        let header = header(json!({
            "accepts": [{"amount": "1", "asset": "a", "network": "eip155:1", "payTo": "b", "maxTimeoutSeconds": 30}]
        }));
        let received_at = UnixTimestamp::from_secs(1_000);
        let quote = PaymentQuote::decode(&header, received_at).unwrap();
        let option = quote.active_option();
        assert!(!quote.is_stale_at(option, UnixTimestamp::from_secs(1_030)));
        assert!(quote.is_stale_at(option, UnixTimestamp::from_secs(1_031)));
    }

    #[test]
    fn test_payload_wire_shape() {
        let option_json = r#"{"amount":"1000000","asset":"0x036CbD53842c5426634e7929541eC2318f3dCF7e","network":"eip155:84532","payTo":"0x209693Bc6afc0C5328bA36FaF03C514EF312287C","maxTimeoutSeconds":120}"#;
        let header = Base64Bytes::encode(format!(r#"{{"accepts":[{option_json}],"resource":{{"url":"/trip/pay"}}}}"#))
            .to_string();
        let quote = PaymentQuote::decode(&header, UnixTimestamp::from_secs(1_700_000_000)).unwrap();
        let option = quote.active_option();

        let authorization = PaymentAuthorization {
            from: Address::repeat_byte(0x11).into(),
            to: option.pay_to.parse().unwrap(),
            value: option.amount,
            valid_after: UnixTimestamp::from_secs(1_700_000_000),
            valid_before: UnixTimestamp::from_secs(1_700_000_120),
            nonce: B256::repeat_byte(0xab),
        };
        let payload = PaymentPayload::new(authorization, Bytes::from(vec![1u8, 2, 3]), option, &quote);

        let decoded: serde_json::Value = Base64Bytes::from(payload.to_header_value().unwrap().as_str())
            .decode_json()
            .unwrap();
        assert_eq!(decoded["x402Version"], json!(2));
        assert_eq!(decoded["payload"]["signature"], json!("0x010203"));
        let auth = &decoded["payload"]["authorization"];
        assert_eq!(auth["value"], json!("1000000"));
        assert_eq!(auth["validAfter"], json!("1700000000"));
        assert_eq!(auth["validBefore"], json!("1700000120"));
        assert_eq!(auth["nonce"], json!(format!("0x{}", "ab".repeat(32))));
        assert_eq!(auth["to"], json!("0x209693Bc6afc0C5328bA36FaF03C514EF312287C"));
        assert_eq!(
            decoded["accepted"],
            serde_json::from_str::<serde_json::Value>(option_json).unwrap()
        );
        assert_eq!(decoded["resource"], json!({"url": "/trip/pay"}));
    }
}
