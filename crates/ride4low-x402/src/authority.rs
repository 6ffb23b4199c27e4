//! The signing authority: whoever holds the rider's key.
//!
//! Payment code never touches key material. It asks a [`SigningAuthority`] for
//! the connected account, for the active network (switching or registering one
//! if needed), and for an EIP-712 signature over a [`TypedDataRequest`]. A
//! browser-style wallet may put each of these in front of the rider, so every
//! call may suspend indefinitely or come back rejected.

use alloy_primitives::{Address, B256, Bytes, hex};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};
use async_trait::async_trait;
use ride4low_types::chain::Eip155ChainReference;
use ride4low_types::networks::NetworkDescriptor;
use serde_json::json;
use std::sync::Arc;

use crate::proto::{PaymentAuthorization, QuoteOption};

/// EIP-1193 "user rejected the request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// EIP-1193 "unrecognized chain id".
pub const UNRECOGNIZED_CHAIN_CODE: i64 = 4902;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    #[error("Signing authority unavailable: {0}")]
    Unavailable(String),
    #[error("Signing authority error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl AuthorityError {
    /// Maps an EIP-1193 provider error.
    pub fn from_rpc(code: i64, message: String) -> Self {
        match code {
            USER_REJECTED_CODE => AuthorityError::Rejected(message),
            UNRECOGNIZED_CHAIN_CODE => AuthorityError::UnknownNetwork(message),
            _ => AuthorityError::Rpc { code, message },
        }
    }
}

#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Connected accounts; the first one pays.
    async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError>;

    async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError>;

    /// Fails with [`AuthorityError::UnknownNetwork`] when the authority has never
    /// heard of `network`.
    async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError>;

    async fn add_network(&self, network: &NetworkDescriptor) -> Result<(), AuthorityError>;

    /// 65-byte `r || s || v` signature over the request's EIP-712 hash.
    async fn sign_typed_data(&self, request: &TypedDataRequest) -> Result<Bytes, AuthorityError>;
}

#[async_trait]
impl<T: SigningAuthority + ?Sized> SigningAuthority for Arc<T> {
    async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError> {
        (**self).request_accounts().await
    }

    async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError> {
        (**self).current_network().await
    }

    async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError> {
        (**self).switch_network(network).await
    }

    async fn add_network(&self, network: &NetworkDescriptor) -> Result<(), AuthorityError> {
        (**self).add_network(network).await
    }

    async fn sign_typed_data(&self, request: &TypedDataRequest) -> Result<Bytes, AuthorityError> {
        (**self).sign_typed_data(request).await
    }
}

/// EIP-712 domain of the token contract being authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDomain {
    pub name: String,
    pub version: String,
    pub chain_id: Eip155ChainReference,
    pub verifying_contract: Address,
}

impl TokenDomain {
    pub fn for_option(
        option: &QuoteOption,
        chain_id: Eip155ChainReference,
        verifying_contract: Address,
    ) -> Self {
        Self {
            name: option.domain_name().to_string(),
            version: option.domain_version().to_string(),
            chain_id,
            verifying_contract,
        }
    }

    pub fn to_eip712_domain(&self) -> Eip712Domain {
        eip712_domain! {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_id: self.chain_id.inner(),
            verifying_contract: self.verifying_contract,
        }
    }
}

/// A `TransferWithAuthorization` signature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedDataRequest {
    pub domain: TokenDomain,
    pub authorization: PaymentAuthorization,
}

impl TypedDataRequest {
    /// Address expected to sign.
    pub fn signer(&self) -> Address {
        self.authorization.from.0
    }

    pub fn signing_hash(&self) -> B256 {
        self.authorization
            .to_typed_struct()
            .eip712_signing_hash(&self.domain.to_eip712_domain())
    }

    /// The `eth_signTypedData_v4` document.
    pub fn to_json(&self) -> serde_json::Value {
        let auth = &self.authorization;
        json!({
            "types": {
                "EIP712Domain": [
                    {"name": "name", "type": "string"},
                    {"name": "version", "type": "string"},
                    {"name": "chainId", "type": "uint256"},
                    {"name": "verifyingContract", "type": "address"}
                ],
                "TransferWithAuthorization": [
                    {"name": "from", "type": "address"},
                    {"name": "to", "type": "address"},
                    {"name": "value", "type": "uint256"},
                    {"name": "validAfter", "type": "uint256"},
                    {"name": "validBefore", "type": "uint256"},
                    {"name": "nonce", "type": "bytes32"}
                ]
            },
            "primaryType": "TransferWithAuthorization",
            "domain": {
                "name": self.domain.name,
                "version": self.domain.version,
                "chainId": self.domain.chain_id.inner(),
                "verifyingContract": self.domain.verifying_contract.to_checksum(None)
            },
            "message": {
                "from": auth.from.to_string(),
                "to": auth.to.to_string(),
                "value": auth.value.to_string(),
                "validAfter": auth.valid_after.to_string(),
                "validBefore": auth.valid_before.to_string(),
                "nonce": hex::encode_prefixed(auth.nonce)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TokenAmount;
    use ride4low_types::timestamp::UnixTimestamp;

    fn request() -> TypedDataRequest {
        TypedDataRequest {
            domain: TokenDomain {
                name: "USDC".into(),
                version: "2".into(),
                chain_id: Eip155ChainReference::new(84532),
                verifying_contract: Address::repeat_byte(0x03),
            },
            authorization: PaymentAuthorization {
                from: Address::repeat_byte(0x01).into(),
                to: Address::repeat_byte(0x02).into(),
                value: TokenAmount::new(1_000_000),
                valid_after: UnixTimestamp::from_secs(100),
                valid_before: UnixTimestamp::from_secs(220),
                nonce: B256::repeat_byte(0x07),
            },
        }
    }

    #[test]
    fn test_rpc_error_mapping() {
        assert_eq!(
            AuthorityError::from_rpc(4001, "nope".into()),
            AuthorityError::Rejected("nope".into())
        );
        assert_eq!(
            AuthorityError::from_rpc(4902, "which chain".into()),
            AuthorityError::UnknownNetwork("which chain".into())
        );
        assert!(matches!(
            AuthorityError::from_rpc(-32603, "internal".into()),
            AuthorityError::Rpc { code: -32603, .. }
        ));
    }

    #[test]
    fn test_signing_hash_binds_domain() {
        let base = request();
        let mut other_chain = request();
        other_chain.domain.chain_id = Eip155ChainReference::new(8453);
        let mut other_version = request();
        other_version.domain.version = "1".into();
        assert_ne!(base.signing_hash(), other_chain.signing_hash());
        assert_ne!(base.signing_hash(), other_version.signing_hash());
        assert_eq!(base.signing_hash(), request().signing_hash());
    }

    #[test]
    fn test_typed_data_document() {
        let json = request().to_json();
        assert_eq!(json["primaryType"], "TransferWithAuthorization");
        assert_eq!(json["domain"]["chainId"], 84532);
        assert_eq!(json["message"]["value"], "1000000");
        assert_eq!(json["message"]["validBefore"], "220");
        assert_eq!(json["message"]["nonce"], format!("0x{}", "07".repeat(32)));
    }
}
