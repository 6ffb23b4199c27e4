//! Wallet bridge speaking EIP-1193 requests as JSON-RPC 2.0 over HTTP.

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use ride4low_types::chain::Eip155ChainReference;
use ride4low_types::networks::NetworkDescriptor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::authority::{AuthorityError, SigningAuthority, TypedDataRequest};

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// A signing authority reached over JSON-RPC, typically a wallet running
/// next to the rider that prompts for every account, network and signature
/// request.
#[derive(Debug)]
pub struct Eip1193Authority {
    http: reqwest::Client,
    endpoint: Url,
    next_id: AtomicU64,
}

impl Eip1193Authority {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(http: reqwest::Client, endpoint: Url) -> Self {
        Self {
            http,
            endpoint,
            next_id: AtomicU64::new(1),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, AuthorityError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        #[cfg(feature = "telemetry")]
        tracing::debug!(method, id, "Signing authority request");
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthorityError::Unavailable(format!(
                "{method} answered with HTTP {}",
                response.status()
            )));
        }
        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| AuthorityError::Unavailable(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(AuthorityError::from_rpc(error.code, error.message));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| {
            AuthorityError::Rpc {
                code: -32700,
                message: format!("unexpected {method} result: {e}"),
            }
        })
    }
}

#[async_trait]
impl SigningAuthority for Eip1193Authority {
    async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError> {
        self.request("eth_requestAccounts", json!([])).await
    }

    async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError> {
        let chain_id: String = self.request("eth_chainId", json!([])).await?;
        Eip155ChainReference::from_hex(&chain_id).map_err(|e| AuthorityError::Rpc {
            code: -32700,
            message: e.to_string(),
        })
    }

    async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError> {
        let _: Value = self
            .request(
                "wallet_switchEthereumChain",
                json!([{"chainId": network.to_hex()}]),
            )
            .await?;
        Ok(())
    }

    async fn add_network(&self, network: &NetworkDescriptor) -> Result<(), AuthorityError> {
        let _: Value = self
            .request("wallet_addEthereumChain", json!([network]))
            .await?;
        Ok(())
    }

    async fn sign_typed_data(&self, request: &TypedDataRequest) -> Result<Bytes, AuthorityError> {
        let typed_data = request.to_json().to_string();
        self.request(
            "eth_signTypedData_v4",
            json!([request.signer().to_checksum(None), typed_data]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride4low_types::networks::well_known_test_network;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authority(server: &MockServer) -> Eip1193Authority {
        Eip1193Authority::new(Url::parse(&server.uri()).unwrap())
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": code, "message": message}}),
        )
    }

    #[tokio::test]
    async fn test_accounts_and_chain_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_requestAccounts"})))
            .respond_with(rpc_result(json!(["0x209693bc6afc0c5328ba36faf03c514ef312287c"])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_chainId"})))
            .respond_with(rpc_result(json!("0x14a34")))
            .mount(&server)
            .await;

        let authority = authority(&server).await;
        let accounts = authority.request_accounts().await.unwrap();
        assert_eq!(
            accounts,
            vec!["0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse::<Address>().unwrap()]
        );
        assert_eq!(
            authority.current_network().await.unwrap(),
            Eip155ChainReference::new(84532)
        );
    }

    #[tokio::test]
    async fn test_switch_maps_unknown_chain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "wallet_switchEthereumChain",
                "params": [{"chainId": "0x14a34"}]
            })))
            .respond_with(rpc_error(4902, "Unrecognized chain ID"))
            .mount(&server)
            .await;

        let err = authority(&server)
            .await
            .switch_network(Eip155ChainReference::new(84532))
            .await
            .unwrap_err();
        assert_eq!(err, AuthorityError::UnknownNetwork("Unrecognized chain ID".into()));
    }

    #[tokio::test]
    async fn test_add_network_sends_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "wallet_addEthereumChain",
                "params": [{"chainId": "0x14a34", "chainName": "Base Sepolia"}]
            })))
            .respond_with(rpc_result(Value::Null))
            .expect(1)
            .mount(&server)
            .await;

        let descriptor = well_known_test_network(Eip155ChainReference::new(84532)).unwrap();
        authority(&server)
            .await
            .add_network(&descriptor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_and_outage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_error(4001, "User rejected the request."))
            .mount(&server)
            .await;
        let err = authority(&server).await.request_accounts().await.unwrap_err();
        assert!(matches!(err, AuthorityError::Rejected(_)));

        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        let err = authority(&down).await.request_accounts().await.unwrap_err();
        assert!(matches!(err, AuthorityError::Unavailable(_)));
    }
}
