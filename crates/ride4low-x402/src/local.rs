use alloy_primitives::{Address, Bytes};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use ride4low_types::chain::Eip155ChainReference;
use ride4low_types::networks::NetworkDescriptor;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::authority::{AuthorityError, SigningAuthority, TypedDataRequest};

#[derive(Debug)]
struct Networks {
    current: Eip155ChainReference,
    known: HashSet<Eip155ChainReference>,
}

/// A signing authority backed by a private key held in process.
///
/// Behaves like a wallet that starts on its home network and only knows the
/// networks it was told about: switching to anything else fails with
/// [`AuthorityError::UnknownNetwork`] until the network is added.
#[derive(Debug)]
pub struct LocalAuthority {
    signer: PrivateKeySigner,
    networks: Mutex<Networks>,
}

impl LocalAuthority {
    pub fn new(signer: PrivateKeySigner, home: Eip155ChainReference) -> Self {
        Self {
            signer,
            networks: Mutex::new(Networks {
                current: home,
                known: HashSet::from([home]),
            }),
        }
    }

    /// Also knows `others`, without switching to them.
    pub fn with_networks<I>(self, others: I) -> Self
    where
        I: IntoIterator<Item = Eip155ChainReference>,
    {
        if let Ok(mut networks) = self.networks.lock() {
            networks.known.extend(others);
        }
        self
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn networks(&self) -> Result<MutexGuard<'_, Networks>, AuthorityError> {
        self.networks
            .lock()
            .map_err(|_| AuthorityError::Unavailable("network state poisoned".into()))
    }
}

#[async_trait]
impl SigningAuthority for LocalAuthority {
    async fn request_accounts(&self) -> Result<Vec<Address>, AuthorityError> {
        Ok(vec![self.signer.address()])
    }

    async fn current_network(&self) -> Result<Eip155ChainReference, AuthorityError> {
        Ok(self.networks()?.current)
    }

    async fn switch_network(&self, network: Eip155ChainReference) -> Result<(), AuthorityError> {
        let mut networks = self.networks()?;
        if !networks.known.contains(&network) {
            return Err(AuthorityError::UnknownNetwork(format!(
                "chain {} has not been added",
                network.to_hex()
            )));
        }
        networks.current = network;
        Ok(())
    }

    async fn add_network(&self, network: &NetworkDescriptor) -> Result<(), AuthorityError> {
        let reference = Eip155ChainReference::from_hex(&network.chain_id).map_err(|e| {
            AuthorityError::Rpc {
                code: -32602,
                message: e.to_string(),
            }
        })?;
        self.networks()?.known.insert(reference);
        Ok(())
    }

    async fn sign_typed_data(&self, request: &TypedDataRequest) -> Result<Bytes, AuthorityError> {
        if request.signer() != self.signer.address() {
            return Err(AuthorityError::Rpc {
                code: -32602,
                message: format!("cannot sign for {}", request.signer()),
            });
        }
        let current = self.networks()?.current;
        if request.domain.chain_id != current {
            return Err(AuthorityError::Rpc {
                code: -32602,
                message: format!(
                    "chain id {} does not match active chain {}",
                    request.domain.chain_id, current
                ),
            });
        }
        let signature = self
            .signer
            .sign_hash(&request.signing_hash())
            .await
            .map_err(|e| AuthorityError::Unavailable(format!("{e:?}")))?;
        Ok(Bytes::copy_from_slice(&signature.as_bytes()))
    }
}
