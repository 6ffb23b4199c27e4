//! Well-known EVM networks.
//!
//! A payment quote names its network by CAIP-2 id. When the wallet is on another
//! network the payment protocol asks it to switch, and when the wallet does not
//! know the target it may ask the wallet to register it. Only networks listed
//! here with `testnet: true` are ever registered that way; everything else must
//! already be known to the wallet.
//!
//! ```
//! use ride4low_types::chain::ChainId;
//! use ride4low_types::networks::{network_by_chain_id, well_known_test_network};
//! use ride4low_types::chain::Eip155ChainReference;
//!
//! let base_sepolia = network_by_chain_id(&ChainId::new("eip155", "84532")).unwrap();
//! assert_eq!(base_sepolia.display_name, "Base Sepolia");
//!
//! let descriptor = well_known_test_network(Eip155ChainReference::new(84532)).unwrap();
//! assert_eq!(descriptor.chain_id, "0x14a34");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::chain::{ChainId, EIP155_NAMESPACE, Eip155ChainReference};

/// Native gas currency of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: &'static str,
    pub symbol: &'static str,
    pub decimals: u8,
}

/// A known network definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Short network name (e.g., "base-sepolia").
    pub name: &'static str,
    /// Name a wallet shows to its user.
    pub display_name: &'static str,
    pub namespace: &'static str,
    pub reference: &'static str,
    pub testnet: bool,
    pub native_currency: NativeCurrency,
    pub rpc_urls: &'static [&'static str],
    pub block_explorer_urls: &'static [&'static str],
}

impl NetworkInfo {
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.namespace, self.reference)
    }

    /// Wallet registration parameters for this network, if it is an EVM chain.
    pub fn descriptor(&self) -> Option<NetworkDescriptor> {
        let reference = Eip155ChainReference::try_from(&self.chain_id()).ok()?;
        Some(NetworkDescriptor {
            chain_id: reference.to_hex(),
            chain_name: self.display_name.to_string(),
            native_currency: NativeCurrencyDescriptor {
                name: self.native_currency.name.to_string(),
                symbol: self.native_currency.symbol.to_string(),
                decimals: self.native_currency.decimals,
            },
            rpc_urls: self.rpc_urls.iter().map(|s| s.to_string()).collect(),
            block_explorer_urls: self
                .block_explorer_urls
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }
}

/// Parameters of an EIP-3085 `wallet_addEthereumChain` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDescriptor {
    /// `0x`-prefixed hex chain id.
    pub chain_id: String,
    pub chain_name: String,
    pub native_currency: NativeCurrencyDescriptor,
    pub rpc_urls: Vec<String>,
    pub block_explorer_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrencyDescriptor {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

const ETHER: NativeCurrency = NativeCurrency {
    name: "Ether",
    symbol: "ETH",
    decimals: 18,
};

pub static KNOWN_NETWORKS: &[NetworkInfo] = &[
    // Base
    NetworkInfo {
        name: "base",
        display_name: "Base",
        namespace: EIP155_NAMESPACE,
        reference: "8453",
        testnet: false,
        native_currency: ETHER,
        rpc_urls: &["https://mainnet.base.org"],
        block_explorer_urls: &["https://basescan.org"],
    },
    NetworkInfo {
        name: "base-sepolia",
        display_name: "Base Sepolia",
        namespace: EIP155_NAMESPACE,
        reference: "84532",
        testnet: true,
        native_currency: ETHER,
        rpc_urls: &["https://sepolia.base.org"],
        block_explorer_urls: &["https://sepolia.basescan.org"],
    },
    // Ethereum
    NetworkInfo {
        name: "ethereum",
        display_name: "Ethereum",
        namespace: EIP155_NAMESPACE,
        reference: "1",
        testnet: false,
        native_currency: ETHER,
        rpc_urls: &["https://eth.llamarpc.com"],
        block_explorer_urls: &["https://etherscan.io"],
    },
    NetworkInfo {
        name: "sepolia",
        display_name: "Sepolia",
        namespace: EIP155_NAMESPACE,
        reference: "11155111",
        testnet: true,
        native_currency: NativeCurrency {
            name: "Sepolia Ether",
            symbol: "ETH",
            decimals: 18,
        },
        rpc_urls: &["https://rpc.sepolia.org"],
        block_explorer_urls: &["https://sepolia.etherscan.io"],
    },
    // Polygon
    NetworkInfo {
        name: "polygon",
        display_name: "Polygon",
        namespace: EIP155_NAMESPACE,
        reference: "137",
        testnet: false,
        native_currency: NativeCurrency {
            name: "POL",
            symbol: "POL",
            decimals: 18,
        },
        rpc_urls: &["https://polygon-rpc.com"],
        block_explorer_urls: &["https://polygonscan.com"],
    },
    NetworkInfo {
        name: "polygon-amoy",
        display_name: "Polygon Amoy",
        namespace: EIP155_NAMESPACE,
        reference: "80002",
        testnet: true,
        native_currency: NativeCurrency {
            name: "POL",
            symbol: "POL",
            decimals: 18,
        },
        rpc_urls: &["https://rpc-amoy.polygon.technology"],
        block_explorer_urls: &["https://amoy.polygonscan.com"],
    },
    // Avalanche
    NetworkInfo {
        name: "avalanche",
        display_name: "Avalanche C-Chain",
        namespace: EIP155_NAMESPACE,
        reference: "43114",
        testnet: false,
        native_currency: NativeCurrency {
            name: "Avalanche",
            symbol: "AVAX",
            decimals: 18,
        },
        rpc_urls: &["https://api.avax.network/ext/bc/C/rpc"],
        block_explorer_urls: &["https://snowtrace.io"],
    },
    NetworkInfo {
        name: "avalanche-fuji",
        display_name: "Avalanche Fuji",
        namespace: EIP155_NAMESPACE,
        reference: "43113",
        testnet: true,
        native_currency: NativeCurrency {
            name: "Avalanche",
            symbol: "AVAX",
            decimals: 18,
        },
        rpc_urls: &["https://api.avax-test.network/ext/bc/C/rpc"],
        block_explorer_urls: &["https://testnet.snowtrace.io"],
    },
];

static NAME_TO_NETWORK: LazyLock<HashMap<&'static str, &'static NetworkInfo>> =
    LazyLock::new(|| KNOWN_NETWORKS.iter().map(|n| (n.name, n)).collect());

static CHAIN_ID_TO_NETWORK: LazyLock<HashMap<ChainId, &'static NetworkInfo>> =
    LazyLock::new(|| KNOWN_NETWORKS.iter().map(|n| (n.chain_id(), n)).collect());

/// Looks up a network by its short name. Case-sensitive.
pub fn network_by_name(name: &str) -> Option<&'static NetworkInfo> {
    NAME_TO_NETWORK.get(name).copied()
}

pub fn network_by_chain_id(chain_id: &ChainId) -> Option<&'static NetworkInfo> {
    CHAIN_ID_TO_NETWORK.get(chain_id).copied()
}

/// Registration descriptor for `reference`, only when it is a well-known test network.
pub fn well_known_test_network(reference: Eip155ChainReference) -> Option<NetworkDescriptor> {
    network_by_chain_id(&reference.as_chain_id())
        .filter(|n| n.testnet)
        .and_then(NetworkInfo::descriptor)
}
