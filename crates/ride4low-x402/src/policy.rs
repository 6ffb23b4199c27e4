use ride4low_types::chain::ChainId;
use serde::{Deserialize, Serialize};

use crate::proto::{QuoteOption, TokenAmount};

/// Limits a rider puts on what a server may ask them to sign.
///
/// The default policy accepts any network and any amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotePolicy {
    /// Empty means every network is allowed.
    #[serde(default)]
    pub allowed_networks: Vec<ChainId>,
    #[serde(default)]
    pub max_amount: Option<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("Network {0} is not allowed")]
    NetworkNotAllowed(ChainId),
    #[error("Amount {requested} exceeds the allowed maximum {allowed}")]
    AmountTooLarge {
        requested: TokenAmount,
        allowed: TokenAmount,
    },
}

impl QuotePolicy {
    pub fn allow_network(mut self, network: ChainId) -> Self {
        self.allowed_networks.push(network);
        self
    }

    pub fn max_amount(mut self, amount: TokenAmount) -> Self {
        self.max_amount = Some(amount);
        self
    }

    pub fn check(&self, option: &QuoteOption) -> Result<(), PolicyViolation> {
        if !self.allowed_networks.is_empty() && !self.allowed_networks.contains(&option.network) {
            return Err(PolicyViolation::NetworkNotAllowed(option.network.clone()));
        }
        if let Some(allowed) = self.max_amount {
            if option.amount > allowed {
                return Err(PolicyViolation::AmountTooLarge {
                    requested: option.amount,
                    allowed,
                });
            }
        }
        Ok(())
    }
}
