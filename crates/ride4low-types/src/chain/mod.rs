//! Blockchain identifiers used by the payment quote.
//!
//! Quotes name their network with a CAIP-2 [`ChainId`] such as `eip155:84532`.
//! Wallets speak numeric EIP-155 chain ids, so [`Eip155ChainReference`] bridges
//! the two.

mod chain_id;

pub use chain_id::*;
