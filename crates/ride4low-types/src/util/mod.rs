//! Utility types shared across the rider core.

pub mod b64;

pub use b64::Base64Bytes;
