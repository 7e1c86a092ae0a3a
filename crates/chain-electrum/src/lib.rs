//! Electrum chain source for the wallet engine.
//!
//! Wraps a blocking `electrum-client` connection and answers the wallet's
//! scan/sync requests with [`Update`]s: script histories are batched per
//! keychain, confirmed entries are anchored through their block headers,
//! and mempool entries get last-seen stamps.
//!
//! [`Update`]: wallet_core::sync::Update

pub mod client;
pub mod error;

pub use client::ElectrumClient;
pub use error::ElectrumError;

/// Default Electrum endpoint for Bitcoin mainnet.
pub const MAINNET_URL: &str = "ssl://electrum.blockstream.info:50002";

/// Default Electrum endpoint for Bitcoin testnet.
pub const TESTNET_URL: &str = "ssl://electrum.blockstream.info:60002";

/// Default Electrum endpoint for Bitcoin signet.
pub const SIGNET_URL: &str = "ssl://mempool.space:60602";
