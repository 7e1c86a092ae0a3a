//! Esplora (HTTP REST) chain source for the wallet engine.
//!
//! Talks to a Blockstream-style Esplora instance over blocking `reqwest`.
//! Script activity is looked up by script hash with pagination; confirmed
//! statuses already carry the anchor block, so no extra header fetches are
//! needed.

pub mod api;
pub mod client;
pub mod error;

pub use client::EsploraClient;
pub use error::EsploraError;

/// Default Esplora endpoint for Bitcoin mainnet.
pub const MAINNET_URL: &str = "https://blockstream.info/api";

/// Default Esplora endpoint for Bitcoin testnet.
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

/// Default Esplora endpoint for Bitcoin signet.
pub const SIGNET_URL: &str = "https://mempool.space/signet/api";
