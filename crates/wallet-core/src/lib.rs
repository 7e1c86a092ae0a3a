//! # wallet-core
//!
//! Descriptor-based Bitcoin wallet engine: BIP-39/BIP-32 key material,
//! keychain address derivation with gap-limit tracking, a transaction graph
//! reconciled against a checkpoint view of the chain (reorg-aware), coin
//! selection, PSBT construction/signing/finalization, and append-only
//! changeset persistence.
//!
//! Chain data arrives through the [`sync`] seam from a chain source crate
//! (Electrum or Esplora); the engine itself never touches the network.

pub mod address;
pub mod backup;
pub mod chain;
pub mod changeset;
pub mod coin_selection;
pub mod descriptor;
pub mod error;
pub mod keychain;
pub mod keys;
pub mod signer;
pub mod store;
pub mod sync;
pub mod tx_builder;
pub mod tx_graph;
pub mod wallet;

pub use bitcoin;
pub use miniscript;

pub use chain::{BlockId, ChainPosition, ConfirmationBlockTime, LocalChain};
pub use changeset::ChangeSet;
pub use descriptor::WalletDescriptor;
pub use error::WalletError;
pub use keychain::KeychainKind;
pub use signer::SignOptions;
pub use store::Store;
pub use sync::{FullScanRequest, SyncRequest, Update};
pub use tx_builder::TxBuilder;
pub use tx_graph::TxGraph;
pub use wallet::{AddressInfo, Balance, LocalOutput, TxDetails, Wallet};
