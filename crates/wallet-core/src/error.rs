use thiserror::Error;

use crate::address::AddressError;
use crate::backup::BackupError;
use crate::chain::CannotConnectError;
use crate::coin_selection::SelectionError;
use crate::descriptor::DescriptorError;
use crate::keys::KeyError;
use crate::signer::SignerError;
use crate::store::StoreError;
use crate::tx_builder::CreateTxError;
use crate::tx_graph::CalculateFeeError;
use crate::wallet::{ApplyUpdateError, LoadError};

/// Umbrella error for callers that funnel every wallet operation through a
/// single result type. Each domain keeps its precise error; this enum just
/// carries them across one seam.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("address error: {0}")]
    Address(#[from] AddressError),

    #[error("transaction build error: {0}")]
    CreateTx(#[from] CreateTxError),

    #[error("signing error: {0}")]
    Signer(#[from] SignerError),

    #[error("coin selection error: {0}")]
    CoinSelection(#[from] SelectionError),

    #[error("chain error: {0}")]
    Chain(#[from] CannotConnectError),

    #[error("update error: {0}")]
    ApplyUpdate(#[from] ApplyUpdateError),

    #[error("fee calculation error: {0}")]
    CalculateFee(#[from] CalculateFeeError),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),
}
