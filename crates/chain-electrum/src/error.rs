use thiserror::Error;

/// Electrum chain-source errors.
#[derive(Debug, Error)]
pub enum ElectrumError {
    #[error("electrum client error: {0}")]
    Client(#[from] electrum_client::Error),

    #[error("server returned no fee estimate for target {target}")]
    FeeEstimationFailed { target: usize },

    #[error("server returned an invalid header at height {height}")]
    InvalidHeader { height: u32 },
}
