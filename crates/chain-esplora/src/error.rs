use thiserror::Error;

/// Esplora chain-source errors.
#[derive(Debug, Error)]
pub enum EsploraError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response for {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("server has no fee estimate for target {target}")]
    FeeEstimationFailed { target: u16 },
}

impl EsploraError {
    pub(crate) fn decode(endpoint: &str, message: impl ToString) -> Self {
        Self::Decode {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_decode() {
        let err = EsploraError::decode("/tx/abc/hex", "odd length hex");
        assert_eq!(
            err.to_string(),
            "malformed response for /tx/abc/hex: odd length hex"
        );
    }

    #[test]
    fn display_fee_estimation_failed() {
        let err = EsploraError::FeeEstimationFailed { target: 3 };
        assert!(err.to_string().contains("target 3"));
    }
}
