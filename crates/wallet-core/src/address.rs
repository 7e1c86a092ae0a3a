use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, ScriptBuf};
use thiserror::Error;

/// Address parsing and validation errors.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("failed to parse address: {0}")]
    Parse(String),

    #[error("address belongs to a different network")]
    WrongNetwork,
}

/// Parse an address string, requiring it to match `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, AddressError> {
    let unchecked: Address<NetworkUnchecked> = address
        .parse()
        .map_err(|e: bitcoin::address::ParseError| AddressError::Parse(e.to_string()))?;
    unchecked
        .require_network(network)
        .map_err(|_| AddressError::WrongNetwork)
}

/// Validate an address string for the given network.
///
/// Supports P2PKH, P2SH, P2WPKH, P2WSH, and P2TR formats. Returns `Ok(true)`
/// for a well-formed address on `network`, `Ok(false)` for a well-formed
/// address on a different network, and an error for anything unparseable.
pub fn validate_address(address: &str, network: Network) -> Result<bool, AddressError> {
    let unchecked: Address<NetworkUnchecked> = address
        .parse()
        .map_err(|e: bitcoin::address::ParseError| AddressError::Parse(e.to_string()))?;
    Ok(unchecked.is_valid_for_network(network))
}

/// Resolve an address string into its scriptPubKey on `network`.
pub fn address_script(address: &str, network: Network) -> Result<ScriptBuf, AddressError> {
    Ok(parse_address(address, network)?.script_pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP-173 test vector address.
    const MAINNET_P2WPKH: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    #[test]
    fn validate_mainnet_segwit_address() {
        assert!(validate_address(MAINNET_P2WPKH, Network::Bitcoin).unwrap());
    }

    #[test]
    fn mainnet_address_is_invalid_on_testnet() {
        assert!(!validate_address(MAINNET_P2WPKH, Network::Testnet).unwrap());
    }

    #[test]
    fn validate_legacy_address() {
        // The genesis coinbase address.
        assert!(validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", Network::Bitcoin).unwrap());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = validate_address("definitely-not-an-address", Network::Bitcoin).unwrap_err();
        assert!(matches!(err, AddressError::Parse(_)));
    }

    #[test]
    fn parse_address_enforces_network() {
        let err = parse_address(MAINNET_P2WPKH, Network::Signet).unwrap_err();
        assert!(matches!(err, AddressError::WrongNetwork));
    }

    #[test]
    fn address_script_roundtrips() {
        let spk = address_script(MAINNET_P2WPKH, Network::Bitcoin).unwrap();
        assert!(spk.is_p2wpkh());
        let addr = Address::from_script(&spk, Network::Bitcoin).unwrap();
        assert_eq!(addr.to_string(), MAINNET_P2WPKH);
    }
}
