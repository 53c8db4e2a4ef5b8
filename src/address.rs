//! Chain identifiers and address validation.
//!
//! Malformed addresses are rejected locally so that they surface as client
//! errors without ever reaching a provider.

use alloy_primitives::Address;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Legacy (P2PKH / P2SH) Bitcoin address
static BTC_BASE58_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[13][a-km-zA-HJ-NP-Z1-9]{25,34}$").expect("Invalid regex pattern")
});

/// Segwit Bitcoin address (bech32 / bech32m, single case)
static BTC_BECH32_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(bc1[02-9ac-hj-np-z]{11,71}|BC1[02-9AC-HJ-NP-Z]{11,71})$")
        .expect("Invalid regex pattern")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid {chain} address format: {input}")]
    InvalidFormat { chain: Chain, input: String },

    #[error("Address too short or long: {0}")]
    InvalidLength(String),

    #[error("Unknown chain identifier: {0}")]
    UnknownChain(String),
}

/// Blockchain served by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Bitcoin,
    Ethereum,
}

impl std::str::FromStr for Chain {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Chain::Bitcoin),
            "eth" | "ethereum" => Ok(Chain::Ethereum),
            other => Err(AddressError::UnknownChain(other.to_string())),
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "btc"),
            Chain::Ethereum => write!(f, "eth"),
        }
    }
}

/// Validate an address for `chain`, returning its trimmed form.
pub fn validate_address(chain: Chain, input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();

    match chain {
        Chain::Ethereum => {
            // Require the 0x prefix: providers reject bare hex
            if trimmed.len() != 42 {
                return Err(AddressError::InvalidLength(input.to_string()));
            }
            if !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
                return Err(AddressError::InvalidFormat {
                    chain,
                    input: input.to_string(),
                });
            }
            let hex_part = &trimmed[2..];
            let single_case =
                hex_part == hex_part.to_lowercase() || hex_part == hex_part.to_uppercase();
            // Mixed case means EIP-55, which must then checksum correctly
            let parsed = if single_case {
                hex_part.parse::<Address>().ok()
            } else {
                Address::parse_checksummed(trimmed, None).ok()
            };
            if parsed.is_none() {
                return Err(AddressError::InvalidFormat {
                    chain,
                    input: input.to_string(),
                });
            }
            Ok(trimmed.to_string())
        }
        Chain::Bitcoin => {
            if trimmed.len() < 26 || trimmed.len() > 74 {
                return Err(AddressError::InvalidLength(input.to_string()));
            }
            if BTC_BASE58_PATTERN.is_match(trimmed) || BTC_BECH32_PATTERN.is_match(trimmed) {
                Ok(trimmed.to_string())
            } else {
                Err(AddressError::InvalidFormat {
                    chain,
                    input: input.to_string(),
                })
            }
        }
    }
}

/// Case-canonical form of an address, used as the pseudonymization input.
///
/// Ethereum hex addresses and bech32 segwit addresses are case-insensitive, so
/// both fold to lowercase (EIP-55 checksummed and lowercase spellings of one
/// wallet become the same string). Base58 addresses are case-sensitive and are
/// only trimmed.
pub fn canonical_address(input: &str) -> String {
    let trimmed = input.trim();
    let is_eth_hex = trimmed.len() == 42
        && (trimmed.starts_with("0x") || trimmed.starts_with("0X"))
        && trimmed[2..].chars().all(|c| c.is_ascii_hexdigit());
    let is_bech32 = trimmed
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bc1"));

    if is_eth_hex || is_bech32 {
        trimmed.to_ascii_lowercase()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_eth_address() {
        let addr = validate_address(
            Chain::Ethereum,
            " 0xd8da6bf26964af9d7eed9e03e53415d37aa96045 ",
        )
        .expect("Should parse lowercase address");
        assert_eq!(addr, "0xd8da6bf26964af9d7eed9e03e53415d37aa96045");
    }

    #[test]
    fn test_eth_checksum_enforced() {
        let checksummed = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045";
        assert!(validate_address(Chain::Ethereum, checksummed).is_ok());
        // Same address with one checksum letter flipped
        let flipped = "0xD8dA6BF26964aF9D7eEd9e03E53415D37aA96045";
        assert!(validate_address(Chain::Ethereum, flipped).is_err());
    }

    #[test]
    fn test_invalid_eth_address() {
        assert!(validate_address(Chain::Ethereum, "0xinvalid").is_err());
        assert!(validate_address(Chain::Ethereum, "0x123").is_err());
        assert!(validate_address(Chain::Ethereum, "").is_err());
        let bare_hex = "d8da6bf26964af9d7eed9e03e53415d37aa9604500";
        assert!(validate_address(Chain::Ethereum, bare_hex).is_err());
    }

    #[test]
    fn test_bitcoin_addresses() {
        assert!(validate_address(Chain::Bitcoin, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").is_ok());
        assert!(validate_address(Chain::Bitcoin, "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy").is_ok());
        let segwit = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
        assert!(validate_address(Chain::Bitcoin, segwit).is_ok());
        // '0' and 'O' are outside the base58 alphabet
        assert!(validate_address(Chain::Bitcoin, "1A1zP1eP5QGefi2DMPTfTL5SLmv7Div0O0").is_err());
        assert!(validate_address(Chain::Bitcoin, "not-an-address").is_err());
    }

    #[test]
    fn test_canonical_address_folds_case_insensitive_forms() {
        let lower = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045";
        assert_eq!(canonical_address("0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"), lower);
        assert_eq!(canonical_address(" 0XD8DA6BF26964AF9D7EED9E03E53415D37AA96045 "), lower);
        assert_eq!(
            canonical_address("BC1QAR0SRRR7XFKVY5L643LYDNW9RE59GTZZWF5MDQ"),
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"
        );
        // Base58 is case-sensitive
        assert_eq!(
            canonical_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
        );
    }

    #[test]
    fn test_chain_parse() {
        assert_eq!("ETH".parse::<Chain>().unwrap(), Chain::Ethereum);
        assert_eq!("bitcoin".parse::<Chain>().unwrap(), Chain::Bitcoin);
        assert!("sol".parse::<Chain>().is_err());
    }
}
