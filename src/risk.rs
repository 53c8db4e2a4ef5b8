//! Risk scoring and contract-call decoding.
//!
//! Everything here is pure: no I/O, no interior state. Malformed call data is
//! never an error to the caller; it simply yields no decoded call.

use crate::schemas::{ContractFunction, DecodedCall, RiskAssessment, RiskFlag};
use alloy_primitives::{Address, U256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `transferFrom(address,address,uint256)`
pub const TRANSFER_FROM_SELECTOR: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];

/// Token decimals assumed when rendering `amount_decimal`
pub const TOKEN_DECIMALS: i32 = 18;

const WORD: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
enum DecodeError {
    #[error("payload shorter than a selector")]
    NoSelector,

    #[error("unrecognized selector 0x{0}")]
    UnknownSelector(String),

    #[error("expected {expected} argument bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("address word {0} has non-zero padding")]
    DirtyAddressPadding(usize),
}

/// Decode a whitelisted ERC-20 transfer call, or `None` for anything else.
pub fn decode_contract_call(input: &[u8]) -> Option<DecodedCall> {
    match try_decode(input) {
        Ok(call) => Some(call),
        Err(DecodeError::NoSelector) => None,
        Err(e) => {
            debug!("Contract call not decoded: {}", e);
            None
        }
    }
}

fn try_decode(input: &[u8]) -> Result<DecodedCall, DecodeError> {
    if input.len() < 4 {
        return Err(DecodeError::NoSelector);
    }
    let (selector, args) = input.split_at(4);

    let (function, recipient_word, amount_word) = if selector == TRANSFER_SELECTOR {
        (ContractFunction::Transfer, 0, 1)
    } else if selector == TRANSFER_FROM_SELECTOR {
        (ContractFunction::TransferFrom, 1, 2)
    } else {
        return Err(DecodeError::UnknownSelector(hex::encode(selector)));
    };

    let expected = (amount_word + 1) * WORD;
    if args.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: args.len(),
        });
    }

    // Every address word must be left-padded with zeros
    for index in 0..amount_word {
        let word = &args[index * WORD..(index + 1) * WORD];
        if word[..12].iter().any(|b| *b != 0) {
            return Err(DecodeError::DirtyAddressPadding(index));
        }
    }

    let recipient_start = recipient_word * WORD;
    let recipient = Address::from_slice(&args[recipient_start + 12..recipient_start + WORD]);
    let amount_start = amount_word * WORD;
    let amount = U256::from_be_slice(&args[amount_start..amount_start + WORD]);

    Ok(DecodedCall {
        function,
        recipient,
        amount,
        amount_decimal: to_decimal(amount, TOKEN_DECIMALS),
    })
}

/// Lossy conversion of a base-unit integer to display units.
fn to_decimal(amount: U256, decimals: i32) -> f64 {
    let as_float: f64 = amount.to_string().parse().unwrap_or(f64::MAX);
    as_float / 10f64.powi(decimals)
}

/// Encode an ERC-20 `transfer(recipient, amount)` call.
///
/// Inverse of [`decode_contract_call`] for the transfer selector. Kept public
/// so fixtures and integration tests can build realistic input payloads.
pub fn encode_transfer(recipient: Address, amount: U256) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * WORD);
    out.extend_from_slice(&TRANSFER_SELECTOR);
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(recipient.as_slice());
    out.extend_from_slice(&amount.to_be_bytes::<32>());
    out
}

// ============================================================================
// Scoring
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskWeights {
    pub threshold: u32,
    pub stablecoin: u32,
    pub contract_call: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            threshold: 10,
            stablecoin: 5,
            contract_call: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RiskEngine {
    threshold: f64,
    weights: RiskWeights,
}

impl RiskEngine {
    pub fn new(threshold: f64) -> Self {
        Self::with_weights(threshold, RiskWeights::default())
    }

    pub fn with_weights(threshold: f64, weights: RiskWeights) -> Self {
        Self { threshold, weights }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score a transaction from its reporting-currency value and classification.
    ///
    /// Reporting is required at or above the threshold. Exactly one of the
    /// stablecoin/unbacked flags is always present.
    pub fn calculate_risk(
        &self,
        value: f64,
        is_stablecoin: bool,
        has_contract_call: bool,
    ) -> RiskAssessment {
        let mut score = 0;
        let mut flags = BTreeSet::new();

        let requires_reporting = value >= self.threshold;
        if requires_reporting {
            score += self.weights.threshold;
            flags.insert(RiskFlag::ExceedsThreshold);
        }

        if is_stablecoin {
            score += self.weights.stablecoin;
            flags.insert(RiskFlag::QualifyingStablecoin);
        } else {
            flags.insert(RiskFlag::UnbackedAsset);
        }

        if has_contract_call {
            score += self.weights.contract_call;
            flags.insert(RiskFlag::SmartContractInteraction);
        }

        RiskAssessment {
            score,
            flags,
            requires_reporting,
            value_reporting_currency: value,
            threshold: self.threshold,
        }
    }
}

// ============================================================================
// Asset classification
// ============================================================================

/// Decides whether a transaction moves a qualifying stablecoin.
pub trait AssetClassifier: Send + Sync {
    fn is_qualifying_stablecoin(
        &self,
        value_reporting_currency: f64,
        call: Option<&DecodedCall>,
    ) -> bool;
}

/// Placeholder heuristic: any decoded token call worth at least `min_value`.
///
/// This does not consult a token registry and will misclassify both ways. It
/// stays the default only until an authoritative classifier is plugged in.
#[derive(Debug, Clone, Copy)]
pub struct ValueHeuristicClassifier {
    pub min_value: f64,
}

impl Default for ValueHeuristicClassifier {
    fn default() -> Self {
        Self { min_value: 1000.0 }
    }
}

impl AssetClassifier for ValueHeuristicClassifier {
    fn is_qualifying_stablecoin(
        &self,
        value_reporting_currency: f64,
        call: Option<&DecodedCall>,
    ) -> bool {
        call.is_some() && value_reporting_currency >= self.min_value
    }
}

/// Fixed answer, for callers that classify assets elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct StaticClassifier(pub bool);

impl AssetClassifier for StaticClassifier {
    fn is_qualifying_stablecoin(&self, _value: f64, _call: Option<&DecodedCall>) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const RECIPIENT: Address = address!("d8da6bf26964af9d7eed9e03e53415d37aa96045");

    #[test]
    fn test_decode_transfer() {
        let amount = U256::from(1_500_000_000_000_000_000u128);
        let call = decode_contract_call(&encode_transfer(RECIPIENT, amount)).unwrap();

        assert_eq!(call.function, ContractFunction::Transfer);
        assert_eq!(call.recipient, RECIPIENT);
        assert_eq!(call.amount, amount);
        assert!((call.amount_decimal - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_transfer_from_uses_second_address() {
        let sender = address!("1111111111111111111111111111111111111111");
        let mut input = TRANSFER_FROM_SELECTOR.to_vec();
        input.extend_from_slice(&[0u8; 12]);
        input.extend_from_slice(sender.as_slice());
        input.extend_from_slice(&[0u8; 12]);
        input.extend_from_slice(RECIPIENT.as_slice());
        input.extend_from_slice(&U256::from(42u64).to_be_bytes::<32>());

        let call = decode_contract_call(&input).unwrap();
        assert_eq!(call.function, ContractFunction::TransferFrom);
        assert_eq!(call.recipient, RECIPIENT);
        assert_eq!(call.amount, U256::from(42u64));
    }

    #[test]
    fn test_unrecognized_or_malformed_input_is_no_call() {
        assert!(decode_contract_call(&[]).is_none());
        assert!(decode_contract_call(&[0xa9, 0x05]).is_none());
        // approve(address,uint256) is not whitelisted
        let mut approve = encode_transfer(RECIPIENT, U256::from(1u64));
        approve[..4].copy_from_slice(&[0x09, 0x5e, 0xa7, 0xb3]);
        assert!(decode_contract_call(&approve).is_none());

        let full = encode_transfer(RECIPIENT, U256::from(1u64));
        assert!(decode_contract_call(&full[..full.len() - 1]).is_none());

        let mut dirty = full.clone();
        dirty[4] = 0xff;
        assert!(decode_contract_call(&dirty).is_none());
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let engine = RiskEngine::new(10_000.0);
        assert!(engine.calculate_risk(10_000.0, false, false).requires_reporting);
        let below = engine.calculate_risk(9_999.99, false, false);
        assert!(!below.requires_reporting);
        assert!(!below.has_flag(RiskFlag::ExceedsThreshold));
    }

    #[test]
    fn test_weights_accumulate() {
        let engine = RiskEngine::new(10_000.0);

        let all = engine.calculate_risk(27_000.0, true, true);
        assert_eq!(all.score, 18);
        assert_eq!(
            all.flags,
            BTreeSet::from([
                RiskFlag::ExceedsThreshold,
                RiskFlag::QualifyingStablecoin,
                RiskFlag::SmartContractInteraction
            ])
        );

        let none = engine.calculate_risk(5.0, false, false);
        assert_eq!(none.score, 0);
        assert_eq!(none.flags, BTreeSet::from([RiskFlag::UnbackedAsset]));
    }

    #[test]
    fn test_exactly_one_backing_flag() {
        let engine = RiskEngine::new(100.0);
        for value in [0.0, 99.0, 100.0, 1e9] {
            for stable in [true, false] {
                for call in [true, false] {
                    let a = engine.calculate_risk(value, stable, call);
                    let markers = [RiskFlag::QualifyingStablecoin, RiskFlag::UnbackedAsset]
                        .iter()
                        .filter(|f| a.has_flag(**f))
                        .count();
                    assert_eq!(markers, 1);
                }
            }
        }
    }

    #[test]
    fn test_value_heuristic_classifier() {
        let classifier = ValueHeuristicClassifier::default();
        let call = decode_contract_call(&encode_transfer(RECIPIENT, U256::from(1u64)));
        assert!(classifier.is_qualifying_stablecoin(1000.0, call.as_ref()));
        assert!(!classifier.is_qualifying_stablecoin(999.0, call.as_ref()));
        assert!(!classifier.is_qualifying_stablecoin(50_000.0, None));
        assert!(StaticClassifier(true).is_qualifying_stablecoin(0.0, None));
    }
}
