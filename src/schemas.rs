//! Data schemas for the CARF pipeline.
//!
//! This module is the canonical definition of every record that flows between
//! the pipeline stages: provider output, privacy envelopes, risk assessments,
//! normalized output records and audit journal entries.

use alloy_primitives::{Address, Bytes, U256};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Sentinel pseudonym used when no privacy envelope exists for a record.
pub const UNKNOWN_PSEUDONYM: &str = "UNKNOWN";

// ============================================================================
// PART A: Acquisition
// ============================================================================

/// Provider-native transaction normalized to a canonical shape.
///
/// Created per fetch and never persisted by the pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    /// Transaction hash as reported by the provider
    pub hash: String,

    /// Block time (unix seconds)
    pub unix_time: i64,

    /// Value in the provider's base unit (satoshi, wei, ...)
    pub value_base_units: u128,

    /// Decimal exponent of the base unit (8 for BTC, 18 for ETH)
    pub decimals: u32,

    /// Raw call payload, empty for plain value transfers
    pub input_bytes: Bytes,

    /// Block height, 0 when unconfirmed
    pub block_height: u64,

    /// First sending address, when the provider reports one
    pub from_address: Option<String>,

    /// First receiving address, when the provider reports one
    pub to_address: Option<String>,
}

impl RawTransaction {
    /// Value converted from base units to display units.
    pub fn value_native(&self) -> f64 {
        self.value_base_units as f64 / 10f64.powi(self.decimals as i32)
    }
}

/// Block summary returned by single-block lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u64,
    pub unix_time: i64,
    pub tx_count: u64,
}

// ============================================================================
// PART B: Privacy
// ============================================================================

/// Pseudonyms and encrypted PII for the parties of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyEnvelope {
    pub pseudonym_from: String,
    pub pseudonym_to: String,
    /// Base64 AES-256-GCM ciphertext of the PII bundle
    pub encrypted_pii: String,
}

impl PrivacyEnvelope {
    /// Envelope standing in for a missing one. Never silently empty.
    pub fn unknown() -> Self {
        Self {
            pseudonym_from: UNKNOWN_PSEUDONYM.to_string(),
            pseudonym_to: UNKNOWN_PSEUDONYM.to_string(),
            encrypted_pii: String::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.pseudonym_from == UNKNOWN_PSEUDONYM && self.pseudonym_to == UNKNOWN_PSEUDONYM
    }
}

// ============================================================================
// PART C: Classification
// ============================================================================

/// Named conditions raised by the risk engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    ExceedsThreshold,
    QualifyingStablecoin,
    UnbackedAsset,
    SmartContractInteraction,
}

impl std::fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskFlag::ExceedsThreshold => write!(f, "EXCEEDS_THRESHOLD"),
            RiskFlag::QualifyingStablecoin => write!(f, "QUALIFYING_STABLECOIN"),
            RiskFlag::UnbackedAsset => write!(f, "UNBACKED_ASSET"),
            RiskFlag::SmartContractInteraction => write!(f, "SMART_CONTRACT_INTERACTION"),
        }
    }
}

/// Output of the risk engine.
///
/// Exactly one of `QualifyingStablecoin` / `UnbackedAsset` is always present,
/// and `requires_reporting` holds iff `value_reporting_currency >= threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub flags: BTreeSet<RiskFlag>,
    pub requires_reporting: bool,
    pub value_reporting_currency: f64,
    pub threshold: f64,
}

impl RiskAssessment {
    pub fn has_flag(&self, flag: RiskFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_qualifying_stablecoin(&self) -> bool {
        self.has_flag(RiskFlag::QualifyingStablecoin)
    }
}

/// Token function recognized by the contract-call decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContractFunction {
    Transfer,
    TransferFrom,
}

impl std::fmt::Display for ContractFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractFunction::Transfer => write!(f, "transfer"),
            ContractFunction::TransferFrom => write!(f, "transferFrom"),
        }
    }
}

/// Structured parameters extracted from a recognized call payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedCall {
    pub function: ContractFunction,
    pub recipient: Address,
    pub amount: U256,
    /// Amount assuming 18 token decimals
    pub amount_decimal: f64,
}

// ============================================================================
// PART D: Output
// ============================================================================

/// Normalized, classified, privacy-protected transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub tx_hash: String,
    pub timestamp_utc: DateTime<Utc>,
    /// Same instant rendered in the configured reporting timezone
    pub timestamp_local: DateTime<FixedOffset>,
    pub pseudonym_from: String,
    pub pseudonym_to: String,
    pub encrypted_pii: String,
    pub value_native: f64,
    pub value_reporting_currency: f64,
    pub decoded_call: Option<DecodedCall>,
    pub is_qualifying_stablecoin: bool,
    pub risk_score: u32,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub requires_reporting: bool,
    pub threshold: f64,
    pub block_height: u64,
}

// ============================================================================
// PART E: Audit
// ============================================================================

/// One immutable journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic position in the journal, starting at 1
    pub sequence: u64,

    /// Append time (UTC ISO-8601)
    pub timestamp: DateTime<Utc>,

    pub action: String,

    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A log-ready action description that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub parameters: Map<String, Value>,
}

impl AuditEvent {
    /// Build an event; non-object parameter values are wrapped as `{"value": ...}`.
    pub fn new(action: impl Into<String>, parameters: Value) -> Self {
        let parameters = match parameters {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            action: action.into(),
            parameters,
        }
    }
}
