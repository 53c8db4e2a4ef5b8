//! Transform raw provider records into normalized, classified records.
//!
//! A [`Transformer`] is fixed at construction (timezone, exchange rate, risk
//! engine, classifier), so the same raw transaction and envelope always yield
//! the same output.

use crate::config::{ConfigError, ReportingConfig};
use crate::risk::{decode_contract_call, AssetClassifier, RiskEngine, ValueHeuristicClassifier};
use crate::schemas::{NormalizedTransaction, PrivacyEnvelope, RawTransaction, UNKNOWN_PSEUDONYM};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Transformer {
    timezone: Tz,
    exchange_rate: f64,
    engine: RiskEngine,
    classifier: Arc<dyn AssetClassifier>,
}

impl Transformer {
    pub fn new(config: &ReportingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            timezone: config.tz()?,
            exchange_rate: config.exchange_rate,
            engine: RiskEngine::new(config.threshold),
            classifier: Arc::new(ValueHeuristicClassifier::default()),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn AssetClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Normalize one transaction.
    ///
    /// Order: timestamp, currency conversion, call decoding, classification,
    /// scoring, assembly.
    pub fn transform(
        &self,
        raw: &RawTransaction,
        envelope: &PrivacyEnvelope,
    ) -> NormalizedTransaction {
        let timestamp_utc = DateTime::<Utc>::from_timestamp(raw.unix_time, 0).unwrap_or_else(|| {
            warn!("Transaction {} has out-of-range timestamp {}", raw.hash, raw.unix_time);
            DateTime::<Utc>::default()
        });
        let timestamp_local = timestamp_utc.with_timezone(&self.timezone).fixed_offset();

        let value_native = raw.value_native();
        let value_reporting_currency = value_native * self.exchange_rate;

        let decoded_call = decode_contract_call(&raw.input_bytes);
        let is_stablecoin = self
            .classifier
            .is_qualifying_stablecoin(value_reporting_currency, decoded_call.as_ref());

        let assessment = self
            .engine
            .calculate_risk(value_reporting_currency, is_stablecoin, decoded_call.is_some());

        NormalizedTransaction {
            tx_hash: raw.hash.clone(),
            timestamp_utc,
            timestamp_local,
            pseudonym_from: envelope.pseudonym_from.clone(),
            pseudonym_to: envelope.pseudonym_to.clone(),
            encrypted_pii: envelope.encrypted_pii.clone(),
            value_native,
            value_reporting_currency,
            decoded_call,
            is_qualifying_stablecoin: assessment.is_qualifying_stablecoin(),
            risk_score: assessment.score,
            risk_flags: assessment.flags,
            requires_reporting: assessment.requires_reporting,
            threshold: assessment.threshold,
            block_height: raw.block_height,
        }
    }

    /// Transform a batch with positional pairing of envelopes.
    ///
    /// The i-th transaction uses the i-th envelope. Positions without one get
    /// the `UNKNOWN` sentinel envelope; extra envelopes are ignored.
    pub fn process_batch(
        &self,
        raw_txs: &[RawTransaction],
        envelopes: &[PrivacyEnvelope],
    ) -> Vec<NormalizedTransaction> {
        if envelopes.len() < raw_txs.len() {
            warn!(
                "{} of {} transactions have no privacy envelope; using UNKNOWN pseudonyms",
                raw_txs.len() - envelopes.len(),
                raw_txs.len()
            );
        }

        let unknown = PrivacyEnvelope::unknown();
        let out: Vec<_> = raw_txs
            .iter()
            .enumerate()
            .map(|(i, raw)| self.transform(raw, envelopes.get(i).unwrap_or(&unknown)))
            .collect();

        debug!("Transformed batch of {} transactions", out.len());
        out
    }
}

/// Reportable subsequence, in original order. Idempotent.
pub fn filter_reportable(transactions: &[NormalizedTransaction]) -> Vec<NormalizedTransaction> {
    transactions
        .iter()
        .filter(|tx| tx.requires_reporting)
        .cloned()
        .collect()
}

/// Totals over a normalized batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_transactions: usize,
    pub reportable: usize,
    pub qualifying_stablecoin: usize,
    pub unbacked: usize,
    pub contract_interactions: usize,
    pub unknown_parties: usize,
    pub total_value_reporting_currency: f64,
    pub reportable_value_reporting_currency: f64,
}

pub fn summarize(transactions: &[NormalizedTransaction]) -> BatchSummary {
    let mut summary = BatchSummary {
        total_transactions: transactions.len(),
        ..BatchSummary::default()
    };

    for tx in transactions {
        summary.total_value_reporting_currency += tx.value_reporting_currency;
        if tx.requires_reporting {
            summary.reportable += 1;
            summary.reportable_value_reporting_currency += tx.value_reporting_currency;
        }
        if tx.is_qualifying_stablecoin {
            summary.qualifying_stablecoin += 1;
        } else {
            summary.unbacked += 1;
        }
        if tx.decoded_call.is_some() {
            summary.contract_interactions += 1;
        }
        if tx.pseudonym_from == UNKNOWN_PSEUDONYM || tx.pseudonym_to == UNKNOWN_PSEUDONYM {
            summary.unknown_parties += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::{encode_transfer, StaticClassifier};
    use crate::schemas::RiskFlag;
    use alloy_primitives::{Address, Bytes, U256};
    use chrono::Timelike;

    fn config() -> ReportingConfig {
        ReportingConfig::default()
    }

    fn eth_tx(hash: &str, wei: u128, input: Vec<u8>) -> RawTransaction {
        RawTransaction {
            hash: hash.to_string(),
            // 2024-07-01T12:00:00Z, BST in London
            unix_time: 1_719_835_200,
            value_base_units: wei,
            decimals: 18,
            input_bytes: Bytes::from(input),
            block_height: 20_000_000,
            from_address: None,
            to_address: None,
        }
    }

    fn envelope(tag: &str) -> PrivacyEnvelope {
        PrivacyEnvelope {
            pseudonym_from: format!("from-{}", tag),
            pseudonym_to: format!("to-{}", tag),
            encrypted_pii: format!("ct-{}", tag),
        }
    }

    const ONE_ETH: u128 = 1_000_000_000_000_000_000;

    #[test]
    fn test_transform_reportable_contract_call() {
        let t = Transformer::new(&config()).unwrap();
        let input = encode_transfer(Address::repeat_byte(0x11), U256::from(5u64));
        let out = t.transform(&eth_tx("0xaa", 15 * ONE_ETH, input), &envelope("a"));

        assert!((out.value_native - 15.0).abs() < 1e-9);
        assert!((out.value_reporting_currency - 27_000.0).abs() < 1e-6);
        assert!(out.requires_reporting);
        assert!(out.is_qualifying_stablecoin);
        assert_eq!(out.risk_score, 18);
        assert!(out.risk_flags.contains(&RiskFlag::SmartContractInteraction));
        assert_eq!(out.pseudonym_from, "from-a");
        assert_eq!(out.encrypted_pii, "ct-a");
        assert_eq!(out.block_height, 20_000_000);
    }

    #[test]
    fn test_timestamp_converted_to_reporting_timezone() {
        let t = Transformer::new(&config()).unwrap();
        let out = t.transform(&eth_tx("0x1", ONE_ETH, vec![]), &envelope("a"));

        assert_eq!(out.timestamp_utc.hour(), 12);
        assert_eq!(out.timestamp_local.hour(), 13);
        assert_eq!(out.timestamp_local.offset().local_minus_utc(), 3600);
        assert_eq!(out.timestamp_utc, out.timestamp_local.with_timezone(&Utc));
    }

    #[test]
    fn test_below_threshold_plain_transfer() {
        let t = Transformer::new(&config()).unwrap();
        let out = t.transform(&eth_tx("0x2", ONE_ETH, vec![]), &envelope("a"));

        assert!(!out.requires_reporting);
        assert!(out.decoded_call.is_none());
        assert_eq!(out.risk_score, 0);
        assert_eq!(
            out.risk_flags.iter().copied().collect::<Vec<_>>(),
            vec![RiskFlag::UnbackedAsset]
        );
    }

    #[test]
    fn test_transform_is_deterministic() {
        let t = Transformer::new(&config()).unwrap();
        let raw = eth_tx("0x3", 7 * ONE_ETH, encode_transfer(Address::ZERO, U256::from(1u64)));
        assert_eq!(t.transform(&raw, &envelope("a")), t.transform(&raw, &envelope("a")));
    }

    #[test]
    fn test_batch_pairs_positionally_with_unknown_sentinel() {
        let t = Transformer::new(&config()).unwrap();
        let raws = vec![
            eth_tx("0x1", ONE_ETH, vec![]),
            eth_tx("0x2", ONE_ETH, vec![]),
            eth_tx("0x3", ONE_ETH, vec![]),
        ];
        let out = t.process_batch(&raws, &[envelope("a"), envelope("b")]);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].tx_hash, "0x1");
        assert_eq!(out[0].pseudonym_from, "from-a");
        assert_eq!(out[1].pseudonym_to, "to-b");
        assert_eq!(out[2].pseudonym_from, UNKNOWN_PSEUDONYM);
        assert_eq!(out[2].pseudonym_to, UNKNOWN_PSEUDONYM);
        assert_eq!(summarize(&out).unknown_parties, 1);
    }

    #[test]
    fn test_filter_reportable_order_and_idempotence() {
        let t = Transformer::new(&config()).unwrap();
        let raws = vec![
            eth_tx("big-1", 10 * ONE_ETH, vec![]),
            eth_tx("small", ONE_ETH, vec![]),
            eth_tx("big-2", 20 * ONE_ETH, vec![]),
        ];
        let all = t.process_batch(&raws, &[]);
        let once = filter_reportable(&all);
        let twice = filter_reportable(&once);

        let hashes: Vec<_> = once.iter().map(|tx| tx.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["big-1", "big-2"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_custom_classifier() {
        let t = Transformer::new(&config())
            .unwrap()
            .with_classifier(Arc::new(StaticClassifier(true)));
        let out = t.transform(&eth_tx("0x4", 0, vec![]), &envelope("a"));
        assert!(out.is_qualifying_stablecoin);
        assert_eq!(out.risk_score, 5);
    }

    #[test]
    fn test_summary_totals() {
        let t = Transformer::new(&config()).unwrap();
        let raws = vec![
            eth_tx("a", 10 * ONE_ETH, encode_transfer(Address::ZERO, U256::from(1u64))),
            eth_tx("b", ONE_ETH, vec![]),
        ];
        let summary = summarize(&t.process_batch(&raws, &[envelope("a"), envelope("b")]));

        assert_eq!(summary.total_transactions, 2);
        assert_eq!(summary.reportable, 1);
        assert_eq!(summary.qualifying_stablecoin, 1);
        assert_eq!(summary.unbacked, 1);
        assert_eq!(summary.contract_interactions, 1);
        assert!((summary.total_value_reporting_currency - 19_800.0).abs() < 1e-6);
        assert!((summary.reportable_value_reporting_currency - 18_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let bad = ReportingConfig {
            timezone: "Mars/Olympus".to_string(),
            ..config()
        };
        assert!(Transformer::new(&bad).is_err());
    }
}
