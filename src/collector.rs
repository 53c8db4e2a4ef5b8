//! End-to-end collection: fetch, protect, transform, audit.
//!
//! Every externally observable action lands in the audit journal. Journal
//! parameters carry pseudonyms and counts only; raw addresses stay inside the
//! encrypted envelopes.

use crate::address::Chain;
use crate::audit::AuditLog;
use crate::client::{
    AcquisitionError, AddressFailure, BlockchainClient, CancelFlag, SearchFilters,
};
use crate::config::{ConfigError, PipelineConfig};
use crate::privacy::{PrivacyError, PrivacyGuard, PrivacyOperation};
use crate::schemas::{
    BlockInfo, NormalizedTransaction, PrivacyEnvelope, RawTransaction, SCHEMA_VERSION,
};
use crate::transform::{filter_reportable, summarize, BatchSummary, Transformer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Privacy error: {0}")]
    Privacy(#[from] PrivacyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CollectorError {
    /// Category recorded as `error_kind` in failed audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorError::Acquisition(e) => e.kind(),
            CollectorError::Privacy(_) => "privacy",
            CollectorError::Config(_) => "config",
            CollectorError::Io(_) => "io",
            CollectorError::Serialization(_) => "serialization",
        }
    }
}

/// Output of a multi-address collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub transactions: Vec<NormalizedTransaction>,
    pub summary: BatchSummary,
    /// Pseudonyms of addresses that failed, with the failure category
    pub failed: Vec<FailedAddress>,
    /// Addresses left undispatched after cancellation
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedAddress {
    pub pseudonym: String,
    pub kind: &'static str,
}

/// Transaction collector for the reporting pipeline
pub struct TransactionCollector {
    client: BlockchainClient,
    guard: Arc<PrivacyGuard>,
    transformer: Transformer,
    audit: Arc<AuditLog>,
}

impl TransactionCollector {
    pub fn new(
        client: BlockchainClient,
        guard: Arc<PrivacyGuard>,
        transformer: Transformer,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            client,
            guard,
            transformer,
            audit,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        audit: Arc<AuditLog>,
    ) -> Result<Self, CollectorError> {
        config.validate()?;
        let client = BlockchainClient::from_config(config)?;
        let guard = Arc::new(PrivacyGuard::from_config(&config.privacy)?);
        let transformer = Transformer::new(&config.reporting)?;
        Ok(Self::new(client, guard, transformer, audit))
    }

    pub fn guard(&self) -> &Arc<PrivacyGuard> {
        &self.guard
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn chain(&self) -> Chain {
        self.client.chain()
    }

    /// Fetch, protect and normalize one address's transactions.
    pub async fn collect_address(
        &self,
        address: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<NormalizedTransaction>, CollectorError> {
        let pseudonym = self.guard.pseudonymize(address);
        let chain = self.client.chain();
        let failed = |e: CollectorError| {
            self.audit.append(
                "fetch_address_transactions",
                json!({
                    "pseudonym": pseudonym,
                    "chain": chain.to_string(),
                    "provider": self.client.provider_name(),
                    "limit": limit,
                    "offset": offset,
                    "outcome": "failed",
                    "error_kind": e.kind(),
                }),
            );
            e
        };

        let raw = self
            .client
            .fetch_address_transactions(address, chain, limit, offset)
            .await
            .map_err(|e| failed(e.into()))?;
        let normalized = self.protect_and_transform(&raw).map_err(failed)?;
        let reportable = filter_reportable(&normalized).len();

        self.audit.append(
            "fetch_address_transactions",
            json!({
                "pseudonym": pseudonym,
                "chain": chain.to_string(),
                "provider": self.client.provider_name(),
                "limit": limit,
                "offset": offset,
                "outcome": "ok",
                "count": normalized.len(),
                "reportable": reportable,
            }),
        );
        info!(
            "Collected {} transactions ({} reportable) for {}",
            normalized.len(),
            reportable,
            &pseudonym[..16]
        );
        Ok(normalized)
    }

    /// Search many addresses, isolating per-address failures.
    pub async fn collect_search(
        &self,
        addresses: &[String],
        filters: &SearchFilters,
        cancel: &CancelFlag,
    ) -> Result<CollectionReport, CollectorError> {
        let outcome = self
            .client
            .search_transactions_with_cancel(addresses, filters, cancel)
            .await;

        let failed: Vec<FailedAddress> = outcome
            .failures
            .iter()
            .map(|f: &AddressFailure| FailedAddress {
                pseudonym: self.guard.pseudonymize(&f.address),
                kind: f.kind,
            })
            .collect();
        let pseudonyms: Vec<String> = addresses
            .iter()
            .map(|a| self.guard.pseudonymize(a))
            .collect();

        let transactions = match self.protect_and_transform(&outcome.transactions) {
            Ok(transactions) => transactions,
            Err(e) => {
                self.audit.append(
                    "search_transactions",
                    json!({
                        "pseudonyms": pseudonyms,
                        "min_value": filters.min_value,
                        "limit": filters.limit,
                        "outcome": "failed",
                        "error_kind": e.kind(),
                        "fetched": outcome.transactions.len(),
                        "failed": failed,
                        "skipped": outcome.skipped.len(),
                    }),
                );
                return Err(e);
            }
        };
        let summary = summarize(&transactions);

        self.audit.append(
            "search_transactions",
            json!({
                "pseudonyms": pseudonyms,
                "min_value": filters.min_value,
                "limit": filters.limit,
                "outcome": "ok",
                "count": transactions.len(),
                "reportable": summary.reportable,
                "failed": failed,
                "skipped": outcome.skipped.len(),
            }),
        );

        if !failed.is_empty() {
            warn!(
                "{} of {} addresses failed during search",
                failed.len(),
                addresses.len()
            );
        }

        Ok(CollectionReport {
            transactions,
            summary,
            failed,
            skipped: outcome.skipped.len(),
        })
    }

    /// Look up and normalize a single transaction.
    pub async fn lookup_transaction(
        &self,
        tx_hash: &str,
    ) -> Result<NormalizedTransaction, CollectorError> {
        let failed = |e: CollectorError| {
            self.audit.append(
                "get_transaction_details",
                json!({"tx_hash": tx_hash, "outcome": "failed", "error_kind": e.kind()}),
            );
            e
        };

        let raw = self
            .client
            .get_transaction_details(tx_hash)
            .await
            .map_err(|e| failed(e.into()))?;
        let envelope = self.envelope_for(&raw).map_err(|e| failed(e.into()))?;
        let normalized = self.transformer.transform(&raw, &envelope);
        self.audit.append(
            "get_transaction_details",
            json!({
                "tx_hash": tx_hash,
                "outcome": "ok",
                "requires_reporting": normalized.requires_reporting,
                "risk_score": normalized.risk_score,
            }),
        );
        Ok(normalized)
    }

    pub async fn block_info(&self, block_id: &str) -> Result<BlockInfo, CollectorError> {
        let result = self.client.get_block_info(block_id).await;
        self.audit.append(
            "get_block_info",
            json!({
                "block_id": block_id,
                "outcome": if result.is_ok() { "ok" } else { "failed" },
            }),
        );
        Ok(result?)
    }

    /// Pseudonymize an address on request, recording the operation.
    pub fn pseudonymize(&self, address: &str) -> String {
        let pseudonym = self.guard.pseudonymize(address);
        self.audit
            .record(self.guard.audit_entry_for(PrivacyOperation::Pseudonymize, &pseudonym));
        pseudonym
    }

    /// Decrypt a stored PII bundle. The attempt is audited whether or not it succeeds.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CollectorError> {
        let result = self.guard.decrypt(ciphertext);
        let mut event = self
            .guard
            .audit_entry_for(PrivacyOperation::Decrypt, "pii_bundle");
        event.parameters.insert(
            "outcome".to_string(),
            json!(if result.is_ok() { "ok" } else { "authentication_failed" }),
        );
        self.audit.record(event);
        Ok(result?)
    }

    /// Erase the encryption key. Terminal for all data encrypted under it.
    pub fn erase_key(&self) -> Result<bool, CollectorError> {
        let result = self.guard.erase();
        let mut event = self
            .guard
            .audit_entry_for(PrivacyOperation::EraseKey, "encryption_key");
        match &result {
            Ok(existed) => {
                event.parameters.insert("outcome".to_string(), json!("ok"));
                event
                    .parameters
                    .insert("key_material_existed".to_string(), json!(existed));
            }
            Err(_) => {
                event.parameters.insert("outcome".to_string(), json!("failed"));
                event
                    .parameters
                    .insert("error_kind".to_string(), json!("privacy"));
            }
        }
        self.audit.record(event);
        Ok(result?)
    }

    pub fn regenerate_key(&self) -> Result<(), CollectorError> {
        let result = self.guard.regenerate_key();
        let mut event = self
            .guard
            .audit_entry_for(PrivacyOperation::RegenerateKey, "encryption_key");
        event.parameters.insert(
            "outcome".to_string(),
            json!(if result.is_ok() { "ok" } else { "failed" }),
        );
        self.audit.record(event);
        Ok(result?)
    }

    fn envelope_for(&self, raw: &RawTransaction) -> Result<PrivacyEnvelope, PrivacyError> {
        self.guard
            .envelope_for(raw.from_address.as_deref(), raw.to_address.as_deref())
    }

    /// Build one envelope per transaction, then transform positionally.
    ///
    /// PII that cannot be encrypted aborts the batch rather than leaking
    /// through an unprotected record.
    fn protect_and_transform(
        &self,
        raw: &[RawTransaction],
    ) -> Result<Vec<NormalizedTransaction>, CollectorError> {
        let envelopes = raw
            .iter()
            .map(|tx| self.envelope_for(tx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.transformer.process_batch(raw, &envelopes))
    }
}

/// Versioned output document written by [`write_transactions_json`].
#[derive(Debug, Serialize)]
struct TransactionsDocument<'a> {
    schema_version: &'static str,
    generated_at: DateTime<Utc>,
    summary: BatchSummary,
    transactions: &'a [NormalizedTransaction],
}

/// Write normalized records as pretty JSON, replacing the file atomically.
pub fn write_transactions_json(
    transactions: &[NormalizedTransaction],
    path: &Path,
) -> Result<(), CollectorError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let document = TransactionsDocument {
        schema_version: SCHEMA_VERSION,
        generated_at: Utc::now(),
        summary: summarize(transactions),
        transactions,
    };
    let mut tmp = path.to_path_buf();
    tmp.set_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
    fs::rename(&tmp, path)?;

    info!("Wrote {} transactions to {}", transactions.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpResponse, Transport, TransportError};
    use crate::config::{RateLimitConfig, ReportingConfig};
    use crate::providers::BlockbookAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always answers with the same body, counting requests.
    struct FixedTransport(String, AtomicUsize);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: self.0.clone(),
            })
        }
    }

    const SENDER: &str = "0x1111111111111111111111111111111111111111";

    fn collector(dir: &tempfile::TempDir, body: &str) -> TransactionCollector {
        collector_with(dir, Arc::new(FixedTransport(body.to_string(), AtomicUsize::new(0))))
    }

    fn collector_with(
        dir: &tempfile::TempDir,
        transport: Arc<FixedTransport>,
    ) -> TransactionCollector {
        let limits = RateLimitConfig {
            min_request_delay_ms: 0,
            ..RateLimitConfig::default()
        };
        let client = BlockchainClient::new(
            Box::new(BlockbookAdapter::new(None)),
            transport,
            None,
            &limits,
        );
        let guard = Arc::new(PrivacyGuard::new("salt", dir.path().join("key")).unwrap());
        let transformer = Transformer::new(&ReportingConfig::default()).unwrap();
        TransactionCollector::new(client, guard, transformer, Arc::new(AuditLog::new()))
    }

    fn address_body() -> String {
        format!(
            r#"{{"transactions": [{{
                "txid": "0xabc",
                "blockHeight": 19000000,
                "blockTime": 1704067200,
                "value": "6000000000000000000",
                "vin": [{{"addresses": ["{}"]}}],
                "vout": [{{"addresses": ["0x2222222222222222222222222222222222222222"]}}]
            }}]}}"#,
            SENDER
        )
    }

    #[tokio::test]
    async fn test_collect_address_protects_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir, &address_body());

        let txs = c.collect_address(SENDER, 10, 0).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].pseudonym_from, c.guard().pseudonymize(SENDER));
        assert!(txs[0].requires_reporting);

        let journal = c.audit().snapshot();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].action, "fetch_address_transactions");
        let rendered = serde_json::to_string(&journal[0].parameters).unwrap();
        assert!(!rendered.contains(SENDER));
        assert!(!rendered.contains("0x2222"));
    }

    #[tokio::test]
    async fn test_erased_key_blocks_collection() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport(address_body(), AtomicUsize::new(0)));
        let c = collector_with(&dir, Arc::clone(&transport));

        assert!(!c.erase_key().unwrap());
        let err = c.collect_address(SENDER, 10, 0).await.unwrap_err();
        assert!(matches!(err, CollectorError::Privacy(PrivacyError::KeyErased)));

        // The provider was contacted, so the failed collection is journaled
        assert_eq!(transport.1.load(Ordering::SeqCst), 1);
        let journal = c.audit().snapshot();
        let actions: Vec<_> = journal.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["privacy.erase_key", "fetch_address_transactions"]);
        assert_eq!(journal[1].parameters["outcome"], "failed");
        assert_eq!(journal[1].parameters["error_kind"], "privacy");
        assert_eq!(journal[1].parameters["pseudonym"], c.guard().pseudonymize(SENDER));
    }

    #[tokio::test]
    async fn test_failed_search_and_lookup_are_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir, &address_body());
        c.erase_key().unwrap();

        let cancel = CancelFlag::new();
        let err = c
            .collect_search(&[SENDER.to_string()], &SearchFilters::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "privacy");

        // The fixed body is not a transaction document
        let err = c.lookup_transaction("0xabc").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_response");

        let journal = c.audit().snapshot();
        let actions: Vec<_> = journal.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(
            actions,
            vec!["privacy.erase_key", "search_transactions", "get_transaction_details"]
        );
        assert_eq!(journal[1].parameters["outcome"], "failed");
        assert_eq!(journal[1].parameters["fetched"], 1);
        assert_eq!(journal[2].parameters["error_kind"], "invalid_response");
    }

    #[tokio::test]
    async fn test_decrypt_attempts_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let c = collector(&dir, &address_body());
        let txs = c.collect_address(SENDER, 10, 0).await.unwrap();

        let plaintext = c.decrypt(&txs[0].encrypted_pii).unwrap();
        assert!(plaintext.contains(SENDER));
        assert!(c.decrypt("garbage").is_err());

        let journal = c.audit().snapshot();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal[1].parameters["outcome"], "ok");
        assert_eq!(journal[2].parameters["outcome"], "authentication_failed");
    }

    #[test]
    fn test_write_transactions_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("txs.json");
        write_transactions_json(&[], &path).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["schema_version"], SCHEMA_VERSION);
        assert_eq!(doc["summary"]["total_transactions"], 0);
        assert!(doc["transactions"].as_array().unwrap().is_empty());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
