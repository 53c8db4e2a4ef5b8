//! CARF Reporting Pipeline Library
//!
//! Ingests blockchain transactions from explorer APIs, protects wallet data,
//! classifies each record against the Crypto-Asset Reporting Framework
//! threshold, and keeps an append-only audit journal of every action.
//!
//! # Pipeline Stages
//!
//! 1. **Acquisition** ([`client`], [`providers`]): Rate-limited, retried fetches
//!    from one provider adapter
//! 2. **Privacy** ([`privacy`]): Salted pseudonyms, AES-256-GCM PII bundles, key erasure
//! 3. **Classification** ([`risk`]): Contract-call decoding and threshold scoring
//! 4. **Transformation** ([`transform`]): Timezone and currency normalization
//!    into [`NormalizedTransaction`]
//! 5. **Audit** ([`audit`]): Sequenced journal with JSON export
//!
//! [`collector`] wires the stages together.
//!
//! # Example
//!
//! ```no_run
//! use carf_pipeline::audit::AuditLog;
//! use carf_pipeline::collector::TransactionCollector;
//! use carf_pipeline::config::PipelineConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let audit = Arc::new(AuditLog::new());
//!     let collector = TransactionCollector::from_config(&config, audit.clone())?;
//!     let txs = collector
//!         .collect_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", 50, 0)
//!         .await?;
//!     println!("{} transactions, {} audit entries", txs.len(), audit.len());
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod audit;
pub mod client;
pub mod collector;
pub mod config;
pub mod privacy;
pub mod providers;
pub mod retry;
pub mod risk;
pub mod schemas;
pub mod transform;

// Re-export commonly used types
pub use audit::AuditLog;
pub use client::BlockchainClient;
pub use config::PipelineConfig;
pub use privacy::PrivacyGuard;
pub use risk::RiskEngine;
pub use schemas::{
    AuditEntry, NormalizedTransaction, PrivacyEnvelope, RawTransaction, RiskAssessment,
};
pub use transform::Transformer;
