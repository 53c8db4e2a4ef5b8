//! Provider adapters.
//!
//! Each adapter knows its endpoint layout, pagination style, credential
//! parameter and JSON shape, and maps responses into [`RawTransaction`].
//! The set is closed: adding a provider means adding an adapter here and a
//! [`ProviderKind`] variant, nothing else.

use crate::address::Chain;
use crate::config::{ProviderConfig, ProviderKind};
use crate::schemas::{BlockInfo, RawTransaction};
use alloy_primitives::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const BLOCKCHAIN_COM_URL: &str = "https://blockchain.info";
pub const BLOCKBOOK_URL: &str = "https://eth.blockbook.info";

/// Satoshi per BTC
const BTC_DECIMALS: u32 = 8;
/// Wei per ETH
const ETH_DECIMALS: u32 = 18;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Path and query for one provider call, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ProviderRequest {
    fn new(path: String) -> Self {
        Self {
            path,
            query: Vec::new(),
        }
    }

    fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// The single "fetch and normalize" capability every provider implements.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn base_url(&self) -> &str;

    fn chain(&self) -> Chain;

    /// Query parameter carrying the API credential, if the provider takes one
    fn credential_param(&self) -> Option<&'static str>;

    fn address_request(&self, address: &str, limit: u32, offset: u32) -> ProviderRequest;

    fn transaction_request(&self, tx_hash: &str) -> ProviderRequest;

    fn block_request(&self, block_id: &str) -> ProviderRequest;

    fn parse_address_transactions(&self, body: &str) -> Result<Vec<RawTransaction>, ParseError>;

    fn parse_transaction(&self, body: &str) -> Result<RawTransaction, ParseError>;

    fn parse_block(&self, body: &str) -> Result<BlockInfo, ParseError>;
}

/// Select the adapter for a provider configuration.
pub fn adapter_for(config: &ProviderConfig) -> Box<dyn ProviderAdapter> {
    match config.kind {
        ProviderKind::BlockchainCom => Box::new(BlockchainComAdapter::new(config.base_url.clone())),
        ProviderKind::Blockbook => Box::new(BlockbookAdapter::new(config.base_url.clone())),
    }
}

fn decode_hex_payload(raw: Option<&str>) -> Bytes {
    let Some(raw) = raw else {
        return Bytes::new();
    };
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    match hex::decode(digits) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            debug!("Ignoring undecodable input payload ({}): {}", e, raw);
            Bytes::new()
        }
    }
}

// ============================================================================
// Blockchain.com
// ============================================================================

/// Blockchain.com explorer: `txs`/`out` arrays with integer satoshi values.
pub struct BlockchainComAdapter {
    base_url: String,
}

impl BlockchainComAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| BLOCKCHAIN_COM_URL.to_string()),
        }
    }

    fn convert(tx: BcTransaction) -> RawTransaction {
        let value: u128 = tx.out.iter().map(|o| o.value as u128).sum();
        RawTransaction {
            hash: tx.hash,
            unix_time: tx.time,
            value_base_units: value,
            decimals: BTC_DECIMALS,
            input_bytes: Bytes::new(),
            block_height: tx.block_height.unwrap_or(0),
            from_address: tx
                .inputs
                .iter()
                .find_map(|i| i.prev_out.as_ref().and_then(|p| p.addr.clone())),
            to_address: tx.out.iter().find_map(|o| o.addr.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BcAddressResponse {
    #[serde(default)]
    txs: Vec<BcTransaction>,
}

#[derive(Debug, Deserialize)]
struct BcTransaction {
    hash: String,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    inputs: Vec<BcInput>,
    #[serde(default)]
    out: Vec<BcOutput>,
}

#[derive(Debug, Deserialize)]
struct BcInput {
    prev_out: Option<BcOutput>,
}

#[derive(Debug, Deserialize)]
struct BcOutput {
    #[serde(default)]
    value: u64,
    addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BcBlock {
    hash: String,
    height: u64,
    time: i64,
    #[serde(default)]
    n_tx: u64,
}

impl ProviderAdapter for BlockchainComAdapter {
    fn name(&self) -> &'static str {
        "blockchain.com"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chain(&self) -> Chain {
        Chain::Bitcoin
    }

    fn credential_param(&self) -> Option<&'static str> {
        Some("api_code")
    }

    fn address_request(&self, address: &str, limit: u32, offset: u32) -> ProviderRequest {
        ProviderRequest::new(format!("rawaddr/{}", address))
            .param("limit", limit)
            .param("offset", offset)
    }

    fn transaction_request(&self, tx_hash: &str) -> ProviderRequest {
        ProviderRequest::new(format!("rawtx/{}", tx_hash))
    }

    fn block_request(&self, block_id: &str) -> ProviderRequest {
        ProviderRequest::new(format!("rawblock/{}", block_id))
    }

    fn parse_address_transactions(&self, body: &str) -> Result<Vec<RawTransaction>, ParseError> {
        let response: BcAddressResponse = serde_json::from_str(body)?;
        Ok(response.txs.into_iter().map(Self::convert).collect())
    }

    fn parse_transaction(&self, body: &str) -> Result<RawTransaction, ParseError> {
        let tx: BcTransaction = serde_json::from_str(body)?;
        Ok(Self::convert(tx))
    }

    fn parse_block(&self, body: &str) -> Result<BlockInfo, ParseError> {
        let block: BcBlock = serde_json::from_str(body)?;
        Ok(BlockInfo {
            hash: block.hash,
            height: block.height,
            unix_time: block.time,
            tx_count: block.n_tx,
        })
    }
}

// ============================================================================
// Blockbook
// ============================================================================

/// Blockbook explorer: `transactions` array with string-encoded wei values.
pub struct BlockbookAdapter {
    base_url: String,
}

impl BlockbookAdapter {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| BLOCKBOOK_URL.to_string()),
        }
    }

    fn convert(tx: BbTransaction) -> Result<RawTransaction, ParseError> {
        let value_base_units = if tx.value.trim().is_empty() {
            0
        } else {
            tx.value
                .trim()
                .parse::<u128>()
                .map_err(|_| ParseError::InvalidField {
                    field: "value",
                    value: tx.value.clone(),
                })?
        };

        let payload = tx
            .ethereum_specific
            .as_ref()
            .and_then(|e| e.data.as_deref())
            .or_else(|| tx.vin.first().and_then(|v| v.hex.as_deref()));

        Ok(RawTransaction {
            hash: tx.txid,
            unix_time: tx.block_time,
            value_base_units,
            decimals: ETH_DECIMALS,
            input_bytes: decode_hex_payload(payload),
            // Pending transactions report a negative height
            block_height: u64::try_from(tx.block_height).unwrap_or(0),
            from_address: tx.vin.iter().find_map(|v| v.addresses.first().cloned()),
            to_address: tx.vout.iter().find_map(|v| v.addresses.first().cloned()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BbAddressResponse {
    #[serde(default)]
    transactions: Vec<BbTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbTransaction {
    txid: String,
    #[serde(default)]
    block_height: i64,
    #[serde(default)]
    block_time: i64,
    #[serde(default)]
    value: String,
    #[serde(default)]
    vin: Vec<BbVin>,
    #[serde(default)]
    vout: Vec<BbVout>,
    ethereum_specific: Option<BbEthereumSpecific>,
}

#[derive(Debug, Deserialize)]
struct BbVin {
    #[serde(default)]
    addresses: Vec<String>,
    hex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbVout {
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BbEthereumSpecific {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BbBlock {
    hash: String,
    height: u64,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    tx_count: u64,
}

impl ProviderAdapter for BlockbookAdapter {
    fn name(&self) -> &'static str {
        "blockbook"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    fn credential_param(&self) -> Option<&'static str> {
        None
    }

    fn address_request(&self, address: &str, limit: u32, offset: u32) -> ProviderRequest {
        let page_size = limit.max(1);
        ProviderRequest::new(format!("api/v2/address/{}", address))
            .param("page", offset / page_size + 1)
            .param("pageSize", page_size)
            .param("details", "txs")
    }

    fn transaction_request(&self, tx_hash: &str) -> ProviderRequest {
        ProviderRequest::new(format!("api/v2/tx/{}", tx_hash))
    }

    fn block_request(&self, block_id: &str) -> ProviderRequest {
        ProviderRequest::new(format!("api/v2/block/{}", block_id))
    }

    fn parse_address_transactions(&self, body: &str) -> Result<Vec<RawTransaction>, ParseError> {
        let response: BbAddressResponse = serde_json::from_str(body)?;
        response.transactions.into_iter().map(Self::convert).collect()
    }

    fn parse_transaction(&self, body: &str) -> Result<RawTransaction, ParseError> {
        let tx: BbTransaction = serde_json::from_str(body)?;
        Self::convert(tx)
    }

    fn parse_block(&self, body: &str) -> Result<BlockInfo, ParseError> {
        let block: BbBlock = serde_json::from_str(body)?;
        Ok(BlockInfo {
            hash: block.hash,
            height: block.height,
            unix_time: block.time,
            tx_count: block.tx_count,
        })
    }
}
