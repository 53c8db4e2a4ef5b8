//! Provider-agnostic blockchain client with rate limiting and retry logic.
//!
//! Provides a robust wrapper around the provider adapters with:
//! - A minimum spacing between outbound requests, shared by every task using
//!   the same client instance
//! - Bounded exponential backoff on transient failures (timeouts, 429, 5xx)
//! - Immediate failure on client errors (4xx, malformed addresses)
//! - Concurrent multi-address search with per-address failure isolation and
//!   cooperative cancellation

use crate::address::{validate_address, Chain};
use crate::config::{PipelineConfig, RateLimitConfig};
use crate::providers::{adapter_for, ParseError, ProviderAdapter, ProviderRequest};
use crate::retry::{retry_with_backoff, BackoffPolicy, RetryOutcome, Step};
use crate::schemas::{BlockInfo, RawTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Transient fetch failure for {target} after {attempts} attempts: {cause}")]
    TransientFetch {
        target: String,
        attempts: u32,
        cause: String,
    },

    #[error("Client error for {target}: {reason}")]
    Client { target: String, reason: String },

    #[error("Invalid response for {target}: {source}")]
    InvalidResponse {
        target: String,
        #[source]
        source: ParseError,
    },

    #[error("HTTP client setup failed: {0}")]
    Setup(String),
}

impl AcquisitionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AcquisitionError::TransientFetch { .. })
    }

    /// Short category name, free of request targets.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionError::TransientFetch { .. } => "transient_fetch",
            AcquisitionError::Client { .. } => "client",
            AcquisitionError::InvalidResponse { .. } => "invalid_response",
            AcquisitionError::Setup(_) => "setup",
        }
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Raw HTTP response as seen by the client.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Minimal GET capability the client needs from an HTTP stack.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport over `reqwest` with a bounded timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, AcquisitionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(concat!("carf-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AcquisitionError::Setup(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Search inputs
// ============================================================================

/// Filters applied by [`BlockchainClient::search_transactions`].
#[derive(Debug, Clone)]
pub struct SearchFilters {
    /// Minimum value in native display units (inclusive)
    pub min_value: Option<f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Maximum number of results after filtering
    pub limit: usize,
    /// Page size requested per address
    pub per_address_limit: u32,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            min_value: None,
            start: None,
            end: None,
            limit: 100,
            per_address_limit: 100,
        }
    }
}

impl SearchFilters {
    fn matches(&self, tx: &RawTransaction) -> bool {
        if let Some(min) = self.min_value {
            if tx.value_native() < min {
                return false;
            }
        }
        if let Some(start) = self.start {
            if tx.unix_time < start.timestamp() {
                return false;
            }
        }
        if let Some(end) = self.end {
            if tx.unix_time > end.timestamp() {
                return false;
            }
        }
        true
    }
}

/// One address that could not be fetched during a batch search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressFailure {
    pub address: String,
    pub kind: &'static str,
    pub reason: String,
}

/// Filtered results plus the per-address failures that were isolated.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub transactions: Vec<RawTransaction>,
    pub failures: Vec<AddressFailure>,
    /// Addresses never dispatched because the batch was cancelled
    pub skipped: Vec<String>,
}

/// Cooperative cancellation signal for batch searches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptFailure {
    Network(TransportError),
    Status(u16, String),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Network(e) => write!(f, "{}", e),
            AttemptFailure::Status(code, body) => {
                let snippet: String = body.chars().take(120).collect();
                write!(f, "HTTP {} {}", code, snippet)
            }
        }
    }
}

/// Rate-limited blockchain client over one provider adapter.
pub struct BlockchainClient {
    adapter: Box<dyn ProviderAdapter>,
    transport: Arc<dyn Transport>,
    api_key: Option<String>,
    rate_limiter: Option<DefaultDirectRateLimiter>,
    policy: BackoffPolicy,
    max_concurrency: usize,
}

impl BlockchainClient {
    /// Build a client for the configured provider over a `reqwest` transport.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, AcquisitionError> {
        let timeout = Duration::from_secs(config.rate_limits.request_timeout_secs);
        let transport = Arc::new(ReqwestTransport::new(timeout)?);
        Ok(Self::new(
            adapter_for(&config.provider),
            transport,
            config.provider.api_key.clone(),
            &config.rate_limits,
        ))
    }

    pub fn new(
        adapter: Box<dyn ProviderAdapter>,
        transport: Arc<dyn Transport>,
        api_key: Option<String>,
        limits: &RateLimitConfig,
    ) -> Self {
        // One cell per period with no burst: consecutive requests are spaced
        // by at least the configured delay
        let rate_limiter = Quota::with_period(Duration::from_millis(limits.min_request_delay_ms))
            .map(RateLimiter::direct);

        info!(
            "Initialized {} client with base URL: {}",
            adapter.name(),
            adapter.base_url()
        );

        Self {
            adapter,
            transport,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            rate_limiter,
            policy: BackoffPolicy::from_config(limits),
            max_concurrency: limits.max_concurrency.max(1),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn chain(&self) -> Chain {
        self.adapter.chain()
    }

    fn url_for(&self, request: &ProviderRequest) -> String {
        format!("{}/{}", self.adapter.base_url().trim_end_matches('/'), request.path)
    }

    fn query_for(&self, request: &ProviderRequest) -> Vec<(String, String)> {
        let mut query = request.query.clone();
        if let (Some(param), Some(key)) = (self.adapter.credential_param(), &self.api_key) {
            query.push((param.to_string(), key.clone()));
        }
        query
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Step<String, AttemptFailure> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        match self.transport.get(url, query).await {
            Err(e) => Step::Transient(AttemptFailure::Network(e)),
            Ok(resp) if resp.status == 429 || resp.status >= 500 => {
                Step::Transient(AttemptFailure::Status(resp.status, resp.body))
            }
            Ok(resp) if resp.status >= 400 => {
                Step::Fatal(AttemptFailure::Status(resp.status, resp.body))
            }
            Ok(resp) if (200..300).contains(&resp.status) => Step::Done(resp.body),
            Ok(resp) => Step::Fatal(AttemptFailure::Status(resp.status, resp.body)),
        }
    }

    /// Issue one provider request with retry/backoff and return the body.
    async fn fetch_body(
        &self,
        target: &str,
        request: ProviderRequest,
    ) -> Result<String, AcquisitionError> {
        let url = self.url_for(&request);
        let query = self.query_for(&request);
        debug!("GET {} ({} params) for {}", url, query.len(), target);

        let outcome = retry_with_backoff(&self.policy, tokio::time::sleep, |_attempt| {
            let url = url.as_str();
            let query = query.as_slice();
            async move { self.send_once(url, query).await }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(AcquisitionError::TransientFetch {
                target: target.to_string(),
                attempts,
                cause: last_error.to_string(),
            }),
            RetryOutcome::Fatal { error, .. } => Err(AcquisitionError::Client {
                target: target.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    /// Get transactions for a wallet address, normalized to [`RawTransaction`].
    pub async fn fetch_address_transactions(
        &self,
        address: &str,
        chain: Chain,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RawTransaction>, AcquisitionError> {
        if chain != self.adapter.chain() {
            return Err(AcquisitionError::Client {
                target: address.to_string(),
                reason: format!(
                    "provider {} serves {}, not {}",
                    self.adapter.name(),
                    self.adapter.chain(),
                    chain
                ),
            });
        }
        if limit == 0 {
            return Err(AcquisitionError::Client {
                target: address.to_string(),
                reason: "limit must be at least 1".to_string(),
            });
        }
        let address = validate_address(chain, address).map_err(|e| AcquisitionError::Client {
            target: address.to_string(),
            reason: e.to_string(),
        })?;

        let request = self.adapter.address_request(&address, limit, offset);
        let body = self.fetch_body(&address, request).await?;
        let txs = self
            .adapter
            .parse_address_transactions(&body)
            .map_err(|source| AcquisitionError::InvalidResponse {
                target: address.clone(),
                source,
            })?;

        debug!("Got {} transactions for address {}", txs.len(), address);
        Ok(txs)
    }

    /// Get detailed information about a specific transaction.
    pub async fn get_transaction_details(
        &self,
        tx_hash: &str,
    ) -> Result<RawTransaction, AcquisitionError> {
        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() || !tx_hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AcquisitionError::Client {
                target: tx_hash.to_string(),
                reason: "malformed transaction hash".to_string(),
            });
        }

        let body = self
            .fetch_body(tx_hash, self.adapter.transaction_request(tx_hash))
            .await?;
        self.adapter
            .parse_transaction(&body)
            .map_err(|source| AcquisitionError::InvalidResponse {
                target: tx_hash.to_string(),
                source,
            })
    }

    /// Get block information by hash or height.
    pub async fn get_block_info(&self, block_id: &str) -> Result<BlockInfo, AcquisitionError> {
        let block_id = block_id.trim();
        if block_id.is_empty() || !block_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AcquisitionError::Client {
                target: block_id.to_string(),
                reason: "malformed block hash or height".to_string(),
            });
        }

        let body = self
            .fetch_body(block_id, self.adapter.block_request(block_id))
            .await?;
        self.adapter
            .parse_block(&body)
            .map_err(|source| AcquisitionError::InvalidResponse {
                target: block_id.to_string(),
                source,
            })
    }

    /// Search transactions across many addresses.
    pub async fn search_transactions(
        &self,
        addresses: &[String],
        filters: &SearchFilters,
    ) -> SearchOutcome {
        self.search_transactions_with_cancel(addresses, filters, &CancelFlag::new())
            .await
    }

    /// Search transactions across many addresses, stopping dispatch on cancel.
    ///
    /// Fetches run concurrently (bounded by `max_concurrency`) and share the
    /// client's rate limiter. A failing address is logged and recorded in
    /// [`SearchOutcome::failures`] without affecting its siblings. Results keep
    /// the input address order.
    pub async fn search_transactions_with_cancel(
        &self,
        addresses: &[String],
        filters: &SearchFilters,
        cancel: &CancelFlag,
    ) -> SearchOutcome {
        let chain = self.adapter.chain();
        let per_address_limit = filters.per_address_limit.max(1);

        let results: Vec<(String, Result<Vec<RawTransaction>, AcquisitionError>)> =
            stream::iter(addresses.iter())
                .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
                .map(|address| async move {
                    let result = self
                        .fetch_address_transactions(address, chain, per_address_limit, 0)
                        .await;
                    (address.clone(), result)
                })
                .buffered(self.max_concurrency)
                .collect()
                .await;

        let mut outcome = SearchOutcome::default();
        let dispatched = results.len();

        for (address, result) in results {
            match result {
                Ok(txs) => outcome.transactions.extend(txs),
                Err(e) => {
                    error!("Failed to fetch transactions for {}: {}", address, e);
                    outcome.failures.push(AddressFailure {
                        address,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if dispatched < addresses.len() {
            warn!(
                "Search cancelled: {} of {} addresses were not dispatched",
                addresses.len() - dispatched,
                addresses.len()
            );
            outcome.skipped = addresses[dispatched..].to_vec();
        }

        outcome.transactions.retain(|tx| filters.matches(tx));
        outcome.transactions.truncate(filters.limit);

        info!(
            "Search over {} addresses: {} matching transactions, {} failures",
            dispatched,
            outcome.transactions.len(),
            outcome.failures.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::BlockbookAdapter;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport replaying a fixed script of responses.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            url: &str,
            query: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.calls.lock().push((url.to_string(), query.to_vec()));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or(Err(TransportError::Other("script exhausted".to_string())))
        }
    }

    fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: code,
            body: String::new(),
        })
    }

    fn fast_limits(max_retries: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_retries,
            min_request_delay_ms: 0,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..RateLimitConfig::default()
        }
    }

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn client(transport: Arc<ScriptedTransport>, max_retries: u32) -> BlockchainClient {
        BlockchainClient::new(
            Box::new(BlockbookAdapter::new(Some("http://bb.test/".to_string()))),
            transport,
            None,
            &fast_limits(max_retries),
        )
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            status(503),
            Err(TransportError::Timeout),
            ok(r#"{"transactions": [{"txid": "0x1", "value": "1000000000000000000"}]}"#),
        ]);
        let client = client(transport.clone(), 3);

        let txs = client
            .fetch_address_transactions(ADDR, Chain::Ethereum, 10, 0)
            .await
            .unwrap();

        assert_eq!(txs.len(), 1);
        assert_eq!(transport.calls.lock().len(), 3);
        assert_eq!(
            transport.calls.lock()[0].0,
            format!("http://bb.test/api/v2/address/{}", ADDR)
        );
    }

    #[tokio::test]
    async fn test_exhaustion_names_address_and_attempts() {
        let transport = ScriptedTransport::new(vec![status(500), status(502)]);
        let client = client(transport, 2);

        let err = client
            .fetch_address_transactions(ADDR, Chain::Ethereum, 10, 0)
            .await
            .unwrap_err();

        match err {
            AcquisitionError::TransientFetch { target, attempts, cause } => {
                assert_eq!(target, ADDR);
                assert_eq!(attempts, 2);
                assert!(cause.contains("502"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_client_errors_fail_immediately() {
        let transport = ScriptedTransport::new(vec![status(404), ok("{}")]);
        let client = client(transport.clone(), 5);

        let err = client
            .fetch_address_transactions(ADDR, Chain::Ethereum, 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Client { .. }));
        assert_eq!(transport.calls.lock().len(), 1);

        // Malformed input never reaches the transport
        let err = client
            .fetch_address_transactions("0xnope", Chain::Ethereum, 10, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Client { .. }));
        assert_eq!(transport.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_chain_rejected() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport.clone(), 1);
        let err = client
            .fetch_address_transactions("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", Chain::Bitcoin, 10, 0)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(transport.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_credential_appended_when_provider_takes_one() {
        let body = r#"{"hash": "h", "height": 1, "time": 0}"#;
        let transport = ScriptedTransport::new(vec![ok(body)]);
        let client = BlockchainClient::new(
            Box::new(crate::providers::BlockchainComAdapter::new(Some(
                "http://bc.test".to_string(),
            ))),
            transport.clone(),
            Some("secret".to_string()),
            &fast_limits(1),
        );

        let block = client.get_block_info("800000").await.unwrap();
        assert_eq!(block.height, 1);

        let calls = transport.calls.lock();
        assert_eq!(calls[0].0, "http://bc.test/rawblock/800000");
        assert!(calls[0].1.contains(&("api_code".to_string(), "secret".to_string())));
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let body = r#"{"txid": "0x1", "value": "0"}"#;
        let transport = ScriptedTransport::new(vec![ok(body), ok(body), ok(body)]);
        let limits = RateLimitConfig {
            min_request_delay_ms: 40,
            ..fast_limits(1)
        };
        let client = BlockchainClient::new(
            Box::new(BlockbookAdapter::new(None)),
            transport,
            None,
            &limits,
        );

        let started = std::time::Instant::now();
        for _ in 0..3 {
            client.get_transaction_details("0x1").await.unwrap();
        }
        // First request passes immediately, the next two wait a period each
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    /// Records when each request reaches the transport.
    #[derive(Default)]
    struct TimedTransport {
        arrivals: Mutex<Vec<std::time::Instant>>,
    }

    #[async_trait]
    impl Transport for TimedTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.arrivals.lock().push(std::time::Instant::now());
            ok(r#"{"transactions": []}"#)
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_shared_by_concurrent_search() {
        let delay = Duration::from_millis(40);
        let transport = Arc::new(TimedTransport::default());
        let limits = RateLimitConfig {
            min_request_delay_ms: 40,
            max_concurrency: 4,
            ..fast_limits(1)
        };
        let client = BlockchainClient::new(
            Box::new(BlockbookAdapter::new(None)),
            transport.clone(),
            None,
            &limits,
        );

        let addresses: Vec<String> = ["11", "22", "33", "44"]
            .iter()
            .map(|b| format!("0x{}", b.repeat(20)))
            .collect();
        let outcome = client
            .search_transactions(&addresses, &SearchFilters::default())
            .await;
        assert!(outcome.failures.is_empty());

        let mut arrivals = transport.arrivals.lock().clone();
        arrivals.sort();
        assert_eq!(arrivals.len(), 4);
        // All four fetches are in flight at once, yet requests stay spaced
        let tolerance = Duration::from_millis(5);
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] + tolerance >= delay);
        }
    }

    #[tokio::test]
    async fn test_cancelled_search_dispatches_nothing() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(transport.clone(), 1);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let addresses = vec![ADDR.to_string()];
        let outcome = client
            .search_transactions_with_cancel(&addresses, &SearchFilters::default(), &cancel)
            .await;

        assert!(outcome.transactions.is_empty());
        assert_eq!(outcome.skipped, addresses);
        assert!(transport.calls.lock().is_empty());
    }
}
