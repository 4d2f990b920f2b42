//! External ledger mirroring: sequential entry-id allocation and best-effort
//! append of accepted sales rows to the summary and detail streams.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use kura_core::SalesRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "kura-ledger";

/// Date-partition key for entry-id allocation: `YYMMDD` of the sale date.
pub fn partition_for(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Allocates entry ids of the form `<partition>-NNN`, strictly sequential
/// from 1 with gap-filling, never reusing a number already present in the
/// partition at allocation time. Each yielded value is recorded so repeated
/// calls within one batch cannot collide.
#[derive(Debug, Clone)]
pub struct EntryIdAllocator {
    partition: String,
    used: BTreeSet<u32>,
}

impl EntryIdAllocator {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            used: BTreeSet::new(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Seed the used-set from existing ledger identifiers. Only ids matching
    /// `<partition>-<digits>` count; anything else is another partition's or
    /// a hand-written id and is ignored.
    pub fn seed_used<I, S>(&mut self, existing_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefix = format!("{}-", self.partition);
        for id in existing_ids {
            let Some(suffix) = id.as_ref().strip_prefix(&prefix) else {
                continue;
            };
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(sequence) = suffix.parse::<u32>() {
                self.used.insert(sequence);
            }
        }
    }

    /// Next unused sequence number, lowest first.
    pub fn next_id(&mut self) -> String {
        let mut sequence = 1u32;
        while self.used.contains(&sequence) {
            sequence += 1;
        }
        self.used.insert(sequence);
        format!("{}-{:03}", self.partition, sequence)
    }
}

/// One summary-stream row: batch-level metadata under an allocated id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub entry_id: String,
    pub date: NaiveDate,
    pub destination: String,
    pub counterparty: String,
    pub handler: String,
}

/// One detail-stream row: the product line under the same allocated id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRow {
    pub entry_id: String,
    pub product_name: String,
    pub quantity: i64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ledger returned status {status} for {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("{0}")]
    Other(String),
}

/// Long-lived client for the external ledger. Append-only: implementations
/// never mutate or delete prior entries.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn list_entry_ids(&self, partition: &str) -> Result<Vec<String>, LedgerError>;
    async fn append_summary(&self, row: &SummaryRow) -> Result<(), LedgerError>;
    async fn append_detail(&self, row: &DetailRow) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    GiveUp,
}

/// Whether a non-success status is worth another attempt. The ledger answers
/// 409 when the entry id is already present; repeating the append can never
/// resolve that, so conflicts fail immediately.
pub fn status_disposition(status: reqwest::StatusCode) -> RetryDisposition {
    use reqwest::StatusCode;
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retry,
        StatusCode::CONFLICT => RetryDisposition::GiveUp,
        s if s.is_server_error() => RetryDisposition::Retry,
        _ => RetryDisposition::GiveUp,
    }
}

pub fn error_disposition(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::GiveUp
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying `attempt_index`, doubling each time with a cap.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9280".to_string(),
            api_token: None,
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP-backed ledger client. Reconnect handling lives in reqwest's pooled
/// client; transient failures get exponential backoff with a cap.
#[derive(Debug)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpLedgerClient {
    pub fn new(config: LedgerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building ledger http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute_with_retry(
        &self,
        endpoint: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, LedgerError> {
        let mut attempt = 0usize;
        loop {
            let out_of_retries = attempt >= self.backoff.max_retries;
            match self.request(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if out_of_retries || status_disposition(status) == RetryDisposition::GiveUp {
                        return Err(LedgerError::HttpStatus {
                            status: status.as_u16(),
                            endpoint: endpoint.to_string(),
                        });
                    }
                }
                Err(err) => {
                    if out_of_retries || error_disposition(&err) == RetryDisposition::GiveUp {
                        return Err(LedgerError::Request(err));
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn list_entry_ids(&self, partition: &str) -> Result<Vec<String>, LedgerError> {
        let url = format!("{}/partitions/{partition}/entries", self.base_url);
        let resp = self
            .execute_with_retry(&url, || self.client.get(&url))
            .await?;
        let ids = resp.json::<Vec<String>>().await?;
        Ok(ids)
    }

    async fn append_summary(&self, row: &SummaryRow) -> Result<(), LedgerError> {
        let url = format!("{}/summaries", self.base_url);
        match self
            .execute_with_retry(&url, || self.client.post(&url).json(row))
            .await
        {
            Ok(_) => Ok(()),
            // A retried POST can land twice; the earlier append already holds
            // this entry id, so the row is in place.
            Err(LedgerError::HttpStatus { status: 409, .. }) => {
                warn!(entry_id = %row.entry_id, "summary already present, keeping earlier append");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn append_detail(&self, row: &DetailRow) -> Result<(), LedgerError> {
        let url = format!("{}/details", self.base_url);
        match self
            .execute_with_retry(&url, || self.client.post(&url).json(row))
            .await
        {
            Ok(_) => Ok(()),
            Err(LedgerError::HttpStatus { status: 409, .. }) => {
                warn!(entry_id = %row.entry_id, "detail already present, keeping earlier append");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// In-memory ledger client for tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryLedgerClient {
    inner: std::sync::Mutex<MemoryLedgerState>,
    fail_after_appends: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    existing_ids: Vec<String>,
    summaries: Vec<SummaryRow>,
    details: Vec<DetailRow>,
    appends: usize,
}

impl MemoryLedgerClient {
    pub fn with_existing_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        client.inner.lock().unwrap().existing_ids = ids.into_iter().map(Into::into).collect();
        client
    }

    /// Fails every append after the first `n`, for partial-batch tests.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after_appends: Some(n),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> (Vec<SummaryRow>, Vec<DetailRow>) {
        let state = self.inner.lock().unwrap();
        (state.summaries.clone(), state.details.clone())
    }

    fn bump_appends(&self) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(limit) = self.fail_after_appends {
            if state.appends >= limit {
                return Err(LedgerError::Other("ledger unavailable".to_string()));
            }
        }
        state.appends += 1;
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedgerClient {
    async fn list_entry_ids(&self, partition: &str) -> Result<Vec<String>, LedgerError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .existing_ids
            .iter()
            .chain(state.summaries.iter().map(|row| &row.entry_id))
            .filter(|id| id.starts_with(&format!("{partition}-")))
            .cloned()
            .collect())
    }

    async fn append_summary(&self, row: &SummaryRow) -> Result<(), LedgerError> {
        self.bump_appends()?;
        self.inner.lock().unwrap().summaries.push(row.clone());
        Ok(())
    }

    async fn append_detail(&self, row: &DetailRow) -> Result<(), LedgerError> {
        self.bump_appends()?;
        self.inner.lock().unwrap().details.push(row.clone());
        Ok(())
    }
}

/// Fixed summary-stream metadata for this deployment; the POS export has no
/// columns for these.
#[derive(Debug, Clone)]
pub struct SummaryDefaults {
    pub destination: String,
    pub counterparty: String,
    pub handler: String,
}

impl Default for SummaryDefaults {
    fn default() -> Self {
        Self {
            destination: "酒類販売台帳".to_string(),
            counterparty: "店頭販売".to_string(),
            handler: "システム連携".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("record/id length mismatch: {records} records, {ids} ids")]
    LengthMismatch { records: usize, ids: usize },
    #[error("mirror stopped after {appended} rows: {source}")]
    Append {
        appended: usize,
        source: LedgerError,
    },
}

/// Best-effort append of a normalized batch under pre-allocated entry ids.
/// No atomicity across the two streams or across rows; a mid-batch failure
/// leaves earlier rows mirrored and reports how far it got.
pub struct LedgerMirror {
    client: Arc<dyn LedgerClient>,
    defaults: SummaryDefaults,
}

impl LedgerMirror {
    pub fn new(client: Arc<dyn LedgerClient>, defaults: SummaryDefaults) -> Self {
        Self { client, defaults }
    }

    /// Seed an allocator from the ids already present in the partition.
    pub async fn seed_allocator(&self, partition: &str) -> Result<EntryIdAllocator, LedgerError> {
        let existing = self.client.list_entry_ids(partition).await?;
        let mut allocator = EntryIdAllocator::new(partition);
        allocator.seed_used(&existing);
        Ok(allocator)
    }

    /// Append one summary + one detail row per record, in input order.
    /// Returns the number of fully mirrored rows.
    pub async fn append_batch(
        &self,
        records: &[SalesRecord],
        ids: &[String],
    ) -> Result<usize, MirrorError> {
        if records.len() != ids.len() {
            return Err(MirrorError::LengthMismatch {
                records: records.len(),
                ids: ids.len(),
            });
        }

        let mut appended = 0usize;
        for (record, entry_id) in records.iter().zip(ids) {
            let summary = SummaryRow {
                entry_id: entry_id.clone(),
                date: record.date,
                destination: self.defaults.destination.clone(),
                counterparty: self.defaults.counterparty.clone(),
                handler: self.defaults.handler.clone(),
            };
            self.client
                .append_summary(&summary)
                .await
                .map_err(|source| MirrorError::Append { appended, source })?;

            let detail = DetailRow {
                entry_id: entry_id.clone(),
                product_name: record.product_name.clone(),
                quantity: record.quantity,
            };
            self.client
                .append_detail(&detail)
                .await
                .map_err(|source| MirrorError::Append { appended, source })?;
            appended += 1;
        }

        info!(rows = appended, "mirrored batch to external ledger");
        Ok(appended)
    }
}
