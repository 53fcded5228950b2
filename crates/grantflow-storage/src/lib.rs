//! Persistence and I/O plumbing: the grant store (dedup/upsert engine and
//! run history log), a hash-addressed archive for raw source payloads, the
//! retry/rate-limited HTTP fetcher, and the generative text backend client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use grantflow_core::{
    identity_key, ContactInfo, DiscoveryMethod, Grant, GrantRecord, GrantStatus, RunStatus,
    ScraperHistory, ScraperSource,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "grantflow-storage";

// ---------------------------------------------------------------------------
// Raw payload archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive for raw adapter response bodies, laid out as
/// `{fetch-stamp}/{source}/{sha256}.{ext}`. Identical payloads collapse to
/// one file; writes go through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(fetched_at, source, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch utilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
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
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with retry classification, exponential capped backoff,
/// per-source concurrency limits and an optional token bucket.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn get_bytes(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(source, url, || self.client.get(url)).await
    }

    /// GET with query pairs serialized by reqwest, so callers never build
    /// percent-encoded URLs by hand.
    pub async fn get_with_query<Q>(
        &self,
        source: &str,
        url: &str,
        query: &Q,
    ) -> Result<FetchedResponse, FetchError>
    where
        Q: serde::Serialize + ?Sized,
    {
        self.execute(source, url, || self.client.get(url).query(query))
            .await
    }

    pub async fn get_with_header<Q>(
        &self,
        source: &str,
        url: &str,
        header: &str,
        value: &str,
        query: &Q,
    ) -> Result<FetchedResponse, FetchError>
    where
        Q: serde::Serialize + ?Sized,
    {
        let header = header.to_string();
        let value = value.to_string();
        self.execute(source, url, move || {
            self.client.get(url).header(&header, &value).query(query)
        })
        .await
    }

    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        self.execute(source, url, || self.client.post(url).json(body))
            .await
    }

    async fn execute<F>(
        &self,
        source: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_request", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Generative text backend
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("text backend is not configured")]
    Disabled,
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned http status {0}")]
    HttpStatus(u16),
    #[error("backend response violated the expected schema: {0}")]
    Schema(String),
}

/// A generative text-completion backend that can be asked for a single JSON
/// object. Assisted extraction and scoring both go through this seam; tests
/// substitute their own implementations.
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, BackendError>;
}

/// OpenAI-compatible chat-completions client. Configured entirely from the
/// environment; absent configuration means the backend is disabled and every
/// call site falls back to its deterministic path.
pub struct HttpTextBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpTextBackend {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building text backend client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Returns `None` when `TEXT_BACKEND_API_KEY` is unset.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(api_key) = std::env::var("TEXT_BACKEND_API_KEY") else {
            return Ok(None);
        };
        let endpoint = std::env::var("TEXT_BACKEND_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
        let model =
            std::env::var("TEXT_BACKEND_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout_secs = std::env::var("TEXT_BACKEND_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Ok(Some(Self::new(
            endpoint,
            api_key,
            model,
            Duration::from_secs(timeout_secs),
        )?))
    }
}

/// Strip a ```json fence if the model wrapped its output in one.
pub fn unwrap_json_block(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

#[async_trait]
impl TextBackend for HttpTextBackend {
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.0,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::HttpStatus(resp.status().as_u16()));
        }
        let envelope: serde_json::Value = resp.json().await?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Schema("missing choices[0].message.content".into()))?;
        serde_json::from_str(unwrap_json_block(content))
            .map_err(|e| BackendError::Schema(format!("content is not a JSON object: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Grant store: dedup/upsert engine + run history
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row is malformed: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub grant: Grant,
    pub inserted: bool,
}

/// The single write path into the `grants` table, plus the append-only run
/// history log and the scrape-source registry.
///
/// Upsert identity: (source, source_native_id) when present, else exact
/// case-insensitive (title, funder). For any two upserts presenting the same
/// identity, exactly one stored row exists afterwards.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn upsert(&self, record: &GrantRecord) -> Result<UpsertOutcome, StoreError>;
    async fn get(&self, id: i64) -> Result<Option<Grant>, StoreError>;
    async fn unscored(&self, limit: u32) -> Result<Vec<Grant>, StoreError>;
    async fn set_score(&self, id: i64, score: f64, explanation: &str) -> Result<(), StoreError>;

    async fn record_run(&self, history: &ScraperHistory) -> Result<(), StoreError>;
    async fn finalize_run(&self, history: &ScraperHistory) -> Result<(), StoreError>;
    async fn latest_run(&self) -> Result<Option<ScraperHistory>, StoreError>;

    async fn active_sources(&self) -> Result<Vec<ScraperSource>, StoreError>;
    async fn upsert_source(&self, source: &ScraperSource) -> Result<(), StoreError>;
    async fn touch_source(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

fn record_matches_identity(grant: &Grant, record: &GrantRecord) -> bool {
    identity_key(&grant.title, &grant.funder) == identity_key(&record.title, &record.funder)
}

fn new_grant_from_record(id: i64, record: &GrantRecord, now: DateTime<Utc>) -> Grant {
    Grant {
        id,
        title: record.title.clone(),
        funder: record.funder.clone(),
        description: record.description.clone(),
        amount_min: record.amount_min,
        amount_max: record.amount_max,
        due_date: record.due_date,
        status: record.status,
        eligibility: record.eligibility.clone(),
        website: record.website.clone(),
        focus_areas: record.focus_areas.clone(),
        contact: record.contact.clone(),
        match_score: None,
        match_explanation: None,
        is_scraped: record.is_scraped,
        discovery_method: record.discovery_method,
        search_query: record.search_query.clone(),
        source: record.source.clone(),
        source_native_id: record.source_native_id.clone(),
        created_at: now,
        updated_at: now,
    }
}

// --- in-memory implementation ---

#[derive(Default)]
struct MemoryInner {
    grants: Vec<Grant>,
    next_id: i64,
    history: Vec<ScraperHistory>,
    sources: Vec<ScraperSource>,
}

/// Single-process store used by tests and `--dry-run` discovery passes.
#[derive(Default)]
pub struct MemoryGrantStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<ScraperSource>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                sources,
                ..MemoryInner::default()
            }),
        }
    }

    pub async fn grant_count(&self) -> usize {
        self.inner.lock().await.grants.len()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn upsert(&self, record: &GrantRecord) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        // Source-native identity takes precedence over the title/funder
        // heuristic when both could match.
        if let (Some(source), Some(native_id)) = (&record.source, &record.source_native_id) {
            if let Some(existing) = inner.grants.iter_mut().find(|g| {
                g.source.as_deref() == Some(source.as_str())
                    && g.source_native_id.as_deref() == Some(native_id.as_str())
            }) {
                existing.title = record.title.clone();
                existing.funder = record.funder.clone();
                existing.refresh_from(record, now);
                return Ok(UpsertOutcome {
                    grant: existing.clone(),
                    inserted: false,
                });
            }
        }

        if let Some(existing) = inner
            .grants
            .iter_mut()
            .find(|g| record_matches_identity(g, record))
        {
            existing.refresh_from(record, now);
            return Ok(UpsertOutcome {
                grant: existing.clone(),
                inserted: false,
            });
        }

        inner.next_id += 1;
        let grant = new_grant_from_record(inner.next_id, record, now);
        inner.grants.push(grant.clone());
        Ok(UpsertOutcome {
            grant,
            inserted: true,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<Grant>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .grants
            .iter()
            .find(|g| g.id == id)
            .cloned())
    }

    async fn unscored(&self, limit: u32) -> Result<Vec<Grant>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .grants
            .iter()
            .filter(|g| g.match_score.map_or(true, |s| s == 0.0))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn set_score(&self, id: i64, score: f64, explanation: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(grant) = inner.grants.iter_mut().find(|g| g.id == id) {
            grant.match_score = Some(score);
            grant.match_explanation = Some(explanation.to_string());
            grant.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_run(&self, history: &ScraperHistory) -> Result<(), StoreError> {
        self.inner.lock().await.history.push(history.clone());
        Ok(())
    }

    async fn finalize_run(&self, history: &ScraperHistory) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner
            .history
            .iter_mut()
            .find(|h| h.run_id == history.run_id)
        {
            *row = history.clone();
        } else {
            inner.history.push(history.clone());
        }
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<ScraperHistory>, StoreError> {
        Ok(self.inner.lock().await.history.last().cloned())
    }

    async fn active_sources(&self) -> Result<Vec<ScraperSource>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sources
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn upsert_source(&self, source: &ScraperSource) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.sources.iter_mut().find(|s| s.name == source.name) {
            *existing = source.clone();
        } else {
            inner.sources.push(source.clone());
        }
        Ok(())
    }

    async fn touch_source(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(source) = inner.sources.iter_mut().find(|s| s.name == name) {
            source.last_scraped = Some(at);
        }
        Ok(())
    }
}

// --- Postgres implementation ---

/// Postgres-backed store. The read-then-write upsert runs inside one
/// transaction per item with `FOR UPDATE` row locks; a unique index on
/// (lower(title), lower(funder)) backstops the identity invariant if
/// concurrent writers are ever introduced.
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Corrupt(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn grant_from_row(row: &PgRow) -> Result<Grant, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = GrantStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status_text:?}")))?;
    let method_text: String = row.try_get("discovery_method")?;
    let discovery_method = DiscoveryMethod::parse(&method_text)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown discovery method {method_text:?}")))?;
    let focus_areas: serde_json::Value = row.try_get("focus_areas")?;
    let focus_areas = focus_areas
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let contact: serde_json::Value = row.try_get("contact")?;
    let contact: ContactInfo = serde_json::from_value(contact)
        .map_err(|e| StoreError::Corrupt(format!("bad contact json: {e}")))?;
    Ok(Grant {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        funder: row.try_get("funder")?,
        description: row.try_get("description")?,
        amount_min: row.try_get("amount_min")?,
        amount_max: row.try_get("amount_max")?,
        due_date: row.try_get::<Option<NaiveDate>, _>("due_date")?,
        status,
        eligibility: row.try_get("eligibility")?,
        website: row.try_get("website")?,
        focus_areas,
        contact,
        match_score: row.try_get("match_score")?,
        match_explanation: row.try_get("match_explanation")?,
        is_scraped: row.try_get("is_scraped")?,
        discovery_method,
        search_query: row.try_get("search_query")?,
        source: row.try_get("source")?,
        source_native_id: row.try_get("source_native_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const GRANT_COLUMNS: &str = "id, title, funder, description, amount_min, amount_max, due_date, \
     status, eligibility, website, focus_areas, contact, match_score, match_explanation, \
     is_scraped, discovery_method, search_query, source, source_native_id, created_at, updated_at";

async fn write_refreshed_grant(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    grant: &Grant,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE grants
           SET title = $2,
               funder = $3,
               description = $4,
               amount_min = $5,
               amount_max = $6,
               due_date = $7,
               eligibility = $8,
               website = $9,
               focus_areas = $10,
               contact = $11,
               source = $12,
               source_native_id = $13,
               updated_at = $14
         WHERE id = $1
        "#,
    )
    .bind(grant.id)
    .bind(&grant.title)
    .bind(&grant.funder)
    .bind(&grant.description)
    .bind(grant.amount_min)
    .bind(grant.amount_max)
    .bind(grant.due_date)
    .bind(&grant.eligibility)
    .bind(&grant.website)
    .bind(serde_json::json!(grant.focus_areas))
    .bind(serde_json::to_value(&grant.contact).unwrap_or(serde_json::json!({})))
    .bind(&grant.source)
    .bind(&grant.source_native_id)
    .bind(grant.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl GrantStore for PgGrantStore {
    async fn upsert(&self, record: &GrantRecord) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let by_native = if let (Some(source), Some(native_id)) =
            (&record.source, &record.source_native_id)
        {
            sqlx::query(&format!(
                "SELECT {GRANT_COLUMNS} FROM grants \
                 WHERE source = $1 AND source_native_id = $2 FOR UPDATE"
            ))
            .bind(source)
            .bind(native_id)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            None
        };

        if let Some(row) = by_native {
            let mut grant = grant_from_row(&row)?;
            grant.title = record.title.clone();
            grant.funder = record.funder.clone();
            grant.refresh_from(record, now);
            write_refreshed_grant(&mut tx, &grant).await?;
            tx.commit().await?;
            return Ok(UpsertOutcome {
                grant,
                inserted: false,
            });
        }

        let (title_key, funder_key) = identity_key(&record.title, &record.funder);
        let by_identity = sqlx::query(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE lower(btrim(title)) = $1 AND lower(btrim(funder)) = $2 FOR UPDATE"
        ))
        .bind(&title_key)
        .bind(&funder_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = by_identity {
            let mut grant = grant_from_row(&row)?;
            grant.refresh_from(record, now);
            write_refreshed_grant(&mut tx, &grant).await?;
            tx.commit().await?;
            return Ok(UpsertOutcome {
                grant,
                inserted: false,
            });
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO grants
                (title, funder, description, amount_min, amount_max, due_date, status,
                 eligibility, website, focus_areas, contact, is_scraped, discovery_method,
                 search_query, source, source_native_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17)
            RETURNING {GRANT_COLUMNS}
            "#
        ))
        .bind(&record.title)
        .bind(&record.funder)
        .bind(&record.description)
        .bind(record.amount_min)
        .bind(record.amount_max)
        .bind(record.due_date)
        .bind(record.status.as_str())
        .bind(&record.eligibility)
        .bind(&record.website)
        .bind(serde_json::json!(record.focus_areas))
        .bind(serde_json::to_value(&record.contact).unwrap_or(serde_json::json!({})))
        .bind(record.is_scraped)
        .bind(record.discovery_method.as_str())
        .bind(&record.search_query)
        .bind(&record.source)
        .bind(&record.source_native_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(UpsertOutcome {
            grant: grant_from_row(&row)?,
            inserted: true,
        })
    }

    async fn get(&self, id: i64) -> Result<Option<Grant>, StoreError> {
        let row = sqlx::query(&format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(grant_from_row).transpose()
    }

    async fn unscored(&self, limit: u32) -> Result<Vec<Grant>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE match_score IS NULL OR match_score = 0 ORDER BY id LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(grant_from_row).collect()
    }

    async fn set_score(&self, id: i64, score: f64, explanation: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE grants SET match_score = $2, match_explanation = $3, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(score)
        .bind(explanation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(&self, history: &ScraperHistory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_history
                (run_id, started_at, status, sources_scraped, grants_found, grants_added,
                 queries_attempted, queries_succeeded, keywords_used)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(history.run_id)
        .bind(history.started_at)
        .bind(history.status.as_str())
        .bind(history.sources_scraped as i32)
        .bind(history.grants_found as i32)
        .bind(history.grants_added as i32)
        .bind(history.queries_attempted as i32)
        .bind(history.queries_succeeded as i32)
        .bind(serde_json::json!(history.keywords_used))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run(&self, history: &ScraperHistory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scraper_history
               SET finished_at = $2,
                   status = $3,
                   sources_scraped = $4,
                   grants_found = $5,
                   grants_added = $6,
                   error_message = $7,
                   queries_attempted = $8,
                   queries_succeeded = $9,
                   keywords_used = $10
             WHERE run_id = $1
            "#,
        )
        .bind(history.run_id)
        .bind(history.finished_at)
        .bind(history.status.as_str())
        .bind(history.sources_scraped as i32)
        .bind(history.grants_found as i32)
        .bind(history.grants_added as i32)
        .bind(&history.error_message)
        .bind(history.queries_attempted as i32)
        .bind(history.queries_succeeded as i32)
        .bind(serde_json::json!(history.keywords_used))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<ScraperHistory>, StoreError> {
        let row = sqlx::query(
            "SELECT run_id, started_at, finished_at, status, sources_scraped, grants_found, \
                    grants_added, error_message, queries_attempted, queries_succeeded, keywords_used \
             FROM scraper_history ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let status_text: String = row.try_get("status")?;
        let status = RunStatus::parse(&status_text)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run status {status_text:?}")))?;
        let keywords: serde_json::Value = row.try_get("keywords_used")?;
        Ok(Some(ScraperHistory {
            run_id: row.try_get("run_id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status,
            sources_scraped: row.try_get::<i32, _>("sources_scraped")? as u32,
            grants_found: row.try_get::<i32, _>("grants_found")? as u32,
            grants_added: row.try_get::<i32, _>("grants_added")? as u32,
            error_message: row.try_get("error_message")?,
            queries_attempted: row.try_get::<i32, _>("queries_attempted")? as u32,
            queries_succeeded: row.try_get::<i32, _>("queries_succeeded")? as u32,
            keywords_used: keywords
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        }))
    }

    async fn active_sources(&self) -> Result<Vec<ScraperSource>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, url, selector_config, is_active, last_scraped, rate_limit_per_hour \
             FROM scraper_sources WHERE is_active ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ScraperSource {
                    name: row.try_get("name")?,
                    url: row.try_get("url")?,
                    selector_config: row.try_get("selector_config")?,
                    is_active: row.try_get("is_active")?,
                    last_scraped: row.try_get("last_scraped")?,
                    rate_limit_per_hour: row.try_get::<i32, _>("rate_limit_per_hour")? as u32,
                })
            })
            .collect()
    }

    async fn upsert_source(&self, source: &ScraperSource) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_sources (name, url, selector_config, is_active, rate_limit_per_hour)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
               SET url = EXCLUDED.url,
                   selector_config = EXCLUDED.selector_config,
                   is_active = EXCLUDED.is_active,
                   rate_limit_per_hour = EXCLUDED.rate_limit_per_hour
            "#,
        )
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.selector_config)
        .bind(source.is_active)
        .bind(source.rate_limit_per_hour as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_source(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE scraper_sources SET last_scraped = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantflow_core::GrantRecord;
    use tempfile::tempdir;

    fn record(title: &str, funder: &str) -> GrantRecord {
        GrantRecord {
            title: title.to_string(),
            funder: funder.to_string(),
            description: None,
            amount_min: None,
            amount_max: None,
            due_date: None,
            status: GrantStatus::NotStarted,
            eligibility: None,
            website: None,
            focus_areas: vec![],
            contact: ContactInfo::default(),
            is_scraped: true,
            discovery_method: DiscoveryMethod::Api,
            search_query: None,
            source: None,
            source_native_id: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_title_funder() {
        let store = MemoryGrantStore::new();
        let first = store.upsert(&record("Rural Health NOFO", "HHS")).await.unwrap();
        let second = store.upsert(&record("Rural Health NOFO", "HHS")).await.unwrap();
        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.grant.id, second.grant.id);
        assert_eq!(store.grant_count().await, 1);
    }

    #[tokio::test]
    async fn upsert_identity_is_case_insensitive() {
        let store = MemoryGrantStore::new();
        store.upsert(&record("Rural Health NOFO", "HHS")).await.unwrap();
        let second = store.upsert(&record("  rural health nofo ", "hhs")).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(store.grant_count().await, 1);
    }

    #[tokio::test]
    async fn source_native_id_takes_precedence_over_title() {
        let store = MemoryGrantStore::new();
        let mut a = record("Rural Health NOFO", "HHS");
        a.source = Some("federal_register".into());
        a.source_native_id = Some("2025-12345".into());
        let first = store.upsert(&a).await.unwrap();

        let mut b = record("Rural Health NOFO (Amended)", "HHS");
        b.source = Some("federal_register".into());
        b.source_native_id = Some("2025-12345".into());
        let second = store.upsert(&b).await.unwrap();

        assert!(!second.inserted);
        assert_eq!(first.grant.id, second.grant.id);
        assert_eq!(second.grant.title, "Rural Health NOFO (Amended)");
        assert_eq!(store.grant_count().await, 1);
    }

    #[tokio::test]
    async fn rediscovered_manual_grant_keeps_one_row_through_an_amended_title() {
        let store = MemoryGrantStore::new();
        // Manually entered, so no source identity yet.
        let manual = record("Rural Health NOFO", "HHS");
        let original = store.upsert(&manual).await.unwrap();
        assert!(original.inserted);

        // The same grant comes back through an adapter. The title/funder
        // match must adopt the full source identity pair, not just the id.
        let mut rediscovered = record("Rural Health NOFO", "HHS");
        rediscovered.source = Some("federal_register".into());
        rediscovered.source_native_id = Some("2025-12345".into());
        let refreshed = store.upsert(&rediscovered).await.unwrap();
        assert!(!refreshed.inserted);
        assert_eq!(refreshed.grant.source.as_deref(), Some("federal_register"));
        assert_eq!(refreshed.grant.source_native_id.as_deref(), Some("2025-12345"));

        // An amended notice reuses the document number with a new title; it
        // must land on the same row via the source-id lookup.
        let mut amended = record("Rural Health NOFO (Amended)", "HHS");
        amended.source = Some("federal_register".into());
        amended.source_native_id = Some("2025-12345".into());
        let third = store.upsert(&amended).await.unwrap();
        assert!(!third.inserted);
        assert_eq!(third.grant.id, original.grant.id);
        assert_eq!(third.grant.title, "Rural Health NOFO (Amended)");
        assert_eq!(store.grant_count().await, 1);
    }

    #[tokio::test]
    async fn refresh_fills_nulls_but_never_status() {
        let store = MemoryGrantStore::new();
        let sparse = record("Rural Health NOFO", "HHS");
        let id = store.upsert(&sparse).await.unwrap().grant.id;
        store.set_score(id, 80.0, "good fit").await.unwrap();

        let mut richer = record("Rural Health NOFO", "HHS");
        richer.description = Some("Full notice text".into());
        richer.amount_min = Some(500_000.0);
        let out = store.upsert(&richer).await.unwrap();
        assert_eq!(out.grant.description.as_deref(), Some("Full notice text"));
        assert_eq!(out.grant.amount_min, Some(500_000.0));
        assert_eq!(out.grant.match_score, Some(80.0));
        assert_eq!(out.grant.status, GrantStatus::NotStarted);
    }

    #[tokio::test]
    async fn unscored_sees_null_and_zero_scores() {
        let store = MemoryGrantStore::new();
        let a = store.upsert(&record("A", "F1")).await.unwrap().grant.id;
        let b = store.upsert(&record("B", "F2")).await.unwrap().grant.id;
        store.upsert(&record("C", "F3")).await.unwrap();
        store.set_score(a, 0.0, "neutral").await.unwrap();
        store.set_score(b, 55.0, "scored").await.unwrap();
        let unscored = store.unscored(10).await.unwrap();
        let titles: Vec<_> = unscored.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn payload_archive_dedupes_identical_bodies() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let first = archive
            .archive_bytes(fetched_at, "federal_register", "json", b"{\"count\":0}")
            .await
            .expect("first archive");
        let second = archive
            .archive_bytes(fetched_at, "federal_register", "json", b"{\"count\":0}")
            .await
            .expect("second archive");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn json_block_unwrapping() {
        assert_eq!(unwrap_json_block("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(unwrap_json_block("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(unwrap_json_block("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    // Adapters hand the fetcher raw keys and values; bracketed keys and
    // spaces must come out percent-encoded.
    #[test]
    fn query_pairs_are_percent_encoded_by_the_client() {
        let request = reqwest::Client::new()
            .get("https://example.org/documents.json")
            .query(&[("conditions[term]", "rural health"), ("order", "newest")])
            .build()
            .unwrap();
        let url = request.url().as_str();
        assert!(url.contains("conditions%5Bterm%5D=rural+health"));
        assert!(url.contains("order=newest"));
    }
}
