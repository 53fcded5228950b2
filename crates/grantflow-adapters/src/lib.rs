//! Source adapter contracts + one adapter per external grant-data source.
//!
//! Adapters never surface errors: an unreachable source or an empty result
//! set yields an empty list, logged at warn level, and the discovery run
//! moves on to the next source.

pub mod extract;

use async_trait::async_trait;
use chrono::NaiveDate;
use grantflow_core::{RawOpportunity, ScraperSource};
use grantflow_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "grantflow-adapters";

/// Generic parameter set every adapter builds its native request from.
#[derive(Debug, Clone, Default)]
pub struct FetchQuery {
    pub keyword: Option<String>,
    pub posted_since: Option<NaiveDate>,
    pub geography: Option<String>,
    pub limit: u32,
}

impl FetchQuery {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: Some(keyword.into()),
            limit: 25,
            ..Self::default()
        }
    }

    fn effective_limit(&self) -> u32 {
        if self.limit == 0 {
            25
        } else {
            self.limit.min(100)
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Documented requests/hour ceiling for the source. Informational; the
    /// orchestrator spaces sequential calls rather than enforcing it.
    fn rate_limit_per_hour(&self) -> u32 {
        60
    }

    /// Fetch and minimally normalize one page of opportunities. Failures
    /// are logged and collapse to an empty list.
    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity>;
}

fn json_str(value: &JsonValue, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_display(value: &JsonValue, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Federal Register
// ---------------------------------------------------------------------------

/// Federal Register document search. `document_number` is a stable external
/// identifier, so records from this adapter dedup on it rather than on
/// title+funder.
#[derive(Debug, Clone)]
pub struct FederalRegisterAdapter {
    base_url: String,
}

impl Default for FederalRegisterAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://www.federalregister.gov/api/v1".to_string(),
        }
    }
}

impl FederalRegisterAdapter {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> anyhow::Result<Vec<RawOpportunity>> {
        let url = format!("{}/documents.json", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("conditions[type][]", "NOTICE".to_string()),
            ("per_page", query.effective_limit().to_string()),
            ("order", "newest".to_string()),
        ];
        if let Some(keyword) = &query.keyword {
            params.push(("conditions[term]", keyword.clone()));
        }
        if let Some(since) = query.posted_since {
            params.push((
                "conditions[publication_date][gte]",
                since.format("%Y-%m-%d").to_string(),
            ));
        }
        let resp = http.get_with_query(self.source_id(), &url, &params).await?;
        let body: JsonValue = serde_json::from_slice(&resp.body)?;
        let results = body
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(results
            .into_iter()
            .map(|doc| self.map_document(doc))
            .collect())
    }

    /// Also usable directly for a single API document payload (tests, replay).
    pub fn map_document(&self, doc: JsonValue) -> RawOpportunity {
        let mut raw = RawOpportunity::new(self.source_id());
        raw.source_native_id = json_str(&doc, "/document_number");
        raw.title = json_str(&doc, "/title");
        raw.funder = doc
            .pointer("/agencies")
            .and_then(|v| v.as_array())
            .map(|agencies| {
                agencies
                    .iter()
                    .filter_map(|a| a.get("name").and_then(|n| n.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|s| !s.is_empty());
        raw.description = json_str(&doc, "/abstract");
        raw.link = json_str(&doc, "/html_url");
        raw.raw = doc;
        raw
    }
}

#[async_trait]
impl SourceAdapter for FederalRegisterAdapter {
    fn source_id(&self) -> &str {
        "federal_register"
    }

    fn rate_limit_per_hour(&self) -> u32 {
        1000
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity> {
        match self.try_fetch(http, query).await {
            Ok(items) => {
                debug!(source = self.source_id(), count = items.len(), "fetched");
                items
            }
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Grants.gov
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrantsGovAdapter {
    base_url: String,
}

impl Default for GrantsGovAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.grants.gov/v1/api".to_string(),
        }
    }
}

impl GrantsGovAdapter {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> anyhow::Result<Vec<RawOpportunity>> {
        let body = serde_json::json!({
            "keyword": query.keyword.clone().unwrap_or_default(),
            "rows": query.effective_limit(),
            "oppStatuses": "forecasted|posted",
        });
        let url = format!("{}/search2", self.base_url);
        let resp = http.post_json(self.source_id(), &url, &body).await?;
        let envelope: JsonValue = serde_json::from_slice(&resp.body)?;
        let hits = envelope
            .pointer("/data/oppHits")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(hits.into_iter().map(|hit| self.map_hit(hit)).collect())
    }

    pub fn map_hit(&self, hit: JsonValue) -> RawOpportunity {
        let mut raw = RawOpportunity::new(self.source_id());
        raw.source_native_id = json_str(&hit, "/number").or_else(|| json_display(&hit, "/id"));
        raw.title = json_str(&hit, "/title");
        raw.funder = json_str(&hit, "/agencyName").or_else(|| json_str(&hit, "/agency"));
        raw.deadline_text = json_str(&hit, "/closeDate");
        raw.link = json_display(&hit, "/id")
            .map(|id| format!("https://www.grants.gov/search-results-detail/{id}"));
        raw.raw = hit;
        raw
    }
}

#[async_trait]
impl SourceAdapter for GrantsGovAdapter {
    fn source_id(&self) -> &str {
        "grants_gov"
    }

    fn rate_limit_per_hour(&self) -> u32 {
        600
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity> {
        match self.try_fetch(http, query).await {
            Ok(items) => items,
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// USAspending
// ---------------------------------------------------------------------------

/// Historical grant awards; useful for funder discovery even though the
/// awards themselves are past opportunities.
#[derive(Debug, Clone)]
pub struct UsaSpendingAdapter {
    base_url: String,
}

impl Default for UsaSpendingAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.usaspending.gov/api/v2".to_string(),
        }
    }
}

impl UsaSpendingAdapter {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> anyhow::Result<Vec<RawOpportunity>> {
        let body = serde_json::json!({
            "filters": {
                "keywords": query.keyword.as_deref().map(|k| vec![k]).unwrap_or_default(),
                // Grant-family award types only.
                "award_type_codes": ["02", "03", "04", "05"],
            },
            "fields": ["Award ID", "Recipient Name", "Awarding Agency", "Award Amount", "Description"],
            "limit": query.effective_limit(),
            "page": 1,
        });
        let url = format!("{}/search/spending_by_award/", self.base_url);
        let resp = http.post_json(self.source_id(), &url, &body).await?;
        let envelope: JsonValue = serde_json::from_slice(&resp.body)?;
        let results = envelope
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(results.into_iter().map(|award| self.map_award(award)).collect())
    }

    pub fn map_award(&self, award: JsonValue) -> RawOpportunity {
        let mut raw = RawOpportunity::new(self.source_id());
        raw.source_native_id = json_display(&award, "/Award ID");
        raw.title = json_str(&award, "/Description")
            .or_else(|| json_display(&award, "/Award ID").map(|id| format!("Award {id}")));
        raw.funder = json_str(&award, "/Awarding Agency");
        raw.amount_text = json_display(&award, "/Award Amount");
        raw.raw = award;
        raw
    }
}

#[async_trait]
impl SourceAdapter for UsaSpendingAdapter {
    fn source_id(&self) -> &str {
        "usaspending"
    }

    fn rate_limit_per_hour(&self) -> u32 {
        1000
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity> {
        match self.try_fetch(http, query).await {
            Ok(items) => items,
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Socrata portals
// ---------------------------------------------------------------------------

/// Generic SODA portal adapter. Column names vary per portal, so the field
/// mapping comes from the scraper source's `selector_config`:
/// `{"dataset_id": "abcd-1234", "fields": {"title": "...", "funder": "...", ...}}`.
#[derive(Debug, Clone)]
pub struct SocrataAdapter {
    name: String,
    base_url: String,
    dataset_id: String,
    fields: JsonValue,
}

impl SocrataAdapter {
    pub fn from_source(source: &ScraperSource) -> Option<Self> {
        let dataset_id = source
            .selector_config
            .get("dataset_id")
            .and_then(|v| v.as_str())?
            .to_string();
        Some(Self {
            name: source.name.clone(),
            base_url: source.url.trim_end_matches('/').to_string(),
            dataset_id,
            fields: source
                .selector_config
                .get("fields")
                .cloned()
                .unwrap_or(JsonValue::Null),
        })
    }

    fn field(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> anyhow::Result<Vec<RawOpportunity>> {
        let url = format!("{}/resource/{}.json", self.base_url, self.dataset_id);
        let mut params: Vec<(&str, String)> =
            vec![("$limit", query.effective_limit().to_string())];
        if let Some(keyword) = &query.keyword {
            params.push(("$q", keyword.clone()));
        }
        let resp = http.get_with_query(self.source_id(), &url, &params).await?;
        let rows: Vec<JsonValue> = serde_json::from_slice(&resp.body)?;

        let title_field = self.field("title").unwrap_or_else(|| "title".to_string());
        let funder_field = self.field("funder").unwrap_or_else(|| "funder".to_string());
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut raw = RawOpportunity::new(self.source_id());
                raw.title = json_str(&row, &format!("/{title_field}"));
                raw.funder = json_str(&row, &format!("/{funder_field}"));
                if let Some(f) = self.field("id") {
                    raw.source_native_id = json_display(&row, &format!("/{f}"));
                }
                if let Some(f) = self.field("description") {
                    raw.description = json_str(&row, &format!("/{f}"));
                }
                if let Some(f) = self.field("amount") {
                    raw.amount_text = json_display(&row, &format!("/{f}"));
                }
                if let Some(f) = self.field("deadline") {
                    raw.deadline_text = json_str(&row, &format!("/{f}"));
                }
                if let Some(f) = self.field("link") {
                    raw.link = json_str(&row, &format!("/{f}"));
                }
                raw.raw = row;
                raw
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for SocrataAdapter {
    fn source_id(&self) -> &str {
        &self.name
    }

    fn rate_limit_per_hour(&self) -> u32 {
        // Unauthenticated SODA throttling is aggressive.
        100
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity> {
        match self.try_fetch(http, query).await {
            Ok(items) => items,
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Candid
// ---------------------------------------------------------------------------

/// Candid grants API. Requires a subscription key; without one the adapter
/// stays registered but contributes nothing.
#[derive(Debug, Clone)]
pub struct CandidAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl Default for CandidAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.candid.org/grants/v1".to_string(),
            api_key: std::env::var("CANDID_API_KEY").ok(),
        }
    }
}

impl CandidAdapter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        query: &FetchQuery,
    ) -> anyhow::Result<Vec<RawOpportunity>> {
        let Some(api_key) = &self.api_key else {
            debug!(source = self.source_id(), "no api key configured, skipping");
            return Ok(Vec::new());
        };
        let url = format!("{}/transactions", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("page", "1".to_string()),
            ("page_size", query.effective_limit().to_string()),
        ];
        if let Some(keyword) = &query.keyword {
            params.push(("query", keyword.clone()));
        }
        let resp = http
            .get_with_header(self.source_id(), &url, "Subscription-Key", api_key, &params)
            .await?;
        let envelope: JsonValue = serde_json::from_slice(&resp.body)?;
        let rows = envelope
            .pointer("/grants")
            .or_else(|| envelope.pointer("/data/grants"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|grant| {
                let mut raw = RawOpportunity::new(self.source_id());
                raw.title = json_str(&grant, "/grant_description")
                    .or_else(|| json_str(&grant, "/title"));
                raw.funder = json_str(&grant, "/funder_name");
                raw.amount_text = json_display(&grant, "/amount");
                raw.raw = grant;
                raw
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for CandidAdapter {
    fn source_id(&self) -> &str {
        "candid"
    }

    fn rate_limit_per_hour(&self) -> u32 {
        100
    }

    async fn fetch(&self, http: &HttpFetcher, query: &FetchQuery) -> Vec<RawOpportunity> {
        match self.try_fetch(http, query).await {
            Ok(items) => items,
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ad-hoc HTML scraping
// ---------------------------------------------------------------------------

/// Selector-config-driven scrape of an arbitrary listing page. The admin
/// supplies CSS selectors in `selector_config`:
/// `{"row": "...", "title": "...", "link": "...", "amount": "...", "deadline": "...", "funder": "..."}`.
/// Missing selectors simply leave fields empty; the funder falls back to the
/// configured source name.
#[derive(Debug, Clone)]
pub struct HtmlScrapeAdapter {
    source: ScraperSource,
}

impl HtmlScrapeAdapter {
    pub fn new(source: ScraperSource) -> Self {
        Self { source }
    }

    fn selector(&self, key: &str) -> Option<String> {
        self.source
            .selector_config
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Parse a fetched listing document. Public so replayed archive payloads
    /// can be re-parsed without a network fetch.
    pub fn parse_listing(&self, html_text: &str) -> Vec<RawOpportunity> {
        let Some(row_selector) = self.selector("row") else {
            warn!(source = %self.source.name, "selector_config has no row selector");
            return Vec::new();
        };
        let Ok(rows) = Selector::parse(&row_selector) else {
            warn!(source = %self.source.name, selector = %row_selector, "bad row selector");
            return Vec::new();
        };

        let title_sel = self.selector("title").and_then(|s| Selector::parse(&s).ok());
        let link_sel = self.selector("link").and_then(|s| Selector::parse(&s).ok());
        let amount_sel = self.selector("amount").and_then(|s| Selector::parse(&s).ok());
        let deadline_sel = self.selector("deadline").and_then(|s| Selector::parse(&s).ok());
        let description_sel = self
            .selector("description")
            .and_then(|s| Selector::parse(&s).ok());
        let funder_sel = self.selector("funder").and_then(|s| Selector::parse(&s).ok());

        let document = Html::parse_document(html_text);
        let mut out = Vec::new();
        for row in document.select(&rows) {
            let mut raw = RawOpportunity::new(self.source.name.clone());
            raw.title = title_sel.as_ref().and_then(|s| first_text(&row, s));
            raw.link = link_sel
                .as_ref()
                .and_then(|s| row.select(s).next())
                .and_then(|n| n.value().attr("href"))
                .map(str::to_string);
            raw.amount_text = amount_sel.as_ref().and_then(|s| first_text(&row, s));
            raw.deadline_text = deadline_sel.as_ref().and_then(|s| first_text(&row, s));
            raw.description = description_sel.as_ref().and_then(|s| first_text(&row, s));
            raw.funder = funder_sel
                .as_ref()
                .and_then(|s| first_text(&row, s))
                .or_else(|| Some(self.source.name.clone()));
            out.push(raw);
        }
        out
    }
}

fn first_text(row: &ElementRef, selector: &Selector) -> Option<String> {
    let text: String = row.select(selector).next()?.text().collect();
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[async_trait]
impl SourceAdapter for HtmlScrapeAdapter {
    fn source_id(&self) -> &str {
        &self.source.name
    }

    fn rate_limit_per_hour(&self) -> u32 {
        self.source.rate_limit_per_hour
    }

    async fn fetch(&self, http: &HttpFetcher, _query: &FetchQuery) -> Vec<RawOpportunity> {
        match http.get_bytes(self.source_id(), &self.source.url).await {
            Ok(resp) => self.parse_listing(&String::from_utf8_lossy(&resp.body)),
            Err(err) => {
                warn!(source = self.source_id(), error = %err, "fetch failed, contributing zero results");
                Vec::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Resolve a configured scraper source to its adapter. Well-known API
/// sources match by name; a `dataset_id` in selector_config selects the
/// Socrata adapter; anything else with a row selector is treated as an
/// ad-hoc HTML scrape target.
pub fn adapter_for_source(source: &ScraperSource) -> Option<Box<dyn SourceAdapter>> {
    match source.name.as_str() {
        "federal_register" => Some(Box::new(FederalRegisterAdapter::default())),
        "grants_gov" => Some(Box::new(GrantsGovAdapter::default())),
        "usaspending" => Some(Box::new(UsaSpendingAdapter::default())),
        "candid" => Some(Box::new(CandidAdapter::default())),
        _ => {
            if source.selector_config.get("dataset_id").is_some() {
                return SocrataAdapter::from_source(source)
                    .map(|a| Box::new(a) as Box<dyn SourceAdapter>);
            }
            if source.selector_config.get("row").is_some() {
                return Some(Box::new(HtmlScrapeAdapter::new(source.clone())));
            }
            None
        }
    }
}
