//! Core domain model and field-coercion rules for the grant discovery pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grantflow-core";

/// Transient, minimally-normalized record returned by one source adapter call.
///
/// Field names are already mapped off the source's native shape, but values
/// are still raw strings; the extraction layer and normalizer own coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    pub source: String,
    /// Stable identifier in the source's own namespace (e.g. a Federal
    /// Register document number). Takes precedence over title+funder when
    /// deduplicating.
    pub source_native_id: Option<String>,
    pub title: Option<String>,
    pub funder: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub amount_text: Option<String>,
    pub deadline_text: Option<String>,
    pub eligibility_text: Option<String>,
    /// Untouched source payload for this record, kept for replay/debugging.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl RawOpportunity {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_native_id: None,
            title: None,
            funder: None,
            description: None,
            link: None,
            amount_text: None,
            deadline_text: None,
            eligibility_text: None,
            raw: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    WebSearch,
    FocusedSearch,
    Manual,
    Api,
}

impl Default for DiscoveryMethod {
    fn default() -> Self {
        Self::Api
    }
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::FocusedSearch => "focused_search",
            Self::Manual => "manual",
            Self::Api => "api",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "web_search" => Some(Self::WebSearch),
            "focused_search" => Some(Self::FocusedSearch),
            "manual" => Some(Self::Manual),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Application status for a stored grant.
///
/// One canonical snake_case vocabulary. `parse` accepts the legacy Title
/// Case spellings ("Not Started", "Won") at the boundary and maps them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    NotStarted,
    InProgress,
    Submitted,
    Awarded,
    Declined,
}

impl Default for GrantStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Submitted => "submitted",
            Self::Awarded => "awarded",
            Self::Declined => "declined",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let folded = input.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match folded.as_str() {
            "not_started" | "idea" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "submitted" => Some(Self::Submitted),
            "awarded" | "won" | "won_awarded" => Some(Self::Awarded),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub position: Option<String>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.position.is_none()
    }
}

/// Structured record produced by the extraction layer. Title and funder are
/// non-empty by construction; use [`ExtractedGrant::validated`] to enforce
/// that before handing a candidate to the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedGrant {
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub due_date_text: Option<String>,
    pub eligibility: Option<String>,
    pub website: Option<String>,
    pub focus_areas: Vec<String>,
    pub contact: ContactInfo,
    pub discovery_method: DiscoveryMethod,
    pub search_query: Option<String>,
    pub source: Option<String>,
    pub source_native_id: Option<String>,
}

impl ExtractedGrant {
    pub fn new(title: impl Into<String>, funder: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            funder: funder.into(),
            description: None,
            amount_min: None,
            amount_max: None,
            due_date_text: None,
            eligibility: None,
            website: None,
            focus_areas: Vec::new(),
            contact: ContactInfo::default(),
            discovery_method: DiscoveryMethod::default(),
            search_query: None,
            source: None,
            source_native_id: None,
        }
    }

    /// Discard extractions that are missing either required identity field.
    pub fn validated(self) -> Option<Self> {
        if self.title.trim().is_empty() || self.funder.trim().is_empty() {
            return None;
        }
        Some(self)
    }
}

/// Normalized, unsaved grant. Output of [`normalize::normalize`], input to
/// the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub due_date: Option<NaiveDate>,
    pub status: GrantStatus,
    pub eligibility: Option<String>,
    pub website: Option<String>,
    pub focus_areas: Vec<String>,
    pub contact: ContactInfo,
    pub is_scraped: bool,
    pub discovery_method: DiscoveryMethod,
    pub search_query: Option<String>,
    pub source: Option<String>,
    pub source_native_id: Option<String>,
}

/// Canonical persisted grant row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub title: String,
    pub funder: String,
    pub description: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub due_date: Option<NaiveDate>,
    pub status: GrantStatus,
    pub eligibility: Option<String>,
    pub website: Option<String>,
    pub focus_areas: Vec<String>,
    pub contact: ContactInfo,
    pub match_score: Option<f64>,
    pub match_explanation: Option<String>,
    pub is_scraped: bool,
    pub discovery_method: DiscoveryMethod,
    pub search_query: Option<String>,
    pub source: Option<String>,
    pub source_native_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    /// Refresh descriptive fields from a re-discovered record. Non-null
    /// incoming values win over nulls; status and score are never touched
    /// by a refresh.
    pub fn refresh_from(&mut self, record: &GrantRecord, now: DateTime<Utc>) {
        if record.description.is_some() {
            self.description = record.description.clone();
        }
        if record.amount_min.is_some() {
            self.amount_min = record.amount_min;
        }
        if record.amount_max.is_some() {
            self.amount_max = record.amount_max;
        }
        if record.due_date.is_some() {
            self.due_date = record.due_date;
        }
        if record.eligibility.is_some() {
            self.eligibility = record.eligibility.clone();
        }
        if record.website.is_some() {
            self.website = record.website.clone();
        }
        if !record.focus_areas.is_empty() {
            self.focus_areas = record.focus_areas.clone();
        }
        if !record.contact.is_empty() {
            self.contact = record.contact.clone();
        }
        // Source identity travels as a pair; copying the native id without
        // the source would leave a record no later source-id lookup can find.
        if record.source.is_some() {
            self.source = record.source.clone();
        }
        if record.source_native_id.is_some() {
            self.source_native_id = record.source_native_id.clone();
        }
        self.updated_at = now;
    }
}

/// Case-insensitive, whitespace-trimmed dedup identity fragment.
pub fn identity_key(title: &str, funder: &str) -> (String, String) {
    (
        title.trim().to_lowercase(),
        funder.trim().to_lowercase(),
    )
}

/// Administrator-maintained configuration for one scrape target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperSource {
    pub name: String,
    pub url: String,
    /// Source-specific field mapping. For HTML targets this carries CSS
    /// selectors (row/title/link/amount/deadline); for Socrata portals it
    /// carries the dataset id and column names.
    #[serde(default)]
    pub selector_config: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_scraped: Option<DateTime<Utc>>,
    /// Informational ceiling; the orchestrator spaces calls, it does not
    /// enforce this beyond a fixed inter-source delay.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_hour: u32,
}

fn default_true() -> bool {
    true
}

fn default_rate_limit() -> u32 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per discovery run. Append-only: created at run start, finalized
/// once at run end, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperHistory {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub sources_scraped: u32,
    pub grants_found: u32,
    pub grants_added: u32,
    pub error_message: Option<String>,
    pub queries_attempted: u32,
    pub queries_succeeded: u32,
    pub keywords_used: Vec<String>,
}

impl ScraperHistory {
    pub fn begin(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: RunStatus::Pending,
            sources_scraped: 0,
            grants_found: 0,
            grants_added: 0,
            error_message: None,
            queries_attempted: 0,
            queries_succeeded: 0,
            keywords_used: Vec::new(),
        }
    }
}

/// Organization profile: scoring input only, owned elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrgProfile {
    pub name: String,
    pub mission: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub geographic_scope: Option<String>,
    #[serde(default)]
    pub budget_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrantSummary {
    pub id: i64,
    pub title: String,
    pub funder: String,
    pub score: Option<f64>,
}

/// What a triggered discovery run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub sources_scraped: u32,
    pub grants_found: u32,
    pub grants_added: u32,
    pub new_grants: Vec<NewGrantSummary>,
    pub error_message: Option<String>,
}

pub mod normalize {
    //! Field coercion from extracted values into the canonical stored shape.
    //!
    //! Every function here degrades to `None`/default on bad input rather
    //! than erroring; an unparsable field never sinks a record.

    use super::{ContactInfo, ExtractedGrant, GrantRecord, GrantStatus};
    use chrono::NaiveDate;

    /// Accepts ISO (`2025-12-31`), US slash (`12/31/2025`) and long-form
    /// (`December 31, 2025`, abbreviated months included) dates.
    pub fn parse_date(input: &str) -> Option<NaiveDate> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        const FORMATS: &[&str] = &[
            "%Y-%m-%d",
            "%m/%d/%Y",
            "%B %d, %Y",
            "%B %d %Y",
            "%b %d, %Y",
            "%b %d %Y",
        ];
        // Long-form dates often arrive with "1st"/"3rd" ordinal suffixes.
        let cleaned = strip_ordinal_suffixes(trimmed);
        FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
    }

    fn strip_ordinal_suffixes(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i].is_ascii_digit() && i + 2 <= chars.len() {
                let rest: String = chars[i + 1..].iter().take(2).collect::<String>().to_lowercase();
                if rest == "st" || rest == "nd" || rest == "rd" || rest == "th" {
                    out.push(chars[i]);
                    i += 3;
                    continue;
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    /// `"$1,250,000"` -> `1250000.0`, `"$2.5 million"` -> `2500000.0`,
    /// `"$250k"` -> `250000.0`; anything non-numeric -> `None`.
    pub fn parse_amount(input: &str) -> Option<f64> {
        let lower = input.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return None;
        }
        let multiplier = if lower.contains("million")
            || lower.split_whitespace().any(|t| t.trim_matches('.') == "mil")
        {
            1_000_000.0
        } else if lower.ends_with('m') {
            1_000_000.0
        } else if lower.ends_with('k') || lower.contains("thousand") {
            1_000.0
        } else {
            1.0
        };
        let digits: String = lower
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if digits.is_empty() {
            return None;
        }
        digits.parse::<f64>().ok().map(|v| v * multiplier)
    }

    /// Comma-separated string -> trimmed list; a list passes through;
    /// anything else -> empty list.
    pub fn split_focus_areas(value: &serde_json::Value) -> Vec<String> {
        match value {
            serde_json::Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Merge a legacy free-text contact string with a structured contact.
    /// Structured values win; the free text only fills gaps it can be
    /// confidently split into (an `@`-bearing token becomes the email, the
    /// remainder the name).
    pub fn merge_contact(free_text: Option<&str>, structured: &ContactInfo) -> ContactInfo {
        let mut merged = structured.clone();
        let Some(text) = free_text else {
            return merged;
        };
        let mut name_parts = Vec::new();
        let mut phone_parts = Vec::new();
        for token in text.split_whitespace() {
            let cleaned = token.trim_matches(|c: char| c == ',' || c == ';' || c == '(' || c == ')');
            if cleaned.contains('@') {
                if merged.email.is_none() {
                    merged.email = Some(cleaned.to_string());
                }
            } else if cleaned.chars().filter(|c| c.is_ascii_digit()).count() >= 3 {
                phone_parts.push(cleaned);
            } else if !cleaned.is_empty() {
                name_parts.push(cleaned);
            }
        }
        if merged.phone.is_none() && !phone_parts.is_empty() {
            merged.phone = Some(phone_parts.join(" "));
        }
        if merged.name.is_none() && !name_parts.is_empty() {
            merged.name = Some(name_parts.join(" "));
        }
        merged
    }

    /// Coerce one extracted record into the canonical unsaved shape, with
    /// pipeline defaults applied: `status = not_started`, unscored,
    /// `is_scraped = true`.
    pub fn normalize(extracted: ExtractedGrant) -> GrantRecord {
        let due_date = extracted.due_date_text.as_deref().and_then(parse_date);
        GrantRecord {
            title: extracted.title.trim().to_string(),
            funder: extracted.funder.trim().to_string(),
            description: extracted.description,
            amount_min: extracted.amount_min,
            amount_max: extracted.amount_max.or(extracted.amount_min),
            due_date,
            status: GrantStatus::NotStarted,
            eligibility: extracted.eligibility,
            website: extracted.website,
            focus_areas: extracted.focus_areas,
            contact: extracted.contact,
            is_scraped: true,
            discovery_method: extracted.discovery_method,
            search_query: extracted.search_query,
            source: extracted.source,
            source_native_id: extracted.source_native_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::normalize::{merge_contact, normalize, parse_amount, parse_date, split_focus_areas};
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn date_formats_converge_on_one_value() {
        let expected = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        assert_eq!(parse_date("2025-12-31"), Some(expected));
        assert_eq!(parse_date("12/31/2025"), Some(expected));
        assert_eq!(parse_date("December 31, 2025"), Some(expected));
        assert_eq!(parse_date("Dec 31, 2025"), Some(expected));
    }

    #[test]
    fn ordinal_suffix_dates_parse() {
        assert_eq!(
            parse_date("December 1st, 2025"),
            NaiveDate::from_ymd_opt(2025, 12, 1)
        );
    }

    #[test]
    fn unparsable_date_is_none_not_error() {
        assert_eq!(parse_date("whenever works"), None);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("13/45/20"), None);
    }

    #[test]
    fn amount_coercion() {
        assert_eq!(parse_amount("$1,250,000"), Some(1_250_000.0));
        assert_eq!(parse_amount("$2.5 million"), Some(2_500_000.0));
        assert_eq!(parse_amount("$250k"), Some(250_000.0));
        assert_eq!(parse_amount("500000"), Some(500_000.0));
        assert_eq!(parse_amount("call for details"), None);
        assert_eq!(parse_amount(""), None);
    }

    #[test]
    fn focus_area_splitting() {
        let csv = serde_json::json!("health, rural development , education");
        assert_eq!(
            split_focus_areas(&csv),
            vec!["health", "rural development", "education"]
        );
        let list = serde_json::json!(["health", "education"]);
        assert_eq!(split_focus_areas(&list), vec!["health", "education"]);
        assert!(split_focus_areas(&serde_json::json!(42)).is_empty());
        assert!(split_focus_areas(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn contact_merge_prefers_structured_values() {
        let structured = ContactInfo {
            name: None,
            email: Some("grants@hhs.gov".into()),
            phone: None,
            position: Some("Program Officer".into()),
        };
        let merged = merge_contact(Some("Jane Doe jane@example.org (202) 555-0133"), &structured);
        assert_eq!(merged.email.as_deref(), Some("grants@hhs.gov"));
        assert_eq!(merged.name.as_deref(), Some("Jane Doe"));
        assert_eq!(merged.phone.as_deref(), Some("202 555-0133"));
        assert_eq!(merged.position.as_deref(), Some("Program Officer"));
    }

    #[test]
    fn contact_merge_without_free_text_is_passthrough() {
        let structured = ContactInfo {
            name: Some("A".into()),
            email: None,
            phone: None,
            position: None,
        };
        assert_eq!(merge_contact(None, &structured), structured);
    }

    #[test]
    fn status_parse_accepts_both_vocabularies() {
        assert_eq!(GrantStatus::parse("Not Started"), Some(GrantStatus::NotStarted));
        assert_eq!(GrantStatus::parse("not_started"), Some(GrantStatus::NotStarted));
        assert_eq!(GrantStatus::parse("Won"), Some(GrantStatus::Awarded));
        assert_eq!(GrantStatus::parse("awarded"), Some(GrantStatus::Awarded));
        assert_eq!(GrantStatus::parse("In Progress"), Some(GrantStatus::InProgress));
        assert_eq!(GrantStatus::parse("declined"), Some(GrantStatus::Declined));
        assert_eq!(GrantStatus::parse("maybe"), None);
    }

    #[test]
    fn validated_rejects_missing_identity() {
        assert!(ExtractedGrant::new("", "HHS").validated().is_none());
        assert!(ExtractedGrant::new("Rural Health", "  ").validated().is_none());
        assert!(ExtractedGrant::new("Rural Health", "HHS").validated().is_some());
    }

    #[test]
    fn normalize_applies_defaults() {
        let mut extracted = ExtractedGrant::new("Rural Health NOFO", "HHS");
        extracted.amount_min = Some(500_000.0);
        extracted.due_date_text = Some("December 1, 2025".into());
        let record = normalize(extracted);
        assert_eq!(record.status, GrantStatus::NotStarted);
        assert!(record.is_scraped);
        assert_eq!(record.amount_max, Some(500_000.0));
        assert_eq!(record.due_date, NaiveDate::from_ymd_opt(2025, 12, 1));
    }

    #[test]
    fn refresh_keeps_status_and_fills_gaps() {
        let now = Utc::now();
        let mut grant = Grant {
            id: 1,
            title: "Rural Health NOFO".into(),
            funder: "HHS".into(),
            description: None,
            amount_min: None,
            amount_max: None,
            due_date: None,
            status: GrantStatus::InProgress,
            eligibility: None,
            website: None,
            focus_areas: vec![],
            contact: ContactInfo::default(),
            match_score: Some(72.0),
            match_explanation: None,
            is_scraped: true,
            discovery_method: DiscoveryMethod::Api,
            search_query: None,
            source: Some("federal_register".into()),
            source_native_id: Some("2025-12345".into()),
            created_at: now,
            updated_at: now,
        };
        let record = GrantRecord {
            title: "Rural Health NOFO".into(),
            funder: "HHS".into(),
            description: Some("Expanded detail".into()),
            amount_min: Some(500_000.0),
            amount_max: Some(500_000.0),
            due_date: NaiveDate::from_ymd_opt(2025, 12, 1),
            status: GrantStatus::NotStarted,
            eligibility: None,
            website: None,
            focus_areas: vec![],
            contact: ContactInfo::default(),
            is_scraped: true,
            discovery_method: DiscoveryMethod::Api,
            search_query: None,
            source: Some("federal_register".into()),
            source_native_id: Some("2025-12345".into()),
        };
        grant.refresh_from(&record, Utc::now());
        assert_eq!(grant.status, GrantStatus::InProgress);
        assert_eq!(grant.match_score, Some(72.0));
        assert_eq!(grant.description.as_deref(), Some("Expanded detail"));
        assert_eq!(grant.amount_min, Some(500_000.0));
    }

    #[test]
    fn refresh_adopts_the_full_source_identity_pair() {
        let now = Utc::now();
        let mut grant = Grant {
            id: 1,
            title: "Rural Health NOFO".into(),
            funder: "HHS".into(),
            description: None,
            amount_min: None,
            amount_max: None,
            due_date: None,
            status: GrantStatus::NotStarted,
            eligibility: None,
            website: None,
            focus_areas: vec![],
            contact: ContactInfo::default(),
            match_score: None,
            match_explanation: None,
            is_scraped: false,
            discovery_method: DiscoveryMethod::Manual,
            search_query: None,
            source: None,
            source_native_id: None,
            created_at: now,
            updated_at: now,
        };
        let record = GrantRecord {
            title: "Rural Health NOFO".into(),
            funder: "HHS".into(),
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
            source: Some("federal_register".into()),
            source_native_id: Some("2025-12345".into()),
        };
        grant.refresh_from(&record, Utc::now());
        assert_eq!(grant.source.as_deref(), Some("federal_register"));
        assert_eq!(grant.source_native_id.as_deref(), Some("2025-12345"));
    }

    #[test]
    fn identity_key_folds_case_and_whitespace() {
        assert_eq!(
            identity_key("  Rural Health NOFO ", "HHS"),
            identity_key("rural health nofo", "hhs")
        );
    }
}
