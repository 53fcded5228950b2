//! Pull structured grant fields out of free text.
//!
//! Two tiers: deterministic regex extraction that always works, and an
//! optional assisted tier that asks a configured text backend for a strict
//! JSON rendition of the same fields. The assisted tier is only trusted
//! when its output passes the same validation the regex tier does; any
//! failure falls back silently.

use std::sync::Arc;

use grantflow_core::{ContactInfo, DiscoveryMethod, ExtractedGrant, RawOpportunity};
use grantflow_storage::{unwrap_json_block, TextBackend};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$\s?\d[\d,]*(?:\.\d+)?\s*(?:million|mil\b|[mk]\b|thousand)?")
        .expect("amount pattern")
});

static DATE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\d{4}-\d{2}-\d{2}",
        r"\d{1,2}/\d{1,2}/\d{4}",
        r"(?i)(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}",
        r"(?i)(?:jan|feb|mar|apr|jun|jul|aug|sep|oct|nov|dec)\.?\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("date pattern"))
    .collect()
});

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern"));

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\(\d{3}\)\s?|\d{3}[-.\s])\d{3}[-.\s]\d{4}").expect("phone pattern")
});

/// First dollar amount in the text, verbatim.
pub fn find_amount(text: &str) -> Option<String> {
    AMOUNT_RE.find(text).map(|m| m.as_str().trim().to_string())
}

/// All date-shaped substrings in document order.
fn find_dates(text: &str) -> Vec<(usize, String)> {
    let mut hits: Vec<(usize, String)> = DATE_RES
        .iter()
        .flat_map(|re| re.find_iter(text))
        .map(|m| (m.start(), m.as_str().to_string()))
        .collect();
    hits.sort_by_key(|(start, _)| *start);
    hits.dedup_by_key(|(start, _)| *start);
    hits
}

/// Pick the date most likely to be a submission deadline: the one nearest
/// (within a sentence or so) after a deadline keyword, otherwise the first
/// date in the text.
pub fn find_deadline(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let dates = find_dates(text);
    if dates.is_empty() {
        return None;
    }
    for keyword in ["deadline", "due", "close", "submit by", "applications by"] {
        if let Some(pos) = lower.find(keyword) {
            if let Some((_, date)) = dates
                .iter()
                .filter(|(start, _)| *start > pos && *start - pos < 160)
                .min_by_key(|(start, _)| *start - pos)
            {
                return Some(date.clone());
            }
        }
    }
    dates.into_iter().next().map(|(_, date)| date)
}

/// Sentences that look like eligibility criteria, joined.
pub fn find_eligibility(text: &str) -> Option<String> {
    let sentences: Vec<&str> = text
        .split(['.', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let hits: Vec<&str> = sentences
        .into_iter()
        .filter(|s| {
            let lower = s.to_lowercase();
            lower.contains("eligib")
                || lower.contains("applicants must")
                || lower.contains("501(c)(3)")
                || lower.contains("open to")
        })
        .take(3)
        .collect();
    if hits.is_empty() {
        None
    } else {
        Some(hits.join(". "))
    }
}

pub fn find_contact(text: &str) -> ContactInfo {
    ContactInfo {
        name: None,
        email: EMAIL_RE.find(text).map(|m| m.as_str().to_string()),
        phone: PHONE_RE.find(text).map(|m| m.as_str().to_string()),
        position: None,
    }
}

/// Shape the assisted tier must produce. Anything that does not
/// deserialize into this exactly is discarded.
#[derive(Debug, Deserialize)]
struct AssistedExtraction {
    title: String,
    funder: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
    #[serde(default)]
    eligibility: Option<String>,
    #[serde(default)]
    focus_areas: Vec<String>,
    #[serde(default)]
    contact_email: Option<String>,
    #[serde(default)]
    contact_name: Option<String>,
}

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract grant opportunity details from text. \
Respond with a single JSON object with keys: title, funder, description, amount, deadline, \
eligibility, focus_areas (array of strings), contact_email, contact_name. \
Use null for anything not present in the text. Do not invent values.";

pub struct Extractor {
    backend: Option<Arc<dyn TextBackend>>,
}

impl Extractor {
    pub fn new(backend: Option<Arc<dyn TextBackend>>) -> Self {
        Self { backend }
    }

    pub fn deterministic() -> Self {
        Self { backend: None }
    }

    /// Whether the assisted tier is live. Callers pacing their requests
    /// need to know if extraction may hit the backend.
    pub fn assisted(&self) -> bool {
        self.backend.is_some()
    }

    /// Extract grant fields from free text. Never errors; the worst case is
    /// `None` when not even a title can be established.
    pub async fn extract(&self, text: &str, title_hint: Option<&str>, funder_hint: Option<&str>) -> Option<ExtractedGrant> {
        if self.backend.is_some() && should_use_backend(text) {
            if let Some(grant) = self.extract_assisted(text).await {
                return Some(grant);
            }
        }
        self.extract_deterministic(text, title_hint, funder_hint)
    }

    fn extract_deterministic(
        &self,
        text: &str,
        title_hint: Option<&str>,
        funder_hint: Option<&str>,
    ) -> Option<ExtractedGrant> {
        let title = title_hint
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| first_line(text))?;
        let funder = funder_hint
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)?;

        let mut grant = ExtractedGrant::new(title, funder);
        let amount = find_amount(text).and_then(|a| grantflow_core::normalize::parse_amount(&a));
        grant.amount_min = amount;
        grant.amount_max = amount;
        grant.due_date_text = find_deadline(text);
        grant.eligibility = find_eligibility(text);
        grant.contact = find_contact(text);
        grant.discovery_method = DiscoveryMethod::Api;
        grant.validated()
    }

    async fn extract_assisted(&self, text: &str) -> Option<ExtractedGrant> {
        let backend = self.backend.as_ref()?;
        // Keep requests bounded; long documents front-load the key facts.
        let clipped: String = text.chars().take(8_000).collect();
        let value = match backend.complete_json(EXTRACTION_SYSTEM_PROMPT, &clipped).await {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "assisted extraction unavailable, using deterministic tier");
                return None;
            }
        };
        let value = match &value {
            serde_json::Value::String(s) => match serde_json::from_str(unwrap_json_block(s)) {
                Ok(v) => v,
                Err(_) => return None,
            },
            other => other.clone(),
        };
        let assisted: AssistedExtraction = match serde_json::from_value(value) {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "assisted extraction returned an unusable shape");
                return None;
            }
        };
        if assisted.title.trim().is_empty() || assisted.funder.trim().is_empty() {
            return None;
        }

        let mut grant = ExtractedGrant::new(assisted.title, assisted.funder);
        let amount = assisted
            .amount
            .as_deref()
            .and_then(grantflow_core::normalize::parse_amount);
        grant.description = assisted.description;
        grant.amount_min = amount;
        grant.amount_max = amount;
        grant.due_date_text = assisted.deadline;
        grant.eligibility = assisted.eligibility;
        grant.focus_areas = assisted.focus_areas;
        grant.contact = ContactInfo {
            name: assisted.contact_name,
            email: assisted.contact_email,
            phone: None,
            position: None,
        };
        grant.discovery_method = DiscoveryMethod::Api;
        grant.validated()
    }

    /// Promote a raw opportunity to an extracted grant. Fields the adapter
    /// already mapped win; extraction fills what is left from the
    /// description text.
    pub async fn extract_opportunity(&self, raw: &RawOpportunity) -> Option<ExtractedGrant> {
        let text = raw.description.as_deref().unwrap_or_default();
        let mut grant = match self
            .extract(text, raw.title.as_deref(), raw.funder.as_deref())
            .await
        {
            Some(grant) => grant,
            None => {
                // Sources with no prose still yield a record when the
                // adapter mapped both identity fields directly.
                ExtractedGrant::new(raw.title.clone()?, raw.funder.clone()?).validated()?
            }
        };

        if grant.description.is_none() {
            grant.description = raw.description.clone();
        }
        if let Some(amount) = raw
            .amount_text
            .as_deref()
            .and_then(grantflow_core::normalize::parse_amount)
        {
            grant.amount_min = Some(amount);
            grant.amount_max = Some(amount);
        }
        if let Some(deadline) = &raw.deadline_text {
            grant.due_date_text = Some(deadline.clone());
        }
        if let Some(eligibility) = &raw.eligibility_text {
            grant.eligibility = Some(eligibility.clone());
        }
        grant.website = grant.website.or_else(|| raw.link.clone());
        grant.source = Some(raw.source.clone());
        grant.source_native_id = raw.source_native_id.clone();
        Some(grant)
    }
}

/// Gate for the assisted tier: short or field-free snippets are not worth a
/// network round trip.
fn should_use_backend(text: &str) -> bool {
    if text.len() < 200 {
        return false;
    }
    let lower = text.to_lowercase();
    ["grant", "fund", "award", "eligib", "deadline", "apply"]
        .iter()
        .any(|k| lower.contains(k))
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grantflow_storage::BackendError;

    struct CannedBackend(serde_json::Value);

    #[async_trait]
    impl TextBackend for CannedBackend {
        async fn complete_json(
            &self,
            _system: &str,
            _user: &str,
        ) -> Result<serde_json::Value, BackendError> {
            Ok(self.0.clone())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl TextBackend for FailingBackend {
        async fn complete_json(
            &self,
            _system: &str,
            _user: &str,
        ) -> Result<serde_json::Value, BackendError> {
            Err(BackendError::Disabled)
        }
    }

    const NOTICE: &str = "The Rural Health Outreach Program announces funding of up to \
$500,000 per award. Applications are due December 1, 2025. Eligible applicants must be \
501(c)(3) organizations serving rural communities. Contact grants@hhs.gov or (202) 555-0133.";

    #[test]
    fn amount_and_deadline_pulled_from_notice() {
        assert_eq!(find_amount(NOTICE).as_deref(), Some("$500,000"));
        assert_eq!(find_deadline(NOTICE).as_deref(), Some("December 1, 2025"));
    }

    #[test]
    fn deadline_prefers_date_near_keyword() {
        let text = "Posted January 5, 2025. Submissions close on March 31, 2025.";
        assert_eq!(find_deadline(text).as_deref(), Some("March 31, 2025"));
    }

    #[test]
    fn eligibility_sentences_harvested() {
        let eligibility = find_eligibility(NOTICE).unwrap();
        assert!(eligibility.contains("501(c)(3)"));
    }

    #[test]
    fn contact_extraction_finds_email_and_phone() {
        let contact = find_contact(NOTICE);
        assert_eq!(contact.email.as_deref(), Some("grants@hhs.gov"));
        assert_eq!(contact.phone.as_deref(), Some("(202) 555-0133"));
    }

    #[tokio::test]
    async fn deterministic_extraction_survives_garbage_input() {
        let extractor = Extractor::deterministic();
        assert!(extractor.extract("", None, None).await.is_none());
        assert!(extractor
            .extract("<<<>>> \u{0} ??", Some("Title"), None)
            .await
            .is_none());
        assert!(extractor
            .extract("   \n  ", Some("  "), Some("Funder"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn deterministic_extraction_builds_full_record() {
        let extractor = Extractor::deterministic();
        let grant = extractor
            .extract(NOTICE, Some("Rural Health Outreach Program"), Some("HHS"))
            .await
            .unwrap();
        assert_eq!(grant.title, "Rural Health Outreach Program");
        assert_eq!(grant.amount_max, Some(500_000.0));
        assert_eq!(grant.due_date_text.as_deref(), Some("December 1, 2025"));
        assert_eq!(grant.contact.email.as_deref(), Some("grants@hhs.gov"));
    }

    #[tokio::test]
    async fn assisted_output_is_trusted_when_well_formed() {
        let backend = Arc::new(CannedBackend(serde_json::json!({
            "title": "Community Arts Fund",
            "funder": "City Arts Council",
            "amount": "$25,000",
            "deadline": "2026-03-01",
            "focus_areas": ["arts", "youth"],
            "contact_email": "arts@city.gov"
        })));
        let extractor = Extractor::new(Some(backend));
        let long_text = format!("{NOTICE} {}", "grant funding details ".repeat(20));
        let grant = extractor.extract(&long_text, None, None).await.unwrap();
        assert_eq!(grant.title, "Community Arts Fund");
        assert_eq!(grant.amount_max, Some(25_000.0));
        assert_eq!(grant.focus_areas, vec!["arts", "youth"]);
    }

    #[tokio::test]
    async fn malformed_assisted_output_falls_back_to_deterministic() {
        let backend = Arc::new(CannedBackend(serde_json::json!({"unexpected": true})));
        let extractor = Extractor::new(Some(backend));
        let long_text = format!("{NOTICE} {}", "grant funding details ".repeat(20));
        let grant = extractor
            .extract(&long_text, Some("Rural Health Outreach Program"), Some("HHS"))
            .await
            .unwrap();
        // Deterministic tier takes over and still produces the record.
        assert_eq!(grant.title, "Rural Health Outreach Program");
        assert_eq!(grant.amount_max, Some(500_000.0));
    }

    #[tokio::test]
    async fn unavailable_backend_never_errors() {
        let extractor = Extractor::new(Some(Arc::new(FailingBackend)));
        let long_text = format!("{NOTICE} {}", "grant funding details ".repeat(20));
        let grant = extractor
            .extract(&long_text, Some("Rural Health Outreach Program"), Some("HHS"))
            .await;
        assert!(grant.is_some());
    }

    #[tokio::test]
    async fn opportunity_promotion_prefers_adapter_fields() {
        let extractor = Extractor::deterministic();
        let mut raw = RawOpportunity::new("federal_register");
        raw.source_native_id = Some("2025-12345".into());
        raw.title = Some("Rural Health NOFO".into());
        raw.funder = Some("Department of Health and Human Services".into());
        raw.description = Some(NOTICE.into());
        raw.deadline_text = Some("2025-12-01".into());

        let grant = extractor.extract_opportunity(&raw).await.unwrap();
        assert_eq!(grant.title, "Rural Health NOFO");
        assert_eq!(grant.due_date_text.as_deref(), Some("2025-12-01"));
        assert_eq!(grant.amount_max, Some(500_000.0));
        assert_eq!(grant.source.as_deref(), Some("federal_register"));
        assert_eq!(grant.source_native_id.as_deref(), Some("2025-12345"));
    }

    #[tokio::test]
    async fn opportunity_without_identity_fields_is_discarded() {
        let extractor = Extractor::deterministic();
        let mut raw = RawOpportunity::new("somewhere");
        raw.description = Some("Nothing useful in here.".into());
        assert!(extractor.extract_opportunity(&raw).await.is_none());
    }
}
