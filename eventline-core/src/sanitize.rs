//! Privacy gate applied to every event before it is stored or transmitted
//!
//! In [`PrivacyMode::Enhanced`] the sanitizer keeps only metadata keys on the
//! allow-list for the event's category, strips identity keys even when they
//! are allowed, and drops any value whose safety cannot be established
//! (nested objects, long strings, strings that look like contact details).
//! Identifier, measurement and version keys hold opaque tokens: their string
//! values must be a single run of `[A-Za-z0-9._:-]` and skip the content
//! patterns, which would otherwise mistake numeric ids for phone numbers and
//! dotted versions for IP addresses.
//! In [`PrivacyMode::Standard`] metadata passes through unchanged.
//!
//! Sanitization never fails: ambiguity always resolves toward dropping data.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::PrivacyMode;
use crate::types::{Event, EventCategory, SanitizedEvent};

/// Longest string value kept in enhanced mode
const MAX_STRING_LEN: usize = 128;

/// Longest array value kept in enhanced mode
const MAX_ARRAY_LEN: usize = 32;

/// Keys allowed for every category
const COMMON_KEYS: &[&str] = &[
    "content_id",
    "content_type",
    "category",
    "variant",
    "experiment_id",
    "count",
    "duration_ms",
    "index",
    "position",
    "status",
];

const IMPRESSION_KEYS: &[&str] = &[
    "ad_id",
    "creative_id",
    "campaign_id",
    "placement_id",
    "slot_id",
    "ad_format",
    "viewable",
    "visible_ratio",
    "visible_ms",
    "load_time_ms",
    "render_time_ms",
    "is_above_fold",
];

const ENGAGEMENT_KEYS: &[&str] = &[
    "ad_id",
    "creative_id",
    "campaign_id",
    "action",
    "interaction_type",
    "click_count",
    "hover_ms",
    "dwell_ms",
    "scroll_depth",
    "engagement_score",
    "is_conversion",
];

const CONTEXT_KEYS: &[&str] = &[
    "page_type",
    "content_category",
    "topic_id",
    "section_id",
    "sentiment",
    "classification",
    "brand_safe",
    "guardrail_passed",
    "keyword_count",
    "confidence",
];

const JOURNEY_KEYS: &[&str] = &[
    "step",
    "step_index",
    "funnel_id",
    "stage",
    "from_page",
    "to_page",
    "referrer_type",
    "elapsed_ms",
    "is_entry",
    "is_exit",
    "path_length",
];

const PERFORMANCE_KEYS: &[&str] = &[
    "metric",
    "value_ms",
    "ttfb_ms",
    "fcp_ms",
    "lcp_ms",
    "cls",
    "resource_count",
    "transfer_bytes",
    "cache_hit",
];

const SYSTEM_KEYS: &[&str] = &[
    "component",
    "operation",
    "error_code",
    "retry_count",
    "queue_depth",
    "batch_size",
    "version",
];

/// Normalized keys that always identify a person
const IDENTITY_KEYS: &[&str] = &[
    "name",
    "firstname",
    "lastname",
    "fullname",
    "username",
    "email",
    "emailaddress",
    "phone",
    "phonenumber",
    "mobile",
    "address",
    "streetaddress",
    "postcode",
    "zipcode",
    "location",
    "city",
    "latitude",
    "longitude",
    "geolocation",
    "useragent",
    "ipaddress",
    "ssn",
    "dob",
    "dateofbirth",
    "birthdate",
];

/// Allow-listed keys whose values are opaque tokens rather than free text
const TOKEN_KEYS: &[&str] = &["count", "index", "position", "version", "error_code", "metric"];

/// Suffixes marking identifier and measurement keys
const TOKEN_SUFFIXES: &[&str] = &["_id", "_ms", "_count", "_bytes", "_index", "_depth", "_size"];

/// Key fragments that mark a key as identifying wherever they appear
const IDENTITY_TOKENS: &[&str] = &[
    "name", "email", "phone", "address", "location", "ssn", "birth", "diagnosis",
];

// Each pattern compiles once; a pattern that fails to compile is `None`, and
// string values are then treated as unsafe.
static EMAIL_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok());
static PHONE_REGEX: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").ok()
});
static SSN_REGEX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").ok());
static CARD_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").ok());
static IP_REGEX: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").ok());

/// Stateless event filter
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    mode: PrivacyMode,
}

impl Sanitizer {
    pub fn new(mode: PrivacyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> PrivacyMode {
        self.mode
    }

    /// Filter an event, producing the only form the store will accept
    pub fn sanitize(&self, mut event: Event) -> SanitizedEvent {
        if self.mode == PrivacyMode::Enhanced {
            event.metadata = sanitize_metadata(event.event_category, event.metadata);
            event.context.user_agent = None;
            sanitize_source(&mut event);
        }
        SanitizedEvent::new(event)
    }
}

/// Metadata keys allowed for a category in enhanced mode
pub fn allowed_keys(category: EventCategory) -> impl Iterator<Item = &'static str> {
    let specific = match category {
        EventCategory::Impression => IMPRESSION_KEYS,
        EventCategory::Engagement => ENGAGEMENT_KEYS,
        EventCategory::Context => CONTEXT_KEYS,
        EventCategory::Journey => JOURNEY_KEYS,
        EventCategory::Performance => PERFORMANCE_KEYS,
        EventCategory::System => SYSTEM_KEYS,
    };
    COMMON_KEYS.iter().chain(specific.iter()).copied()
}

fn is_allowed(category: EventCategory, key: &str) -> bool {
    allowed_keys(category).any(|allowed| allowed == key)
}

/// Whether a key names identity data, regardless of allow-lists
pub fn is_identity_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    IDENTITY_KEYS.contains(&normalized.as_str())
        || IDENTITY_TOKENS
            .iter()
            .any(|token| normalized.contains(token))
}

fn sanitize_metadata(category: EventCategory, metadata: Map<String, Value>) -> Map<String, Value> {
    let mut kept = Map::new();

    for (key, value) in metadata {
        if is_identity_key(&key) {
            tracing::debug!(key = %key, "Stripped identity field");
            continue;
        }
        if !is_allowed(category, &key) {
            tracing::trace!(key = %key, category = category.as_str(), "Dropped field not on allow-list");
            continue;
        }
        if !is_safe_value(is_token_key(&key), &value) {
            tracing::debug!(key = %key, "Dropped field with unverifiable value");
            continue;
        }
        kept.insert(key, value);
    }

    kept
}

fn sanitize_source(event: &mut Event) {
    let source = &mut event.source;

    // Query strings and fragments routinely carry identifiers.
    if let Some(page) = source.page.take() {
        let path = page
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .to_string();
        source.page = Some(path);
    }

    for field in [
        &mut source.page,
        &mut source.section,
        &mut source.component,
        &mut source.placement,
    ] {
        if field.as_deref().is_some_and(|s| !is_safe_string(s)) {
            *field = None;
        }
    }
}

fn is_token_key(key: &str) -> bool {
    TOKEN_KEYS.contains(&key) || TOKEN_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

fn is_safe_value(token: bool, value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => true,
        Value::String(s) if token => is_safe_token(s),
        Value::String(s) => is_safe_string(s),
        Value::Array(items) => {
            items.len() <= MAX_ARRAY_LEN
                && items.iter().all(|item| match item {
                    Value::Array(_) | Value::Object(_) => false,
                    scalar => is_safe_value(token, scalar),
                })
        }
        Value::Object(_) => false,
    }
}

/// Short, non-empty, no whitespace and no `@`
fn is_safe_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_STRING_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

fn is_safe_string(s: &str) -> bool {
    if s.len() > MAX_STRING_LEN {
        return false;
    }
    [&EMAIL_REGEX, &PHONE_REGEX, &SSN_REGEX, &CARD_REGEX, &IP_REGEX]
        .iter()
        .all(|pattern| match pattern.as_ref() {
            Some(regex) => !regex.is_match(s),
            None => false,
        })
}
