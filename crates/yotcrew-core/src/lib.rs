//! Canonical job record, normalization and quality scoring for YotCrew.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "yotcrew-core";

/// Opaque, schema-less record as produced by a source plugin.
pub type RawRecord = serde_json::Map<String, Value>;

/// Source-specific filter parameters. Keys a plugin does not declare are ignored.
pub type Filters = BTreeMap<String, String>;

pub const DEFAULT_FRESHNESS_HORIZON_DAYS: i64 = 30;
pub const DEFAULT_ERROR_LIMIT: usize = 50;

macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
            #[serde(rename = "other")]
            Other,
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                    Self::Other => "other",
                }
            }

            /// Exact label match; anything unrecognized becomes `Other`.
            pub fn from_label(label: &str) -> Self {
                let key = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                match key.as_str() {
                    $($label => Self::$variant,)+
                    _ => Self::Other,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labelled_enum!(
    EmploymentType {
        Permanent => "permanent",
        Temporary => "temporary",
        Rotational => "rotational",
        Daywork => "daywork",
        Seasonal => "seasonal",
        Contract => "contract",
    }
);

labelled_enum!(
    Department {
        Deck => "deck",
        Interior => "interior",
        Engineering => "engineering",
        Galley => "galley",
        Bridge => "bridge",
    }
);

labelled_enum!(
    VesselType {
        MotorYacht => "motor_yacht",
        SailingYacht => "sailing_yacht",
        Catamaran => "catamaran",
        SuperYacht => "super_yacht",
        Expedition => "expedition",
        ChaseBoat => "chase_boat",
    }
);

labelled_enum!(
    /// Length-overall bucket in metres.
    VesselSize {
        Under30m => "under_30m",
        From30To49m => "30_49m",
        From50To74m => "50_74m",
        From75To99m => "75_99m",
        Over100m => "100m_plus",
    }
);

labelled_enum!(
    Currency {
        Eur => "eur",
        Usd => "usd",
        Gbp => "gbp",
        Aud => "aud",
    }
);

labelled_enum!(
    PayPeriod {
        Hour => "hour",
        Day => "day",
        Week => "week",
        Month => "month",
        Year => "year",
    }
);

const EMPLOYMENT_KEYWORDS: &[(EmploymentType, &[&str])] = &[
    (EmploymentType::Daywork, &["daywork", "day work", "dayworker", "day worker"]),
    (EmploymentType::Rotational, &["rotation", "rotational"]),
    (EmploymentType::Seasonal, &["seasonal", "season"]),
    (EmploymentType::Temporary, &["temporary", "temp", "relief", "short term"]),
    (EmploymentType::Contract, &["contract", "freelance", "delivery"]),
    (EmploymentType::Permanent, &["permanent", "full time", "long term"]),
];

const DEPARTMENT_KEYWORDS: &[(Department, &[&str])] = &[
    (
        Department::Deck,
        &["deckhand", "bosun", "mate", "captain", "officer", "deck", "skipper"],
    ),
    (
        Department::Interior,
        &["stewardess", "steward", "stew", "interior", "housekeeping", "butler"],
    ),
    (
        Department::Engineering,
        &["engineer", "mechanic", "eto", "technical"],
    ),
    (Department::Galley, &["chef", "cook", "galley", "kitchen"]),
    (Department::Bridge, &["bridge", "navigator"]),
];

const VESSEL_KEYWORDS: &[(VesselType, &[&str])] = &[
    (VesselType::SailingYacht, &["sailing yacht", "sailing", "sail", "s y"]),
    (VesselType::Catamaran, &["catamaran"]),
    (VesselType::Expedition, &["expedition", "explorer"]),
    (VesselType::ChaseBoat, &["chase boat", "support vessel"]),
    (VesselType::SuperYacht, &["superyacht", "super yacht", "megayacht"]),
    (VesselType::MotorYacht, &["motor yacht", "m y", "motoryacht"]),
];

impl EmploymentType {
    pub fn detect(text: &str) -> Option<Self> {
        detect_keyword(text, EMPLOYMENT_KEYWORDS)
    }
}

impl Department {
    pub fn detect(text: &str) -> Option<Self> {
        detect_keyword(text, DEPARTMENT_KEYWORDS)
    }
}

impl VesselType {
    pub fn detect(text: &str) -> Option<Self> {
        detect_keyword(text, VESSEL_KEYWORDS)
    }
}

impl VesselSize {
    pub fn from_metres(length: f64) -> Self {
        if !length.is_finite() || length <= 0.0 {
            Self::Other
        } else if length < 30.0 {
            Self::Under30m
        } else if length < 50.0 {
            Self::From30To49m
        } else if length < 75.0 {
            Self::From50To74m
        } else if length < 100.0 {
            Self::From75To99m
        } else {
            Self::Over100m
        }
    }

    /// Finds the first length figure ("52m", "45 metres", "120ft") in free text.
    pub fn detect(text: &str) -> Option<Self> {
        let pattern = length_pattern()?;
        let caps = pattern.captures(text)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_ascii_lowercase();
        let metres = if unit.starts_with('f') || unit == "'" {
            value * 0.3048
        } else {
            value
        };
        Some(Self::from_metres(metres))
    }
}

impl Currency {
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();
        if lower.contains("aud") || lower.contains("a$") {
            Some(Self::Aud)
        } else if text.contains('€') || lower.contains("eur") {
            Some(Self::Eur)
        } else if text.contains('£') || lower.contains("gbp") {
            Some(Self::Gbp)
        } else if text.contains('$') || lower.contains("usd") {
            Some(Self::Usd)
        } else {
            None
        }
    }
}

impl PayPeriod {
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();
        let matches = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        if matches(&["per hour", "/hour", "/hr", "hourly", "p/h"]) {
            Some(Self::Hour)
        } else if matches(&["per day", "/day", "daily", "p/d", "a day"]) {
            Some(Self::Day)
        } else if matches(&["per week", "/week", "weekly", "p/w"]) {
            Some(Self::Week)
        } else if matches(&["per month", "/month", "monthly", "pcm", "p/m"]) {
            Some(Self::Month)
        } else if matches(&["per annum", "per year", "/year", "annually", "p.a.", "yearly"]) {
            Some(Self::Year)
        } else {
            None
        }
    }
}

fn length_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)\b(\d{2,3}(?:\.\d+)?)\s*(m|metres|meters|metre|meter|ft|feet|')(?:\b|\s|$)")
                .ok()
        })
        .as_ref()
}

fn relative_date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(\d+|an?)\s+(minute|min|hour|hr|day|week|month)s?\s+ago$").ok()
        })
        .as_ref()
}

fn ordinal_suffix_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d{1,2})(st|nd|rd|th)\b").ok())
        .as_ref()
}

/// Lowercases and splits on anything non-alphanumeric so keywords match on word boundaries.
fn word_padded(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    format!(" {} ", words.join(" "))
}

fn detect_keyword<T: Copy>(text: &str, table: &[(T, &[&str])]) -> Option<T> {
    let haystack = word_padded(text);
    table.iter().find_map(|(value, keywords)| {
        keywords
            .iter()
            .any(|kw| haystack.contains(&word_padded(kw)))
            .then_some(*value)
    })
}

/// Composite identity of a posting: unique per source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub source_id: String,
    pub external_id: String,
}

impl IdentityKey {
    pub fn new(source_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
        }
    }

    /// Deterministic row id derived from the identity.
    pub fn record_id(&self) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("yotcrew:{}:{}", self.source_id, self.external_id).as_bytes(),
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.external_id)
    }
}

/// Canonical, normalized job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    pub organization: String,
    pub description: String,
    pub location: Option<String>,
    pub employment_type: Option<EmploymentType>,
    pub department: Option<Department>,
    pub vessel_type: Option<VesselType>,
    pub vessel_size: Option<VesselSize>,
    pub salary_range: Option<String>,
    pub salary_currency: Option<Currency>,
    pub salary_period: Option<PayPeriod>,
    pub start_date: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub quality_score: f64,
    pub source_url: String,
    pub raw_payload: Value,
}

#[derive(Serialize)]
struct ContentView<'a> {
    title: &'a str,
    organization: &'a str,
    description: &'a str,
    location: &'a Option<String>,
    employment_type: Option<EmploymentType>,
    department: Option<Department>,
    vessel_type: Option<VesselType>,
    vessel_size: Option<VesselSize>,
    salary_range: &'a Option<String>,
    salary_currency: Option<Currency>,
    salary_period: Option<PayPeriod>,
    start_date: &'a Option<String>,
    posted_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(self.source_id.clone(), self.external_id.clone())
    }

    /// SHA-256 over the descriptive fields only. Provenance (`source_url`, `raw_payload`),
    /// `observed_at` and the derived score never influence it.
    pub fn content_fingerprint(&self) -> String {
        let view = ContentView {
            title: &self.title,
            organization: &self.organization,
            description: &self.description,
            location: &self.location,
            employment_type: self.employment_type,
            department: self.department,
            vessel_type: self.vessel_type,
            vessel_size: self.vessel_size,
            salary_range: &self.salary_range,
            salary_currency: self.salary_currency,
            salary_period: self.salary_period,
            start_date: &self.start_date,
            posted_at: self.posted_at,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Absolute http(s) URL with a host.
pub fn is_well_formed_url(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        }
        Err(_) => false,
    }
}

pub fn validate(record: &JobRecord) -> Result<(), ValidationError> {
    let required = [
        ("source_id", record.source_id.as_str()),
        ("external_id", record.external_id.as_str()),
        ("title", record.title.as_str()),
        ("organization", record.organization.as_str()),
        ("description", record.description.as_str()),
        ("source_url", record.source_url.as_str()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::new(field, "must not be empty"));
        }
    }

    if !is_well_formed_url(&record.source_url) {
        return Err(ValidationError::new(
            "source_url",
            format!("`{}` is not an absolute http(s) url", record.source_url),
        ));
    }

    if !(0.0..=1.0).contains(&record.quality_score) {
        return Err(ValidationError::new(
            "quality_score",
            format!("{} outside [0, 1]", record.quality_score),
        ));
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("field `{field}` has unsupported type {found}")]
    UnsupportedType {
        field: &'static str,
        found: &'static str,
    },
    #[error("posted date `{text}` is out of range")]
    DateOutOfRange { text: String },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

const PLACEHOLDERS: &[&str] = &["", "n/a", "na", "none", "null", "-", "tbc", "unknown"];

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// First non-placeholder text value among `keys`, whitespace-collapsed.
fn text_field(
    raw: &RawRecord,
    field: &'static str,
    keys: &[&str],
) -> Result<Option<String>, NormalizationError> {
    for key in keys {
        let text = match raw.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(NormalizationError::UnsupportedType {
                    field,
                    found: value_kind(other),
                })
            }
        };
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if PLACEHOLDERS.contains(&collapsed.to_ascii_lowercase().as_str()) {
            continue;
        }
        return Ok(Some(collapsed));
    }
    Ok(None)
}

/// Parses absolute and relative posting dates. Relative phrases resolve against `observed_at`.
/// Relative offsets too large to represent yield `None`.
pub fn parse_posted_at(text: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    resolve_posted_at(text, observed_at).ok().flatten()
}

/// Relative posting date whose offset falls outside the representable range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DateOutOfRange;

fn relative_offset(amount: &str, unit: &str) -> Result<Duration, DateOutOfRange> {
    let amount: i64 = match amount {
        "a" | "an" => 1,
        digits => digits.parse().map_err(|_| DateOutOfRange)?,
    };
    let delta = match unit {
        "minute" | "min" => Duration::try_minutes(amount),
        "hour" | "hr" => Duration::try_hours(amount),
        "day" => Duration::try_days(amount),
        "week" => Duration::try_weeks(amount),
        _ => amount.checked_mul(30).and_then(Duration::try_days),
    };
    delta.ok_or(DateOutOfRange)
}

fn resolve_posted_at(
    text: &str,
    observed_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DateOutOfRange> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    let mut lower = trimmed.to_lowercase();
    for prefix in ["date posted", "posted on", "posted", "added", ":"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            lower = rest.trim().to_string();
        }
    }
    let lower = lower.trim_start_matches(':').trim().to_string();

    match lower.as_str() {
        "today" | "just now" | "new" => return Ok(Some(observed_at)),
        "yesterday" => return Ok(observed_at.checked_sub_signed(Duration::days(1))),
        _ => {}
    }

    if let Some(caps) = relative_date_pattern().and_then(|p| p.captures(&lower)) {
        let (Some(amount), Some(unit)) = (caps.get(1), caps.get(2)) else {
            return Ok(None);
        };
        let delta = relative_offset(amount.as_str(), unit.as_str())?;
        return observed_at
            .checked_sub_signed(delta)
            .map(Some)
            .ok_or(DateOutOfRange);
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(Some(Utc.from_utc_datetime(&naive)));
    }

    let without_ordinals = match ordinal_suffix_pattern() {
        Some(pattern) => pattern.replace_all(&lower, "$1").into_owned(),
        None => lower.clone(),
    };
    const DATE_FORMATS: &[&str] = &[
        "%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%d %B %Y", "%d %b %Y", "%B %d, %Y",
        "%b %d, %Y", "%B %d %Y", "%b %d %Y",
    ];
    Ok(DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(&without_ordinals, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    }))
}

fn posted_at_field(
    raw: &RawRecord,
    observed_at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, NormalizationError> {
    for key in ["posted_at", "posted_date", "date_posted", "date"] {
        match raw.get(key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => {
                return Ok(n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)))
            }
            Some(Value::String(s)) => {
                return resolve_posted_at(s, observed_at).map_err(|DateOutOfRange| {
                    NormalizationError::DateOutOfRange { text: s.clone() }
                })
            }
            Some(other) => {
                return Err(NormalizationError::UnsupportedType {
                    field: "posted_at",
                    found: value_kind(other),
                })
            }
        }
    }
    Ok(None)
}

/// Converts raw plugin output into canonical records and scores them.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub freshness_horizon: Duration,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            freshness_horizon: Duration::days(DEFAULT_FRESHNESS_HORIZON_DAYS),
        }
    }
}

impl Normalizer {
    pub fn new(freshness_horizon: Duration) -> Self {
        Self { freshness_horizon }
    }

    /// Output depends only on `raw`, `source_id` and `observed_at`.
    pub fn normalize(
        &self,
        raw: &RawRecord,
        source_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<JobRecord, NormalizationError> {
        let external_id = text_field(raw, "external_id", &["external_id", "id", "job_id"])?;
        let title = text_field(raw, "title", &["title", "position", "job_title"])?;
        let organization =
            text_field(raw, "organization", &["organization", "company", "employer"])?;
        let description = text_field(
            raw,
            "description",
            &["description", "full_description", "summary"],
        )?;
        let location = text_field(raw, "location", &["location", "place"])?;
        let source_url = text_field(raw, "source_url", &["source_url", "url", "link"])?;
        let salary_range = text_field(raw, "salary_range", &["salary_range", "salary", "pay"])?;
        let start_date = text_field(raw, "start_date", &["start_date", "starts"])?;

        let title = title.unwrap_or_default();
        let description = description.unwrap_or_default();

        let employment_type = match text_field(
            raw,
            "employment_type",
            &["employment_type", "job_type", "type"],
        )? {
            Some(text) => Some(EmploymentType::detect(&text).unwrap_or_else(|| {
                EmploymentType::from_label(&text)
            })),
            None => EmploymentType::detect(&title),
        };

        let department = match text_field(raw, "department", &["department"])? {
            Some(text) => Some(match Department::from_label(&text) {
                Department::Other => Department::detect(&text).unwrap_or(Department::Other),
                known => known,
            }),
            None => Department::detect(&title),
        };

        let vessel_context = format!("{title} {description}");
        let vessel_type = match text_field(raw, "vessel_type", &["vessel_type", "yacht_type"])? {
            Some(text) => Some(match VesselType::from_label(&text) {
                VesselType::Other => VesselType::detect(&text).unwrap_or(VesselType::Other),
                known => known,
            }),
            None => VesselType::detect(&vessel_context),
        };

        let vessel_size = match text_field(raw, "vessel_size", &["vessel_size", "yacht_size"])? {
            Some(text) => Some(match VesselSize::from_label(&text) {
                VesselSize::Other => VesselSize::detect(&text).unwrap_or(VesselSize::Other),
                known => known,
            }),
            None => VesselSize::detect(&vessel_context),
        };

        let salary_currency = match text_field(raw, "salary_currency", &["salary_currency", "currency"])? {
            Some(text) => Some(match Currency::from_label(&text) {
                Currency::Other => Currency::detect(&text).unwrap_or(Currency::Other),
                known => known,
            }),
            None => salary_range.as_deref().and_then(Currency::detect),
        };

        let salary_period = match text_field(raw, "salary_period", &["salary_period", "salary_per"])? {
            Some(text) => Some(match PayPeriod::from_label(&text) {
                PayPeriod::Other => PayPeriod::detect(&text).unwrap_or(PayPeriod::Other),
                known => known,
            }),
            None => salary_range.as_deref().and_then(PayPeriod::detect),
        };

        let mut record = JobRecord {
            source_id: source_id.trim().to_string(),
            external_id: external_id.unwrap_or_default(),
            title,
            organization: organization.unwrap_or_default(),
            description,
            location,
            employment_type,
            department,
            vessel_type,
            vessel_size,
            salary_range,
            salary_currency,
            salary_period,
            start_date,
            posted_at: posted_at_field(raw, observed_at)?,
            observed_at,
            quality_score: 0.0,
            source_url: source_url.unwrap_or_default(),
            raw_payload: Value::Object(raw.clone()),
        };
        record.quality_score = score(&record, self.freshness_horizon);
        validate(&record)?;
        Ok(record)
    }

    pub fn rescore(&self, record: &mut JobRecord) {
        record.quality_score = score(record, self.freshness_horizon);
    }
}

const COMPLETENESS_WEIGHT: f64 = 0.4;
const STRUCTURE_WEIGHT: f64 = 0.3;
const FRESHNESS_WEIGHT: f64 = 0.2;
const CONSISTENCY_WEIGHT: f64 = 0.1;

fn filled(value: &str) -> bool {
    !value.trim().is_empty()
}

fn completeness(record: &JobRecord) -> f64 {
    let fields = [
        filled(&record.title),
        filled(&record.organization),
        filled(&record.description),
        record.location.as_deref().is_some_and(filled),
    ];
    fields.iter().filter(|present| **present).count() as f64 / fields.len() as f64
}

fn structure(record: &JobRecord) -> f64 {
    let location = record.location.as_deref().map_or(0.0, |loc| {
        let ok = filled(loc)
            && loc.chars().count() <= 120
            && loc.chars().any(char::is_alphabetic)
            && !loc.eq_ignore_ascii_case("unknown");
        if ok {
            1.0
        } else {
            0.0
        }
    });
    let compensation = match record.salary_range.as_deref() {
        Some(range) if range.chars().any(|c| c.is_ascii_digit()) => 1.0,
        Some(_) => 0.5,
        None => 0.0,
    };
    let url = if is_well_formed_url(&record.source_url) {
        1.0
    } else {
        0.0
    };
    (location + compensation + url) / 3.0
}

fn freshness(record: &JobRecord, horizon: Duration) -> f64 {
    let Some(posted_at) = record.posted_at else {
        return 0.5;
    };
    let horizon_secs = horizon.num_seconds();
    if horizon_secs <= 0 {
        return 0.0;
    }
    let age = (record.observed_at - posted_at).num_seconds().max(0);
    1.0 - (age as f64 / horizon_secs as f64).min(1.0)
}

fn consistency(record: &JobRecord) -> f64 {
    let has_salary = record.salary_range.is_some();
    let checks = [
        record.salary_currency.is_none() || has_salary,
        record.salary_period.is_none() || has_salary,
        record
            .posted_at
            .map_or(true, |posted| posted <= record.observed_at + Duration::days(1)),
        !record.description.trim().eq_ignore_ascii_case(record.title.trim()),
        record.title.chars().count() <= 200,
    ];
    checks.iter().filter(|ok| **ok).count() as f64 / checks.len() as f64
}

/// Weighted quality score, always in `[0, 1]`.
pub fn score(record: &JobRecord, freshness_horizon: Duration) -> f64 {
    let total = COMPLETENESS_WEIGHT * completeness(record)
        + STRUCTURE_WEIGHT * structure(record)
        + FRESHNESS_WEIGHT * freshness(record, freshness_horizon)
        + CONSISTENCY_WEIGHT * consistency(record);
    if total.is_nan() {
        0.0
    } else {
        total.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Unreachable,
    CircuitOpen,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Unreachable => "unreachable",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Finalized record of one source run. Built through [`RunSummaryDraft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub pages_attempted: u32,
    pub found: u32,
    pub new: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub errors: u32,
    pub error_messages: Vec<String>,
    pub errors_truncated: u32,
    pub stale_marked: u64,
}

impl RunSummary {
    pub fn duration(&self) -> Duration {
        self.finished_at - self.started_at
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.errors == 0
    }
}

/// Mutable accumulator for a run in progress.
#[derive(Debug, Clone)]
pub struct RunSummaryDraft {
    run_id: Uuid,
    source_id: String,
    started_at: DateTime<Utc>,
    error_limit: usize,
    pages_attempted: u32,
    found: u32,
    new: u32,
    updated: u32,
    unchanged: u32,
    errors: u32,
    error_messages: Vec<String>,
    stale_marked: u64,
}

impl RunSummaryDraft {
    pub fn start(source_id: impl Into<String>, error_limit: usize) -> Self {
        Self::with_run_id(Uuid::new_v4(), source_id, Utc::now(), error_limit)
    }

    pub fn with_run_id(
        run_id: Uuid,
        source_id: impl Into<String>,
        started_at: DateTime<Utc>,
        error_limit: usize,
    ) -> Self {
        Self {
            run_id,
            source_id: source_id.into(),
            started_at,
            error_limit,
            pages_attempted: 0,
            found: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            errors: 0,
            error_messages: Vec::new(),
            stale_marked: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn record_page(&mut self) {
        self.pages_attempted += 1;
    }

    pub fn record_found(&mut self, count: usize) {
        self.found = self.found.saturating_add(count as u32);
    }

    pub fn record_created(&mut self) {
        self.new += 1;
    }

    pub fn record_updated(&mut self) {
        self.updated += 1;
    }

    pub fn record_unchanged(&mut self) {
        self.unchanged += 1;
    }

    pub fn record_stale(&mut self, count: u64) {
        self.stale_marked += count;
    }

    /// Counts every error; keeps only the first `error_limit` messages.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.error_messages.len() < self.error_limit {
            self.error_messages.push(message.into());
        }
    }

    pub fn finish(self, status: RunStatus) -> RunSummary {
        self.finish_at(status, Utc::now())
    }

    pub fn finish_at(self, status: RunStatus, finished_at: DateTime<Utc>) -> RunSummary {
        let kept = self.error_messages.len() as u32;
        RunSummary {
            run_id: self.run_id,
            source_id: self.source_id,
            started_at: self.started_at,
            finished_at: finished_at.max(self.started_at),
            status,
            pages_attempted: self.pages_attempted,
            found: self.found,
            new: self.new,
            updated: self.updated,
            unchanged: self.unchanged,
            errors: self.errors,
            error_messages: self.error_messages,
            errors_truncated: self.errors.saturating_sub(kept),
            stale_marked: self.stale_marked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    fn full_raw() -> RawRecord {
        raw(json!({
            "external_id": "4512",
            "title": "Chief Stewardess",
            "company": "M/Y Aurora",
            "description": "Rotational chief stew role on a 62m motor yacht based in Antibes.",
            "location": "Antibes, France",
            "job_type": "Rotational",
            "salary": "€7,000 - €8,000 per month",
            "posted_date": "3 days ago",
            "url": "https://www.yotspot.com/job-search/jobs/4512"
        }))
    }

    #[test]
    fn normalize_maps_aliases_and_detects_categories() {
        let observed = at(2026, 3, 10, 9);
        let record = Normalizer::default()
            .normalize(&full_raw(), "yotspot", observed)
            .unwrap();

        assert_eq!(record.external_id, "4512");
        assert_eq!(record.organization, "M/Y Aurora");
        assert_eq!(record.employment_type, Some(EmploymentType::Rotational));
        assert_eq!(record.department, Some(Department::Interior));
        assert_eq!(record.vessel_type, Some(VesselType::MotorYacht));
        assert_eq!(record.vessel_size, Some(VesselSize::From50To74m));
        assert_eq!(record.salary_currency, Some(Currency::Eur));
        assert_eq!(record.salary_period, Some(PayPeriod::Month));
        assert_eq!(record.posted_at, Some(at(2026, 3, 7, 9)));
        assert_eq!(record.observed_at, observed);
        assert!(record.quality_score > 0.8);
    }

    #[test]
    fn normalize_is_deterministic_for_same_observation() {
        let observed = at(2026, 3, 10, 9);
        let normalizer = Normalizer::default();
        let a = normalizer.normalize(&full_raw(), "yotspot", observed).unwrap();
        let b = normalizer.normalize(&full_raw(), "yotspot", observed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_categoricals_fall_back_to_other() {
        let mut input = full_raw();
        input.insert("department".into(), json!("Spa & Wellness"));
        input.insert("vessel_type".into(), json!("Hovercraft"));
        input.insert("currency".into(), json!("CHF"));

        let record = Normalizer::default()
            .normalize(&input, "yotspot", at(2026, 3, 10, 9))
            .unwrap();
        assert_eq!(record.department, Some(Department::Other));
        assert_eq!(record.vessel_type, Some(VesselType::Other));
        assert_eq!(record.salary_currency, Some(Currency::Other));
        assert!(validate(&record).is_ok());
    }

    #[test]
    fn missing_optional_fields_stay_unset() {
        let input = raw(json!({
            "id": 99,
            "title": "Relief Chef",
            "company": "Private owner",
            "description": "Two week relief cover",
            "url": "https://example.com/jobs/99"
        }));
        let record = Normalizer::default()
            .normalize(&input, "meridian_go", at(2026, 3, 10, 9))
            .unwrap();
        assert_eq!(record.external_id, "99");
        assert_eq!(record.location, None);
        assert_eq!(record.salary_range, None);
        assert_eq!(record.salary_currency, None);
        assert_eq!(record.posted_at, None);
        assert_eq!(record.vessel_size, None);
        assert_eq!(record.employment_type, Some(EmploymentType::Temporary));
        assert_eq!(record.department, Some(Department::Galley));
    }

    #[test]
    fn missing_required_field_is_a_validation_error() {
        let mut input = full_raw();
        input.remove("company");
        let err = Normalizer::default()
            .normalize(&input, "yotspot", at(2026, 3, 10, 9))
            .unwrap_err();
        assert_eq!(
            err,
            NormalizationError::Invalid(ValidationError::new(
                "organization",
                "must not be empty"
            ))
        );
    }

    #[test]
    fn structured_values_where_text_expected_are_rejected() {
        let mut input = full_raw();
        input.insert("title".into(), json!(["Deckhand"]));
        let err = Normalizer::default()
            .normalize(&input, "yotspot", at(2026, 3, 10, 9))
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizationError::UnsupportedType { field: "title", found: "array" }
        ));
    }

    #[test]
    fn relative_urls_fail_validation() {
        let mut input = full_raw();
        input.insert("url".into(), json!("/jobs/4512"));
        let err = Normalizer::default()
            .normalize(&input, "yotspot", at(2026, 3, 10, 9))
            .unwrap_err();
        assert!(matches!(err, NormalizationError::Invalid(ref v) if v.field == "source_url"));
    }

    #[test]
    fn posted_dates_parse_in_common_shapes() {
        let observed = at(2026, 3, 10, 12);
        assert_eq!(parse_posted_at("Yesterday", observed), Some(at(2026, 3, 9, 12)));
        assert_eq!(parse_posted_at("Posted 2 weeks ago", observed), Some(at(2026, 2, 24, 12)));
        assert_eq!(parse_posted_at("an hour ago", observed), Some(at(2026, 3, 10, 11)));
        assert_eq!(parse_posted_at("2026-03-01", observed), Some(at(2026, 3, 1, 0)));
        assert_eq!(parse_posted_at("05/03/2026", observed), Some(at(2026, 3, 5, 0)));
        assert_eq!(parse_posted_at("3rd March 2026", observed), Some(at(2026, 3, 3, 0)));
        assert_eq!(parse_posted_at("sometime soon", observed), None);
    }

    #[test]
    fn oversized_relative_dates_do_not_overflow() {
        let observed = at(2026, 3, 10, 12);
        for text in [
            "999999999 days ago",
            "100000000 days ago",
            "9223372036854775807 months ago",
            "99999999999999999999999 hours ago",
            "4000000000000 weeks ago",
        ] {
            assert_eq!(parse_posted_at(text, observed), None, "{text}");
        }
        assert_eq!(parse_posted_at("12 months ago", observed), Some(at(2025, 3, 15, 12)));
    }

    #[test]
    fn out_of_range_posted_date_rejects_the_record() {
        let mut input = full_raw();
        input.insert("posted_at".into(), json!("999999999 days ago"));
        let err = Normalizer::default()
            .normalize(&input, "yotspot", at(2026, 3, 10, 9))
            .unwrap_err();
        assert_eq!(
            err,
            NormalizationError::DateOutOfRange {
                text: "999999999 days ago".to_string()
            }
        );
    }

    #[test]
    fn score_is_bounded_for_sparse_and_rich_records() {
        let observed = at(2026, 3, 10, 9);
        let rich = Normalizer::default()
            .normalize(&full_raw(), "yotspot", observed)
            .unwrap();
        let mut sparse = rich.clone();
        sparse.title.clear();
        sparse.organization.clear();
        sparse.description.clear();
        sparse.location = None;
        sparse.salary_range = None;
        sparse.source_url = "not a url".into();
        sparse.posted_at = Some(at(2020, 1, 1, 0));

        for record in [&rich, &sparse] {
            let value = score(record, Duration::days(30));
            assert!((0.0..=1.0).contains(&value), "score {value} out of range");
        }
        assert!((0.0..=1.0).contains(&score(&rich, Duration::zero())));
    }

    #[test]
    fn missing_description_scores_strictly_lower() {
        let record = Normalizer::default()
            .normalize(&full_raw(), "yotspot", at(2026, 3, 10, 9))
            .unwrap();
        let mut without = record.clone();
        without.description.clear();
        let horizon = Duration::days(30);
        assert!(score(&without, horizon) < score(&record, horizon));
    }

    #[test]
    fn freshness_is_neutral_without_posted_date_and_decays_linearly() {
        let mut record = Normalizer::default()
            .normalize(&full_raw(), "yotspot", at(2026, 3, 10, 9))
            .unwrap();
        let horizon = Duration::days(30);

        record.posted_at = None;
        assert_eq!(freshness(&record, horizon), 0.5);
        record.posted_at = Some(record.observed_at);
        assert_eq!(freshness(&record, horizon), 1.0);
        record.posted_at = Some(record.observed_at - Duration::days(15));
        assert!((freshness(&record, horizon) - 0.5).abs() < 1e-9);
        record.posted_at = Some(record.observed_at - Duration::days(90));
        assert_eq!(freshness(&record, horizon), 0.0);
    }

    #[test]
    fn fingerprint_ignores_provenance_and_observation_time() {
        let record = Normalizer::default()
            .normalize(&full_raw(), "yotspot", at(2026, 3, 10, 9))
            .unwrap();
        let mut touched = record.clone();
        touched.observed_at = at(2026, 3, 11, 9);
        touched.quality_score = 0.1;
        touched.source_url = "https://mirror.example.com/4512".into();
        touched.raw_payload = json!({"different": true});
        assert_eq!(record.content_fingerprint(), touched.content_fingerprint());

        touched.title = "Head of Interior".into();
        assert_ne!(record.content_fingerprint(), touched.content_fingerprint());
    }

    #[test]
    fn keyword_detection_uses_word_boundaries() {
        assert_eq!(Department::detect("Chief Engineer"), Some(Department::Engineering));
        assert_eq!(Department::detect("First Mate"), Some(Department::Deck));
        assert_eq!(Department::detect("Estimated crew"), None);
        assert_eq!(EmploymentType::detect("Temperature control"), None);
        assert_eq!(VesselType::detect("45m S/Y Blue"), Some(VesselType::SailingYacht));
        assert_eq!(VesselSize::detect("on a 120ft yacht"), Some(VesselSize::From30To49m));
        assert_eq!(VesselSize::detect("no length given"), None);
    }

    #[test]
    fn labels_round_trip_through_serde() {
        let encoded = serde_json::to_string(&VesselSize::From30To49m).unwrap();
        assert_eq!(encoded, "\"30_49m\"");
        assert_eq!(VesselSize::from_label("30_49m"), VesselSize::From30To49m);
        assert_eq!(Department::from_label("Deck"), Department::Deck);
        assert_eq!(Department::from_label("spa"), Department::Other);
    }

    #[test]
    fn run_summary_error_list_is_bounded() {
        let mut draft = RunSummaryDraft::start("yotspot", 2);
        draft.record_found(5);
        draft.record_created();
        for n in 0..5 {
            draft.record_error(format!("record {n} rejected"));
        }
        let summary = draft.finish(RunStatus::Completed);
        assert_eq!(summary.errors, 5);
        assert_eq!(summary.error_messages.len(), 2);
        assert_eq!(summary.errors_truncated, 3);
        assert!(!summary.is_success());
        assert!(summary.finished_at >= summary.started_at);
    }

    #[test]
    fn identity_record_id_is_stable() {
        let a = IdentityKey::new("daywork123", "dw123_10");
        let b = IdentityKey::new("daywork123", "dw123_10");
        assert_eq!(a.record_id(), b.record_id());
        assert_ne!(a.record_id(), IdentityKey::new("yotspot", "dw123_10").record_id());
        assert_eq!(a.to_string(), "daywork123/dw123_10");
    }
}
