//! Core domain model for the PLS collector: survey datasets, canonical library
//! and outlet records, the library configuration singleton, and alias-based
//! field resolution over raw survey rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pls-core";

/// Natural key of an administrative library entity, stable across survey years.
pub const LIBRARY_KEY_COLUMN: &str = "FSCSKEY";

/// Outlet sequence column, scoped within a library.
pub const OUTLET_SEQ_COLUMN: &str = "FSCS_SEQ";

/// Earliest survey year the portal publishes.
pub const FIRST_SURVEY_YEAR: i32 = 1992;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown dataset status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for DatasetStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One survey year's collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub year: i32,
    pub status: DatasetStatus,
    pub record_count: Option<i64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status row surfaced to callers of `get_collection_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearStatus {
    pub status: DatasetStatus,
    pub record_count: Option<i64>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Dataset> for YearStatus {
    fn from(dataset: &Dataset) -> Self {
        Self {
            status: dataset.status,
            record_count: dataset.record_count,
            notes: dataset.notes.clone(),
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
        }
    }
}

/// Canonical administrative-entity record for one survey year.
///
/// Every statistic is optional: `None` means the survey did not report a
/// usable value, which is distinct from a reported zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub library_id: String,

    // identity / location
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub county: Option<String>,
    pub phone: Option<String>,
    pub locale: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub population_lsa: Option<i64>,
    pub central_libraries: Option<i64>,
    pub branch_libraries: Option<i64>,
    pub bookmobiles: Option<i64>,

    // collections
    pub print_volumes: Option<i64>,
    pub ebook_volumes: Option<i64>,
    pub audio_physical: Option<i64>,
    pub audio_digital: Option<i64>,
    pub video_physical: Option<i64>,
    pub video_digital: Option<i64>,
    pub databases: Option<i64>,

    // usage
    pub total_circulation: Option<i64>,
    pub kids_circulation: Option<i64>,
    pub physical_circulation: Option<i64>,
    pub electronic_circulation: Option<i64>,
    pub visits: Option<i64>,
    pub reference_transactions: Option<i64>,
    pub registered_users: Option<i64>,
    pub hours_open: Option<i64>,
    pub public_computers: Option<i64>,
    pub computer_sessions: Option<i64>,
    pub wifi_sessions: Option<i64>,
    pub website_visits: Option<i64>,

    // programs
    pub total_programs: Option<i64>,
    pub kids_programs: Option<i64>,
    pub ya_programs: Option<i64>,
    pub program_attendance: Option<i64>,
    pub kids_program_attendance: Option<i64>,
    pub ya_program_attendance: Option<i64>,

    // staffing (FTE)
    pub mls_librarians: Option<f64>,
    pub librarians: Option<f64>,
    pub other_staff: Option<f64>,
    pub total_staff: Option<f64>,

    // financials
    pub local_revenue: Option<f64>,
    pub state_revenue: Option<f64>,
    pub federal_revenue: Option<f64>,
    pub other_revenue: Option<f64>,
    pub total_revenue: Option<f64>,
    pub salaries: Option<f64>,
    pub benefits: Option<f64>,
    pub total_staff_expenditures: Option<f64>,
    pub print_expenditures: Option<f64>,
    pub electronic_expenditures: Option<f64>,
    pub other_collection_expenditures: Option<f64>,
    pub total_collection_expenditures: Option<f64>,
    pub other_operating_expenditures: Option<f64>,
    pub total_operating_expenditures: Option<f64>,
    pub capital_revenue: Option<f64>,
    pub capital_expenditures: Option<f64>,
}

/// Canonical physical branch/outlet record for one survey year.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutletRecord {
    pub library_id: String,
    pub outlet_id: String,
    pub name: Option<String>,
    pub outlet_type: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub county: Option<String>,
    pub phone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub square_feet: Option<i64>,
    pub hours_per_year: Option<i64>,
    pub weeks_open: Option<i64>,
    pub hours_per_week: Option<f64>,
    pub bookmobiles: Option<i64>,
}

fn enabled() -> bool {
    true
}

/// Singleton configuration narrowing collection to one home library (plus the
/// comparison libraries tracked alongside it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub library_id: String,
    #[serde(default)]
    pub comparison_library_ids: Vec<String>,
    #[serde(default = "enabled")]
    pub collection_enabled: bool,
    #[serde(default = "enabled")]
    pub usage_enabled: bool,
    #[serde(default = "enabled")]
    pub program_enabled: bool,
    #[serde(default = "enabled")]
    pub staff_enabled: bool,
    #[serde(default = "enabled")]
    pub financial_enabled: bool,
    #[serde(default)]
    pub collection_metrics: BTreeMap<String, bool>,
    #[serde(default)]
    pub usage_metrics: BTreeMap<String, bool>,
    #[serde(default)]
    pub program_metrics: BTreeMap<String, bool>,
    #[serde(default)]
    pub staff_metrics: BTreeMap<String, bool>,
    #[serde(default)]
    pub financial_metrics: BTreeMap<String, bool>,
    #[serde(default)]
    pub auto_update_enabled: bool,
    /// Last survey year successfully ingested.
    #[serde(default)]
    pub last_update_check: Option<i32>,
}

impl LibraryConfig {
    pub fn new(library_id: impl Into<String>) -> Self {
        Self {
            library_id: library_id.into(),
            comparison_library_ids: Vec::new(),
            collection_enabled: true,
            usage_enabled: true,
            program_enabled: true,
            staff_enabled: true,
            financial_enabled: true,
            collection_metrics: BTreeMap::new(),
            usage_metrics: BTreeMap::new(),
            program_metrics: BTreeMap::new(),
            staff_metrics: BTreeMap::new(),
            financial_metrics: BTreeMap::new(),
            auto_update_enabled: false,
            last_update_check: None,
        }
    }

    pub fn scope(&self) -> CollectionScope {
        let mut ids = BTreeSet::new();
        ids.insert(normalize_library_id(&self.library_id));
        ids.extend(
            self.comparison_library_ids
                .iter()
                .map(|id| normalize_library_id(id))
                .filter(|id| !id.is_empty()),
        );
        CollectionScope {
            home_library_id: normalize_library_id(&self.library_id),
            library_ids: ids,
        }
    }

    /// Whether loading `year` should move the ingest checkpoint forward.
    pub fn checkpoint_advances_to(&self, year: i32) -> bool {
        self.last_update_check.map_or(true, |last| year > last)
    }
}

/// Explicit narrowing of a collection run to a set of libraries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionScope {
    pub home_library_id: String,
    pub library_ids: BTreeSet<String>,
}

impl CollectionScope {
    pub fn single(library_id: &str) -> Self {
        let id = normalize_library_id(library_id);
        Self {
            home_library_id: id.clone(),
            library_ids: BTreeSet::from([id]),
        }
    }

    pub fn includes(&self, library_id: &str) -> bool {
        self.library_ids.contains(&normalize_library_id(library_id))
    }
}

pub fn normalize_library_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// One raw survey row keyed by upper-cased column name.
pub type RawRecord = BTreeMap<String, String>;

/// Returns the value of the first alias present with a non-blank value.
///
/// Alias lists are ordered newest/most-specific column name first; the
/// survey renames fields between years.
pub fn resolve_field<'a>(record: &'a RawRecord, aliases: &[&str]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        record
            .get(*alias)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    })
}

pub fn resolve_text(record: &RawRecord, aliases: &[&str]) -> Option<String> {
    resolve_field(record, aliases).map(ToString::to_string)
}

/// Integer count; unparseable values and negative suppression codes are absent.
pub fn resolve_count(record: &RawRecord, aliases: &[&str]) -> Option<i64> {
    resolve_field(record, aliases).and_then(parse_count)
}

/// Currency or FTE amount; unparseable values and negative suppression codes are absent.
pub fn resolve_amount(record: &RawRecord, aliases: &[&str]) -> Option<f64> {
    resolve_field(record, aliases).and_then(parse_amount)
}

/// Signed decimal value such as a longitude.
pub fn resolve_coordinate(record: &RawRecord, aliases: &[&str]) -> Option<f64> {
    resolve_field(record, aliases)
        .and_then(parse_decimal)
        .filter(|v| v.is_finite())
}

fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '$')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

pub fn parse_count(raw: &str) -> Option<i64> {
    let value = parse_decimal(raw)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value as i64)
}

pub fn parse_amount(raw: &str) -> Option<f64> {
    parse_decimal(raw).filter(|v| v.is_finite() && *v >= 0.0)
}
