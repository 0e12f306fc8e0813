//! Core event model, timestamp normalization and field cleaning for the quake harvester.
//!
//! Everything in this crate is pure: no filesystem or network access. Storage and
//! reconciliation crates build on the types here so that every component derives the
//! same partition key from the same raw string.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "quake-core";

pub const DATE_TIME_COLUMN: &str = "Date-Time";
pub const LATITUDE_COLUMN: &str = "Latitude";
pub const LONGITUDE_COLUMN: &str = "Longitude";
pub const DEPTH_COLUMN: &str = "Depth";
pub const MAGNITUDE_COLUMN: &str = "Magnitude";
pub const LOCATION_COLUMN: &str = "Location";
pub const SOURCE_FILE_COLUMN: &str = "Source_File";

/// Header row of every monthly partition file, in write order.
pub const PARTITION_HEADER: [&str; 6] = [
    DATE_TIME_COLUMN,
    LATITUDE_COLUMN,
    LONGITUDE_COLUMN,
    DEPTH_COLUMN,
    MAGNITUDE_COLUMN,
    LOCATION_COLUMN,
];

/// Rendering of a canonical instant in merged datasets.
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-row failures. None of these are fatal to a batch; callers count and skip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("unparseable timestamp {raw:?}")]
    UnparseableTimestamp { raw: String },
    #[error("missing required field {field}")]
    MissingRequiredField { field: &'static str },
    #[error("row has {cells} cells, expected at least 6")]
    ShortRow { cells: usize },
}

/// Calendar month a record belongs to; names exactly one partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(instant: &NaiveDateTime) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
        }
    }

    /// `{prefix}_{YYYY}_{MM}.csv`
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{prefix}_{self}.csv")
    }

    /// Inverse of [`PartitionKey::file_name`]; `None` for anything that is not a partition.
    pub fn from_file_name(prefix: &str, file_name: &str) -> Option<Self> {
        let rest = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
        rest.strip_suffix(".csv")?.parse().ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}_{:02}", self.year, self.month)
    }
}

impl FromStr for PartitionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('_')
            .ok_or_else(|| format!("partition key {s:?} is not YYYY_MM"))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(format!("partition key {s:?} is not YYYY_MM"));
        }
        let year: i32 = year.parse().map_err(|_| format!("bad year in {s:?}"))?;
        let month: u32 = month.parse().map_err(|_| format!("bad month in {s:?}"))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in {s:?}"))
    }
}

/// Six string cells as scraped or as stored in a partition file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct RawRow {
    pub timestamp: String,
    pub latitude: String,
    pub longitude: String,
    pub depth: String,
    pub magnitude: String,
    pub location: String,
}

impl RawRow {
    /// Build from page or file cells in `[timestamp, lat, long, depth, magnitude, location]`
    /// order. Extra trailing cells are ignored.
    pub fn from_cells<S: AsRef<str>>(cells: &[S]) -> Result<Self, RecordError> {
        if cells.len() < PARTITION_HEADER.len() {
            return Err(RecordError::ShortRow { cells: cells.len() });
        }
        let cell = |i: usize| cells[i].as_ref().trim().to_string();
        Ok(Self {
            timestamp: cell(0),
            latitude: cell(1),
            longitude: cell(2),
            depth: cell(3),
            magnitude: cell(4),
            location: clean_location(cells[5].as_ref()),
        })
    }

    pub fn cells(&self) -> [&str; 6] {
        [
            &self.timestamp,
            &self.latitude,
            &self.longitude,
            &self.depth,
            &self.magnitude,
            &self.location,
        ]
    }

    pub fn cleaned(mut self) -> Self {
        self.location = clean_location(&self.location);
        self
    }
}

/// One seismic event with its raw cells and the values derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub raw: RawRow,
    pub timestamp: NaiveDateTime,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub depth: Option<f64>,
    pub magnitude: Option<f64>,
    pub source_partition: Option<String>,
}

impl EventRecord {
    /// Clean the row and derive its canonical instant and numeric values.
    ///
    /// Only the timestamp is mandatory here; whether missing numerics disqualify a row
    /// is decided by the caller (see [`EventRecord::ensure_required_fields`]).
    pub fn from_raw(raw: RawRow) -> Result<Self, RecordError> {
        let raw = raw.cleaned();
        let timestamp = parse_timestamp(&raw.timestamp)?;
        Ok(Self {
            latitude: parse_measurement(&raw.latitude),
            longitude: parse_measurement(&raw.longitude),
            depth: parse_measurement(&raw.depth),
            magnitude: parse_measurement(&raw.magnitude),
            timestamp,
            raw,
            source_partition: None,
        })
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::of(&self.timestamp)
    }

    pub fn canonical_timestamp(&self) -> String {
        self.timestamp.format(CANONICAL_FORMAT).to_string()
    }

    /// Latitude, longitude and magnitude must be present in merged datasets; depth may not be.
    pub fn ensure_required_fields(&self) -> Result<(), RecordError> {
        let required = [
            (LATITUDE_COLUMN, self.latitude),
            (LONGITUDE_COLUMN, self.longitude),
            (MAGNITUDE_COLUMN, self.magnitude),
        ];
        for (field, value) in required {
            if value.is_none() {
                return Err(RecordError::MissingRequiredField { field });
            }
        }
        Ok(())
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_partition = Some(source.into());
        self
    }
}

static AM_PM_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*?\b(?:AM|PM)\b)").expect("valid am/pm prefix regex"));
static AM_PM_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(am|pm)\b").expect("valid am/pm word regex"));
static GLUED_AM_PM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d)(am|pm)\b").expect("valid glued am/pm regex"));

/// Shapes observed on the source page over time, tried in order; first match wins.
pub const TIMESTAMP_PATTERNS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d %B %Y - %I:%M %p",
    "%d %b %Y - %I:%M %p",
    "%d %B %Y %I:%M %p",
    "%d %b %Y %I:%M %p",
    "%d %B %Y, %I:%M %p",
    "%d %b %Y, %I:%M %p",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

/// Whitespace, dash and AM/PM cleanup applied before any pattern is tried.
///
/// Anything after the AM/PM marker (typically a timezone abbreviation) is dropped.
pub fn normalize_timestamp_text(raw: &str) -> String {
    let text = raw
        .replace('\u{00A0}', " ")
        .replace(['\u{2012}', '\u{2013}', '\u{2014}', '\u{2212}'], "-");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut text = GLUED_AM_PM.replace_all(&text, "$1 $2").into_owned();
    if let Some(prefix) = AM_PM_PREFIX.captures(&text).and_then(|c| c.get(1)) {
        text = prefix.as_str().to_string();
    }
    AM_PM_WORD
        .replace_all(&text, |caps: &regex::Captures<'_>| caps[1].to_ascii_uppercase())
        .into_owned()
}

/// Parse a raw timestamp into its canonical instant.
///
/// Never falls back to a default date: a string no pattern understands is an error.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, RecordError> {
    let text = normalize_timestamp_text(raw);
    TIMESTAMP_PATTERNS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
        .or_else(|| parse_flexible(&text))
        .ok_or_else(|| RecordError::UnparseableTimestamp {
            raw: raw.to_string(),
        })
}

/// Shapes seen in hand-edited or re-exported masters rather than on the source page.
const LOOSE_PATTERNS: &[&str] = &[
    "%B %d, %Y %I:%M:%S %p",
    "%B %d, %Y %I:%M %p",
    "%B %d %Y %I:%M:%S %p",
    "%B %d %Y %I:%M %p",
    "%B %d, %Y %H:%M:%S",
    "%B %d, %Y %H:%M",
    "%d %B %Y - %I:%M:%S %p",
    "%d %B %Y %I:%M:%S %p",
    "%d %B %Y %H:%M:%S",
    "%d %B %Y %H:%M",
    "%d-%B-%Y %H:%M:%S",
    "%d-%B-%Y %H:%M",
    "%d-%B-%Y %I:%M %p",
    "%Y-%m-%d %I:%M:%S %p",
    "%Y-%m-%d %I:%M %p",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
];

/// Fallback for shapes the page never used: month-first names, `DD-Mon-YYYY`, 12-hour
/// clocks with seconds, then ISO-like text (`/` or `T` separators, fractions, offsets,
/// bare dates). Offsets are discarded; the wall-clock time as written is kept.
fn parse_flexible(text: &str) -> Option<NaiveDateTime> {
    // %B also accepts the three-letter abbreviation when parsing.
    if let Some(dt) = LOOSE_PATTERNS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
    {
        return Some(dt);
    }

    let mut text = text.replace('/', "-").replace('T', " ");
    if let Some(stripped) = text.strip_suffix('Z') {
        text = format!("{stripped}+00:00");
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M%:z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(&text, fmt) {
            return Some(dt.naive_local());
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&text, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn partition_key_for(raw: &str) -> Result<PartitionKey, RecordError> {
    parse_timestamp(raw).map(|ts| PartitionKey::of(&ts))
}

/// Collapse every whitespace run, embedded newlines included, to one space.
pub fn clean_location(location: &str) -> String {
    location.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decimal coercion that marks bad input as missing instead of failing.
pub fn parse_measurement(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn format_measurement(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
