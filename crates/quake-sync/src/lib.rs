//! Partition routing, deduplication and master/partition reconciliation.
//!
//! Three paths share the canonical partition key from `quake-core`:
//! - [`Router`] appends freshly scraped rows to monthly partitions (strict raw-timestamp dedup),
//! - [`combine`] merges partitions into one master dataset (full-row then semantic dedup),
//! - [`split_master`] re-derives monthly partitions for one year from a master dataset.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use parquet::arrow::ArrowWriter;
use quake_adapters::{source_for, AdapterContext, EventSource};
use quake_core::{
    format_measurement, EventRecord, PartitionKey, RawRow, RecordError, DATE_TIME_COLUMN, DEPTH_COLUMN,
    LATITUDE_COLUMN, LOCATION_COLUMN, LONGITUDE_COLUMN, MAGNITUDE_COLUMN, PARTITION_HEADER,
    SOURCE_FILE_COLUMN,
};
use quake_storage::{
    write_csv_atomic, BackoffPolicy, CsvTable, HttpClientConfig, HttpFetcher, LockPolicy,
    PageArchive, PartitionGuard, PartitionStats, PartitionStore, StoreError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quake-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuakeConfig {
    pub source_id: String,
    pub source_url: String,
    pub data_dir: PathBuf,
    pub partition_prefix: String,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub accept_invalid_certs: bool,
    pub lock_timeout_secs: u64,
    pub lock_stale_secs: u64,
    pub schedule_cron: String,
}

impl Default for QuakeConfig {
    fn default() -> Self {
        Self {
            source_id: quake_adapters::PHIVOLCS_SOURCE_ID.to_string(),
            source_url: quake_adapters::PHIVOLCS_LATEST_URL.to_string(),
            data_dir: PathBuf::from("."),
            partition_prefix: "phivolcs_earthquakes".to_string(),
            archive_dir: None,
            user_agent: "quake-harvest/0.1".to_string(),
            http_timeout_secs: 15,
            http_max_retries: 2,
            accept_invalid_certs: false,
            lock_timeout_secs: 30,
            lock_stale_secs: 600,
            schedule_cron: "0 */10 * * * *".to_string(),
        }
    }
}

impl QuakeConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Optional YAML file first, then `QUAKE_*` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(v) = lookup("QUAKE_SOURCE_ID") {
            self.source_id = v;
        }
        if let Some(v) = lookup("QUAKE_SOURCE_URL") {
            self.source_url = v;
        }
        if let Some(v) = lookup("QUAKE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUAKE_PARTITION_PREFIX") {
            self.partition_prefix = v;
        }
        if let Some(v) = lookup("QUAKE_ARCHIVE_DIR") {
            self.archive_dir = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("QUAKE_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = parsed("QUAKE_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v;
        }
        if let Some(v) = parsed("QUAKE_HTTP_MAX_RETRIES") {
            self.http_max_retries = v as usize;
        }
        if let Some(v) = lookup("QUAKE_ACCEPT_INVALID_CERTS") {
            self.accept_invalid_certs = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = parsed("QUAKE_LOCK_TIMEOUT_SECS") {
            self.lock_timeout_secs = v;
        }
        if let Some(v) = parsed("QUAKE_LOCK_STALE_SECS") {
            self.lock_stale_secs = v;
        }
        if let Some(v) = lookup("QUAKE_SCHEDULE_CRON") {
            self.schedule_cron = v;
        }
        self
    }

    pub fn partition_store(&self) -> PartitionStore {
        PartitionStore::new(self.data_dir.clone(), self.partition_prefix.clone()).with_lock_policy(
            LockPolicy {
                timeout: Duration::from_secs(self.lock_timeout_secs),
                stale_after: Duration::from_secs(self.lock_stale_secs),
                ..LockPolicy::default()
            },
        )
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs: self.accept_invalid_certs,
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Identity of a record for one deduplication strategy.
///
/// The incremental path and the merge path deliberately use different identities; each is
/// a named implementation so call sites state which one they rely on.
pub trait DuplicateKey {
    type Key: Eq + Hash;

    fn name(&self) -> &'static str;
    fn key(&self, record: &EventRecord) -> Self::Key;
}

/// Exact raw timestamp string. Two renderings of the same instant are distinct records.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTimestampKey;

impl DuplicateKey for RawTimestampKey {
    type Key = String;

    fn name(&self) -> &'static str {
        "raw-timestamp"
    }

    fn key(&self, record: &EventRecord) -> String {
        record.raw.timestamp.clone()
    }
}

/// Every cleaned cell as written, provenance excluded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullRowKey;

impl DuplicateKey for FullRowKey {
    type Key = RawRow;

    fn name(&self) -> &'static str {
        "full-row"
    }

    fn key(&self, record: &EventRecord) -> RawRow {
        record.raw.clone()
    }
}

pub type SemanticIdentity = (NaiveDateTime, Option<u64>, Option<u64>, Option<u64>);

/// (canonical instant, latitude, longitude, magnitude) by value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticKey;

impl DuplicateKey for SemanticKey {
    type Key = SemanticIdentity;

    fn name(&self) -> &'static str {
        "semantic"
    }

    fn key(&self, record: &EventRecord) -> SemanticIdentity {
        (
            record.timestamp,
            value_bits(record.latitude),
            value_bits(record.longitude),
            value_bits(record.magnitude),
        )
    }
}

fn value_bits(value: Option<f64>) -> Option<u64> {
    // -0.0 and 0.0 compare equal but have different bit patterns.
    value.map(|v| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
}

/// Keep-first filter over one strategy's keys.
pub struct DedupFilter<K: DuplicateKey> {
    strategy: K,
    seen: HashSet<K::Key>,
    rejected: usize,
}

impl<K: DuplicateKey> DedupFilter<K> {
    pub fn new(strategy: K) -> Self {
        Self {
            strategy,
            seen: HashSet::new(),
            rejected: 0,
        }
    }

    /// Start from keys that are already recorded elsewhere (e.g. on disk).
    pub fn seeded(strategy: K, keys: impl IntoIterator<Item = K::Key>) -> Self {
        Self {
            seen: keys.into_iter().collect(),
            ..Self::new(strategy)
        }
    }

    pub fn admit(&mut self, record: &EventRecord) -> bool {
        if self.seen.insert(self.strategy.key(record)) {
            true
        } else {
            self.rejected += 1;
            false
        }
    }

    pub fn retain(&mut self, records: Vec<EventRecord>) -> Vec<EventRecord> {
        records.into_iter().filter(|r| self.admit(r)).collect()
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub created: bool,
    pub appended: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionFailure {
    pub key: PartitionKey,
    pub error: String,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteReport {
    pub rows_seen: usize,
    pub unparseable: usize,
    pub duplicates: usize,
    pub appended: usize,
    pub partitions: Vec<PartitionOutcome>,
    pub failed_partitions: Vec<PartitionFailure>,
}

/// Assigns scraped rows to monthly partitions and appends the ones not yet recorded.
pub struct Router<'a> {
    store: &'a PartitionStore,
}

impl<'a> Router<'a> {
    pub fn new(store: &'a PartitionStore) -> Self {
        Self { store }
    }

    /// Never fails as a whole: bad rows and failing partitions are counted in the report.
    /// Re-running with the same rows appends nothing.
    pub fn route(&self, rows: impl IntoIterator<Item = RawRow>) -> RouteReport {
        let mut report = RouteReport::default();
        let mut by_partition: BTreeMap<PartitionKey, Vec<EventRecord>> = BTreeMap::new();

        for raw in rows {
            report.rows_seen += 1;
            match EventRecord::from_raw(raw) {
                Ok(record) => by_partition
                    .entry(record.partition_key())
                    .or_default()
                    .push(record),
                Err(err) => {
                    warn!(error = %err, "dropping row");
                    report.unparseable += 1;
                }
            }
        }

        for (key, records) in by_partition {
            let incoming = records.len();
            match self.route_partition(key, records) {
                Ok(outcome) => {
                    report.duplicates += outcome.duplicates;
                    report.appended += outcome.appended;
                    report.partitions.push(outcome);
                }
                Err(err) => {
                    warn!(partition = %key, error = %err, "partition write failed; rows will be retried next run");
                    report.failed_partitions.push(PartitionFailure {
                        key,
                        error: err.to_string(),
                        dropped_rows: incoming,
                    });
                }
            }
        }

        report
    }

    fn route_partition(
        &self,
        key: PartitionKey,
        records: Vec<EventRecord>,
    ) -> Result<PartitionOutcome, StoreError> {
        let guard = self.store.lock(key)?;
        let mut filter = DedupFilter::seeded(RawTimestampKey, guard.existing_timestamps()?);
        let fresh = filter
            .retain(records)
            .into_iter()
            .map(|record| record.raw)
            .collect::<Vec<_>>();
        let duplicates = filter.rejected();

        if fresh.is_empty() {
            info!(partition = %key, "no new earthquakes");
            return Ok(PartitionOutcome {
                key,
                path: guard.path().to_path_buf(),
                created: false,
                appended: 0,
                duplicates,
            });
        }

        let appended = guard.append(&fresh)?;
        info!(partition = %key, added = appended.appended, "appended records");
        Ok(PartitionOutcome {
            key,
            path: appended.path,
            created: appended.created,
            appended: appended.appended,
            duplicates,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFileStatus {
    Loaded,
    Missing,
    Unreadable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFileReport {
    pub path: PathBuf,
    pub status: SourceFileStatus,
    pub error: Option<String>,
    pub rows_read: usize,
    pub malformed: usize,
    pub unparseable: usize,
    pub missing_required: usize,
    pub kept: usize,
}

impl SourceFileReport {
    fn skipped(path: &Path, status: SourceFileStatus, err: &StoreError) -> Self {
        Self {
            path: path.to_path_buf(),
            status,
            error: Some(err.to_string()),
            rows_read: 0,
            malformed: 0,
            unparseable: 0,
            missing_required: 0,
            kept: 0,
        }
    }
}

/// Half-open magnitude classes; the last one is unbounded.
pub const MAGNITUDE_BUCKETS: [(&str, f64, Option<f64>); 5] = [
    ("Micro (0-1)", 0.0, Some(1.0)),
    ("Minor (1-3)", 1.0, Some(3.0)),
    ("Light (3-5)", 3.0, Some(5.0)),
    ("Moderate (5-7)", 5.0, Some(7.0)),
    ("Strong (7+)", 7.0, None),
];

#[derive(Debug, Clone, Serialize)]
pub struct MagnitudeBucketCount {
    pub label: &'static str,
    pub lower: f64,
    pub upper: Option<f64>,
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub total_records: usize,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
    pub magnitude_range: Option<(f64, f64)>,
    pub depth_range: Option<(f64, f64)>,
    pub missing_depth: usize,
    pub per_source: BTreeMap<String, usize>,
    pub magnitude_histogram: Vec<MagnitudeBucketCount>,
    pub per_month: BTreeMap<String, usize>,
}

fn widen(range: Option<(f64, f64)>, value: f64) -> Option<(f64, f64)> {
    Some(match range {
        Some((lo, hi)) => (lo.min(value), hi.max(value)),
        None => (value, value),
    })
}

impl DatasetSummary {
    pub fn from_records(records: &[EventRecord]) -> Self {
        let mut earliest: Option<NaiveDateTime> = None;
        let mut latest: Option<NaiveDateTime> = None;
        let mut magnitude_range = None;
        let mut depth_range = None;
        let mut missing_depth = 0usize;
        let mut per_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut per_month: BTreeMap<String, usize> = BTreeMap::new();
        let mut bucket_counts = [0usize; MAGNITUDE_BUCKETS.len()];

        for record in records {
            earliest = Some(earliest.map_or(record.timestamp, |e| e.min(record.timestamp)));
            latest = Some(latest.map_or(record.timestamp, |l| l.max(record.timestamp)));
            match record.depth {
                Some(depth) => depth_range = widen(depth_range, depth),
                None => missing_depth += 1,
            }
            if let Some(magnitude) = record.magnitude {
                magnitude_range = widen(magnitude_range, magnitude);
                if let Some(i) = MAGNITUDE_BUCKETS.iter().position(|(_, lo, hi)| {
                    magnitude >= *lo && hi.map_or(true, |hi| magnitude < hi)
                }) {
                    bucket_counts[i] += 1;
                }
            }
            let source = record
                .source_partition
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *per_source.entry(source).or_default() += 1;
            *per_month
                .entry(record.timestamp.format("%Y-%m").to_string())
                .or_default() += 1;
        }

        let total = records.len();
        let magnitude_histogram = MAGNITUDE_BUCKETS
            .iter()
            .zip(bucket_counts)
            .map(|((label, lower, upper), count)| MagnitudeBucketCount {
                label: *label,
                lower: *lower,
                upper: *upper,
                count,
                percent: if total == 0 {
                    0.0
                } else {
                    count as f64 * 100.0 / total as f64
                },
            })
            .collect();

        Self {
            total_records: total,
            earliest,
            latest,
            magnitude_range,
            depth_range,
            missing_depth,
            per_source,
            magnitude_histogram,
            per_month,
        }
    }
}

/// Result of deduplicating a concatenated record list, newest first.
#[derive(Debug, Clone)]
pub struct MergedDataset {
    pub records: Vec<EventRecord>,
    pub full_row_duplicates: usize,
    pub semantic_duplicates: usize,
}

impl MergedDataset {
    pub fn duplicates_removed(&self) -> usize {
        self.full_row_duplicates + self.semantic_duplicates
    }
}

/// Full-row dedup, then semantic dedup, both keep-first in input order; then sort newest first.
pub fn merge_records(records: Vec<EventRecord>) -> MergedDataset {
    let mut full_row = DedupFilter::new(FullRowKey);
    let mut semantic = DedupFilter::new(SemanticKey);
    let records = full_row.retain(records);
    let mut records = semantic.retain(records);
    // Stable: ties keep input order.
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    MergedDataset {
        records,
        full_row_duplicates: full_row.rejected(),
        semantic_duplicates: semantic.rejected(),
    }
}

#[derive(Debug, Clone)]
pub struct CombineRequest {
    /// Processed in this order; it decides which duplicate is kept.
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub output_prefix: String,
    pub label: Option<String>,
    pub generated_at: NaiveDateTime,
    pub parquet: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombineReport {
    pub output_path: PathBuf,
    pub summary_path: PathBuf,
    pub parquet_manifest: Option<PathBuf>,
    pub files: Vec<SourceFileReport>,
    pub skipped_files: usize,
    pub rows_before_dedup: usize,
    pub full_row_duplicates: usize,
    pub semantic_duplicates: usize,
    pub duplicates_removed: usize,
    pub summary: DatasetSummary,
}

/// Partition files in `store`, oldest first, optionally restricted to one year.
pub fn discover_partitions(store: &PartitionStore, year: Option<i32>) -> Result<Vec<PathBuf>> {
    Ok(store
        .list_partitions()
        .with_context(|| format!("listing partitions in {}", store.root().display()))?
        .into_iter()
        .filter(|(key, _)| year.map_or(true, |y| key.year == y))
        .map(|(_, path)| path)
        .collect())
}

/// `{prefix}_complete[_{label}]_{YYYYmmdd_HHMM}.csv`, suffixed `_N` rather than overwriting.
pub fn merged_output_path(
    dir: &Path,
    prefix: &str,
    label: Option<&str>,
    generated_at: NaiveDateTime,
) -> PathBuf {
    let stamp = generated_at.format("%Y%m%d_%H%M");
    let stem = match label {
        Some(label) => format!("{prefix}_complete_{label}_{stamp}"),
        None => format!("{prefix}_complete_{stamp}"),
    };
    let mut candidate = dir.join(format!("{stem}.csv"));
    let mut n = 2;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_{n}.csv"));
        n += 1;
    }
    candidate
}

fn load_source_file(path: &Path) -> Result<(Vec<EventRecord>, SourceFileReport), StoreError> {
    let table = CsvTable::read(path)?;
    let date_col = Some(table.require_date_column()?);
    let lat_col = Some(table.require_column(LATITUDE_COLUMN)?);
    let lon_col = Some(table.require_column(LONGITUDE_COLUMN)?);
    let mag_col = Some(table.require_column(MAGNITUDE_COLUMN)?);
    let depth_col = table.column(DEPTH_COLUMN);
    let location_col = table.column(LOCATION_COLUMN);
    let source_col = table.column(SOURCE_FILE_COLUMN);
    let file_label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut report = SourceFileReport {
        path: path.to_path_buf(),
        status: SourceFileStatus::Loaded,
        error: None,
        rows_read: table.rows.len(),
        malformed: table.malformed,
        unparseable: 0,
        missing_required: 0,
        kept: 0,
    };
    let mut records = Vec::with_capacity(table.rows.len());

    for row in &table.rows {
        let cell = |col| CsvTable::cell(row, col).trim().to_string();
        let raw = RawRow {
            timestamp: cell(date_col),
            latitude: cell(lat_col),
            longitude: cell(lon_col),
            depth: cell(depth_col),
            magnitude: cell(mag_col),
            location: cell(location_col),
        };
        let record = match EventRecord::from_raw(raw) {
            Ok(record) => record,
            Err(err) => {
                debug!(file = %file_label, error = %err, "could not parse datetime");
                report.unparseable += 1;
                continue;
            }
        };
        if let Err(RecordError::MissingRequiredField { field }) = record.ensure_required_fields() {
            debug!(file = %file_label, field, "row missing required field");
            report.missing_required += 1;
            continue;
        }
        let source = Some(cell(source_col))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| file_label.clone());
        records.push(record.with_source(source));
    }

    report.kept = records.len();
    if report.unparseable > 0 {
        warn!(file = %file_label, rows = report.unparseable, "dropped rows with unparseable timestamps");
    }
    if report.missing_required > 0 {
        warn!(file = %file_label, rows = report.missing_required, "dropped rows with invalid coordinates or magnitude");
    }
    Ok((records, report))
}

fn master_row(record: &EventRecord) -> [String; 7] {
    [
        record.canonical_timestamp(),
        format_measurement(record.latitude),
        format_measurement(record.longitude),
        format_measurement(record.depth),
        format_measurement(record.magnitude),
        record.raw.location.clone(),
        record.source_partition.clone().unwrap_or_default(),
    ]
}

/// Merge partition (or master) files into one new master dataset plus a JSON summary.
///
/// Missing or unreadable inputs are skipped; the call fails only if no input could be read.
pub fn combine(request: &CombineRequest) -> Result<CombineReport> {
    if request.inputs.is_empty() {
        bail!("no input files to combine");
    }

    let mut files = Vec::with_capacity(request.inputs.len());
    let mut all_records = Vec::new();
    for path in &request.inputs {
        match load_source_file(path) {
            Ok((records, report)) => {
                info!(file = %path.display(), kept = report.kept, "loaded source file");
                all_records.extend(records);
                files.push(report);
            }
            Err(err @ StoreError::SourceFileMissing { .. }) => {
                warn!(file = %path.display(), "skipping missing source file");
                files.push(SourceFileReport::skipped(path, SourceFileStatus::Missing, &err));
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping unreadable source file");
                files.push(SourceFileReport::skipped(path, SourceFileStatus::Unreadable, &err));
            }
        }
    }

    let skipped_files = files
        .iter()
        .filter(|f| f.status != SourceFileStatus::Loaded)
        .count();
    if skipped_files == files.len() {
        bail!("none of the {} input files could be loaded", files.len());
    }

    let rows_before_dedup = all_records.len();
    let merged = merge_records(all_records);
    info!(
        before = rows_before_dedup,
        removed = merged.duplicates_removed(),
        unique = merged.records.len(),
        "deduplicated combined records"
    );

    let output_path = merged_output_path(
        &request.output_dir,
        &request.output_prefix,
        request.label.as_deref(),
        request.generated_at,
    );
    let mut header = PARTITION_HEADER.to_vec();
    header.push(SOURCE_FILE_COLUMN);
    write_csv_atomic(&output_path, &header, merged.records.iter().map(master_row))
        .with_context(|| format!("writing {}", output_path.display()))?;

    let parquet_manifest = if request.parquet {
        Some(export_parquet_snapshot(&merged.records, &output_path.with_extension("parquet"))?)
    } else {
        None
    };

    let report = CombineReport {
        summary_path: output_path.with_extension("summary.json"),
        output_path,
        parquet_manifest,
        files,
        skipped_files,
        rows_before_dedup,
        full_row_duplicates: merged.full_row_duplicates,
        semantic_duplicates: merged.semantic_duplicates,
        duplicates_removed: merged.duplicates_removed(),
        summary: DatasetSummary::from_records(&merged.records),
    };
    let json = serde_json::to_vec_pretty(&report).context("serializing combine summary")?;
    std::fs::write(&report.summary_path, json)
        .with_context(|| format!("writing {}", report.summary_path.display()))?;

    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitFile {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub rows: usize,
    /// Rows already in the partition but absent from the master, kept in the rewrite.
    pub carried_over: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub master: PathBuf,
    pub year: i32,
    pub rows_read: usize,
    pub malformed: usize,
    pub unparseable: usize,
    pub other_years: usize,
    pub matched: usize,
    pub carried_over: usize,
    pub columns: Vec<String>,
    pub files: Vec<SplitFile>,
    pub failed_partitions: Vec<PartitionFailure>,
}

/// Rewrite the monthly partitions of `year` from a master dataset.
///
/// Fails only when the master is missing or has no date-like column. Rows whose timestamp
/// does not parse are dropped; if no row falls in `year`, nothing is written.
pub fn split_master(
    master: &Path,
    year: i32,
    store: &PartitionStore,
) -> Result<SplitReport, StoreError> {
    let table = CsvTable::read(master)?;
    let date_col = table.require_date_column()?;

    // The detected date column is always written under the partition's own header name.
    let columns = PARTITION_HEADER
        .iter()
        .filter_map(|name| {
            let index = if *name == DATE_TIME_COLUMN {
                Some(date_col)
            } else {
                table.column(name)
            };
            index.map(|i| (*name, i))
        })
        .collect::<Vec<_>>();

    let mut report = SplitReport {
        master: master.to_path_buf(),
        year,
        rows_read: table.rows.len(),
        malformed: table.malformed,
        unparseable: 0,
        other_years: 0,
        matched: 0,
        carried_over: 0,
        columns: columns.iter().map(|(name, _)| name.to_string()).collect(),
        files: Vec::new(),
        failed_partitions: Vec::new(),
    };

    let master_column = |name: &str| columns.iter().find(|(n, _)| *n == name).map(|(_, i)| *i);
    let mut dated = Vec::new();
    for row in &table.rows {
        let raw = raw_row_from(row, master_column);
        match quake_core::parse_timestamp(&raw.timestamp) {
            Ok(ts) if PartitionKey::of(&ts).year == year => dated.push((ts, raw)),
            Ok(_) => report.other_years += 1,
            Err(_) => report.unparseable += 1,
        }
    }
    if report.unparseable > 0 {
        warn!(master = %master.display(), rows = report.unparseable, "dropped rows with unparseable timestamps");
    }
    report.matched = dated.len();
    if dated.is_empty() {
        info!(master = %master.display(), year, "no rows for year in master; nothing to write");
        return Ok(report);
    }

    dated.sort_by_key(|(ts, _)| *ts);
    let mut by_partition: BTreeMap<PartitionKey, Vec<(NaiveDateTime, RawRow)>> = BTreeMap::new();
    for (ts, raw) in dated {
        by_partition.entry(PartitionKey::of(&ts)).or_default().push((ts, raw));
    }

    let header = columns.iter().map(|(name, _)| *name).collect::<Vec<_>>();
    for (key, rows) in by_partition {
        let from_master = rows.len();
        let written = store.lock(key).and_then(|guard| {
            let counts = rewrite_partition(&guard, &header, rows)?;
            Ok((guard.path().to_path_buf(), counts))
        });
        match written {
            Ok((path, (rows, carried_over))) => {
                if carried_over > 0 {
                    warn!(
                        partition = %key,
                        rows = carried_over,
                        "partition held rows missing from the master; kept them"
                    );
                }
                info!(partition = %key, rows, "wrote monthly partition");
                report.carried_over += carried_over;
                report.files.push(SplitFile {
                    key,
                    path,
                    rows,
                    carried_over,
                });
            }
            Err(err) => {
                warn!(partition = %key, error = %err, "failed to write monthly partition");
                report.failed_partitions.push(PartitionFailure {
                    key,
                    error: err.to_string(),
                    dropped_rows: from_master,
                });
            }
        }
    }

    Ok(report)
}

fn raw_row_from(row: &csv::StringRecord, column: impl Fn(&str) -> Option<usize>) -> RawRow {
    let cell = |name: &str| CsvTable::cell(row, column(name)).trim().to_string();
    RawRow {
        timestamp: cell(DATE_TIME_COLUMN),
        latitude: cell(LATITUDE_COLUMN),
        longitude: cell(LONGITUDE_COLUMN),
        depth: cell(DEPTH_COLUMN),
        magnitude: cell(MAGNITUDE_COLUMN),
        location: cell(LOCATION_COLUMN),
    }
}

fn partition_field<'r>(raw: &'r RawRow, name: &str) -> &'r str {
    PARTITION_HEADER
        .iter()
        .position(|h| *h == name)
        .map_or("", |i| raw.cells()[i])
}

fn semantic_identity(raw: &RawRow) -> Option<SemanticIdentity> {
    EventRecord::from_raw(raw.clone())
        .ok()
        .map(|record| SemanticKey.key(&record))
}

/// Replace one partition with the master's rows for that month, keeping any event the
/// partition already holds that the master lacks (e.g. appended after the master was built).
///
/// Returns (rows written, rows carried over). Must run under the partition's lock.
fn rewrite_partition(
    guard: &PartitionGuard<'_>,
    header: &[&str],
    mut rows: Vec<(NaiveDateTime, RawRow)>,
) -> Result<(usize, usize), StoreError> {
    let mut undated = Vec::new();
    let mut carried_over = 0;
    if guard.path().exists() {
        let existing = CsvTable::read(guard.path())?;
        let existing_column = |name: &str| {
            if name == DATE_TIME_COLUMN {
                existing.column(name).or_else(|| existing.date_column())
            } else {
                existing.column(name)
            }
        };
        let mut known = rows
            .iter()
            .filter_map(|(_, raw)| semantic_identity(raw))
            .collect::<HashSet<_>>();
        for row in &existing.rows {
            let raw = raw_row_from(row, existing_column);
            match EventRecord::from_raw(raw.clone()) {
                Ok(record) => {
                    if known.insert(SemanticKey.key(&record)) {
                        rows.push((record.timestamp, raw));
                        carried_over += 1;
                    }
                }
                Err(_) => undated.push(raw),
            }
        }
        carried_over += undated.len();
    }
    // Stable, so on equal instants master rows stay ahead of carried-over ones.
    rows.sort_by_key(|(ts, _)| *ts);

    let written = rows.len() + undated.len();
    guard.replace(
        header,
        rows.iter()
            .map(|(_, raw)| raw)
            .chain(undated.iter())
            .map(|raw| {
                header
                    .iter()
                    .map(|name| partition_field(raw, name))
                    .collect::<Vec<_>>()
            }),
    )?;
    Ok((written, carried_over))
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Columnar copy of a merged dataset for bulk analysis, with a sha256 manifest beside it.
/// Returns the manifest path.
pub fn export_parquet_snapshot(records: &[EventRecord], path: &Path) -> Result<PathBuf> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date_time", DataType::Utf8, false),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("depth", DataType::Float64, true),
        ArrowField::new("magnitude", DataType::Float64, true),
        ArrowField::new("location", DataType::Utf8, false),
        ArrowField::new("source_file", DataType::Utf8, true),
    ]));

    let timestamps = StringArray::from(
        records
            .iter()
            .map(EventRecord::canonical_timestamp)
            .collect::<Vec<_>>(),
    );
    let latitudes = Float64Array::from(records.iter().map(|r| r.latitude).collect::<Vec<_>>());
    let longitudes = Float64Array::from(records.iter().map(|r| r.longitude).collect::<Vec<_>>());
    let depths = Float64Array::from(records.iter().map(|r| r.depth).collect::<Vec<_>>());
    let magnitudes = Float64Array::from(records.iter().map(|r| r.magnitude).collect::<Vec<_>>());
    let locations = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.raw.location.as_str()))
            .collect::<Vec<_>>(),
    );
    let sources = StringArray::from(
        records
            .iter()
            .map(|r| r.source_partition.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(timestamps),
            Arc::new(latitudes),
            Arc::new(longitudes),
            Arc::new(depths),
            Arc::new(magnitudes),
            Arc::new(locations),
            Arc::new(sources),
        ],
    )
    .context("building events record batch")?;
    write_parquet(path, batch)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("events", dir, path, records.len())?],
    };
    let manifest_path = path.with_extension("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Completed,
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub source_url: String,
    pub status: IngestStatus,
    pub rows_scraped: usize,
    pub short_rows: usize,
    pub archived_page: Option<PathBuf>,
    pub route: RouteReport,
    pub current_month: Option<PartitionStats>,
}

/// One fetch → route pass against the configured source page.
pub struct IngestPipeline {
    config: QuakeConfig,
    store: PartitionStore,
    http: HttpFetcher,
    source: Box<dyn EventSource>,
    archive: Option<PageArchive>,
}

impl IngestPipeline {
    pub fn new(config: QuakeConfig) -> Result<Self> {
        let source = source_for(&config.source_id, &config.source_url)
            .with_context(|| format!("no source adapter registered for {}", config.source_id))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            store: config.partition_store(),
            archive: config.archive_dir.clone().map(PageArchive::new),
            config,
            http,
            source,
        })
    }

    pub fn with_source(mut self, source: Box<dyn EventSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &QuakeConfig {
        &self.config
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// A network failure returns `Err` before any file is touched. An empty page is
    /// `IngestStatus::NoData`, not an error.
    pub async fn run_once(&self) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<IngestSummary> {
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        info!(url = self.source.page_url(), "scraping latest events");

        let page = self
            .source
            .fetch_page(&self.http, &ctx)
            .await
            .with_context(|| format!("fetching {}", self.source.page_url()))?;

        let archived_page = match &self.archive {
            Some(archive) => match archive
                .store_page(page.fetched_at, self.source.source_id(), "html", &page.body)
                .await
            {
                Ok(stored) => Some(stored.absolute_path),
                Err(err) => {
                    warn!(error = format!("{err:#}"), "failed to archive fetched page");
                    None
                }
            },
            None => None,
        };

        let parsed = self
            .source
            .parse_page(&page)
            .context("parsing fetched page")?;
        info!(rows = parsed.rows.len(), short_rows = parsed.short_rows, "found records on page");

        let mut summary = IngestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            source_id: self.source.source_id().to_string(),
            source_url: page.url.clone(),
            status: IngestStatus::NoData,
            rows_scraped: parsed.rows.len(),
            short_rows: parsed.short_rows,
            archived_page,
            route: RouteReport::default(),
            current_month: None,
        };

        if parsed.rows.is_empty() {
            info!("no data scraped; leaving partitions untouched");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        // Partition locks wait with blocking sleeps; keep them off the async workers.
        let store = self.store.clone();
        let span = tracing::Span::current();
        let (route, current_month) = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let route = Router::new(&store).route(parsed.rows);
            let current_month = match store.stats(PartitionKey::of(&Local::now().naive_local())) {
                Ok(stats) => stats,
                Err(err) => {
                    warn!(error = %err, "could not read current month partition stats");
                    None
                }
            };
            (route, current_month)
        })
        .await
        .context("partition writer task failed")?;
        summary.route = route;
        summary.status = IngestStatus::Completed;
        summary.current_month = current_month;
        summary.finished_at = Utc::now();

        if summary.route.appended > 0 {
            info!(added = summary.route.appended, "ingest run added new records");
        } else {
            info!("ingest run added no new records");
        }
        Ok(summary)
    }
}

/// Run ingest on `schedule_cron`. Ticks that arrive while a run is in progress are skipped,
/// so runs against the partition files never overlap within this process.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().schedule_cron.clone();
    let gate = Arc::new(tokio::sync::Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let Ok(_running) = gate.try_lock() else {
                warn!("previous ingest run still in progress; skipping tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.route.appended,
                    "scheduled ingest run finished"
                ),
                Err(err) => error!(error = format!("{err:#}"), "scheduled ingest run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn record(ts: &str, lat: &str, lon: &str, mag: &str, source: &str) -> EventRecord {
        let raw = RawRow::from_cells(&[ts, lat, lon, "10", mag, "Somewhere"]).unwrap();
        EventRecord::from_raw(raw).unwrap().with_source(source)
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn raw_timestamp_strategy_treats_renderings_as_distinct() {
        let a = record("2025-08-11 12:07:00", "14.1", "121.0", "4.5", "a");
        let b = record("11 August 2025 - 12:07 PM", "14.1", "121.0", "4.5", "b");
        let mut strict = DedupFilter::new(RawTimestampKey);
        assert!(strict.admit(&a));
        assert!(strict.admit(&b));

        let mut semantic = DedupFilter::new(SemanticKey);
        assert!(semantic.admit(&a));
        assert!(!semantic.admit(&b));
        assert_eq!(semantic.rejected(), 1);
        assert_eq!(semantic.strategy_name(), "semantic");
    }

    #[test]
    fn seeded_filter_rejects_stored_keys() {
        let mut filter = DedupFilter::seeded(RawTimestampKey, ["2025-08-11 12:07:00".to_string()]);
        assert!(!filter.admit(&record("2025-08-11 12:07:00", "1", "2", "3", "x")));
        assert!(filter.admit(&record("2025-08-11 12:08:00", "1", "2", "3", "x")));
    }

    #[test]
    fn merge_keeps_first_semantic_duplicate_and_sorts_newest_first() {
        let records = vec![
            record("11 August 2025 - 12:07 PM", "14.1", "121.0", "4.5", "first.csv"),
            record("2025-08-01 00:00:00", "10", "120", "2.0", "first.csv"),
            record("2025-08-11 12:07:00", "14.10", "121", "4.5", "second.csv"),
            record("2025-08-20 08:30:00", "11", "122", "5.1", "second.csv"),
        ];
        let merged = merge_records(records);
        assert_eq!(merged.records.len(), 3);
        assert_eq!(merged.duplicates_removed(), 1);
        assert_eq!(merged.semantic_duplicates, 1);
        let kept = merged
            .records
            .iter()
            .find(|r| r.timestamp == at(2025, 8, 11, 12, 7))
            .unwrap();
        assert_eq!(kept.source_partition.as_deref(), Some("first.csv"));
        let order = merged.records.iter().map(|r| r.timestamp).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![at(2025, 8, 20, 8, 30), at(2025, 8, 11, 12, 7), at(2025, 8, 1, 0, 0)]
        );
    }

    #[test]
    fn byte_identical_rows_collapse_in_full_row_pass() {
        let merged = merge_records(vec![
            record("2025-08-11 12:07:00", "14.1", "121.0", "4.5", "a.csv"),
            record("2025-08-11 12:07:00", "14.1", "121.0", "4.5", "b.csv"),
        ]);
        assert_eq!(merged.records.len(), 1);
        assert_eq!(merged.full_row_duplicates, 1);
        assert_eq!(merged.semantic_duplicates, 0);
    }

    #[test]
    fn summary_buckets_months_and_sources() {
        let mut records = vec![
            record("2025-07-31 23:00:00", "1", "2", "0.5", "jul.csv"),
            record("2025-08-01 01:00:00", "1", "2", "2.9", "aug.csv"),
            record("2025-08-02 01:00:00", "1", "2", "7.0", "aug.csv"),
            record("2025-08-03 01:00:00", "1", "2", "-0.3", "aug.csv"),
        ];
        records[0].depth = None;
        let summary = DatasetSummary::from_records(&records);

        assert_eq!(summary.total_records, 4);
        assert_eq!(summary.missing_depth, 1);
        assert_eq!(summary.magnitude_range, Some((-0.3, 7.0)));
        assert_eq!(summary.depth_range, Some((10.0, 10.0)));
        assert_eq!(summary.per_source["aug.csv"], 3);
        assert_eq!(summary.per_month["2025-07"], 1);
        assert_eq!(summary.per_month["2025-08"], 3);
        let counts = summary
            .magnitude_histogram
            .iter()
            .map(|b| b.count)
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 1, 0, 0, 1]);
        assert_eq!(summary.magnitude_histogram[4].percent, 25.0);
        assert_eq!(summary.earliest, Some(at(2025, 7, 31, 23, 0)));
    }

    #[test]
    fn merged_output_never_overwrites() {
        let dir = tempdir().unwrap();
        let generated = at(2025, 8, 11, 12, 7);
        let first = merged_output_path(dir.path(), "quakes", Some("2025"), generated);
        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            "quakes_complete_2025_20250811_1207.csv"
        );
        std::fs::write(&first, "x").unwrap();
        let second = merged_output_path(dir.path(), "quakes", Some("2025"), generated);
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            "quakes_complete_2025_20250811_1207_2.csv"
        );
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        let config = QuakeConfig::default().with_overrides(|key| match key {
            "QUAKE_DATA_DIR" => Some("/var/lib/quakes".to_string()),
            "QUAKE_HTTP_TIMEOUT_SECS" => Some("30".to_string()),
            "QUAKE_LOCK_STALE_SECS" => Some("not-a-number".to_string()),
            "QUAKE_ACCEPT_INVALID_CERTS" => Some("true".to_string()),
            _ => None,
        });
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/quakes"));
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.lock_stale_secs, 600);
        assert!(config.accept_invalid_certs);
        assert_eq!(config.partition_prefix, "phivolcs_earthquakes");
    }

    #[test]
    fn yaml_config_fills_missing_fields_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quake.yaml");
        std::fs::write(&path, "data_dir: ./partitions\nschedule_cron: \"0 */5 * * * *\"\n").unwrap();
        let config = QuakeConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./partitions"));
        assert_eq!(config.schedule_cron, "0 */5 * * * *");
        assert_eq!(config.http_timeout_secs, 15);
    }

    #[test]
    fn parquet_snapshot_writes_manifest_with_hash() {
        let dir = tempdir().unwrap();
        let records = vec![record("2025-08-11 12:07:00", "14.1", "121.0", "4.5", "aug.csv")];
        let manifest_path = export_parquet_snapshot(&records, &dir.path().join("merged.parquet")).unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["path"], "merged.parquet");
        assert_eq!(manifest["files"][0]["rows"], 1);
        assert_eq!(manifest["files"][0]["sha256"].as_str().unwrap().len(), 64);
    }
}
