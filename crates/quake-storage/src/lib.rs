//! Partition files, tolerant CSV tables, page archive + HTTP fetch utilities.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use quake_core::{parse_timestamp, PartitionKey, RawRow, DATE_TIME_COLUMN, PARTITION_HEADER};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quake-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source file missing: {}", path.display())]
    SourceFileMissing { path: PathBuf },
    #[error("no date column in {} (columns: {columns:?})", path.display())]
    NoDateColumn { path: PathBuf, columns: Vec<String> },
    #[error("{} has no {column} column", path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("partition {} is locked by another run", path.display())]
    PartitionLocked { path: PathBuf },
    #[error("writing {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

fn write_failure(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::WriteFailure {
        path: path.to_path_buf(),
        source,
    }
}

/// Whole CSV file held in memory; rows that the CSV reader rejects are counted, not fatal.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<csv::StringRecord>,
    pub malformed: usize,
}

impl CsvTable {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::SourceFileMissing {
                path: path.to_path_buf(),
            });
        }
        let read_err = |source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(read_err)?;
        let headers = reader
            .headers()
            .map_err(read_err)?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        let mut malformed = 0usize;
        for result in reader.records() {
            match result {
                Ok(record) => rows.push(record),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping malformed csv row");
                    malformed += 1;
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
            malformed,
        })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    /// First column whose name starts with "date", ignoring case.
    pub fn date_column(&self) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.to_ascii_lowercase().starts_with("date"))
    }

    pub fn require_date_column(&self) -> Result<usize, StoreError> {
        self.date_column().ok_or_else(|| StoreError::NoDateColumn {
            path: self.path.clone(),
            columns: self.headers.clone(),
        })
    }

    pub fn require_column(&self, name: &'static str) -> Result<usize, StoreError> {
        self.column(name).ok_or_else(|| StoreError::MissingColumn {
            path: self.path.clone(),
            column: name,
        })
    }

    pub fn cell<'r>(row: &'r csv::StringRecord, index: Option<usize>) -> &'r str {
        index.and_then(|i| row.get(i)).unwrap_or("")
    }
}

/// Write a complete CSV file through a temp file + rename so readers never see a partial file.
pub fn write_csv_atomic<H, R, C>(path: &Path, header: &[H], rows: R) -> Result<(), StoreError>
where
    H: AsRef<[u8]>,
    R: IntoIterator<Item = C>,
    C: IntoIterator,
    C::Item: AsRef<[u8]>,
{
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(write_failure(parent))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.csv".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(row)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    result.map_err(|source: io::Error| {
        let _ = fs::remove_file(&temp_path);
        StoreError::WriteFailure {
            path: path.to_path_buf(),
            source,
        }
    })
}

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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// How long to wait for a partition held by another run, and when to declare its lock abandoned.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendOutcome {
    pub path: PathBuf,
    pub created: bool,
    pub appended: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub rows: usize,
    pub unparseable: usize,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
}

/// Monthly partition files under one directory: `{root}/{prefix}_{YYYY}_{MM}.csv`.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    prefix: String,
    lock_policy: LockPolicy,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn partition_path(&self, key: PartitionKey) -> PathBuf {
        self.root.join(key.file_name(&self.prefix))
    }

    /// Take the partition's sidecar lock. Everything that reads-then-writes a partition
    /// goes through the returned guard; the lock is released when it drops.
    pub fn lock(&self, key: PartitionKey) -> Result<PartitionGuard<'_>, StoreError> {
        fs::create_dir_all(&self.root).map_err(write_failure(&self.root))?;
        let path = self.partition_path(key);
        let lock_path = lock_path_for(&path);
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", std::process::id()) {
                        warn!(lock = %lock_path.display(), error = %err, "failed to record owner pid in partition lock");
                    }
                    return Ok(PartitionGuard {
                        store: self,
                        key,
                        path,
                        lock_path,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path, self.lock_policy.stale_after)
                        && break_stale_lock(&lock_path, self.lock_policy.stale_after)
                    {
                        warn!(lock = %lock_path.display(), "broke stale partition lock");
                        continue;
                    }
                    if started.elapsed() >= self.lock_policy.timeout {
                        return Err(StoreError::PartitionLocked { path });
                    }
                    thread::sleep(self.lock_policy.backoff.delay_for_attempt(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(write_failure(&lock_path)(err)),
            }
        }
    }

    /// Partition files present on disk, oldest month first.
    pub fn list_partitions(&self) -> Result<Vec<(PartitionKey, PathBuf)>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(write_failure(&self.root))?;
        let mut partitions = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                PartitionKey::from_file_name(&self.prefix, &name).map(|key| (key, entry.path()))
            })
            .collect::<Vec<_>>();
        partitions.sort_by_key(|(key, _)| *key);
        Ok(partitions)
    }

    /// Row count and time span of one partition; `None` if the file does not exist yet.
    pub fn stats(&self, key: PartitionKey) -> Result<Option<PartitionStats>, StoreError> {
        let path = self.partition_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let table = CsvTable::read(&path)?;
        let date_col = table.date_column().or(Some(0));
        let mut unparseable = 0usize;
        let mut earliest: Option<NaiveDateTime> = None;
        let mut latest: Option<NaiveDateTime> = None;
        for row in &table.rows {
            match parse_timestamp(CsvTable::cell(row, date_col)) {
                Ok(ts) => {
                    earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
                    latest = Some(latest.map_or(ts, |l| l.max(ts)));
                }
                Err(_) => unparseable += 1,
            }
        }
        Ok(Some(PartitionStats {
            key,
            path,
            rows: table.rows.len(),
            unparseable,
            earliest,
            latest,
        }))
    }
}

/// Exclusive access to one partition file for the lifetime of the guard.
#[derive(Debug)]
pub struct PartitionGuard<'a> {
    store: &'a PartitionStore,
    key: PartitionKey,
    path: PathBuf,
    lock_path: PathBuf,
}

impl PartitionGuard<'_> {
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw `Date-Time` strings already stored; empty if the partition does not exist.
    pub fn existing_timestamps(&self) -> Result<HashSet<String>, StoreError> {
        if !self.path.exists() {
            debug!(partition = %self.key, "no existing partition file, starting fresh");
            return Ok(HashSet::new());
        }
        let table = CsvTable::read(&self.path)?;
        if table.headers.is_empty() {
            return Ok(HashSet::new());
        }
        let col = table
            .column(DATE_TIME_COLUMN)
            .or_else(|| table.date_column())
            .or(Some(0));
        Ok(table
            .rows
            .iter()
            .map(|row| CsvTable::cell(row, col).to_string())
            .collect())
    }

    /// Append rows verbatim, writing the header first if the file is new or empty.
    pub fn append(&self, rows: &[RawRow]) -> Result<AppendOutcome, StoreError> {
        let fail = write_failure(&self.path);
        let existed = fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false);
        let result = (|| {
            if existed && !ends_with_newline(&self.path)? {
                OpenOptions::new().append(true).open(&self.path)?.write_all(b"\n")?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if !existed {
                writer.write_record(PARTITION_HEADER)?;
            }
            for row in rows {
                writer.write_record(row.cells())?;
            }
            writer.flush()
        })();
        result.map_err(fail)?;

        Ok(AppendOutcome {
            path: self.path.clone(),
            created: !existed,
            appended: rows.len(),
        })
    }

    /// Replace the whole partition atomically.
    pub fn replace<H, R, C>(&self, header: &[H], rows: R) -> Result<(), StoreError>
    where
        H: AsRef<[u8]>,
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: AsRef<[u8]>,
    {
        write_csv_atomic(&self.path, header, rows)
    }

    pub fn store(&self) -> &PartitionStore {
        self.store
    }
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            warn!(lock = %self.lock_path.display(), error = %err, "failed to release partition lock");
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn lock_is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= stale_after)
}

/// Move the lock aside atomically, then confirm the moved file is the stale one.
///
/// Another run may have broken and retaken the lock between the staleness check and the
/// rename; in that case its fresh lock is linked back into place and nothing is broken.
fn break_stale_lock(lock_path: &Path, stale_after: Duration) -> bool {
    let mut name = lock_path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.stale", Uuid::new_v4()));
    let aside = lock_path.with_file_name(name);
    if fs::rename(lock_path, &aside).is_err() {
        return false;
    }

    let broken = lock_is_stale(&aside, stale_after);
    if !broken {
        if let Err(err) = fs::hard_link(&aside, lock_path) {
            warn!(lock = %lock_path.display(), error = %err, "could not restore a live partition lock");
        }
    }
    if let Err(err) = fs::remove_file(&aside) {
        warn!(lock = %aside.display(), error = %err, "failed to remove moved partition lock");
    }
    broken
}

fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_archived: bool,
}

/// Fetched source pages kept hash-addressed per month, so markup changes can be audited later.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
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

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let month = fetched_at.format("%Y_%m").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id)
            .join(month)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Identical page bodies within a month are stored once.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let archived = |already_archived| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            already_archived,
        };

        let parent = absolute_path
            .parent()
            .context("archive path always has a parent")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if tokio::fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = tokio::fs::OpenOptions::new()
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

        match tokio::fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            accept_invalid_certs: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Network failures end the current run; nothing has been written when one is returned.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
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
                        warn!(%status, attempt, "retrying source page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
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
                        warn!(error = %err, attempt, "retrying source page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
