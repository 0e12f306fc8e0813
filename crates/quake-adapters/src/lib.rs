//! Source page contracts + the event-table adapter for the monitoring authority's latest page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quake_core::RawRow;
use quake_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "quake-adapters";

pub const PHIVOLCS_SOURCE_ID: &str = "phivolcs";
pub const PHIVOLCS_LATEST_URL: &str = "https://earthquake.phivolcs.dost.gov.ph/";

/// Words that identify the event table among the page's layout tables.
const TABLE_KEYWORDS: [&str; 5] = ["magnitude", "depth", "latitude", "longitude", "location"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Rows pulled from one page, in page order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedTable {
    pub table_found: bool,
    pub rows: Vec<RawRow>,
    pub short_rows: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("network failure: {0}")]
    Network(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn page_url(&self) -> &str;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_page(&self, page: &FetchedPage) -> Result<ParsedTable, AdapterError>;
}

/// The "latest earthquakes" listing: a single HTML table of recent events.
#[derive(Debug, Clone)]
pub struct LatestEventsPage {
    source_id: &'static str,
    url: String,
}

impl LatestEventsPage {
    pub fn new(source_id: &'static str, url: impl Into<String>) -> Self {
        Self {
            source_id,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventSource for LatestEventsPage {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn page_url(&self) -> &str {
        &self.url
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let response = http.fetch_bytes(ctx.run_id, self.source_id, &self.url).await?;
        Ok(FetchedPage {
            url: response.final_url,
            content_type: "text/html".to_string(),
            body: response.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<ParsedTable, AdapterError> {
        let html = String::from_utf8_lossy(&page.body);
        extract_event_table(&html)
    }
}

pub fn source_for(source_id: &str, url: &str) -> Option<Box<dyn EventSource>> {
    match source_id {
        PHIVOLCS_SOURCE_ID => Some(Box::new(LatestEventsPage::new(PHIVOLCS_SOURCE_ID, url))),
        _ => None,
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Scan the document for the event table and return its data rows.
///
/// The first row of the table is its header. Rows with fewer than six cells are counted
/// and dropped; a page with no matching table yields an empty, `table_found = false` result.
pub fn extract_event_table(html: &str) -> Result<ParsedTable, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).find(|table| {
        let text = table.text().collect::<String>().to_lowercase();
        TABLE_KEYWORDS.iter().any(|keyword| text.contains(keyword))
    }) else {
        warn!("no earthquake table found on page");
        return Ok(ParsedTable::default());
    };

    let mut parsed = ParsedTable {
        table_found: true,
        ..ParsedTable::default()
    };
    for row in table.select(&row_sel).skip(1) {
        let cells = row.select(&cell_sel).map(element_text).collect::<Vec<_>>();
        if cells.is_empty() {
            continue;
        }
        match RawRow::from_cells(&cells) {
            Ok(raw) => parsed.rows.push(raw),
            Err(err) => {
                debug!(error = %err, "rejecting short table row");
                parsed.short_rows += 1;
            }
        }
    }

    Ok(parsed)
}
