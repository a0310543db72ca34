use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use pls_core::FIRST_SURVEY_YEAR;
use pls_storage::{FetchError, HttpFetcher};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Four-digit year, optionally written as "FY2022" or "FY 2022".
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bFY\s*|\b)((?:19|20)\d{2})\b").expect("valid regex")
});

static CSV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bcsv\b").expect("valid regex"));

/// Produces the set of survey years available upstream.
#[async_trait]
pub trait YearSource: Send + Sync {
    /// Never fails: an unreachable or unparseable source yields an empty set.
    async fn discover_available_years(&self) -> BTreeSet<i32>;
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid portal url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no CSV download link found for FY{year}")]
    NoDownloadLink { year: i32 },
}

fn collapse_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn years_in(text: &str) -> impl Iterator<Item = i32> + '_ {
    YEAR_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<i32>().ok())
}

fn mentions_year(text: &str, year: i32) -> bool {
    years_in(text).any(|found| found == year)
}

/// Years named in hyperlink text, limited to `[1992, current_year]`.
pub fn extract_years_from_index(html: &str, current_year: i32) -> BTreeSet<i32> {
    let Ok(anchor_sel) = Selector::parse("a") else {
        return BTreeSet::new();
    };
    let document = Html::parse_document(html);
    document
        .select(&anchor_sel)
        .flat_map(|anchor| years_in(&collapse_text(anchor)).collect::<Vec<_>>())
        .filter(|year| (FIRST_SURVEY_YEAR..=current_year).contains(year))
        .collect()
}

/// Locate the year's section heading, then the nearest following list item
/// whose text mentions CSV, and return its link resolved against `page_url`.
pub fn find_year_download_link(html: &str, year: i32, page_url: &Url) -> Option<Url> {
    let section_sel = Selector::parse("h1, h2, h3, h4, h5, h6, li").ok()?;
    let link_sel = Selector::parse("a[href]").ok()?;
    let document = Html::parse_document(html);

    let mut in_year_section = false;
    for element in document.select(&section_sel) {
        let text = collapse_text(element);
        if element.value().name() != "li" {
            in_year_section = mentions_year(&text, year);
            continue;
        }
        if !in_year_section || !CSV_RE.is_match(&text) {
            continue;
        }
        let href = element
            .select(&link_sel)
            .find_map(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| !href.is_empty());
        if let Some(url) = href.and_then(|href| page_url.join(href).ok()) {
            return Some(url);
        }
    }
    None
}

/// First hyperlink whose text names `year`, e.g. a per-year landing page.
pub fn find_year_page_link(html: &str, year: i32, page_url: &Url) -> Option<Url> {
    let link_sel = Selector::parse("a[href]").ok()?;
    let document = Html::parse_document(html);
    document
        .select(&link_sel)
        .filter(|a| mentions_year(&collapse_text(*a), year))
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| page_url.join(href.trim()).ok())
}

fn parse_url(raw: &str) -> Result<Url, PortalError> {
    Url::parse(raw).map_err(|e| PortalError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Discovers published survey years from the portal index page.
#[derive(Debug, Clone)]
pub struct PortalYearDiscoverer {
    http: Arc<HttpFetcher>,
    index_url: String,
}

impl PortalYearDiscoverer {
    pub fn new(http: Arc<HttpFetcher>, index_url: impl Into<String>) -> Self {
        Self {
            http,
            index_url: index_url.into(),
        }
    }
}

#[async_trait]
impl YearSource for PortalYearDiscoverer {
    async fn discover_available_years(&self) -> BTreeSet<i32> {
        let run_id = Uuid::new_v4();
        let page = match self.http.fetch_bytes(run_id, &self.index_url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url = %self.index_url, error = %err, "year discovery failed");
                return BTreeSet::new();
            }
        };

        let years = extract_years_from_index(&page.text(), Utc::now().year());
        if years.is_empty() {
            warn!(url = %self.index_url, "no survey years found on portal index");
        } else {
            info!(count = years.len(), ?years, "discovered survey years");
        }
        years
    }
}

/// Finds the direct CSV archive link for a survey year.
#[derive(Debug, Clone)]
pub struct PortalLocator {
    http: Arc<HttpFetcher>,
    index_url: String,
}

impl PortalLocator {
    pub fn new(http: Arc<HttpFetcher>, index_url: impl Into<String>) -> Self {
        Self {
            http,
            index_url: index_url.into(),
        }
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub async fn locate_archive_url(&self, run_id: Uuid, year: i32) -> Result<Url, PortalError> {
        let index = self.http.fetch_bytes(run_id, &self.index_url).await?;
        let index_url = parse_url(&index.final_url)?;
        let index_html = index.text();

        if let Some(url) = find_year_download_link(&index_html, year, &index_url) {
            debug!(%url, year, "download link found on index page");
            return Ok(url);
        }

        let Some(year_page_url) = find_year_page_link(&index_html, year, &index_url) else {
            return Err(PortalError::NoDownloadLink { year });
        };
        debug!(url = %year_page_url, year, "following year page");

        let year_page = self.http.fetch_bytes(run_id, year_page_url.as_str()).await?;
        let year_page_url = parse_url(&year_page.final_url)?;
        find_year_download_link(&year_page.text(), year, &year_page_url)
            .ok_or(PortalError::NoDownloadLink { year })
    }
}
