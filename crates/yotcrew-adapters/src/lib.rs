//! Source plugin contract, registry and the built-in yacht crew job boards.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;
use yotcrew_core::{parse_posted_at, Currency, EmploymentType, Filters, RawRecord, VesselSize};
use yotcrew_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "yotcrew-adapters";

pub const YOTSPOT_ID: &str = "yotspot";
pub const DAYWORK123_ID: &str = "daywork123";
pub const MERIDIAN_GO_ID: &str = "meridian_go";

/// One external job board. Implementations own fetching and markup parsing; callers never
/// branch on which source they hold.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    fn identity(&self) -> &str;

    fn base_url(&self) -> &str;

    /// Politeness delay the rate governor keeps between two calls to this source.
    fn min_request_interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn declared_filters(&self) -> BTreeSet<String>;

    /// Reachability check. Never errors; any failure reports `false`.
    async fn probe(&self) -> bool;

    /// An empty batch means there are no more pages.
    async fn fetch_page(&self, page_index: u32, filters: &Filters)
        -> Result<Vec<RawRecord>, FetchError>;
}

/// Keeps only the filter keys `plugin` declares.
pub fn supported_filters(plugin: &dyn SourcePlugin, filters: &Filters) -> Filters {
    let declared = plugin.declared_filters();
    filters
        .iter()
        .filter(|(key, _)| declared.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("source `{0}` is already registered")]
    DuplicateSource(String),
    #[error("unknown source `{0}`")]
    UnknownSource(String),
}

/// Source id to plugin map, populated at startup and read-only once shared.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    plugins: Vec<Arc<dyn SourcePlugin>>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn SourcePlugin>) -> Result<(), RegistryError> {
        let id = plugin.identity().to_string();
        if self.index.contains_key(&id) {
            return Err(RegistryError::DuplicateSource(id));
        }
        self.index.insert(id, self.plugins.len());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Result<Arc<dyn SourcePlugin>, RegistryError> {
        self.index
            .get(source_id)
            .and_then(|idx| self.plugins.get(*idx))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSource(source_id.to_string()))
    }

    /// Registration order.
    pub fn list_all(&self) -> &[Arc<dyn SourcePlugin>] {
        &self.plugins
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.plugins
            .iter()
            .map(|p| p.identity().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// The production sources, in the order runs visit them.
pub fn default_registry(http: Arc<HttpFetcher>) -> Result<SourceRegistry, RegistryError> {
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(YotspotPlugin::new(http.clone())))?;
    registry.register(Arc::new(Daywork123Plugin::new(http.clone())))?;
    registry.register(Arc::new(MeridianGoPlugin::new(http)))?;
    Ok(registry)
}

fn markup_error(detail: impl Into<String>) -> FetchError {
    FetchError::Permanent(detail.into())
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| markup_error(format!("invalid selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, FetchError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).find_map(element_text))
}

fn select_first_attr(
    scope: ElementRef<'_>,
    css: &str,
    attr: &str,
) -> Result<Option<String>, FetchError> {
    let sel = selector(css)?;
    Ok(scope
        .select(&sel)
        .find_map(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, FetchError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).filter_map(element_text).collect())
}

/// Elements matched by the first selector in `candidates` that matches anything.
fn select_cards<'a>(document: &'a Html, candidates: &[&str]) -> Result<Vec<ElementRef<'a>>, FetchError> {
    for css in candidates {
        let sel = selector(css)?;
        let cards: Vec<_> = document.select(&sel).collect();
        if !cards.is_empty() {
            return Ok(cards);
        }
    }
    Ok(Vec::new())
}

fn absolute_url(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(String::from)
}

/// Numeric id in a `/jobs/<n>` path segment.
pub fn job_id_from_url(url: &str) -> Option<String> {
    let rest = url.split("/jobs/").nth(1)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

fn put(record: &mut RawRecord, key: &str, value: Option<String>) {
    if let Some(value) = value {
        record.insert(key.to_string(), JsonValue::String(value));
    }
}

fn looks_like_salary(text: &str) -> bool {
    Currency::detect(text).is_some() && text.chars().any(|c| c.is_ascii_digit())
}

fn looks_like_date(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("posted")
        || lower.ends_with(" ago")
        || lower == "today"
        || lower == "yesterday"
        || parse_posted_at(text, Utc::now()).is_some()
}

fn listing_url(
    base: &Url,
    path: &str,
    page_number: u32,
    always_paginate: bool,
    query: &Filters,
) -> Result<Url, FetchError> {
    let mut url = base
        .join(path)
        .map_err(|e| markup_error(format!("bad listing path `{path}`: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        if always_paginate || page_number > 1 {
            pairs.append_pair("page", &page_number.to_string());
        }
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

async fn probe_url(http: &HttpFetcher, source_id: &str, url: &str) -> bool {
    match http.fetch_bytes(source_id, url).await {
        Ok(_) => true,
        Err(err) => {
            debug!(source_id, error = %err, "probe failed");
            false
        }
    }
}

fn parse_base(base_url: &str) -> Result<Url, FetchError> {
    Url::parse(base_url).map_err(|e| markup_error(format!("bad base url `{base_url}`: {e}")))
}

pub const YOTSPOT_BASE_URL: &str = "https://www.yotspot.com";

/// Yotspot job search: `div.job-item` cards with a `ul.job-item__info` fact list.
pub struct YotspotPlugin {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl YotspotPlugin {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, YOTSPOT_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

pub fn parse_yotspot_listing(html: &str, base: &Url) -> Result<Vec<RawRecord>, FetchError> {
    let document = Html::parse_document(html);
    let cards = select_cards(
        &document,
        &[
            "div.job-item",
            "div.job-listing, div.job-card",
            "article[class*=\"job\"]",
            "div[data-job-id]",
        ],
    )?;

    let mut out = Vec::with_capacity(cards.len());
    for card in cards {
        let link_sel = selector("div.job-item__position a, h2 a, h3 a")?;
        let Some(link) = card.select(&link_sel).next() else {
            continue;
        };
        let Some(title) = element_text(link) else {
            continue;
        };
        let url = link
            .value()
            .attr("href")
            .and_then(|href| absolute_url(base, href));

        let mut location = None;
        let mut job_type = None;
        let mut posted = None;
        let mut salary = None;
        let mut size = None;
        for item in select_all_texts(card, "ul.job-item__info li")? {
            if salary.is_none() && looks_like_salary(&item) {
                salary = Some(item);
            } else if posted.is_none() && looks_like_date(&item) {
                posted = Some(item);
            } else if job_type.is_none() && EmploymentType::detect(&item).is_some() {
                job_type = Some(item);
            } else if size.is_none() && VesselSize::detect(&item).is_some() {
                size = Some(item);
            } else if location.is_none() {
                location = Some(item);
            }
        }

        let external_id = url
            .as_deref()
            .and_then(job_id_from_url)
            .or_else(|| card.value().attr("data-job-id").map(str::to_string))
            .or_else(|| url.clone());
        let description = select_first_text(
            card,
            ".job-item__description, .job-item__summary, p",
        )?
        .unwrap_or_else(|| title.clone());
        let company = select_first_text(card, ".job-item__company")?
            .unwrap_or_else(|| "Yotspot".to_string());

        let mut record = RawRecord::new();
        put(&mut record, "external_id", external_id);
        put(&mut record, "title", Some(title));
        put(&mut record, "company", Some(company));
        put(&mut record, "description", Some(description));
        put(&mut record, "url", url);
        put(&mut record, "location", location);
        put(&mut record, "job_type", job_type);
        put(&mut record, "posted_date", posted);
        put(&mut record, "salary", salary);
        put(&mut record, "vessel_size", size);
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl SourcePlugin for YotspotPlugin {
    fn identity(&self) -> &str {
        YOTSPOT_ID
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn min_request_interval(&self) -> Duration {
        Duration::from_millis(2000)
    }

    fn declared_filters(&self) -> BTreeSet<String> {
        ["location", "department"].into_iter().map(String::from).collect()
    }

    async fn probe(&self) -> bool {
        probe_url(&self.http, YOTSPOT_ID, &self.base_url).await
    }

    async fn fetch_page(
        &self,
        page_index: u32,
        filters: &Filters,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let base = parse_base(&self.base_url)?;
        let query = supported_filters(self, filters);
        let url = listing_url(&base, "/job-search.html", page_index + 1, true, &query)?;
        let html = self.http.fetch_text(YOTSPOT_ID, url.as_str()).await?;
        parse_yotspot_listing(&html, &base)
    }
}

pub const DAYWORK123_BASE_URL: &str = "https://www.daywork123.com";

/// Daywork123 announcement table, one `tr` per posting.
pub struct Daywork123Plugin {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl Daywork123Plugin {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, DAYWORK123_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

pub fn parse_daywork123_listing(html: &str, base: &Url) -> Result<Vec<RawRecord>, FetchError> {
    let document = Html::parse_document(html);
    let row_sel = selector("#ContentPlaceHolder1_RepJobAnnouncement tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;
    let fallback_url = absolute_url(base, "/JobAnnouncementList.aspx");

    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        if row.value().classes().any(|c| c == "head") {
            continue;
        }
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() < 3 {
            continue;
        }
        let texts: Vec<String> = cells
            .iter()
            .map(|c| element_text(*c).unwrap_or_default())
            .collect();
        let job_id = texts[0].clone();
        let title = texts[1].clone();
        if job_id.is_empty() || title.is_empty() {
            continue;
        }

        let url = cells[1]
            .select(&link_sel)
            .find_map(|a| a.value().attr("href"))
            .and_then(|href| absolute_url(base, href))
            .or_else(|| fallback_url.clone());
        let details = texts.get(3).filter(|t| !t.is_empty()).cloned();
        let company = details
            .as_ref()
            .map(|d| d.chars().take(50).collect::<String>().trim().to_string())
            .unwrap_or_else(|| "Daywork123".to_string());
        let description = details.unwrap_or_else(|| format!("Job ID: {job_id}"));

        let mut record = RawRecord::new();
        put(&mut record, "external_id", Some(format!("dw123_{job_id}")));
        put(&mut record, "title", Some(title));
        put(&mut record, "company", Some(company));
        put(&mut record, "description", Some(description));
        put(&mut record, "url", url);
        put(&mut record, "location", text_or_none(texts[2].clone()));
        put(&mut record, "posted_date", texts.get(4).cloned().and_then(text_or_none));
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl SourcePlugin for Daywork123Plugin {
    fn identity(&self) -> &str {
        DAYWORK123_ID
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn min_request_interval(&self) -> Duration {
        Duration::from_millis(2500)
    }

    fn declared_filters(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    async fn probe(&self) -> bool {
        probe_url(&self.http, DAYWORK123_ID, &self.base_url).await
    }

    async fn fetch_page(
        &self,
        page_index: u32,
        _filters: &Filters,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let base = parse_base(&self.base_url)?;
        let url = listing_url(
            &base,
            "/JobAnnouncementList.aspx",
            page_index + 1,
            false,
            &Filters::new(),
        )?;
        let html = self.http.fetch_text(DAYWORK123_ID, url.as_str()).await?;
        parse_daywork123_listing(&html, &base)
    }
}

pub const MERIDIAN_GO_BASE_URL: &str = "https://www.meridiango.com";

/// Meridian Go job cards under `/jobs`.
pub struct MeridianGoPlugin {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl MeridianGoPlugin {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, MERIDIAN_GO_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

pub fn parse_meridian_listing(html: &str, base: &Url) -> Result<Vec<RawRecord>, FetchError> {
    let document = Html::parse_document(html);
    let cards = select_cards(
        &document,
        &[
            "div.job-card, div.job-listing",
            "article[class*=\"job\"]",
            "div[data-job-id]",
        ],
    )?;

    let mut out = Vec::with_capacity(cards.len());
    for card in cards {
        let Some(title) = select_first_text(card, "h2, h3, a.job-title, a.title")? else {
            continue;
        };
        let url = select_first_attr(card, "h2 a, h3 a, a.job-title, a[href*=\"/jobs/\"]", "href")?
            .and_then(|href| absolute_url(base, &href));
        let external_id = url
            .as_deref()
            .and_then(job_id_from_url)
            .or_else(|| card.value().attr("data-job-id").map(str::to_string));
        let company = select_first_text(card, ".company, .employer")?
            .unwrap_or_else(|| "Meridian Go".to_string());

        let mut record = RawRecord::new();
        put(&mut record, "external_id", external_id);
        put(&mut record, "title", Some(title));
        put(&mut record, "company", Some(company));
        put(&mut record, "url", url);
        put(&mut record, "location", select_first_text(card, ".location, .place")?);
        put(
            &mut record,
            "job_type",
            select_first_text(card, ".job-type, .employment-type, .type")?,
        );
        put(
            &mut record,
            "posted_date",
            select_first_text(card, "time, .posted, .date")?,
        );
        put(
            &mut record,
            "salary",
            select_first_text(card, ".salary, .pay, .compensation")?,
        );
        put(
            &mut record,
            "description",
            select_first_text(card, ".description, .summary, p")?,
        );
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl SourcePlugin for MeridianGoPlugin {
    fn identity(&self) -> &str {
        MERIDIAN_GO_ID
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn min_request_interval(&self) -> Duration {
        Duration::from_millis(1000)
    }

    fn declared_filters(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    async fn probe(&self) -> bool {
        probe_url(&self.http, MERIDIAN_GO_ID, &self.base_url).await
    }

    async fn fetch_page(
        &self,
        page_index: u32,
        _filters: &Filters,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let base = parse_base(&self.base_url)?;
        let url = listing_url(&base, "/jobs", page_index + 1, false, &Filters::new())?;
        let html = self.http.fetch_text(MERIDIAN_GO_ID, url.as_str()).await?;
        parse_meridian_listing(&html, &base)
    }
}

/// Scripted behaviour of one page of a [`StaticPagesPlugin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedPage {
    Records {
        records: Vec<RawRecord>,
    },
    /// Fails transiently `failures` times, then serves `records`.
    Flaky {
        failures: u32,
        records: Vec<RawRecord>,
    },
    TransientFailure {
        message: String,
    },
    PermanentFailure {
        message: String,
    },
}

fn default_reachable() -> bool {
    true
}

/// JSON shape of a fixture source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSourceSpec {
    pub source_id: String,
    pub base_url: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "default_reachable")]
    pub reachable: bool,
    #[serde(default)]
    pub min_interval_ms: u64,
    pub pages: Vec<ScriptedPage>,
}

/// Fixture-first plugin serving pre-recorded pages; used offline and in tests.
pub struct StaticPagesPlugin {
    spec: StaticSourceSpec,
    reachable: AtomicBool,
    attempts: Vec<AtomicU32>,
    calls: AtomicUsize,
    probes: AtomicUsize,
    fetched_pages: Mutex<Vec<u32>>,
}

impl StaticPagesPlugin {
    pub fn new(spec: StaticSourceSpec) -> Self {
        let attempts = spec.pages.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            reachable: AtomicBool::new(spec.reachable),
            spec,
            attempts,
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            fetched_pages: Mutex::new(Vec::new()),
        }
    }

    /// Plain record pages, reachable, no politeness delay.
    pub fn with_pages(source_id: &str, pages: Vec<Vec<RawRecord>>) -> Self {
        Self::new(StaticSourceSpec {
            source_id: source_id.to_string(),
            base_url: format!("https://{source_id}.example.com"),
            filters: Vec::new(),
            reachable: true,
            min_interval_ms: 0,
            pages: pages
                .into_iter()
                .map(|records| ScriptedPage::Records { records })
                .collect(),
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture source {}", path.display()))?;
        let spec: StaticSourceSpec = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture source {}", path.display()))?;
        Ok(Self::new(spec))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of `fetch_page` invocations so far.
    pub fn fetch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub async fn fetched_pages(&self) -> Vec<u32> {
        self.fetched_pages.lock().await.clone()
    }
}

/// Loads every `*.json` fixture source in `dir`, sorted by file name.
pub fn load_fixture_sources(dir: impl AsRef<Path>) -> Result<Vec<StaticPagesPlugin>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("listing fixture directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths.iter().map(StaticPagesPlugin::from_json_file).collect()
}

#[async_trait]
impl SourcePlugin for StaticPagesPlugin {
    fn identity(&self) -> &str {
        &self.spec.source_id
    }

    fn base_url(&self) -> &str {
        &self.spec.base_url
    }

    fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.spec.min_interval_ms)
    }

    fn declared_filters(&self) -> BTreeSet<String> {
        self.spec.filters.iter().cloned().collect()
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }

    async fn fetch_page(
        &self,
        page_index: u32,
        _filters: &Filters,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched_pages.lock().await.push(page_index);

        let idx = page_index as usize;
        let Some(page) = self.spec.pages.get(idx) else {
            return Ok(Vec::new());
        };
        match page {
            ScriptedPage::Records { records } => Ok(records.clone()),
            ScriptedPage::Flaky { failures, records } => {
                let seen = self
                    .attempts
                    .get(idx)
                    .map(|a| a.fetch_add(1, Ordering::SeqCst))
                    .unwrap_or(*failures);
                if seen < *failures {
                    warn!(source_id = %self.spec.source_id, page = page_index, "scripted transient failure");
                    Err(FetchError::Transient(format!(
                        "scripted failure {} of {failures}",
                        seen + 1
                    )))
                } else {
                    Ok(records.clone())
                }
            }
            ScriptedPage::TransientFailure { message } => {
                Err(FetchError::Transient(message.clone()))
            }
            ScriptedPage::PermanentFailure { message } => {
                Err(FetchError::Permanent(message.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    const YOTSPOT_HTML: &str = r#"
        <html><body>
          <div class="job-item">
            <div class="job-item__position"><a href="/job-search/jobs/4512">Chief Stewardess</a></div>
            <ul class="job-item__info">
              <li>Antibes, France</li>
              <li>Permanent</li>
              <li>62m Motor Yacht</li>
              <li>€7,000 per month</li>
              <li>Posted 3 days ago</li>
            </ul>
          </div>
          <div class="job-item">
            <div class="job-item__position"><a href="https://www.yotspot.com/jobs/4513">Deckhand</a></div>
            <ul class="job-item__info"><li>Fort Lauderdale, USA</li></ul>
          </div>
          <div class="job-item"><p>Card without a title link</p></div>
        </body></html>
    "#;

    #[test]
    fn yotspot_cards_parse_into_raw_records() {
        let records = parse_yotspot_listing(YOTSPOT_HTML, &base(YOTSPOT_BASE_URL)).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first["external_id"], json!("4512"));
        assert_eq!(first["title"], json!("Chief Stewardess"));
        assert_eq!(first["company"], json!("Yotspot"));
        assert_eq!(
            first["url"],
            json!("https://www.yotspot.com/job-search/jobs/4512")
        );
        assert_eq!(first["location"], json!("Antibes, France"));
        assert_eq!(first["job_type"], json!("Permanent"));
        assert_eq!(first["vessel_size"], json!("62m Motor Yacht"));
        assert_eq!(first["salary"], json!("€7,000 per month"));
        assert_eq!(first["posted_date"], json!("Posted 3 days ago"));

        assert_eq!(records[1]["external_id"], json!("4513"));
        assert_eq!(records[1]["location"], json!("Fort Lauderdale, USA"));
        assert!(records[1].get("salary").is_none());
    }

    #[test]
    fn yotspot_page_without_cards_is_empty() {
        let records =
            parse_yotspot_listing("<html><body><p>No jobs</p></body></html>", &base(YOTSPOT_BASE_URL))
                .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn daywork123_rows_parse_and_skip_header() {
        let html = r#"
            <table id="ContentPlaceHolder1_RepJobAnnouncement">
              <tr class="head"><td>ID</td><td>Title</td><td>Location</td><td>Details</td><td>Date</td></tr>
              <tr>
                <td>10231</td>
                <td><a href="JobAnnouncementDetail.aspx?id=10231">Day Worker - Varnish</a></td>
                <td>Palma</td>
                <td>Experienced varnisher needed for 5 days on a 45m sailing yacht</td>
                <td>05/03/2026</td>
              </tr>
              <tr><td>10232</td><td>Deck crew</td><td>Antibes</td></tr>
              <tr><td>only</td><td></td></tr>
            </table>
        "#;
        let records = parse_daywork123_listing(html, &base(DAYWORK123_BASE_URL)).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first["external_id"], json!("dw123_10231"));
        assert_eq!(first["title"], json!("Day Worker - Varnish"));
        assert_eq!(
            first["url"],
            json!("https://www.daywork123.com/JobAnnouncementDetail.aspx?id=10231")
        );
        assert_eq!(first["location"], json!("Palma"));
        assert_eq!(
            first["company"],
            json!("Experienced varnisher needed for 5 days on a 45m s")
        );
        assert_eq!(first["posted_date"], json!("05/03/2026"));

        let second = &records[1];
        assert_eq!(second["company"], json!("Daywork123"));
        assert_eq!(second["description"], json!("Job ID: 10232"));
        assert_eq!(
            second["url"],
            json!("https://www.daywork123.com/JobAnnouncementList.aspx")
        );
    }

    #[test]
    fn meridian_cards_parse_with_defaults() {
        let html = r#"
            <div class="job-card">
              <h3><a href="/jobs/77">Second Engineer</a></h3>
              <span class="location">Monaco</span>
              <span class="job-type">Rotational</span>
              <span class="salary">$9,500 per month</span>
              <time>2026-03-01</time>
              <p class="description">2:2 rotation on a 70m expedition yacht.</p>
            </div>
            <div class="job-card"><span class="location">Nowhere</span></div>
        "#;
        let records = parse_meridian_listing(html, &base(MERIDIAN_GO_BASE_URL)).unwrap();
        assert_eq!(records.len(), 1);
        let job = &records[0];
        assert_eq!(job["external_id"], json!("77"));
        assert_eq!(job["company"], json!("Meridian Go"));
        assert_eq!(job["url"], json!("https://www.meridiango.com/jobs/77"));
        assert_eq!(job["job_type"], json!("Rotational"));
        assert_eq!(job["posted_date"], json!("2026-03-01"));
    }

    #[test]
    fn listing_urls_paginate_and_encode_filters() {
        let yotspot = base(YOTSPOT_BASE_URL);
        let mut filters = Filters::new();
        filters.insert("location".into(), "Palma de Mallorca".into());
        let url = listing_url(&yotspot, "/job-search.html", 1, true, &filters).unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.yotspot.com/job-search.html?page=1&location=Palma+de+Mallorca"
        );

        let meridian = base(MERIDIAN_GO_BASE_URL);
        let first = listing_url(&meridian, "/jobs", 1, false, &Filters::new()).unwrap();
        assert_eq!(first.as_str(), "https://www.meridiango.com/jobs");
        let third = listing_url(&meridian, "/jobs", 3, false, &Filters::new()).unwrap();
        assert_eq!(third.as_str(), "https://www.meridiango.com/jobs?page=3");
    }

    #[test]
    fn job_ids_come_from_jobs_path_segment() {
        assert_eq!(
            job_id_from_url("https://www.yotspot.com/jobs/123-deckhand"),
            Some("123".into())
        );
        assert_eq!(job_id_from_url("https://www.yotspot.com/about"), None);
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown_ids_and_keeps_order() {
        let mut registry = SourceRegistry::new();
        registry
            .register(Arc::new(StaticPagesPlugin::with_pages("b_source", vec![])))
            .unwrap();
        registry
            .register(Arc::new(StaticPagesPlugin::with_pages("a_source", vec![])))
            .unwrap();

        let dup = registry.register(Arc::new(StaticPagesPlugin::with_pages("b_source", vec![])));
        assert_eq!(dup, Err(RegistryError::DuplicateSource("b_source".into())));
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::UnknownSource(id)) if id == "missing"
        ));
        assert_eq!(registry.source_ids(), vec!["b_source", "a_source"]);
        assert_eq!(registry.get("a_source").unwrap().identity(), "a_source");
    }

    #[test]
    fn unsupported_filters_are_dropped() {
        let plugin = StaticPagesPlugin::new(StaticSourceSpec {
            source_id: "fixture".into(),
            base_url: "https://fixture.example.com".into(),
            filters: vec!["location".into()],
            reachable: true,
            min_interval_ms: 0,
            pages: vec![],
        });
        let mut filters = Filters::new();
        filters.insert("location".into(), "Antibes".into());
        filters.insert("salary_range".into(), "5000+".into());
        let kept = supported_filters(&plugin, &filters);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("location").map(String::as_str), Some("Antibes"));
    }

    #[tokio::test]
    async fn static_plugin_serves_scripted_pages() {
        let record = json!({"id": "1", "title": "Bosun"});
        let plugin = StaticPagesPlugin::new(StaticSourceSpec {
            source_id: "scripted".into(),
            base_url: "https://scripted.example.com".into(),
            filters: vec![],
            reachable: true,
            min_interval_ms: 0,
            pages: vec![
                ScriptedPage::Flaky {
                    failures: 1,
                    records: vec![record.as_object().unwrap().clone()],
                },
                ScriptedPage::PermanentFailure {
                    message: "markup changed".into(),
                },
            ],
        });

        let first = plugin.fetch_page(0, &Filters::new()).await.unwrap_err();
        assert!(first.is_transient());
        assert_eq!(plugin.fetch_page(0, &Filters::new()).await.unwrap().len(), 1);
        assert!(!plugin
            .fetch_page(1, &Filters::new())
            .await
            .unwrap_err()
            .is_transient());
        assert!(plugin.fetch_page(2, &Filters::new()).await.unwrap().is_empty());
        assert_eq!(plugin.fetch_calls(), 4);
        assert_eq!(plugin.fetched_pages().await, vec![0, 0, 1, 2]);

        assert!(plugin.probe().await);
        plugin.set_reachable(false);
        assert!(!plugin.probe().await);
        assert_eq!(plugin.probe_calls(), 2);
    }
}
