//! Source run orchestration: rate governing, circuit breaking, pagination and upserts.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use yotcrew_adapters::{
    default_registry, load_fixture_sources, supported_filters, SourcePlugin, SourceRegistry,
};
use yotcrew_core::{
    Filters, Normalizer, RawRecord, RunStatus, RunSummary, RunSummaryDraft, DEFAULT_ERROR_LIMIT,
    DEFAULT_FRESHNESS_HORIZON_DAYS,
};
use yotcrew_storage::{
    DedupEngine, FetchError, HttpClientConfig, HttpFetcher, JobStore, MemoryJobStore,
    PgJobStore, StateFile, UpsertOutcome, DEFAULT_USER_AGENT,
};

pub const CRATE_NAME: &str = "yotcrew-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub max_pages: u32,
    pub max_concurrency: usize,
    pub source_stagger: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub stale_after_days: i64,
    pub freshness_horizon_days: i64,
    pub error_limit: usize,
    pub fixtures_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: get("DATABASE_URL"),
            state_dir: get("YOTCREW_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            scheduler_enabled: get("YOTCREW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            max_pages: parsed("YOTCREW_MAX_PAGES")
                .filter(|v| *v > 0)
                .map(|v| v.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(5),
            max_concurrency: parsed("YOTCREW_MAX_CONCURRENCY")
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(3),
            source_stagger: Duration::from_secs(parsed("YOTCREW_SOURCE_STAGGER_SECS").unwrap_or(30)),
            http_timeout_secs: parsed("YOTCREW_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: get("YOTCREW_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            stale_after_days: parsed("YOTCREW_STALE_AFTER_DAYS").unwrap_or(14) as i64,
            freshness_horizon_days: parsed("YOTCREW_FRESHNESS_HORIZON_DAYS")
                .filter(|v| *v > 0)
                .map(|v| v as i64)
                .unwrap_or(DEFAULT_FRESHNESS_HORIZON_DAYS),
            error_limit: parsed("YOTCREW_ERROR_LIMIT")
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_ERROR_LIMIT),
            fixtures_dir: get("YOTCREW_FIXTURES_DIR").map(PathBuf::from),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_concurrency: self.max_concurrency,
            source_stagger: self.source_stagger,
            error_limit: self.error_limit,
            stale_after: chrono::Duration::try_days(self.stale_after_days)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(
            chrono::Duration::try_days(self.freshness_horizon_days)
                .unwrap_or(chrono::Duration::MAX),
        )
    }
}

/// Exponential backoff for transient fetch failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_index + 1`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub backoff: BackoffPolicy,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    /// Replaces a plugin's declared minimum inter-call delay.
    pub interval_overrides: HashMap<String, Duration>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(10 * 60),
            cooldown: Duration::from_secs(15 * 60),
            interval_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct SourceGate {
    last_call: Option<Instant>,
    failures: VecDeque<Instant>,
    circuit: CircuitState,
}

impl SourceGate {
    fn new() -> Self {
        Self {
            last_call: None,
            failures: VecDeque::new(),
            circuit: CircuitState::Closed,
        }
    }
}

/// Outcome of one governed page fetch.
#[derive(Debug)]
pub enum GovernedFetch {
    Records(Vec<RawRecord>),
    Failed { error: FetchError, attempts: u32 },
    /// The breaker is open; the plugin was not called.
    CircuitOpen,
    /// Shutdown was requested while backing off between attempts.
    Cancelled { attempts: u32 },
}

/// Wraps every plugin call with pacing, retries and a per-source circuit breaker.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    gates: Mutex<HashMap<String, Arc<Mutex<SourceGate>>>>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    async fn gate(&self, source_id: &str) -> Arc<Mutex<SourceGate>> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SourceGate::new())))
            .clone()
    }

    pub async fn circuit_state(&self, source_id: &str) -> CircuitState {
        let gate = self.gate(source_id).await;
        let state = gate.lock().await.circuit;
        state
    }

    fn interval_for(&self, plugin: &dyn SourcePlugin) -> Duration {
        self.config
            .interval_overrides
            .get(plugin.identity())
            .copied()
            .unwrap_or_else(|| plugin.min_request_interval())
    }

    /// Fetches one page. Calls for the same source are serialized through its gate.
    /// A backoff wait ends early once `shutdown` is cancelled.
    pub async fn fetch_page(
        &self,
        plugin: &dyn SourcePlugin,
        page_index: u32,
        filters: &Filters,
        shutdown: &CancellationToken,
    ) -> GovernedFetch {
        let source_id = plugin.identity().to_string();
        let gate = self.gate(&source_id).await;
        let mut gate = gate.lock().await;

        if let CircuitState::Open { since } = gate.circuit {
            if Instant::now().duration_since(since) < self.config.cooldown {
                debug!(source_id = %source_id, page = page_index, "circuit open, skipping fetch");
                return GovernedFetch::CircuitOpen;
            }
            gate.circuit = CircuitState::HalfOpen;
        }

        if gate.circuit == CircuitState::HalfOpen {
            if plugin.probe().await {
                info!(source_id = %source_id, "probe succeeded, closing circuit");
                gate.circuit = CircuitState::Closed;
                gate.failures.clear();
            } else {
                warn!(source_id = %source_id, "probe failed, circuit stays open");
                gate.circuit = CircuitState::Open {
                    since: Instant::now(),
                };
                return GovernedFetch::CircuitOpen;
            }
        }

        let interval = self.interval_for(plugin);
        let mut attempts = 0u32;
        loop {
            if let Some(last) = gate.last_call {
                tokio::time::sleep_until(last + interval).await;
            }
            gate.last_call = Some(Instant::now());
            attempts += 1;

            match plugin.fetch_page(page_index, filters).await {
                Ok(records) => {
                    gate.failures.clear();
                    return GovernedFetch::Records(records);
                }
                Err(error) => {
                    if self.record_failure(&mut gate, &source_id) {
                        return GovernedFetch::Failed { error, attempts };
                    }
                    if !error.is_transient() || attempts > self.config.backoff.max_retries {
                        return GovernedFetch::Failed { error, attempts };
                    }
                    let delay = self.config.backoff.delay_for_attempt(attempts - 1);
                    warn!(
                        source_id = %source_id,
                        page = page_index,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient fetch failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {
                            info!(
                                source_id = %source_id,
                                page = page_index,
                                "shutdown during backoff"
                            );
                            return GovernedFetch::Cancelled { attempts };
                        }
                    }
                }
            }
        }
    }

    /// Returns true when this failure tripped the breaker.
    fn record_failure(&self, gate: &mut SourceGate, source_id: &str) -> bool {
        let now = Instant::now();
        gate.failures.push_back(now);
        while let Some(oldest) = gate.failures.front() {
            if now.duration_since(*oldest) > self.config.failure_window {
                gate.failures.pop_front();
            } else {
                break;
            }
        }
        if gate.failures.len() as u32 >= self.config.failure_threshold.max(1) {
            warn!(
                source_id = %source_id,
                failures = gate.failures.len(),
                "failure threshold reached, opening circuit"
            );
            gate.circuit = CircuitState::Open { since: now };
            gate.failures.clear();
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_concurrency: usize,
    pub source_stagger: Duration,
    pub error_limit: usize,
    pub stale_after: chrono::Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        SyncConfig::default().run_options()
    }
}

/// Receives every finished [`RunSummary`].
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn record(&self, summary: &RunSummary) -> Result<()>;
}

#[async_trait]
impl SummarySink for PgJobStore {
    async fn record(&self, summary: &RunSummary) -> Result<()> {
        self.record_run_summary(summary)
            .await
            .with_context(|| format!("storing run summary {}", summary.run_id))
    }
}

/// Writes summaries as `runs/<date>/<source>-<run_id>.json` under a state directory.
#[derive(Debug, Clone)]
pub struct JsonSummaryLog {
    root: PathBuf,
}

impl JsonSummaryLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into().join("runs"),
        }
    }

    pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
        self.root
            .join(summary.started_at.format("%Y-%m-%d").to_string())
            .join(format!("{}-{}.json", summary.source_id, summary.run_id))
    }

    /// Most recent summaries first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        let mut days = match fs::read_dir(&self.root).await {
            Ok(days) => days,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.root.display()))
            }
        };
        while let Some(day) = days.next_entry().await? {
            if !day.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(day.path())
                .await
                .with_context(|| format!("listing {}", day.path().display()))?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(summary) = StateFile::new(path).load::<RunSummary>().await? {
                        summaries.push(summary);
                    }
                }
            }
        }
        summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}

#[async_trait]
impl SummarySink for JsonSummaryLog {
    async fn record(&self, summary: &RunSummary) -> Result<()> {
        StateFile::new(self.path_for(summary)).save(summary).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub accessible: bool,
    pub supported_filters: Vec<String>,
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub total_sources: usize,
    pub sources: Vec<SourceFilters>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilters {
    pub source: String,
    pub filters: Vec<String>,
}

const SUMMARY_CHANNEL_CAPACITY: usize = 64;

/// Long-lived run context. Cloning shares the registry, governor, store and event channel.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<SourceRegistry>,
    governor: Arc<RateGovernor>,
    dedup: DedupEngine,
    normalizer: Normalizer,
    options: RunOptions,
    events: broadcast::Sender<RunSummary>,
    sinks: Vec<Arc<dyn SummarySink>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: SourceRegistry, dedup: DedupEngine, governor: RateGovernor) -> Self {
        let (events, _) = broadcast::channel(SUMMARY_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(registry),
            governor: Arc::new(governor),
            dedup,
            normalizer: Normalizer::default(),
            options: RunOptions::default(),
            events,
            sinks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    pub fn dedup(&self) -> &DedupEngine {
        &self.dedup
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.registry.source_ids()
    }

    /// One event per finished source run. Lagging receivers lose old events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunSummary> {
        self.events.subscribe()
    }

    /// Cancelling stops new page fetches; a page already fetched is still ingested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run_source(&self, source_id: &str, max_pages: u32, filters: &Filters) -> RunSummary {
        let mut draft = RunSummaryDraft::start(source_id, self.options.error_limit);
        let span = info_span!("source_run", source_id = %source_id, run_id = %draft.run_id());
        let status = self
            .drive_source(&mut draft, source_id, max_pages, filters)
            .instrument(span)
            .await;
        let summary = draft.finish(status);
        info!(
            source_id = %summary.source_id,
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            pages = summary.pages_attempted,
            found = summary.found,
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            errors = summary.errors,
            "source run finished"
        );
        self.publish(&summary).await;
        summary
    }

    async fn drive_source(
        &self,
        draft: &mut RunSummaryDraft,
        source_id: &str,
        max_pages: u32,
        filters: &Filters,
    ) -> RunStatus {
        let plugin = match self.registry.get(source_id) {
            Ok(plugin) => plugin,
            Err(err) => {
                draft.record_error(err.to_string());
                return RunStatus::Failed;
            }
        };
        if self.shutdown.is_cancelled() {
            return RunStatus::Cancelled;
        }
        if !plugin.probe().await {
            warn!("source unreachable, skipping run");
            draft.record_error(format!("source {source_id} unreachable"));
            return RunStatus::Unreachable;
        }

        let filters = supported_filters(plugin.as_ref(), filters);
        let mut page_failures = 0u32;
        for page in 0..max_pages {
            if self.shutdown.is_cancelled() {
                info!(page, "cancellation requested, stopping before next page");
                return RunStatus::Cancelled;
            }
            let fetched = self
                .governor
                .fetch_page(plugin.as_ref(), page, &filters, &self.shutdown)
                .await;
            if !matches!(fetched, GovernedFetch::CircuitOpen) {
                draft.record_page();
            }
            match fetched {
                GovernedFetch::Records(records) if records.is_empty() => {
                    debug!(page, "empty page, source exhausted");
                    break;
                }
                GovernedFetch::Records(records) => {
                    draft.record_found(records.len());
                    self.ingest_page(draft, source_id, page, &records).await;
                }
                GovernedFetch::Failed { error, attempts } => {
                    page_failures += 1;
                    warn!(page, attempts, error = %error, "page abandoned");
                    draft.record_error(format!("page {page}: {error} (after {attempts} attempts)"));
                }
                GovernedFetch::CircuitOpen => {
                    draft.record_error(format!("page {page}: circuit open for {source_id}"));
                    return RunStatus::CircuitOpen;
                }
                GovernedFetch::Cancelled { attempts } => {
                    info!(page, attempts, "cancelled while retrying page");
                    return RunStatus::Cancelled;
                }
            }
        }

        if page_failures == 0 {
            if let Some(cutoff) = Utc::now().checked_sub_signed(self.options.stale_after) {
                match self.dedup.store().mark_stale(source_id, cutoff).await {
                    Ok(count) => draft.record_stale(count),
                    Err(err) => draft.record_error(format!("marking stale records: {err}")),
                }
            }
        }
        RunStatus::Completed
    }

    async fn ingest_page(
        &self,
        draft: &mut RunSummaryDraft,
        source_id: &str,
        page: u32,
        records: &[RawRecord],
    ) {
        for (position, raw) in records.iter().enumerate() {
            let record = match self.normalizer.normalize(raw, source_id, Utc::now()) {
                Ok(record) => record,
                Err(err) => {
                    debug!(page, position, error = %err, "record dropped");
                    draft.record_error(format!("page {page} record {position}: {err}"));
                    continue;
                }
            };
            match self.dedup.upsert(&record).await {
                Ok(UpsertOutcome::Created) => draft.record_created(),
                Ok(UpsertOutcome::Updated) => draft.record_updated(),
                Ok(UpsertOutcome::Unchanged) => draft.record_unchanged(),
                Err(err) => {
                    warn!(page, key = %record.identity(), error = %err, "upsert failed");
                    draft.record_error(format!("upsert {}: {err}", record.identity()));
                }
            }
        }
    }

    async fn publish(&self, summary: &RunSummary) {
        for sink in &self.sinks {
            if let Err(err) = sink.record(summary).await {
                warn!(run_id = %summary.run_id, error = %err, "failed to persist run summary");
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(summary.clone());
    }

    /// Runs several sources with a stagger between starts and bounded concurrency.
    /// Summaries come back in the order of `source_ids`.
    pub async fn run_all(&self, source_ids: &[String], max_pages: u32) -> Vec<RunSummary> {
        let limit = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(source_ids.len());

        for (position, source_id) in source_ids.iter().enumerate() {
            if position > 0 && !self.options.source_stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.source_stagger) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
            let permit = limit.clone().acquire_owned().await.ok();
            let orchestrator = self.clone();
            let id = source_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                orchestrator.run_source(&id, max_pages, &Filters::new()).await
            });
            handles.push((source_id.clone(), handle));
        }

        let mut summaries = Vec::with_capacity(handles.len());
        for (source_id, handle) in handles {
            match handle.await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    error!(source_id = %source_id, error = %err, "source run task failed");
                    let mut draft = RunSummaryDraft::start(source_id, self.options.error_limit);
                    draft.record_error(format!("run task failed: {err}"));
                    let summary = draft.finish(RunStatus::Failed);
                    self.publish(&summary).await;
                    summaries.push(summary);
                }
            }
        }
        summaries
    }

    pub async fn health_check_all(&self) -> Vec<SourceHealth> {
        let mut report = Vec::with_capacity(self.registry.len());
        for plugin in self.registry.list_all() {
            let accessible = plugin.probe().await;
            report.push(SourceHealth {
                source: plugin.identity().to_string(),
                accessible,
                supported_filters: plugin.declared_filters().into_iter().collect(),
                base_url: plugin.base_url().to_string(),
            });
        }
        report
    }

    pub fn source_stats(&self) -> SourceStats {
        let sources = self
            .registry
            .list_all()
            .iter()
            .map(|plugin| SourceFilters {
                source: plugin.identity().to_string(),
                filters: plugin.declared_filters().into_iter().collect(),
            })
            .collect::<Vec<_>>();
        SourceStats {
            total_sources: sources.len(),
            sources,
        }
    }
}

/// Everything the binary needs, wired from a [`SyncConfig`].
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: Arc<dyn JobStore>,
    pub database: Option<PgJobStore>,
    pub summaries: JsonSummaryLog,
    pub orchestrator: Orchestrator,
}

impl SyncContext {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let mut registry = default_registry(http).context("registering built-in sources")?;
        if let Some(dir) = &config.fixtures_dir {
            for plugin in load_fixture_sources(dir)? {
                registry
                    .register(Arc::new(plugin))
                    .with_context(|| format!("registering fixture sources from {}", dir.display()))?;
            }
        }

        let database = match &config.database_url {
            Some(url) => {
                let pg = PgJobStore::connect(url, 5)
                    .await
                    .context("connecting to postgres")?;
                pg.migrate().await?;
                info!("using postgres job store");
                Some(pg)
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory job store");
                None
            }
        };
        let store: Arc<dyn JobStore> = match &database {
            Some(pg) => Arc::new(pg.clone()),
            None => Arc::new(MemoryJobStore::new()),
        };

        let summaries = JsonSummaryLog::new(&config.state_dir);
        let mut orchestrator = Orchestrator::new(
            registry,
            DedupEngine::new(store.clone()),
            RateGovernor::default(),
        )
        .with_options(config.run_options())
        .with_normalizer(config.normalizer())
        .with_sink(Arc::new(summaries.clone()));
        if let Some(pg) = &database {
            orchestrator = orchestrator.with_sink(Arc::new(pg.clone()));
        }

        Ok(Self {
            config,
            store,
            database,
            summaries,
            orchestrator,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }
}
