//! Time-of-day scrape scheduling with persisted definitions, misfire handling and coalescing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use yotcrew_core::{RunStatus, RunSummary, RunSummaryDraft};
use yotcrew_storage::StateFile;
use yotcrew_sync::Orchestrator;

pub const CRATE_NAME: &str = "yotcrew-scheduler";

/// History key for runs started through [`ScrapeScheduler::trigger_now`].
pub const MANUAL_HISTORY_KEY: &str = "manual";

const HISTORY_LIMIT: usize = 20;
const STATUS_SUMMARY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unknown schedule band `{0}` (expected morning, day or evening)")]
    UnknownBand(String),
    #[error("hour {0} is outside 0-23")]
    InvalidHour(u32),
    #[error("minute {0} is outside 0-59")]
    InvalidMinute(u32),
    #[error("a recurrence needs at least one hour and one minute")]
    EmptyRule,
    #[error("max pages must be greater than zero")]
    InvalidMaxPages,
    #[error("unknown schedule descriptor `{0}`")]
    UnknownDescriptor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleBand {
    Morning,
    Day,
    Evening,
}

impl ScheduleBand {
    pub const ALL: [ScheduleBand; 3] = [Self::Morning, Self::Day, Self::Evening];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Day => "day",
            Self::Evening => "evening",
        }
    }

    pub fn descriptor_id(self) -> String {
        format!("scrape_{}", self.as_str())
    }
}

impl fmt::Display for ScheduleBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleBand {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(Self::Morning),
            "day" | "daytime" => Ok(Self::Day),
            "evening" => Ok(Self::Evening),
            other => Err(ScheduleError::UnknownBand(other.to_string())),
        }
    }
}

/// Every combination of `hours` × `minutes`, every day, in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    hours: BTreeSet<u8>,
    minutes: BTreeSet<u8>,
}

impl RecurrenceRule {
    pub fn new(
        hours: impl IntoIterator<Item = u32>,
        minutes: impl IntoIterator<Item = u32>,
    ) -> Result<Self, ScheduleError> {
        let hours = hours
            .into_iter()
            .map(|h| {
                u8::try_from(h)
                    .ok()
                    .filter(|h| *h < 24)
                    .ok_or(ScheduleError::InvalidHour(h))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        let minutes = minutes
            .into_iter()
            .map(|m| {
                u8::try_from(m)
                    .ok()
                    .filter(|m| *m < 60)
                    .ok_or(ScheduleError::InvalidMinute(m))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        if hours.is_empty() || minutes.is_empty() {
            return Err(ScheduleError::EmptyRule);
        }
        Ok(Self { hours, minutes })
    }

    pub fn hours(&self) -> &BTreeSet<u8> {
        &self.hours
    }

    pub fn minutes(&self) -> &BTreeSet<u8> {
        &self.minutes
    }

    pub fn runs_per_day(&self) -> usize {
        self.hours.len() * self.minutes.len()
    }

    /// Ascending fire times on `date`.
    pub fn fire_times_on(&self, date: NaiveDate) -> Vec<DateTime<Utc>> {
        self.hours
            .iter()
            .flat_map(|h| self.minutes.iter().map(move |m| (*h, *m)))
            .filter_map(|(h, m)| date.and_hms_opt(u32::from(h), u32::from(m), 0))
            .map(|naive| naive.and_utc())
            .collect()
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.date_naive();
        [Some(today), today.succ_opt()]
            .into_iter()
            .flatten()
            .flat_map(|date| self.fire_times_on(date))
            .find(|t| *t > after)
    }

    /// Most recent fire time at or before `at`.
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = at.date_naive();
        [Some(today), today.pred_opt()]
            .into_iter()
            .flatten()
            .flat_map(|date| self.fire_times_on(date).into_iter().rev())
            .find(|t| *t <= at)
    }

    /// Six-field cron form (`sec min hour dom mon dow`).
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * *", join(&self.minutes), join(&self.hours))
    }
}

fn join(values: &BTreeSet<u8>) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSelector {
    All,
    Only(Vec<String>),
}

impl SourceSelector {
    pub fn resolve(&self, registered: Vec<String>) -> Vec<String> {
        match self {
            Self::All => registered,
            Self::Only(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub band: ScheduleBand,
    pub rule: RecurrenceRule,
    pub selector: SourceSelector,
    pub max_pages: u32,
    #[serde(default)]
    pub paused: bool,
}

/// Mutable execution record, kept apart from the definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    /// First time the descriptor was armed; slots before it are never caught up.
    pub armed_at: Option<DateTime<Utc>>,
    pub last_fired_slot: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub misfires: u32,
    pub recent: VecDeque<RunSummary>,
}

impl ExecutionHistory {
    fn push_summaries(&mut self, summaries: Vec<RunSummary>) {
        for summary in summaries {
            if self.recent.len() == HISTORY_LIMIT {
                self.recent.pop_front();
            }
            self.recent.push_back(summary);
        }
    }
}

/// Definitions plus history, as held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBook {
    pub descriptors: Vec<JobDescriptor>,
    pub history: BTreeMap<String, ExecutionHistory>,
}

impl ScheduleBook {
    pub fn descriptor(&self, id: &str) -> Option<&JobDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    fn descriptor_mut(&mut self, id: &str) -> Option<&mut JobDescriptor> {
        self.descriptors.iter_mut().find(|d| d.id == id)
    }

    pub fn total_daily_runs(&self) -> usize {
        self.descriptors.iter().map(|d| d.rule.runs_per_day()).sum()
    }
}

/// Two JSON files under `<state>/schedule/`: definitions and history.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    definitions: StateFile,
    history: StateFile,
}

impl ScheduleStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref().join("schedule");
        Self {
            definitions: StateFile::new(dir.join("descriptors.json")),
            history: StateFile::new(dir.join("history.json")),
        }
    }

    pub async fn load_definitions(&self) -> Result<Option<Vec<JobDescriptor>>> {
        self.definitions.load().await
    }

    pub async fn save_definitions(&self, descriptors: &[JobDescriptor]) -> Result<()> {
        self.definitions.save(&descriptors).await
    }

    pub async fn load_history(&self) -> Result<BTreeMap<String, ExecutionHistory>> {
        Ok(self.history.load().await?.unwrap_or_default())
    }

    pub async fn save_history(&self, history: &BTreeMap<String, ExecutionHistory>) -> Result<()> {
        self.history.save(history).await
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub bands: BTreeMap<ScheduleBand, RecurrenceRule>,
    pub misfire_grace: chrono::Duration,
    pub sources: SourceSelector,
    pub max_pages: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let rule = |hours: &[u32], minutes: &[u32]| {
            RecurrenceRule::new(hours.iter().copied(), minutes.iter().copied())
        };
        let mut bands = BTreeMap::new();
        for (band, hours, minutes) in [
            (ScheduleBand::Morning, &[6, 7, 8, 9][..], &[0, 30][..]),
            (ScheduleBand::Day, &[12, 15][..], &[0][..]),
            (ScheduleBand::Evening, &[18, 19, 20, 21][..], &[0, 30][..]),
        ] {
            if let Ok(rule) = rule(hours, minutes) {
                bands.insert(band, rule);
            }
        }
        Self {
            bands,
            misfire_grace: chrono::Duration::seconds(300),
            sources: SourceSelector::All,
            max_pages: 5,
        }
    }
}

fn parse_list(key: &str, raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("{key}: `{part}` is not a number"))
        })
        .collect()
}

impl ScheduleConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        for band in ScheduleBand::ALL {
            let upper = band.as_str().to_ascii_uppercase();
            let hours_key = format!("SCHEDULE_{upper}_HOURS");
            let minutes_key = format!("SCHEDULE_{upper}_MINUTES");
            let current = config.bands.get(&band).cloned();
            let hours = match lookup(&hours_key) {
                Some(raw) => parse_list(&hours_key, &raw)?,
                None => current
                    .as_ref()
                    .map(|r| r.hours().iter().map(|h| u32::from(*h)).collect())
                    .unwrap_or_default(),
            };
            let minutes = match lookup(&minutes_key) {
                Some(raw) => parse_list(&minutes_key, &raw)?,
                None => current
                    .as_ref()
                    .map(|r| r.minutes().iter().map(|m| u32::from(*m)).collect())
                    .unwrap_or_default(),
            };
            let rule = RecurrenceRule::new(hours, minutes)
                .with_context(|| format!("invalid {} schedule", band.as_str()))?;
            config.bands.insert(band, rule);
        }
        if let Some(raw) = lookup("SCHEDULE_MISFIRE_GRACE_SECS") {
            let secs: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("SCHEDULE_MISFIRE_GRACE_SECS: `{raw}` is not a number"))?;
            config.misfire_grace = chrono::Duration::seconds(secs.max(0));
        }
        if let Some(raw) = lookup("SCHEDULE_SOURCES") {
            let ids: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            if !ids.is_empty() {
                config.sources = SourceSelector::Only(ids);
            }
        }
        if let Some(raw) = lookup("YOTCREW_MAX_PAGES") {
            let pages: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("YOTCREW_MAX_PAGES: `{raw}` is not a number"))?;
            if pages == 0 {
                return Err(ScheduleError::InvalidMaxPages.into());
            }
            config.max_pages = pages;
        }
        Ok(config)
    }

    pub fn descriptors(&self) -> Vec<JobDescriptor> {
        self.bands
            .iter()
            .map(|(band, rule)| JobDescriptor {
                id: band.descriptor_id(),
                band: *band,
                rule: rule.clone(),
                selector: self.sources.clone(),
                max_pages: self.max_pages,
                paused: false,
            })
            .collect()
    }
}

/// What the scheduler starts when a slot fires.
#[async_trait]
pub trait RunLauncher: Send + Sync + 'static {
    fn source_ids(&self) -> Vec<String>;

    async fn launch(&self, sources: Vec<String>, max_pages: u32) -> Vec<RunSummary>;
}

#[async_trait]
impl RunLauncher for Orchestrator {
    fn source_ids(&self) -> Vec<String> {
        Orchestrator::source_ids(self)
    }

    async fn launch(&self, sources: Vec<String>, max_pages: u32) -> Vec<RunSummary> {
        self.run_all(&sources, max_pages).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchDecision {
    Enqueued,
    Paused,
    AlreadyFired,
    Misfired,
    Coalesced,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorState {
    Idle,
    Armed,
    Firing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorStatus {
    pub id: String,
    pub band: ScheduleBand,
    pub state: DescriptorState,
    pub cron: String,
    pub runs_per_day: usize,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_slot: Option<DateTime<Utc>>,
    pub misfires: u32,
}

/// One upcoming fire time, as listed by [`ScrapeScheduler::get_next_runs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextRun {
    pub descriptor_id: String,
    pub band: ScheduleBand,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_daily_runs: usize,
    pub descriptors: Vec<DescriptorStatus>,
    pub recent_summaries: Vec<RunSummary>,
}

struct CronHandle {
    scheduler: JobScheduler,
    jobs: HashMap<String, Uuid>,
}

struct SchedulerInner {
    launcher: Arc<dyn RunLauncher>,
    store: Option<ScheduleStore>,
    grace: chrono::Duration,
    manual_max_pages: u32,
    book: Mutex<ScheduleBook>,
    in_flight: Mutex<HashSet<String>>,
    cron: Mutex<Option<CronHandle>>,
    tasks: TaskTracker,
}

/// Timer-driven dispatcher. Dispatch only enqueues; each run is its own task.
#[derive(Clone)]
pub struct ScrapeScheduler {
    inner: Arc<SchedulerInner>,
}

impl ScrapeScheduler {
    /// Persisted definitions win over `config` so reconfiguration survives restarts.
    pub async fn open(
        launcher: Arc<dyn RunLauncher>,
        config: ScheduleConfig,
        store: Option<ScheduleStore>,
    ) -> Result<Self> {
        let mut book = ScheduleBook {
            descriptors: config.descriptors(),
            history: BTreeMap::new(),
        };
        if let Some(store) = &store {
            if let Some(saved) = store.load_definitions().await? {
                book.descriptors = saved;
            } else {
                store.save_definitions(&book.descriptors).await?;
            }
            book.history = store.load_history().await?;
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                launcher,
                store,
                grace: config.misfire_grace,
                manual_max_pages: config.max_pages,
                book: Mutex::new(book),
                in_flight: Mutex::new(HashSet::new()),
                cron: Mutex::new(None),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub async fn list_descriptors(&self) -> Vec<JobDescriptor> {
        self.inner.book.lock().await.descriptors.clone()
    }

    pub async fn history(&self, key: &str) -> Option<ExecutionHistory> {
        self.inner.book.lock().await.history.get(key).cloned()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.cron.lock().await.is_some()
    }

    /// Arms every descriptor and catches up on slots missed while stopped.
    /// Returns false when already running.
    pub async fn start(&self) -> Result<bool> {
        let mut cron = self.inner.cron.lock().await;
        if cron.is_some() {
            return Ok(false);
        }

        let scheduler = JobScheduler::new().await.context("creating cron scheduler")?;
        let descriptors = self.list_descriptors().await;
        let mut jobs = HashMap::new();
        for descriptor in &descriptors {
            let job_id = self.add_cron_job(&scheduler, descriptor).await?;
            jobs.insert(descriptor.id.clone(), job_id);
        }
        scheduler.start().await.context("starting cron scheduler")?;
        *cron = Some(CronHandle { scheduler, jobs });
        drop(cron);

        let now = Utc::now();
        let decisions = self.catch_up(now).await;
        for (id, decision) in decisions {
            info!(descriptor = %id, ?decision, "catch-up after start");
        }
        {
            let mut book = self.inner.book.lock().await;
            for descriptor in &descriptors {
                book.history
                    .entry(descriptor.id.clone())
                    .or_default()
                    .armed_at
                    .get_or_insert(now);
            }
        }
        self.persist_history().await;
        info!(descriptors = descriptors.len(), "scheduler started");
        Ok(true)
    }

    /// Disarms all descriptors; in-flight runs keep going. Returns false when not running.
    pub async fn stop(&self) -> Result<bool> {
        let handle = self.inner.cron.lock().await.take();
        let Some(mut handle) = handle else {
            return Ok(false);
        };
        handle
            .scheduler
            .shutdown()
            .await
            .context("stopping cron scheduler")?;
        info!("scheduler stopped");
        Ok(true)
    }

    /// Stops and re-arms from the current definitions, catching up on missed slots.
    pub async fn restart(&self) -> Result<()> {
        info!("restarting scheduler");
        self.stop().await?;
        self.start().await?;
        Ok(())
    }

    /// Waits until every run enqueued so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    async fn add_cron_job(&self, scheduler: &JobScheduler, descriptor: &JobDescriptor) -> Result<Uuid> {
        let cron = descriptor.rule.cron_expression();
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let id = descriptor.id.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let weak = weak.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    ScrapeScheduler { inner }.on_tick(&id).await;
                }
            })
        })
        .with_context(|| format!("creating cron job `{cron}` for {}", descriptor.id))?;
        scheduler
            .add(job)
            .await
            .with_context(|| format!("adding cron job for {}", descriptor.id))
    }

    async fn on_tick(&self, id: &str) {
        let now = Utc::now();
        let slot = {
            let book = self.inner.book.lock().await;
            book.descriptor(id)
                .and_then(|d| d.rule.latest_at_or_before(now))
        };
        let Some(slot) = slot else {
            warn!(descriptor = %id, "tick for a descriptor with no matching slot");
            return;
        };
        let decision = self.dispatch(id, slot, now).await;
        debug!(descriptor = %id, %slot, ?decision, "tick dispatched");
    }

    /// Dispatches every armed descriptor whose latest slot has not fired yet.
    pub async fn catch_up(&self, now: DateTime<Utc>) -> Vec<(String, DispatchDecision)> {
        let pending: Vec<(String, DateTime<Utc>)> = {
            let book = self.inner.book.lock().await;
            book.descriptors
                .iter()
                .filter_map(|descriptor| {
                    let slot = descriptor.rule.latest_at_or_before(now)?;
                    let history = book.history.get(&descriptor.id)?;
                    let armed_at = history.armed_at?;
                    let already = history.last_fired_slot.is_some_and(|fired| fired >= slot);
                    (slot > armed_at && !already).then(|| (descriptor.id.clone(), slot))
                })
                .collect()
        };
        let mut decisions = Vec::with_capacity(pending.len());
        for (id, slot) in pending {
            let decision = self.dispatch(&id, slot, now).await;
            decisions.push((id, decision));
        }
        decisions
    }

    /// Decides what happens to `slot` of descriptor `id` observed at `now`.
    pub async fn dispatch(&self, id: &str, slot: DateTime<Utc>, now: DateTime<Utc>) -> DispatchDecision {
        let mut book = self.inner.book.lock().await;
        let Some(descriptor) = book.descriptor(id).cloned() else {
            warn!(descriptor = %id, "dispatch for unknown descriptor");
            return DispatchDecision::Unknown;
        };
        if descriptor.paused {
            debug!(descriptor = %id, %slot, "descriptor paused");
            return DispatchDecision::Paused;
        }
        let history = book.history.entry(id.to_string()).or_default();
        if history.last_fired_slot.is_some_and(|fired| fired >= slot) {
            return DispatchDecision::AlreadyFired;
        }

        let lateness = now - slot;
        let decision = if lateness > self.inner.grace {
            history.misfires += 1;
            history.last_fired_slot = Some(slot);
            warn!(
                descriptor = %id,
                %slot,
                late_secs = lateness.num_seconds(),
                "misfire beyond grace period, skipping slot"
            );
            DispatchDecision::Misfired
        } else if !self.inner.in_flight.lock().await.insert(id.to_string()) {
            history.last_fired_slot = Some(slot);
            info!(descriptor = %id, %slot, "previous run still in flight, coalescing");
            DispatchDecision::Coalesced
        } else {
            history.last_fired_slot = Some(slot);
            history.last_started_at = Some(now);
            let sources = descriptor.selector.resolve(self.inner.launcher.source_ids());
            self.spawn_run(id.to_string(), sources, descriptor.max_pages);
            info!(descriptor = %id, %slot, "run enqueued");
            DispatchDecision::Enqueued
        };
        drop(book);
        self.persist_history().await;
        decision
    }

    /// Runs one source (or every registered source) now, outside the timetable.
    pub async fn trigger_now(&self, source_id: Option<&str>) -> DispatchDecision {
        if !self
            .inner
            .in_flight
            .lock()
            .await
            .insert(MANUAL_HISTORY_KEY.to_string())
        {
            info!("manual run already in flight, coalescing");
            return DispatchDecision::Coalesced;
        }
        let sources = match source_id {
            Some(id) => vec![id.to_string()],
            None => self.inner.launcher.source_ids(),
        };
        {
            let mut book = self.inner.book.lock().await;
            book.history
                .entry(MANUAL_HISTORY_KEY.to_string())
                .or_default()
                .last_started_at = Some(Utc::now());
        }
        self.spawn_run(MANUAL_HISTORY_KEY.to_string(), sources, self.inner.manual_max_pages);
        DispatchDecision::Enqueued
    }

    fn spawn_run(&self, key: String, sources: Vec<String>, max_pages: u32) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            let launcher = inner.launcher.clone();
            let launch_sources = sources.clone();
            let outcome =
                tokio::spawn(async move { launcher.launch(launch_sources, max_pages).await }).await;
            let summaries = match outcome {
                Ok(summaries) => summaries,
                Err(err) => {
                    error!(descriptor = %key, error = %err, "scheduled run panicked");
                    sources
                        .into_iter()
                        .map(|source| {
                            let mut draft = RunSummaryDraft::start(source, 1);
                            draft.record_error(format!("run task failed: {err}"));
                            draft.finish(RunStatus::Failed)
                        })
                        .collect()
                }
            };
            {
                let mut book = inner.book.lock().await;
                let history = book.history.entry(key.clone()).or_default();
                history.last_finished_at = Some(Utc::now());
                history.push_summaries(summaries);
            }
            inner.in_flight.lock().await.remove(&key);
            ScrapeScheduler { inner }.persist_history().await;
        });
    }

    async fn persist_history(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let book = self.inner.book.lock().await;
        if let Err(err) = store.save_history(&book.history).await {
            warn!(error = %err, "failed to persist schedule history");
        }
    }

    async fn persist_definitions(&self, book: &ScheduleBook) -> Result<()> {
        match &self.inner.store {
            Some(store) => store.save_definitions(&book.descriptors).await,
            None => Ok(()),
        }
    }

    /// Replaces the rule of `band`'s descriptor and re-arms it if running.
    pub async fn update_recurrence(
        &self,
        band: ScheduleBand,
        hours: impl IntoIterator<Item = u32>,
        minutes: impl IntoIterator<Item = u32>,
    ) -> Result<JobDescriptor> {
        let rule = RecurrenceRule::new(hours, minutes)?;
        let updated = {
            let mut book = self.inner.book.lock().await;
            let descriptor = book
                .descriptors
                .iter_mut()
                .find(|d| d.band == band)
                .ok_or_else(|| ScheduleError::UnknownBand(band.as_str().to_string()))?;
            descriptor.rule = rule;
            let updated = descriptor.clone();
            self.persist_definitions(&book).await?;
            updated
        };

        let mut cron = self.inner.cron.lock().await;
        if let Some(handle) = cron.as_mut() {
            if let Some(old) = handle.jobs.remove(&updated.id) {
                handle
                    .scheduler
                    .remove(&old)
                    .await
                    .with_context(|| format!("removing cron job for {}", updated.id))?;
            }
            let job_id = self.add_cron_job(&handle.scheduler, &updated).await?;
            handle.jobs.insert(updated.id.clone(), job_id);
        }
        info!(
            descriptor = %updated.id,
            cron = %updated.rule.cron_expression(),
            runs_per_day = updated.rule.runs_per_day(),
            "recurrence updated"
        );
        Ok(updated)
    }

    pub async fn update_hours(
        &self,
        band: ScheduleBand,
        hours: impl IntoIterator<Item = u32>,
    ) -> Result<JobDescriptor> {
        let minutes = self.current_rule(band).await?.minutes().clone();
        self.update_recurrence(band, hours, minutes.into_iter().map(u32::from))
            .await
    }

    pub async fn update_minutes(
        &self,
        band: ScheduleBand,
        minutes: impl IntoIterator<Item = u32>,
    ) -> Result<JobDescriptor> {
        let hours = self.current_rule(band).await?.hours().clone();
        self.update_recurrence(band, hours.into_iter().map(u32::from), minutes)
            .await
    }

    async fn current_rule(&self, band: ScheduleBand) -> Result<RecurrenceRule, ScheduleError> {
        self.inner
            .book
            .lock()
            .await
            .descriptors
            .iter()
            .find(|d| d.band == band)
            .map(|d| d.rule.clone())
            .ok_or_else(|| ScheduleError::UnknownBand(band.as_str().to_string()))
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.set_paused(id, true).await
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.set_paused(id, false).await
    }

    async fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
        let mut book = self.inner.book.lock().await;
        let descriptor = book
            .descriptor_mut(id)
            .ok_or_else(|| ScheduleError::UnknownDescriptor(id.to_string()))?;
        descriptor.paused = paused;
        self.persist_definitions(&book).await?;
        info!(descriptor = %id, paused, "descriptor pause state changed");
        Ok(())
    }

    /// Deletes a descriptor and disarms it. Its history and any in-flight run are kept.
    pub async fn remove_job(&self, id: &str) -> Result<JobDescriptor> {
        let removed = {
            let mut book = self.inner.book.lock().await;
            let position = book
                .descriptors
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| ScheduleError::UnknownDescriptor(id.to_string()))?;
            let removed = book.descriptors.remove(position);
            self.persist_definitions(&book).await?;
            removed
        };

        let mut cron = self.inner.cron.lock().await;
        if let Some(handle) = cron.as_mut() {
            if let Some(job_id) = handle.jobs.remove(id) {
                handle
                    .scheduler
                    .remove(&job_id)
                    .await
                    .with_context(|| format!("removing cron job for {id}"))?;
            }
        }
        info!(descriptor = %id, "descriptor removed");
        Ok(removed)
    }

    pub async fn get_status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let running = self.is_running().await;
        let in_flight = self.inner.in_flight.lock().await.clone();
        let book = self.inner.book.lock().await;

        let descriptors = book
            .descriptors
            .iter()
            .map(|descriptor| {
                let history = book.history.get(&descriptor.id);
                descriptor_status(descriptor, history, &in_flight, running, now)
            })
            .collect();

        let mut recent_summaries: Vec<RunSummary> = book
            .history
            .values()
            .flat_map(|h| h.recent.iter().cloned())
            .collect();
        recent_summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        recent_summaries.truncate(STATUS_SUMMARY_LIMIT);

        SchedulerStatus {
            running,
            total_daily_runs: book.total_daily_runs(),
            descriptors,
            recent_summaries,
        }
    }

    /// Status of a single descriptor, or `None` when it does not exist.
    pub async fn get_job_status(&self, id: &str, now: DateTime<Utc>) -> Option<DescriptorStatus> {
        let running = self.is_running().await;
        let in_flight = self.inner.in_flight.lock().await.clone();
        let book = self.inner.book.lock().await;
        let descriptor = book.descriptor(id)?;
        Some(descriptor_status(descriptor, book.history.get(id), &in_flight, running, now))
    }

    /// The next `limit` fire times across all unpaused descriptors, soonest first.
    pub async fn get_next_runs(&self, now: DateTime<Utc>, limit: usize) -> Vec<NextRun> {
        let book = self.inner.book.lock().await;
        let mut runs = Vec::new();
        for descriptor in book.descriptors.iter().filter(|d| !d.paused) {
            let mut after = now;
            for _ in 0..limit {
                let Some(fire_at) = descriptor.rule.next_after(after) else {
                    break;
                };
                runs.push(NextRun {
                    descriptor_id: descriptor.id.clone(),
                    band: descriptor.band,
                    fire_at,
                });
                after = fire_at;
            }
        }
        runs.sort_by(|a, b| {
            a.fire_at
                .cmp(&b.fire_at)
                .then_with(|| a.descriptor_id.cmp(&b.descriptor_id))
        });
        runs.truncate(limit);
        runs
    }
}

fn descriptor_status(
    descriptor: &JobDescriptor,
    history: Option<&ExecutionHistory>,
    in_flight: &HashSet<String>,
    running: bool,
    now: DateTime<Utc>,
) -> DescriptorStatus {
    let state = if descriptor.paused {
        DescriptorState::Paused
    } else if in_flight.contains(&descriptor.id) {
        DescriptorState::Firing
    } else if running {
        DescriptorState::Armed
    } else {
        DescriptorState::Idle
    };
    DescriptorStatus {
        id: descriptor.id.clone(),
        band: descriptor.band,
        state,
        cron: descriptor.rule.cron_expression(),
        runs_per_day: descriptor.rule.runs_per_day(),
        next_fire_at: if descriptor.paused {
            None
        } else {
            descriptor.rule.next_after(now)
        },
        last_fired_slot: history.and_then(|h| h.last_fired_slot),
        misfires: history.map(|h| h.misfires).unwrap_or(0),
    }
}
