use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use yotcrew_adapters::{
    ScriptedPage, SourcePlugin, SourceRegistry, StaticPagesPlugin, StaticSourceSpec,
};
use yotcrew_core::{Filters, IdentityKey, JobRecord, Normalizer, RawRecord, RunStatus};
use yotcrew_storage::{
    DedupEngine, FetchError, JobQuery, JobStore, MemoryJobStore, StoreError, StoredJob,
};
use yotcrew_sync::{BackoffPolicy, GovernorConfig, Orchestrator, RateGovernor, RunOptions};

fn raw(id: &str) -> RawRecord {
    json!({
        "id": id,
        "title": format!("Second Engineer {id}"),
        "company": "Riviera Crew Agency",
        "description": "Rotational engineering role on a 62m motor yacht",
        "location": "Antibes, France",
        "url": format!("https://crew.example.com/jobs/{id}"),
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn records(ids: &[&str]) -> Vec<RawRecord> {
    ids.iter().map(|id| raw(id)).collect()
}

fn options() -> RunOptions {
    RunOptions {
        max_concurrency: 3,
        source_stagger: Duration::ZERO,
        error_limit: 50,
        stale_after: chrono::Duration::days(14),
    }
}

fn quick_governor() -> RateGovernor {
    RateGovernor::new(GovernorConfig {
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        ..GovernorConfig::default()
    })
}

fn build(
    plugins: Vec<Arc<StaticPagesPlugin>>,
    governor: RateGovernor,
) -> (Orchestrator, Arc<MemoryJobStore>) {
    let mut registry = SourceRegistry::new();
    for plugin in plugins {
        registry.register(plugin as Arc<dyn SourcePlugin>).unwrap();
    }
    let store = Arc::new(MemoryJobStore::new());
    let dedup = DedupEngine::new(store.clone() as Arc<dyn JobStore>);
    let orchestrator = Orchestrator::new(registry, dedup, governor).with_options(options());
    (orchestrator, store)
}

#[tokio::test]
async fn bad_record_is_recorded_and_the_rest_of_the_page_is_kept() {
    let mut page = records(&["1", "2", "3", "4", "5"]);
    page[2].remove("title");
    let plugin = Arc::new(StaticPagesPlugin::with_pages("crew", vec![page]));
    let (orchestrator, store) = build(vec![plugin.clone()], quick_governor());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.found, 5);
    assert_eq!(summary.new, 4);
    assert_eq!(summary.errors, 1);
    assert!(summary.error_messages[0].contains("record 2"));
    assert_eq!(store.count().await.unwrap(), 4);
}

#[tokio::test]
async fn out_of_range_posted_date_counts_as_one_record_error() {
    let mut page = records(&["1", "2", "3"]);
    page[1].insert("posted_at".into(), json!("999999999 days ago"));
    let plugin = Arc::new(StaticPagesPlugin::with_pages("crew", vec![page]));
    let (orchestrator, store) = build(vec![plugin], quick_governor());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.found, 3);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.errors, 1);
    assert!(summary.error_messages[0].contains("record 1"));
    assert_eq!(store.count().await.unwrap(), 2);
}

/// Rejects every write for one external id, as if another writer always wins.
struct ContestedStore {
    inner: MemoryJobStore,
    contested: &'static str,
}

impl ContestedStore {
    fn check(&self, external_id: &str) -> Result<(), StoreError> {
        if external_id == self.contested {
            return Err(StoreError::Conflict(IdentityKey::new("crew", external_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for ContestedStore {
    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredJob>, StoreError> {
        self.inner.get(key).await
    }
    async fn insert(
        &self,
        record: &JobRecord,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        self.check(&record.external_id)?;
        self.inner.insert(record, content_hash, now).await
    }
    async fn replace(
        &self,
        record: &JobRecord,
        content_hash: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        self.check(&record.external_id)?;
        self.inner
            .replace(record, content_hash, expected_version, now)
            .await
    }
    async fn touch(
        &self,
        key: &IdentityKey,
        observed_at: DateTime<Utc>,
        quality_score: f64,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        self.check(&key.external_id)?;
        self.inner
            .touch(key, observed_at, quality_score, expected_version)
            .await
    }
    async fn query(
        &self,
        query: &JobQuery,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.query(query, page, limit).await
    }
    async fn mark_stale(
        &self,
        source_id: &str,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner.mark_stale(source_id, seen_before).await
    }
    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
}

#[tokio::test]
async fn persistent_store_conflict_is_recorded_and_the_page_continues() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages(
        "crew",
        vec![records(&["1", "2", "3"])],
    ));
    let mut registry = SourceRegistry::new();
    registry.register(plugin as Arc<dyn SourcePlugin>).unwrap();
    let store = Arc::new(ContestedStore {
        inner: MemoryJobStore::new(),
        contested: "2",
    });
    let orchestrator = Orchestrator::new(
        registry,
        DedupEngine::new(store.clone() as Arc<dyn JobStore>),
        quick_governor(),
    )
    .with_options(options());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.found, 3);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.errors, 1);
    assert!(summary.error_messages[0].starts_with("upsert"));
    assert_eq!(store.count().await.unwrap(), 2);
    assert!(store
        .get(&IdentityKey::new("crew", "3"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn pagination_stops_at_the_first_empty_page() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages(
        "crew",
        vec![records(&["a", "b", "c"]), records(&["d", "e"]), Vec::new()],
    ));
    let (orchestrator, _store) = build(vec![plugin.clone()], quick_governor());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.found, 5);
    assert_eq!(summary.new, 5);
    assert_eq!(summary.pages_attempted, 3);
    assert_eq!(plugin.fetched_pages().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn pagination_respects_max_pages() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages(
        "crew",
        vec![records(&["a"]), records(&["b"]), records(&["c"])],
    ));
    let (orchestrator, _store) = build(vec![plugin.clone()], quick_governor());

    let summary = orchestrator.run_source("crew", 2, &Filters::new()).await;

    assert_eq!(summary.found, 2);
    assert_eq!(plugin.fetched_pages().await, vec![0, 1]);
}

#[tokio::test]
async fn unreachable_source_short_circuits() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages("crew", vec![records(&["a"])]));
    plugin.set_reachable(false);
    let (orchestrator, _store) = build(vec![plugin.clone()], quick_governor());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Unreachable);
    assert_eq!(summary.pages_attempted, 0);
    assert_eq!(summary.errors, 1);
    assert_eq!(plugin.fetch_calls(), 0);
}

#[tokio::test]
async fn unknown_source_still_produces_a_summary() {
    let (orchestrator, _store) = build(Vec::new(), quick_governor());
    let summary = orchestrator.run_source("nowhere", 5, &Filters::new()).await;
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.errors, 1);
}

#[tokio::test]
async fn failed_page_is_skipped_and_later_pages_still_run() {
    let plugin = Arc::new(StaticPagesPlugin::new(StaticSourceSpec {
        source_id: "crew".into(),
        base_url: "https://crew.example.com".into(),
        filters: Vec::new(),
        reachable: true,
        min_interval_ms: 0,
        pages: vec![
            ScriptedPage::PermanentFailure {
                message: "404 on page 1".into(),
            },
            ScriptedPage::Records {
                records: records(&["a", "b"]),
            },
        ],
    }));
    let (orchestrator, _store) = build(vec![plugin.clone()], quick_governor());

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.stale_marked, 0);
    assert_eq!(plugin.fetched_pages().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn open_circuit_skips_fetches_across_runs() {
    let plugin = Arc::new(StaticPagesPlugin::new(StaticSourceSpec {
        source_id: "crew".into(),
        base_url: "https://crew.example.com".into(),
        filters: Vec::new(),
        reachable: true,
        min_interval_ms: 0,
        pages: vec![
            ScriptedPage::PermanentFailure {
                message: "500".into(),
            };
            4
        ],
    }));
    let governor = RateGovernor::new(GovernorConfig {
        backoff: BackoffPolicy {
            max_retries: 0,
            ..BackoffPolicy::default()
        },
        failure_threshold: 2,
        ..GovernorConfig::default()
    });
    let (orchestrator, _store) = build(vec![plugin.clone()], governor);

    let first = orchestrator.run_source("crew", 5, &Filters::new()).await;
    assert_eq!(first.status, RunStatus::CircuitOpen);
    assert_eq!(plugin.fetch_calls(), 2);

    assert_eq!(first.pages_attempted, 2);

    let second = orchestrator.run_source("crew", 5, &Filters::new()).await;
    assert_eq!(second.status, RunStatus::CircuitOpen);
    assert_eq!(second.found, 0);
    assert_eq!(second.pages_attempted, 0);
    assert_eq!(plugin.fetch_calls(), 2);
}

#[tokio::test]
async fn rerun_reports_unchanged_records() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages(
        "crew",
        vec![records(&["a", "b", "c"])],
    ));
    let (orchestrator, _store) = build(vec![plugin], quick_governor());

    let first = orchestrator.run_source("crew", 5, &Filters::new()).await;
    let second = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(first.new, 3);
    assert_eq!(second.new, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_run_all_creates_each_key_once() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages(
        "crew",
        vec![records(&["a", "b", "c"]), records(&["d"])],
    ));
    let (orchestrator, store) = build(vec![plugin], quick_governor());
    let ids = vec!["crew".to_string()];

    let (left, right) = tokio::join!(orchestrator.run_all(&ids, 5), orchestrator.run_all(&ids, 5));

    let created: u32 = left.iter().chain(right.iter()).map(|s| s.new).sum();
    let unchanged: u32 = left.iter().chain(right.iter()).map(|s| s.unchanged).sum();
    assert_eq!(created, 4);
    assert_eq!(unchanged, 4);
    assert_eq!(store.count().await.unwrap(), 4);
}

#[tokio::test]
async fn run_all_isolates_failures_and_keeps_order() {
    let healthy = Arc::new(StaticPagesPlugin::with_pages("healthy", vec![records(&["a"])]));
    let down = Arc::new(StaticPagesPlugin::with_pages("down", vec![records(&["b"])]));
    down.set_reachable(false);
    let (orchestrator, _store) = build(vec![down, healthy], quick_governor());

    let summaries = orchestrator
        .run_all(&["down".to_string(), "healthy".to_string()], 5)
        .await;

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].source_id, "down");
    assert_eq!(summaries[0].status, RunStatus::Unreachable);
    assert_eq!(summaries[1].source_id, "healthy");
    assert_eq!(summaries[1].new, 1);
}

#[tokio::test(start_paused = true)]
async fn run_all_staggers_source_starts() {
    let first = Arc::new(StaticPagesPlugin::with_pages("first", vec![records(&["a"])]));
    let second = Arc::new(StaticPagesPlugin::with_pages("second", vec![records(&["b"])]));
    let (orchestrator, _store) = build(vec![first, second], quick_governor());
    let orchestrator = orchestrator.with_options(RunOptions {
        source_stagger: Duration::from_secs(30),
        ..options()
    });

    let started = tokio::time::Instant::now();
    let summaries = orchestrator
        .run_all(&["first".to_string(), "second".to_string()], 5)
        .await;

    assert_eq!(summaries.len(), 2);
    assert!(tokio::time::Instant::now().duration_since(started) >= Duration::from_secs(30));
}

#[tokio::test]
async fn every_run_publishes_one_summary_event() {
    let a = Arc::new(StaticPagesPlugin::with_pages("a", vec![records(&["1"])]));
    let b = Arc::new(StaticPagesPlugin::with_pages("b", vec![records(&["2"])]));
    let (orchestrator, _store) = build(vec![a, b], quick_governor());
    let mut events = orchestrator.subscribe();

    orchestrator
        .run_all(&["a".to_string(), "b".to_string()], 5)
        .await;

    let mut seen = BTreeSet::new();
    for _ in 0..2 {
        seen.insert(events.recv().await.unwrap().source_id);
    }
    assert_eq!(seen, ["a".to_string(), "b".to_string()].into_iter().collect());
    assert!(events.try_recv().is_err());
}

/// Cancels the run while serving its first page.
struct CancellingPlugin {
    token: CancellationToken,
}

#[async_trait]
impl SourcePlugin for CancellingPlugin {
    fn identity(&self) -> &str {
        "cancelling"
    }

    fn base_url(&self) -> &str {
        "https://cancelling.example.com"
    }

    fn min_request_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn declared_filters(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn fetch_page(
        &self,
        page_index: u32,
        _filters: &Filters,
    ) -> Result<Vec<RawRecord>, FetchError> {
        self.token.cancel();
        let first = format!("p{page_index}-a");
        let second = format!("p{page_index}-b");
        Ok(records(&[first.as_str(), second.as_str()]))
    }
}

#[tokio::test]
async fn cancellation_finishes_the_in_flight_page_and_stops() {
    let token = CancellationToken::new();
    let mut registry = SourceRegistry::new();
    registry
        .register(Arc::new(CancellingPlugin {
            token: token.clone(),
        }))
        .unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let orchestrator = Orchestrator::new(
        registry,
        DedupEngine::new(store.clone() as Arc<dyn JobStore>),
        quick_governor(),
    )
    .with_options(options())
    .with_shutdown_token(token);

    let summary = orchestrator.run_source("cancelling", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.pages_attempted, 1);
    assert_eq!(summary.new, 2);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn cancelled_orchestrator_runs_nothing() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages("crew", vec![records(&["a"])]));
    let (orchestrator, _store) = build(vec![plugin.clone()], quick_governor());
    orchestrator.shutdown_token().cancel();

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.pages_attempted, 0);
    assert_eq!(plugin.probe_calls(), 0);
}

#[tokio::test]
async fn clean_run_marks_unseen_records_stale() {
    let plugin = Arc::new(StaticPagesPlugin::with_pages("crew", vec![records(&["fresh"])]));
    let (orchestrator, store) = build(vec![plugin], quick_governor());

    let long_ago = Utc::now() - chrono::Duration::days(40);
    let old = Normalizer::default()
        .normalize(&raw("gone"), "crew", long_ago)
        .unwrap();
    orchestrator.dedup().upsert(&old).await.unwrap();

    let summary = orchestrator.run_source("crew", 5, &Filters::new()).await;
    assert_eq!(summary.stale_marked, 1);

    let active = store.query(&JobQuery::default(), 0, 10).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].record.external_id, "fresh");
}

#[tokio::test]
async fn health_check_reports_every_source() {
    let up = Arc::new(StaticPagesPlugin::new(StaticSourceSpec {
        source_id: "up".into(),
        base_url: "https://up.example.com".into(),
        filters: vec!["location".into(), "department".into()],
        reachable: true,
        min_interval_ms: 0,
        pages: Vec::new(),
    }));
    let down = Arc::new(StaticPagesPlugin::with_pages("down", Vec::new()));
    down.set_reachable(false);
    let (orchestrator, _store) = build(vec![up, down], quick_governor());

    let report = orchestrator.health_check_all().await;
    assert_eq!(report.len(), 2);
    assert!(report[0].accessible);
    assert_eq!(report[0].supported_filters, vec!["department", "location"]);
    assert_eq!(report[0].base_url, "https://up.example.com");
    assert!(!report[1].accessible);

    let stats = orchestrator.source_stats();
    assert_eq!(stats.total_sources, 2);
    assert_eq!(stats.sources[1].source, "down");
}
