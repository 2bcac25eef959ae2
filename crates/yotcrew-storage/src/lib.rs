//! Job persistence, dedup upsert, atomic state files and HTTP fetch utilities for YotCrew.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use yotcrew_core::{
    Currency, Department, EmploymentType, IdentityKey, JobRecord, PayPeriod, RunStatus,
    RunSummary, VesselSize, VesselType,
};

pub const CRATE_NAME: &str = "yotcrew-storage";

/// A canonical record as held by the store, with store-assigned bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: Uuid,
    pub record: JobRecord,
    pub content_hash: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredJob {
    pub fn identity(&self) -> IdentityKey {
        self.record.identity()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {0}")]
    Conflict(IdentityKey),
    #[error("record {0} not found")]
    NotFound(IdentityKey),
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("stored row is malformed: {0}")]
    Corrupt(String),
}

/// Range-query filters over stored jobs. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub source_id: Option<String>,
    pub department: Option<Department>,
    pub employment_type: Option<EmploymentType>,
    pub vessel_type: Option<VesselType>,
    pub location_contains: Option<String>,
    pub text: Option<String>,
    pub min_quality: Option<f64>,
    pub posted_after: Option<DateTime<Utc>>,
    pub include_inactive: bool,
}

impl JobQuery {
    pub fn matches(&self, job: &StoredJob) -> bool {
        let record = &job.record;
        if !self.include_inactive && !job.is_active {
            return false;
        }
        if self
            .source_id
            .as_ref()
            .is_some_and(|id| id != &record.source_id)
        {
            return false;
        }
        if self.department.is_some() && self.department != record.department {
            return false;
        }
        if self.employment_type.is_some() && self.employment_type != record.employment_type {
            return false;
        }
        if self.vessel_type.is_some() && self.vessel_type != record.vessel_type {
            return false;
        }
        if let Some(needle) = &self.location_contains {
            let needle = needle.to_lowercase();
            let hit = record
                .location
                .as_deref()
                .is_some_and(|loc| loc.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(needle) = &self.text {
            let needle = needle.to_lowercase();
            if !record.title.to_lowercase().contains(&needle)
                && !record.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if self
            .min_quality
            .is_some_and(|min| record.quality_score < min)
        {
            return false;
        }
        if let Some(after) = self.posted_after {
            if record.posted_at.map_or(true, |posted| posted < after) {
                return false;
            }
        }
        true
    }
}

/// Conditional write primitives. Each write is atomic per identity key; a mismatched
/// `expected_version` or an existing key yields [`StoreError::Conflict`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredJob>, StoreError>;

    async fn insert(
        &self,
        record: &JobRecord,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError>;

    async fn replace(
        &self,
        record: &JobRecord,
        content_hash: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError>;

    /// Refreshes `observed_at` and the derived score, reactivating the record. Neither
    /// `updated_at` nor `version` moves.
    async fn touch(
        &self,
        key: &IdentityKey,
        observed_at: DateTime<Utc>,
        quality_score: f64,
        expected_version: i64,
    ) -> Result<(), StoreError>;

    /// Ordered by `observed_at` descending, then identity. `page` is zero-based.
    async fn query(
        &self,
        query: &JobQuery,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError>;

    /// Flags active records of `source_id` last observed before `seen_before` as inactive.
    async fn mark_stale(
        &self,
        source_id: &str,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// `updated_at` never moves backwards, even when the wall clock does.
fn next_updated_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<IdentityKey, StoredJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredJob>, StoreError> {
        Ok(self.jobs.read().await.get(key).cloned())
    }

    async fn insert(
        &self,
        record: &JobRecord,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        let key = record.identity();
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key) {
            return Err(StoreError::Conflict(key));
        }
        let stored = StoredJob {
            id: key.record_id(),
            record: record.clone(),
            content_hash: content_hash.to_string(),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(
        &self,
        record: &JobRecord,
        content_hash: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        let key = record.identity();
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if existing.version != expected_version {
            return Err(StoreError::Conflict(key));
        }
        existing.record = record.clone();
        existing.content_hash = content_hash.to_string();
        existing.version += 1;
        existing.is_active = true;
        existing.updated_at = next_updated_at(existing.updated_at, now);
        Ok(existing.clone())
    }

    async fn touch(
        &self,
        key: &IdentityKey,
        observed_at: DateTime<Utc>,
        quality_score: f64,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let existing = jobs
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if existing.version != expected_version {
            return Err(StoreError::Conflict(key.clone()));
        }
        existing.record.observed_at = observed_at;
        existing.record.quality_score = quality_score;
        existing.is_active = true;
        Ok(())
    }

    async fn query(
        &self,
        query: &JobQuery,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut hits: Vec<StoredJob> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        hits.sort_by(|a, b| {
            b.record
                .observed_at
                .cmp(&a.record.observed_at)
                .then_with(|| a.identity().cmp(&b.identity()))
        });
        Ok(hits
            .into_iter()
            .skip(page.saturating_mul(limit))
            .take(limit)
            .collect())
    }

    async fn mark_stale(
        &self,
        source_id: &str,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut flagged = 0;
        for job in jobs.values_mut() {
            if job.is_active
                && job.record.source_id == source_id
                && job.record.observed_at < seen_before
            {
                job.is_active = false;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.jobs.read().await.len() as u64)
    }
}

const JOB_COLUMNS: &str = "id, source_id, external_id, title, organization, description, location, \
     employment_type, department, vessel_type, vessel_size, salary_range, salary_currency, \
     salary_period, start_date, posted_at, observed_at, quality_score, source_url, raw_payload, \
     content_hash, version, is_active, created_at, updated_at";

/// Postgres-backed store. Optimistic writes use the `version` column.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    pub async fn record_run_summary(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_summaries (
                run_id, source_id, started_at, finished_at, status, pages_attempted, found,
                new_count, updated_count, unchanged_count, error_count, errors_truncated,
                stale_marked, error_messages
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(summary.run_id)
        .bind(&summary.source_id)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.status.as_str())
        .bind(i64::from(summary.pages_attempted))
        .bind(i64::from(summary.found))
        .bind(i64::from(summary.new))
        .bind(i64::from(summary.updated))
        .bind(i64::from(summary.unchanged))
        .bind(i64::from(summary.errors))
        .bind(i64::from(summary.errors_truncated))
        .bind(count_to_column("stale_marked", summary.stale_marked)?)
        .bind(serde_json::Value::from(summary.error_messages.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_run_summaries(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, source_id, started_at, finished_at, status, pages_attempted, found,
                   new_count, updated_count, unchanged_count, error_count, errors_truncated,
                   stale_marked, error_messages
              FROM run_summaries
             ORDER BY finished_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_summary_from_row).collect()
    }
}

fn run_status_from_str(value: &str) -> Result<RunStatus, StoreError> {
    match value {
        "completed" => Ok(RunStatus::Completed),
        "unreachable" => Ok(RunStatus::Unreachable),
        "circuit_open" => Ok(RunStatus::CircuitOpen),
        "cancelled" => Ok(RunStatus::Cancelled),
        "failed" => Ok(RunStatus::Failed),
        other => Err(StoreError::Corrupt(format!("unknown run status `{other}`"))),
    }
}

fn count_to_column(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{column} {value} exceeds BIGINT")))
}

fn count_from_column<T: TryFrom<i64>>(column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} {value} out of range")))
}

fn run_summary_from_row(row: &PgRow) -> Result<RunSummary, StoreError> {
    let status: String = row.try_get("status")?;
    let messages: serde_json::Value = row.try_get("error_messages")?;
    let error_messages = serde_json::from_value(messages)
        .map_err(|err| StoreError::Corrupt(format!("error_messages: {err}")))?;
    let count = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        count_from_column(column, value)
    };
    let stale: i64 = row.try_get("stale_marked")?;
    Ok(RunSummary {
        run_id: row.try_get("run_id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: run_status_from_str(&status)?,
        pages_attempted: count("pages_attempted")?,
        found: count("found")?,
        new: count("new_count")?,
        updated: count("updated_count")?,
        unchanged: count("unchanged_count")?,
        errors: count("error_count")?,
        error_messages,
        errors_truncated: count("errors_truncated")?,
        stale_marked: count_from_column("stale_marked", stale)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<StoredJob, StoreError> {
    let label = |column: &str| -> Result<Option<String>, StoreError> { Ok(row.try_get(column)?) };
    let record = JobRecord {
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        organization: row.try_get("organization")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        employment_type: label("employment_type")?.map(|v| EmploymentType::from_label(&v)),
        department: label("department")?.map(|v| Department::from_label(&v)),
        vessel_type: label("vessel_type")?.map(|v| VesselType::from_label(&v)),
        vessel_size: label("vessel_size")?.map(|v| VesselSize::from_label(&v)),
        salary_range: row.try_get("salary_range")?,
        salary_currency: label("salary_currency")?.map(|v| Currency::from_label(&v)),
        salary_period: label("salary_period")?.map(|v| PayPeriod::from_label(&v)),
        start_date: row.try_get("start_date")?,
        posted_at: row.try_get("posted_at")?,
        observed_at: row.try_get("observed_at")?,
        quality_score: row.try_get("quality_score")?,
        source_url: row.try_get("source_url")?,
        raw_payload: row.try_get("raw_payload")?,
    };
    Ok(StoredJob {
        id: row.try_get("id")?,
        record,
        content_hash: row.try_get("content_hash")?,
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn get(&self, key: &IdentityKey) -> Result<Option<StoredJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE source_id = $1 AND external_id = $2");
        let row = sqlx::query(&sql)
            .bind(&key.source_id)
            .bind(&key.external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn insert(
        &self,
        record: &JobRecord,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        let key = record.identity();
        let sql = format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, 1, TRUE, $22, $22)
            ON CONFLICT (source_id, external_id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(key.record_id())
            .bind(&record.source_id)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.organization)
            .bind(&record.description)
            .bind(&record.location)
            .bind(record.employment_type.map(|v| v.as_str()))
            .bind(record.department.map(|v| v.as_str()))
            .bind(record.vessel_type.map(|v| v.as_str()))
            .bind(record.vessel_size.map(|v| v.as_str()))
            .bind(&record.salary_range)
            .bind(record.salary_currency.map(|v| v.as_str()))
            .bind(record.salary_period.map(|v| v.as_str()))
            .bind(&record.start_date)
            .bind(record.posted_at)
            .bind(record.observed_at)
            .bind(record.quality_score)
            .bind(&record.source_url)
            .bind(&record.raw_payload)
            .bind(content_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::Conflict(key)),
        }
    }

    async fn replace(
        &self,
        record: &JobRecord,
        content_hash: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<StoredJob, StoreError> {
        let key = record.identity();
        let sql = format!(
            r#"
            UPDATE jobs
               SET title = $3, organization = $4, description = $5, location = $6,
                   employment_type = $7, department = $8, vessel_type = $9, vessel_size = $10,
                   salary_range = $11, salary_currency = $12, salary_period = $13,
                   start_date = $14, posted_at = $15, observed_at = $16, quality_score = $17,
                   source_url = $18, raw_payload = $19, content_hash = $20,
                   version = version + 1, is_active = TRUE,
                   updated_at = GREATEST($21, updated_at + INTERVAL '1 microsecond')
             WHERE source_id = $1 AND external_id = $2 AND version = $22
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&record.source_id)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.organization)
            .bind(&record.description)
            .bind(&record.location)
            .bind(record.employment_type.map(|v| v.as_str()))
            .bind(record.department.map(|v| v.as_str()))
            .bind(record.vessel_type.map(|v| v.as_str()))
            .bind(record.vessel_size.map(|v| v.as_str()))
            .bind(&record.salary_range)
            .bind(record.salary_currency.map(|v| v.as_str()))
            .bind(record.salary_period.map(|v| v.as_str()))
            .bind(&record.start_date)
            .bind(record.posted_at)
            .bind(record.observed_at)
            .bind(record.quality_score)
            .bind(&record.source_url)
            .bind(&record.raw_payload)
            .bind(content_hash)
            .bind(now)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::Conflict(key)),
        }
    }

    async fn touch(
        &self,
        key: &IdentityKey,
        observed_at: DateTime<Utc>,
        quality_score: f64,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET observed_at = $3, quality_score = $4, is_active = TRUE
             WHERE source_id = $1 AND external_id = $2 AND version = $5
            "#,
        )
        .bind(&key.source_id)
        .bind(&key.external_id)
        .bind(observed_at)
        .bind(quality_score)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(key.clone()));
        }
        Ok(())
    }

    async fn query(
        &self,
        query: &JobQuery,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        if !query.include_inactive {
            builder.push(" AND is_active");
        }
        if let Some(source_id) = &query.source_id {
            builder.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if let Some(department) = query.department {
            builder.push(" AND department = ").push_bind(department.as_str());
        }
        if let Some(employment_type) = query.employment_type {
            builder
                .push(" AND employment_type = ")
                .push_bind(employment_type.as_str());
        }
        if let Some(vessel_type) = query.vessel_type {
            builder.push(" AND vessel_type = ").push_bind(vessel_type.as_str());
        }
        if let Some(location) = &query.location_contains {
            builder
                .push(" AND location ILIKE ")
                .push_bind(format!("%{location}%"));
        }
        if let Some(text) = &query.text {
            let pattern = format!("%{text}%");
            builder
                .push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(min_quality) = query.min_quality {
            builder.push(" AND quality_score >= ").push_bind(min_quality);
        }
        if let Some(after) = query.posted_after {
            builder.push(" AND posted_at >= ").push_bind(after);
        }
        builder
            .push(" ORDER BY observed_at DESC, source_id, external_id LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(page.saturating_mul(limit) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_stale(
        &self,
        source_id: &str,
        seen_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET is_active = FALSE
             WHERE source_id = $1 AND is_active AND observed_at < $2
            "#,
        )
        .bind(source_id)
        .bind(seen_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Decides insert vs. update vs. touch by identity key and content fingerprint.
#[derive(Clone)]
pub struct DedupEngine {
    store: Arc<dyn JobStore>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// A conflicting concurrent write is retried once against a fresh read.
    pub async fn upsert(&self, record: &JobRecord) -> Result<UpsertOutcome, StoreError> {
        match self.try_upsert(record).await {
            Err(StoreError::Conflict(key)) => {
                debug!(identity = %key, "upsert conflict, retrying with fresh read");
                self.try_upsert(record).await
            }
            other => other,
        }
    }

    async fn try_upsert(&self, record: &JobRecord) -> Result<UpsertOutcome, StoreError> {
        let key = record.identity();
        let content_hash = record.content_fingerprint();
        let now = Utc::now();

        match self.store.get(&key).await? {
            None => {
                self.store.insert(record, &content_hash, now).await?;
                Ok(UpsertOutcome::Created)
            }
            Some(existing) if existing.content_hash == content_hash => {
                self.store
                    .touch(&key, record.observed_at, record.quality_score, existing.version)
                    .await?;
                Ok(UpsertOutcome::Unchanged)
            }
            Some(existing) => {
                self.store
                    .replace(record, &content_hash, existing.version, now)
                    .await?;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    pub async fn get_by_identity(&self, key: &IdentityKey) -> Result<Option<StoredJob>, StoreError> {
        self.store.get(key).await
    }

    pub async fn query(
        &self,
        query: &JobQuery,
        page: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        self.store.query(query, page, limit).await
    }
}

/// JSON document persisted with an atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub async fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding state file {}", self.path.display()))?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading state file {}", self.path.display()))
            }
        }
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value).context("encoding state")?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; YotCrewBot/0.1; +https://yotcrew.app/bot)";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 8,
            per_source_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared HTTP client with global and per-source concurrency limits. It performs a
/// single attempt per call and classifies failures; retries belong to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Permanent("http fetcher closed".into()))?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::Permanent("http fetcher closed".into()))?;

        let span = info_span!("http_fetch", source_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            warn!(status = status.as_u16(), "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url).await?.text())
    }
}
