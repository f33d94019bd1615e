//! Structured incident log: every failure becomes a queryable record.
//!
//! Ids are `YYYY-MM-DD-NNN`, monotonic within a date. Allocation probes for
//! the first free suffix and claims it with a create-if-absent
//! compare-and-set, retrying on collision, so concurrent allocators never
//! mint the same id.
//!
//! Root causes come from a fixed, ordered rule table over the error code
//! and message; severities map from the pipeline error model
//! (`Critical`/`Fallback` → critical, `Degraded`/`Recoverable` → warning,
//! `Retryable` → recoverable). Critical incidents gain an auto-generated
//! post-mortem template on resolution.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, RwLock};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::collaborators::Clock;
use crate::errors::{ErrorCause, NexusError, Severity};
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError, paths};

// ── Record types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentSeverity {
    Recoverable,
    Warning,
    Critical,
}

impl IncidentSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recoverable => "RECOVERABLE",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Map pipeline error severity onto incident severity.
#[must_use]
pub fn incident_severity(severity: Severity) -> IncidentSeverity {
    match severity {
        Severity::Critical | Severity::Fallback => IncidentSeverity::Critical,
        Severity::Degraded | Severity::Recoverable => IncidentSeverity::Warning,
        Severity::Retryable => IncidentSeverity::Recoverable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    ApiOutage,
    RateLimit,
    QuotaExceeded,
    Timeout,
    NetworkError,
    AuthFailure,
    ConfigError,
    DataError,
    ResourceExhausted,
    DependencyFailure,
    Unknown,
}

/// The error snapshot embedded in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<ErrorCause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    Retry,
    Fallback,
    Skip,
    Manual,
    AutoRecovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    System,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    #[serde(rename = "type")]
    pub resolution_type: ResolutionType,
    pub resolved_by: ResolvedBy,
}

/// One entry in a post-mortem timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub event: String,
}

/// Impact section of a post-mortem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub pipeline_affected: String,
    pub stage_affected: String,
    pub potential_video_impact: String,
}

/// Auto-generated template attached to resolved critical incidents. The
/// analysis fields start empty for humans to fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMortem {
    pub timeline: Vec<TimelineEntry>,
    pub summary: String,
    pub impact: ImpactAssessment,
    pub root_cause_analysis: String,
    pub action_items: Vec<String>,
    pub lessons_learned: String,
}

/// The persisted `incidents/{id}` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub date: String,
    pub pipeline_id: String,
    pub stage: String,
    pub error: IncidentError,
    pub severity: IncidentSeverity,
    pub root_cause: RootCause,
    #[serde(default)]
    pub context: serde_json::Value,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_mortem: Option<PostMortem>,
    pub is_open: bool,
}

// ── Root-cause inference ───────────────────────────────────────────────

static ROOT_CAUSE_RULES: LazyLock<Vec<(Regex, RootCause)>> = LazyLock::new(|| {
    // First match wins; keep the more specific signals ahead of the
    // catch-alls (quota before rate-limit, timeout before exhausted).
    let rules: &[(&str, RootCause)] = &[
        (r"dependency|health|preflight", RootCause::DependencyFailure),
        (r"quota", RootCause::QuotaExceeded),
        (r"429|rate.?limit|too many requests", RootCause::RateLimit),
        (r"timeout|timed.?out|deadline", RootCause::Timeout),
        (
            r"auth|401|403|unauthorized|forbidden|credential|permission",
            RootCause::AuthFailure,
        ),
        (
            r"network|connection|dns|socket|refused|reset",
            RootCause::NetworkError,
        ),
        (r"config|env var|missing setting", RootCause::ConfigError),
        (r"parse|schema|invalid|malformed|corrupt", RootCause::DataError),
        (
            r"memory|disk|space|exhausted|capacity|buffer",
            RootCause::ResourceExhausted,
        ),
        (
            r"outage|unavailable|500|502|503|504",
            RootCause::ApiOutage,
        ),
    ];
    rules
        .iter()
        .map(|(pattern, cause)| {
            (Regex::new(pattern).expect("static pattern"), *cause)
        })
        .collect()
});

/// Infer a root cause from an error's code and message.
#[must_use]
pub fn infer_root_cause(code: &str, message: &str) -> RootCause {
    let haystack = format!("{code} {message}").to_ascii_lowercase();
    ROOT_CAUSE_RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(&haystack))
        .map(|(_, cause)| *cause)
        .unwrap_or(RootCause::Unknown)
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum IncidentLogError {
    #[error("incident not found: {id}")]
    #[diagnostic(code(nexus::incidents::not_found))]
    NotFound { id: String },

    #[error("could not allocate an incident id for {date} after {attempts} attempts")]
    #[diagnostic(
        code(nexus::incidents::id_contention),
        help("Heavy incident volume; allocation keeps losing the claim race.")
    )]
    IdContention { date: String, attempts: u32 },

    #[error(transparent)]
    #[diagnostic(code(nexus::incidents::store))]
    Store(#[from] StoreError),
}

// ── Digest ─────────────────────────────────────────────────────────────

/// Aggregated view of a date's incidents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentDigest {
    pub date: String,
    pub total: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_root_cause: BTreeMap<String, usize>,
    pub open_ids: Vec<String>,
}

// ── Logger ─────────────────────────────────────────────────────────────

const ID_ALLOC_ATTEMPTS: u32 = 10;
const CACHE_CAPACITY: usize = 256;

struct CachedIncident {
    fetched_at: DateTime<Utc>,
    record: IncidentRecord,
}

/// Store-backed incident logger with a bounded TTL read cache.
pub struct IncidentLogger {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: chrono::Duration,
    cache: RwLock<FxHashMap<String, CachedIncident>>,
}

impl IncidentLogger {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_cache_ttl(store, clock, chrono::Duration::minutes(5))
    }

    #[must_use]
    pub fn with_cache_ttl(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        cache_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            cache_ttl,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Log a pipeline error as an incident, allocating the next free id.
    #[instrument(skip(self, error), fields(code = %error.code))]
    pub async fn log_incident(
        &self,
        pipeline_id: &str,
        stage: &str,
        error: &NexusError,
    ) -> Result<IncidentRecord, IncidentLogError> {
        let now = self.clock.now();
        let date = now.format("%Y-%m-%d").to_string();
        let severity = incident_severity(error.severity);
        let root_cause = infer_root_cause(&error.code, &error.message);

        let record_base = IncidentRecord {
            id: String::new(),
            date: date.clone(),
            pipeline_id: pipeline_id.to_string(),
            stage: stage.to_string(),
            error: IncidentError {
                code: error.code.clone(),
                message: error.message.clone(),
                stack: error.cause.as_deref().cloned(),
            },
            severity,
            root_cause,
            context: error.context.clone(),
            start_time: now,
            end_time: None,
            duration_ms: None,
            resolution: None,
            post_mortem: None,
            is_open: true,
        };

        for attempt in 0..ID_ALLOC_ATTEMPTS {
            let suffix = self.next_free_suffix(&date).await? + attempt as usize;
            let id = format!("{date}-{suffix:03}");
            let mut record = record_base.clone();
            record.id = id.clone();

            let path = paths::incident(&id);
            let claimed = self
                .store
                .compare_and_set(
                    path.collection,
                    &path.id,
                    None,
                    serde_json::to_value(&record).map_err(StoreError::from)?,
                )
                .await?;
            if claimed {
                info!(incident = %id, severity = severity.as_str(), ?root_cause, "incident logged");
                self.cache_put(record.clone());
                return Ok(record);
            }
            // Someone else took the suffix; re-probe.
        }
        Err(IncidentLogError::IdContention {
            date,
            attempts: ID_ALLOC_ATTEMPTS,
        })
    }

    async fn next_free_suffix(&self, date: &str) -> Result<usize, IncidentLogError> {
        let rows = self
            .store
            .query("incidents", &[Filter::eq("date", date)])
            .await?;
        let max = rows
            .iter()
            .filter_map(|(id, _)| id.rsplit('-').next())
            .filter_map(|suffix| suffix.parse::<usize>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Resolve an incident. Resolving twice is a no-op returning the
    /// stored record.
    pub async fn resolve_incident(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> Result<IncidentRecord, IncidentLogError> {
        let path = paths::incident(id);
        let mut record: IncidentRecord = self
            .store
            .get_doc(path.collection, &path.id)
            .await?
            .ok_or_else(|| IncidentLogError::NotFound { id: id.to_string() })?;

        if record.end_time.is_some() {
            return Ok(record);
        }

        let now = self.clock.now();
        record.end_time = Some(now);
        record.duration_ms = Some((now - record.start_time).num_milliseconds().max(0) as u64);
        record.resolution = Some(resolution);
        record.is_open = false;
        if record.severity == IncidentSeverity::Critical {
            record.post_mortem = Some(build_post_mortem(&record, now));
        }

        self.store.set_doc(path.collection, &path.id, &record).await?;
        self.cache_put(record.clone());
        Ok(record)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Fetch by id, served from the TTL cache when fresh.
    pub async fn get(&self, id: &str) -> Result<Option<IncidentRecord>, IncidentLogError> {
        let now = self.clock.now();
        {
            let cache = self.cache.read().expect("incident cache lock");
            if let Some(cached) = cache.get(id)
                && now - cached.fetched_at < self.cache_ttl
            {
                return Ok(Some(cached.record.clone()));
            }
        }
        let path = paths::incident(id);
        let record: Option<IncidentRecord> =
            self.store.get_doc(path.collection, &path.id).await?;
        if let Some(record) = &record {
            self.cache_put(record.clone());
        }
        Ok(record)
    }

    pub async fn by_date(&self, date: &str) -> Result<Vec<IncidentRecord>, IncidentLogError> {
        self.query(&[Filter::eq("date", date)]).await
    }

    pub async fn by_stage(&self, stage: &str) -> Result<Vec<IncidentRecord>, IncidentLogError> {
        self.query(&[Filter::eq("stage", stage)]).await
    }

    pub async fn open(&self) -> Result<Vec<IncidentRecord>, IncidentLogError> {
        self.query(&[Filter::eq("is_open", true)]).await
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<IncidentRecord>, IncidentLogError> {
        let rows = self.store.query("incidents", filters).await?;
        let mut records = Vec::with_capacity(rows.len());
        for (_, doc) in rows {
            records.push(serde_json::from_value(doc).map_err(StoreError::from)?);
        }
        Ok(records)
    }

    /// Aggregate one date's incidents for the daily digest.
    pub async fn digest(&self, date: &str) -> Result<IncidentDigest, IncidentLogError> {
        let records = self.by_date(date).await?;
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_root_cause: BTreeMap<String, usize> = BTreeMap::new();
        let mut open_ids = Vec::new();
        for record in &records {
            *by_severity
                .entry(record.severity.as_str().to_string())
                .or_default() += 1;
            let cause = serde_json::to_value(record.root_cause)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *by_root_cause.entry(cause).or_default() += 1;
            if record.is_open {
                open_ids.push(record.id.clone());
            }
        }
        Ok(IncidentDigest {
            date: date.to_string(),
            total: records.len(),
            by_severity,
            by_root_cause,
            open_ids,
        })
    }

    fn cache_put(&self, record: IncidentRecord) {
        let now = self.clock.now();
        let mut cache = self.cache.write().expect("incident cache lock");
        if cache.len() >= CACHE_CAPACITY {
            cache.retain(|_, cached| now - cached.fetched_at < self.cache_ttl);
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
        }
        cache.insert(
            record.id.clone(),
            CachedIncident {
                fetched_at: now,
                record,
            },
        );
    }
}

/// Post-mortem template for a resolved critical incident.
#[must_use]
fn build_post_mortem(record: &IncidentRecord, resolved_at: DateTime<Utc>) -> PostMortem {
    PostMortem {
        timeline: vec![
            TimelineEntry {
                at: record.start_time,
                event: format!("incident opened in stage {}", record.stage),
            },
            TimelineEntry {
                at: resolved_at,
                event: "incident resolved".to_string(),
            },
        ],
        summary: format!(
            "CRITICAL incident {} on pipeline {}: {} ({})",
            record.id, record.pipeline_id, record.error.message, record.error.code
        ),
        impact: ImpactAssessment {
            pipeline_affected: record.pipeline_id.clone(),
            stage_affected: record.stage.clone(),
            potential_video_impact:
                "Daily video may ship late or be replaced by a buffer deployment".to_string(),
        },
        root_cause_analysis: String::new(),
        action_items: Vec::new(),
        lessons_learned: String::new(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
