//! Per-call cost accounting, budget guard, and API-quota guard.
//!
//! Money is held as integer micro-dollars ([`Usd`]) so stage totals always
//! reconcile exactly with the pipeline total; the 4-decimal USD precision of
//! the persisted documents is a rounding rule at the serde boundary, not an
//! arithmetic one.
//!
//! Three concerns live here:
//!
//! * [`CostTracker`]: in-flight, per-pipeline accumulation of
//!   [`ApiCallRecord`]s, rolled up by stage / category / service.
//! * [`BudgetTracker`]: the single mutable `budget/current` document,
//!   updated read-modify-write behind a version token, with per-video
//!   warning/critical alerting deduplicated by month.
//! * [`QuotaGuard`]: daily YouTube API units in `youtube-quota/{date}`
//!   under the same optimistic-concurrency discipline.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::collaborators::Clock;
use crate::store::{DocumentStore, DocumentStoreExt, StoreError, paths};

// ── Money ──────────────────────────────────────────────────────────────

/// USD amount in integer micro-dollars.
///
/// Serializes as a plain JSON number of dollars rounded to 4 decimals
/// (`0.0325`), matching the persisted document shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Build from a dollar amount, rounding to 4 decimal places.
    #[must_use]
    pub fn from_dollars(dollars: f64) -> Self {
        Self(((dollars * 10_000.0).round() as i64) * 100)
    }

    #[must_use]
    pub fn micros(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0).max(0))
    }
}

impl std::ops::Add for Usd {
    type Output = Usd;
    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        self.0 += rhs.0;
    }
}

impl std::iter::Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, |acc, x| acc + x)
    }
}

impl std::fmt::Display for Usd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.4}", self.as_dollars())
    }
}

impl Serialize for Usd {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // 4-decimal dollars on the wire.
        serializer.serialize_f64((self.as_dollars() * 10_000.0).round() / 10_000.0)
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dollars = f64::deserialize(deserializer)?;
        Ok(Usd::from_dollars(dollars))
    }
}

// ── Records ────────────────────────────────────────────────────────────

/// Token counts attached to an API call, when the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
}

impl TokenUsage {
    #[must_use]
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input: Some(input),
            output: Some(output),
        }
    }
}

/// One billable call against an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub service: String,
    #[serde(default)]
    pub tokens: TokenUsage,
    pub cost: Usd,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Billing category a service rolls up under.
#[must_use]
pub fn category_for_service(service: &str) -> &'static str {
    let lower = service.to_ascii_lowercase();
    if lower.contains("tts") || lower.contains("chirp") || lower.contains("voice") {
        "tts"
    } else if lower.contains("gemini") || lower.contains("llm") || lower.contains("claude") {
        "llm"
    } else if lower.contains("imagen") || lower.contains("image") || lower.contains("thumbnail") {
        "image"
    } else if lower.contains("render") || lower.contains("encode") {
        "render"
    } else if lower.contains("storage") || lower.contains("bucket") {
        "storage"
    } else {
        "other"
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum CostError {
    #[error(transparent)]
    #[diagnostic(code(nexus::cost::store))]
    Store(#[from] StoreError),

    #[error("optimistic write lost {attempts} times for {what}")]
    #[diagnostic(
        code(nexus::cost::contention),
        help("Another writer kept winning the version race; investigate runaway writers.")
    )]
    Contention { what: &'static str, attempts: u32 },

    #[error("YouTube quota exceeded for {date}: {used} of {cap} units")]
    #[diagnostic(code(nexus::cost::quota_exceeded))]
    QuotaExceeded { date: String, used: u64, cap: u64 },
}

const RMW_ATTEMPTS: u32 = 5;

// ── Per-pipeline tracker ───────────────────────────────────────────────

/// Roll-up of everything a pipeline spent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub total: Usd,
    pub by_category: BTreeMap<String, Usd>,
    pub by_stage: BTreeMap<String, Usd>,
    pub services: Vec<String>,
}

/// The persisted `pipelines/{id}/costs` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostsDocument {
    pub pipeline_id: String,
    pub stages: BTreeMap<String, Vec<ApiCallRecord>>,
    pub breakdown: CostBreakdown,
}

/// Accumulates [`ApiCallRecord`]s for one pipeline run.
///
/// Cheap to clone (`Arc` inside); the stage executor hands a clone to each
/// stage body so calls land under the right stage name.
#[derive(Clone)]
pub struct CostTracker {
    pipeline_id: String,
    clock: Arc<dyn Clock>,
    stages: Arc<RwLock<BTreeMap<String, Vec<ApiCallRecord>>>>,
}

impl CostTracker {
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            clock,
            stages: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Record one billable call under `stage`.
    pub fn record_api_call(
        &self,
        stage: &str,
        service: &str,
        tokens: TokenUsage,
        cost: Usd,
        model: Option<String>,
    ) {
        let record = ApiCallRecord {
            service: service.to_string(),
            tokens,
            cost,
            model,
            timestamp: self.clock.now(),
        };
        debug!(stage, service, cost = %cost, "api call recorded");
        self.stages
            .write()
            .expect("cost lock")
            .entry(stage.to_string())
            .or_default()
            .push(record);
    }

    /// Total spent inside one stage.
    #[must_use]
    pub fn stage_total(&self, stage: &str) -> Usd {
        self.stages
            .read()
            .expect("cost lock")
            .get(stage)
            .map(|records| records.iter().map(|r| r.cost).sum())
            .unwrap_or(Usd::ZERO)
    }

    /// Total spent across the pipeline so far.
    #[must_use]
    pub fn total(&self) -> Usd {
        self.stages
            .read()
            .expect("cost lock")
            .values()
            .flatten()
            .map(|r| r.cost)
            .sum()
    }

    /// Snapshot the roll-up.
    #[must_use]
    pub fn breakdown(&self) -> CostBreakdown {
        let stages = self.stages.read().expect("cost lock");
        let mut by_category: BTreeMap<String, Usd> = BTreeMap::new();
        let mut by_stage: BTreeMap<String, Usd> = BTreeMap::new();
        let mut services: Vec<String> = Vec::new();
        let mut total = Usd::ZERO;
        for (stage, records) in stages.iter() {
            for record in records {
                total += record.cost;
                *by_stage.entry(stage.clone()).or_default() += record.cost;
                *by_category
                    .entry(category_for_service(&record.service).to_string())
                    .or_default() += record.cost;
                if !services.contains(&record.service) {
                    services.push(record.service.clone());
                }
            }
        }
        CostBreakdown {
            total,
            by_category,
            by_stage,
            services,
        }
    }

    /// Assemble the persistable costs document.
    #[must_use]
    pub fn to_document(&self) -> CostsDocument {
        CostsDocument {
            pipeline_id: self.pipeline_id.clone(),
            stages: self.stages.read().expect("cost lock").clone(),
            breakdown: self.breakdown(),
        }
    }

    /// Persist the document under `pipelines/{id}/costs`.
    pub async fn persist(&self, store: &dyn DocumentStore) -> Result<(), CostError> {
        let path = paths::pipeline_costs(&self.pipeline_id);
        store
            .set_doc(path.collection, &path.id, &self.to_document())
            .await?;
        Ok(())
    }
}

// ── Budget ─────────────────────────────────────────────────────────────

/// Per-video alert thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetThresholds {
    pub per_video_warning: Usd,
    pub per_video_critical: Usd,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            per_video_warning: Usd::from_dollars(0.75),
            per_video_critical: Usd::from_dollars(1.00),
        }
    }
}

/// Alert level crossed by a single video's spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetAlertLevel {
    Warning,
    Critical,
}

impl BudgetAlertLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Which alert, if any, a video's total cost triggers.
#[must_use]
pub fn video_cost_alert(total: Usd, thresholds: &BudgetThresholds) -> Option<BudgetAlertLevel> {
    if total >= thresholds.per_video_critical {
        Some(BudgetAlertLevel::Critical)
    } else if total >= thresholds.per_video_warning {
        Some(BudgetAlertLevel::Warning)
    } else {
        None
    }
}

/// The single mutable `budget/current` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDocument {
    pub initial_credit: Usd,
    pub total_spent: Usd,
    pub remaining: Usd,
    /// `None` until there has been any spend to project from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_of_runway: Option<f64>,
    pub projected_monthly: Usd,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_expiration: Option<DateTime<Utc>>,
    pub is_within_budget: bool,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Monotonic version token guarding read-modify-write.
    pub version: u64,
    /// Alert level → `YYYY-MM` it last fired, for monthly deduplication.
    #[serde(default)]
    pub alerted_months: BTreeMap<String, String>,
}

impl BudgetDocument {
    /// Fresh document with the full credit untouched.
    #[must_use]
    pub fn fresh(initial_credit: Usd, now: DateTime<Utc>) -> Self {
        Self {
            initial_credit,
            total_spent: Usd::ZERO,
            remaining: initial_credit,
            days_of_runway: None,
            projected_monthly: Usd::ZERO,
            credit_expiration: None,
            is_within_budget: true,
            started_at: now,
            last_updated: now,
            version: 0,
            alerted_months: BTreeMap::new(),
        }
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        self.remaining = self.initial_credit.saturating_sub(self.total_spent);
        let days_elapsed = (now - self.started_at).num_days().max(1) as f64;
        let daily_rate = self.total_spent.as_dollars() / days_elapsed;
        self.days_of_runway = if daily_rate > 0.0 {
            Some(self.remaining.as_dollars() / daily_rate)
        } else {
            None
        };
        self.projected_monthly = Usd::from_dollars(daily_rate * 30.0);
        self.is_within_budget = !self.remaining.is_zero();
        self.last_updated = now;
    }
}

/// Budget guard over the store-backed document.
pub struct BudgetTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    thresholds: BudgetThresholds,
    initial_credit: Usd,
}

impl BudgetTracker {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        thresholds: BudgetThresholds,
        initial_credit: Usd,
    ) -> Self {
        Self {
            store,
            clock,
            thresholds,
            initial_credit,
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> &BudgetThresholds {
        &self.thresholds
    }

    async fn load_or_init(&self) -> Result<BudgetDocument, CostError> {
        let path = paths::budget_current();
        if let Some(doc) = self.store.get_doc(path.collection, &path.id).await? {
            return Ok(doc);
        }
        let fresh = BudgetDocument::fresh(self.initial_credit, self.clock.now());
        // Lost creation races are fine: re-read whatever won.
        let created = self
            .store
            .compare_and_set(path.collection, &path.id, None, serde_json::to_value(&fresh).map_err(StoreError::from)?)
            .await?;
        if created {
            Ok(fresh)
        } else {
            self.store
                .get_doc(path.collection, &path.id)
                .await?
                .ok_or(CostError::Contention {
                    what: "budget/current",
                    attempts: 1,
                })
        }
    }

    /// Apply a spend read-modify-write, retrying lost version races.
    pub async fn apply_spend(&self, amount: Usd) -> Result<BudgetDocument, CostError> {
        let path = paths::budget_current();
        for _ in 0..RMW_ATTEMPTS {
            let current = self.load_or_init().await?;
            let mut next = current.clone();
            next.total_spent += amount;
            next.version += 1;
            next.recompute(self.clock.now());

            let expected = serde_json::json!({ "version": current.version });
            let won = self
                .store
                .compare_and_set(
                    path.collection,
                    &path.id,
                    Some(&expected),
                    serde_json::to_value(&next).map_err(StoreError::from)?,
                )
                .await?;
            if won {
                return Ok(next);
            }
        }
        Err(CostError::Contention {
            what: "budget/current",
            attempts: RMW_ATTEMPTS,
        })
    }

    /// Whether an alert at `level` should fire this month; records the
    /// month on success so repeats within it are suppressed.
    pub async fn should_alert(&self, level: BudgetAlertLevel) -> Result<bool, CostError> {
        let month = self.clock.now().format("%Y-%m").to_string();
        let path = paths::budget_current();
        for _ in 0..RMW_ATTEMPTS {
            let current = self.load_or_init().await?;
            if current.alerted_months.get(level.as_str()) == Some(&month) {
                return Ok(false);
            }
            let mut next = current.clone();
            next.alerted_months
                .insert(level.as_str().to_string(), month.clone());
            next.version += 1;
            next.last_updated = self.clock.now();

            let expected = serde_json::json!({ "version": current.version });
            let won = self
                .store
                .compare_and_set(
                    path.collection,
                    &path.id,
                    Some(&expected),
                    serde_json::to_value(&next).map_err(StoreError::from)?,
                )
                .await?;
            if won {
                return Ok(true);
            }
        }
        Err(CostError::Contention {
            what: "budget/current",
            attempts: RMW_ATTEMPTS,
        })
    }
}

// ── YouTube quota ──────────────────────────────────────────────────────

/// The `youtube-quota/{date}` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDocument {
    pub date: String,
    pub units_used: u64,
    pub daily_cap: u64,
    pub version: u64,
}

impl QuotaDocument {
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.daily_cap.saturating_sub(self.units_used)
    }
}

/// Optimistic daily-units guard for the YouTube API.
pub struct QuotaGuard {
    store: Arc<dyn DocumentStore>,
    daily_cap: u64,
}

impl QuotaGuard {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, daily_cap: u64) -> Self {
        Self { store, daily_cap }
    }

    /// Consume `units` for `date`, failing if the cap would be exceeded.
    pub async fn consume(&self, date: &str, units: u64) -> Result<QuotaDocument, CostError> {
        let path = paths::youtube_quota(date);
        for _ in 0..RMW_ATTEMPTS {
            let current: Option<QuotaDocument> =
                self.store.get_doc(path.collection, &path.id).await?;
            let current = current.unwrap_or(QuotaDocument {
                date: date.to_string(),
                units_used: 0,
                daily_cap: self.daily_cap,
                version: 0,
            });

            if current.units_used + units > current.daily_cap {
                return Err(CostError::QuotaExceeded {
                    date: date.to_string(),
                    used: current.units_used,
                    cap: current.daily_cap,
                });
            }

            let mut next = current.clone();
            next.units_used += units;
            next.version += 1;

            let expected = if current.version == 0 && current.units_used == 0 {
                None
            } else {
                Some(serde_json::json!({ "version": current.version }))
            };
            let won = self
                .store
                .compare_and_set(
                    path.collection,
                    &path.id,
                    expected.as_ref(),
                    serde_json::to_value(&next).map_err(StoreError::from)?,
                )
                .await?;
            if won {
                return Ok(next);
            }
        }
        Err(CostError::Contention {
            what: "youtube-quota",
            attempts: RMW_ATTEMPTS,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
