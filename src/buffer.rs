//! Buffer-video inventory: the pre-rendered emergency videos deployed when
//! the live pipeline cannot ship.
//!
//! Selection prefers never-deployed buffers and falls back to FIFO among
//! equals (`deployment_count` ascending, then `created_date` ascending).
//! Deployment is a two-step write: an atomic compare-and-set flips
//! `used: false → true` and `status: active → deployed`, then the caller
//! publishes under the target date. A failed publish rolls `status` back to
//! `active` while `used` stays `true`, so the slot can be re-deployed on
//! operator request without ever double-counting.
//!
//! The inventory is shared across pipeline dates; two simultaneous
//! deployments can never pick the same buffer because the CAS guards the
//! `used` flag.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::collaborators::Clock;
use crate::errors::{
    CODE_BUFFER_ALREADY_USED, CODE_BUFFER_EXHAUSTED, NexusError, Severity,
};
use crate::store::{DocumentStore, DocumentStoreExt, Filter, StoreError, paths};

// ── Records ────────────────────────────────────────────────────────────

/// Lifecycle state of a buffer video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Active,
    Deployed,
    Archived,
}

/// One pre-rendered emergency video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferVideo {
    pub id: String,
    pub topic: String,
    pub created_date: DateTime<Utc>,
    pub status: BufferStatus,
    pub used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_date: Option<DateTime<Utc>>,
    pub deployment_count: u32,
    pub video_url: String,
    pub thumbnail_url: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BufferVideo {
    /// Fresh, never-deployed buffer.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        video_url: impl Into<String>,
        thumbnail_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            created_date: now,
            status: BufferStatus::Active,
            used: false,
            used_date: None,
            deployment_count: 0,
            video_url: video_url.into(),
            thumbnail_url: thumbnail_url.into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn is_deployable(&self) -> bool {
        self.status == BufferStatus::Active && !self.used
    }
}

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum BufferError {
    #[error("no deployable buffer video in inventory")]
    #[diagnostic(
        code(nexus::buffer::exhausted),
        help("Replenish the buffer inventory; the minimum stock is breached.")
    )]
    Exhausted,

    #[error("buffer {id} was already used")]
    #[diagnostic(code(nexus::buffer::already_used))]
    AlreadyUsed { id: String },

    #[error("buffer {id} not found")]
    #[diagnostic(code(nexus::buffer::not_found))]
    NotFound { id: String },

    #[error("lost deployment race {attempts} times")]
    #[diagnostic(code(nexus::buffer::contention))]
    Contention { attempts: u32 },

    #[error(transparent)]
    #[diagnostic(code(nexus::buffer::store))]
    Store(#[from] StoreError),
}

impl From<BufferError> for NexusError {
    fn from(err: BufferError) -> Self {
        match &err {
            BufferError::Exhausted => {
                NexusError::critical(CODE_BUFFER_EXHAUSTED, err.to_string())
            }
            BufferError::AlreadyUsed { .. } => {
                NexusError::new(CODE_BUFFER_ALREADY_USED, Severity::Recoverable, err.to_string())
            }
            _ => NexusError::critical("NEXUS_BUFFER_STORE_FAILURE", err.to_string()),
        }
    }
}

// ── Health monitoring ──────────────────────────────────────────────────

/// Inventory health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    Healthy,
    Warning,
    Critical,
}

/// Counts plus verdict, cached with a TTL to absorb digest bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferHealthStatus {
    pub available_count: u32,
    pub deployed_count: u32,
    pub archived_count: u32,
    pub status: BufferHealth,
}

/// Inventory thresholds and cache tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Stock at or below this is critical.
    pub minimum: u32,
    /// Stock strictly below this (but above minimum) is a warning.
    pub warning: u32,
    /// Deployed buffers older than this are promoted to archived.
    pub retention: chrono::Duration,
    pub health_cache_ttl: chrono::Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            minimum: 1,
            warning: 2,
            retention: chrono::Duration::days(30),
            health_cache_ttl: chrono::Duration::minutes(5),
        }
    }
}

// ── Inventory ──────────────────────────────────────────────────────────

const DEPLOY_RACE_ATTEMPTS: u32 = 5;

struct CachedHealth {
    computed_at: DateTime<Utc>,
    status: BufferHealthStatus,
}

/// Store-backed buffer inventory.
pub struct BufferInventory {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: BufferConfig,
    health_cache: RwLock<Option<CachedHealth>>,
}

impl BufferInventory {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: BufferConfig) -> Self {
        Self {
            store,
            clock,
            config,
            health_cache: RwLock::new(None),
        }
    }

    /// Add a buffer to the inventory.
    pub async fn add(&self, video: &BufferVideo) -> Result<(), BufferError> {
        let path = paths::buffer_video(&video.id);
        self.store.set_doc(path.collection, &path.id, video).await?;
        self.invalidate_health_cache();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<BufferVideo>, BufferError> {
        let path = paths::buffer_video(id);
        Ok(self.store.get_doc(path.collection, &path.id).await?)
    }

    async fn deployable_candidates(&self) -> Result<Vec<BufferVideo>, BufferError> {
        let rows = self
            .store
            .query(
                "buffer-videos",
                &[Filter::eq("status", "active"), Filter::eq("used", false)],
            )
            .await?;
        let mut candidates: Vec<BufferVideo> = rows
            .into_iter()
            .map(|(_, doc)| serde_json::from_value(doc))
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)?;
        candidates.sort_by(|a, b| {
            a.deployment_count
                .cmp(&b.deployment_count)
                .then(a.created_date.cmp(&b.created_date))
        });
        Ok(candidates)
    }

    /// Pick the next buffer to deploy: least-deployed first, FIFO among
    /// equals. Read-only; the atomic claim happens in [`Self::claim`].
    pub async fn select_for_deployment(&self) -> Result<BufferVideo, BufferError> {
        self.deployable_candidates()
            .await?
            .into_iter()
            .next()
            .ok_or(BufferError::Exhausted)
    }

    /// Step (a) of deployment: atomically claim a specific buffer.
    ///
    /// The compare-and-set guards `used`, so two simultaneous deployers
    /// cannot both win the same slot.
    #[instrument(skip(self))]
    pub async fn claim(&self, buffer_id: &str) -> Result<BufferVideo, BufferError> {
        let current = self.get(buffer_id).await?.ok_or(BufferError::NotFound {
            id: buffer_id.to_string(),
        })?;
        if current.used {
            return Err(BufferError::AlreadyUsed {
                id: buffer_id.to_string(),
            });
        }

        let mut claimed = current;
        claimed.used = true;
        claimed.status = BufferStatus::Deployed;
        claimed.used_date = Some(self.clock.now());
        claimed.deployment_count += 1;

        let path = paths::buffer_video(buffer_id);
        let expected = serde_json::json!({ "used": false, "status": "active" });
        let won = self
            .store
            .compare_and_set(
                path.collection,
                &path.id,
                Some(&expected),
                serde_json::to_value(&claimed).map_err(StoreError::from)?,
            )
            .await?;
        if !won {
            return Err(BufferError::AlreadyUsed {
                id: buffer_id.to_string(),
            });
        }
        self.invalidate_health_cache();
        info!(buffer = buffer_id, count = claimed.deployment_count, "buffer claimed");
        Ok(claimed)
    }

    /// Select-and-claim loop: re-selects when another deployer wins the
    /// race, so concurrent deployments end up on distinct buffers.
    pub async fn claim_next(&self) -> Result<BufferVideo, BufferError> {
        for _ in 0..DEPLOY_RACE_ATTEMPTS {
            let candidate = self.select_for_deployment().await?;
            match self.claim(&candidate.id).await {
                Ok(claimed) => return Ok(claimed),
                Err(BufferError::AlreadyUsed { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(BufferError::Contention {
            attempts: DEPLOY_RACE_ATTEMPTS,
        })
    }

    /// Roll back step (b) failure: publish failed after the claim, so the
    /// slot returns to `active` while staying `used`. Re-deployment of the
    /// slot is an operator decision from there.
    pub async fn release_after_publish_failure(&self, buffer_id: &str) -> Result<(), BufferError> {
        let path = paths::buffer_video(buffer_id);
        let exists = self.get(buffer_id).await?.is_some();
        if !exists {
            return Err(BufferError::NotFound {
                id: buffer_id.to_string(),
            });
        }
        warn!(buffer = buffer_id, "publish failed after claim, rolling status back to active");
        self.store
            .update(path.collection, &path.id, serde_json::json!({ "status": "active" }))
            .await?;
        self.invalidate_health_cache();
        Ok(())
    }

    /// Operator-requested re-deployment of a slot whose publish failed:
    /// `used` is already true, only the status transitions again.
    pub async fn redeploy(&self, buffer_id: &str) -> Result<BufferVideo, BufferError> {
        let current = self.get(buffer_id).await?.ok_or(BufferError::NotFound {
            id: buffer_id.to_string(),
        })?;
        if current.status != BufferStatus::Active || !current.used {
            return Err(BufferError::AlreadyUsed {
                id: buffer_id.to_string(),
            });
        }
        let mut next = current;
        next.status = BufferStatus::Deployed;
        next.used_date = Some(self.clock.now());
        next.deployment_count += 1;

        let path = paths::buffer_video(buffer_id);
        let expected = serde_json::json!({ "status": "active", "used": true });
        let won = self
            .store
            .compare_and_set(
                path.collection,
                &path.id,
                Some(&expected),
                serde_json::to_value(&next).map_err(StoreError::from)?,
            )
            .await?;
        if !won {
            return Err(BufferError::AlreadyUsed {
                id: buffer_id.to_string(),
            });
        }
        self.invalidate_health_cache();
        Ok(next)
    }

    /// Promote deployed buffers past the retention window to `archived`.
    /// Returns the ids promoted.
    pub async fn archive_expired(&self) -> Result<Vec<String>, BufferError> {
        let now = self.clock.now();
        let rows = self
            .store
            .query("buffer-videos", &[Filter::eq("status", "deployed")])
            .await?;
        let mut archived = Vec::new();
        for (id, doc) in rows {
            let video: BufferVideo =
                serde_json::from_value(doc).map_err(StoreError::from)?;
            let Some(used_date) = video.used_date else {
                continue;
            };
            if now - used_date >= self.config.retention {
                let path = paths::buffer_video(&id);
                self.store
                    .update(path.collection, &path.id, serde_json::json!({ "status": "archived" }))
                    .await?;
                archived.push(id);
            }
        }
        if !archived.is_empty() {
            self.invalidate_health_cache();
        }
        Ok(archived)
    }

    // ── Monitoring ─────────────────────────────────────────────────

    fn invalidate_health_cache(&self) {
        *self.health_cache.write().expect("health cache lock") = None;
    }

    /// Inventory counts plus verdict, cached for the configured TTL.
    pub async fn health_status(&self) -> Result<BufferHealthStatus, BufferError> {
        let now = self.clock.now();
        {
            let cache = self.health_cache.read().expect("health cache lock");
            if let Some(cached) = cache.as_ref()
                && now - cached.computed_at < self.config.health_cache_ttl
            {
                return Ok(cached.status);
            }
        }

        let rows = self.store.query("buffer-videos", &[]).await?;
        let mut available = 0u32;
        let mut deployed = 0u32;
        let mut archived = 0u32;
        for (_, doc) in rows {
            let video: BufferVideo =
                serde_json::from_value(doc).map_err(StoreError::from)?;
            match video.status {
                BufferStatus::Active if !video.used => available += 1,
                BufferStatus::Active => {}
                BufferStatus::Deployed => deployed += 1,
                BufferStatus::Archived => archived += 1,
            }
        }

        // Branch order is deliberate and matches production behavior: the
        // warning comparison is strict, so stock exactly at the minimum
        // reports critical, never warning.
        let status = if available < self.config.minimum {
            BufferHealth::Critical
        } else if available <= self.config.minimum {
            BufferHealth::Critical
        } else if available < self.config.warning {
            BufferHealth::Warning
        } else {
            BufferHealth::Healthy
        };

        let health = BufferHealthStatus {
            available_count: available,
            deployed_count: deployed,
            archived_count: archived,
            status,
        };
        *self.health_cache.write().expect("health cache lock") = Some(CachedHealth {
            computed_at: now,
            status: health,
        });
        Ok(health)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ManualClock;
    use crate::store::MemoryDocumentStore;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 22, 6, 0, 0).unwrap(),
        ))
    }

    fn inventory(clock: Arc<ManualClock>) -> BufferInventory {
        BufferInventory::new(
            Arc::new(MemoryDocumentStore::new()),
            clock,
            BufferConfig::default(),
        )
    }

    async fn seed(inv: &BufferInventory, topic: &str, created: DateTime<Utc>) -> BufferVideo {
        let mut video = BufferVideo::new(
            topic,
            format!("gs://buffers/{topic}.mp4"),
            format!("gs://buffers/{topic}.png"),
            created,
        );
        video.created_date = created;
        inv.add(&video).await.unwrap();
        video
    }

    #[tokio::test]
    async fn selection_prefers_least_deployed_then_fifo() {
        let clock = clock();
        let inv = inventory(clock.clone());
        let t0 = clock.now();

        let older = seed(&inv, "older", t0 - chrono::Duration::days(3)).await;
        let _newer = seed(&inv, "newer", t0 - chrono::Duration::days(1)).await;
        let mut veteran = seed(&inv, "veteran", t0 - chrono::Duration::days(9)).await;
        veteran.deployment_count = 2;
        inv.add(&veteran).await.unwrap();

        let picked = inv.select_for_deployment().await.unwrap();
        // Never-deployed wins over the veteran; FIFO among the fresh pair.
        assert_eq!(picked.id, older.id);
    }

    #[tokio::test]
    async fn empty_inventory_is_exhausted() {
        let inv = inventory(clock());
        assert!(matches!(
            inv.select_for_deployment().await,
            Err(BufferError::Exhausted)
        ));
    }

    #[tokio::test]
    async fn claim_flips_used_and_counts() {
        let clock = clock();
        let inv = inventory(clock.clone());
        let video = seed(&inv, "t", clock.now()).await;

        let claimed = inv.claim(&video.id).await.unwrap();
        assert!(claimed.used);
        assert_eq!(claimed.status, BufferStatus::Deployed);
        assert_eq!(claimed.deployment_count, 1);
        assert_eq!(claimed.used_date, Some(clock.now()));

        // Second deployment of the same slot fails typed, inventory intact.
        let err = inv.claim(&video.id).await.unwrap_err();
        assert!(matches!(err, BufferError::AlreadyUsed { .. }));
        let stored = inv.get(&video.id).await.unwrap().unwrap();
        assert_eq!(stored, claimed);
    }

    #[tokio::test]
    async fn concurrent_claims_pick_distinct_buffers() {
        let clock = clock();
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let inv = Arc::new(BufferInventory::new(
            store.clone(),
            clock.clone(),
            BufferConfig::default(),
        ));
        let t0 = clock.now();
        seed(&inv, "a", t0 - chrono::Duration::days(2)).await;
        seed(&inv, "b", t0 - chrono::Duration::days(1)).await;

        let (left, right) = tokio::join!(
            {
                let inv = Arc::clone(&inv);
                async move { inv.claim_next().await.unwrap() }
            },
            {
                let inv = Arc::clone(&inv);
                async move { inv.claim_next().await.unwrap() }
            }
        );
        assert_ne!(left.id, right.id);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back_status_only() {
        let clock = clock();
        let inv = inventory(clock.clone());
        let video = seed(&inv, "t", clock.now()).await;
        let claimed = inv.claim(&video.id).await.unwrap();

        inv.release_after_publish_failure(&claimed.id).await.unwrap();
        let stored = inv.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BufferStatus::Active);
        assert!(stored.used);
        assert_eq!(stored.deployment_count, 1);

        // Operator redeploy bumps the count and transitions again.
        let redeployed = inv.redeploy(&claimed.id).await.unwrap();
        assert_eq!(redeployed.status, BufferStatus::Deployed);
        assert_eq!(redeployed.deployment_count, 2);
    }

    #[tokio::test]
    async fn health_at_minimum_is_critical_not_warning() {
        let clock = clock();
        let inv = inventory(clock.clone());
        seed(&inv, "a", clock.now()).await;
        seed(&inv, "b", clock.now()).await;

        // Two available: healthy under the default thresholds.
        let health = inv.health_status().await.unwrap();
        assert_eq!(health.available_count, 2);
        assert_eq!(health.status, BufferHealth::Healthy);

        // Drop to exactly the minimum (1): the transition jumps straight
        // to critical, never passing through warning.
        let victim = inv.select_for_deployment().await.unwrap();
        inv.claim(&victim.id).await.unwrap();
        let health = inv.health_status().await.unwrap();
        assert_eq!(health.available_count, 1);
        assert_eq!(health.status, BufferHealth::Critical);

        // Zero available remains critical.
        let last = inv.select_for_deployment().await.unwrap();
        inv.claim(&last.id).await.unwrap();
        let health = inv.health_status().await.unwrap();
        assert_eq!(health.available_count, 0);
        assert_eq!(health.status, BufferHealth::Critical);
        assert_eq!(health.deployed_count, 2);
    }

    #[tokio::test]
    async fn health_cache_expires_with_clock() {
        let clock = clock();
        let inv = inventory(clock.clone());
        seed(&inv, "a", clock.now()).await;
        seed(&inv, "b", clock.now()).await;
        seed(&inv, "c", clock.now()).await;

        let first = inv.health_status().await.unwrap();
        assert_eq!(first.available_count, 3);

        // Mutate behind the cache's back via a second inventory handle on
        // a different store view; here simply advance past the TTL and
        // confirm a recount happens after mutation through this handle.
        let victim = inv.select_for_deployment().await.unwrap();
        inv.claim(&victim.id).await.unwrap();
        // Claim invalidates, so the next read is fresh.
        assert_eq!(inv.health_status().await.unwrap().available_count, 2);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(inv.health_status().await.unwrap().available_count, 2);
    }

    #[tokio::test]
    async fn archive_promotes_only_past_retention() {
        let clock = clock();
        let inv = inventory(clock.clone());
        let video = seed(&inv, "old", clock.now()).await;
        inv.claim(&video.id).await.unwrap();

        assert!(inv.archive_expired().await.unwrap().is_empty());
        clock.advance(chrono::Duration::days(31));
        let archived = inv.archive_expired().await.unwrap();
        assert_eq!(archived, vec![video.id.clone()]);
        let stored = inv.get(&video.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BufferStatus::Archived);
    }
}
