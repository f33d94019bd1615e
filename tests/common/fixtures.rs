#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use nexus_orchestrator::buffer::{BufferConfig, BufferInventory, BufferVideo};
use nexus_orchestrator::collaborators::ManualClock;
use nexus_orchestrator::config::OrchestratorConfig;
use nexus_orchestrator::health::{DEFAULT_PROBE_TIMEOUT, HealthPreflight, HealthProbe};
use nexus_orchestrator::quality::GateKind;
use nexus_orchestrator::runner::PipelineRunner;
use nexus_orchestrator::stage::StageRegistry;
use nexus_orchestrator::store::{DocumentStore, MemoryDocumentStore};

use super::stages::OkStage;

/// The canonical test date every scenario pins to.
pub const TEST_DATE: &str = "2026-01-22";

/// A token that passes the bearer sanity check.
pub const TEST_BEARER: &str = "scheduler-token-0123456789abcdef";

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 22, 6, 0, 0).unwrap(),
    ))
}

pub fn test_store() -> Arc<MemoryDocumentStore> {
    Arc::new(MemoryDocumentStore::new())
}

/// The full production stage order with every stage succeeding and no
/// gates wired (metrics-free stages would fail their gates otherwise).
pub fn minimal_registry() -> StageRegistry {
    StageRegistry::new()
        .register("research", OkStage)
        .register("script-gen", OkStage)
        .register("tts", OkStage)
        .register("visual-gen", OkStage)
        .register("thumbnails", OkStage)
        .register("render", OkStage)
}

/// The production stage order used by every scenario registry.
pub const STAGE_ORDER: [&str; 6] = [
    "research",
    "script-gen",
    "tts",
    "visual-gen",
    "thumbnails",
    "render",
];

/// A registry where one named slot is replaced by the given stage.
pub fn registry_with(
    replaced: &str,
    stage: impl nexus_orchestrator::stage::Stage + 'static,
    gate: Option<GateKind>,
) -> StageRegistry {
    let position = STAGE_ORDER
        .iter()
        .position(|n| *n == replaced)
        .expect("replaced stage must be in the production order");
    let mut registry = StageRegistry::new();
    for name in &STAGE_ORDER[..position] {
        registry = registry.register(*name, OkStage);
    }
    registry = registry.register_shared(
        replaced,
        Arc::new(stage) as Arc<dyn nexus_orchestrator::stage::Stage>,
        gate,
    );
    for name in &STAGE_ORDER[position + 1..] {
        registry = registry.register(*name, OkStage);
    }
    registry
}

pub fn healthy_preflight(probes: Vec<Box<dyn HealthProbe>>) -> HealthPreflight {
    let mut preflight = HealthPreflight::new(DEFAULT_PROBE_TIMEOUT);
    for probe in probes {
        preflight = preflight.register_shared(Arc::from(probe));
    }
    preflight
}

/// Assemble a runner over shared store/clock with the given registry and
/// probes.
pub fn build_runner(
    store: Arc<MemoryDocumentStore>,
    clock: Arc<ManualClock>,
    registry: StageRegistry,
    probes: Vec<Box<dyn HealthProbe>>,
) -> PipelineRunner {
    PipelineRunner::new(
        OrchestratorConfig::default(),
        store,
        clock,
        registry,
        healthy_preflight(probes),
    )
}

/// Seed one active, never-deployed buffer into the shared store.
pub async fn seed_buffer(
    store: Arc<MemoryDocumentStore>,
    clock: Arc<ManualClock>,
    topic: &str,
) -> BufferVideo {
    let inventory = BufferInventory::new(
        store as Arc<dyn DocumentStore>,
        clock.clone(),
        BufferConfig::default(),
    );
    let video = BufferVideo::new(
        topic,
        format!("gs://buffers/{topic}.mp4"),
        format!("gs://buffers/{topic}.png"),
        clock.now_snapshot(),
    );
    inventory.add(&video).await.unwrap();
    video
}

/// `ManualClock::now` through the `Clock` trait without importing it at
/// every call site.
pub trait ClockSnapshot {
    fn now_snapshot(&self) -> chrono::DateTime<Utc>;
}

impl ClockSnapshot for Arc<ManualClock> {
    fn now_snapshot(&self) -> chrono::DateTime<Utc> {
        use nexus_orchestrator::collaborators::Clock;
        self.now()
    }
}
