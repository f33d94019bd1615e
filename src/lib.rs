//! # Nexus Orchestrator: daily content-pipeline orchestration
//!
//! Once per day, a fixed-shape pipeline turns a discovered news topic into
//! a published short-form video. This crate is the substrate that makes
//! that reliable: staged execution with retry and provider-fallback
//! cascades, severity-driven error routing, quality gates feeding a
//! pre-publish decision, a buffer-video failover inventory, parallel
//! health preflight, structured incident logging, and cost/budget guards.
//!
//! The content-producing stages themselves (research, script generation,
//! TTS, rendering, upload) are external collaborators behind the
//! [`stage::Stage`] trait; the orchestrator never knows what they compute.
//!
//! ## Core Concepts
//!
//! - **Stage**: one named unit of work with a typed input/output envelope
//! - **Severity**: the single knob driving recovery (retry, cascade,
//!   degrade, skip, abort)
//! - **Quality context**: the monotonically-growing bag of degradation
//!   markers that flows stage-to-stage and decides publish routing
//! - **Buffer video**: a pre-rendered emergency artifact shipped when the
//!   live pipeline cannot
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nexus_orchestrator::collaborators::SystemClock;
//! use nexus_orchestrator::config::OrchestratorConfig;
//! use nexus_orchestrator::health::HealthPreflight;
//! use nexus_orchestrator::runner::{ManualTriggerRequest, PipelineRunner};
//! use nexus_orchestrator::stage::StageRegistry;
//! use nexus_orchestrator::store::MemoryDocumentStore;
//!
//! # async fn example(registry: StageRegistry, preflight: HealthPreflight) {
//! let config = OrchestratorConfig::from_env();
//! let runner = PipelineRunner::new(
//!     config,
//!     Arc::new(MemoryDocumentStore::new()),
//!     Arc::new(SystemClock),
//!     registry,
//!     preflight,
//! );
//!
//! let response = runner
//!     .trigger_manual(ManualTriggerRequest {
//!         date: "2026-01-22".into(),
//!         wait: true,
//!         skip_health_check: false,
//!     })
//!     .await;
//! println!("{:?}", response.status);
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`errors`] - Severity-tagged error model and wrapping policy
//! - [`retry`] / [`fallback`] - Backoff retry and provider cascades
//! - [`stage`] - The stage contract, registry, and intra-stage fan-out
//! - [`executor`] - The per-stage envelope: gate, persist, incident
//! - [`runner`] - Pipeline walk, resume, and the trigger API
//! - [`quality`] - Per-stage metric gates
//! - [`decision`] - Pre-publish routing verdict
//! - [`health`] - Parallel dependency preflight
//! - [`buffer`] - Emergency-video inventory and deployment
//! - [`incidents`] - Incident records, root causes, post-mortems
//! - [`cost`] - Cost accounting, budget, and quota guards
//! - [`store`] - Document-store contract and backends

pub mod alerts;
pub mod artifacts;
pub mod buffer;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod cost;
pub mod decision;
pub mod errors;
pub mod executor;
pub mod fallback;
pub mod health;
pub mod incidents;
pub mod quality;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod state;
pub mod store;
pub mod telemetry;
