#![allow(dead_code)]

use async_trait::async_trait;

use nexus_orchestrator::health::{Criticality, HealthProbe, ProbeResult, ProbeStatus};

/// A probe that always reports the configured status.
pub struct FixedProbe {
    pub service: &'static str,
    pub criticality: Criticality,
    pub status: ProbeStatus,
}

impl FixedProbe {
    pub fn healthy(service: &'static str) -> Self {
        Self {
            service,
            criticality: Criticality::Critical,
            status: ProbeStatus::Healthy,
        }
    }

    pub fn critical_down(service: &'static str) -> Self {
        Self {
            service,
            criticality: Criticality::Critical,
            status: ProbeStatus::Unhealthy,
        }
    }

    pub fn degraded_down(service: &'static str) -> Self {
        Self {
            service,
            criticality: Criticality::Degraded,
            status: ProbeStatus::Unhealthy,
        }
    }
}

#[async_trait]
impl HealthProbe for FixedProbe {
    fn service(&self) -> &str {
        self.service
    }

    fn criticality(&self) -> Criticality {
        self.criticality
    }

    async fn probe(&self) -> ProbeResult {
        match self.status {
            ProbeStatus::Healthy => ProbeResult::healthy(self.service, 10),
            ProbeStatus::Degraded => ProbeResult::degraded(self.service, 35, "slow responses"),
            ProbeStatus::Unhealthy => ProbeResult::unhealthy(self.service, 60, "connect refused"),
        }
    }
}
