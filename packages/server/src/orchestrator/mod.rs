//! Orchestration, fault tolerance, and recovery.
//!
//! The orchestrator executes partitioned tasks on chosen nodes with
//! retries and per-node circuit breakers. Terminal failures become
//! incidents; the fault-tolerance loop diagnoses them and drives recovery
//! plans with rollback. The autoscaler closes the loop on capacity.

pub mod autoscale;
pub mod breaker;
pub mod engine;
pub mod fault;
pub mod recovery;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use autoscale::{
    Autoscaler, ClusterMetricsSnapshot, CompositeScores, CpuPolicy, MemoryPolicy, QueuePolicy,
    ResponseTimePolicy, ScalingAction, ScalingDecision, ScalingPolicy, ThroughputPolicy,
};
pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
pub use engine::{Orchestrator, OrchestratorCounters, TaskDigest};
pub use fault::{
    AnalysisReport, DiagnosisEngine, DiagnosticResult, IncidentKind, IncidentMetrics, RootCause,
    Severity, SystemIncident,
};
pub use recovery::{
    CacheClearingStrategy, ConfigResetStrategy, NetworkRecoveryStrategy, NoopActuator,
    RecoveryAction, RecoveryActuator, RecoveryManager, RecoveryOperation, RecoveryPlan,
    RecoveryStatus, RecoveryStep, RecoveryStrategy, ResourceScalingStrategy,
    ServiceRestartStrategy, StepResult,
};

// ---------------------------------------------------------------------------
// FaultTolerance
// ---------------------------------------------------------------------------

/// Consumes incidents, diagnoses them, and drives recovery.
pub struct FaultTolerance {
    diagnosis: DiagnosisEngine,
    recovery: Arc<RecoveryManager>,
}

impl FaultTolerance {
    #[must_use]
    pub fn new(recovery: Arc<RecoveryManager>) -> Self {
        Self {
            diagnosis: DiagnosisEngine::new(),
            recovery,
        }
    }

    #[must_use]
    pub fn recovery(&self) -> Arc<RecoveryManager> {
        Arc::clone(&self.recovery)
    }

    /// Diagnoses one incident without acting on it.
    #[must_use]
    pub fn diagnose(&self, incident: &SystemIncident) -> DiagnosticResult {
        self.diagnosis.diagnose(incident)
    }

    /// Processes incidents until the channel closes or the token fires.
    pub async fn run(
        &self,
        mut incidents: mpsc::Receiver<SystemIncident>,
        cancel: CancellationToken,
    ) {
        loop {
            let incident = tokio::select! {
                () = cancel.cancelled() => break,
                incident = incidents.recv() => match incident {
                    Some(incident) => incident,
                    None => break,
                },
            };

            let diagnosis = self.diagnosis.diagnose(&incident);
            info!(
                incident = %incident.id,
                root_cause = ?diagnosis.root_cause,
                confidence = diagnosis.confidence,
                "incident diagnosed"
            );
            metrics::counter!(
                "fault_incidents_diagnosed",
                "root_cause" => format!("{:?}", diagnosis.root_cause)
            )
            .increment(1);

            match self.recovery.recover(&incident, &diagnosis, &cancel).await {
                Some(operation) => info!(
                    operation = %operation.id,
                    status = ?operation.status,
                    "recovery operation finished"
                ),
                None => warn!(
                    incident = %incident.id,
                    "no recovery strategy accepted the incident"
                ),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod integration_tests {
    use infermesh_core::types::NodeInfo;

    use crate::config::RecoveryConfig;

    use super::*;

    #[tokio::test]
    async fn incident_flows_through_diagnosis_into_recovery() {
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            Arc::new(NoopActuator),
        ));
        let ft = FaultTolerance::new(Arc::clone(&recovery));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let mut node = NodeInfo::stub("b".to_string(), "addr".to_string(), 0);
        node.usage.cpu_percent = 0.97;
        tx.send(SystemIncident::node_offline(&node, 3)).await.unwrap();
        drop(tx); // close the channel so the loop drains and exits

        ft.run(rx, cancel).await;

        let history = recovery.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RecoveryStatus::Completed);
        assert_eq!(history[0].node_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            Arc::new(NoopActuator),
        ));
        let ft = FaultTolerance::new(recovery);
        let (_tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Returns immediately despite the open channel.
        ft.run(rx, cancel).await;
    }
}
