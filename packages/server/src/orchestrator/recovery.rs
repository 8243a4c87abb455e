//! Recovery strategies, plan execution, rollback, and learning.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use infermesh_core::types::NodeId;

use crate::config::RecoveryConfig;
use crate::error::ServerError;
use crate::util::now_ms;

use super::fault::{DiagnosticResult, RootCause, SystemIncident};

// ---------------------------------------------------------------------------
// Plan model
// ---------------------------------------------------------------------------

/// Closed set of recovery actions. The string form is wire/persistence
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    DrainNode,
    RestartService,
    ScaleResources,
    ClearCache,
    SnapshotConfig,
    ResetConfig,
    ReconnectPeers,
    VerifyHealth,
    ReadmitNode,
}

/// One step in a recovery plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStep {
    pub action: RecoveryAction,
    pub params: serde_json::Value,
    pub timeout_ms: u64,
    /// A failing critical step ends the operation immediately.
    pub critical: bool,
    /// Reversible steps participate in rollback, in reverse order.
    pub reversible: bool,
    pub order: u32,
}

impl RecoveryStep {
    fn new(action: RecoveryAction, order: u32) -> Self {
        Self {
            action,
            params: serde_json::Value::Null,
            timeout_ms: 10_000,
            critical: false,
            reversible: false,
            order,
        }
    }

    fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }
}

/// Ordered steps a strategy proposes for an incident.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPlan {
    pub strategy: &'static str,
    pub steps: Vec<RecoveryStep>,
}

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub order: u32,
    pub action: RecoveryAction,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RecoveryStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecoveryStatus::Scheduled | RecoveryStatus::InProgress)
    }
}

/// One recovery operation's full record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOperation {
    pub id: Uuid,
    pub incident_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_id: Option<NodeId>,
    pub strategy: &'static str,
    pub steps: Vec<RecoveryStep>,
    pub current_step: usize,
    pub status: RecoveryStatus,
    pub step_results: Vec<StepResult>,
    pub rolled_back: bool,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Strategy contract and the five built-ins
// ---------------------------------------------------------------------------

/// A recovery strategy: eligibility, success estimate, and plan builder.
pub trait RecoveryStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Starting priority in `[1, 10]`; the learning loop may re-weight.
    fn base_priority(&self) -> u8;

    fn can_recover(&self, incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool;

    fn estimate_success_probability(
        &self,
        incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> f64;

    fn build_plan(&self, incident: &SystemIncident, diagnosis: &DiagnosticResult)
        -> RecoveryPlan;
}

pub struct ServiceRestartStrategy;

impl RecoveryStrategy for ServiceRestartStrategy {
    fn name(&self) -> &'static str {
        "service_restart"
    }
    fn base_priority(&self) -> u8 {
        7
    }
    fn can_recover(&self, _incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool {
        matches!(
            diagnosis.root_cause,
            RootCause::ServiceDegradation | RootCause::Unknown
        )
    }
    fn estimate_success_probability(
        &self,
        _incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> f64 {
        match diagnosis.root_cause {
            RootCause::ServiceDegradation => 0.8,
            _ => 0.4,
        }
    }
    fn build_plan(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> RecoveryPlan {
        RecoveryPlan {
            strategy: self.name(),
            steps: vec![
                RecoveryStep::new(RecoveryAction::DrainNode, 0).reversible(),
                RecoveryStep::new(RecoveryAction::RestartService, 1).critical(),
                RecoveryStep::new(RecoveryAction::VerifyHealth, 2),
                RecoveryStep::new(RecoveryAction::ReadmitNode, 3),
            ],
        }
    }
}

pub struct ResourceScalingStrategy;

impl RecoveryStrategy for ResourceScalingStrategy {
    fn name(&self) -> &'static str {
        "resource_scaling"
    }
    fn base_priority(&self) -> u8 {
        6
    }
    fn can_recover(&self, _incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool {
        matches!(
            diagnosis.root_cause,
            RootCause::CpuExhaustion | RootCause::MemoryExhaustion
        )
    }
    fn estimate_success_probability(
        &self,
        _incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> f64 {
        0.6 + 0.2 * diagnosis.confidence
    }
    fn build_plan(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> RecoveryPlan {
        RecoveryPlan {
            strategy: self.name(),
            steps: vec![
                RecoveryStep::new(RecoveryAction::ScaleResources, 0).reversible(),
                RecoveryStep::new(RecoveryAction::VerifyHealth, 1),
            ],
        }
    }
}

pub struct CacheClearingStrategy;

impl RecoveryStrategy for CacheClearingStrategy {
    fn name(&self) -> &'static str {
        "cache_clearing"
    }
    fn base_priority(&self) -> u8 {
        5
    }
    fn can_recover(&self, _incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool {
        matches!(
            diagnosis.root_cause,
            RootCause::MemoryExhaustion | RootCause::ServiceDegradation
        )
    }
    fn estimate_success_probability(
        &self,
        _incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> f64 {
        match diagnosis.root_cause {
            RootCause::MemoryExhaustion => 0.7,
            _ => 0.3,
        }
    }
    fn build_plan(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> RecoveryPlan {
        RecoveryPlan {
            strategy: self.name(),
            steps: vec![
                RecoveryStep::new(RecoveryAction::ClearCache, 0),
                RecoveryStep::new(RecoveryAction::VerifyHealth, 1),
            ],
        }
    }
}

pub struct ConfigResetStrategy;

impl RecoveryStrategy for ConfigResetStrategy {
    fn name(&self) -> &'static str {
        "config_reset"
    }
    fn base_priority(&self) -> u8 {
        3
    }
    fn can_recover(&self, _incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool {
        diagnosis.root_cause == RootCause::Unknown
    }
    fn estimate_success_probability(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> f64 {
        0.3
    }
    fn build_plan(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> RecoveryPlan {
        RecoveryPlan {
            strategy: self.name(),
            steps: vec![
                RecoveryStep::new(RecoveryAction::SnapshotConfig, 0).reversible(),
                RecoveryStep::new(RecoveryAction::ResetConfig, 1).critical().reversible(),
                RecoveryStep::new(RecoveryAction::RestartService, 2).critical(),
                RecoveryStep::new(RecoveryAction::VerifyHealth, 3),
            ],
        }
    }
}

pub struct NetworkRecoveryStrategy;

impl RecoveryStrategy for NetworkRecoveryStrategy {
    fn name(&self) -> &'static str {
        "network_recovery"
    }
    fn base_priority(&self) -> u8 {
        8
    }
    fn can_recover(&self, _incident: &SystemIncident, diagnosis: &DiagnosticResult) -> bool {
        diagnosis.root_cause == RootCause::NetworkIssues
    }
    fn estimate_success_probability(
        &self,
        _incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> f64 {
        0.5 + 0.3 * diagnosis.confidence
    }
    fn build_plan(
        &self,
        _incident: &SystemIncident,
        _diagnosis: &DiagnosticResult,
    ) -> RecoveryPlan {
        RecoveryPlan {
            strategy: self.name(),
            steps: vec![
                RecoveryStep::new(RecoveryAction::ReconnectPeers, 0),
                RecoveryStep::new(RecoveryAction::VerifyHealth, 1),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator seam
// ---------------------------------------------------------------------------

/// Applies recovery steps to the world.
///
/// Production wires this to node control RPCs; the default no-op actuator
/// is the capability stub used by tests and deployments without a control
/// plane.
#[async_trait]
pub trait RecoveryActuator: Send + Sync + 'static {
    /// Applies one step.
    async fn apply(&self, node_id: Option<&str>, step: &RecoveryStep) -> Result<(), ServerError>;

    /// Reverts one previously applied (reversible) step.
    async fn revert(&self, node_id: Option<&str>, step: &RecoveryStep)
        -> Result<(), ServerError>;
}

/// Accepts every step without acting.
pub struct NoopActuator;

#[async_trait]
impl RecoveryActuator for NoopActuator {
    async fn apply(
        &self,
        _node_id: Option<&str>,
        _step: &RecoveryStep,
    ) -> Result<(), ServerError> {
        Ok(())
    }

    async fn revert(
        &self,
        _node_id: Option<&str>,
        _step: &RecoveryStep,
    ) -> Result<(), ServerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecoveryManager
// ---------------------------------------------------------------------------

struct StrategyEntry {
    strategy: Arc<dyn RecoveryStrategy>,
    /// Live priority, re-weighted by the learning loop. Visibility to
    /// selection is eventual.
    priority: AtomicU32,
}

struct ActiveRecovery {
    cancel: CancellationToken,
    timed_out: AtomicBool,
    started: Instant,
    node_id: Option<NodeId>,
}

/// Selects strategies, executes plans step by step, rolls back past the
/// failure threshold, times out stuck operations, and learns priorities
/// from outcomes.
pub struct RecoveryManager {
    strategies: Vec<StrategyEntry>,
    actuator: Arc<dyn RecoveryActuator>,
    active: DashMap<Uuid, Arc<ActiveRecovery>>,
    history: Mutex<VecDeque<RecoveryOperation>>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    /// Creates a manager with the five built-in strategies.
    #[must_use]
    pub fn new(config: RecoveryConfig, actuator: Arc<dyn RecoveryActuator>) -> Self {
        let strategies: Vec<Arc<dyn RecoveryStrategy>> = vec![
            Arc::new(ServiceRestartStrategy),
            Arc::new(ResourceScalingStrategy),
            Arc::new(CacheClearingStrategy),
            Arc::new(ConfigResetStrategy),
            Arc::new(NetworkRecoveryStrategy),
        ];
        Self {
            strategies: strategies
                .into_iter()
                .map(|s| {
                    let priority = u32::from(s.base_priority());
                    StrategyEntry {
                        strategy: s,
                        priority: AtomicU32::new(priority),
                    }
                })
                .collect(),
            actuator,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Current live priority of a strategy, `[1, 10]`.
    #[must_use]
    pub fn priority_of(&self, name: &str) -> Option<u32> {
        self.strategies
            .iter()
            .find(|e| e.strategy.name() == name)
            .map(|e| e.priority.load(Ordering::Relaxed))
    }

    /// Picks the strategy with the best
    /// `0.7 * success_estimate + 0.3 * priority/10` score among those whose
    /// `can_recover` accepts the incident.
    #[must_use]
    pub fn select_strategy(
        &self,
        incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
    ) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies
            .iter()
            .filter(|e| e.strategy.can_recover(incident, diagnosis))
            .map(|e| {
                let estimate = e
                    .strategy
                    .estimate_success_probability(incident, diagnosis)
                    .clamp(0.0, 1.0);
                let priority = f64::from(e.priority.load(Ordering::Relaxed)) / 10.0;
                (Arc::clone(&e.strategy), 0.7 * estimate + 0.3 * priority)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(strategy, _)| strategy)
    }

    /// Runs one recovery operation to a terminal status and records it
    /// into history. Returns the final record.
    pub async fn recover(
        &self,
        incident: &SystemIncident,
        diagnosis: &DiagnosticResult,
        parent_cancel: &CancellationToken,
    ) -> Option<RecoveryOperation> {
        let strategy = self.select_strategy(incident, diagnosis)?;
        let plan = strategy.build_plan(incident, diagnosis);
        let mut steps = plan.steps;
        steps.sort_by_key(|s| s.order);

        let operation_id = Uuid::new_v4();
        let entry = Arc::new(ActiveRecovery {
            cancel: parent_cancel.child_token(),
            timed_out: AtomicBool::new(false),
            started: Instant::now(),
            node_id: incident.node_id.clone(),
        });
        self.active.insert(operation_id, Arc::clone(&entry));

        let mut operation = RecoveryOperation {
            id: operation_id,
            incident_id: incident.id,
            task_id: incident.task_id,
            node_id: incident.node_id.clone(),
            strategy: plan.strategy,
            steps: steps.clone(),
            current_step: 0,
            status: RecoveryStatus::InProgress,
            step_results: Vec::new(),
            rolled_back: false,
            started_at_ms: now_ms(),
            completed_at_ms: None,
        };
        info!(
            operation = %operation_id,
            strategy = plan.strategy,
            incident = %incident.id,
            "recovery started"
        );

        operation.status = self.run_steps(&mut operation, &entry).await;
        operation.completed_at_ms = Some(now_ms());
        self.active.remove(&operation_id);

        metrics::counter!(
            "recovery_operations",
            "status" => format!("{:?}", operation.status)
        )
        .increment(1);
        info!(operation = %operation_id, status = ?operation.status, "recovery finished");

        self.push_history(operation.clone());
        Some(operation)
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run_steps(
        &self,
        operation: &mut RecoveryOperation,
        entry: &ActiveRecovery,
    ) -> RecoveryStatus {
        let total_steps = operation.steps.len().max(1) as f64;
        let node_id = entry.node_id.clone();
        let steps = operation.steps.clone();

        for (i, step) in steps.iter().enumerate() {
            if entry.cancel.is_cancelled() {
                return if entry.timed_out.load(Ordering::SeqCst) {
                    RecoveryStatus::Timeout
                } else {
                    RecoveryStatus::Cancelled
                };
            }
            operation.current_step = i;

            let started = Instant::now();
            let apply = self.actuator.apply(node_id.as_deref(), step);
            let result = tokio::select! {
                () = entry.cancel.cancelled() => {
                    return if entry.timed_out.load(Ordering::SeqCst) {
                        RecoveryStatus::Timeout
                    } else {
                        RecoveryStatus::Cancelled
                    };
                }
                outcome = tokio::time::timeout(Duration::from_millis(step.timeout_ms), apply) => {
                    match outcome {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(ServerError::Timeout(format!(
                            "step {:?} exceeded {}ms",
                            step.action, step.timeout_ms
                        ))),
                    }
                }
            };

            let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
            match result {
                Ok(()) => operation.step_results.push(StepResult {
                    order: step.order,
                    action: step.action,
                    success: true,
                    error: None,
                    duration_ms,
                }),
                Err(e) => {
                    warn!(operation = %operation.id, step = ?step.action, "recovery step failed: {e}");
                    operation.step_results.push(StepResult {
                        order: step.order,
                        action: step.action,
                        success: false,
                        error: Some(e.to_string()),
                        duration_ms,
                    });

                    let failed = operation
                        .step_results
                        .iter()
                        .filter(|r| !r.success)
                        .count() as f64;
                    if step.critical || failed / total_steps > self.config.rollback_threshold {
                        self.rollback(operation, node_id.as_deref()).await;
                    }
                    return RecoveryStatus::Failed;
                }
            }
        }

        // All steps ran; completion requires the success fraction to clear
        // the rollback threshold.
        let successful = operation.step_results.iter().filter(|r| r.success).count() as f64;
        if successful / total_steps >= 1.0 - self.config.rollback_threshold {
            RecoveryStatus::Completed
        } else {
            RecoveryStatus::Failed
        }
    }

    /// Reverts completed reversible steps in reverse order.
    async fn rollback(&self, operation: &mut RecoveryOperation, node_id: Option<&str>) {
        let completed_orders: Vec<u32> = operation
            .step_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.order)
            .collect();

        let mut to_revert: Vec<&RecoveryStep> = operation
            .steps
            .iter()
            .filter(|s| s.reversible && completed_orders.contains(&s.order))
            .collect();
        to_revert.sort_by_key(|s| std::cmp::Reverse(s.order));

        for step in to_revert {
            if let Err(e) = self.actuator.revert(node_id, step).await {
                warn!(operation = %operation.id, step = ?step.action, "rollback step failed: {e}");
            }
        }
        operation.rolled_back = true;
        metrics::counter!("recovery_rollbacks").increment(1);
    }

    /// Marks operations past the recovery timeout, cancelling their work.
    /// Driven by a periodic monitor tick.
    pub fn monitor_tick(&self) {
        let timeout = Duration::from_millis(self.config.recovery_timeout_ms);
        for entry in self.active.iter() {
            if entry.value().started.elapsed() >= timeout {
                warn!(operation = %entry.key(), "recovery operation timed out");
                entry.value().timed_out.store(true, Ordering::SeqCst);
                entry.value().cancel.cancel();
            }
        }
    }

    fn push_history(&self, operation: RecoveryOperation) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(operation);
    }

    /// Completed recovery records, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<RecoveryOperation> {
        self.history.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Re-weights strategy priorities from historical outcomes. Strategies
    /// with at least three recorded operations move toward
    /// `round(10 * success_rate)`, clamped to `[1, 10]`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn relearn_priorities(&self) {
        let history = self.history.lock();
        for entry in &self.strategies {
            let name = entry.strategy.name();
            let outcomes: Vec<&RecoveryOperation> =
                history.iter().filter(|op| op.strategy == name).collect();
            if outcomes.len() < 3 {
                continue;
            }
            let successes = outcomes
                .iter()
                .filter(|op| op.status == RecoveryStatus::Completed)
                .count() as f64;
            let rate = successes / outcomes.len() as f64;
            let new_priority = ((10.0 * rate).round() as u32).clamp(1, 10);
            entry.priority.store(new_priority, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32 as TestCounter;

    use super::super::fault::{DiagnosisEngine, IncidentKind, IncidentMetrics, Severity};
    use super::*;

    fn incident(metrics: IncidentMetrics) -> SystemIncident {
        SystemIncident {
            id: Uuid::new_v4(),
            kind: IncidentKind::ResourceExhaustion,
            description: "test".to_string(),
            severity: Severity::Warning,
            node_id: Some("node-1".to_string()),
            task_id: None,
            symptoms: vec![],
            metrics,
            log_entries: vec![],
            events: vec![],
            at_ms: 0,
        }
    }

    fn cpu_incident() -> (SystemIncident, DiagnosticResult) {
        let inc = incident(IncidentMetrics {
            cpu_percent: 0.95,
            ..IncidentMetrics::default()
        });
        let diag = DiagnosisEngine::new().diagnose(&inc);
        (inc, diag)
    }

    fn network_incident() -> (SystemIncident, DiagnosticResult) {
        let inc = incident(IncidentMetrics {
            response_time_ms: 4_000.0,
            ..IncidentMetrics::default()
        });
        let diag = DiagnosisEngine::new().diagnose(&inc);
        (inc, diag)
    }

    /// Actuator that fails selected actions.
    struct FailingActuator {
        fail_on: Vec<RecoveryAction>,
        applied: TestCounter,
        reverted: TestCounter,
    }

    impl FailingActuator {
        fn new(fail_on: Vec<RecoveryAction>) -> Arc<Self> {
            Arc::new(Self {
                fail_on,
                applied: TestCounter::new(0),
                reverted: TestCounter::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryActuator for FailingActuator {
        async fn apply(
            &self,
            _node_id: Option<&str>,
            step: &RecoveryStep,
        ) -> Result<(), ServerError> {
            if self.fail_on.contains(&step.action) {
                return Err(ServerError::Transport(format!("{:?} refused", step.action)));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn revert(
            &self,
            _node_id: Option<&str>,
            _step: &RecoveryStep,
        ) -> Result<(), ServerError> {
            self.reverted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn cpu_exhaustion_selects_resource_scaling() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        let (inc, diag) = cpu_incident();
        let strategy = manager.select_strategy(&inc, &diag).unwrap();
        assert_eq!(strategy.name(), "resource_scaling");
    }

    #[test]
    fn network_issues_select_network_recovery() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        let (inc, diag) = network_incident();
        let strategy = manager.select_strategy(&inc, &diag).unwrap();
        assert_eq!(strategy.name(), "network_recovery");
    }

    #[tokio::test]
    async fn happy_path_completes_all_steps() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        let (inc, diag) = cpu_incident();
        let cancel = CancellationToken::new();

        let op = manager.recover(&inc, &diag, &cancel).await.unwrap();
        assert_eq!(op.status, RecoveryStatus::Completed);
        assert!(op.step_results.iter().all(|r| r.success));
        assert!(!op.rolled_back);
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn completed_operations_satisfy_success_fraction_invariant() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        let (inc, diag) = cpu_incident();
        let cancel = CancellationToken::new();
        let op = manager.recover(&inc, &diag, &cancel).await.unwrap();

        let successful = op.step_results.iter().filter(|r| r.success).count();
        let fraction = successful as f64 / op.steps.len() as f64;
        assert!(fraction >= 1.0 - RecoveryConfig::default().rollback_threshold);
    }

    #[tokio::test]
    async fn critical_step_failure_rolls_back_reversible_steps() {
        // config_reset plan: snapshot (reversible) succeeds, reset
        // (critical, reversible) fails -> rollback reverts the snapshot.
        let actuator = FailingActuator::new(vec![RecoveryAction::ResetConfig]);
        let manager = RecoveryManager::new(RecoveryConfig::default(), actuator.clone());

        let inc = incident(IncidentMetrics::default()); // all below threshold -> Unknown
        let diag = DiagnosisEngine::new().diagnose(&inc);
        // Force config_reset by checking it is selectable for Unknown and
        // outscores service_restart only if restart cannot recover; both
        // can. Run whichever was selected; if it is service_restart, its
        // plan has no failing step, so retarget the test via priorities.
        let strategy = manager.select_strategy(&inc, &diag).unwrap();
        if strategy.name() == "config_reset" {
            let cancel = CancellationToken::new();
            let op = manager.recover(&inc, &diag, &cancel).await.unwrap();
            assert_eq!(op.status, RecoveryStatus::Failed);
            assert!(op.rolled_back);
            assert!(actuator.reverted.load(Ordering::SeqCst) >= 1);
        } else {
            // Build and run the plan directly against the execution engine
            // via a manager whose restart step fails critically.
            let actuator = FailingActuator::new(vec![RecoveryAction::RestartService]);
            let manager = RecoveryManager::new(RecoveryConfig::default(), actuator.clone());
            let cancel = CancellationToken::new();
            let op = manager.recover(&inc, &diag, &cancel).await.unwrap();
            assert_eq!(op.status, RecoveryStatus::Failed);
            assert!(op.rolled_back, "drain step is reversible and completed");
            assert!(actuator.reverted.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test]
    async fn cancelled_parent_context_yields_cancelled_status() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        let (inc, diag) = cpu_incident();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let op = manager.recover(&inc, &diag, &cancel).await.unwrap();
        assert_eq!(op.status, RecoveryStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_marks_stuck_operations_timeout() {
        /// Actuator that never finishes.
        struct HangingActuator;

        #[async_trait]
        impl RecoveryActuator for HangingActuator {
            async fn apply(
                &self,
                _node_id: Option<&str>,
                _step: &RecoveryStep,
            ) -> Result<(), ServerError> {
                std::future::pending::<()>().await;
                Ok(())
            }
            async fn revert(
                &self,
                _node_id: Option<&str>,
                _step: &RecoveryStep,
            ) -> Result<(), ServerError> {
                Ok(())
            }
        }

        let config = RecoveryConfig {
            recovery_timeout_ms: 1_000,
            ..RecoveryConfig::default()
        };
        let manager = Arc::new(RecoveryManager::new(config, Arc::new(HangingActuator)));
        let (inc, diag) = cpu_incident();

        let runner = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                manager.recover(&inc, &diag, &cancel).await
            })
        };

        // Let the operation start, outlive its budget, then fire the
        // monitor.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(manager.active_count(), 1);
        manager.monitor_tick();

        let op = runner.await.unwrap().unwrap();
        assert_eq!(op.status, RecoveryStatus::Timeout);
        assert_eq!(manager.active_count(), 0, "timed out op left the active set");
        assert_eq!(manager.history()[0].status, RecoveryStatus::Timeout);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let config = RecoveryConfig {
            history_limit: 3,
            ..RecoveryConfig::default()
        };
        let manager = RecoveryManager::new(config, Arc::new(NoopActuator));
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            let (inc, diag) = cpu_incident();
            manager.recover(&inc, &diag, &cancel).await.unwrap();
        }
        assert_eq!(manager.history().len(), 3);
    }

    #[tokio::test]
    async fn learning_reweights_failing_strategy_down() {
        // Every resource_scaling run fails its first step.
        let actuator = FailingActuator::new(vec![RecoveryAction::ScaleResources]);
        let manager = RecoveryManager::new(RecoveryConfig::default(), actuator);
        let cancel = CancellationToken::new();

        let before = manager.priority_of("resource_scaling").unwrap();
        for _ in 0..4 {
            let (inc, diag) = cpu_incident();
            manager.recover(&inc, &diag, &cancel).await.unwrap();
        }
        manager.relearn_priorities();

        let after = manager.priority_of("resource_scaling").unwrap();
        assert!(after < before, "priority {after} should drop below {before}");
        assert!(after >= 1);
    }

    #[test]
    fn selection_scoring_blends_estimate_and_priority() {
        let manager = RecoveryManager::new(RecoveryConfig::default(), Arc::new(NoopActuator));
        // Memory exhaustion: both resource_scaling and cache_clearing are
        // eligible; resource_scaling has the higher estimate and priority.
        let inc = incident(IncidentMetrics {
            memory_percent: 0.95,
            ..IncidentMetrics::default()
        });
        let diag = DiagnosisEngine::new().diagnose(&inc);
        assert_eq!(diag.root_cause, RootCause::MemoryExhaustion);

        let strategy = manager.select_strategy(&inc, &diag).unwrap();
        assert_eq!(strategy.name(), "resource_scaling");
    }
}
