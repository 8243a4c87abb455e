//! Incident capture and rule-based root-cause diagnosis.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use infermesh_core::types::{NodeId, NodeInfo};

use crate::util::now_ms;

// ---------------------------------------------------------------------------
// Incident model
// ---------------------------------------------------------------------------

/// What went wrong, coarsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    SubtaskFailure,
    NodeOffline,
    NodeFailed,
    ResourceExhaustion,
    ServiceDegradation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Metrics collected at incident time. Percentages are fractions in
/// `[0, 1]`; `response_time_ms` is wall time of the failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpu_percent: f64,
    pub error_rate: f64,
    pub response_time_ms: f64,
}

/// One observed incident, fed to the diagnosis engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemIncident {
    pub id: Uuid,
    pub kind: IncidentKind,
    pub description: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<Uuid>,
    /// Tagged symptom strings, e.g. `"timeout"`, `"oom"`.
    pub symptoms: Vec<String>,
    pub metrics: IncidentMetrics,
    pub log_entries: Vec<String>,
    pub events: Vec<String>,
    pub at_ms: u64,
}

impl SystemIncident {
    /// Incident for a subtask that exhausted its retries.
    #[must_use]
    pub fn subtask_failure(
        task_id: Uuid,
        node: Option<&NodeInfo>,
        error: &str,
        response_time_ms: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: IncidentKind::SubtaskFailure,
            description: format!("subtask failed after retries: {error}"),
            severity: Severity::Warning,
            node_id: node.map(|n| n.id.clone()),
            task_id: Some(task_id),
            symptoms: vec!["subtask_failure".to_string()],
            metrics: IncidentMetrics {
                cpu_percent: node.map_or(0.0, |n| n.usage.cpu_percent),
                memory_percent: node.map_or(0.0, |n| n.usage.memory_percent),
                gpu_percent: node.map_or(0.0, |n| n.usage.gpu_percent),
                error_rate: 0.0,
                response_time_ms,
            },
            log_entries: vec![error.to_string()],
            events: Vec::new(),
            at_ms: now_ms(),
        }
    }

    /// Incident for a node the health checker declared offline.
    #[must_use]
    pub fn node_offline(node: &NodeInfo, consecutive_failures: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: IncidentKind::NodeOffline,
            description: format!(
                "node {} offline after {consecutive_failures} failed pings",
                node.id
            ),
            severity: Severity::Critical,
            node_id: Some(node.id.clone()),
            task_id: None,
            symptoms: vec!["ping_timeout".to_string(), "unreachable".to_string()],
            metrics: IncidentMetrics {
                cpu_percent: node.usage.cpu_percent,
                memory_percent: node.usage.memory_percent,
                gpu_percent: node.usage.gpu_percent,
                error_rate: 1.0,
                response_time_ms: node.latency_ms.unwrap_or(0.0),
            },
            log_entries: Vec::new(),
            events: vec!["status_changed_offline".to_string()],
            at_ms: now_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnosis
// ---------------------------------------------------------------------------

/// Closed root-cause set. Drives recovery-strategy eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    CpuExhaustion,
    MemoryExhaustion,
    ServiceDegradation,
    NetworkIssues,
    Unknown,
}

/// One sub-analysis contribution to a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub name: &'static str,
    /// Normalized signal strength in `[0, 1]`.
    pub score: f64,
    pub findings: Vec<String>,
}

/// Output of the diagnosis engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub incident_id: Uuid,
    pub root_cause: RootCause,
    /// Confidence in `(0, 1]`.
    pub confidence: f64,
    /// Other causes with their (clamped) excess ratios, strongest first.
    pub alternatives: Vec<(RootCause, f64)>,
    pub evidence: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub analyses: Vec<AnalysisReport>,
}

/// Metric thresholds for root-cause attribution.
const CPU_THRESHOLD: f64 = 0.9;
const MEMORY_THRESHOLD: f64 = 0.85;
const ERROR_RATE_THRESHOLD: f64 = 0.05;
const RESPONSE_TIME_THRESHOLD_MS: f64 = 2_000.0;

/// Rule-based diagnosis over a fixed, normalized feature vector.
///
/// Root-cause selection is deterministic: the metric exceeding its
/// threshold with the highest excess ratio wins; ties break in the fixed
/// order CPU, memory, service, network. No metric over threshold yields
/// `Unknown`.
#[derive(Debug, Default)]
pub struct DiagnosisEngine;

impl DiagnosisEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Fixed feature vector, every component normalized to `[0, 1]`:
    /// `[cpu, memory, gpu, error_rate/0.1, response_time/5s]`.
    #[must_use]
    pub fn features(incident: &SystemIncident) -> [f64; 5] {
        let m = &incident.metrics;
        [
            m.cpu_percent.clamp(0.0, 1.0),
            m.memory_percent.clamp(0.0, 1.0),
            m.gpu_percent.clamp(0.0, 1.0),
            (m.error_rate / 0.1).clamp(0.0, 1.0),
            (m.response_time_ms / 5_000.0).clamp(0.0, 1.0),
        ]
    }

    /// Candidate causes with their threshold excess ratios, in the fixed
    /// tie-break order.
    fn excess_ratios(incident: &SystemIncident) -> [(RootCause, f64); 4] {
        let m = &incident.metrics;
        [
            (RootCause::CpuExhaustion, m.cpu_percent / CPU_THRESHOLD),
            (
                RootCause::MemoryExhaustion,
                m.memory_percent / MEMORY_THRESHOLD,
            ),
            (
                RootCause::ServiceDegradation,
                m.error_rate / ERROR_RATE_THRESHOLD,
            ),
            (
                RootCause::NetworkIssues,
                m.response_time_ms / RESPONSE_TIME_THRESHOLD_MS,
            ),
        ]
    }

    fn recommended_actions(cause: RootCause) -> Vec<String> {
        let actions: &[&str] = match cause {
            RootCause::CpuExhaustion => &[
                "throttle inbound requests",
                "scale out CPU capacity",
                "rebalance load away from the hot node",
            ],
            RootCause::MemoryExhaustion => &[
                "clear model and result caches",
                "scale out memory capacity",
                "evict idle model replicas",
            ],
            RootCause::ServiceDegradation => &[
                "restart the inference service",
                "drain and re-admit the node",
            ],
            RootCause::NetworkIssues => &[
                "re-establish peer connections",
                "verify transport reachability",
            ],
            RootCause::Unknown => &["collect additional diagnostics"],
        };
        actions.iter().map(|s| (*s).to_string()).collect()
    }

    /// Runs all analyses and produces a diagnosis.
    #[must_use]
    pub fn diagnose(&self, incident: &SystemIncident) -> DiagnosticResult {
        let ratios = Self::excess_ratios(incident);

        // Highest excess ratio above 1.0 wins; the array order encodes the
        // tie-break (strictly-greater comparison keeps the earlier entry).
        let mut winner: Option<(RootCause, f64)> = None;
        for &(cause, ratio) in &ratios {
            if ratio >= 1.0 && winner.map_or(true, |(_, best)| ratio > best) {
                winner = Some((cause, ratio));
            }
        }

        let (root_cause, confidence) = match winner {
            Some((cause, ratio)) => {
                let confidence = (0.5 + 0.5 * (ratio - 1.0)).clamp(0.5, 1.0);
                (cause, confidence)
            }
            None => (RootCause::Unknown, 0.2),
        };

        let mut alternatives: Vec<(RootCause, f64)> = ratios
            .iter()
            .filter(|(cause, _)| *cause != root_cause)
            .map(|&(cause, ratio)| (cause, ratio.min(1.0)))
            .collect();
        alternatives.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let evidence = ratios
            .iter()
            .filter(|(_, ratio)| *ratio >= 1.0)
            .map(|(cause, ratio)| format!("{cause:?} excess ratio {ratio:.2}"))
            .collect();

        let analyses = vec![
            Self::log_analysis(incident),
            Self::pattern_analysis(incident),
            Self::ml_analysis(incident),
            Self::root_cause_analysis(&ratios),
        ];

        DiagnosticResult {
            incident_id: incident.id,
            root_cause,
            confidence,
            alternatives,
            evidence,
            recommended_actions: Self::recommended_actions(root_cause),
            analyses,
        }
    }

    /// Counts error-ish lines in the incident's recent logs.
    #[allow(clippy::cast_precision_loss)]
    fn log_analysis(incident: &SystemIncident) -> AnalysisReport {
        let markers = ["error", "fail", "timeout", "panic", "oom"];
        let hits: Vec<String> = incident
            .log_entries
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                markers.iter().any(|m| lower.contains(m))
            })
            .cloned()
            .collect();
        let score = if incident.log_entries.is_empty() {
            0.0
        } else {
            hits.len() as f64 / incident.log_entries.len() as f64
        };
        AnalysisReport {
            name: "log",
            score,
            findings: hits,
        }
    }

    /// Looks for repeated symptoms across the incident's tags and events.
    #[allow(clippy::cast_precision_loss)]
    fn pattern_analysis(incident: &SystemIncident) -> AnalysisReport {
        let mut findings = Vec::new();
        for symptom in &incident.symptoms {
            let repeats = incident
                .events
                .iter()
                .filter(|e| e.contains(symptom.as_str()))
                .count();
            if repeats > 0 {
                findings.push(format!("symptom {symptom} seen in {repeats} recent events"));
            }
        }
        let score =
            (findings.len() as f64 / incident.symptoms.len().max(1) as f64).clamp(0.0, 1.0);
        AnalysisReport {
            name: "pattern",
            score,
            findings,
        }
    }

    /// Capability stub: reports the mean feature activation. A learned
    /// model can be plugged in behind the same report shape.
    #[allow(clippy::cast_precision_loss)]
    fn ml_analysis(incident: &SystemIncident) -> AnalysisReport {
        let features = Self::features(incident);
        let score = features.iter().sum::<f64>() / features.len() as f64;
        AnalysisReport {
            name: "ml",
            score,
            findings: Vec::new(),
        }
    }

    fn root_cause_analysis(ratios: &[(RootCause, f64); 4]) -> AnalysisReport {
        AnalysisReport {
            name: "root_cause",
            score: ratios
                .iter()
                .map(|(_, r)| r.min(1.0))
                .fold(0.0, f64::max),
            findings: ratios
                .iter()
                .map(|(cause, ratio)| format!("{cause:?}: {ratio:.3}"))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn incident_with_metrics(metrics: IncidentMetrics) -> SystemIncident {
        SystemIncident {
            id: Uuid::new_v4(),
            kind: IncidentKind::ResourceExhaustion,
            description: "test".to_string(),
            severity: Severity::Warning,
            node_id: Some("node-1".to_string()),
            task_id: None,
            symptoms: vec!["slow".to_string()],
            metrics,
            log_entries: Vec::new(),
            events: Vec::new(),
            at_ms: 0,
        }
    }

    #[test]
    fn hot_cpu_diagnoses_cpu_exhaustion() {
        // cpu=0.95, memory=0.6, gpu=0.5, error_rate=0.02: only the CPU
        // ratio exceeds its threshold.
        let diagnosis = DiagnosisEngine::new().diagnose(&incident_with_metrics(IncidentMetrics {
            cpu_percent: 0.95,
            memory_percent: 0.6,
            gpu_percent: 0.5,
            error_rate: 0.02,
            response_time_ms: 0.0,
        }));

        assert_eq!(diagnosis.root_cause, RootCause::CpuExhaustion);
        assert!(diagnosis.confidence > 0.0 && diagnosis.confidence <= 1.0);
        assert!(
            diagnosis
                .recommended_actions
                .iter()
                .any(|a| a.to_lowercase().contains("cpu")),
            "actions must include a CPU remediation: {:?}",
            diagnosis.recommended_actions
        );
    }

    #[test]
    fn highest_excess_ratio_wins() {
        // Memory ratio 0.99/0.85 = 1.16 beats CPU 0.92/0.9 = 1.02.
        let diagnosis = DiagnosisEngine::new().diagnose(&incident_with_metrics(IncidentMetrics {
            cpu_percent: 0.92,
            memory_percent: 0.99,
            ..IncidentMetrics::default()
        }));
        assert_eq!(diagnosis.root_cause, RootCause::MemoryExhaustion);
    }

    #[test]
    fn exact_tie_prefers_cpu_over_memory() {
        // Both ratios at exactly 1.0; the fixed order wins.
        let diagnosis = DiagnosisEngine::new().diagnose(&incident_with_metrics(IncidentMetrics {
            cpu_percent: CPU_THRESHOLD,
            memory_percent: MEMORY_THRESHOLD,
            ..IncidentMetrics::default()
        }));
        assert_eq!(diagnosis.root_cause, RootCause::CpuExhaustion);
    }

    #[test]
    fn nothing_over_threshold_is_unknown() {
        let diagnosis = DiagnosisEngine::new().diagnose(&incident_with_metrics(IncidentMetrics {
            cpu_percent: 0.2,
            memory_percent: 0.3,
            gpu_percent: 0.1,
            error_rate: 0.01,
            response_time_ms: 100.0,
        }));
        assert_eq!(diagnosis.root_cause, RootCause::Unknown);
        assert!(diagnosis.confidence > 0.0);
    }

    #[test]
    fn slow_responses_point_at_the_network() {
        let diagnosis = DiagnosisEngine::new().diagnose(&incident_with_metrics(IncidentMetrics {
            response_time_ms: 4_500.0,
            ..IncidentMetrics::default()
        }));
        assert_eq!(diagnosis.root_cause, RootCause::NetworkIssues);
    }

    #[test]
    fn features_are_normalized() {
        let incident = incident_with_metrics(IncidentMetrics {
            cpu_percent: 2.0,       // bogus over-range input
            memory_percent: 0.5,
            gpu_percent: 0.25,
            error_rate: 0.5,        // 5x the normalization ceiling
            response_time_ms: 99_000.0,
        });
        let features = DiagnosisEngine::features(&incident);
        assert!(features.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!((features[1] - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn diagnosis_carries_all_four_analyses() {
        let mut incident = incident_with_metrics(IncidentMetrics::default());
        incident.log_entries = vec![
            "request ok".to_string(),
            "ERROR: cuda out of memory".to_string(),
        ];
        incident.events = vec!["slow response observed".to_string()];

        let diagnosis = DiagnosisEngine::new().diagnose(&incident);
        let names: Vec<&str> = diagnosis.analyses.iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["log", "pattern", "ml", "root_cause"]);

        let log = &diagnosis.analyses[0];
        assert!((log.score - 0.5).abs() < f64::EPSILON);
        assert_eq!(log.findings.len(), 1);

        let pattern = &diagnosis.analyses[1];
        assert!(pattern.score > 0.0, "symptom 'slow' matches an event");
    }

    #[test]
    fn node_offline_incident_is_critical() {
        let node = NodeInfo::stub("b".to_string(), "addr".to_string(), 0);
        let incident = SystemIncident::node_offline(&node, 3);
        assert_eq!(incident.kind, IncidentKind::NodeOffline);
        assert_eq!(incident.severity, Severity::Critical);
        assert_eq!(incident.node_id.as_deref(), Some("b"));
    }
}
