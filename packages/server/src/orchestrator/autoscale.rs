//! Composite autoscaling policies.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::AutoscaleConfig;

/// What the autoscaler wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

/// One policy's (or the composite's) verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub target_replicas: u32,
    pub reason: String,
    pub confidence: f64,
    pub priority: u8,
}

impl ScalingDecision {
    fn none(current: u32, reason: &str) -> Self {
        Self {
            action: ScalingAction::NoAction,
            target_replicas: current,
            reason: reason.to_string(),
            confidence: 0.0,
            priority: 0,
        }
    }
}

/// Aggregated cluster metrics fed to the policies each evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClusterMetricsSnapshot {
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub queue_length: u32,
    pub avg_response_time_ms: f64,
    /// Items per second across the cluster.
    pub throughput: f64,
    pub current_replicas: u32,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// A single-signal scaling policy.
pub trait ScalingPolicy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Weight of this policy's vote in the composite score.
    fn weight(&self) -> f64;

    fn evaluate(&self, snapshot: &ClusterMetricsSnapshot) -> ScalingDecision;
}

/// Shared shape: above `high` vote up, below `low` vote down.
fn band_decision(
    value: f64,
    high: f64,
    low: f64,
    current: u32,
    priority: u8,
    label: &str,
) -> ScalingDecision {
    if value > high {
        let confidence = (0.5 + 2.0 * (value / high - 1.0)).clamp(0.3, 1.0);
        ScalingDecision {
            action: ScalingAction::ScaleUp,
            target_replicas: current + 1,
            reason: format!("{label} {value:.2} above {high:.2}"),
            confidence,
            priority,
        }
    } else if value < low {
        let confidence = if low > 0.0 {
            (0.3 + 0.5 * (1.0 - value / low)).clamp(0.3, 1.0)
        } else {
            0.3
        };
        ScalingDecision {
            action: ScalingAction::ScaleDown,
            target_replicas: current.saturating_sub(1),
            reason: format!("{label} {value:.2} below {low:.2}"),
            confidence,
            priority,
        }
    } else {
        ScalingDecision::none(current, &format!("{label} within band"))
    }
}

/// CPU: scale up above the threshold, down below half of it.
pub struct CpuPolicy {
    pub threshold: f64,
}

impl ScalingPolicy for CpuPolicy {
    fn name(&self) -> &'static str {
        "cpu"
    }
    fn weight(&self) -> f64 {
        1.0
    }
    fn evaluate(&self, s: &ClusterMetricsSnapshot) -> ScalingDecision {
        band_decision(
            s.avg_cpu_percent,
            self.threshold,
            0.5 * self.threshold,
            s.current_replicas,
            8,
            "cpu",
        )
    }
}

/// Memory: scale up above the threshold, down below 0.4x of it.
pub struct MemoryPolicy {
    pub threshold: f64,
}

impl ScalingPolicy for MemoryPolicy {
    fn name(&self) -> &'static str {
        "memory"
    }
    fn weight(&self) -> f64 {
        0.8
    }
    fn evaluate(&self, s: &ClusterMetricsSnapshot) -> ScalingDecision {
        band_decision(
            s.avg_memory_percent,
            self.threshold,
            0.4 * self.threshold,
            s.current_replicas,
            7,
            "memory",
        )
    }
}

/// Queue size: scale up above the threshold, down below 20% of it.
pub struct QueuePolicy {
    pub threshold: u32,
}

impl ScalingPolicy for QueuePolicy {
    fn name(&self) -> &'static str {
        "queue"
    }
    fn weight(&self) -> f64 {
        0.6
    }
    fn evaluate(&self, s: &ClusterMetricsSnapshot) -> ScalingDecision {
        band_decision(
            f64::from(s.queue_length),
            f64::from(self.threshold),
            0.2 * f64::from(self.threshold),
            s.current_replicas,
            6,
            "queue",
        )
    }
}

/// Response time: scale up above the threshold, down below 30% of it.
pub struct ResponseTimePolicy {
    pub threshold_ms: f64,
}

impl ScalingPolicy for ResponseTimePolicy {
    fn name(&self) -> &'static str {
        "response_time"
    }
    fn weight(&self) -> f64 {
        0.9
    }
    fn evaluate(&self, s: &ClusterMetricsSnapshot) -> ScalingDecision {
        band_decision(
            s.avg_response_time_ms,
            self.threshold_ms,
            0.3 * self.threshold_ms,
            s.current_replicas,
            8,
            "response_time",
        )
    }
}

/// Throughput: starving throughput with queued work votes up.
pub struct ThroughputPolicy {
    pub floor: f64,
}

impl ScalingPolicy for ThroughputPolicy {
    fn name(&self) -> &'static str {
        "throughput"
    }
    fn weight(&self) -> f64 {
        0.5
    }
    fn evaluate(&self, s: &ClusterMetricsSnapshot) -> ScalingDecision {
        if s.throughput < self.floor && s.queue_length > 0 {
            ScalingDecision {
                action: ScalingAction::ScaleUp,
                target_replicas: s.current_replicas + 1,
                reason: format!(
                    "throughput {:.2} below floor {:.2} with queued work",
                    s.throughput, self.floor
                ),
                confidence: 0.4,
                priority: 4,
            }
        } else {
            ScalingDecision::none(s.current_replicas, "throughput acceptable")
        }
    }
}

// ---------------------------------------------------------------------------
// Autoscaler (composite)
// ---------------------------------------------------------------------------

/// Vote totals from one composite evaluation, kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeScores {
    pub scale_up: f64,
    pub scale_down: f64,
}

/// Combines the five policies into one decision per tick.
///
/// `score_up = sum(conf_i * weight_i)` over ScaleUp voters, likewise for
/// down. Up wins above 0.5 when it beats down; down wins above 0.3 when it
/// beats up. Cooldown windows suppress repeat decisions; min/max replicas
/// clamp the target.
pub struct Autoscaler {
    policies: Vec<Box<dyn ScalingPolicy>>,
    config: AutoscaleConfig,
    last_scale_up: Mutex<Option<Instant>>,
    last_scale_down: Mutex<Option<Instant>>,
    last_scores: Mutex<CompositeScores>,
}

impl Autoscaler {
    #[must_use]
    pub fn new(config: AutoscaleConfig) -> Self {
        let policies: Vec<Box<dyn ScalingPolicy>> = vec![
            Box::new(CpuPolicy {
                threshold: config.cpu_threshold,
            }),
            Box::new(MemoryPolicy {
                threshold: config.memory_threshold,
            }),
            Box::new(QueuePolicy {
                threshold: config.queue_threshold,
            }),
            Box::new(ResponseTimePolicy {
                threshold_ms: config.response_time_threshold_ms,
            }),
            Box::new(ThroughputPolicy {
                floor: config.throughput_floor,
            }),
        ];
        Self {
            policies,
            config,
            last_scale_up: Mutex::new(None),
            last_scale_down: Mutex::new(None),
            last_scores: Mutex::new(CompositeScores {
                scale_up: 0.0,
                scale_down: 0.0,
            }),
        }
    }

    /// Scores from the most recent evaluation.
    #[must_use]
    pub fn last_scores(&self) -> CompositeScores {
        *self.last_scores.lock()
    }

    fn in_cooldown(last: &Mutex<Option<Instant>>, window_ms: u64) -> bool {
        last.lock()
            .map_or(false, |at| at.elapsed() < Duration::from_millis(window_ms))
    }

    /// Evaluates all policies and combines their votes. A non-`NoAction`
    /// result stamps the matching cooldown window.
    pub fn evaluate(&self, snapshot: &ClusterMetricsSnapshot) -> ScalingDecision {
        let votes: Vec<ScalingDecision> = self
            .policies
            .iter()
            .map(|p| {
                let decision = p.evaluate(snapshot);
                debug!(policy = p.name(), action = ?decision.action, "policy vote");
                decision
            })
            .collect();

        let mut score_up = 0.0;
        let mut score_down = 0.0;
        let mut up_target = snapshot.current_replicas;
        let mut down_target = snapshot.current_replicas;
        let mut up_priority = 0u8;
        let mut down_priority = 0u8;
        for (policy, vote) in self.policies.iter().zip(votes.iter()) {
            match vote.action {
                ScalingAction::ScaleUp => {
                    score_up += vote.confidence * policy.weight();
                    up_target = up_target.max(vote.target_replicas);
                    up_priority = up_priority.max(vote.priority);
                }
                ScalingAction::ScaleDown => {
                    score_down += vote.confidence * policy.weight();
                    down_target = down_target.min(vote.target_replicas);
                    down_priority = down_priority.max(vote.priority);
                }
                ScalingAction::NoAction => {}
            }
        }
        *self.last_scores.lock() = CompositeScores {
            scale_up: score_up,
            scale_down: score_down,
        };

        let current = snapshot.current_replicas;
        if score_up > score_down && score_up > 0.5 {
            if Self::in_cooldown(&self.last_scale_up, self.config.scale_up_cooldown_ms) {
                return ScalingDecision::none(current, "scale-up suppressed by cooldown");
            }
            let target = up_target.clamp(self.config.min_replicas, self.config.max_replicas);
            if target == current {
                return ScalingDecision::none(current, "already at max replicas");
            }
            *self.last_scale_up.lock() = Some(Instant::now());
            info!(target, score = score_up, "composite scale-up");
            return ScalingDecision {
                action: ScalingAction::ScaleUp,
                target_replicas: target,
                reason: format!("scale-up score {score_up:.2} beats down {score_down:.2}"),
                confidence: score_up.min(1.0),
                priority: up_priority,
            };
        }

        if score_down > score_up && score_down > 0.3 {
            if Self::in_cooldown(&self.last_scale_down, self.config.scale_down_cooldown_ms) {
                return ScalingDecision::none(current, "scale-down suppressed by cooldown");
            }
            let target = down_target.clamp(self.config.min_replicas, self.config.max_replicas);
            if target == current {
                return ScalingDecision::none(current, "already at min replicas");
            }
            *self.last_scale_down.lock() = Some(Instant::now());
            info!(target, score = score_down, "composite scale-down");
            return ScalingDecision {
                action: ScalingAction::ScaleDown,
                target_replicas: target,
                reason: format!("scale-down score {score_down:.2} beats up {score_up:.2}"),
                confidence: score_down.min(1.0),
                priority: down_priority,
            };
        }

        ScalingDecision::none(current, "no score cleared its gate")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoscaleConfig {
        AutoscaleConfig {
            enabled: true,
            ..AutoscaleConfig::default()
        }
    }

    /// cpu=85%, memory=60%, queue=5 (threshold 50), response=200ms.
    fn s6_snapshot() -> ClusterMetricsSnapshot {
        ClusterMetricsSnapshot {
            avg_cpu_percent: 0.85,
            avg_memory_percent: 0.6,
            queue_length: 5,
            avg_response_time_ms: 200.0,
            throughput: 50.0,
            current_replicas: 3,
        }
    }

    #[tokio::test]
    async fn composite_scale_up_dominated_by_cpu_and_response_time() {
        let scaler = Autoscaler::new(config());
        let decision = scaler.evaluate(&s6_snapshot());

        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_replicas, 4, "max of the up-voter targets");

        let scores = scaler.last_scores();
        assert!(scores.scale_up > 0.5, "score_up {}", scores.scale_up);
        assert!(scores.scale_up > scores.scale_down);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_is_suppressed_inside_cooldown() {
        let scaler = Autoscaler::new(config());

        let first = scaler.evaluate(&s6_snapshot());
        assert_eq!(first.action, ScalingAction::ScaleUp);

        let second = scaler.evaluate(&s6_snapshot());
        assert_eq!(second.action, ScalingAction::NoAction);
        assert!(second.reason.contains("cooldown"));

        // Past the cooldown window the decision fires again.
        tokio::time::sleep(Duration::from_millis(config().scale_up_cooldown_ms + 1)).await;
        let third = scaler.evaluate(&s6_snapshot());
        assert_eq!(third.action, ScalingAction::ScaleUp);
    }

    #[tokio::test]
    async fn idle_cluster_scales_down() {
        let scaler = Autoscaler::new(config());
        let decision = scaler.evaluate(&ClusterMetricsSnapshot {
            avg_cpu_percent: 0.1,
            avg_memory_percent: 0.1,
            queue_length: 0,
            avg_response_time_ms: 20.0,
            throughput: 100.0,
            current_replicas: 5,
        });
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.target_replicas, 4);
    }

    #[tokio::test]
    async fn max_replicas_clamps_the_target() {
        let scaler = Autoscaler::new(AutoscaleConfig {
            max_replicas: 3,
            ..config()
        });
        let decision = scaler.evaluate(&s6_snapshot());
        // current is already 3 = max: nothing to do.
        assert_eq!(decision.action, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn min_replicas_clamps_scale_down() {
        let scaler = Autoscaler::new(AutoscaleConfig {
            min_replicas: 5,
            ..config()
        });
        let decision = scaler.evaluate(&ClusterMetricsSnapshot {
            avg_cpu_percent: 0.05,
            current_replicas: 5,
            ..ClusterMetricsSnapshot::default()
        });
        assert_eq!(decision.action, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn quiet_metrics_mean_no_action() {
        let scaler = Autoscaler::new(config());
        let decision = scaler.evaluate(&ClusterMetricsSnapshot {
            avg_cpu_percent: 0.6,
            avg_memory_percent: 0.6,
            queue_length: 20,
            avg_response_time_ms: 120.0,
            throughput: 10.0,
            current_replicas: 3,
        });
        assert_eq!(decision.action, ScalingAction::NoAction);
    }

    #[test]
    fn cpu_policy_band() {
        let policy = CpuPolicy { threshold: 0.8 };
        let up = policy.evaluate(&ClusterMetricsSnapshot {
            avg_cpu_percent: 0.9,
            current_replicas: 2,
            ..ClusterMetricsSnapshot::default()
        });
        assert_eq!(up.action, ScalingAction::ScaleUp);
        assert_eq!(up.target_replicas, 3);

        let down = policy.evaluate(&ClusterMetricsSnapshot {
            avg_cpu_percent: 0.2,
            current_replicas: 2,
            ..ClusterMetricsSnapshot::default()
        });
        assert_eq!(down.action, ScalingAction::ScaleDown);
        assert_eq!(down.target_replicas, 1);
    }

    #[test]
    fn throughput_policy_needs_queued_work() {
        let policy = ThroughputPolicy { floor: 5.0 };
        let starving = policy.evaluate(&ClusterMetricsSnapshot {
            throughput: 1.0,
            queue_length: 10,
            current_replicas: 2,
            ..ClusterMetricsSnapshot::default()
        });
        assert_eq!(starving.action, ScalingAction::ScaleUp);

        let idle = policy.evaluate(&ClusterMetricsSnapshot {
            throughput: 1.0,
            queue_length: 0,
            current_replicas: 2,
            ..ClusterMetricsSnapshot::default()
        });
        assert_eq!(idle.action, ScalingAction::NoAction);
    }
}
