//! Cluster membership and health.
//!
//! Provides the shared node view, the cluster manager (announcements,
//! heartbeats, discovery), the ping-based health checker, bounded ingest
//! queues, and cluster-internal domain types.

pub mod health;
pub mod ingest;
pub mod manager;
pub mod types;
pub mod view;

pub use health::{HealthChecker, OFFLINE_FAILURE_THRESHOLD};
pub use ingest::{DropOldestQueue, INGEST_QUEUE_DEPTH};
pub use manager::{CapacityProbe, ClusterManager, StaticProbe};
pub use types::{ClusterEvent, HealthCheck, HealthStatus};
pub use view::ClusterView;

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
