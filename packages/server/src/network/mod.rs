//! HTTP surface: Ollama-compatible inference and model lifecycle routes,
//! cluster observability under `/api/distributed`, health probes, and the
//! graceful shutdown controller.

pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use handlers::{AppState, SERVER_VERSION};
pub use module::NetworkModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
