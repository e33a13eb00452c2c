/// Core of the Sentinel gateway.
///
/// The CaMeL orchestration loop and everything it consumes that is not a
/// scanner or a store: the in-process event bus, the planner and worker
/// API clients, and the gateway facade that fronts the whole system with
/// authentication and rate limiting.
pub mod auth;
pub mod bus;
pub mod gateway;
pub mod llm;
pub mod orchestrator;
pub mod wiring;

pub use bus::{Event, EventBus, Subscription};
pub use gateway::{Gateway, HealthReport, TaskRequest};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorDeps};
pub use wiring::build_gateway;
