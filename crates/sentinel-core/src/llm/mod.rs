/// LLM backend clients.
///
/// The planner runs on a remote text-generation API and is trusted but
/// advisory; the worker runs on a local API on an isolated network and is
/// never trusted. Both are consumed through the traits in
/// `sentinel-types` so the orchestrator can be tested against mocks.
pub mod planner;
pub mod worker;

pub use planner::RemotePlanner;
pub use worker::LocalWorker;
