/// Tool execution for the Sentinel gateway.
///
/// A closed set of tools dispatched through the deterministic policy
/// engine and the provenance store. Every path is resolved against the
/// workspace root before checking; file writes record provenance so later
/// reads inherit the writer's trust; execution-capable tools additionally
/// refuse files whose recorded writer is untrusted.
pub mod executor;

pub use executor::{ToolExecutor, ToolFailure};
