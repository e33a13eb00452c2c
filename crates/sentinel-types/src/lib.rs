/// Shared types, traits, and errors for the Sentinel gateway.
///
/// This crate is the foundation that all other Sentinel crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) that define the seams between subsystems
/// - **Shared data types** (`models`) used across all crates
/// - **Error types** (`errors`) for unified error handling
/// - **Configuration** (`config`) read from `SENTINEL_`-prefixed environment
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use config::SentinelConfig;
pub use errors::{BlockReason, SentinelError};
pub use models::*;
pub use traits::*;
