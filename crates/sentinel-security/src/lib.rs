/// Security layers of the Sentinel gateway.
///
/// Everything that inspects or transforms text at a trust boundary lives
/// here: the deterministic policy engine, the scanner set, spotlighting,
/// code extraction and static analysis, the composed scan pipeline, and
/// the multi-turn conversation analyzer.
pub mod code_extractor;
pub mod code_shield;
pub mod command_pattern;
pub mod conversation;
pub mod credential;
pub mod echo;
pub mod encoding;
pub mod injection;
pub mod pipeline;
pub mod policy;
pub mod script_gate;
pub mod sensitive_path;
pub mod spotlighting;

pub use conversation::{AnalysisResult, ConversationAnalyzer};
pub use pipeline::{PipelineBlock, ProcessOutcome, ProcessRequest, ScanPipeline};
pub use policy::PolicyEngine;
