// Pipeline execution and monitoring module
// Orchestrates voice transforms, stem rendering and mixdown per target

pub mod orchestrator;
pub mod trace;

pub use orchestrator::{
    Orchestrator, PipelineError, PipelineResult, TargetFailure, TargetReport, TargetState,
    TargetStatus,
};
pub use trace::{read_trace_file, TraceBuilder, TraceEntry, TraceError, TraceWriter};
