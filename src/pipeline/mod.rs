// ============================================================================
// File: qemu-runner/src/pipeline/mod.rs
// ----------------------------------------------------------------------------
// Pipeline types handed over by the orchestrator, and the typed contract the
// orchestrator drives an engine through.
// ============================================================================

mod encoding;
mod spec;
mod trait_def;

pub use spec::{File, Secret, Settings, Spec, Step, StepState};
pub use trait_def::{PipelineEngine, PipelineSecret, PipelineSpec, PipelineStep};
