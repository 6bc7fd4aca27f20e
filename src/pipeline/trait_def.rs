// ============================================================================
// File: qemu-runner/src/pipeline/trait_def.rs
// ----------------------------------------------------------------------------
// Capability traits the orchestrator is generic over, and the engine contract
// ============================================================================

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use super::spec::StepState;

/// Read access to a secret
pub trait PipelineSecret {
    fn name(&self) -> &str;

    /// Secret payload decoded as text
    fn value(&self) -> Cow<'_, str>;

    fn is_masked(&self) -> bool;
}

/// Orchestrator-facing view of a step
pub trait PipelineStep: Clone + Send + Sync {
    type Secret: PipelineSecret;

    fn name(&self) -> &str;

    fn dependencies(&self) -> &[String];

    fn environ(&self) -> &HashMap<String, String>;

    fn set_environ(&mut self, env: HashMap<String, String>);

    fn err_policy(&self) -> &str;

    fn run_policy(&self) -> &str;

    fn secrets(&self) -> &[Self::Secret];

    fn is_detached(&self) -> bool;
}

/// Orchestrator-facing view of a pipeline
pub trait PipelineSpec: Send + Sync {
    type Step: PipelineStep;

    fn steps(&self) -> &[Self::Step];

    fn step_len(&self) -> usize {
        self.steps().len()
    }

    fn step_at(&self, index: usize) -> Option<&Self::Step> {
        self.steps().get(index)
    }
}

/// Engine contract driven by the orchestrator
///
/// The orchestrator calls `setup`, then `run` once per step in the order it
/// chooses, then `destroy`. Calls on one engine never overlap. Each engine
/// names its own concrete spec and step types, so no downcasting happens at
/// this boundary.
pub trait PipelineEngine: Send {
    type Spec: PipelineSpec<Step = Self::Step>;
    type Step: PipelineStep;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepare the execution environment for a pipeline
    fn setup(
        &mut self,
        cancel: &CancellationToken,
        spec: &Self::Spec,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Run one step, streaming its output to `output`
    ///
    /// A non-zero exit code is data, not an error.
    fn run<W>(
        &mut self,
        cancel: &CancellationToken,
        spec: &Self::Spec,
        step: &Self::Step,
        output: &mut W,
    ) -> impl Future<Output = Result<StepState, Self::Error>> + Send
    where
        W: AsyncWrite + Unpin + Send + ?Sized;

    /// Tear the environment down; safe after a failed or partial setup
    fn destroy(&mut self, spec: &Self::Spec) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Verify the engine's runtime is reachable
    fn ping(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
