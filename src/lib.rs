//! Pipeline step engine backed by an ephemeral QEMU virtual machine.
//!
//! One [`Engine`] owns exactly one VM for the lifetime of one pipeline run:
//! `setup` provisions a copy-on-write disk, boots the hypervisor and waits for
//! SSH; `run` executes one step per call over SSH; `destroy` tears everything
//! down, even after a partial setup.

pub mod engine;
pub mod error;
pub mod pipeline;
pub mod qemu;
pub mod quote;
pub mod race;
pub mod ssh;

pub use engine::{Engine, EngineOpts, EngineState};
pub use error::{EngineError, EngineResult, RemoteError, RemoteResult};
pub use pipeline::{
    File, PipelineEngine, PipelineSecret, PipelineSpec, PipelineStep, Secret, Settings, Spec,
    Step, StepState,
};
pub use qemu::{ConfigReadPolicy, MachineConfig};
pub use ssh::{RemoteShell, SshConnector, SshRemote, SshTarget};
