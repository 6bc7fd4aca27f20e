// ============================================================================
// File: qemu-runner/src/error.rs
// ----------------------------------------------------------------------------
// Error types for the engine and the remote shell layer.
//
// Two layers:
// - RemoteError: outcome of a single SSH exec or copy
// - EngineError: what setup/run report back to the orchestrator
// ============================================================================

use std::path::PathBuf;

use crate::engine::EngineState;
use crate::qemu::ProcessExit;

/// Failure of a single remote operation
///
/// Keeps "the command ran and failed" apart from "the command never ran".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The remote command ran and exited with a non-zero status
    #[error("Remote command exited with status {code}")]
    Exit { code: i32 },

    /// The remote command was terminated by a signal
    #[error("Remote command was killed by signal {signal}")]
    Signal { signal: String },

    /// Session never established or dropped mid-flight
    #[error("SSH transport failed: {details}")]
    Transport { details: String },

    /// Host-side I/O (temporary files, output sink)
    #[error("Local I/O failed: {details}")]
    Io { details: String },

    /// The caller cancelled the operation
    #[error("Remote operation cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Exit code the remote side produced, if it ran at all
    ///
    /// Signals follow the shell convention of `128 + signal number`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RemoteError::Exit { code } => Some(*code),
            RemoteError::Signal { signal } => Some(signal_exit_code(signal)),
            _ => None,
        }
    }

    pub(crate) fn transport(details: impl Into<String>) -> Self {
        RemoteError::Transport {
            details: details.into(),
        }
    }

    pub(crate) fn io(details: impl Into<String>) -> Self {
        RemoteError::Io {
            details: details.into(),
        }
    }
}

/// Map an SSH signal name (RFC 4254, no `SIG` prefix) to a shell exit code
fn signal_exit_code(signal: &str) -> i32 {
    let name = signal.strip_prefix("SIG").unwrap_or(signal);
    let number = match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => return 255,
    };
    128 + number
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Engine-level error taxonomy
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Machine descriptor missing, unreadable or malformed
    #[error("Invalid machine config {}: {details}", path.display())]
    Config { path: PathBuf, details: String },

    /// Disk image creation or hypervisor launch failed
    #[error("Provisioning failed: {details}")]
    Provision { details: String },

    /// Hypervisor exited before the machine became reachable
    #[error("Hypervisor process died before the machine came online: {exit}")]
    ProcessDied { exit: ProcessExit },

    /// No successful boot probe within the deadline
    #[error("Machine did not come online within {seconds} seconds")]
    BootTimeout { seconds: u64 },

    /// Directory creation or file copy into the VM failed
    #[error("File transfer to {path} failed: {source}")]
    Transfer { path: String, source: RemoteError },

    /// The step command could not be run at all
    #[error("Command execution failed: {source}")]
    Execution { source: RemoteError },

    /// Operation called in the wrong lifecycle state
    #[error("Engine is {state}, expected {expected}")]
    NotReady {
        state: EngineState,
        expected: EngineState,
    },

    /// The caller cancelled setup
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
