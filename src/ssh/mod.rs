// ============================================================================
// File: qemu-runner/src/ssh/mod.rs
// ----------------------------------------------------------------------------
// Remote exec and file transfer into the live VM.
//
// Blocking ssh2 work runs on the blocking pool; the async side owns output
// streaming and cancellation.
// ============================================================================

mod config;
mod remote;
mod session;
mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SshTarget;
pub use remote::{Connector, RemoteShell, SshConnector, SshRemote};
pub use transfer::upload_all;
