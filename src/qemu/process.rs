// ============================================================================
// File: qemu-runner/src/qemu/process.rs
// ----------------------------------------------------------------------------
// Hypervisor process supervision.
//
// - VmLaunch: how to start QEMU (per-image script or direct invocation)
// - VmHandle: pid, the one-shot exit signal and the watcher's signal queue
// - the watcher task owns the Child: it alone reaps and signals it, and it
//   kills the process if the handle is dropped while it still runs
// - ExitSignal: caches the single exit event so it can be read repeatedly
// ============================================================================

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rand::Rng;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{EngineError, EngineResult};

/// Guest memory for direct launches, in MiB
const MEMORY_MIB: u32 = 2048;

/// Virtual CPUs for direct launches
const VCPU_COUNT: u32 = 2;

/// SSH forwarding port drawn uniformly from the non-privileged range
pub fn random_ssh_port() -> u16 {
    rand::rng().random_range(1025..=65535)
}

/// How the hypervisor process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited or was killed
    Status(ExitStatus),
    /// Waiting on the process failed
    WaitFailed(String),
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Status(status) if status.success())
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Status(status) => write!(f, "{status}"),
            ProcessExit::WaitFailed(details) => write!(f, "wait failed: {details}"),
        }
    }
}

/// Receiving side of the exit watcher's single-slot channel
///
/// The event is delivered once; after that it is cached so later readers
/// (readiness monitor, then stop) see the same outcome.
#[derive(Debug)]
pub struct ExitSignal {
    rx: Option<oneshot::Receiver<ProcessExit>>,
    outcome: Option<ProcessExit>,
}

impl ExitSignal {
    pub fn new(rx: oneshot::Receiver<ProcessExit>) -> Self {
        Self {
            rx: Some(rx),
            outcome: None,
        }
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> ProcessExit {
        if let Some(exit) = &self.outcome {
            return exit.clone();
        }

        let exit = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                ProcessExit::WaitFailed("exit watcher went away".to_string())
            }),
            None => ProcessExit::WaitFailed("exit signal already consumed".to_string()),
        };
        self.settle(exit)
    }

    /// The exit outcome if the process has already exited
    pub fn try_outcome(&mut self) -> Option<ProcessExit> {
        if self.outcome.is_some() {
            return self.outcome.clone();
        }

        let exit = match self.rx.as_mut()?.try_recv() {
            Ok(exit) => exit,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => {
                ProcessExit::WaitFailed("exit watcher went away".to_string())
            }
        };
        Some(self.settle(exit))
    }

    fn settle(&mut self, exit: ProcessExit) -> ProcessExit {
        self.rx = None;
        self.outcome = Some(exit.clone());
        exit
    }
}

/// Everything needed to start the hypervisor for one run
#[derive(Debug, Clone)]
pub struct VmLaunch {
    pub image_dir: PathBuf,
    pub image: String,
    pub ephemeral_image: PathBuf,
    pub seed_image: PathBuf,
    pub ssh_port: u16,
    /// QEMU binary used when the image has no launch script
    pub qemu_system: PathBuf,
}

impl VmLaunch {
    /// Per-image launch script, preferred over the direct invocation
    pub fn launch_script(&self) -> PathBuf {
        self.image_dir.join(format!("{}.qemu.sh", self.image))
    }

    /// Arguments for launching QEMU directly
    pub fn qemu_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-enable-kvm", "-cpu", "host", "-no-reboot"]
            .into_iter()
            .map(OsString::from)
            .collect();

        args.push("-drive".into());
        args.push(
            format!(
                "file={},format=qcow2,if=virtio",
                qemu_escape(&self.ephemeral_image)
            )
            .into(),
        );
        args.push("-drive".into());
        args.push(
            format!(
                "file={},format=raw,if=virtio,readonly=on",
                qemu_escape(&self.seed_image)
            )
            .into(),
        );
        args.push("-netdev".into());
        args.push(format!("user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22", self.ssh_port).into());
        args.push("-device".into());
        args.push("virtio-net-pci,netdev=net0".into());
        args.push("-nographic".into());
        args.push("-m".into());
        args.push(MEMORY_MIB.to_string().into());
        args.push("-smp".into());
        args.push(VCPU_COUNT.to_string().into());
        args
    }

    fn command(&self) -> Command {
        let script = self.launch_script();
        let mut cmd = if script.is_file() {
            info!("Starting hypervisor via {}", script.display());
            Command::new(script)
        } else {
            info!("Starting {}", self.qemu_system.display());
            let mut cmd = Command::new(&self.qemu_system);
            cmd.args(self.qemu_args());
            cmd
        };

        cmd.env("QEMU_IMAGE", &self.ephemeral_image)
            .env("QEMU_SSH_PORT", self.ssh_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// QEMU option values escape commas by doubling them
fn qemu_escape(path: &Path) -> String {
    path.to_string_lossy().replace(',', ",,")
}

/// A running hypervisor
#[derive(Debug)]
pub struct VmHandle {
    pid: Pid,
    exit: ExitSignal,
    signals: mpsc::UnboundedSender<Signal>,
}

impl VmHandle {
    /// Launch the hypervisor and start its exit watcher
    ///
    /// Must be called from within a Tokio runtime. Dropping the handle kills
    /// the process.
    pub fn start(launch: &VmLaunch) -> EngineResult<Self> {
        let child = launch
            .command()
            .spawn()
            .map_err(|e| EngineError::Provision {
                details: format!("Hypervisor process failed to start: {e}"),
            })?;

        let pid = child.id().ok_or_else(|| EngineError::Provision {
            details: "Hypervisor process exited before its pid was known".to_string(),
        })?;
        let pid = Pid::from_raw(pid as i32);

        let (tx, rx) = oneshot::channel();
        let (signals, requests) = mpsc::unbounded_channel();
        tokio::spawn(watch(child, pid, requests, tx));

        Ok(Self {
            pid,
            exit: ExitSignal::new(rx),
            signals,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// The process-exit event
    pub fn exit_signal(&mut self) -> &mut ExitSignal {
        &mut self.exit
    }

    /// Interrupt the hypervisor and wait for it to exit
    ///
    /// Escalates to SIGKILL if the process is still alive after `grace`.
    pub async fn stop(mut self, grace: Duration) -> ProcessExit {
        if let Some(exit) = self.exit.try_outcome() {
            debug!("Hypervisor process {} already exited", self.pid);
            return exit;
        }

        self.signal(Signal::SIGINT);

        match tokio::time::timeout(grace, self.exit.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    "Hypervisor process {} still running {:?} after SIGINT, killing",
                    self.pid, grace
                );
                self.signal(Signal::SIGKILL);
                self.exit.wait().await
            }
        }
    }

    /// Queue `signal` for the watcher; a no-op once the process is reaped
    fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            debug!(
                "Hypervisor process {} already reaped, not sending {}",
                self.pid, signal
            );
        }
    }
}

/// Reap the child, delivering queued signals while it is still ours to signal
async fn watch(
    mut child: Child,
    pid: Pid,
    mut requests: mpsc::UnboundedReceiver<Signal>,
    tx: oneshot::Sender<ProcessExit>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = requests.recv() => match request {
                Some(signal) => deliver(&child, signal),
                None => {
                    warn!("Hypervisor handle for process {} dropped, killing it", pid);
                    if let Err(e) = child.start_kill() {
                        debug!("Failed to kill hypervisor process {}: {}", pid, e);
                    }
                    break child.wait().await;
                }
            },
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::Status(status),
        Err(e) => ProcessExit::WaitFailed(e.to_string()),
    };
    debug!("Hypervisor process {} exited: {}", pid, exit);
    let _ = tx.send(exit);
}

fn deliver(child: &Child, signal: Signal) {
    // `id()` is None once the child has been reaped and its pid may be reused
    let Some(id) = child.id() else {
        return;
    };
    match kill(Pid::from_raw(id as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to hypervisor process {}: {}", signal, id, e),
    }
}
