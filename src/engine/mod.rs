// ============================================================================
// File: qemu-runner/src/engine/mod.rs
// ----------------------------------------------------------------------------
// The QEMU engine: one ephemeral VM per pipeline run.
//
// Idle -> Provisioning -> Booting -> Ready (run, run, ...) -> Destroying -> Destroyed
// ============================================================================

mod execution;
mod lifecycle;


use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{PipelineEngine, Spec, Step, StepState};
use crate::qemu::{BOOT_TIMEOUT, ConfigReadPolicy, MachineConfig, PROBE_INTERVAL, VmHandle};
use crate::ssh::{Connector, SshConnector};

pub use execution::{effective_environment, run_step};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOpts {
    /// Directory holding base images, `.qemu.json` descriptors and launch scripts
    pub image_dir: PathBuf,

    /// Where ephemeral images and upload staging files are created
    pub temp_dir: PathBuf,

    /// Private key used to log into the guest
    pub private_key: PathBuf,

    /// Disk image tool
    pub qemu_img: PathBuf,

    /// Hypervisor binary for images without a launch script
    pub qemu_system: PathBuf,

    /// How a missing or unreadable descriptor is treated
    pub config_policy: ConfigReadPolicy,

    /// Upper bound on boot time
    pub boot_timeout: Duration,

    /// Delay between boot probes
    pub probe_interval: Duration,

    /// TCP connect timeout for each SSH session
    pub connect_timeout: Duration,

    /// How long the hypervisor gets to exit after SIGINT before SIGKILL
    pub stop_grace: Duration,
}

impl EngineOpts {
    pub fn new<P: Into<PathBuf>>(image_dir: P) -> Self {
        Self {
            image_dir: image_dir.into(),
            temp_dir: std::env::temp_dir(),
            private_key: PathBuf::from("id_rsa"),
            qemu_img: PathBuf::from("qemu-img"),
            qemu_system: PathBuf::from("qemu-system-x86_64"),
            config_policy: ConfigReadPolicy::default(),
            boot_timeout: BOOT_TIMEOUT,
            probe_interval: PROBE_INTERVAL,
            connect_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_secs(30),
        }
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, temp_dir: P) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_private_key<P: Into<PathBuf>>(mut self, private_key: P) -> Self {
        self.private_key = private_key.into();
        self
    }

    pub fn with_qemu_img<P: Into<PathBuf>>(mut self, qemu_img: P) -> Self {
        self.qemu_img = qemu_img.into();
        self
    }

    pub fn with_qemu_system<P: Into<PathBuf>>(mut self, qemu_system: P) -> Self {
        self.qemu_system = qemu_system.into();
        self
    }

    pub fn with_config_policy(mut self, policy: ConfigReadPolicy) -> Self {
        self.config_policy = policy;
        self
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Lifecycle state of an [`Engine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Provisioning,
    Booting,
    Ready,
    Destroying,
    Destroyed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Provisioning => write!(f, "provisioning"),
            EngineState::Booting => write!(f, "booting"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Destroying => write!(f, "destroying"),
            EngineState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Pipeline engine owning exactly one ephemeral VM
///
/// The image path and VM handle are only set once the corresponding resource
/// exists, so [`Engine::destroy`] is safe after any partial setup.
pub struct Engine<C: Connector = SshConnector> {
    opts: EngineOpts,
    connector: C,
    state: EngineState,
    machine: Option<MachineConfig>,
    image: Option<PathBuf>,
    ssh_port: Option<u16>,
    vm: Option<VmHandle>,
    remote: Option<C::Remote>,
}

impl Engine<SshConnector> {
    /// Engine talking to its guest over SSH
    pub fn new(opts: EngineOpts) -> Self {
        Self::with_connector(opts, SshConnector)
    }
}

impl<C: Connector> Engine<C> {
    pub fn with_connector(opts: EngineOpts, connector: C) -> Self {
        Self {
            opts,
            connector,
            state: EngineState::Idle,
            machine: None,
            image: None,
            ssh_port: None,
            vm: None,
            remote: None,
        }
    }

    pub fn opts(&self) -> &EngineOpts {
        &self.opts
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Machine settings resolved during setup
    pub fn machine(&self) -> Option<&MachineConfig> {
        self.machine.as_ref()
    }

    /// Ephemeral disk, while it exists
    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    /// Host port forwarded to the guest's SSH server
    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh_port
    }

    /// Hypervisor process id, while it is supervised
    pub fn vm_pid(&self) -> Option<u32> {
        self.vm.as_ref().map(VmHandle::pid)
    }

    /// Run one step inside the ready VM
    ///
    /// Non-zero exit statuses come back as data in [`StepState`].
    pub async fn run<W>(
        &mut self,
        cancel: &CancellationToken,
        step: &Step,
        output: &mut W,
    ) -> EngineResult<StepState>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let remote = match (&self.state, &self.remote) {
            (EngineState::Ready, Some(remote)) => remote,
            _ => {
                return Err(EngineError::NotReady {
                    state: self.state,
                    expected: EngineState::Ready,
                });
            }
        };
        run_step(remote, cancel, step, output).await
    }

    fn expect_state(&self, expected: EngineState) -> EngineResult<()> {
        if self.state != expected {
            return Err(EngineError::NotReady {
                state: self.state,
                expected,
            });
        }
        Ok(())
    }
}

impl<C: Connector> fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("image", &self.image)
            .field("ssh_port", &self.ssh_port)
            .field("vm_pid", &self.vm_pid())
            .finish()
    }
}

impl<C: Connector> PipelineEngine for Engine<C> {
    type Spec = Spec;
    type Step = Step;
    type Error = EngineError;

    async fn setup(&mut self, cancel: &CancellationToken, spec: &Spec) -> EngineResult<()> {
        Engine::setup(self, cancel, spec).await
    }

    async fn run<W>(
        &mut self,
        cancel: &CancellationToken,
        _spec: &Spec,
        step: &Step,
        output: &mut W,
    ) -> EngineResult<StepState>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        Engine::run(self, cancel, step, output).await
    }

    async fn destroy(&mut self, _spec: &Spec) -> EngineResult<()> {
        Engine::destroy(self).await
    }

    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }
}
