// ============================================================================
// File: qemu-runner/src/engine/lifecycle.rs
// ----------------------------------------------------------------------------
// Setup and teardown of the ephemeral VM.
// ============================================================================

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::pipeline::Spec;
use crate::qemu::{
    BootTiming, MachineConfig, VmHandle, VmLaunch, create_ephemeral_image, ephemeral_image_path,
    random_ssh_port, remove_ephemeral_image, wait_ready,
};
use crate::ssh::{Connector, RemoteShell, SshTarget, upload_all};

use super::{Engine, EngineState};

impl<C: Connector> Engine<C> {
    /// Provision the disk, boot the VM, wait for SSH and upload pipeline files
    ///
    /// Any error is fatal for the run; call [`Engine::destroy`] afterwards
    /// to release whatever was created.
    pub async fn setup(&mut self, cancel: &CancellationToken, spec: &Spec) -> EngineResult<()> {
        self.expect_state(EngineState::Idle)?;
        self.state = EngineState::Provisioning;

        let machine = MachineConfig::load(
            &self.opts.image_dir,
            &spec.settings.image,
            self.opts.config_policy,
        )
        .await?;
        let port = random_ssh_port();
        let image = ephemeral_image_path(&self.opts.temp_dir);

        info!(
            "Creating ephemeral image {} backed by {}",
            image.display(),
            machine.base_image.display()
        );
        create_ephemeral_image(
            cancel,
            &self.opts.qemu_img,
            &machine.base_image,
            &machine.base_image_format,
            &image,
        )
        .await?;
        self.image = Some(image.clone());
        self.ssh_port = Some(port);

        let launch = VmLaunch {
            image_dir: self.opts.image_dir.clone(),
            image: spec.settings.image.clone(),
            ephemeral_image: image,
            seed_image: machine.seed_image.clone(),
            ssh_port: port,
            qemu_system: self.opts.qemu_system.clone(),
        };
        let vm = match VmHandle::start(&launch) {
            Ok(vm) => vm,
            Err(e) => {
                self.discard_image().await;
                return Err(e);
            }
        };
        info!("Hypervisor started with pid {}, SSH on port {}", vm.pid(), port);
        self.state = EngineState::Booting;

        let target = SshTarget::localhost(port, machine.username.clone())
            .with_private_key(self.opts.private_key.clone())
            .with_connect_timeout(self.opts.connect_timeout);
        let remote = self.connector.connect(target, self.opts.temp_dir.clone());
        self.machine = Some(machine);

        let timing = BootTiming {
            deadline: self.opts.boot_timeout,
            interval: self.opts.probe_interval,
        };
        let probe_remote = remote.clone();
        let vm = self.vm.insert(vm);
        let elapsed = wait_ready(
            cancel,
            vm.exit_signal(),
            move |cancel: CancellationToken| {
                let remote = probe_remote.clone();
                async move { remote.probe(&cancel).await }
            },
            timing,
        )
        .await?;
        info!("Machine has started in {:?}", elapsed);

        let remote = self.remote.insert(remote);
        let mut sink = tokio::io::sink();
        upload_all(remote, cancel, &spec.files, &mut sink).await?;

        self.state = EngineState::Ready;
        Ok(())
    }

    /// Stop the hypervisor and delete the ephemeral image
    ///
    /// Releases whatever exists, whichever way setup ended. Cleanup failures
    /// are logged, never returned.
    pub async fn destroy(&mut self) -> EngineResult<()> {
        if self.vm.is_none() && self.image.is_none() {
            debug!("Nothing to destroy in state {}", self.state);
            if self.state != EngineState::Idle {
                self.state = EngineState::Destroyed;
            }
            return Ok(());
        }

        self.state = EngineState::Destroying;
        self.remote = None;

        if let Some(vm) = self.vm.take() {
            let pid = vm.pid();
            let exit = vm.stop(self.opts.stop_grace).await;
            info!("Hypervisor process {} stopped: {}", pid, exit);
        }

        self.discard_image().await;

        self.state = EngineState::Destroyed;
        Ok(())
    }

    async fn discard_image(&mut self) {
        let Some(image) = self.image.take() else {
            return;
        };
        match remove_ephemeral_image(&image).await {
            Ok(()) => debug!("Removed ephemeral image {}", image.display()),
            Err(e) => warn!("Failed to remove ephemeral image {}: {}", image.display(), e),
        }
    }
}
