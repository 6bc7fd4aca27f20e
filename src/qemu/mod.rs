//! QEMU machine provisioning: per-image config, ephemeral disks, the
//! hypervisor process and the boot-readiness gate.

mod config;
mod image;
mod process;
mod readiness;

pub use config::{CONFIG_SUFFIX, ConfigReadPolicy, MachineConfig};
pub use image::{create_ephemeral_image, ephemeral_image_path, remove_ephemeral_image};
pub use process::{ExitSignal, ProcessExit, VmHandle, VmLaunch, random_ssh_port};
pub use readiness::{BOOT_TIMEOUT, BootTiming, PROBE_INTERVAL, wait_ready};
