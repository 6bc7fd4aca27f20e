//! Ephemeral copy-on-write disk images.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info, warn};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Unique destination for one run's disk inside `temp_dir`
pub fn ephemeral_image_path(temp_dir: &Path) -> PathBuf {
    temp_dir.join(format!("qemu-runner-{}.qcow2", uuid::Uuid::new_v4().simple()))
}

/// Create a qcow2 image at `dest` backed by `base_image`
///
/// On failure or cancellation no file is left at `dest`; a cancelled
/// `qemu-img` is killed.
pub async fn create_ephemeral_image(
    cancel: &CancellationToken,
    qemu_img: &Path,
    base_image: &Path,
    base_image_format: &str,
    dest: &Path,
) -> EngineResult<()> {
    let mut cmd = Command::new(qemu_img);
    cmd.arg("create")
        .args(["-f", "qcow2"])
        .arg("-b")
        .arg(base_image)
        .arg("-F")
        .arg(base_image_format)
        .arg(dest)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!("Creating ephemeral image with command: {:?}", cmd);

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = cmd.output() => Some(output),
    };

    let output = match output {
        Some(Ok(output)) => output,
        None => {
            info!("Image creation cancelled, removing {}", dest.display());
            discard_partial(dest).await;
            return Err(EngineError::Cancelled);
        }
        Some(Err(e)) => {
            discard_partial(dest).await;
            return Err(EngineError::Provision {
                details: format!("Failed to run {}: {}", qemu_img.display(), e),
            });
        }
    };

    if !output.status.success() {
        discard_partial(dest).await;
        return Err(EngineError::Provision {
            details: format!(
                "{} failed ({}): {}",
                qemu_img.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(())
}

/// Delete an ephemeral image; an already missing file is not an error
pub async fn remove_ephemeral_image(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn discard_partial(dest: &Path) {
    if let Err(e) = remove_ephemeral_image(dest).await {
        warn!("Failed to remove partial image {}: {}", dest.display(), e);
    }
}
