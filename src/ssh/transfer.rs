use log::debug;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::pipeline::File;
use crate::quote::make_dirs_command;

use super::remote::RemoteShell;

/// Create every parent directory in one round trip, then copy files in order
///
/// Stops at the first failure. Directory entries are only created, never
/// copied.
pub async fn upload_all<R, W>(
    remote: &R,
    cancel: &CancellationToken,
    files: &[File],
    output: &mut W,
) -> EngineResult<()>
where
    R: RemoteShell,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    if files.is_empty() {
        return Ok(());
    }

    let mkdirs = make_dirs_command(files);
    remote
        .exec(cancel, &mkdirs, output)
        .await
        .map_err(|source| EngineError::Transfer {
            path: "parent directories".to_string(),
            source,
        })?;

    for file in files.iter().filter(|f| !f.is_dir) {
        debug!("Uploading {} ({} bytes)", file, file.data.len());
        remote
            .upload(cancel, &file.data, file.mode, &file.path)
            .await
            .map_err(|source| EngineError::Transfer {
                path: file.path.clone(),
                source,
            })?;
    }

    Ok(())
}
