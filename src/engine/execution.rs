//! Per-step execution: upload, environment, command, exit status.

use std::collections::BTreeMap;

use log::{debug, warn};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Step, StepState};
use crate::quote::step_command;
use crate::ssh::{RemoteShell, upload_all};

/// Step environment with secrets layered on top
///
/// Always a fresh map; the step itself is never modified. A secret wins over
/// a plain variable of the same name.
pub fn effective_environment(step: &Step) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = step
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for secret in &step.secrets {
        if secret.env.is_empty() {
            warn!(
                "Secret {} of step {} names no environment variable, skipping",
                secret.name, step.name
            );
            continue;
        }
        env.insert(
            secret.env.clone(),
            String::from_utf8_lossy(&secret.data).into_owned(),
        );
    }

    env
}

/// Upload the step's files and run its command
///
/// The remote command's exit status is data: only failures that kept the
/// command from completing are errors.
pub async fn run_step<R, W>(
    remote: &R,
    cancel: &CancellationToken,
    step: &Step,
    output: &mut W,
) -> EngineResult<StepState>
where
    R: RemoteShell,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    upload_all(remote, cancel, &step.files, output).await?;

    let env = effective_environment(step);
    let command = step_command(&step.command, &step.args, &env, &step.working_dir);

    // Env carries secrets; log the command only
    debug!("Running step {}: {} {:?}", step.name, step.command, step.args);

    match remote.exec(cancel, &command, output).await {
        Ok(()) => Ok(StepState::exited(0)),
        Err(err) => match err.exit_code() {
            Some(code) => Ok(StepState::exited(code)),
            None => Err(EngineError::Execution { source: err }),
        },
    }
}
