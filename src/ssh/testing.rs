//! In-memory [`RemoteShell`] for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RemoteResult};

use super::remote::RemoteShell;

#[derive(Debug, Default)]
struct FakeState {
    commands: Vec<String>,
    uploads: Vec<(String, u32, Vec<u8>)>,
    exec_results: VecDeque<RemoteResult<()>>,
    output: Vec<u8>,
    failing_upload: Option<(String, RemoteError)>,
}

/// Records every call; exec results are scripted in order, default `Ok`
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRemote {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake remote lock")
    }

    pub(crate) fn push_exec_result(&self, result: RemoteResult<()>) {
        self.state().exec_results.push_back(result);
    }

    pub(crate) fn set_output(&self, output: &[u8]) {
        self.state().output = output.to_vec();
    }

    pub(crate) fn fail_upload(&self, path: &str, err: RemoteError) {
        self.state().failing_upload = Some((path.to_string(), err));
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub(crate) fn uploads(&self) -> Vec<(String, u32, Vec<u8>)> {
        self.state().uploads.clone()
    }
}

impl RemoteShell for FakeRemote {
    async fn exec<W>(
        &self,
        _cancel: &CancellationToken,
        command: &str,
        output: &mut W,
    ) -> RemoteResult<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (bytes, result) = {
            let mut state = self.state();
            state.commands.push(command.to_string());
            let result = state.exec_results.pop_front().unwrap_or(Ok(()));
            (state.output.clone(), result)
        };
        output
            .write_all(&bytes)
            .await
            .map_err(|e| RemoteError::io(e.to_string()))?;
        result
    }

    async fn upload(
        &self,
        _cancel: &CancellationToken,
        data: &[u8],
        mode: u32,
        remote_path: &str,
    ) -> RemoteResult<()> {
        let mut state = self.state();
        if let Some((path, err)) = &state.failing_upload {
            if path == remote_path {
                return Err(err.clone());
            }
        }
        state
            .uploads
            .push((remote_path.to_string(), mode, data.to_vec()));
        Ok(())
    }
}
