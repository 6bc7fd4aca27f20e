//! Shared fixtures: fake host tools and an in-memory guest.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use assert_fs::TempDir;
use assert_fs::prelude::*;
use qemu_runner::ssh::{Connector, RemoteShell, SshTarget};
use qemu_runner::{RemoteError, RemoteResult};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Write an executable shell script into `dir`
pub fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let child = dir.child(name);
    child.write_str(body).expect("write script");
    std::fs::set_permissions(child.path(), std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    child.path().to_path_buf()
}

/// A `qemu-img` stand-in that creates its destination argument
pub fn fake_qemu_img(dir: &TempDir) -> PathBuf {
    write_script(dir, "qemu-img", "#!/bin/sh\ntouch \"$8\"\n")
}

pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).expect("read dir").count()
}

#[derive(Debug, Default)]
struct GuestState {
    ready: bool,
    commands: Vec<String>,
    uploads: Vec<(String, u32, Vec<u8>)>,
    exit_codes: Vec<i32>,
    targets: Vec<SshTarget>,
}

/// Guest that answers probes once `ready` and runs commands with scripted exit codes
#[derive(Debug, Clone, Default)]
pub struct FakeGuest {
    state: Arc<Mutex<GuestState>>,
}

impl FakeGuest {
    pub fn ready() -> Self {
        let guest = Self::default();
        guest.state.lock().expect("lock").ready = true;
        guest
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn push_exit_code(&self, code: i32) {
        self.state.lock().expect("lock").exit_codes.push(code);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().expect("lock").commands.clone()
    }

    pub fn uploads(&self) -> Vec<(String, u32, Vec<u8>)> {
        self.state.lock().expect("lock").uploads.clone()
    }

    pub fn targets(&self) -> Vec<SshTarget> {
        self.state.lock().expect("lock").targets.clone()
    }
}

impl RemoteShell for FakeGuest {
    async fn exec<W>(
        &self,
        _cancel: &CancellationToken,
        command: &str,
        output: &mut W,
    ) -> RemoteResult<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let code = {
            let mut state = self.state.lock().expect("lock");
            state.commands.push(command.to_string());
            if state.exit_codes.is_empty() {
                0
            } else {
                state.exit_codes.remove(0)
            }
        };
        output
            .write_all(format!("ran: {command}\n").as_bytes())
            .await
            .map_err(|e| RemoteError::Io {
                details: e.to_string(),
            })?;
        match code {
            0 => Ok(()),
            code => Err(RemoteError::Exit { code }),
        }
    }

    async fn upload(
        &self,
        _cancel: &CancellationToken,
        data: &[u8],
        mode: u32,
        remote_path: &str,
    ) -> RemoteResult<()> {
        self.state
            .lock()
            .expect("lock")
            .uploads
            .push((remote_path.to_string(), mode, data.to_vec()));
        Ok(())
    }

    async fn probe(&self, _cancel: &CancellationToken) -> RemoteResult<()> {
        if self.state.lock().expect("lock").ready {
            Ok(())
        } else {
            Err(RemoteError::Transport {
                details: "connection refused".to_string(),
            })
        }
    }
}

/// Hands the same guest to every engine and remembers the targets it was given
#[derive(Debug, Clone)]
pub struct FakeConnector(pub FakeGuest);

impl Connector for FakeConnector {
    type Remote = FakeGuest;

    fn connect(&self, target: SshTarget, _temp_dir: PathBuf) -> FakeGuest {
        self.0.state.lock().expect("lock").targets.push(target);
        self.0.clone()
    }
}
