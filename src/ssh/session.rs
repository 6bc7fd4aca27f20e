// ============================================================================
// File: qemu-runner/src/ssh/session.rs
// ----------------------------------------------------------------------------
// Blocking ssh2 session helpers. Everything here runs on the blocking pool.
// ============================================================================

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use log::debug;
use ssh2::{ExtendedData, Session};
use tokio::sync::mpsc;

use crate::error::{RemoteError, RemoteResult};

use super::config::SshTarget;

const READ_CHUNK: usize = 8 * 1024;

/// Handshake and authenticate over an already connected socket
///
/// `timeout` bounds every blocking libssh2 call; `None` means unbounded.
pub(crate) fn create_session(
    target: &SshTarget,
    tcp: TcpStream,
    timeout: Option<Duration>,
) -> RemoteResult<Session> {
    let mut session = Session::new()
        .map_err(|e| RemoteError::transport(format!("SSH session creation failed: {e}")))?;

    session.set_tcp_stream(tcp);
    if let Some(timeout) = timeout {
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    }

    session
        .handshake()
        .map_err(|e| RemoteError::transport(format!("SSH handshake failed: {e}")))?;

    session
        .userauth_pubkey_file(&target.username, None, &target.private_key, None)
        .map_err(|e| RemoteError::transport(format!("SSH key auth failed: {e}")))?;

    if !session.authenticated() {
        return Err(RemoteError::transport("SSH authentication failed"));
    }

    Ok(session)
}

/// Run `command`, streaming merged stdout/stderr into `output`
pub(crate) fn run_command(
    target: &SshTarget,
    tcp: TcpStream,
    timeout: Option<Duration>,
    command: &str,
    output: &mpsc::Sender<Vec<u8>>,
) -> RemoteResult<()> {
    let session = create_session(target, tcp, timeout)?;

    let mut channel = session
        .channel_session()
        .map_err(|e| RemoteError::transport(format!("Failed to create channel: {e}")))?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .map_err(|e| RemoteError::transport(format!("Failed to merge stderr: {e}")))?;
    channel
        .exec(command)
        .map_err(|e| RemoteError::transport(format!("Exec failed: {e}")))?;

    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = channel
            .read(&mut buf)
            .map_err(|e| RemoteError::transport(format!("Read output failed: {e}")))?;
        if n == 0 {
            break;
        }
        if output.blocking_send(buf[..n].to_vec()).is_err() {
            return Err(RemoteError::Cancelled);
        }
    }

    channel
        .wait_close()
        .map_err(|e| RemoteError::transport(format!("Wait close failed: {e}")))?;

    let signal = channel
        .exit_signal()
        .map_err(|e| RemoteError::transport(format!("Get exit signal failed: {e}")))?;
    let code = channel
        .exit_status()
        .map_err(|e| RemoteError::transport(format!("Get exit status failed: {e}")))?;
    debug!("Remote command exited with status {}", code);

    command_outcome(signal.exit_signal, code)
}

/// Map a closed channel's exit report to the command result
///
/// A reported signal wins over the status, which servers leave at 0 then.
pub(crate) fn command_outcome(signal: Option<String>, code: i32) -> RemoteResult<()> {
    match (signal, code) {
        (Some(signal), _) => Err(RemoteError::Signal { signal }),
        (None, 0) => Ok(()),
        (None, code) => Err(RemoteError::Exit { code }),
    }
}

/// Stage `data` in a private temp file and SCP it to `remote_path`
pub(crate) fn send_file(
    target: &SshTarget,
    tcp: TcpStream,
    temp_dir: &Path,
    data: &[u8],
    mode: u32,
    remote_path: &str,
) -> RemoteResult<()> {
    // Removed on drop, whichever way this returns
    let mut staged = tempfile::Builder::new()
        .prefix("qemu-runner-upload-")
        .tempfile_in(temp_dir)
        .map_err(|e| RemoteError::io(format!("Failed to create temp file: {e}")))?;
    staged
        .write_all(data)
        .and_then(|()| staged.flush())
        .and_then(|()| staged.seek(SeekFrom::Start(0)).map(|_| ()))
        .map_err(|e| RemoteError::io(format!("Failed to stage upload: {e}")))?;

    let session = create_session(target, tcp, None)?;

    let mode = match mode & 0o7777 {
        0 => 0o644,
        bits => bits,
    };

    let mut remote_file = session
        .scp_send(Path::new(remote_path), mode as i32, data.len() as u64, None)
        .map_err(|e| RemoteError::transport(format!("SCP failed: {e}")))?;

    std::io::copy(staged.as_file_mut(), &mut remote_file)
        .map_err(|e| RemoteError::transport(format!("File copy failed: {e}")))?;

    remote_file
        .send_eof()
        .map_err(|e| RemoteError::transport(format!("EOF failed: {e}")))?;
    remote_file
        .wait_eof()
        .map_err(|e| RemoteError::transport(format!("Wait EOF failed: {e}")))?;
    remote_file
        .close()
        .map_err(|e| RemoteError::transport(format!("Close failed: {e}")))?;
    remote_file
        .wait_close()
        .map_err(|e| RemoteError::transport(format!("Wait close failed: {e}")))?;

    Ok(())
}
