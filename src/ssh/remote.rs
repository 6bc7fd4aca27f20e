// ============================================================================
// File: qemu-runner/src/ssh/remote.rs
// ----------------------------------------------------------------------------
// RemoteShell: the engine's seam to the guest, plus its ssh2 implementation.
// ============================================================================

use std::future::Future;
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RemoteError, RemoteResult};

use super::config::SshTarget;
use super::session;

/// Bound on every blocking call of a boot-probe session
const PROBE_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Command execution and file upload inside a live guest
pub trait RemoteShell: Clone + Send + Sync + 'static {
    /// Run `command` through the guest's shell, streaming merged output
    ///
    /// `Ok` only on exit status 0; a genuine non-zero status is
    /// [`RemoteError::Exit`], anything that kept the command from completing
    /// is a transport error.
    fn exec<W>(
        &self,
        cancel: &CancellationToken,
        command: &str,
        output: &mut W,
    ) -> impl Future<Output = RemoteResult<()>> + Send
    where
        W: AsyncWrite + Unpin + Send + ?Sized;

    /// Copy `data` to `remote_path` with permission bits `mode`
    fn upload(
        &self,
        cancel: &CancellationToken,
        data: &[u8],
        mode: u32,
        remote_path: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// One boot-probe attempt
    fn probe(&self, cancel: &CancellationToken) -> impl Future<Output = RemoteResult<()>> + Send {
        async move {
            let mut sink = tokio::io::sink();
            self.exec(cancel, "true", &mut sink).await
        }
    }
}

/// Builds the remote for a freshly booted guest
pub trait Connector: Send + Sync + 'static {
    type Remote: RemoteShell;

    fn connect(&self, target: SshTarget, temp_dir: PathBuf) -> Self::Remote;
}

/// Connector producing [`SshRemote`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Remote = SshRemote;

    fn connect(&self, target: SshTarget, temp_dir: PathBuf) -> SshRemote {
        SshRemote::new(target, temp_dir)
    }
}

/// [`RemoteShell`] over ssh2; one session per operation
#[derive(Debug, Clone)]
pub struct SshRemote {
    target: SshTarget,
    temp_dir: PathBuf,
}

impl SshRemote {
    pub fn new(target: SshTarget, temp_dir: PathBuf) -> Self {
        Self { target, temp_dir }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn connect(&self) -> RemoteResult<TcpStream> {
        let addr = (self.target.host.as_str(), self.target.port);
        let tcp = tokio::time::timeout(
            self.target.connect_timeout,
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .map_err(|_| {
            RemoteError::transport(format!(
                "TCP connection to {}:{} timed out",
                self.target.host, self.target.port
            ))
        })?
        .map_err(|e| RemoteError::transport(format!("TCP connection failed: {e}")))?;

        let tcp = tcp
            .into_std()
            .map_err(|e| RemoteError::transport(format!("TCP socket setup failed: {e}")))?;
        tcp.set_nonblocking(false)
            .map_err(|e| RemoteError::transport(format!("TCP socket setup failed: {e}")))?;
        Ok(tcp)
    }

    async fn run<W>(
        &self,
        cancel: &CancellationToken,
        command: &str,
        output: &mut W,
        timeout: Option<Duration>,
    ) -> RemoteResult<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let tcp = self.connect().await?;
        let socket = tcp
            .try_clone()
            .map_err(|e| RemoteError::transport(format!("TCP socket setup failed: {e}")))?;

        debug!("Executing command in VM: {}", command);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        let task = tokio::task::spawn_blocking({
            let target = self.target.clone();
            let command = command.to_string();
            move || session::run_command(&target, tcp, timeout, &command, &tx)
        });

        stream_output(cancel, &socket, rx, task, output).await
    }
}

/// Copy session output into `output` until the blocking side finishes
///
/// On cancellation or a failed write the channel is closed before the socket
/// is shut down, so a sender parked on a full channel wakes up as well.
async fn stream_output<W>(
    cancel: &CancellationToken,
    socket: &TcpStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut task: JoinHandle<RemoteResult<()>>,
    output: &mut W,
) -> RemoteResult<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let failure = 'session: loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session RemoteError::Cancelled,
            chunk = rx.recv() => chunk,
        };

        let Some(bytes) = chunk else {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session RemoteError::Cancelled,
                joined = &mut task => joined,
            };
            output
                .flush()
                .await
                .map_err(|e| RemoteError::io(format!("Failed to flush output: {e}")))?;
            return joined.map_err(|e| RemoteError::transport(format!("Task join failed: {e}")))?;
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session RemoteError::Cancelled,
            written = output.write_all(&bytes) => written,
        };
        if let Err(e) = written {
            break 'session RemoteError::io(format!("Failed to write output: {e}"));
        }
    };

    rx.close();
    abort_session(socket, task).await;
    Err(failure)
}

impl RemoteShell for SshRemote {
    async fn exec<W>(
        &self,
        cancel: &CancellationToken,
        command: &str,
        output: &mut W,
    ) -> RemoteResult<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.run(cancel, command, output, None).await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        data: &[u8],
        mode: u32,
        remote_path: &str,
    ) -> RemoteResult<()> {
        let tcp = self.connect().await?;
        let socket = tcp
            .try_clone()
            .map_err(|e| RemoteError::transport(format!("TCP socket setup failed: {e}")))?;

        debug!("Copying {} bytes to VM at {}", data.len(), remote_path);

        let mut task = tokio::task::spawn_blocking({
            let target = self.target.clone();
            let temp_dir = self.temp_dir.clone();
            let data = data.to_vec();
            let remote_path = remote_path.to_string();
            move || session::send_file(&target, tcp, &temp_dir, &data, mode, &remote_path)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort_session(&socket, task).await;
                Err(RemoteError::Cancelled)
            }
            joined = &mut task => {
                joined.map_err(|e| RemoteError::transport(format!("Task join failed: {e}")))?
            }
        }
    }

    async fn probe(&self, cancel: &CancellationToken) -> RemoteResult<()> {
        let mut sink = tokio::io::sink();
        self.run(cancel, "true", &mut sink, Some(PROBE_SESSION_TIMEOUT))
            .await
    }
}

/// Shut the session's socket down and wait for the blocking side to notice
async fn abort_session(socket: &TcpStream, task: JoinHandle<RemoteResult<()>>) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        debug!("SSH socket shutdown failed: {}", e);
    }
    let _ = task.await;
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_fs::TempDir;
    use tokio::io::AsyncReadExt;

    use super::*;

    /// Connected loopback socket standing in for an SSH session's stream
    fn loopback_socket() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    /// Blocking producer that floods the channel until the receiver goes away
    fn flooding_session(
        tx: mpsc::Sender<Vec<u8>>,
        finished: Arc<AtomicBool>,
    ) -> JoinHandle<RemoteResult<()>> {
        tokio::task::spawn_blocking(move || {
            let result = loop {
                if tx.blocking_send(vec![b'x'; 8 * 1024]).is_err() {
                    break Err(RemoteError::Cancelled);
                }
            };
            finished.store(true, Ordering::SeqCst);
            result
        })
    }

    fn cancel_after(delay: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        cancel
    }

    /// Accepts connections and holds them open without speaking SSH
    async fn silent_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        (port, server)
    }

    fn local_target(port: u16) -> SshTarget {
        let mut target = SshTarget::localhost(port, "root");
        target.host = "127.0.0.1".to_string();
        target
    }

    fn refused_target() -> SshTarget {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("free port");
        local_target(port)
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_error() {
        let remote = SshConnector.connect(refused_target(), std::env::temp_dir());
        let mut sink = tokio::io::sink();

        let err = remote
            .exec(&CancellationToken::new(), "true", &mut sink)
            .await
            .expect_err("nobody listening");

        assert!(matches!(err, RemoteError::Transport { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn refused_readiness_check_is_a_transport_error() {
        let remote = SshRemote::new(refused_target(), std::env::temp_dir());

        let err = remote
            .probe(&CancellationToken::new())
            .await
            .expect_err("nobody listening");

        assert!(matches!(err, RemoteError::Transport { .. }));
    }

    #[tokio::test]
    async fn cancelled_session_is_torn_down() {
        let (port, server) = silent_server().await;
        let remote = SshRemote::new(local_target(port), std::env::temp_dir());
        let cancel = cancel_after(Duration::from_millis(200));

        let mut sink = tokio::io::sink();
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            remote.exec(&cancel, "sleep 100", &mut sink),
        )
        .await
        .expect("cancellation returns promptly")
        .expect_err("cancelled");

        assert_eq!(err, RemoteError::Cancelled);
        server.abort();
    }

    #[tokio::test]
    async fn cancel_with_stalled_output_returns() {
        let (socket, _peer) = loopback_socket();
        let (tx, rx) = mpsc::channel(4);
        let finished = Arc::new(AtomicBool::new(false));
        let task = flooding_session(tx, finished.clone());
        // Never read, so the first write blocks once the one-byte buffer is full
        let (mut output, _reader) = tokio::io::duplex(1);

        let cancel = cancel_after(Duration::from_millis(200));
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            stream_output(&cancel, &socket, rx, task, &mut output),
        )
        .await
        .expect("cancellation returns promptly")
        .expect_err("cancelled");

        assert_eq!(err, RemoteError::Cancelled);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_with_full_channel_returns() {
        let (socket, _peer) = loopback_socket();
        let (tx, rx) = mpsc::channel(4);
        let finished = Arc::new(AtomicBool::new(false));
        let task = flooding_session(tx, finished.clone());

        // Slow but steady consumer: the producer stays ahead and keeps the channel full
        let (mut output, mut reader) = tokio::io::duplex(16 * 1024);
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let cancel = cancel_after(Duration::from_millis(300));
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            stream_output(&cancel, &socket, rx, task, &mut output),
        )
        .await
        .expect("cancellation returns promptly")
        .expect_err("cancelled");

        assert_eq!(err, RemoteError::Cancelled);
        assert!(finished.load(Ordering::SeqCst));
        drain.abort();
    }

    #[tokio::test]
    async fn failed_output_write_stops_the_session() {
        let (socket, _peer) = loopback_socket();
        let (tx, rx) = mpsc::channel(4);
        let finished = Arc::new(AtomicBool::new(false));
        let task = flooding_session(tx, finished.clone());
        let (mut output, reader) = tokio::io::duplex(1024);
        drop(reader);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            stream_output(&CancellationToken::new(), &socket, rx, task, &mut output),
        )
        .await
        .expect("write failure returns promptly")
        .expect_err("sink closed");

        assert!(matches!(err, RemoteError::Io { .. }));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn finished_session_output_is_flushed() {
        let (socket, _peer) = loopback_socket();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::task::spawn_blocking(move || {
            for chunk in ["hello ", "world\n"] {
                tx.blocking_send(chunk.as_bytes().to_vec())
                    .map_err(|_| RemoteError::Cancelled)?;
            }
            Err(RemoteError::Exit { code: 3 })
        });

        let mut output = Vec::new();
        let err = stream_output(&CancellationToken::new(), &socket, rx, task, &mut output)
            .await
            .expect_err("non-zero exit");

        assert_eq!(err, RemoteError::Exit { code: 3 });
        assert_eq!(output, b"hello world\n");
    }

    #[tokio::test]
    async fn failed_handshake_leaves_no_staged_upload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        let staging = TempDir::new().expect("staging dir");
        let remote = SshRemote::new(local_target(port), staging.path().to_path_buf());

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            remote.upload(&CancellationToken::new(), b"payload", 0o600, "/tmp/payload"),
        )
        .await
        .expect("upload returns")
        .expect_err("connection closed during handshake");

        assert!(matches!(err, RemoteError::Transport { .. }));
        assert_eq!(std::fs::read_dir(staging.path()).expect("read dir").count(), 0);
        server.abort();
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_no_staged_file() {
        let (port, server) = silent_server().await;
        let staging = TempDir::new().expect("staging dir");
        let remote = SshRemote::new(local_target(port), staging.path().to_path_buf());

        let cancel = cancel_after(Duration::from_millis(200));
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            remote.upload(&cancel, b"payload", 0o600, "/tmp/payload"),
        )
        .await
        .expect("cancellation returns promptly")
        .expect_err("cancelled");

        assert_eq!(err, RemoteError::Cancelled);
        assert_eq!(std::fs::read_dir(staging.path()).expect("read dir").count(), 0);
        server.abort();
    }
}
