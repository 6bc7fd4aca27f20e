// ============================================================================
// File: qemu-runner/src/qemu/readiness.rs
// ----------------------------------------------------------------------------
// Boot-readiness gate: hypervisor death races a bounded SSH boot-probe loop.
//
// Two background activities feed one consumer:
// - the exit watcher (VmHandle) through the ExitSignal
// - the probe loop spawned here, through a oneshot
// The probe loop is aborted as soon as the consumer has decided.
// ============================================================================

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult, RemoteResult};
use crate::race::{First, first_of};

use super::process::ExitSignal;

/// Upper bound on boot time
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Delay between boot probes
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Timing of the boot-probe loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTiming {
    pub deadline: Duration,
    pub interval: Duration,
}

impl Default for BootTiming {
    fn default() -> Self {
        Self {
            deadline: BOOT_TIMEOUT,
            interval: PROBE_INTERVAL,
        }
    }
}

#[derive(Debug)]
enum ProbeOutcome {
    Ready { attempts: u32 },
    DeadlineExceeded { attempts: u32 },
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Wait until `probe` succeeds, the hypervisor exits, or the deadline passes
///
/// Returns how long the machine took to come online.
pub async fn wait_ready<P, F>(
    cancel: &CancellationToken,
    exit: &mut ExitSignal,
    probe: P,
    timing: BootTiming,
) -> EngineResult<Duration>
where
    P: FnMut(CancellationToken) -> F + Send + 'static,
    F: Future<Output = RemoteResult<()>> + Send + 'static,
{
    let start = Instant::now();
    let probe_cancel = cancel.child_token();
    let (tx, rx) = oneshot::channel();

    let probe_task = AbortOnDrop(tokio::spawn(probe_loop(
        probe,
        timing,
        probe_cancel.clone(),
        tx,
    )));
    let _stop_probes = probe_cancel.drop_guard();

    let decided = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        decided = first_of(exit.wait(), rx) => decided,
    };
    drop(probe_task);

    match decided {
        First::Left(exit) => Err(EngineError::ProcessDied { exit }),
        First::Right(Ok(ProbeOutcome::Ready { attempts })) => {
            let elapsed = start.elapsed();
            info!(
                "Machine came online after {:?} ({} probe attempts)",
                elapsed, attempts
            );
            Ok(elapsed)
        }
        First::Right(Ok(ProbeOutcome::DeadlineExceeded { attempts })) => {
            info!("Machine did not come online after {} probe attempts", attempts);
            Err(EngineError::BootTimeout {
                seconds: timing.deadline.as_secs(),
            })
        }
        First::Right(Err(_)) => Err(EngineError::Provision {
            details: "Boot probe loop ended without reporting".to_string(),
        }),
    }
}

async fn probe_loop<P, F>(
    mut probe: P,
    timing: BootTiming,
    cancel: CancellationToken,
    tx: oneshot::Sender<ProbeOutcome>,
) where
    P: FnMut(CancellationToken) -> F,
    F: Future<Output = RemoteResult<()>>,
{
    let start = Instant::now();
    let mut ticker = tokio::time::interval(timing.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    loop {
        ticker.tick().await;

        let remaining = match timing.deadline.checked_sub(start.elapsed()) {
            Some(remaining) if !remaining.is_zero() => remaining,
            _ => break,
        };

        attempts += 1;
        match tokio::time::timeout(remaining, probe(cancel.clone())).await {
            Ok(Ok(())) => {
                let _ = tx.send(ProbeOutcome::Ready { attempts });
                return;
            }
            Ok(Err(e)) => warn!("Connection failing (attempt {}): {}", attempts, e),
            Err(_) => debug!("Boot probe attempt {} ran into the deadline", attempts),
        }
    }

    let _ = tx.send(ProbeOutcome::DeadlineExceeded { attempts });
}
