use crate::monitor::{CrashArtifact, CrashSource, MonitorError};
use crate::supervisor::{ProcessSupervisor, SupervisorError, interrupt_fuzzer};
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// One running fuzzer plus the thread watching its crash directory.
///
/// Only the orchestrator thread owns a session. Dropping it without
/// [`FuzzSession::teardown`] leaves the fuzzer running.
pub struct FuzzSession {
    pid: u32,
    fuzz_thread: JoinHandle<Result<ExitStatus, SupervisorError>>,
    monitor_thread: Option<JoinHandle<Result<(), MonitorError>>>,
    stop: Arc<AtomicBool>,
    crashes: Receiver<CrashArtifact>,
}

impl FuzzSession {
    /// Launches the fuzzer, confirms it is alive after `grace`, then starts
    /// `source` on its own thread.
    ///
    /// If the fuzzer dies during start-up its thread is joined and
    /// [`SupervisorError::FuzzerLaunchFailed`] is returned. If it is still
    /// running but cannot be confirmed, its process group is killed first.
    pub fn start(
        supervisor: &ProcessSupervisor,
        mut source: Box<dyn CrashSource>,
        grace: Duration,
    ) -> Result<Self, SupervisorError> {
        let mut launch = supervisor.launch_fuzzer()?;
        let pid = match supervisor.check_launch(&mut launch, grace) {
            Ok(pid) => pid,
            Err(SupervisorError::FuzzerLaunchFailed) => {
                join_fuzzer(launch.handle);
                return Err(SupervisorError::FuzzerLaunchFailed);
            }
            Err(e) => {
                tracing::error!("could not confirm fuzzer launch: {e}");
                if let Err(kill) = launch.kill_process_group() {
                    tracing::warn!("{kill}");
                }
                join_fuzzer(launch.handle);
                return Err(e);
            }
        };

        let (tx, crashes) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let monitor_thread = std::thread::Builder::new()
            .name("crash-monitor".to_string())
            .spawn(move || source.watch(&tx, &stop_flag))?;

        Ok(Self {
            pid,
            fuzz_thread: launch.handle,
            monitor_thread: Some(monitor_thread),
            stop,
            crashes,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Blocks until the monitor reports a crash or `timeout` elapses.
    ///
    /// `Ok(None)` means the timeout elapsed. If the monitor has stopped, its
    /// thread is joined and its failure returned.
    pub fn next_crash(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<CrashArtifact>, MonitorError> {
        match self.crashes.recv_timeout(timeout) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                let Some(handle) = self.monitor_thread.take() else {
                    return Err(MonitorError::Stopped);
                };
                match handle.join() {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) | Err(_) => Err(MonitorError::Stopped),
                }
            }
        }
    }

    /// Interrupts the fuzzer, waits for its thread, then stops and joins the
    /// monitor.
    pub fn teardown(self) -> Result<(), SupervisorError> {
        interrupt_fuzzer(self.pid)?;
        join_fuzzer(self.fuzz_thread);
        tracing::info!("stopped fuzzing thread");

        self.stop.store(true, Ordering::SeqCst);
        match self.monitor_thread.map(JoinHandle::join) {
            None | Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => tracing::warn!("crash monitor failed: {e}"),
            Some(Err(_)) => tracing::error!("crash monitor thread panicked"),
        }
        tracing::info!("stopped monitoring thread");
        Ok(())
    }
}

fn join_fuzzer(handle: JoinHandle<Result<ExitStatus, SupervisorError>>) {
    match handle.join() {
        Ok(Ok(status)) => tracing::debug!(%status, "fuzzer shell exited"),
        Ok(Err(e)) => tracing::warn!("fuzzer shell failed: {e}"),
        Err(_) => tracing::error!("fuzzer thread panicked"),
    }
}
