use crate::monitor::CrashArtifact;
use crate::project::{INPUT_PLACEHOLDER, INPUT_STDIN_PLACEHOLDER, ProjectError, TargetProject};
use crate::shell::{ShellError, ShellOutput, ShellProcess};
use crossbeam_channel::{Receiver, bounded};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

const PID_FILE: &str = "process.pid";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("Failed to read crash artifact {path:?}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Run instruction contains neither INPUT nor INPUT_STDIN: {0}")]
    MissingPlaceholder(String),
    #[error("Fuzzer failed to start")]
    FuzzerLaunchFailed,
    #[error("Could not read fuzzer pid from {path:?}: {reason}")]
    PidFile { path: PathBuf, reason: String },
    #[error("Failed to signal fuzzer {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of replaying one crash artifact against the current binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reproduction {
    /// Whether the target wrote anything to its error stream.
    pub is_crashing: bool,
    /// What it wrote.
    pub report: String,
}

/// The two operations the repair loop needs from the target.
pub trait TargetRunner {
    fn build(&self) -> Result<(), SupervisorError>;
    fn reproduce(&self, artifact: &CrashArtifact) -> Result<Reproduction, SupervisorError>;
}

/// A fuzzer started in the background. `ready` delivers the launch shell's
/// pid once it has accepted the launch command; `handle` finishes when the
/// fuzzer exits.
pub struct FuzzerLaunch {
    pub ready: Receiver<u32>,
    pub handle: JoinHandle<Result<ExitStatus, SupervisorError>>,
    shell_pid: Option<u32>,
}

impl FuzzerLaunch {
    /// Kills the launch shell's process group, fuzzer included, so that
    /// `handle` can be joined. Does nothing before the shell reported ready.
    pub fn kill_process_group(&self) -> Result<(), SupervisorError> {
        let Some(pid) = self.shell_pid else {
            return Ok(());
        };
        let raw = pid as i32;
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::ESRCH) => {
                tracing::info!(pgid = pid, "killed fuzzer process group");
                Ok(())
            }
            Err(source) => Err(SupervisorError::Signal { pid: raw, source }),
        }
    }
}

/// Runs the project's instruction scripts through [`ShellProcess`] handles and
/// owns the temporary directory holding the fuzzer's pid.
pub struct ProcessSupervisor {
    project: TargetProject,
    state_dir: tempfile::TempDir,
}

impl ProcessSupervisor {
    pub fn new(project: TargetProject) -> Result<Self, SupervisorError> {
        let state_dir = tempfile::Builder::new()
            .prefix(&format!("patchloop_{}_", project.name()))
            .tempdir()?;
        Ok(Self { project, state_dir })
    }

    pub fn project(&self) -> &TargetProject {
        &self.project
    }

    pub fn project_mut(&mut self) -> &mut TargetProject {
        &mut self.project
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.path().join(PID_FILE)
    }

    /// Feeds every build line to a single shell, in order, and waits for it
    /// to finish. Individual command failures are not checked.
    pub fn build_with_output(&self) -> Result<ShellOutput, SupervisorError> {
        let lines = self.project.build_lines()?;
        let mut shell = ShellProcess::start(self.project.root())?;
        for line in &lines {
            shell.send(line)?;
        }
        let output = shell.wait()?;
        tracing::info!(commands = output.commands.len(), "target compiled");
        Ok(output)
    }

    /// Starts the fuzz instruction in the background on a dedicated thread.
    /// The shell records the fuzzer's pid in [`ProcessSupervisor::pid_file`].
    pub fn launch_fuzzer(&self) -> Result<FuzzerLaunch, SupervisorError> {
        let command = format!(
            "{} & echo $! > {}",
            self.project.fuzz_line()?,
            self.pid_file().display()
        );
        let root = self.project.root().to_path_buf();
        let (ready_tx, ready) = bounded(1);

        let handle = std::thread::Builder::new()
            .name("fuzzer".to_string())
            .spawn(move || -> Result<ExitStatus, SupervisorError> {
                let mut shell = ShellProcess::start(&root)?;
                tracing::info!("starting fuzzer: {command}");
                if let Err(e) = shell.send(&command) {
                    shell.kill()?;
                    return Err(e.into());
                }
                let _ = ready_tx.send(shell.id());
                Ok(shell.drain()?)
            })?;
        Ok(FuzzerLaunch {
            ready,
            handle,
            shell_pid: None,
        })
    }

    /// Waits for the launch to be accepted, gives the fuzzer `grace` to fail,
    /// and returns its pid. A fuzzer that already exited is a launch failure.
    ///
    /// Only [`SupervisorError::FuzzerLaunchFailed`] guarantees the launch
    /// thread is done. After any other error the fuzzer may still be running.
    pub fn check_launch(
        &self,
        launch: &mut FuzzerLaunch,
        grace: Duration,
    ) -> Result<u32, SupervisorError> {
        let Ok(shell_pid) = launch.ready.recv() else {
            return Err(SupervisorError::FuzzerLaunchFailed);
        };
        launch.shell_pid = Some(shell_pid);
        std::thread::sleep(grace);
        if launch.handle.is_finished() {
            tracing::error!("fuzzer has failed to start");
            return Err(SupervisorError::FuzzerLaunchFailed);
        }

        let path = self.pid_file();
        let content = fs::read_to_string(&path).map_err(|e| SupervisorError::PidFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let pid = content
            .trim()
            .parse::<u32>()
            .map_err(|e| SupervisorError::PidFile {
                path,
                reason: e.to_string(),
            })?;
        tracing::info!(pid, "fuzzing");
        Ok(pid)
    }

    /// Removes the temporary state directory.
    pub fn cleanup(self) -> Result<(), SupervisorError> {
        self.state_dir.close()?;
        Ok(())
    }
}

impl TargetRunner for ProcessSupervisor {
    fn build(&self) -> Result<(), SupervisorError> {
        self.build_with_output().map(|_| ())
    }

    fn reproduce(&self, artifact: &CrashArtifact) -> Result<Reproduction, SupervisorError> {
        let line = self.project.run_line()?;
        let artifact_arg = self.project.artifact_arg(artifact.name())?;
        let artifact_path = self.project.crash_dir()?.join(artifact.name());
        let command = substitute_input(&line, &artifact_arg, || read_artifact(&artifact_path))?;

        tracing::info!("running: {command}");
        let mut shell = ShellProcess::start(self.project.root())?;
        shell.send(&command)?;
        let output = shell.wait()?;

        let reproduction = Reproduction {
            is_crashing: !output.stderr.is_empty(),
            report: output.stderr_text(),
        };
        if reproduction.is_crashing {
            tracing::info!(%artifact, "the target is crashing");
        } else {
            tracing::info!(%artifact, "the target is not crashing");
        }
        Ok(reproduction)
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, SupervisorError> {
    fs::read(path).map_err(|source| SupervisorError::Artifact {
        path: path.to_path_buf(),
        source,
    })
}

/// Replaces the input placeholder of a run instruction.
///
/// `INPUT_STDIN` takes the artifact's literal content, `INPUT` its path. The
/// content is only read when `INPUT_STDIN` is present.
pub fn substitute_input<F>(
    line: &str,
    artifact_arg: &str,
    content: F,
) -> Result<String, SupervisorError>
where
    F: FnOnce() -> Result<Vec<u8>, SupervisorError>,
{
    if line.contains(INPUT_STDIN_PLACEHOLDER) {
        let bytes = content()?;
        let literal = String::from_utf8_lossy(&bytes);
        return Ok(line.replace(INPUT_STDIN_PLACEHOLDER, &literal));
    }
    if line.contains(INPUT_PLACEHOLDER) {
        return Ok(line.replace(INPUT_PLACEHOLDER, artifact_arg));
    }
    Err(SupervisorError::MissingPlaceholder(line.to_string()))
}

/// Sends an interrupt to the fuzzer so it can shut down cleanly.
pub fn interrupt_fuzzer(pid: u32) -> Result<(), SupervisorError> {
    let raw = pid as i32;
    match kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => {
            tracing::info!(pid, "killed fuzzer");
            Ok(())
        }
        // Already gone.
        Err(nix::Error::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid: raw, source }),
    }
}
