//! A long-lived `/bin/bash` process fed one command per line on stdin.

use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use thiserror::Error;

const SHELL: &str = "/bin/bash";

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Failed to spawn /bin/bash in {dir}: {source}")]
    Spawn {
        dir: String,
        #[source]
        source: io::Error,
    },
    #[error("Shell stdin is closed")]
    StdinClosed,
    #[error("Failed to send command to shell: {0}")]
    Send(#[source] io::Error),
    #[error("Failed waiting for shell: {0}")]
    Wait(#[source] io::Error),
}

/// Everything the shell printed, plus the commands that were issued to it.
#[derive(Debug)]
pub struct ShellOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub commands: Vec<String>,
}

impl ShellOutput {
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Handle to a running shell. Commands are queued on its stdin in order;
/// the shell only exits once stdin is closed by [`ShellProcess::wait`] or
/// [`ShellProcess::drain`].
///
/// Each shell leads its own process group, so jobs it starts can be
/// signalled together.
pub struct ShellProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    commands: Vec<String>,
}

impl ShellProcess {
    pub fn start(working_dir: &Path) -> Result<Self, ShellError> {
        let mut child = Command::new(SHELL)
            .current_dir(working_dir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ShellError::Spawn {
                dir: working_dir.display().to_string(),
                source,
            })?;
        let stdin = child.stdin.take();
        tracing::trace!(pid = child.id(), dir = ?working_dir, "shell started");
        Ok(Self {
            child,
            stdin,
            commands: Vec::new(),
        })
    }

    /// Pid of the shell, which is also the id of the process group shared by
    /// everything it starts.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Commands issued so far, in order.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn send(&mut self, command: &str) -> Result<(), ShellError> {
        let stdin = self.stdin.as_mut().ok_or(ShellError::StdinClosed)?;
        stdin
            .write_all(command.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush())
            .map_err(ShellError::Send)?;
        self.commands.push(command.to_string());
        Ok(())
    }

    /// Closes stdin and collects the shell's output once both pipes are
    /// fully drained.
    pub fn wait(mut self) -> Result<ShellOutput, ShellError> {
        drop(self.stdin.take());
        let output = self.child.wait_with_output().map_err(ShellError::Wait)?;
        Ok(ShellOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status,
            commands: self.commands,
        })
    }

    /// Like [`ShellProcess::wait`] but throws the output away as it arrives.
    ///
    /// Background jobs inherit the shell's pipes, so this blocks until every
    /// job started from the shell has exited too.
    pub fn drain(mut self) -> Result<ExitStatus, ShellError> {
        drop(self.stdin.take());
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        std::thread::scope(|scope| {
            if let Some(out) = stdout {
                scope.spawn(move || discard(out));
            }
            if let Some(err) = stderr {
                scope.spawn(move || discard(err));
            }
        });
        self.child.wait().map_err(ShellError::Wait)
    }

    /// Kills the shell itself. Jobs it started in the background keep running.
    pub fn kill(mut self) -> Result<ExitStatus, ShellError> {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill() {
            tracing::warn!("Failed to kill shell {}: {e}", self.child.id());
        }
        self.child.wait().map_err(ShellError::Wait)
    }
}

fn discard(mut reader: impl Read) {
    let _ = io::copy(&mut reader, &mut io::sink());
}
