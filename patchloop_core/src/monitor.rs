use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// File the fuzzer drops in its crash directory that is not a crash.
pub const SENTINEL_FILE: &str = "README.txt";

/// Default delay between two directory listings.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to list crash directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Crash monitor stopped unexpectedly")]
    Stopped,
}

/// A crash-inducing input discovered by the fuzzer, known by file name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrashArtifact {
    name: String,
}

impl CrashArtifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for CrashArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Something that publishes newly discovered crash artifacts until told to
/// stop.
///
/// The orchestrator only consumes the queue, so a push-based source (native
/// change notification) can replace the polling one without touching it.
pub trait CrashSource: Send {
    /// Publishes new artifacts on `queue` until `stop` is set or the queue's
    /// receiving side goes away.
    fn watch(&mut self, queue: &Sender<CrashArtifact>, stop: &AtomicBool)
    -> Result<(), MonitorError>;
}

/// Re-lists a directory on a fixed interval and reports names that were not
/// present in the previous listing.
#[derive(Debug, Clone)]
pub struct PollingCrashMonitor {
    dir: PathBuf,
    interval: Duration,
}

impl PollingCrashMonitor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot(&self) -> Result<BTreeSet<String>, MonitorError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // The fuzzer creates the directory shortly after start-up.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(MonitorError::ReadDir {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| MonitorError::ReadDir {
                path: self.dir.clone(),
                source,
            })?;
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

impl CrashSource for PollingCrashMonitor {
    fn watch(
        &mut self,
        queue: &Sender<CrashArtifact>,
        stop: &AtomicBool,
    ) -> Result<(), MonitorError> {
        let mut known = self.snapshot()?;
        tracing::debug!(dir = ?self.dir, existing = known.len(), "crash monitor started");

        while !stop.load(Ordering::SeqCst) {
            let current = self.snapshot()?;
            let added: Vec<&String> = current
                .difference(&known)
                .filter(|name| name.as_str() != SENTINEL_FILE)
                .collect();
            if !added.is_empty() {
                tracing::info!(
                    "New files added: {}",
                    added.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                );
            }
            for name in added {
                if queue.send(CrashArtifact::new(name.clone())).is_err() {
                    tracing::debug!("crash queue closed, monitor exiting");
                    return Ok(());
                }
            }
            known = current;
            std::thread::sleep(self.interval);
        }
        tracing::debug!(dir = ?self.dir, "crash monitor stopped");
        Ok(())
    }
}
