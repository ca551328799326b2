//! The closed loop: build, fuzz, wait for a crash, reproduce it, locate the
//! culprit functions, patch them, rebuild and check again.

use crate::analyzer::{AnalyzerError, BugLocation, ReportAnalyzer, analyzer_for};
use crate::config::SupervisorConfig;
use crate::llm::{DiagnosisService, LoggedDiagnosis};
use crate::locator::{BraceCountingLocator, LocateError, SpanLocator, resolve_source_file};
use crate::logs::SessionLog;
use crate::monitor::{CrashArtifact, MonitorError, PollingCrashMonitor};
use crate::patcher::{self, PatchError};
use crate::project::{ProjectError, TargetProject};
use crate::session::FuzzSession;
use crate::supervisor::{ProcessSupervisor, SupervisorError, TargetRunner};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Locate(#[from] LocateError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("Failed to write session log: {0}")]
    Log(#[from] io::Error),
}

/// How the repair of one crash artifact ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The artifact no longer crashes the rebuilt target.
    Fixed { attempts: u32 },
    /// Still crashing after every allowed attempt.
    Exhausted { attempts: u32 },
    /// Nothing to do: the artifact does not crash, no candidate location was
    /// found, or the retry budget is zero.
    NoOp,
}

#[derive(Debug, Clone, Copy)]
pub struct RepairSettings {
    pub max_tries: u32,
    /// Pause after each fix request.
    pub llm_delay: Duration,
}

impl From<&SupervisorConfig> for RepairSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_tries: config.num_tries_to_fix,
            llm_delay: config.llm_delay(),
        }
    }
}

/// Bounded patch/rebuild/reverify cycle for a single crash artifact.
pub struct RepairLoop<'a> {
    pub runner: &'a dyn TargetRunner,
    pub analyzer: &'a dyn ReportAnalyzer,
    pub locator: &'a dyn SpanLocator,
    pub service: &'a dyn DiagnosisService,
    pub root: &'a Path,
    pub log: &'a SessionLog,
    pub settings: RepairSettings,
}

impl RepairLoop<'_> {
    pub fn repair(&self, artifact: &CrashArtifact) -> Result<RepairOutcome, OrchestratorError> {
        let first = self.runner.reproduce(artifact)?;
        if !first.is_crashing {
            self.log.record("No fix needed, moving on")?;
            return Ok(RepairOutcome::NoOp);
        }

        let analysis = self.analyzer.analyze(&first.report)?;
        tracing::info!(
            analyzer = self.analyzer.name(),
            candidates = analysis.locations.len(),
            "report analyzed"
        );
        if analysis.locations.is_empty() {
            self.log
                .record("No fix needed (no candidate locations), moving on")?;
            return Ok(RepairOutcome::NoOp);
        }

        let candidates = analysis.locations;
        let mut report = analysis.report;
        let mut is_crashing = true;
        let mut attempts = 0;

        while is_crashing && attempts < self.settings.max_tries {
            if self.patch_candidates(&candidates, &report)? {
                self.runner.build()?;
                let rerun = self.runner.reproduce(artifact)?;
                is_crashing = rerun.is_crashing;
                report = rerun.report;
            } else {
                tracing::info!(attempt = attempts, "attempt applied no change");
            }
            tracing::info!("try #{attempts} - is_crashing: {is_crashing}");
            attempts += 1;
        }

        if attempts == 0 {
            self.log.record("No fix needed (no attempts allowed), moving on")?;
            Ok(RepairOutcome::NoOp)
        } else if is_crashing {
            self.log.record("Could not fix the program, moving on")?;
            Ok(RepairOutcome::Exhausted { attempts })
        } else {
            self.log
                .record(&format!("fixed the issue in {attempts} try"))?;
            Ok(RepairOutcome::Fixed { attempts })
        }
    }

    /// One pass over every candidate. Returns whether any file was changed.
    fn patch_candidates(
        &self,
        candidates: &[BugLocation],
        report: &str,
    ) -> Result<bool, OrchestratorError> {
        let mut changed = false;
        for candidate in candidates {
            let Some(path) = resolve_source_file(self.root, &candidate.file) else {
                self.log
                    .record(&format!("Could not find the file {}", candidate.file))?;
                continue;
            };
            let Some(span) = self.locator.locate(&path, &candidate.function)? else {
                tracing::info!(
                    file = %candidate.file,
                    function = %candidate.function,
                    "function not found"
                );
                continue;
            };

            let fix = patcher::request_fix(self.service, report, &span)?;
            std::thread::sleep(self.settings.llm_delay);
            if let Some(fix) = fix {
                patcher::apply(&span, &fix)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Why the supervisor stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// No new crash showed up within the queue timeout.
    Idle,
}

pub struct Orchestrator {
    supervisor: ProcessSupervisor,
    service: Arc<dyn DiagnosisService>,
    analyzer: Box<dyn ReportAnalyzer + Send>,
    locator: BraceCountingLocator,
    config: SupervisorConfig,
    log: SessionLog,
}

impl Orchestrator {
    pub fn new(
        project: TargetProject,
        service: Box<dyn DiagnosisService>,
        config: SupervisorConfig,
    ) -> Result<Self, OrchestratorError> {
        let log = SessionLog::allocate(Path::new(&config.logs_dir), &project.name())?;
        tracing::info!(dir = ?log.dir(), "session logs");
        let service: Arc<dyn DiagnosisService> =
            Arc::new(LoggedDiagnosis::new(service, log.transcript()));
        let analyzer = analyzer_for(project.is_sanitized(), Arc::clone(&service));
        Ok(Self {
            supervisor: ProcessSupervisor::new(project)?,
            service,
            analyzer,
            locator: BraceCountingLocator::new(),
            config,
            log,
        })
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Runs sessions until no crash arrives within the queue timeout.
    ///
    /// The fuzzer is only stopped once a fix is confirmed. While an artifact
    /// is being repaired it keeps running against the binary being rebuilt
    /// and may queue more crashes found with the unpatched code.
    pub fn run(mut self) -> Result<Shutdown, OrchestratorError> {
        let mut first_session = true;
        loop {
            self.supervisor.build()?;
            self.log
                .record(&self.supervisor.project().root().display().to_string())?;
            if !first_session && self.supervisor.project_mut().switch_to_resume()? {
                tracing::info!("fuzzer switched to resume mode");
            }
            first_session = false;

            let mut session = match self.start_session() {
                Ok(session) => session,
                Err(e) => {
                    self.log.record("fuzzer has failed to start, exiting")?;
                    self.supervisor.cleanup()?;
                    return Err(e.into());
                }
            };
            self.log.record("started fuzzing")?;
            tracing::info!(pid = session.pid(), "fuzzer running");

            loop {
                tracing::info!("waiting for new files...");
                let artifact = match session.next_crash(self.config.queue_timeout()) {
                    Ok(Some(artifact)) => artifact,
                    Ok(None) => {
                        let waited = humantime::format_duration(self.config.queue_timeout());
                        self.log.record(&format!(
                            "No new files added in the last {waited}, exiting"
                        ))?;
                        session.teardown()?;
                        self.supervisor.cleanup()?;
                        return Ok(Shutdown::Idle);
                    }
                    Err(e) => {
                        self.log.record(&format!("crash monitor failed, exiting: {e}"))?;
                        if let Err(teardown) = session.teardown() {
                            tracing::warn!("teardown after monitor failure failed: {teardown}");
                        }
                        self.supervisor.cleanup()?;
                        return Err(e.into());
                    }
                };
                self.log.record(&format!(
                    "new bug-triggering input: {artifact}{}",
                    self.artifact_digest(&artifact)
                ))?;

                let repaired = self.repair_loop().repair(&artifact);
                let outcome = match repaired {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.log.record(&format!("fatal error, exiting: {e}"))?;
                        if let Err(teardown) = session.teardown() {
                            tracing::warn!("teardown after fatal error failed: {teardown}");
                        }
                        if let Err(cleanup) = self.supervisor.cleanup() {
                            tracing::warn!("cleanup after fatal error failed: {cleanup}");
                        }
                        return Err(e);
                    }
                };
                match outcome {
                    RepairOutcome::Fixed { attempts } => {
                        tracing::info!(
                            attempts,
                            "successfully applied a fix, stopping and restarting fuzzing"
                        );
                        session.teardown()?;
                        break;
                    }
                    RepairOutcome::Exhausted { attempts } => {
                        tracing::warn!(%artifact, attempts, "could not fix the program");
                    }
                    RepairOutcome::NoOp => {
                        tracing::info!(%artifact, "no fix needed");
                    }
                }
            }
        }
    }

    fn start_session(&self) -> Result<FuzzSession, SupervisorError> {
        let crash_dir = self.supervisor.project().crash_dir()?;
        let source = PollingCrashMonitor::new(crash_dir).with_interval(self.config.poll_interval());
        FuzzSession::start(&self.supervisor, Box::new(source), self.config.launch_grace())
    }

    fn repair_loop(&self) -> RepairLoop<'_> {
        RepairLoop {
            runner: &self.supervisor,
            analyzer: self.analyzer.as_ref(),
            locator: &self.locator,
            service: self.service.as_ref(),
            root: self.supervisor.project().root(),
            log: &self.log,
            settings: RepairSettings::from(&self.config),
        }
    }

    fn artifact_digest(&self, artifact: &CrashArtifact) -> String {
        self.supervisor
            .project()
            .crash_dir()
            .ok()
            .and_then(|dir| std::fs::read(dir.join(artifact.name())).ok())
            .map(|bytes| format!(" (md5 {:x})", md5::compute(bytes)))
            .unwrap_or_default()
    }
}
