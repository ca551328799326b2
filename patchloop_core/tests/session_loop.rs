use patchloop_core::config::SupervisorConfig;
use patchloop_core::llm::{DiagnosisService, LlmError};
use patchloop_core::orchestrator::{Orchestrator, OrchestratorError, Shutdown};
use patchloop_core::project::TargetProject;
use patchloop_core::supervisor::SupervisorError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::{TempDir, tempdir};

const BUGGY_SOURCE: &str = "\
int parse(char *buf)
{
  BUG;
  return 0;
}
";

/// Crashes on stderr while the source still contains `BUG`.
const RUN_LINE: &str = "cat INPUT > /dev/null; grep -q BUG src/parse.c && echo 'crash in parse' 1>&2\n";

const LOCATIONS: &str = r#"[{"file": "parse.c", "function": "parse", "line": 3}]"#;

#[derive(Default)]
struct Calls {
    locate: AtomicUsize,
    fix: AtomicUsize,
}

struct ScriptedModel {
    fix: &'static str,
    calls: Arc<Calls>,
}

impl DiagnosisService for ScriptedModel {
    fn locate_bugs(&self, _report: &str) -> Result<String, LlmError> {
        self.calls.locate.fetch_add(1, Ordering::SeqCst);
        Ok(LOCATIONS.to_string())
    }

    fn propose_fix(&self, _report: &str, _function_text: &str) -> Result<String, LlmError> {
        self.calls.fix.fetch_add(1, Ordering::SeqCst);
        Ok(self.fix.to_string())
    }
}

struct Target {
    dir: TempDir,
}

impl Target {
    fn new(fuzz: &str) -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/parse.c"), BUGGY_SOURCE).unwrap();
        fs::write(dir.path().join("build.txt"), "echo built >> builds.log\n").unwrap();
        fs::write(dir.path().join("run.txt"), RUN_LINE).unwrap();
        fs::write(dir.path().join("fuzz.txt"), fuzz).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, queue_timeout: u64, num_tries_to_fix: u32) -> SupervisorConfig {
        SupervisorConfig {
            queue_timeout,
            num_tries_to_fix,
            llm_timeout: 0,
            poll_interval_ms: 50,
            launch_grace_ms: 300,
            logs_dir: self.root().join("logs").display().to_string(),
            ..SupervisorConfig::default()
        }
    }

    fn orchestrator(
        &self,
        fix: &'static str,
        config: SupervisorConfig,
    ) -> (Orchestrator, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let model: Box<dyn DiagnosisService> = Box::new(ScriptedModel {
            fix,
            calls: Arc::clone(&calls),
        });
        let project = TargetProject::open(self.root(), "build.txt", "run.txt", "fuzz.txt").unwrap();
        (Orchestrator::new(project, model, config).unwrap(), calls)
    }

    fn builds(&self) -> usize {
        fs::read_to_string(self.root().join("builds.log"))
            .map(|log| log.lines().count())
            .unwrap_or_default()
    }

    fn source(&self) -> String {
        fs::read_to_string(self.root().join("src/parse.c")).unwrap()
    }
}

fn state_dir(orchestrator: &Orchestrator) -> PathBuf {
    orchestrator
        .supervisor()
        .pid_file()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

#[test]
fn idle_fuzzer_shuts_down_cleanly() {
    let target = Target::new("bash -c 'sleep 1.5' -o out\n");
    let (orchestrator, calls) = target.orchestrator("unused", target.config(1, 3));
    let state = state_dir(&orchestrator);
    let narrative = orchestrator.log().narrative_path();
    assert!(state.exists());

    assert_eq!(orchestrator.run().unwrap(), Shutdown::Idle);

    assert!(!state.exists(), "pid state dir must be removed");
    assert_eq!(target.builds(), 1);
    assert_eq!(calls.locate.load(Ordering::SeqCst), 0);
    let log = fs::read_to_string(narrative).unwrap();
    assert_eq!(count(&log, "started fuzzing"), 1);
    assert!(log.contains("No new files added in the last 1s, exiting"));
}

#[test]
fn fuzzer_that_dies_at_launch_is_fatal() {
    let target = Target::new("true -o out\n");
    let (orchestrator, _calls) = target.orchestrator("unused", target.config(1, 3));
    let state = state_dir(&orchestrator);
    let narrative = orchestrator.log().narrative_path();

    let err = orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Supervisor(SupervisorError::FuzzerLaunchFailed)
    ));
    assert!(!state.exists());
    let log = fs::read_to_string(narrative).unwrap();
    assert!(log.contains("fuzzer has failed to start, exiting"));
}

#[test]
fn confirmed_fix_restarts_fuzzing_in_resume_mode() {
    // Writes the same crash on every run; the second session already knows it.
    let target = Target::new(
        "bash -c 'mkdir -p out/default/crashes; sleep 0.5; echo x > out/default/crashes/id:000000; sleep 0.5' -i seeds -o out\n",
    );
    let (orchestrator, calls) =
        target.orchestrator("  return buf == 0;\n}", target.config(1, 3));
    let narrative = orchestrator.log().narrative_path();

    assert_eq!(orchestrator.run().unwrap(), Shutdown::Idle);

    assert!(!target.source().contains("BUG"));
    assert_eq!(calls.locate.load(Ordering::SeqCst), 1);
    assert_eq!(calls.fix.load(Ordering::SeqCst), 1);
    // Initial build, rebuild after the patch, build for the second session.
    assert_eq!(target.builds(), 3);

    let resumed = fs::read_to_string(target.root().join("fuzz_run2.txt")).unwrap();
    assert!(resumed.contains("-i - -o out"));
    let log = fs::read_to_string(narrative).unwrap();
    assert!(log.contains("fixed the issue in 1 try"));
    assert_eq!(count(&log, "started fuzzing"), 2);
}

#[test]
fn unfixed_crash_keeps_the_fuzzer_running() {
    // The second crash is written after the first repair gave up, by the
    // same fuzzer process.
    let target = Target::new(
        "bash -c 'mkdir -p out/default/crashes; sleep 0.5; echo x > out/default/crashes/id:000000; sleep 1; echo y > out/default/crashes/id:000001; sleep 0.5' -o out\n",
    );
    let (orchestrator, calls) = target.orchestrator(
        "int parse(char *buf)\n{\n  BUG;\n  return 1;\n}",
        target.config(3, 2),
    );
    let narrative = orchestrator.log().narrative_path();

    assert_eq!(orchestrator.run().unwrap(), Shutdown::Idle);

    assert!(target.source().contains("BUG"));
    assert_eq!(calls.locate.load(Ordering::SeqCst), 2);
    assert_eq!(calls.fix.load(Ordering::SeqCst), 4);
    assert_eq!(target.builds(), 1 + 2 * 2);
    assert!(!target.root().join("fuzz_run2.txt").exists());

    let log = fs::read_to_string(narrative).unwrap();
    assert_eq!(count(&log, "Could not fix the program"), 2);
    assert_eq!(count(&log, "started fuzzing"), 1);
    assert!(log.contains("id:000000"));
    assert!(log.contains("id:000001"));
}
