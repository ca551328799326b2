use patchloop_core::analyzer::{AnalyzerError, LlmLocator, SanitizerReportParser};
use patchloop_core::llm::{DiagnosisService, LlmError};
use patchloop_core::locator::BraceCountingLocator;
use patchloop_core::logs::SessionLog;
use patchloop_core::monitor::CrashArtifact;
use patchloop_core::orchestrator::{OrchestratorError, RepairLoop, RepairOutcome, RepairSettings};
use patchloop_core::supervisor::{Reproduction, SupervisorError, TargetRunner};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

const BUGGY_SOURCE: &str = "\
#include <string.h>

int parse(char *buf)
{
  BUG;
  return 0;
}

int main(void)
{
  return parse(0);
}
";

const SANITIZER_REPORT: &str = "\
=================================================================
==1==ERROR: AddressSanitizer: stack-buffer-overflow
    #0 0x4c3b2a in parse src/parse.c:5:3
    #1 0x4c3f10 in main src/parse.c:11:10

SUMMARY: AddressSanitizer: stack-buffer-overflow
";

/// Crashes while the source still contains `BUG`.
struct FakeTarget {
    source: PathBuf,
    report: &'static str,
    builds: Cell<u32>,
    runs: Cell<u32>,
}

impl FakeTarget {
    fn new(source: PathBuf, report: &'static str) -> Self {
        Self {
            source,
            report,
            builds: Cell::new(0),
            runs: Cell::new(0),
        }
    }
}

impl TargetRunner for FakeTarget {
    fn build(&self) -> Result<(), SupervisorError> {
        self.builds.set(self.builds.get() + 1);
        Ok(())
    }

    fn reproduce(&self, _artifact: &CrashArtifact) -> Result<Reproduction, SupervisorError> {
        self.runs.set(self.runs.get() + 1);
        let crashing = fs::read_to_string(&self.source)?.contains("BUG");
        Ok(Reproduction {
            is_crashing: crashing,
            report: if crashing {
                self.report.to_string()
            } else {
                String::new()
            },
        })
    }
}

enum FixBehaviour {
    Fix(&'static str),
    Internal,
}

struct FakeModel {
    locations: &'static str,
    fix: FixBehaviour,
    fix_requests: AtomicUsize,
}

impl FakeModel {
    fn new(locations: &'static str, fix: FixBehaviour) -> Self {
        Self {
            locations,
            fix,
            fix_requests: AtomicUsize::new(0),
        }
    }
}

impl DiagnosisService for FakeModel {
    fn locate_bugs(&self, _report: &str) -> Result<String, LlmError> {
        Ok(self.locations.to_string())
    }

    fn propose_fix(&self, report: &str, function_text: &str) -> Result<String, LlmError> {
        assert!(!report.is_empty());
        assert!(function_text.contains('{'));
        self.fix_requests.fetch_add(1, Ordering::SeqCst);
        match self.fix {
            FixBehaviour::Fix(text) if function_text.contains("BUG") => Ok(text.to_string()),
            FixBehaviour::Fix(_) => Ok("None".to_string()),
            FixBehaviour::Internal => Err(LlmError::Internal("server_error".to_string())),
        }
    }
}

struct Workspace {
    dir: TempDir,
    log: SessionLog,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/parse.c"), BUGGY_SOURCE).unwrap();
        let log = SessionLog::allocate(&dir.path().join("logs"), "target").unwrap();
        Self { dir, log }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn source(&self) -> PathBuf {
        self.root().join("src/parse.c")
    }

    fn narrative(&self) -> String {
        fs::read_to_string(self.log.narrative_path()).unwrap_or_default()
    }
}

fn settings(max_tries: u32) -> RepairSettings {
    RepairSettings {
        max_tries,
        llm_delay: Duration::ZERO,
    }
}

#[test]
fn crash_is_fixed_on_first_attempt() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), SANITIZER_REPORT);
    let model = FakeModel::new(
        "[]",
        FixBehaviour::Fix("```c\nint parse(char *buf)\n{\n  return buf == 0;\n}\n```"),
    );
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(10),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000000")).unwrap();
    assert_eq!(outcome, RepairOutcome::Fixed { attempts: 1 });
    assert_eq!(target.builds.get(), 1);
    // Both frames were offered to the model before the single rebuild.
    assert_eq!(model.fix_requests.load(Ordering::SeqCst), 2);

    let patched = fs::read_to_string(ws.source()).unwrap();
    assert!(patched.contains("int parse(char *buf)\n{\n"));
    assert!(patched.contains("return buf == 0;"));
    assert!(!patched.contains("BUG"));
    assert!(patched.contains("int main(void)\n{\n  return parse(0);\n}\n"));
    assert!(ws.narrative().contains("fixed the issue in 1 try"));
}

#[test]
fn retry_budget_bounds_rebuilds() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), SANITIZER_REPORT);
    let model = FakeModel::new(
        "[]",
        FixBehaviour::Fix("int parse(char *buf)\n{\n  BUG;\n  return 1;\n}"),
    );
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(4),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000001")).unwrap();
    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 4 });
    assert_eq!(target.builds.get(), 4);
    assert_eq!(target.runs.get(), 5, "initial reproduction plus one per attempt");
    assert!(ws.narrative().contains("Could not fix the program"));
}

#[test]
fn no_candidates_means_no_rebuild() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), "Segmentation fault\n");
    let model = FakeModel::new("[]", FixBehaviour::Fix("unused"));
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(10),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000002")).unwrap();
    assert_eq!(outcome, RepairOutcome::NoOp);
    assert_eq!(target.builds.get(), 0);
    assert_eq!(model.fix_requests.load(Ordering::SeqCst), 0);
    assert_eq!(fs::read_to_string(ws.source()).unwrap(), BUGGY_SOURCE);
    assert!(ws.narrative().contains("No fix needed"));
}

#[test]
fn non_crashing_artifact_leaves_sources_untouched() {
    let ws = Workspace::new();
    fs::write(ws.source(), "int parse(char *buf)\n{\n  return 0;\n}\n").unwrap();
    let before = fs::read(ws.source()).unwrap();
    let target = FakeTarget::new(ws.source(), SANITIZER_REPORT);
    let model = FakeModel::new("[]", FixBehaviour::Fix("unused"));
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(10),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000003")).unwrap();
    assert_eq!(outcome, RepairOutcome::NoOp);
    assert_eq!(target.builds.get(), 0);
    assert_eq!(fs::read(ws.source()).unwrap(), before);
}

#[test]
fn internal_model_errors_burn_attempts_without_rebuilding() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), SANITIZER_REPORT);
    let model = FakeModel::new("[]", FixBehaviour::Internal);
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(3),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000004")).unwrap();
    assert_eq!(outcome, RepairOutcome::Exhausted { attempts: 3 });
    assert_eq!(target.builds.get(), 0);
    assert_eq!(model.fix_requests.load(Ordering::SeqCst), 6);
    assert_eq!(fs::read_to_string(ws.source()).unwrap(), BUGGY_SOURCE);
}

#[test]
fn llm_locations_with_unknown_files_are_skipped() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), "Segmentation fault\n");
    let model = Arc::new(FakeModel::new(
        r#"[{"file": "gone.c", "function": "parse", "line": 1},
            {"file": "parse.c", "function": "parse", "line": 5}]"#,
        FixBehaviour::Fix("  return 0;\n}"),
    ));
    let analyzer = LlmLocator::new(model.clone());
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: model.as_ref(),
        root: ws.root(),
        log: &ws.log,
        settings: settings(10),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000005")).unwrap();
    assert_eq!(outcome, RepairOutcome::Fixed { attempts: 1 });
    assert_eq!(model.fix_requests.load(Ordering::SeqCst), 1);
    assert!(ws.narrative().contains("Could not find the file gone.c"));
}

#[test]
fn malformed_localization_is_fatal() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), "Segmentation fault\n");
    let model = Arc::new(FakeModel::new(
        "Look at parse() in parse.c",
        FixBehaviour::Fix("unused"),
    ));
    let analyzer = LlmLocator::new(model.clone());
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: model.as_ref(),
        root: ws.root(),
        log: &ws.log,
        settings: settings(10),
    };

    let err = repair.repair(&CrashArtifact::new("id:000006")).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Analyzer(AnalyzerError::MalformedLocations { .. })
    ));
    assert_eq!(target.builds.get(), 0);
}

#[test]
fn zero_retry_budget_is_a_no_op() {
    let ws = Workspace::new();
    let target = FakeTarget::new(ws.source(), SANITIZER_REPORT);
    let model = FakeModel::new("[]", FixBehaviour::Fix("  return 0;\n}"));
    let analyzer = SanitizerReportParser::new();
    let repair = RepairLoop {
        runner: &target,
        analyzer: &analyzer,
        locator: &BraceCountingLocator::new(),
        service: &model,
        root: ws.root(),
        log: &ws.log,
        settings: settings(0),
    };

    let outcome = repair.repair(&CrashArtifact::new("id:000007")).unwrap();
    assert_eq!(outcome, RepairOutcome::NoOp);
    assert_eq!(target.builds.get(), 0);
    assert_eq!(model.fix_requests.load(Ordering::SeqCst), 0);
    assert_eq!(fs::read_to_string(ws.source()).unwrap(), BUGGY_SOURCE);
    assert!(ws.narrative().contains("No fix needed"));
    assert!(!ws.narrative().contains("Could not fix"));
}
