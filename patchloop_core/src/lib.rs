pub mod analyzer;
pub mod config;
pub mod llm;
pub mod locator;
pub mod logs;
pub mod monitor;
pub mod orchestrator;
pub mod patcher;
pub mod project;
pub mod session;
pub mod shell;
pub mod supervisor;

pub use analyzer::{Analysis, BugLocation, LlmLocator, ReportAnalyzer, SanitizerReportParser};
pub use config::SupervisorConfig;
pub use llm::{DiagnosisService, LlmError};
pub use locator::{BraceCountingLocator, FunctionSpan, SpanLocator};
pub use monitor::{CrashArtifact, CrashSource, PollingCrashMonitor};
pub use orchestrator::{Orchestrator, RepairLoop, RepairOutcome, Shutdown};
pub use project::TargetProject;
pub use session::FuzzSession;
pub use supervisor::{ProcessSupervisor, Reproduction, TargetRunner};
