use patchloop_core::config::SupervisorConfig;
use patchloop_core::llm::service_from_config;
use patchloop_core::orchestrator::{Orchestrator, OrchestratorError, Shutdown};
use patchloop_core::project::TargetProject;
use patchloop_core::supervisor::SupervisorError;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Fuzz a C target, patch the functions behind each crash with an LLM, and re-verify",
    long_about = None
)]
struct Cli {
    /// Root of the target project; instruction files are relative to it.
    #[clap(short, long, default_value = ".")]
    project: PathBuf,
    /// Build commands, one per line.
    #[clap(short, long, default_value = "build.txt")]
    build: PathBuf,
    /// Command that runs the target on one input; must contain INPUT or INPUT_STDIN.
    #[clap(short, long, default_value = "run.txt")]
    run: PathBuf,
    /// Fuzzer command; must contain `-o <dir>`.
    #[clap(short, long, default_value = "fuzz.txt")]
    fuzz: PathBuf,
    /// Configuration file, created with defaults if missing.
    #[clap(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG.
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = format!("patchloop_core={level},patchloop_cli={level}");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();
}

fn run(cli: Cli) -> Result<Shutdown, anyhow::Error> {
    tracing::info!(
        project = ?cli.project,
        build = ?cli.build,
        run = ?cli.run,
        fuzz = ?cli.fuzz,
        "starting patchloop"
    );

    let config = SupervisorConfig::load_or_create(&cli.config)?;
    tracing::debug!("Effective configuration: {config:#?}");

    let project = TargetProject::open(&cli.project, &cli.build, &cli.run, &cli.fuzz)
        .context("Failed to open target project")?;
    if project.is_sanitized() {
        tracing::info!("build instructions enable a sanitizer, parsing its reports directly");
    }

    let service = service_from_config(&config).context("Failed to set up the LLM backend")?;
    let orchestrator = Orchestrator::new(project, service, config)?;
    Ok(orchestrator.run()?)
}

/// 0 after an idle shutdown, 1 for every error.
fn exit_status(result: &Result<Shutdown, anyhow::Error>) -> u8 {
    match result {
        Ok(Shutdown::Idle) => 0,
        Err(_) => 1,
    }
}

fn is_launch_failure(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::Supervisor(SupervisorError::FuzzerLaunchFailed))
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = run(cli);
    match &result {
        Ok(Shutdown::Idle) => {
            tracing::info!("no new crashes within the queue timeout, exiting");
        }
        Err(e) if is_launch_failure(e) => {
            tracing::error!("fuzzer has failed to start, exiting");
        }
        Err(e) => tracing::error!("{e:#}"),
    }
    ExitCode::from(exit_status(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchloop_core::monitor::MonitorError;

    #[test]
    fn only_an_idle_shutdown_exits_zero() {
        assert_eq!(exit_status(&Ok(Shutdown::Idle)), 0);

        let launch: anyhow::Error =
            OrchestratorError::Supervisor(SupervisorError::FuzzerLaunchFailed).into();
        assert!(is_launch_failure(&launch));
        assert_eq!(exit_status(&Err(launch)), 1);

        let monitor: anyhow::Error = OrchestratorError::Monitor(MonitorError::Stopped).into();
        assert!(!is_launch_failure(&monitor));
        assert_eq!(exit_status(&Err(monitor)), 1);
    }
}
