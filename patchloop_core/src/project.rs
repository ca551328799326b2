//! The target project: where it lives and how to build, run and fuzz it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder replaced by the crash artifact's path in the run instruction.
pub const INPUT_PLACEHOLDER: &str = "INPUT";
/// Placeholder replaced by the crash artifact's content in the run instruction.
pub const INPUT_STDIN_PLACEHOLDER: &str = "INPUT_STDIN";
/// Where the fuzzer stores crashing inputs, relative to its output directory.
pub const CRASH_SUBDIR: &str = "default/crashes";

const SANITIZER_MARKERS: &[&str] = &["asan", "ASAN", "-fsanitize=address"];

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Failed to read instruction file {path:?}: {source}")]
    Instructions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Instruction file {0:?} is empty")]
    EmptyInstructions(PathBuf),
    #[error("Fuzz instruction has no `-o <dir>` output flag: {0}")]
    MissingOutputFlag(String),
    #[error("Failed to write resume instruction {path:?}: {source}")]
    ResumeWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Immutable description of the program under repair.
///
/// Instruction paths are relative to `root`. The sanitizer flag is computed
/// once when the project is opened.
#[derive(Debug, Clone)]
pub struct TargetProject {
    root: PathBuf,
    build_instructions: PathBuf,
    run_instructions: PathBuf,
    fuzz_instructions: PathBuf,
    sanitized: bool,
}

impl TargetProject {
    pub fn open(
        root: impl Into<PathBuf>,
        build_instructions: impl Into<PathBuf>,
        run_instructions: impl Into<PathBuf>,
        fuzz_instructions: impl Into<PathBuf>,
    ) -> Result<Self, ProjectError> {
        let mut project = Self {
            root: root.into(),
            build_instructions: build_instructions.into(),
            run_instructions: run_instructions.into(),
            fuzz_instructions: fuzz_instructions.into(),
            sanitized: false,
        };
        project.sanitized = project
            .build_lines()?
            .iter()
            .any(|line| SANITIZER_MARKERS.iter().any(|m| line.contains(m)));
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the build instructions enable a sanitizer.
    pub fn is_sanitized(&self) -> bool {
        self.sanitized
    }

    /// Basename of the project root, used to name logs and temp state.
    pub fn name(&self) -> String {
        match self.root.components().next_back() {
            Some(std::path::Component::Normal(name)) => name.to_string_lossy().into_owned(),
            _ => fs::canonicalize(&self.root)
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "target".to_string()),
        }
    }

    pub fn fuzz_instructions(&self) -> &Path {
        &self.fuzz_instructions
    }

    /// All build commands, one per line, trimmed, in file order.
    pub fn build_lines(&self) -> Result<Vec<String>, ProjectError> {
        let content = self.read_instructions(&self.build_instructions)?;
        Ok(content.lines().map(|l| l.trim().to_string()).collect())
    }

    pub fn run_line(&self) -> Result<String, ProjectError> {
        self.first_line(&self.run_instructions)
    }

    pub fn fuzz_line(&self) -> Result<String, ProjectError> {
        self.first_line(&self.fuzz_instructions)
    }

    /// The directory named by the `-o` flag of the fuzz instruction.
    pub fn fuzzer_output_dir(&self) -> Result<String, ProjectError> {
        let line = self.fuzz_line()?;
        output_dir_of(&line).ok_or(ProjectError::MissingOutputFlag(line))
    }

    /// Absolute-or-root-relative location of the crash directory on disk.
    pub fn crash_dir(&self) -> Result<PathBuf, ProjectError> {
        Ok(self.root.join(self.fuzzer_output_dir()?).join(CRASH_SUBDIR))
    }

    /// The artifact path as passed to the run instruction, relative to `root`.
    pub fn artifact_arg(&self, artifact_name: &str) -> Result<String, ProjectError> {
        Ok(format!(
            "./{}/{}/{}",
            self.fuzzer_output_dir()?,
            CRASH_SUBDIR,
            artifact_name
        ))
    }

    /// Switches the fuzz instruction into resume mode (`-i <dir>` becomes
    /// `-i -`), writing it next to the original as `<stem>_run2.txt`.
    ///
    /// Returns `Ok(false)` if the project already uses a resume instruction.
    pub fn switch_to_resume(&mut self) -> Result<bool, ProjectError> {
        let stem = self
            .fuzz_instructions
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem.ends_with("_run2") {
            return Ok(false);
        }

        let content = self.read_instructions(&self.fuzz_instructions)?;
        let rewritten: String = content
            .lines()
            .map(|line| format!("{}\n", resume_line(line)))
            .collect();

        let mut resumed = self.fuzz_instructions.clone();
        resumed.set_file_name(format!("{stem}_run2.txt"));
        let target = self.root.join(&resumed);
        fs::write(&target, rewritten).map_err(|source| ProjectError::ResumeWrite {
            path: target.clone(),
            source,
        })?;
        tracing::debug!(path = ?target, "fuzz instruction switched to resume mode");
        self.fuzz_instructions = resumed;
        Ok(true)
    }

    fn first_line(&self, relative: &Path) -> Result<String, ProjectError> {
        let content = self.read_instructions(relative)?;
        content
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .ok_or_else(|| ProjectError::EmptyInstructions(self.root.join(relative)))
    }

    fn read_instructions(&self, relative: &Path) -> Result<String, ProjectError> {
        let path = self.root.join(relative);
        fs::read_to_string(&path).map_err(|source| ProjectError::Instructions { path, source })
    }
}

fn output_dir_of(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    tokens.position(|t| t == "-o")?;
    tokens.next().map(str::to_string)
}

fn resume_line(line: &str) -> String {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.iter().position(|t| *t == "-i") {
        Some(idx) if idx + 1 < tokens.len() => {
            let mut out: Vec<&str> = tokens.clone();
            out[idx + 1] = "-";
            out.join(" ")
        }
        _ => line.to_string(),
    }
}
