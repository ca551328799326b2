//! Per-run log directory: a timestamped narrative of the session
//! (`log.txt`) and the raw LLM exchanges (`log_llm.txt`).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const NARRATIVE_FILE: &str = "log.txt";
const TRANSCRIPT_FILE: &str = "log_llm.txt";

#[derive(Debug, Clone)]
pub struct SessionLog {
    dir: PathBuf,
}

impl SessionLog {
    /// Creates `<base>/<project>_<n>` for the smallest free `n`.
    pub fn allocate(base: &Path, project_name: &str) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let mut id = 0u32;
        loop {
            let dir = base.join(format!("{project_name}_{id}"));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Self { dir }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => id += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn narrative_path(&self) -> PathBuf {
        self.dir.join(NARRATIVE_FILE)
    }

    /// Appends one timestamped line to the narrative.
    pub fn record(&self, message: &str) -> io::Result<()> {
        let stamp = humantime::format_rfc3339_seconds(SystemTime::now());
        let mut file = append(&self.narrative_path())?;
        writeln!(file, "[{stamp}] {message}")
    }

    pub fn transcript(&self) -> LlmTranscript {
        LlmTranscript::new(self.dir.join(TRANSCRIPT_FILE))
    }
}

/// Append-only record of LLM requests and responses.
#[derive(Debug, Clone)]
pub struct LlmTranscript {
    path: PathBuf,
}

impl LlmTranscript {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, kind: &str, sections: &[(&str, &str)]) -> io::Result<()> {
        let mut file = append(&self.path)?;
        writeln!(file, "{kind}")?;
        for (title, body) in sections {
            writeln!(file, "{title}:\n{body}\n")?;
        }
        writeln!(file, "\n\n")
    }
}

fn append(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}
