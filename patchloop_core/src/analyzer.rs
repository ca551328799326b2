use crate::llm::{DiagnosisService, LlmError, strip_code_fence};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\d+ 0x[0-9a-fA-F]+ in (?P<function>.+) (?P<file>\S+):(?P<line>\d+):\d+$")
        .expect("frame pattern is valid")
});

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("LLM localization response is not a JSON list of locations: {source}\n{response}")]
    MalformedLocations {
        response: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A function believed to be responsible for a crash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BugLocation {
    pub file: String,
    pub function: String,
    /// Informational only. Anything that is not a line number reads as 0.
    #[serde(default, deserialize_with = "lenient_line")]
    pub line: u32,
}

fn lenient_line<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let line = match &value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(line.unwrap_or_default())
}

/// Candidate locations, most relevant first, and the report they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub locations: Vec<BugLocation>,
    pub report: String,
}

/// Turns a diagnostic report into candidate bug locations.
pub trait ReportAnalyzer {
    fn name(&self) -> &'static str;
    fn analyze(&self, report: &str) -> Result<Analysis, AnalyzerError>;
}

/// Reads the first run of stack frames out of a sanitizer report.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizerReportParser;

impl SanitizerReportParser {
    pub fn new() -> Self {
        SanitizerReportParser
    }

    fn parse_frame(line: &str) -> Option<BugLocation> {
        let caps = FRAME.captures(line.trim())?;
        Some(BugLocation {
            file: caps["file"].to_string(),
            function: caps["function"].to_string(),
            line: caps["line"].parse().ok()?,
        })
    }
}

impl ReportAnalyzer for SanitizerReportParser {
    fn name(&self) -> &'static str {
        "SanitizerReportParser"
    }

    /// Frames are collected from the first matching line up to, but not
    /// including, the first line after it that is not a frame.
    fn analyze(&self, report: &str) -> Result<Analysis, AnalyzerError> {
        let locations = report
            .lines()
            .skip_while(|line| Self::parse_frame(line).is_none())
            .map_while(Self::parse_frame)
            .collect();
        Ok(Analysis {
            locations,
            report: report.to_string(),
        })
    }
}

/// Asks the diagnosis service where the bug is.
///
/// A reply that is not a JSON list of locations is an error; it is not
/// retried or repaired here.
pub struct LlmLocator {
    service: Arc<dyn DiagnosisService>,
}

impl LlmLocator {
    pub fn new(service: Arc<dyn DiagnosisService>) -> Self {
        Self { service }
    }
}

impl ReportAnalyzer for LlmLocator {
    fn name(&self) -> &'static str {
        "LlmLocator"
    }

    fn analyze(&self, report: &str) -> Result<Analysis, AnalyzerError> {
        tracing::info!("asking the LLM to find the files and functions responsible for the bug");
        let reply = self.service.locate_bugs(report)?;
        let json = strip_code_fence(&reply);
        let locations: Vec<BugLocation> =
            serde_json::from_str(&json).map_err(|source| AnalyzerError::MalformedLocations {
                response: reply.clone(),
                source,
            })?;
        tracing::debug!(?locations, "LLM localization parsed");
        Ok(Analysis {
            locations,
            report: report.to_string(),
        })
    }
}

/// Picks the analyzer for a project: sanitizer builds get the structured
/// parser, everything else goes through the model.
pub fn analyzer_for(
    sanitized: bool,
    service: Arc<dyn DiagnosisService>,
) -> Box<dyn ReportAnalyzer + Send> {
    if sanitized {
        Box::new(SanitizerReportParser::new())
    } else {
        Box::new(LlmLocator::new(service))
    }
}
