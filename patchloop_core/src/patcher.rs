use crate::llm::{DiagnosisService, LlmError, strip_code_fence};
use crate::locator::FunctionSpan;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("Failed to rewrite {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Line range {start}..={end} is outside {path:?} ({len} lines)")]
    OutOfRange {
        path: PathBuf,
        start: usize,
        end: usize,
        len: usize,
    },
}

/// Asks the model for a corrected version of `span`.
///
/// Returns `Ok(None)` when there is nothing to apply: the service reported an
/// internal error, or the reply is empty or the literal `None`.
pub fn request_fix(
    service: &dyn DiagnosisService,
    report: &str,
    span: &FunctionSpan,
) -> Result<Option<String>, PatchError> {
    let reply = match service.propose_fix(report, &span.text) {
        Ok(reply) => reply,
        Err(e) if e.is_internal() => {
            tracing::warn!(function = %span.function, "no fix: {e}");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let fix = strip_code_fence(&reply);
    if fix.trim().is_empty() || fix.trim() == "None" {
        return Ok(None);
    }
    Ok(Some(fix))
}

/// Drops an echoed prototype: if the first line names the function,
/// everything up to and including the first `{` is removed.
pub fn normalize(fix: &str, function: &str) -> String {
    let first_line = fix.split('\n').next().unwrap_or_default();
    if first_line.contains(function) {
        if let Some(brace) = fix.find('{') {
            return fix[brace + 1..].to_string();
        }
    }
    fix.to_string()
}

/// Replaces lines `start..=end` (1-based) of `path` with the lines of
/// `replacement`, rewriting the file in place.
///
/// The file is rewritten directly, not through a temporary file.
pub fn splice(path: &Path, start: usize, end: usize, replacement: &str) -> Result<(), PatchError> {
    let io_err = |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = fs::read_to_string(path).map_err(io_err)?;
    let mut lines: Vec<&str> = content.split_inclusive('\n').collect();

    // `start == end + 1` is an empty range: the replacement is inserted.
    if start == 0 || start > end + 1 || end > lines.len() {
        return Err(PatchError::OutOfRange {
            path: path.to_path_buf(),
            start,
            end,
            len: lines.len(),
        });
    }

    let new_lines: Vec<String> = replacement.lines().map(|l| format!("{l}\n")).collect();
    lines.splice(start - 1..end, new_lines.iter().map(String::as_str));
    fs::write(path, lines.concat()).map_err(io_err)
}

/// Normalizes `fix` and splices it over the body recorded in `span`.
pub fn apply(span: &FunctionSpan, fix: &str) -> Result<(), PatchError> {
    let body = normalize(fix, &span.function);
    splice(&span.path, span.start_line, span.end_line, &body)?;
    tracing::info!(
        path = ?span.path,
        function = %span.function,
        start = span.start_line,
        end = span.end_line,
        "patched function"
    );
    Ok(())
}
