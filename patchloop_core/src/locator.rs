use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Failed to read source file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where a function's body sits in a source file.
///
/// `start_line` is the first line after the opening brace and `end_line` the
/// line holding the matching closing brace, both 1-based and inclusive.
/// `text` is the whole definition, prototype included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpan {
    pub path: PathBuf,
    pub function: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

/// Finds a named function in a source file.
///
/// Every call reads the file again; spans are never reused across edits.
pub trait SpanLocator {
    fn locate(&self, path: &Path, function: &str) -> Result<Option<FunctionSpan>, LocateError>;
}

/// Line-oriented scanner that matches parentheses and braces literally.
///
/// It knows nothing about comments or string and character literals, so a
/// brace inside either one throws off the depth count.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceCountingLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Prototype,
    CloseParen,
    OpenBrace,
    Body { depth: i64 },
}

impl BraceCountingLocator {
    pub fn new() -> Self {
        BraceCountingLocator
    }

    /// Runs the scanner over already loaded source text.
    pub fn scan(source: &str, function: &str) -> Option<(usize, usize, String)> {
        let mut state = Scan::Prototype;
        let mut text = String::new();
        let mut start_line = 0;

        for (idx, line) in source.split_inclusive('\n').enumerate() {
            let line_no = idx + 1;

            if state == Scan::Prototype && is_prototype(line, function) {
                state = Scan::CloseParen;
            }
            if state == Scan::CloseParen {
                if line.contains(';') {
                    state = Scan::Prototype;
                    text.clear();
                    continue;
                }
                if line.contains(')') {
                    state = Scan::OpenBrace;
                }
            }
            if state == Scan::OpenBrace {
                if line.contains('{') {
                    state = Scan::Body { depth: 0 };
                    start_line = line_no + 1;
                } else if line.contains(';') {
                    state = Scan::Prototype;
                    text.clear();
                    continue;
                }
            }
            if state != Scan::Prototype {
                text.push_str(line);
            }
            if let Scan::Body { depth } = &mut state {
                *depth += line.matches('{').count() as i64;
                *depth -= line.matches('}').count() as i64;
                if *depth == 0 && line.contains('}') {
                    return Some((start_line, line_no, text));
                }
            }
        }
        None
    }
}

/// The name must appear before the only `(` on a line with no `;`.
fn is_prototype(line: &str, function: &str) -> bool {
    if line.contains(';') || line.matches('(').count() != 1 {
        return false;
    }
    match (line.find(function), line.find('(')) {
        (Some(name_at), Some(paren_at)) => name_at < paren_at,
        _ => false,
    }
}

impl SpanLocator for BraceCountingLocator {
    fn locate(&self, path: &Path, function: &str) -> Result<Option<FunctionSpan>, LocateError> {
        tracing::debug!(?path, function, "searching for function");
        let source = fs::read_to_string(path).map_err(|source| LocateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(
            Self::scan(&source, function).map(|(start_line, end_line, text)| FunctionSpan {
                path: path.to_path_buf(),
                function: function.to_string(),
                start_line,
                end_line,
                text,
            }),
        )
    }
}

/// Maps a file name reported by a sanitizer or the model to a file on disk.
///
/// Tries the path as given, then relative to `root`, then searches `root`
/// for a file with the same name.
pub fn resolve_source_file(root: &Path, reported: &str) -> Option<PathBuf> {
    let given = Path::new(reported);
    if given.is_absolute() && given.is_file() {
        return Some(given.to_path_buf());
    }
    let joined = root.join(given);
    if joined.is_file() {
        return Some(joined);
    }
    let file_name = given.file_name()?;
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
}
