use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

const READ_PREFIX: &str = "R ";

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}:{line}: unsupported trace operation {content:?}")]
    UnsupportedOperation {
        name: String,
        line: u64,
        content: String,
    },
    #[error("{name}:{line}: read record has no arrival modifier")]
    MissingModifier { name: String, line: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOperation {
    Read,
}

/// One parsed trace record.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceLine {
    pub operation: TraceOperation,
    pub key_tokens: Vec<String>,
    // Parsed to validate the record shape; replay does not use it.
    pub modifier: String,
}

/// Sequential reader over a `R <key>... <modifier>` trace.
pub struct TraceSource<R> {
    reader: R,
    name: String,
    line_no: u64,
    buf: String,
}

impl TraceSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = File::open(path).map_err(|source| TraceError::Io {
            name: name.clone(),
            source,
        })?;
        Ok(Self::from_reader(BufReader::new(file), name))
    }
}

impl<R: BufRead> TraceSource<R> {
    pub fn from_reader(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line_no: 0,
            buf: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the next record, or `None` once the trace is exhausted.
    pub fn next_line(&mut self) -> Result<Option<TraceLine>, TraceError> {
        self.buf.clear();
        let read = self
            .reader
            .read_line(&mut self.buf)
            .map_err(|source| TraceError::Io {
                name: self.name.clone(),
                source,
            })?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;

        let line = self.buf.trim_end_matches(|c| c == '\n' || c == '\r');
        parse_trace_line(line).map(Some).ok_or_else(|| {
            if line.starts_with(READ_PREFIX) {
                TraceError::MissingModifier {
                    name: self.name.clone(),
                    line: self.line_no,
                }
            } else {
                TraceError::UnsupportedOperation {
                    name: self.name.clone(),
                    line: self.line_no,
                    content: line.to_owned(),
                }
            }
        })
    }
}

fn parse_trace_line(line: &str) -> Option<TraceLine> {
    let rest = line.strip_prefix(READ_PREFIX)?;
    let mut key_tokens: Vec<String> = rest.split_whitespace().map(str::to_owned).collect();
    let modifier = key_tokens.pop()?;
    Some(TraceLine {
        operation: TraceOperation::Read,
        key_tokens,
        modifier,
    })
}
