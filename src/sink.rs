//! Trace output sinks
//!
//! The cache never writes to a file directly; it hands finished lines to a
//! [`TraceSink`]. Each sink serializes its own writes.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Append-only destination for trace lines
pub trait TraceSink: Send + Sync {
    /// Append one line. `line` carries no trailing newline; it may contain
    /// embedded newlines (human-readable mode).
    fn emit_line(&self, line: &str);

    /// Push buffered output to its destination
    fn flush(&self) {}
}

/// Sink over any `Write` implementation
pub struct WriterSink<W: Write + Send> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Recover the wrapped writer
    pub fn into_inner(self) -> W {
        match self.inner.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl WriterSink<BufWriter<File>> {
    /// Create (truncating) a trace log file
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl WriterSink<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write + Send> TraceSink for WriterSink<W> {
    fn emit_line(&self, line: &str) {
        let mut writer = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A failing trace log must not take the traced program down with it
        if let Err(e) = writeln!(writer, "{}", line) {
            tracing::warn!("Failed to write trace line: {}", e);
        }
    }

    fn flush(&self) {
        let mut writer = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.flush() {
            tracing::warn!("Failed to flush trace output: {}", e);
        }
    }
}

/// In-memory sink, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Everything emitted so far, newline-joined as it would appear in a log
    pub fn contents(&self) -> String {
        let mut out = String::new();
        for line in self.lines() {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for MemorySink {
    fn emit_line(&self, line: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line.to_string()),
            Err(poisoned) => poisoned.into_inner().push(line.to_string()),
        }
    }
}
