use crate::span::SealedSpan;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, file, IPC)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Contract for shipping sealed spans to a backend.
///
/// Export happens synchronously on whichever thread seals the span; failures
/// are isolated by the caller and never re-enter the pipeline's signal path.
pub trait SpanExporter: Send + Sync {
    /// Exports one sealed span.
    fn export(&self, span: &SealedSpan) -> Result<(), ExportError>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Stdout exporter for testing and debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl SpanExporter for StdoutExporter {
    fn export(&self, span: &SealedSpan) -> Result<(), ExportError> {
        if self.verbose {
            println!(
                "span: id={} parent={:?} name={} duration={}ns outcome={:?}",
                span.span_id, span.parent_span_id, span.name, span.duration_nanos, span.outcome
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// JSON-lines file exporter for local development
pub struct JsonLinesExporter {
    path: PathBuf,
    file: Mutex<()>,
}

impl JsonLinesExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(()),
        }
    }
}

impl SpanExporter for JsonLinesExporter {
    fn export(&self, span: &SealedSpan) -> Result<(), ExportError> {
        let line =
            serde_json::to_string(span).map_err(|e| ExportError::Serialization(e.to_string()))?;

        let _guard = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| ExportError::Transport(e.to_string()))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}

/// Null exporter that discards all spans
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    fn export(&self, _span: &SealedSpan) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Stand-in handle for spans whose export level is exhausted.
///
/// Such spans are still timed and attribute-bearing but are never shipped;
/// sealing them hands off to this exporter, which accepts and drops.
pub struct NoExportExporter;

impl SpanExporter for NoExportExporter {
    fn export(&self, _span: &SealedSpan) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "no-export"
    }
}

/// Decorator that falls back to a secondary exporter when the primary fails.
///
/// Keeps per-instance failure counters so backends can be monitored without
/// cross-tree interference.
pub struct FallbackExporter<P: SpanExporter, F: SpanExporter> {
    primary: P,
    fallback: F,
    primary_failures: AtomicU64,
}

impl<P: SpanExporter, F: SpanExporter> FallbackExporter<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self {
            primary,
            fallback,
            primary_failures: AtomicU64::new(0),
        }
    }

    /// Returns how many exports the primary backend has failed.
    pub fn primary_failures(&self) -> u64 {
        self.primary_failures.load(Ordering::Relaxed)
    }
}

impl<P: SpanExporter, F: SpanExporter> SpanExporter for FallbackExporter<P, F> {
    fn export(&self, span: &SealedSpan) -> Result<(), ExportError> {
        match self.primary.export(span) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.primary_failures.fetch_add(1, Ordering::Relaxed);
                self.fallback.export(span)
            }
        }
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}

/// Test exporter that records all exported spans for verification
#[cfg(test)]
pub(crate) struct TestExporter {
    spans: Mutex<Vec<SealedSpan>>,
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self {
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    pub fn all_spans(&self) -> Vec<SealedSpan> {
        self.spans.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl SpanExporter for TestExporter {
    fn export(&self, span: &SealedSpan) -> Result<(), ExportError> {
        self.spans.lock().unwrap().push(span.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

/// Exporter that always fails, for isolation testing
#[cfg(test)]
pub(crate) struct FailingExporter;

#[cfg(test)]
impl SpanExporter for FailingExporter {
    fn export(&self, _span: &SealedSpan) -> Result<(), ExportError> {
        Err(ExportError::Transport("simulated failure".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}
