//! Hierarchical execution tracing for pipeline executions.
//!
//! Every pipeline/component boundary opens a [`Span`] inside an
//! [`ExecutionSpanTree`]. Spans form a parent/child tree referenced by id
//! (never by owning pointer), are timed and attribute-bearing, and are
//! handed to a [`SpanExporter`] exactly once when sealed.
//!
//! # Export-level truncation
//!
//! Each span carries an export level, a truncation budget deciding how deep
//! into the tree results are shipped externally. A child's effective level
//! is the child-requested level when it is below the parent level, otherwise
//! the parent level minus one. Spans whose effective level reaches zero are
//! still measured but never exported.

mod exporter;
mod span;
mod tree;

pub use exporter::{
    ExportError, FallbackExporter, JsonLinesExporter, NoExportExporter, NullExporter,
    SpanExporter, StdoutExporter,
};
pub use span::{
    effective_export_level, SealedSpan, Span, SpanId, SpanOutcome, SpanState, ATTR_ARTIFACT_ID,
    ATTR_ARTIFACT_TYPE, ATTR_CORRELATION_ID, ATTR_THREAD_END_ID, ATTR_THREAD_START_ID,
};
pub use tree::{
    ExecutionSpanTree, SpanCustomization, SpanRequest, SpanTreeConfig, TreeMetrics,
    DEFAULT_EXPORT_LEVEL, DEFAULT_RETAINED_SPANS,
};
