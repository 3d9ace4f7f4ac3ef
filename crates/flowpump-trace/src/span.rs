use crate::exporter::SpanExporter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Attribute key for the event's correlation identity.
pub const ATTR_CORRELATION_ID: &str = "correlation.id";
/// Attribute key for the owning artifact's identity.
pub const ATTR_ARTIFACT_ID: &str = "artifact.id";
/// Attribute key for the owning artifact's type.
pub const ATTR_ARTIFACT_TYPE: &str = "artifact.type";
/// Attribute key for the thread the span was opened on.
pub const ATTR_THREAD_START_ID: &str = "thread.start.id";
/// Attribute key for the thread the span was sealed on. Absent until sealed.
pub const ATTR_THREAD_END_ID: &str = "thread.end.id";

/// Identifier of a span within one [`ExecutionSpanTree`](crate::ExecutionSpanTree).
///
/// Parent/child relations are expressed through ids, never through owning
/// pointers, so independent sealing order can never form a reference cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Terminal outcome of a sealed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanOutcome {
    /// The component completed successfully.
    Ok,
    /// The component finished with an error.
    Error,
    /// Execution was cancelled while the span was still open.
    Cancelled,
}

/// Lifecycle state of a span: open, then sealed. Terminal, no reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Created and running.
    Open,
    /// End time set, handed to the exporter.
    Sealed(SpanOutcome),
}

/// Computes the effective export level of a child span.
///
/// Child-requested level wins when it is stricter than the parent level;
/// otherwise the budget shrinks by one per tree depth. Root spans keep their
/// requested level unchanged.
pub fn effective_export_level(parent_level: Option<i32>, requested: i32) -> i32 {
    match parent_level {
        None => requested,
        Some(parent) => {
            if requested < parent {
                requested
            } else {
                parent - 1
            }
        }
    }
}

/// A timed, attributed record of one component's execution within one event.
///
/// Lives in the arena of its [`ExecutionSpanTree`](crate::ExecutionSpanTree)
/// and never outlives the event's execution of that component.
pub struct Span {
    id: SpanId,
    name: String,
    parent: Option<SpanId>,
    start_unix_nanos: u64,
    started_at: Instant,
    end_unix_nanos: Option<u64>,
    duration: Option<Duration>,
    attributes: HashMap<String, String>,
    export_level: i32,
    state: SpanState,
    exporter: Arc<dyn SpanExporter>,
}

impl Span {
    pub(crate) fn open(
        id: SpanId,
        name: String,
        parent: Option<SpanId>,
        export_level: i32,
        attributes: HashMap<String, String>,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        Self {
            id,
            name,
            parent,
            start_unix_nanos: unix_nanos_now(),
            started_at: Instant::now(),
            end_unix_nanos: None,
            duration: None,
            attributes,
            export_level,
            state: SpanState::Open,
            exporter,
        }
    }

    pub fn id(&self) -> SpanId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent span id, if any. A weak reference by id: the parent may have
    /// been sealed and exported already.
    pub fn parent(&self) -> Option<SpanId> {
        self.parent
    }

    /// Looks up an attribute. Unknown keys return `None`, never an error.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn export_level(&self) -> i32 {
        self.export_level
    }

    /// A span with an exhausted export budget is measured but never shipped.
    pub fn is_exportable(&self) -> bool {
        self.export_level > 0
    }

    /// Wall-clock duration. `None` while the span is still open.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn state(&self) -> SpanState {
        self.state
    }

    pub(crate) fn exporter(&self) -> Arc<dyn SpanExporter> {
        Arc::clone(&self.exporter)
    }

    /// Transitions to `Sealed`. Returns `false` if already sealed (no-op).
    pub(crate) fn seal(&mut self, outcome: SpanOutcome) -> bool {
        if matches!(self.state, SpanState::Sealed(_)) {
            return false;
        }
        self.end_unix_nanos = Some(unix_nanos_now());
        self.duration = Some(self.started_at.elapsed());
        self.attributes
            .insert(ATTR_THREAD_END_ID.to_string(), current_thread_id());
        self.state = SpanState::Sealed(outcome);
        true
    }

    pub(crate) fn to_sealed(&self) -> SealedSpan {
        let outcome = match self.state {
            SpanState::Sealed(outcome) => outcome,
            SpanState::Open => SpanOutcome::Cancelled,
        };
        SealedSpan {
            span_id: self.id,
            parent_span_id: self.parent,
            name: self.name.clone(),
            start_unix_nanos: self.start_unix_nanos,
            end_unix_nanos: self.end_unix_nanos.unwrap_or(self.start_unix_nanos),
            duration_nanos: self.duration.map_or(0, |d| d.as_nanos() as u64),
            attributes: self.attributes.clone(),
            export_level: self.export_level,
            outcome,
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("export_level", &self.export_level)
            .field("state", &self.state)
            .field("exporter", &self.exporter.name())
            .finish_non_exhaustive()
    }
}

/// Immutable export form of a sealed span, handed to the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSpan {
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    pub duration_nanos: u64,
    pub attributes: HashMap<String, String>,
    pub export_level: i32,
    pub outcome: SpanOutcome,
}

pub(crate) fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

pub(crate) fn current_thread_id() -> String {
    format!("{:?}", std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_below_parent_keeps_requested_level() {
        assert_eq!(effective_export_level(Some(3), 1), 1);
    }

    #[test]
    fn child_at_or_above_parent_decrements_budget() {
        assert_eq!(effective_export_level(Some(3), 3), 2);
        assert_eq!(effective_export_level(Some(3), 7), 2);
    }

    #[test]
    fn exhausted_parent_budget_yields_non_exportable_child() {
        assert_eq!(effective_export_level(Some(0), -1), -1);
        assert_eq!(effective_export_level(Some(1), 5), 0);
    }

    #[test]
    fn root_span_keeps_requested_level() {
        assert_eq!(effective_export_level(None, 4), 4);
    }
}
