use crate::exporter::{NoExportExporter, SpanExporter};
use crate::span::{
    current_thread_id, effective_export_level, SealedSpan, Span, SpanId, SpanOutcome,
    ATTR_ARTIFACT_ID, ATTR_ARTIFACT_TYPE, ATTR_CORRELATION_ID, ATTR_THREAD_START_ID,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default export-level budget for root spans.
pub const DEFAULT_EXPORT_LEVEL: i32 = 4;

/// Default bound on sealed spans retained for read-back.
pub const DEFAULT_RETAINED_SPANS: usize = 1024;

/// Configuration for span creation within one tree.
#[derive(Debug, Clone)]
pub struct SpanTreeConfig {
    /// Export level requested for newly opened spans. The effective level is
    /// truncated against the parent's budget.
    pub export_level: i32,
}

impl Default for SpanTreeConfig {
    fn default() -> Self {
        Self {
            export_level: DEFAULT_EXPORT_LEVEL,
        }
    }
}

impl SpanTreeConfig {
    pub fn with_export_level(mut self, level: i32) -> Self {
        self.export_level = level;
        self
    }
}

/// Identity of the artifact a span is opened for, used to populate the
/// eager attribute set at creation time.
#[derive(Debug, Clone)]
pub struct SpanCustomization {
    pub artifact_id: String,
    pub artifact_type: String,
}

impl SpanCustomization {
    pub fn new(artifact_id: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            artifact_type: artifact_type.into(),
        }
    }
}

/// Everything needed to open one span.
#[derive(Debug, Clone)]
pub struct SpanRequest<'a> {
    pub name: &'a str,
    /// Parent span, read from the event's trace context. `None` for roots.
    pub parent: Option<SpanId>,
    pub correlation_id: &'a str,
    pub config: &'a SpanTreeConfig,
    pub customization: &'a SpanCustomization,
}

/// Per-tree counters (atomics, safe under concurrent sealing).
#[derive(Debug, Default)]
pub struct TreeMetrics {
    opened: AtomicU64,
    sealed: AtomicU64,
    exported: AtomicU64,
    export_errors: AtomicU64,
    non_exportable: AtomicU64,
}

impl TreeMetrics {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn sealed(&self) -> u64 {
        self.sealed.load(Ordering::Relaxed)
    }

    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn non_exportable(&self) -> u64 {
        self.non_exportable.load(Ordering::Relaxed)
    }
}

/// Bounded read-back window of sealed spans, evicted oldest-first.
struct Retired {
    order: VecDeque<SpanId>,
    spans: HashMap<SpanId, SealedSpan>,
    capacity: usize,
}

impl Retired {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            spans: HashMap::new(),
            capacity,
        }
    }

    fn push(&mut self, sealed: SealedSpan) {
        self.order.push_back(sealed.span_id);
        self.spans.insert(sealed.span_id, sealed);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.spans.remove(&evicted);
            }
        }
    }
}

/// Per-event hierarchical span storage.
///
/// Open spans live in an arena keyed by id; the parent relation is a plain
/// id, so sealing and export order are independent and cycles are
/// impossible. Sealing removes the span from the arena, hands the sealed
/// form to the exporter exactly once (failures isolated from the execution
/// path), and retains it in a bounded read-back window, so a long-lived
/// tree never grows with event count.
pub struct ExecutionSpanTree {
    next_id: AtomicU64,
    spans: Mutex<HashMap<SpanId, Span>>,
    retired: Mutex<Retired>,
    exporter: Arc<dyn SpanExporter>,
    no_export: Arc<dyn SpanExporter>,
    metrics: Arc<TreeMetrics>,
}

impl ExecutionSpanTree {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self::with_retention(exporter, DEFAULT_RETAINED_SPANS)
    }

    /// A tree retaining at most `retained_spans` sealed spans for read-back.
    pub fn with_retention(exporter: Arc<dyn SpanExporter>, retained_spans: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            spans: Mutex::new(HashMap::new()),
            retired: Mutex::new(Retired::new(retained_spans)),
            exporter,
            no_export: Arc::new(NoExportExporter),
            metrics: Arc::new(TreeMetrics::default()),
        }
    }

    /// Opens a span for a component that begins executing.
    ///
    /// The effective export level is computed against the parent named in the
    /// request; a span whose budget is exhausted gets the no-export stand-in
    /// as its exporter handle. Eager attributes (correlation id, artifact
    /// identity, starting thread) are populated here; the ending-thread
    /// attribute only appears once the span is sealed.
    pub fn open_span(&self, request: &SpanRequest<'_>) -> SpanId {
        let mut spans = self.lock_spans();

        // The parent may already be sealed; its budget still applies.
        let parent_level = request.parent.and_then(|id| {
            spans
                .get(&id)
                .map(Span::export_level)
                .or_else(|| self.lock_retired().spans.get(&id).map(|s| s.export_level))
        });
        let level = effective_export_level(parent_level, request.config.export_level);

        let exporter = if level > 0 {
            Arc::clone(&self.exporter)
        } else {
            self.metrics.non_exportable.fetch_add(1, Ordering::Relaxed);
            Arc::clone(&self.no_export)
        };

        let mut attributes = HashMap::new();
        attributes.insert(
            ATTR_CORRELATION_ID.to_string(),
            request.correlation_id.to_string(),
        );
        attributes.insert(
            ATTR_ARTIFACT_ID.to_string(),
            request.customization.artifact_id.clone(),
        );
        attributes.insert(
            ATTR_ARTIFACT_TYPE.to_string(),
            request.customization.artifact_type.clone(),
        );
        attributes.insert(ATTR_THREAD_START_ID.to_string(), current_thread_id());

        let id = SpanId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let span = Span::open(
            id,
            request.name.to_string(),
            request.parent,
            level,
            attributes,
            exporter,
        );
        spans.insert(id, span);
        self.metrics.opened.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Seals a span, removes it from the arena and hands it to its exporter.
    ///
    /// Sealing is terminal: a second seal of the same span is a no-op and
    /// returns `false`. Export failures are counted and reported, never
    /// propagated. The sealed form stays readable through the bounded
    /// retained window.
    pub fn seal(&self, id: SpanId, outcome: SpanOutcome) -> bool {
        let (sealed, exporter) = {
            let mut spans = self.lock_spans();
            let Some(mut span) = spans.remove(&id) else {
                return false;
            };
            span.seal(outcome);
            (span.to_sealed(), span.exporter())
        };

        self.metrics.sealed.fetch_add(1, Ordering::Relaxed);
        match exporter.export(&sealed) {
            Ok(()) => {
                self.metrics.exported.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.export_errors.fetch_add(1, Ordering::Relaxed);
                eprintln!("span export error ({}): {e}", sealed.name);
            }
        }
        self.lock_retired().push(sealed);
        true
    }

    /// Seals every span still open, typically on cancellation, so trace
    /// trees never contain permanently-open spans.
    pub fn seal_open_spans(&self, outcome: SpanOutcome) -> usize {
        let open: Vec<SpanId> = {
            let spans = self.lock_spans();
            spans.keys().copied().collect()
        };
        let mut sealed = 0;
        for id in open {
            if self.seal(id, outcome) {
                sealed += 1;
            }
        }
        sealed
    }

    /// Runs a read-only closure against a span still open in the arena.
    pub fn with_span<R>(&self, id: SpanId, f: impl FnOnce(&Span) -> R) -> Option<R> {
        let spans = self.lock_spans();
        spans.get(&id).map(f)
    }

    pub fn name(&self, id: SpanId) -> Option<String> {
        if let Some(name) = self.with_span(id, |s| s.name().to_string()) {
            return Some(name);
        }
        self.lock_retired().spans.get(&id).map(|s| s.name.clone())
    }

    /// Attribute lookup; unknown span ids or keys return `None`.
    pub fn attribute(&self, id: SpanId, key: &str) -> Option<String> {
        if let Some(found) = self.with_span(id, |s| s.attribute(key).map(String::from)) {
            return found;
        }
        self.lock_retired()
            .spans
            .get(&id)
            .and_then(|s| s.attributes.get(key).cloned())
    }

    pub fn parent(&self, id: SpanId) -> Option<SpanId> {
        if let Some(parent) = self.with_span(id, Span::parent) {
            return parent;
        }
        self.lock_retired()
            .spans
            .get(&id)
            .and_then(|s| s.parent_span_id)
    }

    /// Wall-clock duration. `None` while the span is still open.
    pub fn duration(&self, id: SpanId) -> Option<Duration> {
        if let Some(duration) = self.with_span(id, Span::duration) {
            return duration;
        }
        self.lock_retired()
            .spans
            .get(&id)
            .map(|s| Duration::from_nanos(s.duration_nanos))
    }

    pub fn export_level(&self, id: SpanId) -> Option<i32> {
        if let Some(level) = self.with_span(id, Span::export_level) {
            return Some(level);
        }
        self.lock_retired().spans.get(&id).map(|s| s.export_level)
    }

    pub fn is_exportable(&self, id: SpanId) -> Option<bool> {
        self.export_level(id).map(|level| level > 0)
    }

    /// Number of spans currently open.
    pub fn open_count(&self) -> usize {
        self.lock_spans().len()
    }

    /// Number of sealed spans currently held in the read-back window.
    pub fn retained_count(&self) -> usize {
        self.lock_retired().spans.len()
    }

    pub fn metrics(&self) -> &Arc<TreeMetrics> {
        &self.metrics
    }

    fn lock_spans(&self) -> MutexGuard<'_, HashMap<SpanId, Span>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retired(&self) -> MutexGuard<'_, Retired> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{FailingExporter, TestExporter};
    use crate::span::ATTR_THREAD_END_ID;

    fn tree_with_test_exporter() -> (Arc<TestExporter>, ExecutionSpanTree) {
        let exporter = Arc::new(TestExporter::new());
        let tree = ExecutionSpanTree::new(exporter.clone() as Arc<dyn SpanExporter>);
        (exporter, tree)
    }

    fn request<'a>(
        name: &'a str,
        parent: Option<SpanId>,
        config: &'a SpanTreeConfig,
        customization: &'a SpanCustomization,
    ) -> SpanRequest<'a> {
        SpanRequest {
            name,
            parent,
            correlation_id: "corr-1",
            config,
            customization,
        }
    }

    #[test]
    fn fresh_span_has_start_thread_but_no_end_thread() {
        let (_, tree) = tree_with_test_exporter();
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let id = tree.open_span(&request("op", None, &config, &customization));

        assert!(tree.attribute(id, ATTR_THREAD_START_ID).is_some());
        assert!(tree.attribute(id, ATTR_THREAD_END_ID).is_none());
        assert_eq!(tree.attribute(id, ATTR_CORRELATION_ID).unwrap(), "corr-1");
        assert_eq!(tree.attribute(id, ATTR_ARTIFACT_ID).unwrap(), "flow-a");
        assert!(tree.duration(id).is_none());
    }

    #[test]
    fn sealed_span_gains_end_thread_and_unknown_keys_stay_absent() {
        let (exporter, tree) = tree_with_test_exporter();
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let id = tree.open_span(&request("op", None, &config, &customization));
        assert!(tree.seal(id, SpanOutcome::Ok));

        assert!(tree.attribute(id, ATTR_THREAD_END_ID).is_some());
        assert!(tree.attribute(id, "no.such.key").is_none());
        assert!(tree.duration(id).is_some());
        assert_eq!(exporter.exported_count(), 1);
    }

    #[test]
    fn double_seal_is_a_noop_and_exports_once() {
        let (exporter, tree) = tree_with_test_exporter();
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let id = tree.open_span(&request("op", None, &config, &customization));
        assert!(tree.seal(id, SpanOutcome::Ok));
        assert!(!tree.seal(id, SpanOutcome::Error));

        assert_eq!(exporter.exported_count(), 1);
        assert_eq!(exporter.all_spans()[0].outcome, SpanOutcome::Ok);
    }

    #[test]
    fn child_levels_follow_truncation_rule() {
        let (_, tree) = tree_with_test_exporter();
        let customization = SpanCustomization::new("flow-a", "flow");

        let parent_cfg = SpanTreeConfig::default().with_export_level(3);
        let parent = tree.open_span(&request("parent", None, &parent_cfg, &customization));
        assert_eq!(tree.export_level(parent).unwrap(), 3);

        let child_cfg = SpanTreeConfig::default().with_export_level(1);
        let child = tree.open_span(&request("child", Some(parent), &child_cfg, &customization));
        assert_eq!(tree.export_level(child).unwrap(), 1);
        assert_eq!(tree.is_exportable(child), Some(true));
        assert_eq!(tree.parent(child), Some(parent));

        let greedy_cfg = SpanTreeConfig::default().with_export_level(9);
        let greedy = tree.open_span(&request("greedy", Some(parent), &greedy_cfg, &customization));
        assert_eq!(tree.export_level(greedy).unwrap(), 2);
    }

    #[test]
    fn exhausted_budget_spans_are_measured_but_not_shipped() {
        let (exporter, tree) = tree_with_test_exporter();
        let customization = SpanCustomization::new("flow-a", "flow");

        let parent_cfg = SpanTreeConfig::default().with_export_level(0);
        let parent = tree.open_span(&request("parent", None, &parent_cfg, &customization));

        let child_cfg = SpanTreeConfig::default().with_export_level(-1);
        let child = tree.open_span(&request("child", Some(parent), &child_cfg, &customization));
        assert_eq!(tree.export_level(child).unwrap(), -1);
        assert_eq!(tree.is_exportable(child), Some(false));

        tree.seal(child, SpanOutcome::Ok);
        tree.seal(parent, SpanOutcome::Ok);

        // Both were timed and sealed, neither reached the real exporter.
        assert!(tree.duration(child).is_some());
        assert_eq!(exporter.exported_count(), 0);
        assert_eq!(tree.metrics().sealed(), 2);
        assert_eq!(tree.metrics().non_exportable(), 2);
    }

    #[test]
    fn seal_open_spans_sweeps_cancelled_executions() {
        let (exporter, tree) = tree_with_test_exporter();
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let a = tree.open_span(&request("a", None, &config, &customization));
        let b = tree.open_span(&request("b", Some(a), &config, &customization));
        tree.seal(b, SpanOutcome::Ok);

        assert_eq!(tree.open_count(), 1);
        assert_eq!(tree.seal_open_spans(SpanOutcome::Cancelled), 1);
        assert_eq!(tree.open_count(), 0);

        let outcomes: Vec<_> = exporter.all_spans().iter().map(|s| s.outcome).collect();
        assert!(outcomes.contains(&SpanOutcome::Ok));
        assert!(outcomes.contains(&SpanOutcome::Cancelled));
    }

    #[test]
    fn sealing_evicts_the_span_and_retention_is_bounded() {
        let exporter = Arc::new(TestExporter::new());
        let tree =
            ExecutionSpanTree::with_retention(exporter.clone() as Arc<dyn SpanExporter>, 4);
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let ids: Vec<SpanId> = (0..10)
            .map(|i| {
                let name = format!("op-{i}");
                let id = tree.open_span(&request(&name, None, &config, &customization));
                tree.seal(id, SpanOutcome::Ok);
                id
            })
            .collect();

        // The arena holds nothing once every span is sealed; read-back keeps
        // only the newest window while every span still reached the exporter.
        assert_eq!(tree.open_count(), 0);
        assert_eq!(tree.retained_count(), 4);
        assert_eq!(exporter.exported_count(), 10);
        assert!(tree.name(ids[0]).is_none());
        assert_eq!(tree.name(ids[9]).unwrap(), "op-9");
    }

    #[test]
    fn sealed_parent_budget_still_truncates_late_children() {
        let (_, tree) = tree_with_test_exporter();
        let customization = SpanCustomization::new("flow-a", "flow");

        let parent_cfg = SpanTreeConfig::default().with_export_level(3);
        let parent = tree.open_span(&request("parent", None, &parent_cfg, &customization));
        tree.seal(parent, SpanOutcome::Ok);

        let greedy_cfg = SpanTreeConfig::default().with_export_level(9);
        let child = tree.open_span(&request("child", Some(parent), &greedy_cfg, &customization));
        assert_eq!(tree.export_level(child).unwrap(), 2);
    }

    #[test]
    fn export_failure_is_isolated_and_counted() {
        let tree = ExecutionSpanTree::new(Arc::new(FailingExporter));
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let id = tree.open_span(&request("op", None, &config, &customization));
        assert!(tree.seal(id, SpanOutcome::Ok));

        assert_eq!(tree.metrics().sealed(), 1);
        assert_eq!(tree.metrics().exported(), 0);
        assert_eq!(tree.metrics().export_errors(), 1);
    }

    #[test]
    fn attribute_reads_are_pure() {
        let (_, tree) = tree_with_test_exporter();
        let config = SpanTreeConfig::default();
        let customization = SpanCustomization::new("flow-a", "flow");

        let id = tree.open_span(&request("op", None, &config, &customization));
        let first = tree.attribute(id, ATTR_CORRELATION_ID);
        let second = tree.attribute(id, ATTR_CORRELATION_ID);
        assert_eq!(first, second);
    }
}
