//! The unit of work flowing through a pipeline.

use crate::context::SubscribedProcessorsContext;
use flowpump_trace::SpanId;
use serde_json::Value;
use std::sync::Arc;

/// One unit of work: an opaque payload plus correlation identity, trace
/// context and subscribed-processors bookkeeping.
///
/// The engine never mutates the payload; every "mutator" returns a derived
/// event sharing the payload behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Event {
    correlation_id: Arc<str>,
    payload: Arc<Value>,
    current_span: Option<SpanId>,
    subscribed: SubscribedProcessorsContext,
}

impl Event {
    pub fn new(correlation_id: impl Into<Arc<str>>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: Arc::new(payload),
            current_span: None,
            subscribed: SubscribedProcessorsContext::new(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The span currently enclosing this event's execution, if tracing is
    /// active. Used as the parent when the next component opens its span.
    pub fn current_span(&self) -> Option<SpanId> {
        self.current_span
    }

    pub fn subscribed_processors(&self) -> &SubscribedProcessorsContext {
        &self.subscribed
    }

    /// Derives an event carrying a new payload.
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload: Arc::new(payload),
            ..self.clone()
        }
    }

    /// Derives an event whose trace context points at `span`.
    pub fn with_current_span(&self, span: SpanId) -> Self {
        Self {
            current_span: Some(span),
            ..self.clone()
        }
    }

    /// Derives an event carrying a forked subscribed-processors context.
    pub fn with_subscribed_context(&self, subscribed: SubscribedProcessorsContext) -> Self {
        Self {
            subscribed,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derivations_share_payload_and_leave_original_untouched() {
        let event = Event::new("corr-1", json!({"k": 1}));
        let traced = event.with_current_span(SpanId(7));

        assert!(event.current_span().is_none());
        assert_eq!(traced.current_span(), Some(SpanId(7)));
        assert_eq!(traced.correlation_id(), "corr-1");
        assert!(Arc::ptr_eq(&event.payload, &traced.payload));
    }

    #[test]
    fn subscribed_context_fork_rides_along() {
        let event = Event::new("corr-1", Value::Null);
        let forked = event.with_subscribed_context(
            event.subscribed_processors().add_subscribed_processor("p1"),
        );

        assert_eq!(event.subscribed_processors().subscribed_processors_count(), 0);
        assert_eq!(forked.subscribed_processors().subscribed_processors_count(), 1);
    }
}
