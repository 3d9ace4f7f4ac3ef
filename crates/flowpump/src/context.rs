//! Immutable, forkable bookkeeping of downstream-subscribed processors.
//!
//! Every mutation returns a new context derived from its parent through
//! structural sharing: a fork stores only its own delta plus an `Arc` link
//! to the ancestor chain. Forks are O(1), require no locking, and never
//! observe a sibling's additions.

use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug)]
struct Node {
    component: Arc<str>,
    count: usize,
    parent: Option<Arc<Node>>,
}

/// Tracks which components are attached downstream of a point in the
/// pipeline, threaded alongside each event.
#[derive(Debug, Clone, Default)]
pub struct SubscribedProcessorsContext {
    head: Option<Arc<Node>>,
    accumulate: bool,
}

impl SubscribedProcessorsContext {
    /// Empty context with component identities deduplicated on read.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty context in accumulate mode: identities are always appended,
    /// never deduplicated.
    pub fn accumulating() -> Self {
        Self {
            head: None,
            accumulate: true,
        }
    }

    /// Forks this context, recording one more subscribed processor.
    ///
    /// The receiver is untouched; the returned value shares the ancestor
    /// chain structurally.
    pub fn add_subscribed_processor(&self, component: impl Into<Arc<str>>) -> Self {
        let node = Node {
            component: component.into(),
            count: self.subscribed_processors_count() + 1,
            parent: self.head.clone(),
        };
        Self {
            head: Some(Arc::new(node)),
            accumulate: self.accumulate,
        }
    }

    /// Number of subscriptions recorded along this chain. Pure read.
    pub fn subscribed_processors_count(&self) -> usize {
        self.head.as_ref().map_or(0, |n| n.count)
    }

    /// Component identities in subscription order (oldest first). Pure read.
    ///
    /// Outside accumulate mode, repeated identities collapse to their first
    /// occurrence.
    pub fn subscribed_components(&self) -> Vec<Arc<str>> {
        let mut chain = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            chain.push(Arc::clone(&node.component));
            cursor = node.parent.as_deref();
        }
        chain.reverse();

        if self.accumulate {
            return chain;
        }
        let mut seen = HashSet::new();
        chain
            .into_iter()
            .filter(|c| seen.insert(Arc::clone(c)))
            .collect()
    }
}
