//! Per-dispatch cancellation signals.
//!
//! Each dispatch id maps to a [`CancellationToken`]. The external `cancel`
//! call is the only writer; every layer loop working on the dispatch reads
//! it before scheduling a node. Nested dispatches get a child of their
//! parent's token, so cancelling a parent reaches its whole hierarchy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strata_core::DispatchId;
use tokio_util::sync::CancellationToken;

/// Process-wide registry of cancellation signals keyed by dispatch id.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<DispatchId, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for a dispatch, creating it if needed.
    pub fn register(&self, dispatch_id: &DispatchId) -> CancellationToken {
        self.lock()
            .entry(dispatch_id.clone())
            .or_default()
            .clone()
    }

    /// Returns the token for a nested dispatch, derived from its parent's.
    ///
    /// A cancel recorded for the nested id before registration is kept.
    pub fn register_nested(&self, parent: &DispatchId, dispatch_id: &DispatchId) -> CancellationToken {
        let mut tokens = self.lock();
        let parent_token = tokens.entry(parent.clone()).or_default().clone();
        let token = parent_token.child_token();
        if tokens
            .get(dispatch_id)
            .is_some_and(CancellationToken::is_cancelled)
        {
            token.cancel();
        }
        tokens.insert(dispatch_id.clone(), token.clone());
        token
    }

    /// Sets the cancellation signal for a dispatch.
    ///
    /// Cancelling an id that has not started yet is recorded, so the run sees
    /// the signal as soon as it registers.
    pub fn cancel(&self, dispatch_id: &DispatchId) {
        self.lock()
            .entry(dispatch_id.clone())
            .or_default()
            .cancel();
    }

    /// Returns true if the signal is set for the dispatch.
    #[must_use]
    pub fn is_cancelled(&self, dispatch_id: &DispatchId) -> bool {
        self.lock()
            .get(dispatch_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Drops the signals of a dispatch and everything nested below it.
    pub fn release(&self, dispatch_id: &DispatchId) {
        self.lock().retain(|id, _| !id.is_within(dispatch_id));
    }

    /// Returns the number of dispatches holding a signal.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DispatchId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_registered_token() {
        let registry = CancellationRegistry::new();
        let id = DispatchId::new();
        let token = registry.register(&id);
        assert!(!token.is_cancelled());

        registry.cancel(&id);
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled(&id));
    }

    #[test]
    fn cancel_before_register_is_kept() {
        let registry = CancellationRegistry::new();
        let id = DispatchId::new();
        registry.cancel(&id);
        assert!(registry.register(&id).is_cancelled());
    }

    #[test]
    fn parent_cancel_reaches_nested() {
        let registry = CancellationRegistry::new();
        let parent = DispatchId::new();
        let nested_id = parent.nested(2);
        let nested = registry.register_nested(&parent, &nested_id);

        registry.cancel(&parent);
        assert!(nested.is_cancelled());
        assert!(registry.is_cancelled(&nested_id));
    }

    #[test]
    fn nested_cancel_does_not_reach_parent() {
        let registry = CancellationRegistry::new();
        let parent = DispatchId::new();
        let nested_id = parent.nested(0);
        registry.register_nested(&parent, &nested_id);

        registry.cancel(&nested_id);
        assert!(registry.is_cancelled(&nested_id));
        assert!(!registry.is_cancelled(&parent));
    }

    #[test]
    fn release_drops_hierarchy() {
        let registry = CancellationRegistry::new();
        let parent = DispatchId::new();
        let other = DispatchId::new();
        registry.register_nested(&parent, &parent.nested(1));
        registry.cancel(&other);

        registry.release(&parent);
        assert_eq!(registry.lock().len(), 1);
        assert!(registry.is_cancelled(&other));
    }
}
