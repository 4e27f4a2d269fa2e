use kanban_core::AttemptId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of runs that are currently live, keyed by attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptRegistry {
    inner: Arc<Mutex<HashMap<AttemptId, CancellationToken>>>,
}

impl AttemptRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<AttemptId, CancellationToken>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fresh token, or returns `None` if the attempt is already live.
    pub fn register(&self, attempt_id: &AttemptId) -> Option<CancellationToken> {
        let mut guard = self.lock();
        if guard.contains_key(attempt_id) {
            return None;
        }
        let token = CancellationToken::new();
        guard.insert(attempt_id.clone(), token.clone());
        Some(token)
    }

    /// Cancels a live run. Returns whether one was found.
    pub fn cancel(&self, attempt_id: &AttemptId) -> bool {
        match self.lock().get(attempt_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every live run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let guard = self.lock();
        for token in guard.values() {
            token.cancel();
        }
        guard.len()
    }

    pub fn remove(&self, attempt_id: &AttemptId) {
        self.lock().remove(attempt_id);
    }

    pub fn contains(&self, attempt_id: &AttemptId) -> bool {
        self.lock().contains_key(attempt_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the registry entry when dropped, including on panic.
pub(crate) struct RegistryGuard {
    registry: AttemptRegistry,
    attempt_id: AttemptId,
}

impl RegistryGuard {
    pub(crate) fn new(registry: AttemptRegistry, attempt_id: AttemptId) -> Self {
        Self {
            registry,
            attempt_id,
        }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.attempt_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_exclusive_per_attempt() {
        let registry = AttemptRegistry::default();
        let id = AttemptId::new("A1");
        let token = registry.register(&id).expect("first register");
        assert!(registry.register(&id).is_none());
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_all_signals_every_live_run() {
        let registry = AttemptRegistry::default();
        let first = registry.register(&AttemptId::new("A1")).expect("A1");
        let second = registry.register(&AttemptId::new("A2")).expect("A2");
        assert_eq!(registry.cancel_all(), 2);
        assert!(first.is_cancelled() && second.is_cancelled());
    }

    #[test]
    fn guard_releases_entry_on_drop() {
        let registry = AttemptRegistry::default();
        let id = AttemptId::new("A1");
        registry.register(&id).expect("register");
        {
            let _guard = RegistryGuard::new(registry.clone(), id.clone());
            assert!(registry.contains(&id));
        }
        assert!(registry.is_empty());
        assert!(!registry.cancel(&id));
    }
}
