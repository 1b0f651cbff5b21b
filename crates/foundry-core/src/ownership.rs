use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

/// Ids of work this process currently owns (running agents, in-flight jobs).
///
/// The persisted tables say *what* state a row is in; this registry says
/// whether a live owner exists for it in this process. Recovery treats a
/// transient row without an owner as orphaned.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    owned: Mutex<HashSet<Uuid>>,
}

impl OwnershipRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim ownership. Returns `false` if it was already owned.
    pub fn acquire(&self, id: Uuid) -> bool {
        self.owned.lock().insert(id)
    }

    /// Drop ownership. Returns `false` if it was not owned.
    pub fn release(&self, id: Uuid) -> bool {
        self.owned.lock().remove(&id)
    }

    /// Whether `id` is owned here.
    pub fn owns(&self, id: Uuid) -> bool {
        self.owned.lock().contains(&id)
    }

    /// Number of owned ids.
    pub fn len(&self) -> usize {
        self.owned.lock().len()
    }

    /// Whether nothing is owned.
    pub fn is_empty(&self) -> bool {
        self.owned.lock().is_empty()
    }

    /// Copy of the owned ids, in no particular order.
    pub fn snapshot(&self) -> Vec<Uuid> {
        self.owned.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let registry = OwnershipRegistry::new();
        let id = Uuid::new_v4();
        assert!(registry.acquire(id));
        assert!(!registry.acquire(id));
        assert!(registry.owns(id));
        assert_eq!(registry.len(), 1);
        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert!(registry.is_empty());
    }
}
