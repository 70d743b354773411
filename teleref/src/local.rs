use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::RemoteRef;
use crate::reference::{Session, WeakRef};

/// Canonical handles for objects living in the debugger itself.
///
/// Keyed by the object's allocation. A handle keeps its object alive, so a
/// key cannot be reused by another object while the handle exists.
#[derive(Default)]
pub(crate) struct LocalReferenceMap {
    entries: HashMap<usize, WeakRef, RandomState>,
}

impl LocalReferenceMap {
    pub(crate) fn get_or_insert(
        &mut self,
        session: &Session,
        object: Arc<dyn Any + Send + Sync>,
    ) -> RemoteRef {
        let key = Arc::as_ptr(&object) as *const () as usize;
        if let Some(existing) = self.entries.get(&key).and_then(RemoteRef::upgrade)
        {
            return existing;
        }
        let handle = RemoteRef::local(session, object);
        self.entries.insert(key, handle.downgrade());
        handle
    }

    /// Drop entries whose handle has been reclaimed. Returns how many.
    pub(crate) fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    pub(crate) fn live_handles(&self) -> Vec<RemoteRef> {
        self.entries.values().filter_map(RemoteRef::upgrade).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectStatus;

    #[test]
    fn same_object_yields_same_handle() {
        let session = Session::new();
        let mut map = LocalReferenceMap::default();
        let object: Arc<dyn Any + Send + Sync> = Arc::new(String::from("x"));

        let a = map.get_or_insert(&session, Arc::clone(&object));
        let b = map.get_or_insert(&session, Arc::clone(&object));
        assert_eq!(a, b);
        assert!(a.is_local());
        assert_eq!(a.status(), ObjectStatus::Live);

        let other = map.get_or_insert(&session, Arc::new(String::from("x")));
        assert_ne!(a, other);
    }

    #[test]
    fn sweep_drops_reclaimed_handles_only() {
        let session = Session::new();
        let mut map = LocalReferenceMap::default();
        let kept = map.get_or_insert(&session, Arc::new(1_u8));
        drop(map.get_or_insert(&session, Arc::new(2_u8)));

        assert_eq!(map.sweep(), 1);
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.live_handles(), vec![kept]);
    }

    #[test]
    fn handle_exposes_wrapped_object() {
        let session = Session::new();
        let mut map = LocalReferenceMap::default();
        let handle = map.get_or_insert(&session, Arc::new(42_u64));
        let object = handle.local_object().expect("local");
        assert_eq!(object.downcast_ref::<u64>(), Some(&42));
    }
}
