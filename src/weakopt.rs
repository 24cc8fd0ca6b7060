use std::fmt;
use std::sync::{Arc, Weak};

use crate::DebugLiteral;

/// A possibly-absent weak reference.
///
/// Back-references in the host/queue/peer/connection hierarchy are never
/// ownership edges; they are modeled with this wrapper so a dangling parent
/// simply reads as `None`.
pub(crate) struct WeakOpt<T>(Option<Weak<T>>);

impl<T> WeakOpt<T> {
    pub(crate) fn none() -> Self {
        Self(None)
    }

    pub(crate) fn downgrade(arc: &Arc<T>) -> Self {
        Self(Some(Arc::downgrade(arc)))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref().and_then(|weak| weak.upgrade())
    }
}

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = if self.0.is_some() { "Some(...)" } else { "None" };
        f.debug_tuple("WeakOpt").field(&DebugLiteral(inner)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_follows_the_owner() {
        let owner = Arc::new(7_u32);
        let weak = WeakOpt::downgrade(&owner);
        assert_eq!(weak.upgrade().as_deref(), Some(&7));

        drop(owner);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn empty_handle_never_upgrades() {
        assert!(WeakOpt::<u32>::none().upgrade().is_none());
    }

    #[test]
    fn debug_hides_the_target() {
        let owner = Arc::new(1_u8);
        assert_eq!(
            format!("{:?}", WeakOpt::downgrade(&owner)),
            "WeakOpt(Some(...))"
        );
        assert_eq!(format!("{:?}", WeakOpt::<u8>::none()), "WeakOpt(None)");
    }
}
