//! Readiness notification.
//!
//! A caller that got [`Pending`](crate::Progress::Pending) registers its
//! handle and parks; when an applied event could unblock that handle, the
//! handle lands in the ready-set. There is no payload: the woken caller
//! re-issues the original read or write to discover what changed.

use std::collections::BTreeSet;

use crate::ns::Handle;

/// Coalescing set of handles whose endpoints may have progressed.
///
/// Signaling the same handle any number of times between polls produces a
/// single wakeup. Closing a handle discards it, so nothing is ever delivered
/// for a handle that no longer exists.
#[derive(Debug, Default)]
pub struct ReadySet {
    ready: BTreeSet<Handle>,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handle ready. Idempotent.
    pub fn push(&mut self, handle: Handle) {
        self.ready.insert(handle);
    }

    /// Drop a handle that is being closed.
    pub fn discard(&mut self, handle: Handle) {
        self.ready.remove(&handle);
    }

    /// Drain every pending wakeup, in handle order.
    pub fn take(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.ready).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns::Handle;

    #[test]
    fn coalesces_and_discards() {
        let mut set = ReadySet::new();
        let a = Handle::for_tests(1, 1);
        let b = Handle::for_tests(2, 2);
        set.push(a);
        set.push(a);
        set.push(b);
        set.discard(b);
        assert_eq!(set.take(), vec![a]);
        assert!(set.is_empty());
    }
}
