//! Grace-period reclamation of retired groups.
//!
//! Fast-path readers load a group from its slot through `arc_swap` and may
//! keep using it after a writer has unlinked it. When a writer swaps a
//! slot, `arc_swap` converts every outstanding reader guard on the old
//! value into a counted reference, so a retired group whose strong count
//! has dropped back to the reclaimer's own reference has no reader left
//! inside its critical section. Only then do the deferred frees run:
//! the slot goes back to the allocator and hardware objects are released.

use std::sync::Arc;

use crate::group::NextHopGroup;

/// Why a group was retired, and so what freeing it involves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retirement {
    /// Unlinked from the table. The slot is held back from the allocator
    /// until reclaim.
    Slot(u32),
    /// Replaced in place by a copy-on-write successor. The slot stays live.
    Superseded,
}

/// A retired group waiting for its grace period to end.
#[derive(Debug)]
pub(crate) struct Retired {
    pub(crate) group: Arc<NextHopGroup>,
    pub(crate) kind: Retirement,
}

impl Retired {
    fn is_quiescent(&self) -> bool {
        Arc::strong_count(&self.group) == 1
    }
}

/// Writer-side list of retired groups. Lives under the table's writer lock.
#[derive(Debug, Default)]
pub(crate) struct Reclaimer {
    retired: Vec<Retired>,
}

impl Reclaimer {
    /// Queue `group` for freeing once no reader holds it.
    pub(crate) fn retire(&mut self, group: Arc<NextHopGroup>, kind: Retirement) {
        self.retired.push(Retired { group, kind });
    }

    /// Hand every quiescent retired group to `free`, keeping the rest.
    /// Returns how many were freed.
    pub(crate) fn collect(&mut self, mut free: impl FnMut(Retired)) -> usize {
        if self.retired.is_empty() {
            return 0;
        }

        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(Retired::is_quiescent);
        self.retired = waiting;

        let freed = ready.len();
        for retired in ready {
            free(retired);
        }
        freed
    }

    pub(crate) fn pending(&self) -> usize {
        self.retired.len()
    }
}
