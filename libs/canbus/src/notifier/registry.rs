//! Which notifier owns the receive loop of each bus

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::NotifierShared;
use crate::bus::BusId;

pub(crate) enum Claim {
    /// The caller now owns the bus and its receive loop is running
    Owner,
    /// Another live notifier already reads the bus
    Shared(Arc<NotifierShared>),
}

/// Registry shared by cooperating notifiers
///
/// At most one notifier per bus runs a receive loop; the others forward their
/// listeners to it. Create one registry per application (or test) and hand
/// clones to every [`Notifier`](super::Notifier).
#[derive(Clone, Default)]
pub struct NotificationRegistry {
    entries: Arc<Mutex<HashMap<BusId, Weak<NotifierShared>>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically decide who reads `bus`
    ///
    /// When the candidate becomes the owner, `start` runs before the registry
    /// is unlocked so no other notifier can observe an owner without a loop.
    pub(crate) fn claim<F>(&self, bus: BusId, candidate: &Arc<NotifierShared>, start: F) -> Claim
    where
        F: FnOnce(),
    {
        let mut entries = self.entries.lock();
        if let Some(owner) = entries.get(&bus).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&owner, candidate) && owner.serves(bus) {
                return Claim::Shared(owner);
            }
        }
        entries.insert(bus, Arc::downgrade(candidate));
        start();
        Claim::Owner
    }

    /// Live owner of `bus`, if any
    pub(crate) fn owner(&self, bus: BusId) -> Option<Arc<NotifierShared>> {
        self.entries.lock().get(&bus).and_then(Weak::upgrade)
    }

    /// Drop the entry for `bus` if `notifier` still owns it
    pub(crate) fn release(&self, bus: BusId, notifier: &NotifierShared) {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(&bus)
            .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), notifier));
        if owned {
            entries.remove(&bus);
        }
    }

    pub fn is_registered(&self, bus: BusId) -> bool {
        self.owner(bus).is_some()
    }

    /// Buses with a live owner
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|owner| owner.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget entries whose notifier has been dropped
    pub fn purge(&self) {
        self.entries.lock().retain(|_, owner| owner.strong_count() > 0);
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("buses", &self.len())
            .finish()
    }
}
