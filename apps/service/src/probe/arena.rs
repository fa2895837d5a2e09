use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::ProbeState;
use crate::catalogue::TestSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(u64);

impl ProbeId {
    #[cfg(test)]
    pub(crate) fn for_tests(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Pending,
    Active,
    Done,
    Failed,
}

impl QueueKind {
    const ALL: [QueueKind; 4] = [QueueKind::Pending, QueueKind::Active, QueueKind::Done, QueueKind::Failed];

    fn index(self) -> usize {
        match self {
            QueueKind::Pending => 0,
            QueueKind::Active => 1,
            QueueKind::Done => 2,
            QueueKind::Failed => 3,
        }
    }
}

struct Slot {
    state: ProbeState,
    queue: QueueKind,
}

/// Owns every probe of a sweep. Each probe sits in exactly one queue and
/// changes queue only through [`ProbeArena::move_to`].
#[derive(Default)]
pub struct ProbeArena {
    next_id: u64,
    slots: HashMap<ProbeId, Slot>,
    queues: [BTreeSet<ProbeId>; 4],
}

impl ProbeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe for `spec` to the pending queue.
    pub fn insert(&mut self, spec: Arc<TestSpec>) -> ProbeId {
        let id = ProbeId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, Slot { state: ProbeState::new(id, spec), queue: QueueKind::Pending });
        self.queues[QueueKind::Pending.index()].insert(id);
        id
    }

    pub fn get(&self, id: ProbeId) -> Option<&ProbeState> {
        self.slots.get(&id).map(|slot| &slot.state)
    }

    pub fn get_mut(&mut self, id: ProbeId) -> Option<&mut ProbeState> {
        self.slots.get_mut(&id).map(|slot| &mut slot.state)
    }

    pub fn queue_of(&self, id: ProbeId) -> Option<QueueKind> {
        self.slots.get(&id).map(|slot| slot.queue)
    }

    /// Returns false when the probe is unknown.
    pub fn move_to(&mut self, id: ProbeId, queue: QueueKind) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        self.queues[slot.queue.index()].remove(&id);
        self.queues[queue.index()].insert(id);
        slot.queue = queue;
        true
    }

    pub fn len(&self, queue: QueueKind) -> usize {
        self.queues[queue.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Ids in `queue`, oldest first.
    pub fn ids(&self, queue: QueueKind) -> Vec<ProbeId> {
        self.queues[queue.index()].iter().copied().collect()
    }

    pub fn first(&self, queue: QueueKind) -> Option<ProbeId> {
        self.queues[queue.index()].first().copied()
    }

    /// Remove and return every finished probe.
    pub fn drain_finished(&mut self) -> Vec<ProbeState> {
        let finished: Vec<ProbeId> = [QueueKind::Done, QueueKind::Failed]
            .into_iter()
            .flat_map(|queue| std::mem::take(&mut self.queues[queue.index()]))
            .collect();
        let mut states: Vec<ProbeState> =
            finished.into_iter().filter_map(|id| self.slots.remove(&id)).map(|slot| slot.state).collect();
        states.sort_by_key(|state| state.id);
        states
    }

    /// Drop every pending and active probe without a result.
    pub fn discard_unfinished(&mut self) -> usize {
        let unfinished: Vec<ProbeId> = [QueueKind::Pending, QueueKind::Active]
            .into_iter()
            .flat_map(|queue| std::mem::take(&mut self.queues[queue.index()]))
            .collect();
        unfinished.iter().filter(|id| self.slots.remove(id).is_some()).count()
    }

    /// True when the membership sets and the slot tags agree.
    pub fn is_consistent(&self) -> bool {
        let members: usize = self.queues.iter().map(BTreeSet::len).sum();
        members == self.slots.len()
            && QueueKind::ALL.iter().all(|queue| {
                self.queues[queue.index()]
                    .iter()
                    .all(|id| self.slots.get(id).is_some_and(|slot| slot.queue == *queue))
            })
    }
}
