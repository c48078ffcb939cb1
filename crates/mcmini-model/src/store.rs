//! Versioned store of visible objects.
//!
//! Every visible object is an append-only history of immutable snapshots;
//! the current state is the last entry. Entries are stamped with the
//! index of the transition that produced them, which makes slicing the
//! store back to "the state after the first `i` transitions" an exact
//! filter rather than a reverse interpretation of each transition.

use crate::objects::VisibleObjectState;
use crate::{ModelError, ObjId, Tid};
use std::collections::{BTreeMap, HashMap};

/// How an object is found again after a fork or a replay: by the raw
/// address embedded in descriptors, or by thread id for thread shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKey {
    Addr(u64),
    Thread(Tid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryEntry {
    /// Index of the transition that recorded this state; `None` for
    /// states established before the first transition.
    depth: Option<usize>,
    state: VisibleObjectState,
}

/// One visible object: identity plus its full snapshot history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleObject {
    key: ObjectKey,
    /// Transition index that tracked the object; `None` for pre-run
    /// objects such as the main thread.
    birth: Option<usize>,
    history: Vec<HistoryEntry>,
}

impl VisibleObject {
    /// Current (most recent) state.
    pub fn current(&self) -> &VisibleObjectState {
        // History is never empty: construction seeds the initial state.
        &self.history[self.history.len() - 1]
            .state
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// A side effect performed on the store by one transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// A new object was tracked.
    Tracked(ObjId),
    /// A new state was recorded for an existing object.
    Recorded(ObjId),
}

/// The store itself. Object ids are dense and assigned in tracking
/// order; they are never reused within one store.
#[derive(Debug, Clone, Default)]
pub struct VisibleObjectStore {
    objects: Vec<VisibleObject>,
    by_addr: HashMap<u64, ObjId>,
    by_thread: BTreeMap<Tid, ObjId>,
    /// Transition index stamped onto effects while a `modify` runs.
    depth: Option<usize>,
    effects: Vec<Effect>,
}

impl VisibleObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording effects for the transition at stack index `depth`
    /// (`None` while setting up pre-run objects).
    pub fn begin_transition(&mut self, depth: Option<usize>) {
        self.depth = depth;
        self.effects.clear();
    }

    /// Drain the effects recorded since `begin_transition`.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Track a new visible object whose history starts at
    /// `initial_state`. Returns its id.
    pub fn track(&mut self, key: ObjectKey, initial_state: VisibleObjectState) -> ObjId {
        let id = self.objects.len();
        self.objects.push(VisibleObject {
            key,
            birth: self.depth,
            history: vec![HistoryEntry {
                depth: self.depth,
                state: initial_state,
            }],
        });
        match key {
            ObjectKey::Addr(addr) => {
                self.by_addr.insert(addr, id);
            }
            ObjectKey::Thread(tid) => {
                self.by_thread.insert(tid, id);
            }
        }
        self.effects.push(Effect::Tracked(id));
        id
    }

    /// Append `next_state` to the object's history.
    pub fn record(&mut self, id: ObjId, next_state: VisibleObjectState) -> Result<(), ModelError> {
        let object = self
            .objects
            .get_mut(id)
            .ok_or(ModelError::UnknownObject(id))?;
        object.history.push(HistoryEntry {
            depth: self.depth,
            state: next_state,
        });
        self.effects.push(Effect::Recorded(id));
        Ok(())
    }

    /// Current state of an object.
    pub fn current(&self, id: ObjId) -> Result<&VisibleObjectState, ModelError> {
        self.objects
            .get(id)
            .map(VisibleObject::current)
            .ok_or(ModelError::UnknownObject(id))
    }

    /// The object registered at a raw address, if any.
    pub fn object_at_addr(&self, addr: u64) -> Option<ObjId> {
        self.by_addr.get(&addr).copied()
    }

    /// The shadow object of a thread, if any.
    pub fn thread_object(&self, tid: Tid) -> Option<ObjId> {
        self.by_thread.get(&tid).copied()
    }

    /// All thread ids with a shadow object, ascending.
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.by_thread.keys().copied().collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjId, &VisibleObject)> {
        self.objects.iter().enumerate()
    }

    /// Read-only view for enabledness checks.
    pub fn snapshot(&self) -> StoreView<'_> {
        StoreView { store: self }
    }

    /// Undo one transition's effects, in reverse order. Tracked objects
    /// must still be the most recently tracked ones.
    pub fn undo(&mut self, effects: &[Effect]) -> Result<(), ModelError> {
        for effect in effects.iter().rev() {
            match *effect {
                Effect::Recorded(id) => {
                    let object = self
                        .objects
                        .get_mut(id)
                        .ok_or(ModelError::UnknownObject(id))?;
                    if object.history.len() < 2 {
                        return Err(ModelError::InvalidState(
                            "undo would empty an object history",
                        ));
                    }
                    object.history.pop();
                }
                Effect::Tracked(id) => {
                    if id + 1 != self.objects.len() {
                        return Err(ModelError::InvalidState(
                            "undo of a track that is not the newest object",
                        ));
                    }
                    let object = self.objects.pop().ok_or(ModelError::UnknownObject(id))?;
                    match object.key {
                        ObjectKey::Addr(addr) => {
                            self.by_addr.remove(&addr);
                        }
                        ObjectKey::Thread(tid) => {
                            self.by_thread.remove(&tid);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce the store as it stood after the first `i` transitions:
    /// objects tracked by transitions `< i` (and pre-run objects), each
    /// sliced to the states recorded before `i`. Ids stay dense and in
    /// the original order.
    pub fn consume_into_subsequence(&self, i: usize) -> VisibleObjectStore {
        let mut sliced = VisibleObjectStore::new();
        for object in &self.objects {
            if object.birth.map_or(false, |b| b >= i) {
                continue;
            }
            let history: Vec<HistoryEntry> = object
                .history
                .iter()
                .filter(|entry| entry.depth.map_or(true, |d| d < i))
                .cloned()
                .collect();
            let id = sliced.objects.len();
            match object.key {
                ObjectKey::Addr(addr) => {
                    sliced.by_addr.insert(addr, id);
                }
                ObjectKey::Thread(tid) => {
                    sliced.by_thread.insert(tid, id);
                }
            }
            sliced.objects.push(VisibleObject {
                key: object.key,
                birth: object.birth,
                history,
            });
        }
        sliced
    }
}

/// Two stores are equal when they hold the same objects with the same
/// histories; transient effect bookkeeping is not part of identity.
impl PartialEq for VisibleObjectStore {
    fn eq(&self, other: &Self) -> bool {
        self.objects == other.objects
    }
}

impl Eq for VisibleObjectStore {}

/// Immutable view over current object states.
pub struct StoreView<'a> {
    store: &'a VisibleObjectStore,
}

impl StoreView<'_> {
    pub fn current(&self, id: ObjId) -> Result<&VisibleObjectState, ModelError> {
        self.store.current(id)
    }

    pub fn state_at_addr(&self, addr: u64) -> Option<&VisibleObjectState> {
        self.store
            .object_at_addr(addr)
            .and_then(|id| self.store.current(id).ok())
    }

    pub fn thread_state(&self, tid: Tid) -> Option<&VisibleObjectState> {
        self.store
            .thread_object(tid)
            .and_then(|id| self.store.current(id).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ThreadLifecycle, VisibleObjectState};

    #[test]
    fn track_and_record() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        let m = store.track(ObjectKey::Addr(0x100), VisibleObjectState::unlocked_mutex());
        assert_eq!(m, 0);
        assert_eq!(store.object_at_addr(0x100), Some(0));

        store.begin_transition(Some(1));
        store.record(m, VisibleObjectState::locked_mutex(1)).unwrap();
        assert_eq!(
            store.current(m).unwrap(),
            &VisibleObjectState::locked_mutex(1)
        );
    }

    #[test]
    fn record_unknown_object_fails() {
        let mut store = VisibleObjectStore::new();
        let err = store.record(7, VisibleObjectState::condvar()).unwrap_err();
        assert!(matches!(err, ModelError::UnknownObject(7)));
    }

    #[test]
    fn effects_are_ordered() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        let a = store.track(ObjectKey::Addr(1), VisibleObjectState::semaphore(0));
        store.record(a, VisibleObjectState::semaphore(1)).unwrap();
        assert_eq!(
            store.take_effects(),
            vec![Effect::Tracked(a), Effect::Recorded(a)]
        );
    }

    #[test]
    fn undo_restores_previous_state() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(None);
        let t = store.track(
            ObjectKey::Thread(0),
            VisibleObjectState::thread(ThreadLifecycle::Embryo, 0),
        );
        store.take_effects();

        store.begin_transition(Some(0));
        store
            .record(t, VisibleObjectState::thread(ThreadLifecycle::Alive, 0))
            .unwrap();
        let m = store.track(ObjectKey::Addr(0x42), VisibleObjectState::unlocked_mutex());
        let effects = store.take_effects();

        store.undo(&effects).unwrap();
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.object_at_addr(0x42), None);
        assert_eq!(
            store.current(t).unwrap().thread_lifecycle(),
            Some(ThreadLifecycle::Embryo)
        );
        let _ = m;
    }

    #[test]
    fn subsequence_slices_histories_and_drops_young_objects() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(None);
        let t = store.track(
            ObjectKey::Thread(0),
            VisibleObjectState::thread(ThreadLifecycle::Alive, 0),
        );

        store.begin_transition(Some(0));
        let m = store.track(ObjectKey::Addr(0x10), VisibleObjectState::unlocked_mutex());

        store.begin_transition(Some(1));
        store.record(m, VisibleObjectState::locked_mutex(0)).unwrap();

        store.begin_transition(Some(2));
        let s = store.track(ObjectKey::Addr(0x20), VisibleObjectState::semaphore(3));

        // After transition 1: thread + mutex exist, mutex still locked.
        let at2 = store.consume_into_subsequence(2);
        assert_eq!(at2.object_count(), 2);
        assert_eq!(
            at2.current(m).unwrap(),
            &VisibleObjectState::locked_mutex(0)
        );
        assert_eq!(at2.object_at_addr(0x20), None);

        // After transition 0: mutex exists but is still unlocked.
        let at1 = store.consume_into_subsequence(1);
        assert_eq!(at1.object_count(), 2);
        assert_eq!(at1.current(m).unwrap(), &VisibleObjectState::unlocked_mutex());

        // Before anything ran: only the pre-run thread object.
        let at0 = store.consume_into_subsequence(0);
        assert_eq!(at0.object_count(), 1);
        assert_eq!(at0.thread_object(0), Some(t));
        let _ = s;
    }

    #[test]
    fn subsequence_keeps_ids_dense_and_ordered() {
        let mut store = VisibleObjectStore::new();
        store.begin_transition(Some(0));
        store.track(ObjectKey::Addr(1), VisibleObjectState::condvar());
        store.begin_transition(Some(1));
        store.track(ObjectKey::Addr(2), VisibleObjectState::condvar());
        store.begin_transition(Some(2));
        store.track(ObjectKey::Addr(3), VisibleObjectState::condvar());

        let sliced = store.consume_into_subsequence(2);
        assert_eq!(sliced.object_count(), 2);
        assert_eq!(sliced.object_at_addr(1), Some(0));
        assert_eq!(sliced.object_at_addr(2), Some(1));
    }
}
