//! The state sequence: transition stack, state stack, pending next-table.
//!
//! The sequence is the single source of truth the exploration engine
//! drives. Applying a transition appends to the object store and both
//! stacks; `reflect_at` restores the configuration "just after the first
//! `k` transitions executed" for backtracking, rebuilding the store
//! either by undoing recorded effects or, when an irreversible transition
//! sits in the discarded suffix, by slicing object histories.

use crate::clock::ClockVector;
use crate::config::CheckerConfig;
use crate::objects::ThreadLifecycle;
use crate::store::{ObjectKey, VisibleObjectStore};
use crate::transitions::{ApplyStatus, Transition, TransitionKind};
use crate::{ModelError, Tid, TID_MAIN};
use mcmini_protocol::WireOp;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One executed transition with its happens-before clock and the store
/// effects it produced.
#[derive(Debug, Clone)]
pub struct ExecutedTransition {
    pub transition: Transition,
    pub clock: ClockVector,
    effects: Vec<crate::store::Effect>,
}

/// Exploration bookkeeping for the state *before* a given transition.
#[derive(Debug, Clone)]
pub struct StateStackItem {
    pub backtrack_set: BTreeSet<Tid>,
    pub done_set: BTreeSet<Tid>,
    pub sleep_set: BTreeSet<Tid>,
    /// Threads whose pending transition was enabled in this state.
    pub enabled: BTreeSet<Tid>,
    pub clock_vector: ClockVector,
    pub revertible: bool,
}

impl StateStackItem {
    fn fresh(clock_vector: ClockVector, revertible: bool) -> Self {
        Self {
            backtrack_set: BTreeSet::new(),
            done_set: BTreeSet::new(),
            sleep_set: BTreeSet::new(),
            enabled: BTreeSet::new(),
            clock_vector,
            revertible,
        }
    }
}

/// Per-thread execution accounting.
#[derive(Debug, Clone)]
pub struct ThreadData {
    pub handle: u64,
    /// Transitions executed that count against the depth cap.
    pub executed_depth: u64,
    /// Countable transitions since the last progress goal.
    pub steps_since_goal: u64,
    /// Stack index of the most recent progress goal.
    pub last_goal_index: Option<usize>,
    pub in_goal_section: bool,
    /// Clock of this thread's most recent transition.
    pub clock: ClockVector,
}

impl ThreadData {
    fn new(handle: u64) -> Self {
        Self {
            handle,
            executed_depth: 0,
            steps_since_goal: 0,
            last_goal_index: None,
            in_goal_section: false,
            clock: ClockVector::zero(),
        }
    }
}

/// The model of the running program plus all DPOR bookkeeping.
#[derive(Debug, Clone)]
pub struct StateSequence {
    config: CheckerConfig,
    store: VisibleObjectStore,
    transitions: Vec<ExecutedTransition>,
    states: Vec<StateStackItem>,
    pending: BTreeMap<Tid, Transition>,
    threads: Vec<ThreadData>,
    handles: HashMap<u64, Tid>,
    /// Sorted stack of state indices reached by an irreversible
    /// transition.
    irreversible: Vec<usize>,
}

impl StateSequence {
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            store: VisibleObjectStore::new(),
            transitions: Vec::new(),
            states: Vec::new(),
            pending: BTreeMap::new(),
            threads: Vec::new(),
            handles: HashMap::new(),
            irreversible: Vec::new(),
        }
    }

    /// Register the main thread and push the initial state.
    pub fn start(&mut self, main_handle: u64) {
        self.store.begin_transition(None);
        self.store.track(
            ObjectKey::Thread(TID_MAIN),
            crate::objects::VisibleObjectState::thread(ThreadLifecycle::Embryo, main_handle),
        );
        self.store.take_effects();
        self.threads.push(ThreadData::new(main_handle));
        self.handles.insert(main_handle, TID_MAIN);
        self.pending
            .insert(TID_MAIN, Transition::new(TID_MAIN, TransitionKind::ThreadStart));

        let enabled = self.enabled_threads();
        let mut item = StateStackItem::fresh(ClockVector::zero(), true);
        if let Some(&first) = enabled.iter().next() {
            item.backtrack_set.insert(first);
        }
        item.enabled = enabled;
        self.states.push(item);
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn store(&self) -> &VisibleObjectStore {
        &self.store
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_at(&self, i: usize) -> Option<&Transition> {
        self.transitions.get(i).map(|et| &et.transition)
    }

    pub fn executor_at(&self, i: usize) -> Option<Tid> {
        self.transitions.get(i).map(|et| et.transition.executor)
    }

    pub fn state_item(&self, i: usize) -> Option<&StateStackItem> {
        self.states.get(i)
    }

    pub fn pending_transition(&self, tid: Tid) -> Option<&Transition> {
        self.pending.get(&tid)
    }

    pub fn pending_table(&self) -> impl Iterator<Item = (Tid, &Transition)> {
        self.pending.iter().map(|(&tid, t)| (tid, t))
    }

    pub fn thread_data(&self, tid: Tid) -> Option<&ThreadData> {
        self.threads.get(tid as usize)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    // ── Enabledness ────────────────────────────────────────────────

    /// True enabledness, straight from the transition algebra.
    pub fn transition_enabled(&self, t: &Transition) -> bool {
        t.enabled_in(&self.store.snapshot())
    }

    /// Enabledness as the scheduler sees it: a thread past its
    /// execution-depth cap has its next transition artificially
    /// disabled.
    pub fn transition_schedulable(&self, t: &Transition) -> bool {
        if !self.transition_enabled(t) {
            return false;
        }
        match self.config.max_thread_execution_depth {
            Some(cap) if t.counts_against_depth() => self
                .threads
                .get(t.executor as usize)
                .map_or(true, |td| td.executed_depth < cap),
            _ => true,
        }
    }

    /// Threads whose pending transition is schedulable, ascending.
    pub fn enabled_threads(&self) -> BTreeSet<Tid> {
        self.pending
            .iter()
            .filter(|(_, t)| self.transition_schedulable(t))
            .map(|(&tid, _)| tid)
            .collect()
    }

    /// The schedulable pending transition with the lowest thread id.
    pub fn first_enabled_pending(&self) -> Option<Transition> {
        self.pending
            .values()
            .find(|t| self.transition_schedulable(t))
            .cloned()
    }

    // ── Applying transitions ───────────────────────────────────────

    /// Execute `tid`'s pending transition and install the descriptor the
    /// runner parked on next (absent only for thread-ending steps).
    pub fn execute_pending(&mut self, tid: Tid, next: Option<WireOp>) -> Result<(), ModelError> {
        let t = self
            .pending
            .get(&tid)
            .cloned()
            .ok_or(ModelError::NoPending(tid))?;
        let ends = t.ends_thread();
        self.apply(t)?;
        match (ends, next) {
            (false, Some(op)) => {
                let nt = Transition::from_wire(tid, op, &self.handles)?;
                self.pending.insert(tid, nt);
            }
            (false, None) => {
                return Err(ModelError::Protocol(format!(
                    "runner for thread {tid} produced no descriptor"
                )));
            }
            (true, _) => {}
        }
        self.refresh_top_enabled();
        Ok(())
    }

    fn refresh_top_enabled(&mut self) {
        let enabled = self.enabled_threads();
        if let Some(top) = self.states.last_mut() {
            top.enabled = enabled;
        }
    }

    /// Push `t` onto the transition stack and apply it to the store.
    pub fn apply(&mut self, mut t: Transition) -> Result<(), ModelError> {
        let n = self.transitions.len();
        if self.states.is_empty() {
            return Err(ModelError::InvalidState("apply before start"));
        }

        // Thread ids are dense in creation order; assign the child's id
        // now so the stored transition names it.
        if let TransitionKind::ThreadCreate {
            child_handle,
            child,
        } = &mut t.kind
        {
            if self.threads.len() >= mcmini_protocol::MAX_THREADS {
                return Err(ModelError::Protocol(format!(
                    "program created more than {} threads",
                    mcmini_protocol::MAX_THREADS
                )));
            }
            let new_tid = self.threads.len() as Tid;
            *child = Some(new_tid);
            self.threads.push(ThreadData::new(*child_handle));
            self.handles.insert(*child_handle, new_tid);
        }

        self.store.begin_transition(Some(n));
        let status = t.modify(&mut self.store)?;
        let effects = self.store.take_effects();
        match status {
            ApplyStatus::Exists => {}
            ApplyStatus::Disabled => {
                self.store.undo(&effects)?;
                return Err(ModelError::InvalidState("applied a disabled transition"));
            }
            ApplyStatus::UndefinedBehavior(reason) => {
                self.store.undo(&effects)?;
                return Err(ModelError::UndefinedBehavior {
                    executor: t.executor,
                    reason,
                });
            }
        }

        // Pending-table upkeep for lifecycle transitions.
        if let TransitionKind::ThreadCreate { child: Some(c), .. } = t.kind {
            self.pending
                .insert(c, Transition::new(c, TransitionKind::ThreadStart));
        }
        match t.kind {
            TransitionKind::ThreadFinish => {
                self.pending.remove(&t.executor);
            }
            TransitionKind::Exit { .. } => self.pending.clear(),
            _ => {}
        }

        // Per-thread accounting.
        let executor = t.executor;
        if let Some(td) = self.threads.get_mut(executor as usize) {
            if t.counts_against_depth() {
                td.executed_depth += 1;
                td.steps_since_goal += 1;
            }
            match t.kind {
                TransitionKind::ReachGoal | TransitionKind::RequestNewGoal => {
                    td.steps_since_goal = 0;
                    td.last_goal_index = Some(n);
                }
                TransitionKind::EnterGoalCritical => td.in_goal_section = true,
                TransitionKind::ExitGoalCritical => td.in_goal_section = false,
                _ => {}
            }
        }

        // Happens-before clock: join every dependent predecessor, then
        // stamp our own component with the 1-based stack index.
        let mut clock = self
            .threads
            .get(executor as usize)
            .map(|td| td.clock.clone())
            .unwrap_or_default();
        for et in &self.transitions {
            if et.transition.dependent_with(&t) {
                clock.join(&et.clock);
            }
        }
        clock.set(executor, n as u64 + 1);
        if let Some(td) = self.threads.get_mut(executor as usize) {
            td.clock = clock.clone();
        }

        let revertible = t.is_reversible();
        if let Some(top) = self.states.last_mut() {
            top.done_set.insert(executor);
        }
        self.transitions.push(ExecutedTransition {
            transition: t,
            clock: clock.clone(),
            effects,
        });
        if !revertible {
            self.irreversible.push(self.states.len());
        }
        let mut item = StateStackItem::fresh(clock, revertible);
        item.enabled = self.enabled_threads();
        self.states.push(item);
        Ok(())
    }

    // ── Happens-before ─────────────────────────────────────────────

    /// Whether the transition at index `i` happens-before the one at
    /// index `j` (reflexive).
    pub fn happens_before(&self, i: usize, j: usize) -> bool {
        if i > j {
            return false;
        }
        match (self.transitions.get(i), self.transitions.get(j)) {
            (Some(a), Some(b)) => b.clock.get(a.transition.executor) >= i as u64 + 1,
            _ => false,
        }
    }

    /// Whether the transition at index `i` happens-before any transition
    /// of thread `q` (or is one).
    pub fn happens_before_thread(&self, i: usize, q: Tid) -> bool {
        let Some(et) = self.transitions.get(i) else {
            return false;
        };
        if et.transition.executor == q {
            return true;
        }
        self.threads
            .get(q as usize)
            .map_or(false, |td| td.clock.get(et.transition.executor) >= i as u64 + 1)
    }

    /// Chain-definition happens-before, used to cross-check the clock
    /// formulation.
    #[cfg(test)]
    pub fn happens_before_chain(&self, i: usize, j: usize) -> bool {
        if i > j || j >= self.transitions.len() {
            return false;
        }
        let mut reachable = vec![false; j + 1];
        reachable[i] = true;
        for k in i + 1..=j {
            for m in i..k {
                if !reachable[m] {
                    continue;
                }
                let a = &self.transitions[m].transition;
                let b = &self.transitions[k].transition;
                if a.executor == b.executor || a.dependent_with(b) {
                    reachable[k] = true;
                    break;
                }
            }
        }
        reachable[j]
    }

    // ── Backtrack sets ─────────────────────────────────────────────

    /// After a transition was appended, grow backtrack sets along the
    /// stack for every thread whose pending transition races with an
    /// earlier unordered one.
    pub fn update_backtrack_sets(&mut self) {
        let n = self.transitions.len();
        if n == 0 {
            return;
        }
        let candidates: Vec<(Tid, Transition)> = self
            .pending
            .iter()
            .filter(|(_, t)| self.transition_schedulable(t))
            .map(|(&tid, t)| (tid, t.clone()))
            .collect();

        for (q, next_q) in candidates {
            let mut race_index = None;
            for i in (0..n).rev() {
                let si = &self.transitions[i].transition;
                if si.dependent_with(&next_q)
                    && si.coenabled_with(&next_q)
                    && !self.happens_before_thread(i, q)
                {
                    race_index = Some(i);
                    break;
                }
            }
            let Some(i) = race_index else { continue };

            let pre_enabled = match self.states.get(i) {
                Some(item) => item.enabled.clone(),
                None => continue,
            };
            let mut witnesses = BTreeSet::new();
            for &r in &pre_enabled {
                if r == q {
                    witnesses.insert(r);
                    continue;
                }
                let chained = (i + 1..n).any(|j| {
                    self.transitions[j].transition.executor == r
                        && self.happens_before_thread(j, q)
                });
                if chained {
                    witnesses.insert(r);
                }
            }

            let Some(pre) = self.states.get_mut(i) else {
                continue;
            };
            if witnesses.is_empty() {
                for &r in &pre_enabled {
                    if !pre.done_set.contains(&r) {
                        pre.backtrack_set.insert(r);
                    }
                }
            } else {
                let pick = witnesses
                    .iter()
                    .copied()
                    .filter(|r| !pre.done_set.contains(r) && !pre.backtrack_set.contains(r))
                    .min_by_key(|r| (pre.sleep_set.contains(r), *r));
                if let Some(r) = pick {
                    pre.backtrack_set.insert(r);
                }
            }
        }
    }

    /// Pop one unexplored thread from the backtrack set of state `idx`,
    /// moving it into the done set. Lowest tid first, threads outside
    /// the sleep set preferred.
    pub fn select_backtrack_thread(&mut self, idx: usize) -> Option<Tid> {
        let item = self.states.get_mut(idx)?;
        let choice = item
            .backtrack_set
            .iter()
            .copied()
            .filter(|t| !item.done_set.contains(t))
            .min_by_key(|t| (item.sleep_set.contains(t), *t))?;
        item.backtrack_set.remove(&choice);
        item.done_set.insert(choice);
        Some(choice)
    }

    /// Record that the subtree exploring `tid` from state `idx` is
    /// exhausted.
    pub fn sleep_thread_at(&mut self, idx: usize, tid: Tid) {
        if let Some(item) = self.states.get_mut(idx) {
            item.sleep_set.insert(tid);
        }
    }

    // ── Reversal ───────────────────────────────────────────────────

    /// Restore the sequence to "just after the first `k` transitions".
    pub fn reflect_at(&mut self, k: usize) -> Result<(), ModelError> {
        if k > self.transitions.len() {
            return Err(ModelError::InvalidState("reflect beyond stack top"));
        }
        if k == self.transitions.len() {
            return Ok(());
        }

        // Rebuild the store: undo effect-by-effect while the suffix is
        // reversible, slice histories otherwise.
        let irreversible_in_suffix = self.irreversible.iter().any(|&s| s > k);
        if irreversible_in_suffix {
            self.store = self.store.consume_into_subsequence(k);
        } else {
            for j in (k..self.transitions.len()).rev() {
                let effects = self.transitions[j].effects.clone();
                self.store.undo(&effects)?;
            }
        }

        // Reconstruct the pending next-table: a thread's next operation
        // at depth k is its first transition in the discarded suffix,
        // or its latest pending one if it never ran again.
        let mut new_pending = BTreeMap::new();
        for tid in self.store.thread_ids() {
            let lifecycle = self
                .store
                .thread_object(tid)
                .and_then(|id| self.store.current(id).ok())
                .and_then(|s| s.thread_lifecycle());
            match lifecycle {
                Some(l) if l.is_live() => {}
                _ => continue,
            }
            let next = self.transitions[k..]
                .iter()
                .find(|et| et.transition.executor == tid)
                .map(|et| et.transition.clone())
                .or_else(|| self.pending.get(&tid).cloned());
            match next {
                Some(t) => {
                    new_pending.insert(tid, t);
                }
                None => {
                    return Err(ModelError::InvalidState(
                        "live thread with no reconstructible pending operation",
                    ));
                }
            }
        }

        self.transitions.truncate(k);
        self.states.truncate(k + 1);
        self.irreversible.retain(|&s| s <= k);
        self.pending = new_pending;
        self.rebuild_thread_data();
        Ok(())
    }

    /// Pop the top transition, restoring the previous configuration.
    pub fn unapply_top(&mut self) -> Result<(), ModelError> {
        let n = self.transitions.len();
        if n == 0 {
            return Err(ModelError::InvalidState("unapply on empty stack"));
        }
        self.reflect_at(n - 1)
    }

    /// Recompute per-thread counters, clocks, and handle maps from the
    /// (truncated) transition stack.
    fn rebuild_thread_data(&mut self) {
        let main_handle = self.threads.first().map(|td| td.handle).unwrap_or(0);
        let mut threads = vec![ThreadData::new(main_handle)];
        let mut handles = HashMap::new();
        handles.insert(main_handle, TID_MAIN);

        for et in &self.transitions {
            if let TransitionKind::ThreadCreate {
                child_handle,
                child: Some(c),
            } = et.transition.kind
            {
                debug_assert_eq!(c as usize, threads.len());
                threads.push(ThreadData::new(child_handle));
                handles.insert(child_handle, c);
            }
        }
        for (i, et) in self.transitions.iter().enumerate() {
            let Some(td) = threads.get_mut(et.transition.executor as usize) else {
                continue;
            };
            if et.transition.counts_against_depth() {
                td.executed_depth += 1;
                td.steps_since_goal += 1;
            }
            match et.transition.kind {
                TransitionKind::ReachGoal | TransitionKind::RequestNewGoal => {
                    td.steps_since_goal = 0;
                    td.last_goal_index = Some(i);
                }
                TransitionKind::EnterGoalCritical => td.in_goal_section = true,
                TransitionKind::ExitGoalCritical => td.in_goal_section = false,
                _ => {}
            }
            td.clock = et.clock.clone();
        }
        self.threads = threads;
        self.handles = handles;
    }

    // ── Violation predicates ───────────────────────────────────────

    /// All live threads blocked on truly disabled transitions. The
    /// execution-depth cap does not count as blocking here.
    pub fn is_in_deadlock(&self) -> bool {
        !self.pending.is_empty() && self.pending.values().all(|t| !self.transition_enabled(t))
    }

    /// Indices of executed memory accesses that race with `tid`'s
    /// pending access: same address, at least one write, different
    /// threads, and no happens-before chain from the executed access to
    /// any transition of `tid`.
    pub fn data_races_with_pending(&self, tid: Tid) -> Vec<usize> {
        let Some(next) = self.pending.get(&tid) else {
            return Vec::new();
        };
        let Some((addr, next_writes)) = next.memory_access() else {
            return Vec::new();
        };
        let mut races = Vec::new();
        for (i, et) in self.transitions.iter().enumerate() {
            let Some((other_addr, other_writes)) = et.transition.memory_access() else {
                continue;
            };
            if other_addr == addr
                && (next_writes || other_writes)
                && et.transition.executor != tid
                && !self.happens_before_thread(i, tid)
            {
                races.push(i);
            }
        }
        races
    }

    /// Threads that have run past their liveness budget without reaching
    /// a progress goal, while every other live thread kept moving.
    pub fn forward_progress_violations(&self) -> Vec<Tid> {
        let Some(extra) = self.config.extra_liveness_transitions else {
            return Vec::new();
        };
        let min_extra = self.config.min_extra_liveness_transitions;
        let mut starving = Vec::new();
        for &p in self.pending.keys() {
            let Some(td) = self.threads.get(p as usize) else {
                continue;
            };
            if td.in_goal_section || td.steps_since_goal < extra {
                continue;
            }
            let baseline = td.last_goal_index.map(|i| i + 1).unwrap_or(0);
            let others_kept_moving = self.pending.keys().filter(|&&q| q != p).all(|&q| {
                let moved = self.transitions[baseline..]
                    .iter()
                    .filter(|et| {
                        et.transition.executor == q && et.transition.counts_against_depth()
                    })
                    .count() as u64;
                moved >= min_extra
            });
            if others_kept_moving {
                starving.push(p);
            }
        }
        starving
    }
}
