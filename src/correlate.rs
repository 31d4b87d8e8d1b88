//! Consumer-side pairing of decoded events.
//!
//! Only the target process and the processes it creates are of interest. An `_enter` is held
//! until the `_exit` of the same `pid_tid` arrives and both are then reported together; the exits
//! of process-creating syscalls add the child to the tracked set. A child may run, and issue
//! syscalls, before its parent's exit record is consumed: while any tracked thread is inside a
//! process-creating syscall, events of untracked processes are held back, and replayed once the
//! child they belong to joins the tracked set.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use rsswatch_common::EventType;

use crate::events::Event;

/// Bounds of the state a [`Correlator`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Enter events awaiting their exit. When full, the oldest one is dropped.
    pub max_pending: usize,
    /// Events of untracked processes held while a process-creating syscall is in flight.
    pub max_backlog: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        CorrelatorConfig {
            max_pending: 4096,
            max_backlog: 4096,
        }
    }
}

/// What the correlator reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Correlated {
    /// An event without a counterpart: `munmap`, or an exit whose enter was never seen.
    Single(Event),
    /// A syscall's enter and exit.
    Pair { enter: Event, exit: Event },
}

impl Correlated {
    pub fn pid(&self) -> u32 {
        match self {
            Correlated::Single(e) => e.pid,
            Correlated::Pair { exit, .. } => exit.pid,
        }
    }

    /// The type of the event that completed this report.
    pub fn event_type(&self) -> EventType {
        match self {
            Correlated::Single(e) => e.event_type,
            Correlated::Pair { exit, .. } => exit.event_type,
        }
    }
}

#[inline(always)]
fn is_process_creating_enter(event_type: EventType) -> bool {
    event_type.exit_of().map_or(false, EventType::creates_process)
}

#[derive(Debug)]
pub struct Correlator {
    config: CorrelatorConfig,
    tracked: HashSet<u32>,
    pending: HashMap<u64, Event>,
    /// Pending enters of process-creating syscalls.
    creating: usize,
    backlog: VecDeque<Event>,
}

impl Correlator {
    pub fn new(root_pid: u32, config: CorrelatorConfig) -> Self {
        let mut tracked = HashSet::new();
        tracked.insert(root_pid);
        Correlator {
            config,
            tracked,
            pending: HashMap::new(),
            creating: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Whether events of `pid` are reported.
    #[inline]
    pub fn is_tracked(&self, pid: u32) -> bool {
        self.tracked.contains(&pid)
    }

    pub fn tracked(&self) -> impl Iterator<Item = u32> + '_ {
        self.tracked.iter().copied()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one event; `emit` is called once for every report it completes, in order.
    pub fn observe<F: FnMut(Correlated)>(&mut self, event: Event, mut emit: F) {
        self.observe_dyn(event, &mut emit);
    }

    fn observe_dyn(&mut self, event: Event, emit: &mut dyn FnMut(Correlated)) {
        if !self.tracked.contains(&event.pid) {
            self.hold(event);
            return;
        }

        let event_type = event.event_type;
        if event_type.is_enter() {
            self.insert_pending(event);
            return;
        }
        if !event_type.is_exit() {
            emit(Correlated::Single(event));
            return;
        }

        match self.take_pending(event.pid_tid()) {
            Some(enter) if enter.event_type.exit_of() == Some(event_type) => {
                let child = if event_type.creates_process() {
                    event.payload.child_pid()
                } else {
                    None
                };
                emit(Correlated::Pair { enter, exit: event });
                if let Some(child) = child {
                    self.track(child, emit);
                }
            }
            pending => {
                if let Some(enter) = pending {
                    tracing::debug!(
                        pid_tid = enter.pid_tid(),
                        enter = %enter.event_type,
                        exit = %event_type,
                        "dropping enter not followed by its exit"
                    );
                }
                // Thread creation is filtered on entry, and a child's own return from clone
                // has no enter; neither is of interest.
                if !event_type.creates_process() {
                    emit(Correlated::Single(event));
                }
            }
        }

        if self.creating == 0 {
            self.backlog.clear();
        }
    }

    fn track(&mut self, child: u32, emit: &mut dyn FnMut(Correlated)) {
        if !self.tracked.insert(child) {
            return;
        }
        tracing::debug!(pid = child, "tracking child process");
        let (held, rest): (VecDeque<_>, VecDeque<_>) =
            self.backlog.drain(..).partition(|e| e.pid == child);
        self.backlog = rest;
        for event in held {
            self.observe_dyn(event, emit);
        }
    }

    fn hold(&mut self, event: Event) {
        if self.creating == 0 || self.config.max_backlog == 0 {
            return;
        }
        if self.backlog.len() == self.config.max_backlog {
            if let Some(old) = self.backlog.pop_front() {
                tracing::debug!(pid = old.pid, event = %old.event_type, "backlog full, dropping");
            }
        }
        self.backlog.push_back(event);
    }

    fn insert_pending(&mut self, event: Event) {
        let key = event.pid_tid();
        if !self.pending.contains_key(&key) && self.pending.len() >= self.config.max_pending {
            self.evict_oldest();
        }
        if is_process_creating_enter(event.event_type) {
            self.creating += 1;
        }
        if let Some(orphan) = self.pending.insert(key, event) {
            tracing::debug!(pid_tid = key, enter = %orphan.event_type, "replacing orphaned enter");
            if is_process_creating_enter(orphan.event_type) {
                self.creating -= 1;
            }
        }
    }

    fn take_pending(&mut self, key: u64) -> Option<Event> {
        let enter = self.pending.remove(&key)?;
        if is_process_creating_enter(enter.event_type) {
            self.creating -= 1;
        }
        Some(enter)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, e)| e.timestamp_ns)
            .map(|(&k, _)| k);
        if let Some(enter) = oldest.and_then(|k| self.take_pending(k)) {
            tracing::warn!(
                pid = enter.pid,
                tid = enter.tid,
                event = %enter.event_type,
                "too many pending enter events, evicting the oldest"
            );
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
