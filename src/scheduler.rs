// scheduler.rs - Per-agent timers

//! Timer bookkeeping for one agent.
//!
//! The clock itself is the actor context (`run_later` / `run_interval`), so
//! every timer of every agent rides on the arbiter's single event loop. This
//! module keeps track of what was armed, what fired, and what must be
//! cancelled when the agent is deactivated.

use actix::SpawnHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::behaviour::{AgentContext, BehaviourId};

/// Timer identifier, unique within one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// One-shot or periodic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once(Duration),
    Every(Duration),
}

impl TimerKind {
    pub fn is_periodic(&self) -> bool {
        matches!(self, TimerKind::Every(_))
    }
}

#[derive(Debug, Default)]
struct TimerFlags {
    fired: AtomicU64,
    cancelled: AtomicBool,
}

/// Observer for a scheduled task.
///
/// Cheap to clone; every clone sees the same firing count. Dropping a handle
/// does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    kind: TimerKind,
    flags: Arc<TimerFlags>,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, kind: TimerKind) -> Self {
        Self {
            id,
            kind,
            flags: Arc::new(TimerFlags::default()),
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// True once the callback has run at least once
    pub fn has_fired(&self) -> bool {
        self.fire_count() > 0
    }

    pub fn fire_count(&self) -> u64 {
        self.flags.fired.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Acquire)
    }

    /// Still expected to fire (again)
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && (self.kind.is_periodic() || !self.has_fired())
    }

    fn mark_fired(&self) {
        self.flags.fired.fetch_add(1, Ordering::AcqRel);
    }

    fn mark_cancelled(&self) {
        self.flags.cancelled.store(true, Ordering::Release);
    }

    /// For handles that were allocated but will never be armed
    pub(crate) fn cancel_unarmed(&self) {
        self.mark_cancelled();
    }
}

/// Agent-level callback run on the agent's loop
pub type Callback = Box<dyn FnMut(&mut AgentContext) + Send>;

/// What a firing timer drives
pub enum TimerTarget {
    /// `Behaviour::on_time(token)` on the given behaviour
    Behaviour { behaviour: BehaviourId, token: u64 },
    /// Free-standing callback (`call_later`, continuations)
    Callback(Callback),
}

impl TimerTarget {
    /// Wrap a one-shot closure
    pub fn once<F>(callback: F) -> Self
    where
        F: FnOnce(&mut AgentContext) + Send + 'static,
    {
        let mut slot = Some(callback);
        TimerTarget::Callback(Box::new(move |ctx| {
            if let Some(callback) = slot.take() {
                callback(ctx);
            }
        }))
    }
}

impl fmt::Debug for TimerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerTarget::Behaviour { behaviour, token } => f
                .debug_struct("Behaviour")
                .field("behaviour", behaviour)
                .field("token", token)
                .finish(),
            TimerTarget::Callback(_) => f.write_str("Callback"),
        }
    }
}

struct Entry {
    handle: TimerHandle,
    spawn: SpawnHandle,
    /// Taken out while a periodic target is running
    target: Option<TimerTarget>,
}

/// Allocates timer ids for one agent; shared with its contexts
#[derive(Debug, Clone, Default)]
pub struct TimerIds(Arc<AtomicU64>);

impl TimerIds {
    pub fn allocate(&self, kind: TimerKind) -> TimerHandle {
        let id = TimerId(self.0.fetch_add(1, Ordering::Relaxed) + 1);
        TimerHandle::new(id, kind)
    }
}

/// Armed timers of one agent
#[derive(Default)]
pub struct TimerTable {
    ids: TimerIds,
    entries: HashMap<TimerId, Entry>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> TimerIds {
        self.ids.clone()
    }

    /// Record a timer the actor context has just armed
    pub fn insert(&mut self, handle: TimerHandle, target: TimerTarget, spawn: SpawnHandle) {
        self.entries.insert(
            handle.id,
            Entry {
                handle,
                spawn,
                target: Some(target),
            },
        );
    }

    /// Mark a firing and hand out its target.
    ///
    /// One-shot timers leave the table here. Periodic targets must be handed
    /// back with `finish_fire`.
    pub fn begin_fire(&mut self, id: TimerId) -> Option<TimerTarget> {
        let entry = self.entries.get_mut(&id)?;
        entry.handle.mark_fired();
        if entry.handle.kind.is_periodic() {
            entry.target.take()
        } else {
            self.entries.remove(&id).and_then(|e| e.target)
        }
    }

    /// Return a periodic target after it ran, unless it was cancelled meanwhile
    pub fn finish_fire(&mut self, id: TimerId, target: TimerTarget) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.target = Some(target);
        }
    }

    /// Cancel one timer; returns the context handle to cancel if it was armed
    pub fn cancel(&mut self, id: TimerId) -> Option<SpawnHandle> {
        let entry = self.entries.remove(&id)?;
        entry.handle.mark_cancelled();
        Some(entry.spawn)
    }

    /// Cancel every timer
    pub fn cancel_all(&mut self) -> Vec<SpawnHandle> {
        self.entries
            .drain()
            .map(|(_, entry)| {
                entry.handle.mark_cancelled();
                entry.spawn
            })
            .collect()
    }

    /// Timers still armed
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
