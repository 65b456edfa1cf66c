//! Step permission, progress bookkeeping and the running-threads throttle.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use partisim_core::{CompletionSignal, EngineCommand, EngineError, StepTicket};

use crate::mailbox::{CancelToken, WAIT_SLICE};

/// A command together with the step at whose start every unit applies it.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedCommand {
    pub apply_at: u64,
    pub command: EngineCommand,
}

#[derive(Debug)]
struct GateState {
    /// Highest step any unit may complete. `u64::MAX` in continuous mode.
    limit: u64,
    completed: Vec<u64>,
    started: Vec<u64>,
    queues: Vec<VecDeque<StampedCommand>>,
    queued: usize,
    tickets: Vec<(u64, Arc<CompletionSignal>)>,
}

impl GateState {
    fn min_completed(&self) -> u64 {
        self.completed.iter().copied().min().unwrap_or(0)
    }

    fn max_completed(&self) -> u64 {
        self.completed.iter().copied().max().unwrap_or(0)
    }
}

/// Shared per-configuration step bookkeeping.
///
/// Workers ask for permission before each step (which is where queued commands
/// are handed out) and record completion afterwards. Tickets resolve once the
/// slowest unit reaches their target.
#[derive(Debug)]
pub struct StepGate {
    state: Mutex<GateState>,
    changed: Condvar,
    capacity: usize,
}

impl StepGate {
    pub fn new(units: usize, base_step: u64, limit: u64, capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                limit,
                completed: vec![base_step; units],
                started: vec![base_step; units],
                queues: vec![VecDeque::new(); units],
                queued: 0,
                tickets: Vec::new(),
            }),
            changed: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `unit` may compute `step`, then hand out the commands due at
    /// that step. `None` once cancelled. `idle` runs between wait slices
    /// without the gate lock held.
    pub fn acquire(
        &self,
        unit: usize,
        step: u64,
        cancel: &CancelToken,
        idle: &dyn Fn(),
    ) -> Option<Vec<EngineCommand>> {
        loop {
            {
                let mut state = self.lock();
                if cancel.is_cancelled() {
                    return None;
                }
                if step <= state.limit {
                    state.started[unit] = step;
                    let queue = &mut state.queues[unit];
                    let mut due = Vec::new();
                    while queue.front().is_some_and(|stamped| stamped.apply_at <= step) {
                        if let Some(stamped) = queue.pop_front() {
                            due.push(stamped.command);
                        }
                    }
                    state.queued -= due.len();
                    return Some(due);
                }
                let _ = self
                    .changed
                    .wait_timeout(state, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            idle();
        }
    }

    /// Record that `unit` completed `step`; resolves tickets the world has reached.
    pub fn record(&self, unit: usize, step: u64) {
        let mut state = self.lock();
        state.completed[unit] = step;
        let min = state.min_completed();
        state.tickets.retain(|(target, signal)| {
            if *target <= min {
                signal.complete(Ok(*target));
                false
            } else {
                true
            }
        });
    }

    /// Allow `steps` more steps and return a ticket for the new limit.
    pub fn raise(&self, steps: u64) -> StepTicket {
        let mut state = self.lock();
        state.limit = state.limit.saturating_add(steps);
        let target = state.limit;
        let ticket = self.ticket_locked(&mut state, target);
        drop(state);
        self.changed.notify_all();
        ticket
    }

    /// Lift the limit entirely.
    pub fn unlimit(&self) {
        self.lock().limit = u64::MAX;
        self.changed.notify_all();
    }

    /// Ticket resolving once every unit completed `target`.
    pub fn ticket(&self, target: u64) -> StepTicket {
        let mut state = self.lock();
        self.ticket_locked(&mut state, target)
    }

    fn ticket_locked(&self, state: &mut GateState, target: u64) -> StepTicket {
        if state.min_completed() >= target {
            return StepTicket::ready(target);
        }
        let signal = CompletionSignal::new();
        state.tickets.push((target, Arc::clone(&signal)));
        StepTicket::new(target, signal)
    }

    /// Queue `command` for every unit at the first step none of them has started.
    pub fn enqueue(&self, command: EngineCommand) -> Result<u64, EngineError> {
        let mut state = self.lock();
        let units = state.queues.len();
        if state.queued + units > self.capacity.max(units) {
            return Err(EngineError::CommandQueueFull);
        }
        let apply_at = state.started.iter().copied().max().unwrap_or(0) + 1;
        for queue in &mut state.queues {
            queue.push_back(StampedCommand {
                apply_at,
                command: command.clone(),
            });
        }
        state.queued += units;
        Ok(apply_at)
    }

    /// Resolve every pending ticket with `error`.
    pub fn fail(&self, error: &EngineError) {
        let tickets = std::mem::take(&mut self.lock().tickets);
        for (target, signal) in tickets {
            signal.complete(Err(match error {
                EngineError::Cancelled(_) => EngineError::Cancelled(target),
                other => other.clone(),
            }));
        }
        self.changed.notify_all();
    }

    /// Wake every worker parked on the gate.
    pub fn nudge(&self) {
        self.changed.notify_all();
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.lock().limit
    }

    #[must_use]
    pub fn min_completed(&self) -> u64 {
        self.lock().min_completed()
    }

    #[must_use]
    pub fn max_completed(&self) -> u64 {
        self.lock().max_completed()
    }

    #[must_use]
    pub fn completed(&self, unit: usize) -> u64 {
        self.lock().completed.get(unit).copied().unwrap_or(0)
    }

    /// `(max completed, limit)` read atomically.
    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        let state = self.lock();
        (state.max_completed(), state.limit)
    }
}

/// Counting semaphore capping how many units compute at the same time.
#[derive(Debug)]
pub struct Throttle {
    available: Mutex<usize>,
    released: Condvar,
}

/// Releases its slot on drop.
pub struct ThrottlePermit<'a> {
    throttle: &'a Throttle,
}

impl Throttle {
    pub fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self, cancel: &CancelToken) -> Option<ThrottlePermit<'_>> {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if *available > 0 {
                *available -= 1;
                return Some(ThrottlePermit { throttle: self });
            }
            available = self
                .released
                .wait_timeout(available, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for ThrottlePermit<'_> {
    fn drop(&mut self) {
        let mut available = self
            .throttle
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.throttle.released.notify_one();
    }
}
