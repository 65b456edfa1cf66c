//! Observer aggregation: request/response snapshots keyed by step.
//!
//! A request picks a target step no unit has recorded yet (or the step the
//! pumped limit parks everyone at), registers it, and waits. Each worker
//! contributes from its own thread right after completing the target step, or
//! while parked at it. The snapshot is produced only when every unit has
//! contributed for the same step; topology changes, stops and faults cancel the
//! pending request instead of returning a partial aggregate.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use partisim_core::{AggregatedSnapshot, ConfigurationError, EngineError, UnitStats};
use tracing::debug;

use crate::gate::StepGate;

#[derive(Debug)]
struct Pending {
    id: u64,
    target: u64,
    contributions: Vec<Option<UnitStats>>,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Hub {
    units: usize,
    next_id: u64,
    pending: Option<Pending>,
    outcome: Option<(u64, Result<AggregatedSnapshot, EngineError>)>,
    /// Set by `cancel`; later requests fail with it until the next `reset`.
    closed: Option<EngineError>,
    last: Option<AggregatedSnapshot>,
}

/// Counters mirroring what the monitor has served so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

#[derive(Debug, Default)]
pub struct Monitor {
    requests: Mutex<()>,
    hub: Mutex<Hub>,
    resolved: Condvar,
    stats: Mutex<MonitorStats>,
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, update: impl FnOnce(&mut MonitorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Point the monitor at a new set of units. Any outstanding request is
    /// cancelled and the monitor accepts requests again.
    pub fn reset(&self, units: usize) {
        self.cancel(EngineError::SnapshotCancelled);
        let mut hub = self.hub();
        hub.closed = None;
        hub.units = units;
    }

    /// Resolve the outstanding request, if any, with `reason`, and refuse new
    /// ones with the same reason until [`Self::reset`].
    pub fn cancel(&self, reason: EngineError) {
        let mut hub = self.hub();
        if hub.closed.is_none() {
            hub.closed = Some(reason.clone());
        }
        if let Some(pending) = hub.pending.take() {
            debug!(target_step = pending.target, %reason, "snapshot request cancelled");
            hub.outcome = Some((pending.id, Err(reason)));
            self.resolved.notify_all();
        }
    }

    /// Step the outstanding request waits for.
    #[must_use]
    pub fn pending_target(&self) -> Option<u64> {
        self.hub().pending.as_ref().map(|pending| pending.target)
    }

    /// Contribute `unit`'s statistics if a request is waiting for `step`.
    pub fn offer(&self, unit: usize, step: u64, stats: impl FnOnce() -> UnitStats) {
        let mut hub = self.hub();
        let Some(pending) = hub.pending.as_mut() else {
            return;
        };
        if pending.target != step {
            return;
        }
        let Some(slot) = pending.contributions.get_mut(unit) else {
            return;
        };
        if slot.is_some() {
            return;
        }
        *slot = Some(stats());
        pending.remaining -= 1;
        if pending.remaining > 0 {
            return;
        }
        let Some(pending) = hub.pending.take() else {
            return;
        };
        let contributions = pending.contributions.into_iter().flatten().collect();
        let outcome = AggregatedSnapshot::merge(pending.target, contributions)
            .ok_or(EngineError::SnapshotCancelled);
        hub.outcome = Some((pending.id, outcome));
        self.resolved.notify_all();
    }

    /// Block until every unit contributed for one step. `gate` provides the
    /// target; `timeout` bounds the wait.
    pub fn request(
        &self,
        gate: &StepGate,
        timeout: Option<Duration>,
    ) -> Result<AggregatedSnapshot, EngineError> {
        let _serial = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let mut hub = self.hub();
        if hub.units == 0 {
            return Err(ConfigurationError::NoUnits.into());
        }
        if let Some(reason) = hub.closed.clone() {
            self.bump(|stats| stats.cancelled += 1);
            return Err(reason);
        }
        let (max_completed, limit) = gate.bounds();
        let target = max_completed.saturating_add(1).min(limit);
        let id = hub.next_id;
        hub.next_id += 1;
        hub.pending = Some(Pending {
            id,
            target,
            contributions: vec![None; hub.units],
            remaining: hub.units,
        });
        debug!(target_step = target, units = hub.units, "snapshot requested");
        gate.nudge();

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some((resolved, _)) = &hub.outcome
                && *resolved == id
            {
                let Some((_, outcome)) = hub.outcome.take() else {
                    continue;
                };
                match &outcome {
                    Ok(snapshot) => {
                        hub.last = Some(snapshot.clone());
                        self.bump(|stats| stats.completed += 1);
                    }
                    Err(_) => self.bump(|stats| stats.cancelled += 1),
                }
                return outcome;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        hub.pending = None;
                        self.bump(|stats| stats.timed_out += 1);
                        return Err(EngineError::SnapshotTimeout(timeout.unwrap_or_default()));
                    }
                    deadline - now
                }
                None => Duration::from_secs(1),
            };
            hub = self
                .resolved
                .wait_timeout(hub, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Record a snapshot produced without workers (the engine was not running).
    pub fn record(&self, snapshot: AggregatedSnapshot) {
        self.hub().last = Some(snapshot);
        self.bump(|stats| stats.completed += 1);
    }

    #[must_use]
    pub fn last_snapshot(&self) -> Option<AggregatedSnapshot> {
        self.hub().last.clone()
    }

    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partisim_core::RegionId;
    use std::sync::Arc;
    use std::thread;

    fn stats(unit: usize, step: u64) -> UnitStats {
        UnitStats {
            unit: RegionId(unit as u32),
            step,
            cells: 2,
            ..UnitStats::default()
        }
    }

    #[test]
    fn zero_units_fail_fast() {
        let monitor = Monitor::new();
        let gate = StepGate::new(0, 0, 0, 1);
        assert_eq!(
            monitor.request(&gate, None),
            Err(EngineError::Configuration(ConfigurationError::NoUnits))
        );
    }

    #[test]
    fn aggregates_once_every_unit_reported_the_target() {
        let monitor = Arc::new(Monitor::new());
        monitor.reset(2);
        let gate = Arc::new(StepGate::new(2, 3, u64::MAX, 4));
        let requester = {
            let monitor = Arc::clone(&monitor);
            let gate = Arc::clone(&gate);
            thread::spawn(move || monitor.request(&gate, Some(Duration::from_secs(5))))
        };
        while monitor.pending_target().is_none() {
            thread::yield_now();
        }
        assert_eq!(monitor.pending_target(), Some(4));
        monitor.offer(0, 3, || stats(0, 3));
        monitor.offer(0, 4, || stats(0, 4));
        monitor.offer(0, 4, || panic!("second contribution must be ignored"));
        monitor.offer(1, 4, || stats(1, 4));
        let snapshot = requester.join().expect("join").expect("snapshot");
        assert_eq!(snapshot.step, 4);
        assert_eq!(snapshot.totals.cells, 4);
        assert_eq!(monitor.last_snapshot(), Some(snapshot));
        assert_eq!(monitor.stats().completed, 1);
    }

    #[test]
    fn reset_cancels_the_outstanding_request() {
        let monitor = Arc::new(Monitor::new());
        monitor.reset(3);
        let gate = Arc::new(StepGate::new(3, 0, 0, 4));
        let requester = {
            let monitor = Arc::clone(&monitor);
            let gate = Arc::clone(&gate);
            thread::spawn(move || monitor.request(&gate, None))
        };
        while monitor.pending_target().is_none() {
            thread::yield_now();
        }
        assert_eq!(monitor.pending_target(), Some(0), "pumped limit parks the target");
        monitor.offer(1, 0, || stats(1, 0));
        monitor.reset(2);
        assert_eq!(
            requester.join().expect("join"),
            Err(EngineError::SnapshotCancelled)
        );
        assert!(monitor.last_snapshot().is_none());
    }

    #[test]
    fn cancellation_sticks_until_reset() {
        let monitor = Monitor::new();
        monitor.reset(2);
        let gate = StepGate::new(2, 0, u64::MAX, 4);
        let fault = EngineError::Cancelled(7);
        monitor.cancel(fault.clone());
        monitor.cancel(EngineError::SnapshotCancelled);
        assert_eq!(monitor.request(&gate, None), Err(fault.clone()));
        assert_eq!(monitor.request(&gate, None), Err(fault));
        assert!(monitor.pending_target().is_none());
        assert_eq!(monitor.stats().cancelled, 2);

        monitor.reset(1);
        monitor.offer(0, 1, || stats(0, 1));
        assert_eq!(
            monitor.request(&gate, Some(Duration::from_millis(20))),
            Err(EngineError::SnapshotTimeout(Duration::from_millis(20))),
            "a reset monitor waits for contributions again"
        );
    }

    #[test]
    fn times_out_when_a_unit_never_reports() {
        let monitor = Monitor::new();
        monitor.reset(1);
        let gate = StepGate::new(1, 0, u64::MAX, 4);
        assert_eq!(
            monitor.request(&gate, Some(Duration::from_millis(20))),
            Err(EngineError::SnapshotTimeout(Duration::from_millis(20)))
        );
        assert!(monitor.pending_target().is_none());
        assert_eq!(monitor.stats().timed_out, 1);
    }
}
