//! Call surface shared by the partitioned-CPU and GPU-resident backends.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use partisim_index::{Rect, RegionId};
use serde::{Deserialize, Serialize};

use crate::command::EngineCommand;
use crate::error::EngineError;
use crate::stats::{AggregatedSnapshot, RegionSnapshot};

/// Lifecycle of an engine. `Stopped` is terminal until the engine is configured again.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Unconfigured,
    Ready,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfigured => "unconfigured",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// Backend chosen once per session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    PartitionedCpu { workers: usize },
    GpuResident,
}

impl Default for BackendSelection {
    fn default() -> Self {
        Self::PartitionedCpu { workers: 4 }
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Workers that exited before the deadline.
    pub joined: usize,
    /// Units whose workers were detached after the deadline passed.
    pub abandoned: Vec<RegionId>,
    pub elapsed: Duration,
}

impl DrainReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// One-shot completion slot shared between a backend and the tickets it hands out.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    result: Mutex<Option<Result<u64, EngineError>>>,
    ready: Condvar,
}

impl CompletionSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the outcome. The first completion wins; later ones are ignored.
    pub fn complete(&self, result: Result<u64, EngineError>) -> bool {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.ready.notify_all();
        true
    }

    #[must_use]
    pub fn peek(&self) -> Option<Result<u64, EngineError>> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn wait_for(&self, timeout: Duration) -> Option<Result<u64, EngineError>> {
        let slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

/// Pushes a backend forward while a caller waits on a ticket. Backends whose
/// completions only fire when the host polls a device implement this.
pub trait StepDriver: Send + Sync {
    fn drive(&self);
}

/// Asynchronous notification that an engine reached `target`.
#[derive(Clone)]
pub struct StepTicket {
    target: u64,
    signal: Arc<CompletionSignal>,
    driver: Option<Arc<dyn StepDriver>>,
}

impl fmt::Debug for StepTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepTicket")
            .field("target", &self.target)
            .field("result", &self.signal.peek())
            .finish()
    }
}

const DRIVE_INTERVAL: Duration = Duration::from_millis(1);

impl StepTicket {
    #[must_use]
    pub fn new(target: u64, signal: Arc<CompletionSignal>) -> Self {
        Self {
            target,
            signal,
            driver: None,
        }
    }

    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn StepDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Ticket that is already resolved.
    #[must_use]
    pub fn ready(target: u64) -> Self {
        let signal = CompletionSignal::new();
        signal.complete(Ok(target));
        Self::new(target, signal)
    }

    #[must_use]
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Non-blocking check.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<u64, EngineError>> {
        if let Some(driver) = &self.driver {
            driver.drive();
        }
        self.signal.peek()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.try_result().is_some()
    }

    /// Block until the engine reaches the target step, or fails to.
    pub fn wait(&self) -> Result<u64, EngineError> {
        loop {
            if let Some(result) = self.wait_timeout(Duration::from_secs(1)) {
                return result;
            }
        }
    }

    /// Block for at most `timeout`; `None` if the ticket is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<u64, EngineError>> {
        let Some(driver) = &self.driver else {
            return self.signal.wait_for(timeout);
        };
        let deadline = Instant::now() + timeout;
        loop {
            driver.drive();
            let now = Instant::now();
            if let Some(result) = self.signal.peek() {
                return Some(result);
            }
            if now >= deadline {
                return None;
            }
            if let Some(result) = self.signal.wait_for(DRIVE_INTERVAL.min(deadline - now)) {
                return Some(result);
            }
        }
    }
}

/// Engine contract seen by the hosting application. Exactly one implementation
/// is selected per session.
pub trait SimulationBackend: Send {
    fn name(&self) -> &'static str;

    fn state(&self) -> EngineState;

    /// Rebuild the engine from its session settings. Forces a drain when running.
    fn reconfigure(&mut self) -> Result<(), EngineError>;

    fn start(&mut self) -> Result<(), EngineError>;

    fn stop(&mut self) -> Result<DrainReport, EngineError>;

    /// Schedule `steps` more steps; the ticket resolves when all of them completed.
    fn advance(&mut self, steps: u64) -> Result<StepTicket, EngineError>;

    /// Schedule one step and wait for it.
    fn advance_step(&mut self) -> Result<u64, EngineError> {
        self.advance(1)?.wait()
    }

    /// Lowest step completed across the whole world.
    fn step_counter(&self) -> u64;

    fn read_region(&self, rect: Rect) -> Result<RegionSnapshot, EngineError>;

    fn request_snapshot(&self) -> Result<AggregatedSnapshot, EngineError>;

    /// Last snapshot that aggregated successfully; survives faults and stops.
    fn last_snapshot(&self) -> Option<AggregatedSnapshot>;

    /// Queue a mutation for the next between-steps safe point.
    fn submit(&mut self, command: EngineCommand) -> Result<(), EngineError>;

    /// Surface asynchronous faults. A fatal fault stops the engine and is returned once.
    fn poll(&mut self) -> Result<EngineState, EngineError>;
}
