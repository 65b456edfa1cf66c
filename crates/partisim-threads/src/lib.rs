//! Partitioned CPU backend for partisim.
//!
//! One worker thread owns each execution unit. Neighbors exchange halo strips
//! through per-edge mailboxes, so a unit only ever waits on the units next to
//! it. The [`StepGate`] paces the run and hands out step-stamped commands, the
//! [`Monitor`] assembles consistent snapshots while workers keep running.

pub mod controller;
pub mod gate;
pub mod graph;
pub mod mailbox;
pub mod monitor;

pub use controller::ThreadController;
pub use gate::{StampedCommand, StepGate, Throttle, ThrottlePermit};
pub use graph::{DependencyGraph, Edge};
pub use mailbox::{CancelToken, HaloMailbox};
pub use monitor::{Monitor, MonitorStats};
