//! Step-tagged halo hand-off for one dependency edge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use partisim_core::SharedHalo;

/// How long a blocked worker sleeps before re-checking cancellation and
/// pending monitor requests.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag checked at every step boundary and inside every wait.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Holds the two most recent halos a producer published toward one consumer.
///
/// A producer can run at most one step ahead of any neighbor, so two slots are
/// enough for the slower side to still find the tag it needs. Publishing never
/// blocks; readers block until their tag appears.
#[derive(Debug, Default)]
pub struct HaloMailbox {
    slots: Mutex<[Option<SharedHalo>; 2]>,
    published: Condvar,
}

impl HaloMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the older of the two slots with `halo`.
    pub fn publish(&self, halo: SharedHalo) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = match (&slots[0], &slots[1]) {
            (None, _) => 0,
            (_, None) => 1,
            (Some(a), Some(b)) => usize::from(b.step < a.step),
        };
        slots[stale] = Some(halo);
        self.published.notify_all();
    }

    /// Non-blocking lookup of the halo tagged `step`.
    #[must_use]
    pub fn peek(&self, step: u64) -> Option<SharedHalo> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        find(&slots, step)
    }

    /// Most recent tag published so far.
    #[must_use]
    pub fn latest_step(&self) -> Option<u64> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.iter().flatten().map(|halo| halo.step).max()
    }

    /// Block until the halo tagged `step` is available. Returns `None` once
    /// `cancel` fires. `idle` runs between wait slices.
    pub fn wait_for(&self, step: u64, cancel: &CancelToken, idle: &dyn Fn()) -> Option<SharedHalo> {
        loop {
            {
                let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(halo) = find(&slots, step) {
                    return Some(halo);
                }
                if cancel.is_cancelled() {
                    return None;
                }
                let (slots, _) = self
                    .published
                    .wait_timeout(slots, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(halo) = find(&slots, step) {
                    return Some(halo);
                }
            }
            idle();
        }
    }
}

fn find(slots: &[Option<SharedHalo>; 2], step: u64) -> Option<SharedHalo> {
    slots
        .iter()
        .flatten()
        .find(|halo| halo.step == step)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use partisim_core::{HaloStrip, RegionId};
    use std::sync::Arc;
    use std::thread;

    fn halo(step: u64) -> SharedHalo {
        Arc::new(HaloStrip::empty(step, RegionId(1)))
    }

    #[test]
    fn keeps_the_two_latest_tags() {
        let mailbox = HaloMailbox::new();
        mailbox.publish(halo(0));
        mailbox.publish(halo(1));
        assert!(mailbox.peek(0).is_some());
        mailbox.publish(halo(2));
        assert!(mailbox.peek(0).is_none());
        assert_eq!(mailbox.peek(1).map(|h| h.step), Some(1));
        assert_eq!(mailbox.latest_step(), Some(2));
        mailbox.publish(halo(3));
        assert!(mailbox.peek(1).is_none());
        assert!(mailbox.peek(2).is_some());
    }

    #[test]
    fn reader_blocks_until_its_tag_is_published() {
        let mailbox = Arc::new(HaloMailbox::new());
        let cancel = Arc::new(CancelToken::default());
        mailbox.publish(halo(4));
        let reader = {
            let mailbox = Arc::clone(&mailbox);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || mailbox.wait_for(5, &cancel, &|| {}).map(|h| h.step))
        };
        thread::sleep(Duration::from_millis(30));
        mailbox.publish(halo(5));
        assert_eq!(reader.join().expect("join"), Some(5));
    }

    #[test]
    fn cancellation_releases_waiters() {
        let mailbox = Arc::new(HaloMailbox::new());
        let cancel = Arc::new(CancelToken::default());
        let reader = {
            let mailbox = Arc::clone(&mailbox);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || mailbox.wait_for(1, &cancel, &|| {}).is_none())
        };
        cancel.cancel();
        assert!(reader.join().expect("join"));
    }
}
