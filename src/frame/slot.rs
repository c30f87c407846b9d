//! Published-snapshot cell for one stream.
//!
//! The producer of a stream fills a private buffer, then calls [`FrameSlot::publish`],
//! which swaps the `Arc` in one atomic store. Readers call [`FrameSlot::load`] and get
//! either the previous complete frame or the new complete frame, never a mix.
//!
//! Besides the snapshot, the slot keeps a generation counter. Compute loops block on
//! [`FrameSlot::wait_newer`] with a short timeout so they can still observe the stop
//! flag, and skip straight to the newest frame when they fall behind.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};

use super::{Frame, Pixel};

/// Latest published frame of one stream.
pub struct FrameSlot<T: Pixel> {
    current: ArcSwapOption<Frame<T>>,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl<T: Pixel> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pixel> FrameSlot<T> {
    /// An empty slot at generation 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    /// Latest complete frame, if any has been published since the last flush.
    #[must_use]
    pub fn load(&self) -> Option<Arc<Frame<T>>> {
        self.current.load_full()
    }

    /// Publish a frame and wake waiters. Returns the new generation.
    pub fn publish(&self, frame: Arc<Frame<T>>) -> u64 {
        // Store before bumping: a waiter that sees the new generation always loads
        // this frame or a newer one.
        self.current.store(Some(frame));

        let mut generation = self.generation.lock();
        *generation += 1;
        let published = *generation;
        drop(generation);

        self.changed.notify_all();
        published
    }

    /// Number of frames published so far. Never decreases, not even on flush.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until the generation exceeds `seen` or `timeout` elapses.
    ///
    /// Returns the current generation when it is newer than `seen`.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let mut generation = self.generation.lock();
        if *generation <= seen {
            let _ = self.changed.wait_for(&mut generation, timeout);
        }
        (*generation > seen).then_some(*generation)
    }

    /// Drop the published frame. Waiters are not woken.
    pub fn clear(&self) {
        self.current.store(None);
    }

    /// Wake every waiter, e.g. so loops notice a stop request immediately.
    pub fn wake_all(&self) {
        let _guard = self.generation.lock();
        self.changed.notify_all();
    }
}
