//! A read-mostly container keeping two copies of its data.
//!
//! Readers load the foreground copy through an [`ArcSwap`] and never take a lock. A writer
//! mutates the background copy, publishes it as the new foreground, waits until the readers that
//! loaded the old foreground have let go of it and then applies the same mutation to the old copy,
//! which becomes the next background. Both copies hold identical data between writes.

use std::hint;
use std::ops::Deref;
use std::sync::Arc;
use std::thread;

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

const SPINS_BEFORE_YIELD: u32 = 64;

/// Two copies of `T`, one serving readers and one reserved for the writer.
#[derive(Debug)]
pub struct DoublyBuffered<T> {
    foreground: ArcSwap<T>,
    background: Mutex<Arc<T>>,
}

/// A borrowed snapshot of the foreground copy.
///
/// Writers wait for outstanding guards of a copy before reusing it, so guards should be short
/// lived.
#[derive(Debug)]
pub struct ReadGuard<T> {
    inner: Guard<Arc<T>>,
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Default + Clone> Default for DoublyBuffered<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone> DoublyBuffered<T> {
    /// Creates a container holding two copies of `value`.
    pub fn new(value: T) -> Self {
        Self {
            background: Mutex::new(Arc::new(value.clone())),
            foreground: ArcSwap::from_pointee(value),
        }
    }

    /// Borrows the current foreground copy. Never blocks and never allocates.
    #[inline]
    pub fn read(&self) -> ReadGuard<T> {
        ReadGuard {
            inner: self.foreground.load(),
        }
    }

    /// Applies `f` to both copies, one at a time, and returns what its first application returned.
    ///
    /// `f` receives the copy to mutate and the current foreground. When it returns `0` nothing is
    /// published and the second application is skipped. Replaying `f` against the second copy
    /// must leave it identical to the first one.
    ///
    /// Writers are serialized. The call blocks until readers that loaded the previous foreground
    /// have dropped their guards, so a thread must not call this while it holds a [`ReadGuard`]
    /// of the same container.
    pub fn modify<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&mut T, &T) -> usize,
    {
        let mut background = self.background.lock();
        let foreground = self.foreground.load_full();
        let changed = f(exclusive(&mut *background), &foreground);
        if changed == 0 {
            return 0;
        }

        // Park a clone of the old foreground in the slot while the fresh copy is published.
        let fresh = std::mem::replace(&mut *background, foreground);
        let previous = self.foreground.swap(fresh);
        *background = previous;

        let foreground = self.foreground.load_full();
        f(exclusive(&mut *background), &foreground);
        changed
    }
}

/// Waits until nobody else holds `slot` and returns it mutably.
///
/// Guards still pointing at the copy are turned into counted references when it is swapped out,
/// so the strong count drops to one once the last reader that saw it is gone.
fn exclusive<T: Clone>(slot: &mut Arc<T>) -> &mut T {
    let mut spins = 0;
    while Arc::strong_count(slot) > 1 {
        if spins < SPINS_BEFORE_YIELD {
            hint::spin_loop();
            spins += 1;
        } else {
            thread::yield_now();
        }
    }
    Arc::make_mut(slot)
}
