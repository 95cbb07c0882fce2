//! Dual-counter shared ownership (spec §4.1), mapped onto `Arc`/`Weak`.
//!
//! The C source (`examples/original_source/ffi/src/rc.c`) hand-rolls a
//! strong/weak counted cell with its own mutex. Per the design note in
//! spec §9, the idiomatic translation is the standard library's shared-weak
//! discipline directly: `Arc::clone`/`Drop` is `ref`/`unref`, the payload's
//! `Drop` impl is the destructor (run exactly once, at the last strong
//! reference's drop), and `Arc::downgrade`/`Weak::upgrade` is `ref_weak`/
//! the fallible strong-from-weak promotion. `Shared<T>` only adds the
//! externally-callable lock and condition variable spec §4.1 calls for.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

/// A strong, reference-counted, internally-locked cell.
///
/// Cloning increments the strong count (`ref`); dropping the last clone
/// runs `T`'s destructor and decrements the weak count the strong side
/// holds collectively, exactly mirroring spec §4.1's lifecycle.
#[derive(Debug)]
pub struct Shared<T> {
    inner: Arc<Cell<T>>,
}

#[derive(Debug)]
struct Cell<T> {
    payload: Mutex<T>,
    condvar: Condvar,
}

/// A weak reference: does not keep `T` alive, and does not prevent its
/// destructor from running. Promotion fails once the last strong
/// reference has been dropped (spec §4.1: "`ref` on a destructed cell
/// yields empty").
#[derive(Debug)]
pub struct WeakShared<T> {
    inner: Weak<Cell<T>>,
}

impl<T> Shared<T> {
    pub fn new(payload: T) -> Self {
        Self {
            inner: Arc::new(Cell {
                payload: Mutex::new(payload),
                condvar: Condvar::new(),
            }),
        }
    }

    /// `ref_weak`: obtain a non-owning handle.
    pub fn downgrade(&self) -> WeakShared<T> {
        WeakShared {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// `lock`: acquire the cell's mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `cond_wait`: atomically release the held guard and wait on the
    /// cell's condition variable, re-acquiring on wake.
    pub fn cond_wait<'a>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner
            .condvar
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Signal the cell's condition variable, waking one waiter.
    pub fn notify_one(&self) {
        self.inner.condvar.notify_one();
    }

    /// Signal the cell's condition variable, waking all waiters.
    pub fn notify_all(&self) {
        self.inner.condvar.notify_all();
    }

    /// Number of strong references currently outstanding.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(a: &Shared<T>, b: &Shared<T>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WeakShared<T> {
    /// `ref`-from-weak: succeeds only while at least one strong reference
    /// is alive (spec §4.1: `is_destructed` is false).
    pub fn upgrade(&self) -> Option<Shared<T>> {
        self.inner.upgrade().map(|inner| Shared { inner })
    }

    pub fn strong_count(&self) -> usize {
        self.inner.strong_count()
    }
}

impl<T> Clone for WeakShared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting<'a>(&'a AtomicUsize);

    impl<'a> Drop for Counting<'a> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destructor_runs_exactly_once_on_last_strong_drop() {
        let drops = AtomicUsize::new(0);
        let cell = Shared::new(Counting(&drops));
        let clone_a = cell.clone();
        let clone_b = cell.clone();

        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clone_a);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(clone_b);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_upgrade_fails_once_destructed() {
        let cell = Shared::new(42u32);
        let weak = cell.downgrade();
        assert!(weak.upgrade().is_some());

        drop(cell);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn weak_ref_does_not_delay_destructor() {
        let drops = AtomicUsize::new(0);
        let cell = Shared::new(Counting(&drops));
        let weak = cell.downgrade();

        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(weak);
    }

    #[test]
    fn cond_wait_wakes_on_notify() {
        use std::sync::Arc as StdArc;
        use std::thread;
        use std::time::Duration;

        let cell = StdArc::new(Shared::new(false));
        let waiter = StdArc::clone(&cell);
        let handle = thread::spawn(move || {
            let mut guard = waiter.lock();
            while !*guard {
                guard = waiter.cond_wait(guard);
            }
        });

        thread::sleep(Duration::from_millis(20));
        *cell.lock() = true;
        cell.notify_all();

        handle.join().expect("waiter thread panicked");
    }
}
