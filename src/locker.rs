//! Per-path readers–writer locks for local store concurrency.
//!
//! One process-wide table maps relative paths to lock state. Any number of
//! readers may hold a path concurrently; a writer requires exclusivity.
//! Entries are created on first use and removed once idle, so the table only
//! grows with actively contended paths.
//!
//! Guards release on drop, covering every exit path. Two-path acquisition
//! (rename) always locks in lexicographic order so that concurrent
//! `rename(a, b)` / `rename(b, a)` cannot deadlock.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    /// Threads blocked on this path; entries with waiters are never removed.
    waiters: usize,
}

impl LockState {
    fn idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.waiters == 0
    }
}

/// Process-wide path lock table.
#[derive(Default)]
pub struct PathLocker {
    paths: Mutex<HashMap<String, LockState>>,
    released: Condvar,
}

impl PathLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock; blocks while a writer holds the path.
    pub fn read(&self, path: &str) -> ReadGuard<'_> {
        let mut paths = self.paths.lock();
        loop {
            let state = paths.entry(path.to_string()).or_default();
            if !state.writer {
                state.readers += 1;
                return ReadGuard {
                    locker: self,
                    path: path.to_string(),
                };
            }
            state.waiters += 1;
            self.released.wait(&mut paths);
            // Re-check under the lock: spurious wakeups are fine.
            if let Some(state) = paths.get_mut(path) {
                state.waiters -= 1;
            }
        }
    }

    /// Acquire an exclusive lock; blocks while any reader or writer holds
    /// the path.
    pub fn write(&self, path: &str) -> WriteGuard<'_> {
        let mut paths = self.paths.lock();
        loop {
            let state = paths.entry(path.to_string()).or_default();
            if state.readers == 0 && !state.writer {
                state.writer = true;
                return WriteGuard {
                    locker: self,
                    path: path.to_string(),
                };
            }
            state.waiters += 1;
            self.released.wait(&mut paths);
            if let Some(state) = paths.get_mut(path) {
                state.waiters -= 1;
            }
        }
    }

    /// Acquire exclusive locks on two paths in lexicographic order.
    ///
    /// Equal paths collapse to a single lock.
    pub fn write_pair<'a>(&'a self, a: &str, b: &str) -> (WriteGuard<'a>, Option<WriteGuard<'a>>) {
        if a == b {
            return (self.write(a), None);
        }
        if a < b {
            let first = self.write(a);
            let second = self.write(b);
            (first, Some(second))
        } else {
            let first = self.write(b);
            let second = self.write(a);
            (first, Some(second))
        }
    }

    fn release_read(&self, path: &str) {
        let mut paths = self.paths.lock();
        if let Some(state) = paths.get_mut(path) {
            state.readers = state.readers.saturating_sub(1);
            if state.idle() {
                paths.remove(path);
            }
        }
        drop(paths);
        self.released.notify_all();
    }

    fn release_write(&self, path: &str) {
        let mut paths = self.paths.lock();
        if let Some(state) = paths.get_mut(path) {
            state.writer = false;
            if state.idle() {
                paths.remove(path);
            }
        }
        drop(paths);
        self.released.notify_all();
    }

    /// Number of tracked paths (held or contended).
    pub fn active_paths(&self) -> usize {
        self.paths.lock().len()
    }
}

/// Shared lock handle; releases on drop.
pub struct ReadGuard<'a> {
    locker: &'a PathLocker,
    path: String,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.locker.release_read(&self.path);
    }
}

/// Exclusive lock handle; releases on drop.
pub struct WriteGuard<'a> {
    locker: &'a PathLocker,
    path: String,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.locker.release_write(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        let locker = PathLocker::new();

        let r1 = locker.read("a");
        let r2 = locker.read("a");
        assert_eq!(locker.active_paths(), 1);
        drop(r1);
        drop(r2);

        let w = locker.write("a");
        drop(w);
        assert_eq!(locker.active_paths(), 0);
    }

    #[test]
    fn writer_waits_for_readers() {
        let locker = Arc::new(PathLocker::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let guard = locker.read("x");

        let locker2 = Arc::clone(&locker);
        let entered2 = Arc::clone(&entered);
        let handle = thread::spawn(move || {
            let _w = locker2.write("x");
            entered2.store(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        drop(guard);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(locker.active_paths(), 0);
    }

    #[test]
    fn writers_serialize() {
        let locker = Arc::new(PathLocker::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locker = Arc::clone(&locker);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _w = locker.write("shared");
                    let value = counter.load(Ordering::SeqCst);
                    counter.store(value + 1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }

    #[test]
    fn pair_ordering_prevents_deadlock() {
        let locker = Arc::new(PathLocker::new());
        let mut handles = Vec::new();

        for flip in [false, true] {
            let locker = Arc::clone(&locker);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let (a, b) = if flip { ("p", "q") } else { ("q", "p") };
                    let _guards = locker.write_pair(a, b);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locker.active_paths(), 0);
    }

    #[test]
    fn pair_with_equal_paths() {
        let locker = PathLocker::new();
        let (first, second) = locker.write_pair("same", "same");
        assert!(second.is_none());
        drop(first);
        assert_eq!(locker.active_paths(), 0);
    }
}
