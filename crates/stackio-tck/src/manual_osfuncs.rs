//! A deterministic `OsFuncs` test double.
//!
//! # Design background (Why)
//! `stackio-core`'s own unit tests and this crate's scenario tests need
//! to control exactly when a timer fires and exactly when a deferred
//! callback runs, rather than racing a real reactor thread
//! (`stackio_core::osfuncs::mio_impl::MioOsFuncs`). This mirrors the
//! grounding repo's `test_stubs` approach of hand-rolling a manually
//! pumped double for exactly the seams real tests need to control,
//! rather than mocking the whole contract generically.
//!
//! # Contract (What)
//! Nothing here runs on a background thread. [`ManualOsFuncs::advance`]
//! moves a virtual clock forward and fires any timers now due;
//! [`ManualOsFuncs::drain_deferred`] runs every currently queued
//! deferred callback (looping until none remain, since running one may
//! queue another); [`ManualOsFuncs::fire_read`]/`fire_write`/`fire_except`
//! let a test manually simulate FD readiness.
use stackio_core::osfuncs::{FdEvents, FdWatchId, LogLevel, Logger, OsFuncs, TimerId};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Watch {
    events: Arc<dyn FdEvents>,
    read_enabled: bool,
    write_enabled: bool,
    except_enabled: bool,
}

struct Timer {
    deadline: Duration,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    next_watch: u64,
    watches: HashMap<u64, Watch>,
    next_timer: u64,
    timers: HashMap<u64, Timer>,
    now: Duration,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

/// A silent logger: scenario tests assert on behavior, not log output.
struct NullLogger;
impl Logger for NullLogger {
    fn log(&self, _level: LogLevel, _target: &str, _message: &str) {}
}

/// Manually pumped `OsFuncs` double. Every method that would normally
/// touch a reactor thread instead records state a test can inspect or
/// drive via `advance`/`drain_deferred`/`fire_*`.
pub struct ManualOsFuncs {
    inner: Mutex<Inner>,
}

impl Default for ManualOsFuncs {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualOsFuncs {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_watch: 0,
                watches: HashMap::new(),
                next_timer: 0,
                timers: HashMap::new(),
                now: Duration::ZERO,
                deferred: Vec::new(),
            }),
        }
    }

    /// Move the virtual clock forward by `by` and fire every timer now
    /// due, in deadline order. Returns the number fired.
    pub fn advance(&self, by: Duration) -> usize {
        let due: Vec<(u64, Box<dyn FnOnce() + Send>)> = {
            let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
            guard.now += by;
            let now = guard.now;
            let mut due_ids: Vec<u64> = guard
                .timers
                .iter()
                .filter(|(_, t)| t.deadline <= now && t.callback.is_some())
                .map(|(id, _)| *id)
                .collect();
            due_ids.sort_by_key(|id| guard.timers[id].deadline);
            due_ids
                .into_iter()
                .filter_map(|id| guard.timers.remove(&id).and_then(|t| t.callback).map(|cb| (id, cb)))
                .collect()
        };
        let n = due.len();
        for (_, cb) in due {
            cb();
        }
        n
    }

    /// Run every currently queued deferred callback, looping until the
    /// queue is empty (a callback may itself defer further work).
    pub fn drain_deferred(&self) -> usize {
        let mut total = 0;
        loop {
            let batch: Vec<_> = {
                let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
                std::mem::take(&mut guard.deferred)
            };
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            for cb in batch {
                cb();
            }
        }
        total
    }

    pub fn fire_read(&self, watch: FdWatchId) {
        let events = {
            let guard = self.inner.lock().expect("manual osfuncs lock poisoned");
            guard.watches.get(&watch.0).filter(|w| w.read_enabled).map(|w| Arc::clone(&w.events))
        };
        if let Some(events) = events {
            events.read_ready();
        }
    }

    pub fn fire_write(&self, watch: FdWatchId) {
        let events = {
            let guard = self.inner.lock().expect("manual osfuncs lock poisoned");
            guard.watches.get(&watch.0).filter(|w| w.write_enabled).map(|w| Arc::clone(&w.events))
        };
        if let Some(events) = events {
            events.write_ready();
        }
    }

    pub fn fire_except(&self, watch: FdWatchId) {
        let events = {
            let guard = self.inner.lock().expect("manual osfuncs lock poisoned");
            guard.watches.get(&watch.0).filter(|w| w.except_enabled).map(|w| Arc::clone(&w.events))
        };
        if let Some(events) = events {
            events.except_ready();
        }
    }

    pub fn pending_timer_count(&self) -> usize {
        self.inner.lock().expect("manual osfuncs lock poisoned").timers.len()
    }
}

impl OsFuncs for ManualOsFuncs {
    fn register_fd(&self, _fd: RawFd, events: Arc<dyn FdEvents>) -> stackio_core::Result<FdWatchId> {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        let id = guard.next_watch;
        guard.next_watch += 1;
        guard.watches.insert(
            id,
            Watch {
                events,
                read_enabled: false,
                write_enabled: false,
                except_enabled: false,
            },
        );
        Ok(FdWatchId(id))
    }

    fn set_read_enabled(&self, watch: FdWatchId, enabled: bool) -> stackio_core::Result<()> {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        if let Some(w) = guard.watches.get_mut(&watch.0) {
            w.read_enabled = enabled;
        }
        Ok(())
    }

    fn set_write_enabled(&self, watch: FdWatchId, enabled: bool) -> stackio_core::Result<()> {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        if let Some(w) = guard.watches.get_mut(&watch.0) {
            w.write_enabled = enabled;
        }
        Ok(())
    }

    fn set_except_enabled(&self, watch: FdWatchId, enabled: bool) -> stackio_core::Result<()> {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        if let Some(w) = guard.watches.get_mut(&watch.0) {
            w.except_enabled = enabled;
        }
        Ok(())
    }

    fn clear_fd_handlers(&self, watch: FdWatchId, cleared: Box<dyn FnOnce() + Send>) {
        self.inner.lock().expect("manual osfuncs lock poisoned").watches.remove(&watch.0);
        self.defer(cleared);
    }

    fn start_timer(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        let id = guard.next_timer;
        guard.next_timer += 1;
        let deadline = guard.now + after;
        guard.timers.insert(id, Timer { deadline, callback: Some(callback) });
        TimerId(id)
    }

    fn stop_timer(&self, timer: TimerId, done: Box<dyn FnOnce(bool) + Send>) {
        let mut guard = self.inner.lock().expect("manual osfuncs lock poisoned");
        let already_firing = match guard.timers.get_mut(&timer.0) {
            Some(t) if t.callback.is_some() => {
                t.callback = None;
                guard.timers.remove(&timer.0);
                false
            }
            _ => true,
        };
        drop(guard);
        done(already_firing);
    }

    fn defer(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.lock().expect("manual osfuncs lock poisoned").deferred.push(callback);
    }

    fn logger(&self) -> &dyn Logger {
        &NullLogger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn timer_fires_only_after_advance_past_deadline() {
        let os = ManualOsFuncs::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        os.start_timer(Duration::from_millis(100), Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(os.advance(Duration::from_millis(50)), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(os.advance(Duration::from_millis(50)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_callbacks_only_run_on_drain() {
        let os = ManualOsFuncs::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        os.defer(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(os.drain_deferred(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_timer_before_due_reports_not_firing() {
        let os = ManualOsFuncs::new();
        let timer = os.start_timer(Duration::from_secs(10), Box::new(|| {}));
        let already = Arc::new(AtomicUsize::new(2));
        let already_clone = Arc::clone(&already);
        os.stop_timer(timer, Box::new(move |firing| {
            already_clone.store(if firing { 1 } else { 0 }, Ordering::SeqCst);
        }));
        assert_eq!(already.load(Ordering::SeqCst), 0);
        assert_eq!(os.pending_timer_count(), 0);
    }
}
