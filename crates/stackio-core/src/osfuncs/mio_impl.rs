//! A real [`OsFuncs`] backend built on `mio`.
//!
//! # Design background (Why)
//! `spec.md` names "OS handler selection" a Non-goal, but a Non-goal on
//! *which* reactor is pluggable is not license to ship zero reactors —
//! the FD Lower Layer (`spec.md` §4.D) is unusable without one. `mio`
//! already appears in this retrieval pack (`flux-network`'s transport
//! layer), so it is the natural choice over hand-rolling `epoll`/`kqueue`
//! FFI.
//!
//! # Contract (What)
//! One background thread owns the `mio::Poll` instance, the FD registry,
//! the sorted timer list, and the deferred-callback queue. Every
//! `OsFuncs` method (other than `logger()`) only ever touches a
//! `Mutex`-guarded [`Shared`] and then taps the `mio::Waker` to kick the
//! poll loop out of its blocking wait, so callers never block and never
//! need to be the reactor thread themselves.
//!
//! # Trade-offs
//! The timer list is a `Vec` scanned linearly on each wakeup rather than
//! a binary heap. Endpoints carry at most a small constant number of
//! live timers (handshake deadlines), so this trades a theoretically
//! worse asymptote for simplicity; revisit if a host ever multiplexes
//! thousands of timers through one `MioOsFuncs`.
use super::{FdEvents, FdWatchId, Logger, OsFuncs, TimerId, TracingLogger};
use crate::error::{ErrorKind, Result, StackError};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(usize::MAX);

struct Watch {
    fd: RawFd,
    events: Arc<dyn FdEvents>,
    read_enabled: bool,
    write_enabled: bool,
    except_enabled: bool,
    cleared: Option<Box<dyn FnOnce() + Send>>,
    pending_clear: bool,
    /// Whether this fd currently has a live `mio::Registry` registration.
    /// mio requires `register` before any `reregister`/`deregister` call
    /// for a token; this tracks which call is next.
    registered: bool,
}

struct ScheduledTimer {
    id: TimerId,
    deadline: Instant,
    callback: Option<Box<dyn FnOnce() + Send>>,
    stop_done: Option<Box<dyn FnOnce(bool) + Send>>,
}

struct Shared {
    watches: HashMap<Token, Watch>,
    timers: Vec<ScheduledTimer>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
    shutdown: bool,
}

/// An `OsFuncs` implementation backed by a single `mio::Poll` reactor
/// thread. Safe to share across threads via `Arc`; all mutation funnels
/// through [`Shared`] and a wake of the reactor thread.
pub struct MioOsFuncs {
    shared: Arc<Mutex<Shared>>,
    waker: Arc<Waker>,
    next_token: AtomicU64,
    next_timer: AtomicU64,
    logger: Box<dyn Logger>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MioOsFuncs {
    /// Spawn the reactor thread and return a handle to it. The reactor
    /// runs until every `Arc<MioOsFuncs>` clone is dropped and the thread
    /// observes `shutdown`; call [`MioOsFuncs::shutdown`] to request that
    /// explicitly (e.g. from tests) rather than relying on `Drop` timing.
    pub fn spawn() -> Result<Arc<Self>> {
        Self::spawn_with_logger(Box::new(TracingLogger))
    }

    pub fn spawn_with_logger(logger: Box<dyn Logger>) -> Result<Arc<Self>> {
        let poll = Poll::new().map_err(StackError::from)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(StackError::from)?);
        let shared = Arc::new(Mutex::new(Shared {
            watches: HashMap::new(),
            timers: Vec::new(),
            deferred: Vec::new(),
            shutdown: false,
        }));

        let this = Arc::new(Self {
            shared: Arc::clone(&shared),
            waker: Arc::clone(&waker),
            next_token: AtomicU64::new(0),
            next_timer: AtomicU64::new(0),
            logger,
            join: Mutex::new(None),
        });

        let reactor_shared = shared;
        let handle = thread::Builder::new()
            .name("stackio-mio-reactor".into())
            .spawn(move || reactor_loop(poll, reactor_shared))
            .map_err(|e| StackError::new(ErrorKind::Transport, "failed to spawn reactor thread").with_source(e))?;
        *this.join.lock().expect("reactor lock poisoned") = Some(handle);

        Ok(this)
    }

    /// Ask the reactor thread to stop and join it. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut shared = self.shared.lock().expect("reactor lock poisoned");
            if shared.shutdown {
                return;
            }
            shared.shutdown = true;
        }
        let _ = self.waker.wake();
        if let Some(handle) = self.join.lock().expect("reactor lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MioOsFuncs {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl OsFuncs for MioOsFuncs {
    fn register_fd(&self, fd: RawFd, events: Arc<dyn FdEvents>) -> Result<FdWatchId> {
        let token_id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let token = Token(token_id as usize);

        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        shared.watches.insert(
            token,
            Watch {
                fd,
                events,
                read_enabled: false,
                write_enabled: false,
                except_enabled: false,
                cleared: None,
                pending_clear: false,
                registered: false,
            },
        );
        drop(shared);
        let _ = self.waker.wake();
        Ok(FdWatchId(token_id))
    }

    fn set_read_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()> {
        self.set_interest(watch, |w| w.read_enabled = enabled)
    }

    fn set_write_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()> {
        self.set_interest(watch, |w| w.write_enabled = enabled)
    }

    fn set_except_enabled(&self, watch: FdWatchId, enabled: bool) -> Result<()> {
        self.set_interest(watch, |w| w.except_enabled = enabled)
    }

    fn clear_fd_handlers(&self, watch: FdWatchId, cleared: Box<dyn FnOnce() + Send>) {
        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        let token = Token(watch.0 as usize);
        if let Some(w) = shared.watches.get_mut(&token) {
            w.pending_clear = true;
            w.cleared = Some(cleared);
        } else {
            drop(shared);
            // Already gone: honor the "always via defer" contract anyway.
            self.defer(cleared);
            return;
        }
        drop(shared);
        let _ = self.waker.wake();
    }

    fn start_timer(&self, after: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        shared.timers.push(ScheduledTimer {
            id,
            deadline: Instant::now() + after,
            callback: Some(callback),
            stop_done: None,
        });
        drop(shared);
        let _ = self.waker.wake();
        id
    }

    fn stop_timer(&self, timer: TimerId, done: Box<dyn FnOnce(bool) + Send>) {
        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        if let Some(t) = shared.timers.iter_mut().find(|t| t.id == timer) {
            if t.callback.is_some() {
                // Not yet fired: remove it and report clean cancellation.
                t.callback = None;
                drop(shared);
                done(false);
                return;
            }
        }
        drop(shared);
        // Already fired (or unknown id): already firing/fired.
        done(true);
    }

    fn defer(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        shared.deferred.push(callback);
        drop(shared);
        let _ = self.waker.wake();
    }

    fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }
}

impl MioOsFuncs {
    fn set_interest(&self, watch: FdWatchId, f: impl FnOnce(&mut Watch)) -> Result<()> {
        let mut shared = self.shared.lock().expect("reactor lock poisoned");
        let token = Token(watch.0 as usize);
        match shared.watches.get_mut(&token) {
            Some(w) => {
                f(w);
                drop(shared);
                let _ = self.waker.wake();
                Ok(())
            }
            None => Err(StackError::new(ErrorKind::Inval, "unknown fd watch")),
        }
    }
}

/// Reactor-thread body. Holds no public API: all interaction happens via
/// `Shared`, mutated from other threads and woken via `Waker`.
fn reactor_loop(mut poll: Poll, shared: Arc<Mutex<Shared>>) {
    let mut events = Events::with_capacity(128);

    loop {
        let timeout = next_timeout(&shared);
        // Registration happens lazily below, right before poll, so a
        // fd's interest reflects whatever the last setter call asked for
        // without needing incremental mio re-register bookkeeping here.
        sync_registrations(&mut poll, &shared);

        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => continue,
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            dispatch_event(&shared, event);
        }

        if run_expired_timers(&shared) {
            // timers already notified their callbacks outside the lock
        }
        run_deferred(&shared);
        run_pending_clears(&shared);

        if shared.lock().expect("reactor lock poisoned").shutdown {
            break;
        }
    }
}

fn next_timeout(shared: &Arc<Mutex<Shared>>) -> Duration {
    const POLL_CEILING: Duration = Duration::from_millis(50);
    let guard = shared.lock().expect("reactor lock poisoned");
    let now = Instant::now();
    guard
        .timers
        .iter()
        .filter(|t| t.callback.is_some())
        .map(|t| t.deadline.saturating_duration_since(now))
        .min()
        .map(|d| d.min(POLL_CEILING))
        .unwrap_or(POLL_CEILING)
}

fn sync_registrations(poll: &mut Poll, shared: &Arc<Mutex<Shared>>) {
    let mut guard = shared.lock().expect("reactor lock poisoned");
    let registry = poll.registry();
    for (token, watch) in guard.watches.iter_mut() {
        let mut interest: Option<Interest> = None;
        if watch.read_enabled || watch.except_enabled {
            interest = Some(Interest::READABLE);
        }
        if watch.write_enabled {
            interest = Some(interest.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
        }
        let mut source = mio::unix::SourceFd(&watch.fd);
        match interest {
            Some(i) if watch.registered => {
                let _ = registry.reregister(&mut source, *token, i);
            }
            Some(i) => {
                if registry.register(&mut source, *token, i).is_ok() {
                    watch.registered = true;
                }
            }
            None if watch.registered => {
                let _ = registry.deregister(&mut source);
                watch.registered = false;
            }
            None => {}
        }
    }
}

fn dispatch_event(shared: &Arc<Mutex<Shared>>, event: &mio::event::Event) {
    let guard = shared.lock().expect("reactor lock poisoned");
    let watch = match guard.watches.get(&event.token()) {
        Some(w) if !w.pending_clear => w,
        _ => return,
    };
    let events = Arc::clone(&watch.events);
    let readable = event.is_readable() && watch.read_enabled;
    let writable = event.is_writable() && watch.write_enabled;
    let excepted = event.is_error() && watch.except_enabled;
    drop(guard);

    // Up-calls fire outside the lock: a filter/LL handler may re-enter
    // `OsFuncs` (e.g. to disable the watch it is currently servicing).
    if readable {
        events.read_ready();
    }
    if writable {
        events.write_ready();
    }
    if excepted {
        events.except_ready();
    }
}

fn run_expired_timers(shared: &Arc<Mutex<Shared>>) -> bool {
    let now = Instant::now();
    let mut fired = Vec::new();
    {
        let mut guard = shared.lock().expect("reactor lock poisoned");
        let mut i = 0;
        while i < guard.timers.len() {
            if guard.timers[i].deadline <= now && guard.timers[i].callback.is_some() {
                let timer = guard.timers.remove(i);
                if let Some(cb) = timer.callback {
                    fired.push(cb);
                }
            } else {
                i += 1;
            }
        }
        guard.timers.retain(|t| t.callback.is_some());
    }
    let any = !fired.is_empty();
    for cb in fired {
        cb();
    }
    any
}

fn run_deferred(shared: &Arc<Mutex<Shared>>) {
    let batch: Vec<_> = {
        let mut guard = shared.lock().expect("reactor lock poisoned");
        std::mem::take(&mut guard.deferred)
    };
    for cb in batch {
        cb();
    }
}

fn run_pending_clears(shared: &Arc<Mutex<Shared>>) {
    let mut callbacks = Vec::new();
    {
        let mut guard = shared.lock().expect("reactor lock poisoned");
        let tokens: Vec<Token> = guard
            .watches
            .iter()
            .filter(|(_, w)| w.pending_clear)
            .map(|(t, _)| *t)
            .collect();
        for token in tokens {
            if let Some(mut w) = guard.watches.remove(&token) {
                if let Some(cb) = w.cleared.take() {
                    callbacks.push(cb);
                }
            }
        }
    }
    for cb in callbacks {
        cb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    struct RecordingEvents {
        read: Arc<AtomicBool>,
    }
    impl FdEvents for RecordingEvents {
        fn read_ready(&self) {
            self.read.store(true, Ordering::SeqCst);
        }
        fn write_ready(&self) {}
        fn except_ready(&self) {}
    }

    #[test]
    fn timer_fires_after_duration() {
        let reactor = MioOsFuncs::spawn().expect("spawn reactor");
        let (tx, rx) = mpsc::channel();
        reactor.start_timer(Duration::from_millis(5), Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(2)).expect("timer should fire");
        reactor.shutdown();
    }

    #[test]
    fn stop_timer_before_fire_reports_not_already_firing() {
        let reactor = MioOsFuncs::spawn().expect("spawn reactor");
        let timer = reactor.start_timer(Duration::from_secs(30), Box::new(|| {}));
        let (tx, rx) = mpsc::channel();
        reactor.stop_timer(timer, Box::new(move |already_firing| {
            let _ = tx.send(already_firing);
        }));
        let already_firing = rx.recv_timeout(Duration::from_secs(2)).expect("done callback");
        assert!(!already_firing);
        reactor.shutdown();
    }

    #[test]
    fn defer_runs_on_reactor_thread() {
        let reactor = MioOsFuncs::spawn().expect("spawn reactor");
        let (tx, rx) = mpsc::channel();
        reactor.defer(Box::new(move || {
            let _ = tx.send(thread::current().name().map(|s| s.to_string()));
        }));
        let name = rx.recv_timeout(Duration::from_secs(2)).expect("deferred should run");
        assert_eq!(name.as_deref(), Some("stackio-mio-reactor"));
        reactor.shutdown();
    }
}
