// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An epoll-backed reactor composed on top of [`Scheduler`] and
//! [`TimerManager`]: registers readiness interest on descriptors, wakes
//! parked workers through a self-pipe, and turns the scheduler's idle fiber
//! into the actual `epoll_wait` loop.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::fd::{self, Event, Waiter};
use crate::scheduler::{Reactor, Scheduler, SchedulerConfig};
use crate::timer::{OnTimerInsertedAtFront, TimerManager};

const DEFAULT_EPOLL_CAPACITY: usize = 256;
/// Upper bound on how long a single `epoll_wait` call blocks even with no
/// timers pending, so a reactor with no outstanding work still notices
/// `stop()` promptly.
const DEFAULT_MAX_EPOLL_WAIT_MS: i32 = 5000;

#[derive(Debug)]
pub enum Error {
    Epoll(io::Error),
    Pipe(io::Error),
    FdInit(RawFd),
    AlreadyRegistered(RawFd, Event),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Epoll(e) => write!(f, "epoll setup failed: {e}"),
            Error::Pipe(e) => write!(f, "tickle pipe setup failed: {e}"),
            Error::FdInit(fd) => write!(f, "fd {fd} could not be initialized"),
            Error::AlreadyRegistered(fd, event) => {
                write!(f, "fd {fd} already has a {event:?} event registered")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Epoll(e) | Error::Pipe(e) => Some(e),
            Error::FdInit(_) | Error::AlreadyRegistered(..) => None,
        }
    }
}

struct TickleHook(Weak<IoManager>);

impl OnTimerInsertedAtFront for TickleHook {
    fn on_timer_inserted_at_front(&self) {
        if let Some(io) = self.0.upgrade() {
            io.tickle();
        }
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<IoManager>>> = const { std::cell::RefCell::new(None) };
}

/// An I/O manager running the calling OS thread's worker loop, if any.
pub fn current() -> Option<Arc<IoManager>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Builder for [`IoManager`], generalizing the bare `(thread_count,
/// use_caller, name)` constructor with the knobs §4.6/§9 call out: the idle
/// fiber's `epoll_wait` ceiling, the epoll capacity hint (how many ready
/// events one `epoll_wait` call can report at once), and the stack size
/// given to fibers the underlying scheduler allocates.
#[derive(Debug, Clone)]
pub struct IoManagerConfig {
    name: String,
    thread_count: usize,
    use_caller: bool,
    idle_wait_ceiling_ms: i32,
    epoll_capacity_hint: usize,
    worker_stack_size: usize,
}

impl IoManagerConfig {
    /// Starts a config with `thread_count = 1`, `use_caller = false`, a
    /// 5000ms idle-wait ceiling, a 256-event epoll capacity hint, and the
    /// default fiber stack size.
    pub fn new(name: impl Into<String>) -> Self {
        IoManagerConfig {
            name: name.into(),
            thread_count: 1,
            use_caller: false,
            idle_wait_ceiling_ms: DEFAULT_MAX_EPOLL_WAIT_MS,
            epoll_capacity_hint: DEFAULT_EPOLL_CAPACITY,
            worker_stack_size: crate::fiber::stack::DEFAULT_STACK_SIZE,
        }
    }

    pub fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    /// Upper bound, in milliseconds, on a single `epoll_wait` call even with
    /// no timers pending. Generalizes the hard-coded `MAX_WAIT` of the
    /// original reactor loop.
    pub fn idle_wait_ceiling_ms(mut self, ms: i32) -> Self {
        self.idle_wait_ceiling_ms = ms;
        self
    }

    /// How many ready events a single `epoll_wait` call can report at once.
    pub fn epoll_capacity_hint(mut self, capacity: usize) -> Self {
        self.epoll_capacity_hint = capacity;
        self
    }

    pub fn worker_stack_size(mut self, stack_size: usize) -> Self {
        self.worker_stack_size = stack_size;
        self
    }

    pub fn build(self) -> io::Result<Arc<IoManager>> {
        IoManager::with_config(self)
    }
}

/// A [`Scheduler`] plus epoll-driven readiness events and wall-clock timers.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epoll_fd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    pending_event_count: AtomicUsize,
    closed: AtomicBool,
    self_weak: Weak<IoManager>,
    idle_wait_ceiling_ms: i32,
    epoll_capacity_hint: usize,
}

impl IoManager {
    /// Creates and starts an I/O manager named `name` with `thread_count`
    /// worker threads (see [`Scheduler::new`] for `use_caller`).
    ///
    /// Shorthand for [`IoManagerConfig::new`] with every other knob left at
    /// its default; use the config builder directly to override them.
    pub fn new(name: impl Into<String>, thread_count: usize, use_caller: bool) -> io::Result<Arc<Self>> {
        IoManagerConfig::new(name)
            .thread_count(thread_count)
            .use_caller(use_caller)
            .build()
    }

    fn with_config(config: IoManagerConfig) -> io::Result<Arc<Self>> {
        // Safety: `epoll_create1` takes a plain flags argument.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        // Safety: `pipe_fds` is a valid 2-element buffer.
        let rc = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            // Safety: `epoll_fd` was just created by us.
            unsafe { libc::close(epoll_fd) };
            return Err(e);
        }
        let (tickle_r, tickle_w) = (pipe_fds[0], pipe_fds[1]);

        // Safety: `tickle_r` is open (just created by `pipe`).
        let flags = unsafe { libc::fcntl(tickle_r, libc::F_GETFL, 0) };
        // Safety: as above; we only add O_NONBLOCK.
        unsafe { libc::fcntl(tickle_r, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_r as u64,
        };
        // Safety: `epoll_fd` and `tickle_r` are both open and owned by us.
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_r, &mut ev) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            // Safety: all three fds were just created by us.
            unsafe {
                libc::close(epoll_fd);
                libc::close(tickle_r);
                libc::close(tickle_w);
            }
            return Err(e);
        }

        let scheduler = SchedulerConfig::new(config.name)
            .thread_count(config.thread_count)
            .use_caller(config.use_caller)
            .stack_size(config.worker_stack_size)
            .build();

        let io = Arc::new_cyclic(|weak| IoManager {
            scheduler: scheduler.clone(),
            timers: TimerManager::with_hook(Box::new(TickleHook(weak.clone()))),
            epoll_fd,
            tickle_r,
            tickle_w,
            pending_event_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            self_weak: weak.clone(),
            idle_wait_ceiling_ms: config.idle_wait_ceiling_ms,
            epoll_capacity_hint: config.epoll_capacity_hint,
        });

        scheduler.set_reactor(io.clone());
        scheduler.start()?;

        Ok(io)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::Acquire)
    }

    fn epoll_ctl_for(&self, fd: RawFd, bits_before: u8, bits_after: u8) -> Result<(), Error> {
        let op = match (bits_before, bits_after) {
            (0, after) if after != 0 => libc::EPOLL_CTL_ADD,
            (_, 0) => libc::EPOLL_CTL_DEL,
            _ => libc::EPOLL_CTL_MOD,
        };
        let mut ev = libc::epoll_event {
            events: epoll_bits(bits_after),
            u64: fd as u64,
        };
        // Safety: `fd` is a descriptor the caller owns and `epoll_fd` is ours.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::Epoll(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Registers interest in `event` on `fd`, arranging for `waiter` to run
    /// on `self.scheduler()` once it fires. Fails if `event` is already
    /// registered on `fd`.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: Event, waiter: Waiter) -> Result<(), Error> {
        let ctx = fd::global().get(fd, true).ok_or(Error::FdInit(fd))?;
        let Some(before) = ctx.register_event(event, self.scheduler.clone(), waiter) else {
            return Err(Error::AlreadyRegistered(fd, event));
        };
        let after = before | event_bit(event);
        if let Err(e) = self.epoll_ctl_for(fd, before, after) {
            ctx.clear_event(event);
            return Err(e);
        }
        self.pending_event_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Convenience wrapper registering the currently running fiber as the
    /// waiter for `event` on `fd`.
    pub fn add_event_for_current_fiber(self: &Arc<Self>, fd: RawFd, event: Event) -> Result<(), Error> {
        let fiber = crate::scheduler::current_task_fiber()
            .expect("add_event_for_current_fiber called outside a scheduled fiber");
        self.add_event(fd, event, Waiter::Fiber(fiber))
    }

    /// Removes `event` from `fd` without running its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = fd::global().get(fd, false) else {
            return false;
        };
        let before = ctx.registered_bits();
        if before & event_bit(event) == 0 {
            return false;
        }
        let after = ctx.clear_event(event);
        if self.epoll_ctl_for(fd, before, after).is_err() {
            return false;
        }
        self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Removes `event` from `fd` and immediately schedules its waiter, as if
    /// it had fired (used to unblock a waiter on cancellation, e.g. a
    /// timeout).
    pub fn cancel_event(self: &Arc<Self>, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = fd::global().get(fd, false) else {
            return false;
        };
        let before = ctx.registered_bits();
        if before & event_bit(event) == 0 {
            return false;
        }
        let after = before & !event_bit(event);
        if self.epoll_ctl_for(fd, before, after).is_err() {
            return false;
        }
        self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        let (scheduler, waiter) = ctx.trigger_event(event);
        dispatch_waiter(&scheduler, waiter);
        true
    }

    /// Cancels every event registered on `fd`, scheduling each waiter.
    pub fn cancel_all(self: &Arc<Self>, fd: RawFd) -> bool {
        let Some(ctx) = fd::global().get(fd, false) else {
            return false;
        };
        let bits = ctx.registered_bits();
        if bits == 0 {
            return false;
        }
        // Safety: `fd` belongs to the caller; removing it from epoll here is
        // safe even if the fd is closed immediately afterward.
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc != 0 {
            return false;
        }
        for event in [Event::Read, Event::Write] {
            if bits & event_bit(event) != 0 {
                let (scheduler, waiter) = ctx.trigger_event(event);
                dispatch_waiter(&scheduler, waiter);
                self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
        true
    }

    /// Stops the underlying scheduler (draining and joining its workers)
    /// and releases the epoll fd and tickle pipe. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Safety: these fds are owned exclusively by this `IoManager` and
            // it is being torn down.
            unsafe {
                libc::close(self.epoll_fd);
                libc::close(self.tickle_r);
                libc::close(self.tickle_w);
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Safety: as in `stop`.
            unsafe {
                libc::close(self.epoll_fd);
                libc::close(self.tickle_r);
                libc::close(self.tickle_w);
            }
        }
    }
}

fn event_bit(event: Event) -> u8 {
    match event {
        Event::Read => 0b01,
        Event::Write => 0b10,
    }
}

fn epoll_bits(bits: u8) -> u32 {
    let mut flags = libc::EPOLLET as u32;
    if bits & event_bit(Event::Read) != 0 {
        flags |= libc::EPOLLIN as u32;
    }
    if bits & event_bit(Event::Write) != 0 {
        flags |= libc::EPOLLOUT as u32;
    }
    flags
}

fn dispatch_waiter(scheduler: &Arc<Scheduler>, waiter: Waiter) {
    match waiter {
        Waiter::Callback(cb) => scheduler.schedule_callback(cb, None),
        Waiter::Fiber(fiber) => scheduler.schedule_fiber(fiber, None),
    }
}

impl Reactor for IoManager {
    fn tickle(&self) {
        // Safety: `tickle_w` is the write end of our own pipe.
        unsafe {
            libc::write(self.tickle_w, b"T".as_ptr() as *const libc::c_void, 1);
        }
    }

    fn idle_pass(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; this.epoll_capacity_hint];
        let ceiling = this.idle_wait_ceiling_ms;
        let next_timeout = this
            .timers
            .next_timeout()
            .map(|ms| ms.min(ceiling as u64) as i32)
            .unwrap_or(ceiling);

        let n = loop {
            // Safety: `events` is a valid buffer of `this.epoll_capacity_hint`
            // entries and `epoll_fd` is ours.
            let rc = unsafe {
                libc::epoll_wait(this.epoll_fd, events.as_mut_ptr(), events.len() as i32, next_timeout)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(error = %err, "epoll_wait failed");
                break 0;
            }
            break rc;
        };

        for cb in this.timers.list_expired() {
            this.scheduler.schedule_callback(move || cb(), None);
        }

        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            if fd == this.tickle_r {
                let mut buf = [0u8; 256];
                // Safety: `buf` is a valid stack buffer; draining an
                // edge-triggered, non-blocking pipe read end to EAGAIN.
                while unsafe {
                    libc::read(this.tickle_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                } > 0 {}
                continue;
            }

            let Some(ctx) = fd::global().get(fd, false) else {
                continue;
            };

            let mut raw = event.events;
            if raw & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                raw |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
            }
            let bits = ctx.registered_bits();
            let mut real = 0u8;
            if raw & libc::EPOLLIN as u32 != 0 {
                real |= event_bit(Event::Read);
            }
            if raw & libc::EPOLLOUT as u32 != 0 {
                real |= event_bit(Event::Write);
            }
            real &= bits;
            if real == 0 {
                continue;
            }

            let remaining = bits & !real;
            if this.epoll_ctl_for(fd, bits, remaining).is_err() {
                continue;
            }

            for ev in [Event::Read, Event::Write] {
                if real & event_bit(ev) != 0 {
                    let (scheduler, waiter) = ctx.trigger_event(ev);
                    dispatch_waiter(&scheduler, waiter);
                    this.pending_event_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    fn stopping(&self) -> bool {
        self.scheduler.stop_requested()
            && self.scheduler.tasks_empty()
            && self.pending_event_count() == 0
            && self.timers.is_empty()
    }

    fn on_worker_start(&self) {
        if let Some(this) = self.self_weak.upgrade() {
            CURRENT.with(|c| *c.borrow_mut() = Some(this));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn add_event_fires_when_pipe_becomes_readable() {
        let io = IoManager::new("io-test", 2, false).unwrap();
        let mut fds = [0 as RawFd; 2];
        // Safety: `fds` is a valid 2-element buffer.
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let (r, w) = (fds[0], fds[1]);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(r, Event::Read, Waiter::Callback(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        })))
        .unwrap();

        // Safety: `w` is a valid, open write end.
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };

        std::thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));

        io.stop();
        // Safety: fds opened above are ours to close.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn cancel_event_runs_waiter_immediately() {
        let io = IoManager::new("io-test-cancel", 1, false).unwrap();
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let (r, w) = (fds[0], fds[1]);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        io.add_event(r, Event::Read, Waiter::Callback(Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        })))
        .unwrap();

        assert!(io.cancel_event(r, Event::Read));
        std::thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));

        io.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
