// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-descriptor event state and the process-wide fd-context table.
//!
//! Every descriptor the I/O manager watches gets an [`FdContext`] recording
//! which events are currently registered on it, who is waiting on each one,
//! and the socket-specific bookkeeping (`fcntl`/`setsockopt` shadowing) the
//! hook layer needs to keep user-visible blocking semantics intact while the
//! kernel fd itself is forced non-blocking.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use std::sync::Arc;

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

/// A readiness event a caller can register interest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    fn bit(self) -> u8 {
        match self {
            Event::Read => 0b01,
            Event::Write => 0b10,
        }
    }
}

/// Which kind of timeout a socket's `FdContext` tracks, mirroring
/// `SO_RCVTIMEO` / `SO_SNDTIMEO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// What runs when a registered event fires: either a plain callback, or a
/// specific suspended fiber that must be resumed by its scheduler.
pub enum Waiter {
    Callback(Box<dyn FnOnce() + Send + 'static>),
    Fiber(Arc<Fiber>),
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waiter::Callback(_) => f.write_str("Waiter::Callback(..)"),
            Waiter::Fiber(fiber) => f.debug_tuple("Waiter::Fiber").field(&fiber.id()).finish(),
        }
    }
}

/// The context bound to one registered event: who scheduled it and what to
/// run when it fires.
struct EventContext {
    scheduler: Arc<Scheduler>,
    waiter: Waiter,
}

/// Errors fd-table operations can fail with.
#[derive(Debug)]
pub enum Error {
    /// The descriptor's context could not be constructed (`fstat` failed, or
    /// forcing the socket non-blocking failed).
    Init(io::Error),
    /// `trigger_event` was asked to fire an event that was not registered.
    NotRegistered(i32, Event),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Init(e) => write!(f, "failed to initialize fd context: {e}"),
            Error::NotRegistered(fd, event) => {
                write!(f, "fd {fd} has no {event:?} event registered")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Init(e) => Some(e),
            Error::NotRegistered(..) => None,
        }
    }
}

/// Per-descriptor state: which events are registered, who is waiting on
/// each, and the socket-specific timeout/non-block shadowing the hook layer
/// relies on.
pub struct FdContext {
    fd: i32,
    is_socket: bool,
    is_closed: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
    /// Bitset of currently-registered events (`Event::bit()`), plus the
    /// per-event waiter. Guarded together since `trigger_event` must observe
    /// a consistent view of "is this event registered, and by whom".
    events: Mutex<EventsState>,
}

#[derive(Default)]
struct EventsState {
    bits: u8,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

/// `u64::MAX` represents "no timeout", matching the original's `(uint64_t)-1`.
pub const NO_TIMEOUT: u64 = u64::MAX;

impl FdContext {
    fn new(fd: i32) -> Result<Self, Error> {
        // Safety: `fd` is a plain integer; `fstat` validates it itself.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc != 0 {
            return Err(Error::Init(io::Error::last_os_error()));
        }
        let is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            // Safety: `fd` is open (fstat above succeeded).
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                // Safety: as above; we are only adding O_NONBLOCK.
                let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                if rc == 0 {
                    sys_nonblock = true;
                }
            } else if flags >= 0 {
                sys_nonblock = true;
            }
        }

        Ok(Self {
            fd,
            is_socket,
            is_closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            events: Mutex::new(EventsState::default()),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    /// Registers `event` with the given scheduler and waiter, provided it is
    /// not already registered. Returns the bitset of events that were
    /// already registered *before* this one was added (letting a caller
    /// decide `EPOLL_CTL_ADD` vs `_MOD`), or `None` if it was already
    /// registered.
    pub(crate) fn register_event(
        &self,
        event: Event,
        scheduler: Arc<Scheduler>,
        waiter: Waiter,
    ) -> Option<u8> {
        let mut state = self.lock_events();
        if state.bits & event.bit() != 0 {
            return None;
        }
        let before = state.bits;
        state.bits |= event.bit();
        let ctx = EventContext { scheduler, waiter };
        match event {
            Event::Read => state.read = Some(ctx),
            Event::Write => state.write = Some(ctx),
        }
        Some(before)
    }

    /// Clears `event`'s registration without running its waiter, returning
    /// the bitset of events still registered afterward. Used by `delEvent`,
    /// which is a pure reactor-state change.
    pub(crate) fn clear_event(&self, event: Event) -> u8 {
        let mut state = self.lock_events();
        state.bits &= !event.bit();
        match event {
            Event::Read => state.read = None,
            Event::Write => state.write = None,
        }
        state.bits
    }

    /// Bitset of currently-registered events.
    pub(crate) fn registered_bits(&self) -> u8 {
        self.lock_events().bits
    }

    fn lock_events(&self) -> MutexGuard<'_, EventsState> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clears `event`'s registration and hands its waiter back to the
    /// caller, who is responsible for scheduling it. This is the only path
    /// by which a registered event turns into scheduled work, whether the
    /// cause is readiness, a timeout, or a descriptor-wide cancellation.
    ///
    /// # Panics
    /// Panics if `event` is not currently registered.
    pub(crate) fn trigger_event(&self, event: Event) -> (Arc<Scheduler>, Waiter) {
        let mut state = self.lock_events();
        assert!(
            state.bits & event.bit() != 0,
            "fd {} has no {:?} event registered",
            self.fd,
            event
        );
        state.bits &= !event.bit();
        let ctx = match event {
            Event::Read => state.read.take(),
            Event::Write => state.write.take(),
        }
        .expect("registered bit set without a bound EventContext");
        (ctx.scheduler, ctx.waiter)
    }
}

impl fmt::Debug for FdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd)
            .field("is_socket", &self.is_socket)
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Process-wide table of `FdContext`s, indexed by fd number and grown by
/// ×1.5 as needed.
pub struct FdManager {
    // Initial capacity mirrors the corpus's starting size for this table.
    data: RwLock<Vec<Option<std::sync::Arc<FdContext>>>>,
}

const INITIAL_CAPACITY: usize = 64;

impl FdManager {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(INITIAL_CAPACITY);
        v.resize_with(INITIAL_CAPACITY, || None);
        Self {
            data: RwLock::new(v),
        }
    }

    /// Returns the context for `fd`, constructing and registering one if
    /// `auto_create` is set and none exists yet.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<std::sync::Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let table = self.data.read().unwrap();
            if idx < table.len() {
                if let Some(ctx) = &table[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut table = self.data.write().unwrap();
        if idx >= table.len() {
            let new_len = ((idx + 1) as f64 * 1.5).ceil() as usize;
            table.resize_with(new_len, || None);
        }
        if let Some(ctx) = &table[idx] {
            return Some(ctx.clone());
        }
        match FdContext::new(fd) {
            Ok(ctx) => {
                let ctx = std::sync::Arc::new(ctx);
                table[idx] = Some(ctx.clone());
                Some(ctx)
            }
            Err(e) => {
                tracing::warn!(fd, error = %e, "failed to initialize fd context");
                None
            }
        }
    }

    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut table = self.data.write().unwrap();
        if let Some(slot) = table.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: std::sync::OnceLock<FdManager> = std::sync::OnceLock::new();

/// The process-wide fd-context table.
pub fn global() -> &'static FdManager {
    GLOBAL.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_scheduler() -> Arc<Scheduler> {
        Scheduler::new("fd-test", 1, false)
    }

    #[test]
    fn get_auto_creates_and_caches() {
        let mgr = FdManager::new();
        // stdin is always fd 0 and always open in a test process.
        let a = mgr.get(0, true).unwrap();
        let b = mgr.get(0, true).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn get_without_auto_create_returns_none_for_unseen_fd() {
        let mgr = FdManager::new();
        assert!(mgr.get(3, false).is_none());
    }

    #[test]
    fn register_event_rejects_double_add() {
        let ctx = FdContext::new(0).unwrap();
        let scheduler = dummy_scheduler();
        assert_eq!(
            ctx.register_event(Event::Read, scheduler.clone(), Waiter::Callback(Box::new(|| {}))),
            Some(0)
        );
        assert_eq!(
            ctx.register_event(Event::Read, scheduler, Waiter::Callback(Box::new(|| {}))),
            None
        );
    }

    #[test]
    fn trigger_event_clears_registration() {
        let ctx = FdContext::new(0).unwrap();
        let scheduler = dummy_scheduler();
        ctx.register_event(Event::Write, scheduler.clone(), Waiter::Callback(Box::new(|| {})));
        let (returned, _waiter) = ctx.trigger_event(Event::Write);
        assert!(Arc::ptr_eq(&returned, &scheduler));
        assert_eq!(ctx.registered_bits(), 0);
    }

    #[test]
    fn del_marks_closed() {
        let mgr = FdManager::new();
        let ctx = mgr.get(0, true).unwrap();
        mgr.del(0);
        assert!(ctx.is_closed());
        assert!(mgr.get(0, false).is_none());
    }
}
