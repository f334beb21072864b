// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-aware stand-ins for the blocking syscalls a fiber running under an
//! [`crate::io_manager::IoManager`] would otherwise stall a whole OS thread
//! on.
//!
//! Every wrapper here is only meaningful when called from inside a fiber
//! dispatched by a scheduler whose reactor is an `IoManager`
//! ([`crate::io_manager::current`] / [`crate::scheduler::current_task_fiber`]
//! must both return `Some`); called from anywhere else, the non-socket or
//! hooks-disabled fast paths still work but the retry-on-would-block path
//! panics.

use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fd::{self, Event, TimeoutKind};
use crate::fiber;
use crate::io_manager;
use crate::scheduler;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether hook wrappers should retry-on-would-block for the calling
/// thread. Fibers doing their own raw, non-retrying I/O (or code running
/// before an `IoManager` exists) can disable this locally.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(Cell::get)
}

pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

fn raw_result(rc: isize) -> io::Result<isize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// The retry-on-would-block template every read/write-shaped wrapper below
/// is built on: call `attempt` once; if it reports `EAGAIN`/`EWOULDBLOCK`
/// on a hooked, blocking socket, register an event for the current fiber
/// (with a conditional timeout timer mirroring the fd's configured
/// `SO_RCVTIMEO`/`SO_SNDTIMEO`), yield, and retry once the event or the
/// timer fires.
pub fn do_io<F>(fd: RawFd, event: Event, timeout_kind: TimeoutKind, mut attempt: F) -> io::Result<isize>
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return raw_result(attempt());
    }

    let Some(ctx) = fd::global().get(fd, false) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw_result(attempt());
    }

    loop {
        let rc = attempt();
        if rc >= 0 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        let errno = err.raw_os_error();
        if errno == Some(libc::EINTR) {
            continue;
        }
        if errno != Some(libc::EAGAIN) && errno != Some(libc::EWOULDBLOCK) {
            return Err(err);
        }

        let manager = io_manager::current()
            .expect("hook::io retry path requires a current IoManager");
        let fiber = scheduler::current_task_fiber()
            .expect("hook::io retry path requires a currently scheduled fiber");

        let timeout_ms = ctx.timeout(timeout_kind);
        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = (timeout_ms != fd::NO_TIMEOUT).then(|| {
            let cancelled2 = cancelled.clone();
            let manager2 = manager.clone();
            manager.timers().add_conditional_timer(
                timeout_ms,
                move || {
                    cancelled2.store(true, Ordering::SeqCst);
                    manager2.cancel_event(fd, event);
                },
                Arc::downgrade(&fiber),
                false,
            )
        });

        if manager.add_event_for_current_fiber(fd, event).is_err() {
            if let Some(t) = &timer {
                t.cancel();
            }
            return Err(io::Error::last_os_error());
        }

        scheduler::suppress_auto_reschedule();
        fiber::yield_now();

        if let Some(t) = &timer {
            t.cancel();
        }
        if cancelled.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
    }
}

fn fiber_sleep(total: Duration) {
    let manager = io_manager::current().expect("hook::io::sleep requires a current IoManager");
    let fiber = scheduler::current_task_fiber()
        .expect("hook::io::sleep requires a currently scheduled fiber");
    let ms = total.as_millis().min(u64::MAX as u128) as u64;
    manager.timers().add_conditional_timer(
        ms,
        {
            let manager = manager.clone();
            let witness = fiber.clone();
            move || manager.scheduler().schedule_fiber(witness.clone(), None)
        },
        Arc::downgrade(&fiber),
        false,
    );
    scheduler::suppress_auto_reschedule();
    fiber::yield_now();
}

pub fn sleep_ms(ms: u64) {
    fiber_sleep(Duration::from_millis(ms));
}

pub fn usleep_us(us: u64) {
    fiber_sleep(Duration::from_micros(us));
}

pub fn nanosleep(duration: Duration) {
    fiber_sleep(duration);
}

/// Like libc `socket(2)`, but registers the new fd in the process-wide
/// fd-context table on success.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    // Safety: a plain `socket(2)` call with caller-supplied arguments.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    fd::global().get(fd, true);
    Ok(fd)
}

/// `connect(2)` with an optional timeout; `timeout_ms == fd::NO_TIMEOUT`
/// means block according to the fd's own blocking mode (no extra timer).
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> io::Result<()> {
    if !is_enabled() {
        // Safety: `addr`/`addrlen` describe a valid sockaddr for the
        // duration of this call, per this function's own contract.
        let rc = unsafe { libc::connect(fd, addr, addrlen) };
        return raw_result(rc as isize).map(|_| ());
    }

    let Some(ctx) = fd::global().get(fd, false) else {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    };
    if ctx.is_closed() || !ctx.is_socket() || ctx.user_nonblock() {
        // Safety: as above.
        let rc = unsafe { libc::connect(fd, addr, addrlen) };
        return raw_result(rc as isize).map(|_| ());
    }

    // Safety: as above; the fd is non-blocking so this returns promptly
    // either with success, a real error, or EINPROGRESS.
    let rc = unsafe { libc::connect(fd, addr, addrlen) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let manager = io_manager::current().expect("hook::io::connect requires a current IoManager");
    let fiber = scheduler::current_task_fiber()
        .expect("hook::io::connect requires a currently scheduled fiber");

    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = (timeout_ms != fd::NO_TIMEOUT).then(|| {
        let cancelled2 = cancelled.clone();
        let manager2 = manager.clone();
        manager.timers().add_conditional_timer(
            timeout_ms,
            move || {
                cancelled2.store(true, Ordering::SeqCst);
                manager2.cancel_event(fd, Event::Write);
            },
            Arc::downgrade(&fiber),
            false,
        )
    });

    manager
        .add_event_for_current_fiber(fd, Event::Write)
        .map_err(|_| io::Error::last_os_error())?;
    scheduler::suppress_auto_reschedule();
    fiber::yield_now();
    if let Some(t) = &timer {
        t.cancel();
    }
    if cancelled.load(Ordering::SeqCst) {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    let mut sock_err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: `sock_err`/`len` are valid, correctly sized out-params.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut sock_err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if sock_err != 0 {
        return Err(io::Error::from_raw_os_error(sock_err));
    }
    Ok(())
}

pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<()> {
    connect_with_timeout(fd, addr, addrlen, fd::NO_TIMEOUT)
}

pub fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> io::Result<RawFd> {
    let rc = do_io(fd, Event::Read, TimeoutKind::Recv, || {
        // Safety: `addr`/`addrlen` are caller-provided out-params per this
        // function's own contract, valid for the duration of the call.
        unsafe { libc::accept(fd, addr, addrlen) as isize }
    })?;
    let new_fd = rc as RawFd;
    fd::global().get(new_fd, true);
    Ok(new_fd)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = do_io(fd, Event::Read, TimeoutKind::Recv, || {
        // Safety: `buf` is a valid, uniquely borrowed slice for the call.
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize }
    })?;
    Ok(rc as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    let rc = do_io(fd, Event::Read, TimeoutKind::Recv, || {
        // Safety: as in `read`.
        unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize }
    })?;
    Ok(rc as usize)
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> io::Result<usize> {
    let rc = do_io(fd, Event::Read, TimeoutKind::Recv, || {
        // Safety: `buf` and the address out-params are valid for the call.
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                src_addr,
                addrlen,
            ) as isize
        }
    })?;
    Ok(rc as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = do_io(fd, Event::Write, TimeoutKind::Send, || {
        // Safety: `buf` is a valid, immutably borrowed slice for the call.
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize }
    })?;
    Ok(rc as usize)
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    let rc = do_io(fd, Event::Write, TimeoutKind::Send, || {
        // Safety: as in `write`.
        unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) as isize }
    })?;
    Ok(rc as usize)
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    dst_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<usize> {
    let rc = do_io(fd, Event::Write, TimeoutKind::Send, || {
        // Safety: `buf` and `dst_addr` are valid for the call.
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                dst_addr,
                addrlen,
            ) as isize
        }
    })?;
    Ok(rc as usize)
}

/// Like libc `close(2)`, but first cancels any outstanding events on `fd`
/// and drops its fd-context entry.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_enabled() {
        if let Some(manager) = io_manager::current() {
            manager.cancel_all(fd);
        }
        fd::global().del(fd);
    }
    // Safety: `fd` is the caller's to close, per this function's contract.
    let rc = unsafe { libc::close(fd) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fcntl(fd, F_SETFL, flags)`, shadowing the user's requested `O_NONBLOCK`
/// bit in the fd's context rather than forwarding it: sockets stay
/// kernel-nonblocking always, and hook wrappers decide when to retry based
/// on `user_nonblock` instead.
pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    let user_nonblock = flags & libc::O_NONBLOCK != 0;
    if let Some(ctx) = fd::global().get(fd, false) {
        ctx.set_user_nonblock(user_nonblock);
    }
    let actual_flags = flags | libc::O_NONBLOCK;
    // Safety: a plain `fcntl` call with a previously-fetched flag set.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, actual_flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fcntl(fd, F_GETFL)`, reporting the flags the caller believes are in
/// effect (masking `O_NONBLOCK` in/out per `user_nonblock`) rather than the
/// kernel's always-nonblocking reality for sockets.
pub fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    // Safety: a plain `fcntl` call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(ctx) = fd::global().get(fd, false) {
        if ctx.is_socket() {
            return Ok(if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            });
        }
    }
    Ok(flags)
}

/// `ioctl(fd, FIONBIO, &on)`, recording the user's intent in the fd's
/// context the same way `fcntl_setfl` does.
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    if let Some(ctx) = fd::global().get(fd, false) {
        ctx.set_user_nonblock(on);
    }
    let mut value: libc::c_int = on as libc::c_int;
    // Safety: `value` is a valid, correctly sized argument for `FIONBIO`.
    let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut value) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pure pass-through: `getsockopt` has no hook-relevant special cases.
pub fn getsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> io::Result<()> {
    // Safety: `optval`/`optlen` are valid out-params per this function's
    // contract.
    let rc = unsafe { libc::getsockopt(fd, level, optname, optval, optlen) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `setsockopt`, shadowing `SO_RCVTIMEO`/`SO_SNDTIMEO` into the fd's
/// context (consulted by [`do_io`]) before always forwarding the real call.
pub fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> io::Result<()> {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        // Safety: `optval` points to at least a `timeval` per the size
        // check above.
        let tv = unsafe { &*(optval as *const libc::timeval) };
        let ms = (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;
        if let Some(ctx) = fd::global().get(fd, true) {
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, if ms == 0 { fd::NO_TIMEOUT } else { ms });
        }
    }

    // Safety: `optval`/`optlen` describe a valid option value per this
    // function's contract.
    let rc = unsafe { libc::setsockopt(fd, level, optname, optval, optlen) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_enabled_defaults_true_and_is_thread_local() {
        assert!(is_enabled());
        set_enabled(false);
        assert!(!is_enabled());
        set_enabled(true);
    }

    #[test]
    fn setsockopt_timeout_updates_fd_context() {
        let mut fds = [0 as RawFd; 2];
        // Safety: `fds` is a valid 2-element buffer.
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        let tv = libc::timeval { tv_sec: 1, tv_usec: 500_000 };
        setsockopt(
            fds[0],
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
        .unwrap();
        let ctx = fd::global().get(fds[0], false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        // Safety: fds opened above are ours to close.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
