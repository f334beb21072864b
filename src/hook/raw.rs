// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `LD_PRELOAD` interposition: the same retry-on-would-block behavior as
//! [`super::io`], exposed as `#[no_mangle] extern "C"` symbols that shadow
//! libc's own, resolved lazily via `dlsym(RTLD_NEXT, ...)`.
//!
//! Only built with the `preload` feature; a binary built this way is meant
//! to be `LD_PRELOAD`ed in front of unmodified code that calls the plain
//! libc functions directly, rather than `hook::io` explicitly.

use std::ffi::{c_int, c_void, CString};
use std::io;
use std::os::fd::RawFd;
use std::sync::OnceLock;

use super::io as hooked;

type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize;
type WriteFn = unsafe extern "C" fn(c_int, *const c_void, usize) -> isize;
type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int;
type AcceptFn = unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int;
type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, usize, c_int) -> isize;
type SendFn = unsafe extern "C" fn(c_int, *const c_void, usize, c_int) -> isize;
type SleepFn = unsafe extern "C" fn(c_uint_compat) -> c_uint_compat;
type UsleepFn = unsafe extern "C" fn(libc::useconds_t) -> c_int;

// `libc::sleep`'s return type is `c_uint` on every target Rust supports;
// named here only so the function-pointer typedef above reads cleanly.
type c_uint_compat = libc::c_uint;

fn resolve<T: Copy>(cell: &OnceLock<usize>, name: &str) -> T {
    let addr = *cell.get_or_init(|| {
        let cname = CString::new(name).expect("symbol name has no interior NUL");
        // Safety: `RTLD_NEXT` looks up the next definition of `name` after
        // this interposing library, which is how `LD_PRELOAD` shadowing
        // is meant to be used.
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        assert!(!sym.is_null(), "dlsym(RTLD_NEXT, {name}) returned NULL");
        sym as usize
    });
    // Safety: `T` is always one of the `unsafe extern "C" fn(...)` aliases
    // above, which have the same size/layout as a function pointer; the
    // resolved address came from `dlsym` against the real libc symbol of
    // matching name and signature.
    unsafe { std::mem::transmute_copy::<usize, T>(&addr) }
}

macro_rules! real_fn {
    ($fname:ident, $ty:ty, $sym:expr) => {
        fn $fname() -> $ty {
            static CELL: OnceLock<usize> = OnceLock::new();
            resolve(&CELL, $sym)
        }
    };
}

real_fn!(real_read, ReadFn, "read");
real_fn!(real_write, WriteFn, "write");
real_fn!(real_close, CloseFn, "close");
real_fn!(real_socket, SocketFn, "socket");
real_fn!(real_connect, ConnectFn, "connect");
real_fn!(real_accept, AcceptFn, "accept");
real_fn!(real_recv, RecvFn, "recv");
real_fn!(real_send, SendFn, "send");
real_fn!(real_sleep, SleepFn, "sleep");
real_fn!(real_usleep, UsleepFn, "usleep");

fn in_fiber() -> bool {
    hooked::is_enabled() && crate::scheduler::current_task_fiber().is_some()
}

fn to_rc(result: io::Result<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            // Safety: writing to the calling thread's own `errno` location.
            unsafe {
                *libc::__errno_location() = errno;
            }
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: RawFd, buf: *mut c_void, count: usize) -> isize {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `read(2)`.
        return unsafe { real_read()(fd, buf, count) };
    }
    // Safety: `buf`/`count` describe a valid buffer per this function's own
    // `extern "C"` contract, matching libc's `read(2)`.
    let slice = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, count) };
    to_rc(hooked::read(fd, slice))
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: RawFd, buf: *const c_void, count: usize) -> isize {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `write(2)`.
        return unsafe { real_write()(fd, buf, count) };
    }
    // Safety: as in `read`.
    let slice = unsafe { std::slice::from_raw_parts(buf as *const u8, count) };
    to_rc(hooked::write(fd, slice))
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: RawFd) -> c_int {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `close(2)`.
        return unsafe { real_close()(fd) };
    }
    match hooked::close(fd) {
        Ok(()) => 0,
        Err(e) => {
            // Safety: as in `to_rc`.
            unsafe {
                *libc::__errno_location() = e.raw_os_error().unwrap_or(libc::EIO);
            }
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `socket(2)`.
        return unsafe { real_socket()(domain, ty, protocol) };
    }
    match hooked::socket(domain, ty, protocol) {
        Ok(fd) => fd,
        Err(e) => {
            // Safety: as in `to_rc`.
            unsafe {
                *libc::__errno_location() = e.raw_os_error().unwrap_or(libc::EIO);
            }
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> c_int {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `connect(2)`.
        return unsafe { real_connect()(fd, addr, addrlen) };
    }
    match hooked::connect(fd, addr, addrlen) {
        Ok(()) => 0,
        Err(e) => {
            // Safety: as in `to_rc`.
            unsafe {
                *libc::__errno_location() = e.raw_os_error().unwrap_or(libc::EIO);
            }
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> c_int {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `accept(2)`.
        return unsafe { real_accept()(fd, addr, addrlen) };
    }
    match hooked::accept(fd, addr, addrlen) {
        Ok(new_fd) => new_fd,
        Err(e) => {
            // Safety: as in `to_rc`.
            unsafe {
                *libc::__errno_location() = e.raw_os_error().unwrap_or(libc::EIO);
            }
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: RawFd, buf: *mut c_void, len: usize, flags: c_int) -> isize {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `recv(2)`.
        return unsafe { real_recv()(fd, buf, len, flags) };
    }
    // Safety: as in `read`.
    let slice = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, len) };
    to_rc(hooked::recv(fd, slice, flags))
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: RawFd, buf: *const c_void, len: usize, flags: c_int) -> isize {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `send(2)`.
        return unsafe { real_send()(fd, buf, len, flags) };
    }
    // Safety: as in `write`.
    let slice = unsafe { std::slice::from_raw_parts(buf as *const u8, len) };
    to_rc(hooked::send(fd, slice, flags))
}

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `sleep(3)`.
        return unsafe { real_sleep()(seconds) };
    }
    hooked::sleep_ms(seconds as u64 * 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    if !in_fiber() {
        // Safety: forwarded verbatim to the real `usleep(3)`.
        return unsafe { real_usleep()(usec) };
    }
    hooked::usleep_us(usec as u64);
    0
}
