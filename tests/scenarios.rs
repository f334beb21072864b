// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fiber_rt::{hook_io, Event, IoManager, TimerManager};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    // Safety: `fds` is a valid 2-element buffer.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    // Safety: `fds` is a valid 2-element buffer.
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

/// S1 — sleeping a fiber only parks that fiber; another fiber queued behind
/// it still runs (and finishes) while the first is asleep.
#[test]
fn sleep_yields_the_thread_to_other_work() {
    let io = IoManager::new("s1", 1, false).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let order_a = order.clone();
    io.scheduler().schedule_callback(
        move || {
            hook_io::sleep_ms(40);
            order_a.lock().unwrap().push("a");
        },
        None,
    );

    let order_b = order.clone();
    io.scheduler().schedule_callback(
        move || {
            order_b.lock().unwrap().push("b");
        },
        None,
    );

    std::thread::sleep(Duration::from_millis(250));
    io.stop();

    assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
}

/// S3 — a `recv` on a socket whose peer never sends anything times out
/// according to its configured `SO_RCVTIMEO`, not by blocking forever.
#[test]
fn recv_times_out_at_configured_deadline() {
    let io = IoManager::new("s3", 1, false).unwrap();
    let (r, _w) = socket_pair();

    let tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 200_000,
    };
    hook_io::setsockopt(
        r,
        libc::SOL_SOCKET,
        libc::SO_RCVTIMEO,
        &tv as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
    )
    .unwrap();

    let elapsed_ms = Arc::new(AtomicUsize::new(0));
    let errno = Arc::new(AtomicUsize::new(0));
    let (elapsed2, errno2) = (elapsed_ms.clone(), errno.clone());

    io.scheduler().schedule_callback(
        move || {
            let start = Instant::now();
            let mut buf = [0u8; 16];
            let result = hook_io::recv(r, &mut buf, 0);
            elapsed2.store(start.elapsed().as_millis() as usize, Ordering::SeqCst);
            if let Err(e) = result {
                errno2.store(e.raw_os_error().unwrap_or(0) as usize, Ordering::SeqCst);
            }
        },
        None,
    );

    std::thread::sleep(Duration::from_millis(500));
    io.stop();

    assert_eq!(errno.load(Ordering::SeqCst) as i32, libc::ETIMEDOUT);
    let elapsed = elapsed_ms.load(Ordering::SeqCst);
    assert!(elapsed >= 200, "recv returned too early: {elapsed}ms");
    assert!(elapsed < 1000, "recv took far longer than its timeout: {elapsed}ms");
}

/// S4 — a conditional timer whose witness has already been dropped by the
/// time it fires must not invoke its callback.
#[test]
fn conditional_timer_with_dead_witness_does_not_fire() {
    let mgr = TimerManager::new();
    let witness = Arc::new(());
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();

    mgr.add_conditional_timer(
        500,
        move || ran2.store(true, Ordering::SeqCst),
        Arc::downgrade(&witness),
        false,
    );

    std::thread::sleep(Duration::from_millis(100));
    drop(witness);

    std::thread::sleep(Duration::from_millis(500));
    for cb in mgr.list_expired() {
        cb();
    }

    assert!(!ran.load(Ordering::SeqCst));
}

/// S5 — registering the same event on the same fd twice without an
/// intervening trigger or delete is rejected, and the pending-event count
/// reflects exactly one successful registration.
#[test]
fn double_add_event_is_rejected() {
    let io = IoManager::new("s5", 1, false).unwrap();
    let (r, _w) = pipe_pair();

    io.add_event(r, Event::Read, fiber_rt::Waiter::Callback(Box::new(|| {})))
        .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    let second = io.add_event(r, Event::Read, fiber_rt::Waiter::Callback(Box::new(|| {})));
    assert!(second.is_err());
    assert_eq!(io.pending_event_count(), 1);

    io.stop();
}

/// S6 — stopping the scheduler drains every already-queued task to
/// completion before returning, even when each one yields partway through.
#[test]
fn stop_drains_every_queued_callback() {
    let io = IoManager::new("s6", 4, false).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let count = count.clone();
        io.scheduler().schedule_callback(
            move || {
                fiber_rt::yield_now();
                count.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }

    io.stop();

    assert_eq!(count.load(Ordering::SeqCst), 1000);
    assert_eq!(io.pending_event_count(), 0);
}

/// S2 (loopback stand-in) — a send on one fiber and a matching recv on
/// another, both hooked, complete in the expected order over a connected
/// socket pair instead of a real network round-trip.
#[test]
fn send_then_recv_completes_over_loopback() {
    let io = IoManager::new("s2", 2, true).unwrap();
    let (a, b) = socket_pair();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();

    io.scheduler().schedule_callback(
        move || {
            let mut buf = [0u8; 64];
            let n = hook_io::recv(b, &mut buf, 0).unwrap();
            received2.lock().unwrap().extend_from_slice(&buf[..n]);
        },
        None,
    );

    io.scheduler().schedule_callback(
        move || {
            hook_io::send(a, b"GET / HTTP/1.0\r\n\r\n", 0).unwrap();
        },
        None,
    );

    std::thread::sleep(Duration::from_millis(300));
    io.stop();

    assert_eq!(&*received.lock().unwrap(), b"GET / HTTP/1.0\r\n\r\n");
}
