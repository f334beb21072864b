// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! OS thread primitive with a start-barrier and detach-on-drop semantics.

use std::cell::RefCell;
use std::io;
use std::thread::JoinHandle;

use crate::semaphore::Semaphore;

/// Truncation length (excluding the terminating null) applied by `pthread_setname_np`
/// on Linux.
const MAX_THREAD_NAME_LEN: usize = 15;

thread_local! {
    static CURRENT_TID: RefCell<Option<i32>> = const { RefCell::new(None) };
    static CURRENT_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Returns the Linux-level thread id (`gettid()`) of the calling OS thread.
pub fn current_tid() -> i32 {
    CURRENT_TID.with(|tid| {
        let mut tid = tid.borrow_mut();
        if let Some(v) = *tid {
            v
        } else {
            // Safety: `gettid` takes no arguments and always succeeds.
            let v = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
            *tid = Some(v);
            v
        }
    })
}

/// Returns the name of the calling thread as recorded by this runtime, or
/// `"UNKNOWN"` for threads this runtime did not spawn.
pub fn current_name() -> String {
    CURRENT_NAME.with(|name| name.borrow().clone())
}

fn set_current_name(name: &str) {
    CURRENT_NAME.with(|slot| *slot.borrow_mut() = name.to_string());

    let truncated: String = name.chars().take(MAX_THREAD_NAME_LEN).collect();
    let c_name = std::ffi::CString::new(truncated).unwrap_or_default();
    // Safety: `c_name` is a valid, nul-terminated C string for the duration of the call.
    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), c_name.as_ptr());
    }
}

/// An OS thread wrapper that guarantees the child has finished publishing
/// its thread-locals before the constructor returns, and that detaches
/// automatically if the caller never calls [`Thread::join`].
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
    tid: i32,
}

impl Thread {
    /// Spawns `cb` on a new OS thread named `name`.
    ///
    /// The constructor blocks until the child thread has set up its
    /// thread-locals (name, tid) and taken ownership of `cb`, so that by
    /// the time this call returns it is safe for the caller to rely on
    /// [`Thread::tid`].
    pub fn spawn<F>(name: impl Into<String>, cb: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let started = std::sync::Arc::new(Semaphore::new(0));
        let tid_slot = std::sync::Arc::new(std::sync::Mutex::new(0_i32));

        let thread_name = name.clone();
        let started_child = started.clone();
        let tid_slot_child = tid_slot.clone();

        // `cb` is moved into an `Option` so the trampoline can swap it out into
        // a fully-local value before signalling the barrier. This mirrors the
        // original design: ownership of the callback is transferred to the
        // child before the parent can observe the thread as "started", so the
        // parent is free to tear down `Thread` (or anything it closed over)
        // without racing the child's first access to `cb`.
        let mut cb = Some(cb);

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                set_current_name(&thread_name);
                let tid = current_tid();
                *tid_slot_child.lock().unwrap() = tid;

                let cb = cb.take().expect("thread trampoline run twice");
                started_child.signal();

                cb();
            })?;

        started.wait();
        let tid = *tid_slot.lock().unwrap();

        Ok(Self {
            name,
            handle: Some(handle),
            tid,
        })
    }

    /// The name this thread was spawned with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The Linux thread id of the spawned thread, valid once the constructor
    /// has returned.
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Blocks until the thread has finished executing its callback.
    pub fn join(mut self) -> std::thread::Result<()> {
        self.handle.take().expect("already joined").join()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // `JoinHandle` has no explicit detach; simply dropping it detaches the
        // underlying OS thread, which is exactly the semantics we want here.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn spawn_runs_callback_and_names_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let t = Thread::spawn("fiber-rt-test", move || {
            ran2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(t.tid() > 0);
        t.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_without_join_detaches() {
        let t = Thread::spawn("fiber-rt-detach", || {
            std::thread::sleep(std::time::Duration::from_millis(10));
        })
        .unwrap();
        drop(t);
    }
}
