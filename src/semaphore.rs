// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A plain counting semaphore, used as the start-barrier in [`crate::thread::Thread`].

use std::sync::{Condvar, Mutex};

/// A counting semaphore built on a mutex and a condvar.
///
/// `wait()` blocks until the count is positive, then decrements it;
/// `signal()` increments the count and wakes one waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore initialized to `count`.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the count is positive, then consumes one permit.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        // Loop instead of a single check: condvars may wake up spuriously, and
        // under multiple waiters another thread may have raced us to the permit.
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Releases one permit and wakes a single waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_signalled() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();

        let handle = thread::spawn(move || {
            sem2.wait();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        sem.signal();
        handle.join().unwrap();
    }

    #[test]
    fn preloaded_permit_does_not_block() {
        let sem = Semaphore::new(1);
        sem.wait();
    }
}
