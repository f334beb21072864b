// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guard-paged stack allocation for fibers.

use std::io;
use std::num::NonZeroUsize;
use std::ptr;

/// Minimum fiber stack size, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Default fiber stack size used by [`crate::fiber::Fiber::new`] when the
/// caller doesn't request a specific size.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A `mmap`-backed fiber stack with a leading `PROT_NONE` guard page.
///
/// A fiber that overflows its stack faults against the guard page instead of
/// silently corrupting whatever mapping happened to follow it.
pub struct FiberStack {
    top: NonZeroUsize,
    mmap_len: usize,
}

impl FiberStack {
    /// Reserves a new stack of at least `size` bytes (rounded up to a whole
    /// number of pages, plus one guard page).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();

        let mmap_len = size
            .checked_add(2 * page_size - 1)
            .expect("stack size overflow")
            & !(page_size - 1);

        // Safety: `mmap` with `MAP_ANONYMOUS | MAP_PRIVATE` and a null hint is
        // always safe to call; we check the return value for failure below.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Safety: `base` was just mapped by us with `mmap_len` bytes reserved;
        // we only relax protection on the region above the first page, which
        // stays `PROT_NONE` as the guard page.
        let rc = unsafe {
            libc::mprotect(
                base.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Safety: `base`/`mmap_len` are the exact mapping created above.
            unsafe {
                libc::munmap(base, mmap_len);
            }
            return Err(err);
        }

        let top = NonZeroUsize::new(base as usize + mmap_len).expect("mmap returned null page");

        Ok(Self { top, mmap_len })
    }

    /// The highest address of the stack (the initial stack pointer).
    pub fn top(&self) -> usize {
        self.top.get()
    }

    /// The lowest address of the stack, including the guard page.
    pub fn bottom(&self) -> usize {
        self.top.get() - self.mmap_len
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let base = self.bottom() as *mut libc::c_void;
        // Safety: `base`/`mmap_len` describe exactly the mapping created in `new`.
        let rc = unsafe { libc::munmap(base, self.mmap_len) };
        debug_assert_eq!(rc, 0, "munmap of fiber stack failed");
    }
}

fn page_size() -> usize {
    // Safety: `sysconf` with a valid name constant is always safe.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(n > 0);
    n as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_aligns() {
        let stack = FiberStack::new(128 * 1024).unwrap();
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.top() % 16, 0);
    }

    #[test]
    fn enforces_minimum_size() {
        let stack = FiberStack::new(16).unwrap();
        assert!(stack.top() - stack.bottom() >= MIN_STACK_SIZE);
    }
}
