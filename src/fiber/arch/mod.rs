// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Architecture-specific stack initialization and context-switch primitives.
//!
//! Each backend exposes the same three functions:
//! - `init_stack`: seeds a freshly allocated stack so the first `switch_and_link`
//!   into it starts executing the given entry trampoline.
//! - `switch_and_link`: transfers control to a fiber, recording where to switch
//!   back to; returns the fiber's current stack pointer, or `None` if the fiber
//!   ran to completion.
//! - `switch_yield`: transfers control back to whoever called `switch_and_link`,
//!   returning the value they pass into their next `switch_and_link` call.
//! - `parent_link`: computes the address of the fixed per-stack slot the
//!   above two functions use to hand off the resumer's stack pointer.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("fiber-rt only supports x86_64 and aarch64 Linux targets");
    }
}
