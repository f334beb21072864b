// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::measurement::Measurement;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fiber_rt::Fiber;

const STACK_SIZE: usize = 1024 * 1024;

fn fiber_switch<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let fiber = Fiber::with_stack_size(
        || loop {
            fiber_rt::yield_now();
        },
        STACK_SIZE,
        false,
    )
    .unwrap();

    c.bench_function(name, |b| {
        b.iter(|| {
            black_box(&fiber).resume();
        })
    });

    // The fiber is left parked mid-loop; dropping it here only logs a
    // warning (its stack has no locals worth running destructors for).
    drop(fiber);
}

fn fiber_call<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let fiber = Fiber::with_stack_size(|| {}, STACK_SIZE, false).unwrap();
            fiber.resume();
            black_box(fiber.state())
        })
    });
}

fn fiber_switch_time(c: &mut Criterion) {
    fiber_switch("fiber_switch_time", c);
}
fn fiber_call_time(c: &mut Criterion) {
    fiber_call("fiber_call_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = fiber_switch_time, fiber_call_time
);

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn fiber_switch_cycles(c: &mut Criterion<CyclesPerByte>) {
            fiber_switch("fiber_switch_cycles", c);
        }
        fn fiber_call_cycles(c: &mut Criterion<CyclesPerByte>) {
            fiber_call("fiber_call_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = fiber_switch_cycles, fiber_call_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
