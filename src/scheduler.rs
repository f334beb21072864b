// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-thread, work-stealing-free task queue of fibers and callbacks.
//!
//! Each worker thread runs a FIFO dispatch loop on its bare OS stack. It
//! creates two special, never-enqueued fibers: a *scheduling fiber* that
//! pops and resumes one task per turn, and an *idle fiber* that the loop
//! falls back to when the queue has nothing for this thread. Both are
//! resumed directly from the worker's bare stack (mirroring a fiber's
//! "main fiber of thread" partner); every task fiber dispatched through the
//! scheduling fiber is resumed from inside it instead, so
//! [`crate::fiber::Fiber::resume`]'s partner check is satisfied by
//! construction rather than left to chance.
//!
//! [`Reactor`] is the seam the I/O manager hooks into: the base scheduler's
//! default reactor is an inert no-op (plain callback/fiber dispatch only),
//! while `crate::io_manager::IoManager` installs itself as the reactor to
//! turn idle time into epoll polling and timer expiry.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::fiber::{self, Fiber};
use crate::thread::Thread;

/// Either an owned fiber handle or a plain callback to run to completion on
/// a fresh fiber; exactly one is ever populated per task.
pub enum Task {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Task::Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Task::Callback(..)"),
        }
    }
}

/// An entry in the scheduler's queue: a task plus the worker it must run on
/// (`None` = any worker).
#[derive(Debug)]
pub struct ScheduleTask {
    task: Task,
    preferred_worker: Option<usize>,
}

impl ScheduleTask {
    pub fn fiber(fiber: Arc<Fiber>, preferred_worker: Option<usize>) -> Self {
        Self {
            task: Task::Fiber(fiber),
            preferred_worker,
        }
    }

    pub fn callback(cb: impl FnOnce() + Send + 'static, preferred_worker: Option<usize>) -> Self {
        Self {
            task: Task::Callback(Box::new(cb)),
            preferred_worker,
        }
    }
}

/// Hook overridden by [`crate::io_manager::IoManager`] to turn the base
/// scheduler's inert idle fiber into an epoll-driven reactor loop.
pub trait Reactor: Send + Sync {
    /// Wakes one parked worker. Called whenever a task lands on a queue
    /// that was previously empty.
    fn tickle(&self);

    /// One turn of the idle fiber's internal loop. The base scheduler's
    /// default implementation just backs off briefly; `IoManager` polls
    /// epoll and timers here instead.
    fn idle_pass(&self);

    /// Whether the idle fiber's internal loop should stop running
    /// entirely (distinct from the dispatch loop's own exit condition,
    /// which additionally waits for `idle_count` to cover every worker).
    fn stopping(&self) -> bool;

    /// Called once at the top of every worker thread, before entering the
    /// dispatch loop, so a reactor with its own thread-locals (like
    /// `IoManager`'s "current I/O manager" pointer) can publish itself.
    fn on_worker_start(&self) {}
}

struct DefaultReactor {
    scheduler: std::sync::Weak<Scheduler>,
}

impl Reactor for DefaultReactor {
    fn tickle(&self) {}

    fn idle_pass(&self) {
        std::thread::yield_now();
    }

    fn stopping(&self) -> bool {
        self.scheduler
            .upgrade()
            .map(|s| s.stop_requested() && s.tasks_empty())
            .unwrap_or(true)
    }
}

fn matches_worker(preferred_worker: Option<usize>, worker_id: usize) -> bool {
    match preferred_worker {
        None => true,
        Some(w) => w == worker_id,
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Arc<Scheduler>>> =
        const { std::cell::RefCell::new(None) };

    /// The `Arc` handle of whichever task fiber is currently being resumed
    /// by this thread's scheduling (or drain) fiber, so hook code running
    /// inside it can register itself as a `fd::Waiter::Fiber` and be handed
    /// back to the scheduler later.
    static CURRENT_TASK_FIBER: std::cell::RefCell<Option<Arc<Fiber>>> =
        const { std::cell::RefCell::new(None) };

    /// Set by a task fiber right before a [`fiber::yield_now`] that parks it
    /// on an external waiter (a timer or a registered I/O event) rather than
    /// a plain cooperative yield. Consulted once, then cleared, by whichever
    /// scheduling/drain fiber resumed it.
    static SUPPRESS_RESCHEDULE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Marks the currently running task fiber so that its next yield does not
/// get automatically re-enqueued by the scheduling fiber: something else
/// (a timer callback, an I/O readiness dispatch) now owns rescheduling it.
///
/// # Panics
/// Panics if called from outside a task fiber.
pub fn suppress_auto_reschedule() {
    assert!(
        current_task_fiber().is_some(),
        "suppress_auto_reschedule called outside a scheduled task fiber"
    );
    SUPPRESS_RESCHEDULE.with(|c| c.set(true));
}

fn take_suppress_auto_reschedule() -> bool {
    SUPPRESS_RESCHEDULE.with(|c| c.replace(false))
}

/// The scheduler running the calling OS thread's dispatch loop, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().clone())
}

/// The `Arc` handle of the fiber currently running as a scheduled task, if
/// any. `None` when called from the scheduling/idle fiber itself or from
/// outside any fiber.
pub fn current_task_fiber() -> Option<Arc<Fiber>> {
    CURRENT_TASK_FIBER.with(|c| c.borrow().clone())
}

/// Resumes `task_fiber`, publishing it as [`current_task_fiber`] for the
/// duration of the call.
fn resume_task_fiber(task_fiber: &Arc<Fiber>) {
    let prev = CURRENT_TASK_FIBER.with(|c| c.borrow_mut().replace(task_fiber.clone()));
    task_fiber.resume();
    CURRENT_TASK_FIBER.with(|c| *c.borrow_mut() = prev);
}

/// Builder for [`Scheduler`], generalizing the bare `(thread_count,
/// use_caller, name)` constructor with the knobs an embedding application
/// may want to override: the stack size given to every fiber the scheduler
/// allocates for itself (scheduling fibers, idle fibers, the caller's drain
/// fiber) and every fiber it wraps a scheduled callback in.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    name: String,
    thread_count: usize,
    use_caller: bool,
    stack_size: usize,
}

impl SchedulerConfig {
    /// Starts a config with `thread_count = 1`, `use_caller = false`, and the
    /// default fiber stack size.
    pub fn new(name: impl Into<String>) -> Self {
        SchedulerConfig {
            name: name.into(),
            thread_count: 1,
            use_caller: false,
            stack_size: crate::fiber::stack::DEFAULT_STACK_SIZE,
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

    /// Stack size given to every fiber this scheduler allocates, including
    /// ones it wraps scheduled callbacks in.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        assert!(self.thread_count > 0, "scheduler needs at least one worker");
        Arc::new_cyclic(|weak| Scheduler {
            name: self.name,
            thread_count: self.thread_count,
            use_caller: self.use_caller,
            stack_size: self.stack_size,
            tasks: std::sync::Mutex::new(VecDeque::new()),
            workers: std::sync::Mutex::new(Vec::new()),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            reactor: RwLock::new(Arc::new(DefaultReactor {
                scheduler: weak.clone(),
            })),
            caller_fiber: std::sync::Mutex::new(None),
        })
    }
}

/// A FIFO task queue serviced by a fixed pool of worker threads.
pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    stack_size: usize,
    tasks: std::sync::Mutex<VecDeque<ScheduleTask>>,
    workers: std::sync::Mutex<Vec<Thread>>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    reactor: RwLock<Arc<dyn Reactor>>,
    /// Under `use_caller`, the scheduling fiber bound to the constructing
    /// thread. It is only ever resumed once, from `stop()`, to drain
    /// whatever work landed on the caller's reserved worker slot.
    caller_fiber: std::sync::Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Creates a scheduler named `name` with `thread_count` total worker
    /// slots. If `use_caller`, one of those slots is the constructing
    /// thread itself (see [`Scheduler::stop`]) rather than a spawned
    /// thread, so only `thread_count - 1` OS threads are spawned by
    /// [`Scheduler::start`].
    ///
    /// Shorthand for [`SchedulerConfig::new`] with default stack size; use
    /// the config builder directly to override it.
    pub fn new(name: impl Into<String>, thread_count: usize, use_caller: bool) -> Arc<Self> {
        SchedulerConfig::new(name)
            .thread_count(thread_count)
            .use_caller(use_caller)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_reactor(&self, reactor: Arc<dyn Reactor>) {
        *self.reactor.write().unwrap() = reactor;
    }

    fn reactor(&self) -> Arc<dyn Reactor> {
        self.reactor.read().unwrap().clone()
    }

    /// Enqueues `task`. If the queue was empty, tickles one idle worker.
    pub fn schedule(self: &Arc<Self>, task: ScheduleTask) {
        let was_empty = {
            let mut tasks = self.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if was_empty {
            self.reactor().tickle();
        }
    }

    pub fn schedule_fiber(self: &Arc<Self>, fiber: Arc<Fiber>, preferred_worker: Option<usize>) {
        self.schedule(ScheduleTask::fiber(fiber, preferred_worker));
    }

    pub fn schedule_callback(
        self: &Arc<Self>,
        cb: impl FnOnce() + Send + 'static,
        preferred_worker: Option<usize>,
    ) {
        self.schedule(ScheduleTask::callback(cb, preferred_worker));
    }

    pub fn tasks_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    fn spawned_worker_count(&self) -> usize {
        self.thread_count - usize::from(self.use_caller)
    }

    /// True once every worker this scheduler owns (spawned threads, plus
    /// the caller's slot when `use_caller`) is parked in `idle()` and there
    /// is nothing left to run.
    fn dispatch_loop_done(&self) -> bool {
        self.stop_requested() && self.tasks_empty() && self.idle_count() >= self.spawned_worker_count()
    }

    /// Spawns the worker threads and, under `use_caller`, prepares (but
    /// does not yet run) the constructing thread's scheduling fiber.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.spawned_worker_count() {
            let scheduler = self.clone();
            let name = format!("{}-{}", self.name, worker_id);
            let thread = Thread::spawn(name, move || scheduler.run_os_thread(worker_id))?;
            workers.push(thread);
        }
        drop(workers);

        if self.use_caller {
            let worker_id = self.spawned_worker_count();
            let scheduler = self.clone();
            let fiber = Fiber::with_stack_size(
                move || scheduler.drain_fiber_body(worker_id),
                self.stack_size,
                false,
            )?;
            *self.caller_fiber.lock().unwrap() = Some(Arc::new(fiber));
        }

        Ok(())
    }

    /// Marks the scheduler as stopping, wakes every worker so it notices,
    /// joins the spawned threads, and — under `use_caller` — resumes the
    /// caller's scheduling fiber once to drain whatever tasks were pinned
    /// to its worker slot.
    pub fn stop(self: &Arc<Self>) {
        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.spawned_worker_count() {
            self.reactor().tickle();
        }

        let workers: Vec<Thread> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.join() {
                tracing::warn!(scheduler = %self.name, "worker thread panicked: {e:?}");
            }
        }

        if let Some(fiber) = self.caller_fiber.lock().unwrap().take() {
            fiber::set_scheduler_fiber(Arc::as_ptr(&fiber));
            fiber.resume();
        }
    }

    /// Pops the first queued task whose `preferred_worker` is `None` or
    /// matches `worker_id`, scanning past (but not removing) any head
    /// entries pinned to a different worker.
    fn pop_ready_task(&self, worker_id: usize) -> Option<ScheduleTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let pos = tasks.iter().position(|t| matches_worker(t.preferred_worker, worker_id))?;
        tasks.remove(pos)
    }

    fn peek_has_ready_task(&self, worker_id: usize) -> bool {
        let tasks = self.tasks.lock().unwrap();
        tasks.iter().any(|t| matches_worker(t.preferred_worker, worker_id))
    }

    /// The body of a spawned worker thread (or, under `use_caller`, run
    /// directly by [`Scheduler::stop`] via the caller's scheduling fiber
    /// instead — see that method).
    fn run_os_thread(self: Arc<Self>, worker_id: usize) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.clone()));
        self.reactor().on_worker_start();

        let scheduler = self.clone();
        let scheduling_fiber = Arc::new(
            Fiber::with_stack_size(
                move || scheduler.scheduling_fiber_body(worker_id),
                self.stack_size,
                false,
            )
            .expect("failed to allocate scheduling fiber stack"),
        );
        fiber::set_scheduler_fiber(Arc::as_ptr(&scheduling_fiber));

        let scheduler = self.clone();
        let idle_fiber = Arc::new(
            Fiber::with_stack_size(
                move || scheduler.idle_fiber_body(),
                self.stack_size,
                false,
            )
            .expect("failed to allocate idle fiber stack"),
        );

        loop {
            if self.peek_has_ready_task(worker_id) {
                if scheduling_fiber.state() == fiber::State::Ready {
                    scheduling_fiber.resume();
                }
            } else {
                self.idle_count.fetch_add(1, Ordering::AcqRel);
                if idle_fiber.state() == fiber::State::Ready {
                    idle_fiber.resume();
                }
                self.idle_count.fetch_sub(1, Ordering::AcqRel);
            }

            if self.dispatch_loop_done() {
                break;
            }
        }

        tracing::debug!(scheduler = %self.name, worker_id, "worker exiting");
    }

    /// Runs inside the scheduling fiber: pops and resumes exactly one task
    /// per turn, then yields back to the bare worker thread.
    fn scheduling_fiber_body(self: Arc<Self>, worker_id: usize) {
        loop {
            if let Some(item) = self.pop_ready_task(worker_id) {
                self.active_count.fetch_add(1, Ordering::AcqRel);
                match item.task {
                    Task::Fiber(task_fiber) => {
                        resume_task_fiber(&task_fiber);
                        if task_fiber.state() == fiber::State::Ready
                            && !take_suppress_auto_reschedule()
                        {
                            self.schedule_fiber(task_fiber, None);
                        }
                    }
                    Task::Callback(cb) => {
                        match Fiber::with_stack_size(cb, self.stack_size, true) {
                            Ok(task_fiber) => {
                                let task_fiber = Arc::new(task_fiber);
                                resume_task_fiber(&task_fiber);
                                if task_fiber.state() == fiber::State::Ready
                                    && !take_suppress_auto_reschedule()
                                {
                                    self.schedule_fiber(task_fiber, None);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to allocate stack for scheduled callback");
                            }
                        }
                    }
                }
                self.active_count.fetch_sub(1, Ordering::AcqRel);
            }
            fiber::yield_now();
        }
    }

    /// Runs the caller's reserved worker slot to completion: drains every
    /// task pinned to it, running each to its own completion rather than
    /// interleaving (there is no other fiber competing for this thread by
    /// the time `stop()` calls this), then returns.
    ///
    /// A task that parks itself on an external waiter (a timer or I/O
    /// event) rather than yielding cooperatively is left parked: nothing
    /// else is running by the time this drains, so nothing would ever wake
    /// it. This mirrors `use_caller`'s documented drain-only-at-stop
    /// simplification rather than inventing a reactor pass here.
    fn drain_fiber_body(self: Arc<Self>, worker_id: usize) {
        while let Some(item) = self.pop_ready_task(worker_id) {
            self.active_count.fetch_add(1, Ordering::AcqRel);
            match item.task {
                Task::Fiber(task_fiber) => {
                    while task_fiber.state() == fiber::State::Ready {
                        resume_task_fiber(&task_fiber);
                        if task_fiber.state() == fiber::State::Ready
                            && take_suppress_auto_reschedule()
                        {
                            break;
                        }
                    }
                }
                Task::Callback(cb) => match Fiber::with_stack_size(cb, self.stack_size, true) {
                    Ok(task_fiber) => {
                        let task_fiber = Arc::new(task_fiber);
                        while task_fiber.state() == fiber::State::Ready {
                            resume_task_fiber(&task_fiber);
                            if task_fiber.state() == fiber::State::Ready
                                && take_suppress_auto_reschedule()
                            {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to allocate stack while draining scheduler");
                    }
                },
            }
            self.active_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Runs inside the idle fiber: repeatedly drives one reactor pass and
    /// yields, until the reactor reports it's safe to stop entirely.
    fn idle_fiber_body(self: Arc<Self>) {
        loop {
            let reactor = self.reactor();
            if reactor.stopping() {
                return;
            }
            reactor.idle_pass();
            fiber::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_scheduled_callbacks() {
        let scheduler = Scheduler::new("test", 2, false);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            scheduler.schedule_callback(move || { count.fetch_add(1, Ordering::SeqCst); }, None);
        }
        scheduler.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn yielding_callback_is_rescheduled_until_done() {
        let scheduler = Scheduler::new("test", 1, false);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        scheduler.schedule_callback(
            move || {
                for _ in 0..5 {
                    count2.fetch_add(1, Ordering::SeqCst);
                    fiber::yield_now();
                }
            },
            None,
        );
        scheduler.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn stop_drains_all_pending_tasks() {
        let scheduler = Scheduler::new("test", 4, false);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let count = count.clone();
            scheduler.schedule_callback(
                move || {
                    fiber::yield_now();
                    count.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }
        scheduler.start().unwrap();
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }
}
