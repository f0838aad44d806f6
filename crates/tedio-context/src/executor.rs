//! Single-threaded executor that reports the lifecycle of every task it runs.
//!
//! Each spawned future becomes a task with its own [`AsyncId`]. Installed
//! [`AsyncHook`]s see the task being created, every poll bracketed by
//! `before`/`after`, and its destruction once it completes or is dropped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::{Future, poll_fn};
use std::pin::{Pin, pin};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use pin_project::pin_project;

use crate::config::ExecutorConfig;
use crate::error::JoinError;
use crate::hooks::{AsyncHook, AsyncId, HookId, HookSet};
use crate::waker::{ThreadNotify, root_waker, task_waker};

struct Task {
    /// `None` while the task is being polled.
    future: Option<LocalBoxFuture<'static, ()>>,
    waker: Waker,
}

/// The parts of an executor that carry no futures. Resources and pools keep
/// this alive without keeping the tasks alive.
pub(crate) struct Core {
    config: ExecutorConfig,
    next_id: Cell<u64>,
    /// The task currently being polled, if any.
    executing: Cell<Option<AsyncId>>,
    hooks: HookSet,
}

impl Core {
    pub(crate) fn allocate_id(&self) -> AsyncId {
        let id = AsyncId::new(self.next_id.get());
        self.next_id.set(id.get() + 1);
        id
    }

    pub(crate) fn executing(&self) -> Option<AsyncId> {
        self.executing.get()
    }

    pub(crate) fn hooks(&self) -> &HookSet {
        &self.hooks
    }
}

struct Shared {
    core: Rc<Core>,
    tasks: RefCell<HashMap<AsyncId, Task>>,
    notify: Arc<ThreadNotify>,
    in_block_on: Cell<bool>,
}

impl Shared {
    /// Drops every unfinished task and reports it destroyed.
    fn teardown(&self) -> usize {
        let drained: Vec<(AsyncId, Task)> = self.tasks.borrow_mut().drain().collect();
        self.notify.clear();
        let count = drained.len();
        for (id, task) in drained {
            drop(task);
            self.core.hooks.emit_destroyed(id);
        }
        count
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let dropped = self.teardown();
        if dropped > 0 {
            tracing::debug!(
                executor = %self.core.config.name(),
                dropped,
                "executor dropped with unfinished tasks"
            );
        }
    }
}

/// Handle to a single-threaded executor.
///
/// Clones share the same task set and hooks. The executor is bound to the
/// thread that created it.
///
/// Dropping the last handle drops every unfinished task, like
/// [`shutdown`](Self::shutdown). Pools and contexts do not count as handles,
/// but a task that captures an `Executor` clone keeps the executor alive
/// until it finishes.
///
/// ```rust
/// use tedio_context::Executor;
///
/// let executor = Executor::new();
/// let handle = executor.spawn(async { 21 * 2 });
/// assert_eq!(executor.block_on(handle), Ok(42));
/// ```
#[derive(Clone)]
pub struct Executor {
    shared: Rc<Shared>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.shared.core.config.name())
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("hooks", &self.shared.core.hooks.len())
            .finish()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        tracing::debug!(executor = %config.name(), "creating executor");
        Self {
            shared: Rc::new(Shared {
                core: Rc::new(Core {
                    config,
                    next_id: Cell::new(1),
                    executing: Cell::new(None),
                    hooks: HookSet::default(),
                }),
                tasks: RefCell::new(HashMap::new()),
                notify: Arc::new(ThreadNotify::new()),
                in_block_on: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.core.config
    }

    /// Starts delivering lifecycle signals to `hook`.
    pub fn install_hook(&self, hook: Rc<dyn AsyncHook>) -> HookId {
        self.shared.core.hooks.install(hook)
    }

    /// Stops delivering signals to the hook. Returns `false` if it was not
    /// installed.
    pub fn remove_hook(&self, id: HookId) -> bool {
        self.shared.core.hooks.remove(id)
    }

    /// The task being polled right now, or `None` outside of any task.
    pub fn executing(&self) -> Option<AsyncId> {
        self.shared.core.executing()
    }

    /// Number of tasks that have been spawned and have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    pub(crate) fn hooks(&self) -> &HookSet {
        &self.shared.core.hooks
    }

    /// A handle that keeps ids and hooks working but not the tasks.
    pub(crate) fn downgrade(&self) -> WeakExecutor {
        WeakExecutor {
            core: self.shared.core.clone(),
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Schedules `fut` as a new task.
    ///
    /// The task is only polled once the executor gets control back, never
    /// from inside `spawn`. Dropping the returned handle detaches the task.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = self.shared.core.allocate_id();
        let (output_sender, receiver) = oneshot::channel();

        let fut = Box::pin(async move {
            let output = fut.await;
            // the receiver is gone when the handle was dropped
            let _ = output_sender.send(output);
        });

        self.shared.tasks.borrow_mut().insert(
            id,
            Task {
                future: Some(fut),
                waker: task_waker(id, &self.shared.notify),
            },
        );

        let trigger = self.executing();
        tracing::trace!(executor = %self.config().name(), %id, "spawning task");
        self.hooks().emit_created(id, trigger);
        self.shared.notify.schedule(id);

        JoinHandle::new(id, receiver)
    }

    /// Polls task `id` once. Returns `false` if there was nothing to poll.
    fn poll_task(&self, id: AsyncId) -> bool {
        let (mut future, waker) = {
            let mut tasks = self.shared.tasks.borrow_mut();
            // stale wakeups for finished tasks, or a task waking itself
            // while it is polled
            let Some(task) = tasks.get_mut(&id) else {
                return false;
            };
            let Some(future) = task.future.take() else {
                return false;
            };
            (future, task.waker.clone())
        };

        let poll = {
            let _window = PollWindow::open(&self.shared.core, id);
            future.as_mut().poll(&mut Context::from_waker(&waker))
        };

        match poll {
            Poll::Ready(()) => {
                self.shared.tasks.borrow_mut().remove(&id);
                drop(future);
                tracing::trace!(executor = %self.config().name(), %id, "task completed");
                self.hooks().emit_destroyed(id);
            }
            Poll::Pending => {
                if let Some(task) = self.shared.tasks.borrow_mut().get_mut(&id) {
                    task.future = Some(future);
                }
            }
        }
        true
    }

    /// Polls ready tasks until none is ready. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        while let Some(id) = self.shared.notify.next_ready() {
            if self.poll_task(id) {
                polls += 1;
            }
        }
        polls
    }

    /// Runs tasks until `future` completes and returns its output.
    ///
    /// `future` itself is not a task: it has no id and produces no signals.
    ///
    /// # Panics
    ///
    /// Panics when called from inside another `block_on` on the same executor.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            !self.shared.in_block_on.replace(true),
            "`block_on` called from within `block_on` on the same executor"
        );
        let _guard = BlockOnGuard(self);
        let mut future = pin!(future);

        let notify = &self.shared.notify;
        let waker = root_waker(notify);
        let mut cx = Context::from_waker(&waker);
        notify.wake_root();
        let budget = self.config().tick_budget();

        loop {
            if notify.take_root_wake() {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            let mut polls = 0;
            while polls < budget {
                let Some(id) = notify.next_ready() else {
                    break;
                };
                if self.poll_task(id) {
                    polls += 1;
                }
            }

            if polls == budget || notify.has_ready() {
                continue;
            }
            notify.park();
        }
    }

    /// Drops every unfinished task, reporting each one destroyed. Returns how
    /// many tasks were dropped.
    pub fn shutdown(&self) -> usize {
        let dropped = self.shared.teardown();
        tracing::debug!(executor = %self.config().name(), dropped, "executor shut down");
        dropped
    }
}

/// Non-owning executor handle held by pools and resources.
#[derive(Clone)]
pub(crate) struct WeakExecutor {
    core: Rc<Core>,
    shared: Weak<Shared>,
}

impl WeakExecutor {
    pub(crate) fn upgrade(&self) -> Option<Executor> {
        self.shared.upgrade().map(|shared| Executor { shared })
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }
}

/// One execution window of a task: `before` on open, `after` on drop, so the
/// window closes even when the poll unwinds.
struct PollWindow<'a> {
    core: &'a Core,
    id: AsyncId,
    prior: Option<AsyncId>,
}

impl<'a> PollWindow<'a> {
    fn open(core: &'a Core, id: AsyncId) -> Self {
        let prior = core.executing.replace(Some(id));
        core.hooks.emit_before(id);
        Self { core, id, prior }
    }
}

impl Drop for PollWindow<'_> {
    fn drop(&mut self) {
        self.core.hooks.emit_after(self.id);
        self.core.executing.set(self.prior);
    }
}

struct BlockOnGuard<'a>(&'a Executor);

impl Drop for BlockOnGuard<'_> {
    fn drop(&mut self) {
        self.0.shared.in_block_on.set(false);
    }
}

/// Owned permission to await the output of a spawned task.
#[pin_project]
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: AsyncId,
    #[pin]
    receiver: oneshot::Receiver<T>,
}

impl<T> JoinHandle<T> {
    fn new(id: AsyncId, receiver: oneshot::Receiver<T>) -> Self {
        Self { id, receiver }
    }

    /// The id of the task this handle refers to.
    pub fn id(&self) -> AsyncId {
        self.id
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.receiver.poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(Ok(output)),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(JoinError::Cancelled(*this.id))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Yields once to the executor, letting other ready tasks run.
pub fn yield_now() -> impl Future<Output = ()> {
    let mut yielded = false;
    poll_fn(move |cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Signal {
        Created(AsyncId, Option<AsyncId>),
        Before(AsyncId),
        After(AsyncId),
        Destroyed(AsyncId),
    }

    #[derive(Default)]
    struct Recorder(RefCell<Vec<Signal>>);

    impl AsyncHook for Recorder {
        fn created(&self, id: AsyncId, trigger: Option<AsyncId>) {
            self.0.borrow_mut().push(Signal::Created(id, trigger));
        }
        fn before(&self, id: AsyncId) {
            self.0.borrow_mut().push(Signal::Before(id));
        }
        fn after(&self, id: AsyncId) {
            self.0.borrow_mut().push(Signal::After(id));
        }
        fn destroyed(&self, id: AsyncId) {
            self.0.borrow_mut().push(Signal::Destroyed(id));
        }
    }

    #[test]
    fn test_spawn_is_deferred() {
        let executor = Executor::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let handle = executor.spawn(async move { flag.set(true) });
        assert!(!ran.get());
        assert_eq!(executor.pending_tasks(), 1);

        assert_eq!(executor.run_until_stalled(), 1);
        assert!(ran.get());
        assert_eq!(executor.pending_tasks(), 0);
        assert_eq!(executor.block_on(handle), Ok(()));
    }

    #[test]
    fn test_signals_bracket_every_poll() {
        let executor = Executor::new();
        let recorder = Rc::new(Recorder::default());
        executor.install_hook(recorder.clone());

        let handle = executor.spawn(async {
            yield_now().await;
            7
        });
        let id = handle.id();
        assert_eq!(executor.block_on(handle), Ok(7));

        assert_eq!(
            *recorder.0.borrow(),
            vec![
                Signal::Created(id, None),
                Signal::Before(id),
                Signal::After(id),
                Signal::Before(id),
                Signal::After(id),
                Signal::Destroyed(id),
            ]
        );
    }

    #[test]
    fn test_nested_spawn_reports_trigger() {
        let executor = Executor::new();
        let recorder = Rc::new(Recorder::default());
        executor.install_hook(recorder.clone());

        let inner_executor = executor.clone();
        let outer = executor.spawn(async move {
            let inner = inner_executor.spawn(async { "done" });
            (inner.id(), inner.await)
        });
        let outer_id = outer.id();
        let (inner_id, inner_output) = executor.block_on(outer).unwrap();
        assert_eq!(inner_output, Ok("done"));

        let signals = recorder.0.borrow();
        assert!(signals.contains(&Signal::Created(inner_id, Some(outer_id))));
        assert_eq!(
            signals
                .iter()
                .filter(|s| matches!(s, Signal::Destroyed(_)))
                .count(),
            2
        );
    }

    #[test]
    fn test_shutdown_cancels_pending_tasks() {
        let executor = Executor::new();
        let recorder = Rc::new(Recorder::default());
        executor.install_hook(recorder.clone());

        let (_sender, receiver) = oneshot::channel::<()>();
        let handle = executor.spawn(receiver);
        let id = handle.id();
        executor.run_until_stalled();

        assert_eq!(executor.shutdown(), 1);
        assert_eq!(executor.pending_tasks(), 0);
        assert_eq!(
            executor.block_on(handle),
            Err(JoinError::Cancelled(id))
        );
        assert_eq!(recorder.0.borrow().last(), Some(&Signal::Destroyed(id)));
    }

    #[test]
    fn test_wake_from_another_thread() {
        let executor = Executor::new();
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let handle = executor.spawn(async move { receiver.await.unwrap_or(0) });

        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            sender.send(9).unwrap();
        });
        assert_eq!(executor.block_on(handle), Ok(9));
        worker.join().unwrap();
    }

    #[test]
    fn test_tick_budget_still_reaches_root() {
        let executor = Executor::with_config(ExecutorConfig::default().with_tick_budget(1));
        let spinner = executor.spawn(async {
            for _ in 0..10 {
                yield_now().await;
            }
        });
        assert_eq!(executor.block_on(async { 5 }), 5);
        assert_eq!(executor.block_on(spinner), Ok(()));
    }

    #[test]
    #[should_panic(expected = "within `block_on`")]
    fn test_nested_block_on_panics() {
        let executor = Executor::new();
        let inner = executor.clone();
        executor.block_on(async move { inner.block_on(async {}) });
    }

    #[test]
    fn test_repeated_wakes_poll_once() {
        let executor = Executor::new();
        let slot: Rc<RefCell<Option<Waker>>> = Rc::default();
        let polls = Rc::new(Cell::new(0));
        let (task_slot, task_polls) = (slot.clone(), polls.clone());
        let _handle = executor.spawn(poll_fn(move |cx| {
            task_polls.set(task_polls.get() + 1);
            *task_slot.borrow_mut() = Some(cx.waker().clone());
            Poll::<()>::Pending
        }));
        assert_eq!(executor.run_until_stalled(), 1);

        let waker = slot.borrow().clone().unwrap();
        for _ in 0..5 {
            waker.wake_by_ref();
        }
        assert_eq!(executor.run_until_stalled(), 1);
        assert_eq!(polls.get(), 2);
    }

    #[test]
    fn test_panicking_poll_closes_its_window() {
        let executor = Executor::new();
        let recorder = Rc::new(Recorder::default());
        executor.install_hook(recorder.clone());

        let handle = executor.spawn(async {
            if true {
                panic!("task failed");
            }
        });
        let id = handle.id();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor.run_until_stalled()
        }));

        assert!(unwound.is_err());
        assert_eq!(executor.executing(), None);
        assert_eq!(
            *recorder.0.borrow(),
            vec![Signal::Created(id, None), Signal::Before(id), Signal::After(id)]
        );
    }
}
