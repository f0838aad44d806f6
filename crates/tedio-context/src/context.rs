//! Units of work bound to a tracked session.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt::{self, Display};
use std::future::Future;
use std::mem;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Poll;

use pin_project::{pin_project, pinned_drop};
use uuid::Uuid;

use crate::error::{JoinError, RunError};
use crate::executor::JoinHandle;
use crate::hooks::AsyncId;
use crate::pool::SessionPool;
use crate::resource::AsyncResource;

/// Where a context is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Constructed and registered, not yet run.
    Created,
    /// Between the start of `run` and its destroy signal.
    Active,
    /// Destroyed. Terminal.
    Destroyed,
}

/// Type-erased view of a context, as stored by the [`SessionPool`].
pub trait AnyContext {
    /// The id of the operation backing this context; also its session id.
    fn async_id(&self) -> AsyncId;

    /// Process-unique correlation id.
    fn id(&self) -> Uuid;

    fn state(&self) -> ContextState;

    /// Makes this context's `run` wait for `task` before completing.
    fn track(&self, task: JoinHandle<()>);

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

/// A logical session that can be retrieved from anywhere inside the
/// operations it spawns, without being passed around.
///
/// `S` is the user data carried by the context; the context derefs to it.
///
/// ```rust
/// use std::convert::Infallible;
/// use tedio_context::{Context, Executor, SessionPool};
///
/// let executor = Executor::new();
/// let pool = SessionPool::new(&executor);
///
/// let context = Context::make(&pool, String::from("request-7"));
/// let inner_pool = pool.clone();
/// let run = context.run(async move {
///     let current = Context::<String>::current(&inner_pool).unwrap();
///     assert_eq!(current.as_str(), "request-7");
///     Ok::<_, Infallible>(())
/// });
/// executor.block_on(run).unwrap();
/// assert!(Context::<String>::current(&pool).is_none());
/// ```
pub struct Context<S = ()> {
    resource: AsyncResource,
    id: Uuid,
    pool: SessionPool,
    tasks: RefCell<Vec<JoinHandle<()>>>,
    state: Cell<ContextState>,
    data: S,
}

impl<S: fmt::Debug> fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("async_id", &self.resource.id())
            .field("state", &self.state.get())
            .field("pending_tasks", &self.tasks.borrow().len())
            .field("data", &self.data)
            .finish()
    }
}

impl<S> Deref for Context<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.data
    }
}

impl<S> Context<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn async_id(&self) -> AsyncId {
        self.resource.id()
    }

    pub fn state(&self) -> ContextState {
        self.state.get()
    }

    pub fn data(&self) -> &S {
        &self.data
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        mem::take(&mut *self.tasks.borrow_mut())
    }

    fn finish(&self) {
        if self.resource.emit_destroy() {
            tracing::debug!(context = %self.id, id = %self.resource.id(), "context destroyed");
        }
        self.state.set(ContextState::Destroyed);
    }
}

impl<S: 'static> Context<S> {
    /// Creates a context carrying `data` and registers its session.
    pub fn make(pool: &SessionPool, data: S) -> Rc<Self> {
        let context = Rc::new(Context {
            resource: AsyncResource::with_handle(pool.handle()),
            id: Uuid::new_v4(),
            pool: pool.clone(),
            tasks: RefCell::new(Vec::new()),
            state: Cell::new(ContextState::Created),
            data,
        });
        let erased: Rc<dyn AnyContext> = context.clone();
        pool.register(&erased);
        tracing::debug!(context = %context.id, id = %context.async_id(), "context created");
        context
    }

    /// The context active in the running execution window.
    ///
    /// `None` outside of any tracked window, and also when the active context
    /// carries data of another type.
    pub fn current(pool: &SessionPool) -> Option<Rc<Self>> {
        pool.current()?.into_any().downcast::<Self>().ok()
    }

    /// Spawns `task` as a detached operation that this context's `run` waits
    /// for. A failure of `task` is logged and otherwise ignored.
    ///
    /// Once the executor has been dropped, `task` is dropped unpolled.
    pub fn add_task<F, T, E>(&self, task: F)
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Display + 'static,
    {
        let Some(executor) = self.pool.executor() else {
            tracing::warn!(context = %self.id, "executor dropped, task discarded");
            return;
        };
        let handle = executor.spawn(settle_detached(self.id, task));
        self.track(handle);
    }

    /// Runs `body` as this context's unit of work.
    ///
    /// `body` is spawned as its own task inside this context's window, so it
    /// and everything it spawns resolve [`current`](Self::current) to this
    /// context. The returned future settles once `body` and every task added
    /// through [`add_task`](Self::add_task) have settled and the context has
    /// been destroyed. It fails with the body's own error, if any; detached
    /// task failures never reach it. If the executor has already been
    /// dropped, `body` never runs and the outcome is [`RunError::Cancelled`].
    pub fn run<F, T, E>(self: &Rc<Self>, body: F) -> Run<T, E, S>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: 'static,
    {
        let state = self.state.get();
        if state != ContextState::Created {
            tracing::warn!(context = %self.id, ?state, "context cannot run twice");
            return Run {
                context: self.clone(),
                stage: Stage::Rejected(state),
            };
        }
        self.state.set(ContextState::Active);

        if !self.pool.is_registered(self.async_id()) {
            let erased: Rc<dyn AnyContext> = self.clone();
            self.pool.register(&erased);
        }
        let Some(executor) = self.pool.executor() else {
            tracing::warn!(context = %self.id, "executor dropped, body not spawned");
            return Run {
                context: self.clone(),
                stage: Stage::Settling {
                    outcome: Err(RunError::Cancelled(JoinError::Cancelled(self.async_id()))),
                    pending: Vec::new(),
                },
            };
        };
        let body = self.resource.in_scope(|| executor.spawn(body));
        tracing::debug!(
            context = %self.id,
            id = %self.async_id(),
            body = %body.id(),
            "context running"
        );

        Run {
            context: self.clone(),
            stage: Stage::Body(body),
        }
    }

    /// Turns `f` into a function that runs every call in a fresh context.
    ///
    /// Each call builds data with `make`, creates a context from it and runs
    /// `f(args)` as that context's body. Calls are independent of each other,
    /// even when they overlap.
    pub fn wrap<A, F, Fut, T, E, M>(
        pool: &SessionPool,
        make: M,
        f: F,
    ) -> impl Fn(A) -> Run<T, E, S>
    where
        M: Fn() -> S,
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        A: 'static,
        T: 'static,
        E: 'static,
    {
        let pool = pool.clone();
        let f = Rc::new(f);
        move |args| {
            let f = f.clone();
            Self::make(&pool, make()).run(async move { (*f)(args).await })
        }
    }
}

impl<S: 'static> AnyContext for Context<S> {
    fn async_id(&self) -> AsyncId {
        self.resource.id()
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn state(&self) -> ContextState {
        self.state.get()
    }

    fn track(&self, task: JoinHandle<()>) {
        if self.state.get() == ContextState::Destroyed {
            tracing::warn!(
                context = %self.id,
                task = %task.id(),
                "context already destroyed, task left detached"
            );
            return;
        }
        self.tasks.borrow_mut().push(task);
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

pub(crate) async fn settle_detached<F, T, E>(context: Uuid, task: F)
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    if let Err(error) = task.await {
        tracing::debug!(%context, %error, "detached task failed");
    }
}

enum Stage<T, E> {
    Body(JoinHandle<Result<T, E>>),
    Settling {
        outcome: Result<T, RunError<E>>,
        pending: Vec<JoinHandle<()>>,
    },
    Rejected(ContextState),
    Done,
}

/// Future returned by [`Context::run`].
///
/// Dropping it before it settles destroys the context without waiting.
///
/// # Panics
///
/// Panics when polled again after it has returned `Ready`.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Run<T, E, S = ()> {
    context: Rc<Context<S>>,
    stage: Stage<T, E>,
}

impl<T, E, S> Run<T, E, S> {
    pub fn context(&self) -> &Rc<Context<S>> {
        &self.context
    }
}

impl<T, E, S> Future for Run<T, E, S> {
    type Output = Result<T, RunError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        loop {
            match mem::replace(this.stage, Stage::Done) {
                Stage::Body(mut body) => {
                    let settled = match Pin::new(&mut body).poll(cx) {
                        Poll::Ready(settled) => settled,
                        Poll::Pending => {
                            *this.stage = Stage::Body(body);
                            return Poll::Pending;
                        }
                    };
                    let outcome = match settled {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(error)) => Err(RunError::Body(error)),
                        Err(cancelled) => Err(RunError::Cancelled(cancelled)),
                    };
                    *this.stage = Stage::Settling {
                        outcome,
                        pending: this.context.take_tasks(),
                    };
                }
                Stage::Settling {
                    outcome,
                    mut pending,
                } => {
                    pending.retain_mut(|task| Pin::new(task).poll(cx).is_pending());
                    if !pending.is_empty() {
                        *this.stage = Stage::Settling { outcome, pending };
                        return Poll::Pending;
                    }
                    // tasks added while the previous ones were running
                    let added = this.context.take_tasks();
                    if added.is_empty() {
                        this.context.finish();
                        return Poll::Ready(outcome);
                    }
                    *this.stage = Stage::Settling {
                        outcome,
                        pending: added,
                    };
                }
                Stage::Rejected(state) => {
                    return Poll::Ready(Err(RunError::AlreadyRun(state)));
                }
                Stage::Done => panic!("`Run` polled after completion"),
            }
        }
    }
}

#[pinned_drop]
impl<T, E, S> PinnedDrop for Run<T, E, S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if matches!(this.stage, Stage::Body(_) | Stage::Settling { .. }) {
            tracing::debug!(context = %this.context.id, "run dropped before settling");
            this.context.finish();
        }
    }
}
