//! Session tracking.
//!
//! The pool maps operation ids to the contexts that own them. A context's own
//! id is a *session*; every operation created while that session is active is
//! linked to it as a *subsession*, transitively. Whenever the executor is
//! about to run an operation, the pool resolves which session owns it and
//! makes that the active one until the operation's window ends.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::rc::{Rc, Weak};

use crate::context::{AnyContext, settle_detached};
use crate::error::ContextError;
use crate::executor::{Executor, WeakExecutor};
use crate::hooks::{AsyncHook, AsyncId, HookId};

struct Session {
    id: AsyncId,
    context: Weak<dyn AnyContext>,
    descendants: HashSet<AsyncId>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<AsyncId, Session>,
    /// child operation -> owning session
    subsessions: HashMap<AsyncId, AsyncId>,
}

impl Tables {
    /// Drops the link for `child`, and the child from its owner's descendants.
    fn unlink(&mut self, child: AsyncId) {
        if let Some(owner) = self.subsessions.remove(&child) {
            if let Some(session) = self.sessions.get_mut(&owner) {
                session.descendants.remove(&child);
            }
        }
    }
}

#[derive(Default)]
struct PoolState {
    tables: RefCell<Tables>,
    /// Session considered current for the running execution window.
    active: Cell<Option<AsyncId>>,
}

impl PoolState {
    fn tables(&self, signal: &'static str) -> Option<RefMut<'_, Tables>> {
        match self.tables.try_borrow_mut() {
            Ok(tables) => Some(tables),
            Err(_) => {
                tracing::warn!(signal, "session tables busy, signal ignored");
                None
            }
        }
    }

    fn register(&self, context: &Rc<dyn AnyContext>) {
        let id = context.async_id();
        let Some(mut tables) = self.tables("register") else {
            return;
        };
        tables.unlink(id);
        let replaced = tables.sessions.insert(
            id,
            Session {
                id,
                context: Rc::downgrade(context),
                descendants: HashSet::new(),
            },
        );
        if replaced.is_some() {
            tracing::warn!(%id, "session registered twice, previous entry replaced");
        }
        tracing::debug!(%id, context = %context.id(), "session registered");
    }

    fn current(&self) -> Option<Rc<dyn AnyContext>> {
        let active = self.active.get()?;
        let tables = self.tables.try_borrow().ok()?;
        tables.sessions.get(&active)?.context.upgrade()
    }

    fn on_created(&self, child: AsyncId) {
        let Some(owner) = self.active.get() else {
            return;
        };
        let Some(mut tables) = self.tables("created") else {
            return;
        };
        if tables.sessions.contains_key(&child) {
            return;
        }
        let Some(session) = tables.sessions.get_mut(&owner) else {
            return;
        };
        session.descendants.insert(child);
        tables.subsessions.insert(child, owner);
    }

    fn on_before(&self, id: AsyncId) {
        let Ok(tables) = self.tables.try_borrow() else {
            tracing::warn!(signal = "before", "session tables busy, signal ignored");
            return;
        };
        if tables.sessions.contains_key(&id) {
            self.active.set(Some(id));
        } else if let Some(&owner) = tables.subsessions.get(&id) {
            self.active.set(Some(owner));
        }
    }

    fn on_after(&self) {
        self.active.set(None);
    }

    fn on_destroyed(&self, id: AsyncId) {
        let Some(mut tables) = self.tables("destroyed") else {
            return;
        };
        if let Some(session) = tables.sessions.remove(&id) {
            for child in &session.descendants {
                if tables.subsessions.get(child) == Some(&session.id) {
                    tables.subsessions.remove(child);
                }
            }
            tracing::debug!(
                %id,
                descendants = session.descendants.len(),
                "session destroyed"
            );
        }
        tables.unlink(id);
    }
}

/// Signals are forwarded for as long as the pool exists.
struct PoolHook(Weak<PoolState>);

impl AsyncHook for PoolHook {
    fn created(&self, id: AsyncId, _trigger: Option<AsyncId>) {
        if let Some(state) = self.0.upgrade() {
            state.on_created(id);
        }
    }

    fn before(&self, id: AsyncId) {
        if let Some(state) = self.0.upgrade() {
            state.on_before(id);
        }
    }

    fn after(&self, _id: AsyncId) {
        if let Some(state) = self.0.upgrade() {
            state.on_after();
        }
    }

    fn destroyed(&self, id: AsyncId) {
        if let Some(state) = self.0.upgrade() {
            state.on_destroyed(id);
        }
    }
}

/// Registry of live sessions for one executor.
///
/// Created once per executor and handed to every
/// [`Context`](crate::Context). Clones share the same state. A pool does not
/// keep the executor's tasks alive, so tasks may capture it freely.
#[derive(Clone)]
pub struct SessionPool {
    state: Rc<PoolState>,
    executor: WeakExecutor,
    hook: Rc<Cell<Option<HookId>>>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.session_count())
            .field("subsessions", &self.subsession_count())
            .field("active", &self.active_session())
            .finish()
    }
}

impl SessionPool {
    /// Creates a pool and subscribes it to `executor`'s lifecycle signals.
    pub fn new(executor: &Executor) -> Self {
        let state = Rc::new(PoolState::default());
        let hook = executor.install_hook(Rc::new(PoolHook(Rc::downgrade(&state))));
        tracing::debug!(executor = %executor.config().name(), "session pool installed");
        Self {
            state,
            executor: executor.downgrade(),
            hook: Rc::new(Cell::new(Some(hook))),
        }
    }

    /// The executor this pool listens to, unless it has been dropped.
    pub fn executor(&self) -> Option<Executor> {
        self.executor.upgrade()
    }

    pub(crate) fn handle(&self) -> &WeakExecutor {
        &self.executor
    }

    /// Starts a session keyed by the context's own id.
    ///
    /// Registering the same id twice replaces the earlier session.
    pub fn register(&self, context: &Rc<dyn AnyContext>) {
        self.state.register(context);
    }

    /// The context owning the running execution window, if any.
    pub fn current(&self) -> Option<Rc<dyn AnyContext>> {
        self.state.current()
    }

    /// Spawns `task` and makes the current context wait for it before its
    /// `run` completes.
    ///
    /// Fails without spawning anything when no context is active or the
    /// executor is gone.
    pub fn add_task<F, T, E>(&self, task: F) -> Result<(), ContextError>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: std::fmt::Display + 'static,
    {
        let context = self.current().ok_or(ContextError::NoActiveContext)?;
        let executor = self.executor().ok_or(ContextError::ExecutorDropped)?;
        let handle = executor.spawn(settle_detached(context.id(), task));
        context.track(handle);
        Ok(())
    }

    /// Unsubscribes from the executor and forgets every session.
    pub fn shutdown(&self) {
        if let Some(hook) = self.hook.take() {
            self.executor.core().hooks().remove(hook);
            tracing::debug!("session pool shut down");
        }
        if let Ok(mut tables) = self.state.tables.try_borrow_mut() {
            *tables = Tables::default();
        }
        self.state.active.set(None);
    }

    pub fn is_installed(&self) -> bool {
        self.hook.get().is_some()
    }

    pub fn is_registered(&self, id: AsyncId) -> bool {
        self.state.tables.borrow().sessions.contains_key(&id)
    }

    pub fn active_session(&self) -> Option<AsyncId> {
        self.state.active.get()
    }

    /// The session `id` is linked to, if it is a tracked descendant.
    pub fn owner_of(&self, id: AsyncId) -> Option<AsyncId> {
        self.state.tables.borrow().subsessions.get(&id).copied()
    }

    pub fn session_count(&self) -> usize {
        self.state.tables.borrow().sessions.len()
    }

    pub fn subsession_count(&self) -> usize {
        self.state.tables.borrow().subsessions.len()
    }
}
