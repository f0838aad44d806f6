//! Manually driven tracked operations.

use std::cell::Cell;

use crate::executor::{Executor, WeakExecutor};
use crate::hooks::{AsyncId, HookSet};

/// An operation whose lifecycle signals are emitted by its owner rather than
/// by the executor's polling loop.
///
/// Construction allocates an id and emits `created`, attributed to whatever
/// task is executing. The owner then brackets its own execution windows with
/// [`emit_before`](Self::emit_before) and [`emit_after`](Self::emit_after) and
/// finally calls [`emit_destroy`](Self::emit_destroy). A resource dropped
/// without being destroyed emits the signal on drop.
///
/// A resource does not keep the executor's tasks alive. Its signals still
/// reach the installed hooks after the last [`Executor`] handle is gone.
pub struct AsyncResource {
    id: AsyncId,
    executor: WeakExecutor,
    destroyed: Cell<bool>,
}

impl std::fmt::Debug for AsyncResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResource")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

impl AsyncResource {
    pub fn new(executor: &Executor) -> Self {
        Self::with_handle(&executor.downgrade())
    }

    pub(crate) fn with_handle(executor: &WeakExecutor) -> Self {
        let core = executor.core();
        let id = core.allocate_id();
        core.hooks().emit_created(id, core.executing());
        Self {
            id,
            executor: executor.clone(),
            destroyed: Cell::new(false),
        }
    }

    pub fn id(&self) -> AsyncId {
        self.id
    }

    /// The executor this resource was created on, unless it has been dropped.
    pub fn executor(&self) -> Option<Executor> {
        self.executor.upgrade()
    }

    fn hooks(&self) -> &HookSet {
        self.executor.core().hooks()
    }

    pub fn emit_before(&self) {
        self.hooks().emit_before(self.id);
    }

    pub fn emit_after(&self) {
        self.hooks().emit_after(self.id);
    }

    /// Emits `destroyed` the first time it is called. Returns whether the
    /// signal was emitted by this call.
    pub fn emit_destroy(&self) -> bool {
        if self.destroyed.replace(true) {
            return false;
        }
        self.hooks().emit_destroyed(self.id);
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// Runs `f` inside this resource's execution window.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        self.emit_before();
        let result = f();
        self.emit_after();
        result
    }
}

impl Drop for AsyncResource {
    fn drop(&mut self) {
        if self.emit_destroy() {
            tracing::trace!(id = %self.id, "resource dropped before destroy");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::hooks::AsyncHook;

    #[derive(Default)]
    struct Log(RefCell<Vec<String>>);

    impl AsyncHook for Log {
        fn created(&self, id: AsyncId, _trigger: Option<AsyncId>) {
            self.0.borrow_mut().push(format!("created {id}"));
        }
        fn before(&self, id: AsyncId) {
            self.0.borrow_mut().push(format!("before {id}"));
        }
        fn after(&self, id: AsyncId) {
            self.0.borrow_mut().push(format!("after {id}"));
        }
        fn destroyed(&self, id: AsyncId) {
            self.0.borrow_mut().push(format!("destroyed {id}"));
        }
    }

    #[test]
    fn test_lifecycle_signals() {
        let executor = Executor::new();
        let log = Rc::new(Log::default());
        executor.install_hook(log.clone());

        let resource = AsyncResource::new(&executor);
        let id = resource.id();
        assert_eq!(resource.in_scope(|| 3), 3);
        assert!(resource.emit_destroy());
        assert!(!resource.emit_destroy());
        drop(resource);

        assert_eq!(
            *log.0.borrow(),
            vec![
                format!("created {id}"),
                format!("before {id}"),
                format!("after {id}"),
                format!("destroyed {id}"),
            ]
        );
    }

    #[test]
    fn test_drop_destroys_once() {
        let executor = Executor::new();
        let log = Rc::new(Log::default());
        executor.install_hook(log.clone());

        let resource = AsyncResource::new(&executor);
        assert!(!resource.is_destroyed());
        drop(resource);
        assert_eq!(
            log.0
                .borrow()
                .iter()
                .filter(|line| line.starts_with("destroyed"))
                .count(),
            1
        );
    }

    #[test]
    fn test_signals_outlive_the_executor_handle() {
        let executor = Executor::new();
        let log = Rc::new(Log::default());
        executor.install_hook(log.clone());

        let resource = AsyncResource::new(&executor);
        let id = resource.id();
        drop(executor);

        assert!(resource.executor().is_none());
        assert!(resource.emit_destroy());
        assert_eq!(log.0.borrow().last(), Some(&format!("destroyed {id}")));
    }

    #[test]
    fn test_ids_do_not_collide_with_tasks() {
        let executor = Executor::new();
        let resource = AsyncResource::new(&executor);
        let handle = executor.spawn(async {});
        assert_ne!(resource.id(), handle.id());
    }
}
