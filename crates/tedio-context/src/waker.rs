//! Wake implementation for the executor.
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;
use std::thread::{self, Thread};

use futures::task::ArcWake;

use crate::hooks::AsyncId;

/// Ready queue shared between the executor thread and every waker it hands out.
pub(crate) struct ThreadNotify {
    /// The (single) executor thread.
    thread: Thread,
    /// A flag to ensure a wakeup (i.e. `unpark()`) is not "forgotten"
    /// before the next `park()`, which may otherwise happen if the code
    /// being executed as part of the future(s) being polled makes use of
    /// park / unpark calls of its own.
    unparked: AtomicBool,
    /// Set when the root future passed to `block_on` was woken.
    root_woken: AtomicBool,
    ready: Mutex<ReadyQueue>,
}

/// Task ids waiting to be polled, each at most once.
#[derive(Default)]
struct ReadyQueue {
    order: VecDeque<AsyncId>,
    queued: HashSet<AsyncId>,
}

impl ThreadNotify {
    pub(crate) fn new() -> Self {
        ThreadNotify {
            thread: thread::current(),
            unparked: AtomicBool::new(false),
            root_woken: AtomicBool::new(false),
            ready: Mutex::new(ReadyQueue::default()),
        }
    }

    fn ready(&self) -> MutexGuard<'_, ReadyQueue> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `id` unless it is already waiting to be polled.
    pub(crate) fn schedule(&self, id: AsyncId) {
        let mut ready = self.ready();
        if !ready.queued.insert(id) {
            return;
        }
        ready.order.push_back(id);
        drop(ready);
        self.unpark();
    }

    pub(crate) fn next_ready(&self) -> Option<AsyncId> {
        let mut ready = self.ready();
        let id = ready.order.pop_front()?;
        ready.queued.remove(&id);
        Some(id)
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready().order.is_empty()
    }

    pub(crate) fn clear(&self) {
        let mut ready = self.ready();
        ready.order.clear();
        ready.queued.clear();
    }

    pub(crate) fn wake_root(&self) {
        self.root_woken.store(true, Ordering::Release);
        self.unpark();
    }

    pub(crate) fn take_root_wake(&self) -> bool {
        self.root_woken.swap(false, Ordering::Acquire)
    }

    fn unpark(&self) {
        let unparked = self.unparked.swap(true, Ordering::Release);
        if !unparked {
            // If the thread has not been unparked yet, it must be done
            // now. If it was actually parked, it will run again,
            // otherwise the token made available by `unpark`
            // may be consumed before reaching `park()`, but `unparked`
            // ensures it is not forgotten.
            self.thread.unpark();
        }
    }

    /// Parks the executor thread unless a wakeup arrived since the last park.
    pub(crate) fn park(&self) {
        if !self.unparked.swap(false, Ordering::Acquire) {
            tracing::trace!("executor parked");
            thread::park();
        }
    }
}

/// Waker for one task, or for the root future when `task` is `None`.
struct TaskNotify {
    task: Option<AsyncId>,
    notify: Arc<ThreadNotify>,
}

impl ArcWake for TaskNotify {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        match arc_self.task {
            Some(id) => arc_self.notify.schedule(id),
            None => arc_self.notify.wake_root(),
        }
    }
}

pub(crate) fn task_waker(id: AsyncId, notify: &Arc<ThreadNotify>) -> Waker {
    futures::task::waker(Arc::new(TaskNotify {
        task: Some(id),
        notify: notify.clone(),
    }))
}

pub(crate) fn root_waker(notify: &Arc<ThreadNotify>) -> Waker {
    futures::task::waker(Arc::new(TaskNotify {
        task: None,
        notify: notify.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_waker_schedules_its_id_once() {
        let notify = Arc::new(ThreadNotify::new());
        let waker = task_waker(AsyncId::new(3), &notify);
        let other = task_waker(AsyncId::new(4), &notify);
        waker.wake_by_ref();
        other.wake_by_ref();
        waker.wake_by_ref();
        assert_eq!(notify.next_ready(), Some(AsyncId::new(3)));
        assert_eq!(notify.next_ready(), Some(AsyncId::new(4)));
        assert_eq!(notify.next_ready(), None);

        // taken off the queue, so it can be queued again
        waker.wake();
        assert!(notify.has_ready());
        assert_eq!(notify.next_ready(), Some(AsyncId::new(3)));
    }

    #[test]
    fn test_root_waker_from_another_thread() {
        let notify = Arc::new(ThreadNotify::new());
        assert!(!notify.take_root_wake());

        let waker = root_waker(&notify);
        thread::spawn(move || waker.wake()).join().unwrap();
        // a pending unpark means this returns immediately
        notify.park();
        assert!(notify.take_root_wake());
    }
}
