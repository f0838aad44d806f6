//! # Tedio Context
//!
//! Implicit, session-scoped context for single-threaded async code.
//!
//! ## Overview
//!
//! A [`Context`] represents one logical session (a request, a job, a
//! transaction). Once it runs a body, every operation that body spawns,
//! including detached ones nobody awaits, can look the context up with
//! [`Context::current`] instead of having it threaded through every signature.
//!
//! Tracking is driven by lifecycle signals from the [`Executor`]: every task
//! it schedules is reported through [`AsyncHook`] when it is created, around
//! each poll, and when it is destroyed. The [`SessionPool`] listens to those
//! signals, links each new operation to the session that was active when it
//! was created, and resolves the active session whenever one of them runs.
//!
//! ## Features
//!
//! - **🧵 Implicit context**: `Context::current` works across spawns and awaits
//! - **📌 Detached work**: `add_task` makes a context wait for work it did not await
//! - **🪝 Lifecycle hooks**: custom [`AsyncHook`]s observe every scheduled operation
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use tedio_context::{Context, Executor, SessionPool};
//!
//! let executor = Executor::new();
//! let pool = SessionPool::new(&executor);
//!
//! let handler_pool = pool.clone();
//! let handle = Context::wrap(&pool, || "request", move |n: u32| {
//!     let pool = handler_pool.clone();
//!     async move {
//!         // spawned work resolves to the same context
//!         let task_pool = pool.clone();
//!         let label = pool
//!             .executor()
//!             .unwrap()
//!             .spawn(async move { **Context::<&'static str>::current(&task_pool).unwrap() })
//!             .await
//!             .unwrap();
//!         Ok::<_, Infallible>(format!("{label} {n}"))
//!     }
//! });
//!
//! assert_eq!(executor.block_on(handle(1)).unwrap(), "request 1");
//! ```
//!
//! ## Limits
//!
//! Everything runs on one thread. The active session is a single cursor,
//! cleared at the end of every execution window, so a nested `run` clears it
//! for the rest of the enclosing poll; it is restored the next time the
//! enclosing task is polled. Detached tasks that never settle keep their
//! context from ever completing.
//!
//! Pools, contexts and resources do not keep the executor's tasks alive.
//! Dropping the last [`Executor`] handle drops the unfinished tasks and
//! destroys the contexts they were running. A task that captures an
//! `Executor` clone keeps it alive until the task finishes; use
//! [`Executor::shutdown`] in that case.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod pool;
pub mod resource;
mod waker;

// Re-export commonly used items for convenience
pub use config::ExecutorConfig;
pub use context::{AnyContext, Context, ContextState, Run};
pub use error::{ContextError, JoinError, RunError};
pub use executor::{Executor, JoinHandle, yield_now};
pub use hooks::{AsyncHook, AsyncId, HookId};
pub use pool::SessionPool;
pub use resource::AsyncResource;
