//! Executor configuration.

use std::borrow::Cow;

const DEFAULT_TICK_BUDGET: usize = 64;

/// Settings for an [`Executor`](crate::Executor).
///
/// ```rust
/// use tedio_context::{Executor, ExecutorConfig};
///
/// let executor = Executor::with_config(
///     ExecutorConfig::default()
///         .with_name("request-loop")
///         .with_tick_budget(16),
/// );
/// assert_eq!(executor.config().name(), "request-loop");
/// ```
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    name: Cow<'static, str>,
    tick_budget: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("tedio"),
            tick_budget: DEFAULT_TICK_BUDGET,
        }
    }
}

impl ExecutorConfig {
    /// Name recorded on the executor's log events.
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Maximum number of task polls between two checks of the root future in
    /// `block_on`. Zero is treated as one.
    pub fn with_tick_budget(mut self, budget: usize) -> Self {
        self.tick_budget = budget.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tick_budget(&self) -> usize {
        self.tick_budget
    }
}
