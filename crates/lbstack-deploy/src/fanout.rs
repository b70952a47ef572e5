//! Bounded concurrent fan-out
//!
//! Resources of one kind are independent of each other, so their create,
//! update and delete calls run concurrently. [`TaskGroup::run`] drives every
//! task to completion and hands back all outcomes; a failing task never stops
//! its siblings.

use std::future::Future;

use futures::stream::{self, StreamExt};

use lbstack_common::{Error, Result};

/// Default number of in-flight infrastructure calls per kind
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Outcomes of a [`TaskGroup::run`]
#[derive(Debug)]
pub struct TaskResults<T> {
    /// Values of tasks that succeeded, in completion order
    pub succeeded: Vec<T>,
    /// Errors of tasks that failed, in completion order
    pub failed: Vec<Error>,
}

impl<T> TaskResults<T> {
    /// Whether every task succeeded
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<T> Default for TaskResults<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Runs a batch of fallible futures with at most `limit` in flight
#[derive(Debug, Clone, Copy)]
pub struct TaskGroup {
    limit: usize,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl TaskGroup {
    /// Group allowing `limit` concurrent tasks (at least one)
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Concurrency bound
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run every task and wait for all of them.
    pub async fn run<I, F, T>(&self, tasks: I) -> TaskResults<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T>>,
    {
        let outcomes: Vec<Result<T>> = stream::iter(tasks)
            .buffer_unordered(self.limit)
            .collect()
            .await;

        outcomes
            .into_iter()
            .fold(TaskResults::default(), |mut acc, outcome| {
                match outcome {
                    Ok(v) => acc.succeeded.push(v),
                    Err(e) => acc.failed.push(e),
                }
                acc
            })
    }
}
