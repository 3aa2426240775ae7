use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_PARALLEL_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("concurrency budget is closed")]
    Closed,
    #[error("scheduled unit did not complete: {0}")]
    Panicked(String),
}

/// Shared limit on in-flight remote calls. Every clone draws from the same
/// permits; waiters are served in arrival order.
#[derive(Debug, Clone)]
pub struct Budget {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Budget {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }

    /// Refuses every further permit. Units still waiting get
    /// [`SchedulerError::Closed`]; units holding a permit run to the end.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Runs `work` while holding one permit.
    pub async fn run<F>(&self, work: F) -> Result<F::Output, SchedulerError>
    where
        F: Future,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SchedulerError::Closed)?;
        Ok(work.await)
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLEL_LIMIT)
    }
}

pub struct Scheduler<T> {
    budget: Budget,
    units: JoinSet<Result<T, SchedulerError>>,
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            units: JoinSet::new(),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Spawns a single-call unit; it waits for a permit before starting.
    pub fn submit<F>(&mut self, unit: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let budget = self.budget.clone();
        self.units.spawn(async move { budget.run(unit).await });
    }

    /// Spawns a unit that issues several remote calls and takes one permit per
    /// call itself. The unit holds no permit of its own, otherwise nested
    /// calls could deadlock once every permit belongs to a waiting unit.
    pub fn submit_metered<F, Fut>(&mut self, unit: F)
    where
        F: FnOnce(Budget) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let work = unit(self.budget.clone());
        self.units.spawn(async move { Ok(work.await) });
    }

    /// Output of the next unit to finish, `None` once nothing is scheduled.
    /// Cancel safe.
    pub async fn next_completed(&mut self) -> Option<Result<T, SchedulerError>> {
        let joined = self.units.join_next().await?;
        Some(match joined {
            Ok(output) => output,
            Err(err) => Err(SchedulerError::Panicked(err.to_string())),
        })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
