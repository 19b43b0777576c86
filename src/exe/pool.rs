use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Largest pool a batch, drain or queue processor may ask for.
pub const MAX_POOL_SIZE: usize = 1024;

/// A set of spawned tasks bounded by a maximum number running at once.
///
/// Every spawned task holds a semaphore permit until it finishes, so the number of tasks running
/// never exceeds the limit, however fast new work is claimed.
///
#[derive(Debug)]
pub struct WorkerPool<T> {
    limit: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    peak: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// A pool running at most `limit` tasks at once, with `limit` clamped to 1..=[`MAX_POOL_SIZE`].
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(1, MAX_POOL_SIZE);
        Self { limit, permits: Arc::new(Semaphore::new(limit)), tasks: JoinSet::new(), peak: 0 }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Tasks currently holding a permit.
    pub fn active(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Most tasks that ever held a permit at the same time.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn has_capacity(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Whether no task is left to join.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `task` if the pool has capacity, otherwise hand it back.
    pub fn try_spawn<F>(&mut self, task: F) -> Result<(), F>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Err(task);
        };

        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
        self.peak = self.peak.max(self.active());
        Ok(())
    }

    /// Wait for the next task to finish. `None` when the pool is idle.
    pub async fn join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    /// A finished task, without waiting.
    pub fn try_join_next(&mut self) -> Option<Result<T, JoinError>> {
        self.tasks.try_join_next()
    }

    /// Wait for every remaining task.
    pub async fn drain(&mut self) -> Vec<Result<T, JoinError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn spawning_past_the_limit_is_refused() {
        let mut pool = WorkerPool::new(2);
        let release = Arc::new(Semaphore::new(0));

        for _ in 0..2 {
            let release = release.clone();
            assert!(pool.try_spawn(async move { drop(release.acquire().await) }).is_ok());
        }
        assert!(!pool.has_capacity());
        assert!(pool.try_spawn(async {}).is_err());

        release.add_permits(2);
        let results = pool.drain().await;
        assert_eq!(results.len(), 2);
        assert!(pool.is_idle());
        assert!(pool.has_capacity());
        assert_eq!(pool.peak(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_tasks_never_exceed_the_limit() {
        let mut pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut spawned = 0;
        while spawned < 12 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let task = async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            };
            match pool.try_spawn(task) {
                Ok(()) => spawned += 1,
                Err(_) => {
                    pool.join_next().await;
                }
            }
        }
        pool.drain().await;

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(pool.peak() <= 3);
    }

    #[test]
    fn limit_is_clamped_to_the_supported_range() {
        assert_eq!(WorkerPool::<()>::new(0).limit(), 1);

        let pool = WorkerPool::<()>::new(usize::MAX);
        assert_eq!(pool.limit(), MAX_POOL_SIZE);
        assert_eq!(pool.active(), 0);
    }
}
