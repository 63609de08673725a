//! Worker pool for running the reactions of one level.
//!
//! With the `parallel` feature the pool owns a rayon thread pool and maps
//! each batch over it; results always come back in input order, so the
//! scheduler commits effects in reaction order no matter which worker ran
//! what. Without the feature, or with a single worker, batches run inline.
//!
//! # Feature Flag
//!
//! ```toml
//! [dependencies]
//! kairos = { version = "0.1", features = ["parallel"] }
//! ```

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::warn;

/// Runs batches of independent jobs.
pub struct WorkerPool {
    workers: usize,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl WorkerPool {
    /// Creates a pool with `workers` threads. Zero or one runs inline.
    pub fn new(workers: usize) -> Self {
        #[cfg(feature = "parallel")]
        {
            let pool = if workers > 1 {
                match rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("kairos-worker-{i}"))
                    .build()
                {
                    Ok(pool) => Some(pool),
                    Err(err) => {
                        warn!(%err, workers, "worker pool unavailable, running reactions inline");
                        None
                    }
                }
            } else {
                None
            };
            Self {
                workers: workers.max(1),
                pool,
            }
        }
        #[cfg(not(feature = "parallel"))]
        {
            if workers > 1 {
                warn!(workers, "built without the parallel feature, running reactions inline");
            }
            Self {
                workers: workers.max(1),
            }
        }
    }

    /// Configured number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether batches may run on more than one thread.
    pub fn is_parallel(&self) -> bool {
        #[cfg(feature = "parallel")]
        {
            self.pool.is_some()
        }
        #[cfg(not(feature = "parallel"))]
        {
            false
        }
    }

    /// Applies `job` to every item and returns the results in item order.
    /// Returns once every job has finished.
    pub fn map<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            if items.len() > 1 {
                return pool.install(|| items.into_par_iter().map(&job).collect());
            }
        }
        items.into_iter().map(job).collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(1)
    }
}
