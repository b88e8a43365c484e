use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// How per-image work units are spread across workers.
#[derive(Clone)]
pub enum Parallelism {
    /// In input order on the calling thread; the first error is surfaced
    /// immediately.
    Sequential,
    /// An internally managed pool with one worker per available core.
    Auto,
    /// An internally managed pool with exactly this many workers.
    Threads(usize),
    /// A caller-owned pool; it is left alive after dispatch.
    Pool(Arc<ThreadPool>),
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Sequential
    }
}

impl fmt::Debug for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallelism::Sequential => write!(f, "Sequential"),
            Parallelism::Auto => write!(f, "Auto"),
            Parallelism::Threads(n) => write!(f, "Threads({n})"),
            Parallelism::Pool(pool) => write!(f, "Pool({} threads)", pool.current_num_threads()),
        }
    }
}

/// Apply `f` to every item, returning results index-aligned with `items`
/// no matter how the work was scheduled.
///
/// Any failing unit aborts the whole dispatch with no partial results.
/// Internally built pools are joined before the error propagates.
pub fn par_map<T, R, F>(items: &[T], f: F, parallelism: &Parallelism) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    match parallelism {
        Parallelism::Sequential => items.iter().map(&f).collect(),
        Parallelism::Auto => in_fresh_pool(num_cpus::get(), items, f),
        Parallelism::Threads(0) => {
            Err(Error::Config("worker count must be at least 1".to_owned()))
        }
        Parallelism::Threads(n) => in_fresh_pool(*n, items, f),
        Parallelism::Pool(pool) => pool.install(|| items.par_iter().map(&f).collect()),
    }
}

fn in_fresh_pool<T, R, F>(threads: usize, items: &[T], f: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| Error::Config(format!("failed to build worker pool: {e}")))?;
    // the pool drops (joining all workers) on success and error paths alike
    pool.install(|| items.par_iter().map(&f).collect())
}
