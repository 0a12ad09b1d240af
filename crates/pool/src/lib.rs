//! Bounded pool of reusable resources.
//!
//! The pool caches expensive-to-build items (typically client connections)
//! behind an explicit checkout/return protocol:
//!
//! - [`Pool::get`] hands out an idle item, or builds a fresh one while
//!   capacity allows.
//! - [`Pool::put`] returns items to the idle list; nothing is torn down.
//! - [`Pool::drain`] tears down every idle item and reports teardown errors
//!   on a channel.
//!
//! The pool knows nothing about what it stores beyond the build and teardown
//! functions supplied at construction.
//!
//! # Example
//!
//! ```no_run
//! use ferrule_pool::Pool;
//!
//! # async fn example() -> Result<(), ferrule_pool::Error> {
//! let pool: Pool<Vec<u8>> = Pool::new(
//!     4,
//!     || async { Ok(Vec::with_capacity(1024)) },
//!     |_buf| async { Ok(()) },
//! );
//!
//! let buf = pool.get().await?;
//! pool.put([buf]).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Boxed error type accepted from build/teardown functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Builder<T> = Box<dyn Fn() -> BoxFuture<Result<T, BoxError>> + Send + Sync>;
type Teardown<T> = Box<dyn Fn(T) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// Capacity of the error channel returned by [`Pool::drain`]. Delivery is
/// best-effort; errors beyond this many undrained entries are dropped.
const DRAIN_ERROR_BUFFER: usize = 16;

/// Errors reported by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Checkout was refused because every slot is already checked out.
    #[error("pool capacity reached: {active} of {limit} items checked out")]
    Capacity {
        /// Items currently checked out.
        active: usize,
        /// Configured pool limit.
        limit: usize,
    },

    /// The build function failed while creating a fresh item.
    #[error("failed to build pool item: {0}")]
    Build(#[source] BoxError),

    /// The teardown function failed while draining an idle item.
    #[error("failed to tear down pool item: {0}")]
    Teardown(#[source] BoxError),
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Items sitting in the idle list.
    pub idle: usize,
    /// Items currently checked out.
    pub active: usize,
}

struct State<T> {
    idle: VecDeque<T>,
    active: usize,
}

struct Inner<T> {
    limit: usize,
    state: Mutex<State<T>>,
    build: Builder<T>,
    teardown: Teardown<T>,
}

/// Bounded cache of reusable items.
///
/// All mutation serializes on one internal lock; the build function runs
/// inside the critical section, so concurrent [`Pool::get`] callers wait out
/// each other's builds. Build and teardown functions must not call back into
/// the pool.
pub struct Pool<T: Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool holding at most `limit` items. A `limit` of zero means
    /// unbounded.
    pub fn new<B, BF, D, DF>(limit: usize, build: B, teardown: D) -> Self
    where
        B: Fn() -> BF + Send + Sync + 'static,
        BF: Future<Output = Result<T, BoxError>> + Send + 'static,
        D: Fn(T) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                limit,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    active: 0,
                }),
                build: Box::new(move || Box::pin(build())),
                teardown: Box::new(move |item| Box::pin(teardown(item))),
            }),
        }
    }

    /// Check out an item.
    ///
    /// Idle items are reused in the order they were returned. With an empty
    /// idle list a fresh item is built, unless the pool is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] when `limit > 0` and every slot is
    /// checked out, or [`Error::Build`] when the build function fails. A
    /// failed checkout leaves the counters untouched.
    pub async fn get(&self) -> Result<T, Error> {
        let mut state = self.inner.state.lock().await;

        if let Some(item) = state.idle.pop_front() {
            state.active += 1;
            return Ok(item);
        }

        if self.inner.limit > 0 && state.active >= self.inner.limit {
            return Err(Error::Capacity {
                active: state.active,
                limit: self.inner.limit,
            });
        }

        let item = (self.inner.build)().await.map_err(Error::Build)?;
        state.active += 1;
        Ok(item)
    }

    /// Return checked-out items to the idle list.
    ///
    /// Never invokes the teardown function.
    pub async fn put(&self, items: impl IntoIterator<Item = T> + Send) {
        let mut state = self.inner.state.lock().await;
        for item in items {
            state.idle.push_back(item);
            state.active = state.active.saturating_sub(1);
        }
    }

    /// Read the idle/active counters.
    pub async fn stats(&self) -> Stats {
        let state = self.inner.state.lock().await;
        Stats {
            idle: state.idle.len(),
            active: state.active,
        }
    }

    /// Tear down every idle item.
    ///
    /// Teardown runs on a background task under the pool lock; errors are
    /// forwarded on the returned channel best-effort, and the channel closes
    /// once every idle item has been offered to the teardown function.
    /// Checked-out items are not touched.
    pub fn drain(&self) -> mpsc::Receiver<Error> {
        let (tx, rx) = mpsc::channel(DRAIN_ERROR_BUFFER);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut state = inner.state.lock().await;
            let items: Vec<T> = state.idle.drain(..).collect();
            debug!(count = items.len(), "draining pool");
            for item in items {
                if let Err(e) = (inner.teardown)(item).await {
                    let _ = tx.try_send(Error::Teardown(e));
                }
            }
        });

        rx
    }
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(limit: usize, built: Arc<AtomicUsize>, torn: Arc<AtomicUsize>) -> Pool<usize> {
        let torn_down = Arc::clone(&torn);
        Pool::new(
            limit,
            move || {
                let built = Arc::clone(&built);
                async move { Ok(built.fetch_add(1, Ordering::SeqCst)) }
            },
            move |_item| {
                let torn = Arc::clone(&torn_down);
                async move {
                    torn.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn get_beyond_capacity_fails_without_mutating_state() {
        let built = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(2, Arc::clone(&built), Arc::new(AtomicUsize::new(0)));

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.stats().await, Stats { idle: 0, active: 2 });

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, Error::Capacity { active: 2, limit: 2 }));
        assert_eq!(pool.stats().await, Stats { idle: 0, active: 2 });
        assert_eq!(built.load(Ordering::SeqCst), 2);

        pool.put([a, b]).await;
    }

    #[tokio::test]
    async fn put_restores_idle_and_decrements_active() {
        let pool = counting_pool(
            2,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let item = pool.get().await.unwrap();
        assert_eq!(pool.stats().await, Stats { idle: 0, active: 1 });

        pool.put([item]).await;
        assert_eq!(pool.stats().await, Stats { idle: 1, active: 0 });

        // Reuse must not build a second item.
        let again = pool.get().await.unwrap();
        assert_eq!(again, 0);
        pool.put([again]).await;
    }

    #[tokio::test]
    async fn idle_plus_active_never_exceeds_limit() {
        let pool = counting_pool(
            3,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put([a]).await;
        let c = pool.get().await.unwrap();
        let d = pool.get().await.unwrap();

        let stats = pool.stats().await;
        assert!(stats.idle + stats.active <= 3);

        pool.put([b, c, d]).await;
        let stats = pool.stats().await;
        assert!(stats.idle + stats.active <= 3);
    }

    #[tokio::test]
    async fn drain_empties_idle_and_runs_teardown_once_per_item() {
        let torn = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(4, Arc::new(AtomicUsize::new(0)), Arc::clone(&torn));

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let held = pool.get().await.unwrap();
        pool.put([a, b]).await;

        let mut errors = pool.drain();
        // Channel closes once teardown has been attempted for all idle items.
        assert!(errors.recv().await.is_none());

        assert_eq!(torn.load(Ordering::SeqCst), 2);
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 1);

        pool.put([held]).await;
    }

    #[tokio::test]
    async fn drain_forwards_teardown_errors() {
        let pool: Pool<u8> = Pool::new(
            2,
            || async { Ok(1u8) },
            |_item| async { Err("teardown boom".into()) },
        );

        let item = pool.get().await.unwrap();
        pool.put([item]).await;

        let mut errors = pool.drain();
        let err = errors.recv().await.expect("one teardown error");
        assert!(matches!(err, Error::Teardown(_)));
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn unbounded_pool_never_hits_capacity() {
        let pool = counting_pool(
            0,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );

        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(pool.get().await.unwrap());
        }
        assert_eq!(pool.stats().await.active, 32);
        pool.put(held).await;
    }
}
