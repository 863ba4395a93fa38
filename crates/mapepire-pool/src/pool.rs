//! Job pool implementation.
//!
//! The pool keeps an ordered list of [`SqlJob`]s and picks one per request:
//! the first `Ready` job, otherwise the `Busy` job with the fewest requests
//! in flight. When even that job has more than
//! [`GROWTH_THRESHOLD`] requests in flight and the pool has room, one more
//! job is connected in the background.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use mapepire_client::{
    ConnectionResult, DaemonServer, JdbcOptions, JobStatus, Query, QueryOptions, QueryRegistry,
    QueryResult, SqlJob,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::PoolOptions;
use crate::error::PoolError;

/// In-flight requests on the least-loaded job above which the pool grows.
pub const GROWTH_THRESHOLD: usize = 2;

/// A pool of server jobs.
///
/// Cloning a pool yields another handle to the same jobs.
///
/// # Example
///
/// ```rust,ignore
/// use mapepire_pool::Pool;
///
/// let pool = Pool::builder(server)
///     .max_size(5)
///     .starting_size(3)
///     .build();
/// pool.init().await?;
///
/// let result = pool.execute::<serde_json::Value>("values 1", Default::default()).await?;
/// pool.end().await;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: PoolOptions,
    registry: QueryRegistry,
    jobs: Mutex<Vec<SqlJob>>,
    /// Set while a background growth task runs.
    growing: AtomicBool,
    growth: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    created_at: Instant,
    metrics: Mutex<PoolMetricsInner>,
}

#[derive(Debug, Default)]
struct PoolMetricsInner {
    jobs_created: u64,
    jobs_failed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    growths_started: u64,
}

impl PoolInner {
    /// Build a job, mark it connecting and, if `pooled`, add it to the pool.
    ///
    /// The job is counted by [`Pool::has_space`] before the returned future
    /// is polled.
    fn start_job(
        &self,
        pooled: bool,
    ) -> (SqlJob, impl Future<Output = mapepire_client::Result<ConnectionResult>> + Send + use<>)
    {
        let mut builder = SqlJob::builder()
            .options(self.options.opts.clone())
            .registry(self.registry.clone());
        if let Some(timeout) = self.options.request_timeout {
            builder = builder.request_timeout(timeout);
        }
        let job = builder.build();
        let connecting = job.connect(&self.options.creds);

        if pooled {
            self.jobs.lock().push(job.clone());
        }
        self.metrics.lock().jobs_created += 1;
        tracing::debug!(job = %job.unique_id(), pooled, "starting pool job");

        (job, connecting)
    }

    async fn connect_new(&self, pooled: bool) -> Result<SqlJob, PoolError> {
        let (job, connecting) = self.start_job(pooled);
        match connecting.await {
            Ok(_) => Ok(job),
            Err(e) => {
                self.metrics.lock().jobs_failed += 1;
                Err(e.into())
            }
        }
    }

    fn snapshot(&self) -> Vec<SqlJob> {
        self.jobs.lock().clone()
    }

    fn live_count(&self) -> usize {
        self.jobs.lock().iter().filter(|j| j.status().is_live()).count()
    }

    fn has_space(&self) -> bool {
        self.live_count() < self.options.max_size as usize
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        Ok(())
    }
}

/// Remove jobs that have ended or never connected.
fn sweep(jobs: &mut Vec<SqlJob>) -> usize {
    let before = jobs.len();
    jobs.retain(|j| j.status().is_live());
    before - jobs.len()
}

fn first_ready(jobs: &[SqlJob]) -> Option<&SqlJob> {
    jobs.iter().find(|j| j.status() == JobStatus::Ready)
}

impl Pool {
    /// Create an empty pool. Call [`Pool::init`] to connect jobs.
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                registry: QueryRegistry::new(),
                jobs: Mutex::new(Vec::new()),
                growing: AtomicBool::new(false),
                growth: Mutex::new(None),
                closed: AtomicBool::new(false),
                created_at: Instant::now(),
                metrics: Mutex::new(PoolMetricsInner::default()),
            }),
        }
    }

    /// Start a builder for a pool connecting to `creds`.
    #[must_use]
    pub fn builder(creds: DaemonServer) -> PoolBuilder {
        PoolBuilder::new(creds)
    }

    /// Validate the sizing, then connect `starting_size` jobs concurrently.
    ///
    /// Nothing is created when the sizing is invalid. The first connection
    /// failure is returned.
    pub async fn init(&self) -> Result<(), PoolError> {
        self.inner.options.validate()?;
        self.inner.ensure_open()?;

        let starting = self.inner.options.starting_size;
        let connecting: Vec<_> = (0..starting)
            .map(|_| self.inner.start_job(true).1)
            .collect();

        // every connect runs to completion; the first failure is reported
        let results = join_all(connecting).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if let Some(e) = results.into_iter().find_map(Result::err) {
            self.inner.metrics.lock().jobs_failed += failed as u64;
            tracing::warn!(error = %e, failed, "pool initialization failed");
            return Err(e.into());
        }

        tracing::info!(
            starting,
            max = self.inner.options.max_size,
            "job pool initialized"
        );
        Ok(())
    }

    /// Whether fewer than `max_size` jobs are live.
    #[must_use]
    pub fn has_space(&self) -> bool {
        self.inner.has_space()
    }

    /// Number of `Ready` or `Busy` jobs.
    #[must_use]
    pub fn active_job_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .iter()
            .filter(|j| j.status().is_usable())
            .count()
    }

    /// Number of jobs held, in any state.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Drop jobs that have ended or never connected.
    pub fn cleanup(&self) {
        let removed = sweep(&mut self.inner.jobs.lock());
        if removed > 0 {
            tracing::debug!(removed, "removed dead jobs from pool");
        }
    }

    /// Query registry shared by every job of this pool.
    #[must_use]
    pub fn registry(&self) -> &QueryRegistry {
        &self.inner.registry
    }

    /// Pick a job without waiting.
    ///
    /// Returns the first `Ready` job, otherwise the least-loaded `Busy` job.
    /// If that job has more than [`GROWTH_THRESHOLD`] requests in flight
    /// and the pool has space, a new job is connected in the background; it
    /// is not returned by this call. At most one background growth runs at a
    /// time.
    pub fn get_job(&self) -> Result<SqlJob, PoolError> {
        self.inner.ensure_open()?;
        let jobs = self.inner.snapshot();

        if let Some(job) = first_ready(&jobs) {
            self.inner.metrics.lock().checkouts_successful += 1;
            return Ok(job.clone());
        }

        let Some(busy) = jobs
            .iter()
            .filter(|j| j.status() == JobStatus::Busy)
            .min_by_key(|j| j.running_count())
        else {
            self.inner.metrics.lock().checkouts_failed += 1;
            return Err(PoolError::NoJobAvailable);
        };

        if busy.running_count() > GROWTH_THRESHOLD && self.has_space() {
            self.grow_in_background();
        }

        self.inner.metrics.lock().checkouts_successful += 1;
        Ok(busy.clone())
    }

    fn grow_in_background(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime; skipping pool growth");
            return;
        };
        if self.inner.growing.swap(true, Ordering::AcqRel) {
            return;
        }

        let (job, connecting) = self.inner.start_job(true);
        self.inner.metrics.lock().growths_started += 1;
        tracing::debug!(job = %job.unique_id(), "growing pool in background");

        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            if let Err(e) = connecting.await {
                inner.metrics.lock().jobs_failed += 1;
                tracing::warn!(job = %job.unique_id(), error = %e, "background job failed to connect");
            }
            inner.growing.store(false, Ordering::Release);
        });
        *self.inner.growth.lock() = Some(handle);
    }

    /// Whether a background growth task is running.
    #[must_use]
    pub fn is_growing(&self) -> bool {
        self.inner.growing.load(Ordering::Acquire)
    }

    /// Return a `Ready` job, or connect a new one.
    ///
    /// A new job is connected when the pool has space or `use_new_job` is
    /// set; `use_new_job` may take the pool past `max_size`. Otherwise this
    /// falls back to [`Pool::get_job`].
    pub async fn wait_for_job(&self, use_new_job: bool) -> Result<SqlJob, PoolError> {
        self.inner.ensure_open()?;
        if let Some(job) = first_ready(&self.inner.snapshot()) {
            return Ok(job.clone());
        }

        if use_new_job || self.has_space() {
            return self.inner.connect_new(true).await;
        }
        self.get_job()
    }

    /// Take a job out of the pool.
    ///
    /// A `Ready` job is removed and returned. Otherwise a new job is
    /// connected and returned without being added. Either way the caller
    /// owns the job and must close it.
    pub async fn pop_job(&self) -> Result<SqlJob, PoolError> {
        self.inner.ensure_open()?;
        let popped = {
            let mut jobs = self.inner.jobs.lock();
            jobs.iter()
                .position(|j| j.status() == JobStatus::Ready)
                .map(|index| jobs.remove(index))
        };
        if let Some(job) = popped {
            tracing::debug!(job = %job.unique_id(), "job popped from pool");
            return Ok(job);
        }
        self.inner.connect_new(false).await
    }

    /// Create a query on a job picked by [`Pool::get_job`].
    pub fn query<T: DeserializeOwned>(
        &self,
        sql: impl Into<String>,
        options: QueryOptions,
    ) -> Result<Query<T>, PoolError> {
        Ok(self.get_job()?.query(sql, options))
    }

    /// Run a statement once on a job picked by [`Pool::get_job`].
    pub async fn execute<T: DeserializeOwned>(
        &self,
        sql: impl Into<String>,
        options: QueryOptions,
    ) -> Result<QueryResult<T>, PoolError> {
        let job = self.get_job()?;
        Ok(job.execute(sql, options).await?)
    }

    /// Run a statement built from literal parts with a `?` marker between
    /// each pair, binding `values` positionally.
    ///
    /// ```rust,ignore
    /// let rows = pool
    ///     .sql::<Value>(&["select * from t where id = ", " and kind = ", ""], vec![json!(7), json!("a")])
    ///     .await?;
    /// ```
    pub async fn sql<T: DeserializeOwned>(
        &self,
        parts: &[&str],
        values: Vec<Value>,
    ) -> Result<QueryResult<T>, PoolError> {
        let statement = parts.join("?");
        self.execute(statement, QueryOptions::new().parameters(values))
            .await
    }

    /// Close every job held by the pool. Popped jobs are not affected.
    pub async fn end(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(growth) = self.inner.growth.lock().take() {
            growth.abort();
        }

        let jobs = self.inner.snapshot();
        join_all(jobs.iter().map(|job| job.close())).await;
        tracing::info!(jobs = jobs.len(), "job pool ended");
    }

    /// Whether [`Pool::end`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Pool options.
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Job counts by status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            ready: 0,
            busy: 0,
            connecting: 0,
            total: 0,
            max: self.inner.options.max_size,
        };
        for job in self.inner.jobs.lock().iter() {
            status.total += 1;
            match job.status() {
                JobStatus::Ready => status.ready += 1,
                JobStatus::Busy => status.busy += 1,
                JobStatus::Connecting => status.connecting += 1,
                JobStatus::NotStarted | JobStatus::Ended => {}
            }
        }
        status
    }

    /// Counters since the pool was created.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            jobs_created: inner.jobs_created,
            jobs_failed: inner.jobs_failed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            growths_started: inner.growths_started,
            uptime: self.inner.created_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    options: PoolOptions,
}

impl PoolBuilder {
    /// A builder with default sizing.
    pub fn new(creds: DaemonServer) -> Self {
        Self {
            options: PoolOptions::new(creds),
        }
    }

    /// Set the job options.
    #[must_use]
    pub fn opts(mut self, opts: JdbcOptions) -> Self {
        self.options.opts = opts;
        self
    }

    /// Set the maximum number of live jobs.
    #[must_use]
    pub fn max_size(mut self, size: u32) -> Self {
        self.options.max_size = size;
        self
    }

    /// Set the number of jobs created by `init`.
    #[must_use]
    pub fn starting_size(mut self, size: u32) -> Self {
        self.options.starting_size = size;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout);
        self
    }

    /// Build the pool. Sizing is validated by [`Pool::init`].
    #[must_use]
    pub fn build(self) -> Pool {
        Pool::new(self.options)
    }
}

/// Job counts of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Jobs with no request in flight.
    pub ready: u32,
    /// Jobs with requests in flight.
    pub busy: u32,
    /// Jobs still connecting.
    pub connecting: u32,
    /// Jobs held, in any state.
    pub total: u32,
    /// Maximum live jobs.
    pub max: u32,
}

impl PoolStatus {
    /// Live jobs as a percentage of `max`.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        f64::from(self.ready + self.busy + self.connecting) / f64::from(self.max) * 100.0
    }

    /// Whether no more jobs may be added.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.ready + self.busy + self.connecting >= self.max
    }
}

/// Pool counters.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Jobs started, pooled or popped.
    pub jobs_created: u64,
    /// Jobs that failed to connect.
    pub jobs_failed: u64,
    /// Successful `get_job` selections.
    pub checkouts_successful: u64,
    /// `get_job` calls that found no job.
    pub checkouts_failed: u64,
    /// Background growths started.
    pub growths_started: u64,
    /// Time since the pool was created.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of `get_job` calls that returned a job (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool(max: u32, starting: u32) -> Pool {
        Pool::builder(DaemonServer::new("localhost", "QUSER", "secret"))
            .max_size(max)
            .starting_size(starting)
            .build()
    }

    #[tokio::test]
    async fn test_invalid_sizing_creates_nothing() {
        for (max, starting) in [(0, 1), (3, 0), (2, 3)] {
            let pool = pool(max, starting);
            let err = pool.init().await.unwrap_err();
            assert!(err.is_configuration());
            assert_eq!(pool.job_count(), 0);
        }
    }

    #[test]
    fn test_empty_pool_has_no_job() {
        let pool = pool(2, 1);
        assert!(pool.has_space());
        assert_eq!(pool.active_job_count(), 0);
        assert!(matches!(pool.get_job(), Err(PoolError::NoJobAvailable)));
        assert_eq!(pool.metrics().checkouts_failed, 1);
    }

    #[test]
    fn test_ended_pool_rejects_requests() {
        let pool = pool(2, 1);
        tokio_test::block_on(pool.end());
        assert!(pool.is_closed());
        assert!(matches!(pool.get_job(), Err(PoolError::Closed)));
        assert!(matches!(
            tokio_test::block_on(pool.pop_job()),
            Err(PoolError::Closed)
        ));
    }

    #[test]
    fn test_cleanup_removes_unstarted_jobs() {
        let pool = pool(2, 1);
        pool.inner
            .jobs
            .lock()
            .push(SqlJob::new(JdbcOptions::new()));
        assert_eq!(pool.job_count(), 1);

        pool.cleanup();
        assert_eq!(pool.job_count(), 0);
    }

    #[test]
    fn test_starting_a_job_leaves_dead_jobs_for_cleanup() {
        let pool = pool(1, 1);
        let dead = SqlJob::new(JdbcOptions::new());
        dead.dispose();
        pool.inner.jobs.lock().push(dead);

        let (job, connecting) = pool.inner.start_job(true);
        assert_eq!(job.status(), JobStatus::Connecting);
        assert_eq!(pool.job_count(), 2);
        assert!(!pool.has_space());

        drop(connecting);
        assert_eq!(job.status(), JobStatus::Ended);
        assert!(pool.has_space());
        assert_eq!(pool.job_count(), 2);

        pool.cleanup();
        assert_eq!(pool.job_count(), 0);
    }

    #[test]
    fn test_status_utilization() {
        let status = PoolStatus {
            ready: 1,
            busy: 2,
            connecting: 1,
            total: 4,
            max: 8,
        };
        assert!((status.utilization() - 50.0).abs() < f64::EPSILON);
        assert!(!status.is_at_capacity());
    }

    #[test]
    fn test_metrics_success_rate() {
        let metrics = PoolMetrics {
            jobs_created: 4,
            jobs_failed: 0,
            checkouts_successful: 9,
            checkouts_failed: 1,
            growths_started: 1,
            uptime: Duration::from_secs(1),
        };
        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
    }
}
