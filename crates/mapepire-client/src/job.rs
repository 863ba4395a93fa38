//! Server jobs.
//!
//! A [`SqlJob`] owns one [`SecureChannel`] and the multiplexer that routes
//! responses on it. Every request goes through [`SqlJob::send`]: a slot is
//! registered under the request's id, the frame is written, and the caller
//! waits for the response with the same id. Any number of requests may be
//! in flight on one job; responses are matched by id only.
//!
//! ## Status
//!
//! | stored | in flight | channel open | reported |
//! |---|---|---|---|
//! | `Ready` | > 0 | yes | `Busy` |
//! | `Ready` | 0 | - | `Ready` |
//! | `Connecting` | any | any | `Connecting` |
//! | `Ended` | any | any | `Ended` |
//!
//! `Busy` is computed on every read and never stored.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mapepire_channel::{ChannelEvent, Endpoint, SecureChannel};
use mapepire_protocol::{
    ConnectionResult, ExplainResults, GetTraceDataResult, QueryResult, Request, RequestBody,
    ServerTraceDest, ServerTraceLevel, SetConfigResult, VersionCheckResult, decode_response,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{DaemonServer, JdbcOptions};
use crate::error::{Error, Result};
use crate::instrumentation;
use crate::multiplexer::Multiplexer;
use crate::query::{Query, QueryOptions};
use crate::registry::QueryRegistry;
use crate::state::JobStatus;
use crate::transaction::TransactionEndType;

/// Application name sent in the `connect` request.
pub const APPLICATION_NAME: &str = concat!("mapepire-rs ", env!("CARGO_PKG_VERSION"));

const PENDING_TRANSACTIONS_SQL: &str = "select count(*) as thecount \
     from qsys2.db_transaction_info \
     where JOB_NAME = qsys2.job_name and \
     (local_record_changes_pending = 'YES' or local_object_changes_pending = 'YES')";

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next process-unique id with the given prefix, e.g. `query17`.
///
/// Ids are unique within this process only.
#[must_use]
pub fn new_unique_id(prefix: &str) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{prefix}{n}")
}

/// Whether `explain` also runs the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainType {
    /// Run the statement and explain the actual execution.
    Run,
    /// Only build the access plan.
    #[default]
    DoNotRun,
}

struct JobState {
    status: JobStatus,
    channel: Option<Arc<SecureChannel>>,
    generation: u64,
    connect_attempt: u64,
    job_name: Option<String>,
    trace_file: Option<String>,
}

struct JobInner {
    unique_id: String,
    options: JdbcOptions,
    registry: QueryRegistry,
    mux: Arc<Multiplexer>,
    trace_frames: Arc<AtomicBool>,
    state: Mutex<JobState>,
}

impl JobInner {
    fn dispose(&self) {
        let channel = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.status = JobStatus::Ended;
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.close();
            tracing::info!(job = %self.unique_id, "job disposed");
        }
        self.mux.abandon_all();
    }

    fn dispose_if_current(&self, generation: u64) {
        if self.state.lock().generation == generation {
            self.dispose();
        } else {
            tracing::trace!(job = %self.unique_id, generation, "ignoring event from superseded channel");
        }
    }
}

/// Ends the job if its connect future is dropped unfinished.
struct ConnectGuard {
    job: SqlJob,
    attempt: u64,
    finished: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let abandoned = {
            let state = self.job.inner.state.lock();
            state.connect_attempt == self.attempt && state.status == JobStatus::Connecting
        };
        if abandoned {
            tracing::debug!(job = %self.job.inner.unique_id, "connect cancelled");
            self.job.inner.dispose();
        }
    }
}

/// A job on the daemon: one authenticated connection that runs statements.
///
/// Cloning is cheap and yields another handle to the same job. The
/// connection ends on [`SqlJob::close`] or [`SqlJob::dispose`], or when the
/// daemon drops it; it is never re-established automatically.
#[derive(Clone)]
pub struct SqlJob {
    inner: Arc<JobInner>,
}

/// Builder for [`SqlJob`].
#[derive(Debug, Default)]
pub struct JobBuilder {
    options: JdbcOptions,
    registry: Option<QueryRegistry>,
    request_timeout: Option<Duration>,
}

impl JobBuilder {
    /// Job options sent on connect.
    #[must_use]
    pub fn options(mut self, options: JdbcOptions) -> Self {
        self.options = options;
        self
    }

    /// Registry the job's queries are recorded in.
    #[must_use]
    pub fn registry(mut self, registry: QueryRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fail requests whose response takes longer than `timeout`.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Create the job. Nothing is sent until [`SqlJob::connect`].
    #[must_use]
    pub fn build(self) -> SqlJob {
        SqlJob {
            inner: Arc::new(JobInner {
                unique_id: new_unique_id("sqljob"),
                options: self.options,
                registry: self.registry.unwrap_or_default(),
                mux: Arc::new(Multiplexer::new(self.request_timeout)),
                trace_frames: Arc::new(AtomicBool::new(false)),
                state: Mutex::new(JobState {
                    status: JobStatus::NotStarted,
                    channel: None,
                    generation: 0,
                    connect_attempt: 0,
                    job_name: None,
                    trace_file: None,
                }),
            }),
        }
    }
}

impl SqlJob {
    /// Create a job with the given options and a private query registry.
    #[must_use]
    pub fn new(options: JdbcOptions) -> Self {
        Self::builder().options(options).build()
    }

    /// Start building a job.
    #[must_use]
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Client-side id, e.g. `sqljob3`.
    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.inner.unique_id
    }

    /// Server-assigned job name, once connected.
    #[must_use]
    pub fn job_name(&self) -> Option<String> {
        self.inner.state.lock().job_name.clone()
    }

    /// Options sent on connect.
    #[must_use]
    pub fn options(&self) -> &JdbcOptions {
        &self.inner.options
    }

    /// Registry this job's queries are recorded in.
    #[must_use]
    pub fn registry(&self) -> &QueryRegistry {
        &self.inner.registry
    }

    /// Server trace file, when tracing to a file is configured.
    #[must_use]
    pub fn trace_file_path(&self) -> Option<String> {
        self.inner.state.lock().trace_file.clone()
    }

    /// Whether raw channel frames are being logged.
    #[must_use]
    pub fn is_tracing_channel_data(&self) -> bool {
        self.inner.trace_frames.load(Ordering::Relaxed)
    }

    /// Whether the job runs under commitment control.
    #[must_use]
    pub fn under_commit_control(&self) -> bool {
        self.inner.options.under_commit_control()
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.mux.running_count()
    }

    /// Current status; see the module docs.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        let state = self.inner.state.lock();
        let open = state.channel.as_ref().is_some_and(|c| c.is_open());
        match state.status {
            JobStatus::Connecting | JobStatus::Ended => state.status,
            _ if open && self.inner.mux.running_count() > 0 => JobStatus::Busy,
            stored => stored,
        }
    }

    /// Whether both handles refer to the same job.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connect to `server`.
    ///
    /// The status becomes `Connecting` before this returns, so a pool can
    /// count the job before the returned future is polled. Calling this on a
    /// connected job opens a new channel, closes the old one and yields a
    /// new server job.
    ///
    /// Dropping the returned future before it completes ends the job, so a
    /// cancelled connect never leaves it `Connecting`.
    pub fn connect(
        &self,
        server: &DaemonServer,
    ) -> impl Future<Output = Result<ConnectionResult>> + Send + use<> {
        let attempt = {
            let mut state = self.inner.state.lock();
            state.status = JobStatus::Connecting;
            state.connect_attempt += 1;
            state.connect_attempt
        };
        let job = self.clone();
        let mut guard = ConnectGuard {
            job: self.clone(),
            attempt,
            finished: false,
        };
        let endpoint = server.endpoint();
        let span = instrumentation::connect_span(job.unique_id(), &endpoint.host, endpoint.port);
        async move {
            let result = job.open_and_connect(endpoint).await;
            guard.finished = true;
            result
        }
        .instrument(span)
    }

    async fn open_and_connect(&self, endpoint: Endpoint) -> Result<ConnectionResult> {
        self.inner.trace_frames.store(false, Ordering::Relaxed);

        let (channel, events) =
            match SecureChannel::open(&endpoint, self.inner.trace_frames.clone()).await {
                Ok(opened) => opened,
                Err(source) => {
                    tracing::warn!(error = %source, "failed to open channel");
                    self.dispose();
                    return Err(Error::Connection {
                        host: endpoint.host,
                        port: endpoint.port,
                        source,
                    });
                }
            };

        let channel = Arc::new(channel);
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(old) = state.channel.replace(channel) {
                tracing::debug!(job = %self.inner.unique_id, "replacing previous channel");
                old.close();
            }
            state.generation
        };
        self.inner.mux.abandon_all();
        tokio::spawn(pump_events(Arc::downgrade(&self.inner), events, generation));

        let request = Request::new(
            new_unique_id("connect"),
            RequestBody::Connect {
                technique: "tcp".to_string(),
                application: APPLICATION_NAME.to_string(),
                props: self.inner.options.to_props(),
            },
        );

        let result: ConnectionResult = match self.send(request).await {
            Ok(result) => result,
            Err(e) => {
                self.dispose();
                return Err(e);
            }
        };

        if !result.success {
            self.dispose();
            self.inner.state.lock().status = JobStatus::NotStarted;
            return Err(Error::ConnectRefused(
                result.error.unwrap_or_else(|| "Failed to connect to server.".to_string()),
            ));
        }

        {
            let mut state = self.inner.state.lock();
            state.status = JobStatus::Ready;
            state.job_name = Some(result.job.clone());
        }
        tracing::info!(job = %self.inner.unique_id, job_name = %result.job, "connected");
        Ok(result)
    }

    /// Send a request and decode the correlated response.
    pub async fn send<R: DeserializeOwned>(&self, request: Request) -> Result<R> {
        let value = self.send_raw(request).await?;
        Ok(decode_response(value)?)
    }

    async fn send_raw(&self, request: Request) -> Result<Value> {
        let channel = self
            .inner
            .state
            .lock()
            .channel
            .clone()
            .ok_or(Error::NotConnected)?;

        let text = request.to_json()?;
        let waiter = self.inner.mux.register(&request.id);
        tracing::debug!(
            job = %self.inner.unique_id,
            id = %request.id,
            kind = request.body.kind(),
            "sending request"
        );

        channel.send(text).await?;
        waiter.wait().await
    }

    /// Create a query bound to this job. Nothing is sent yet.
    #[must_use]
    pub fn query<T: DeserializeOwned>(&self, sql: impl Into<String>, options: QueryOptions) -> Query<T> {
        Query::new(self.clone(), sql.into(), options)
    }

    /// Create a CL command bound to this job. Nothing is sent yet.
    #[must_use]
    pub fn clcommand(&self, cmd: impl Into<String>) -> Query<Value> {
        Query::new(self.clone(), cmd.into(), QueryOptions::new().cl_command(true))
    }

    /// Run a statement once and close it.
    ///
    /// Unlike [`Query::execute`], a result carrying an `error` (including a
    /// failed CL command) is returned as an error.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        sql: impl Into<String>,
        options: QueryOptions,
    ) -> Result<QueryResult<T>> {
        let query = self.query::<T>(sql, options);
        let result = query.execute().await?;
        query.close().await?;

        if result.error.is_some() {
            return Err(Error::from_reply(&result));
        }
        Ok(result)
    }

    /// Daemon version.
    pub async fn get_version(&self) -> Result<VersionCheckResult> {
        let request = Request::new(new_unique_id("getversion"), RequestBody::GetVersion);
        let result: VersionCheckResult = self.send(request).await?;
        if !result.success {
            return Err(Error::from_reply_or(&result, "Failed to get version"));
        }
        Ok(result)
    }

    /// Visual Explain of `sql`.
    pub async fn explain<T: DeserializeOwned>(
        &self,
        sql: impl Into<String>,
        kind: ExplainType,
    ) -> Result<ExplainResults<T>> {
        let request = Request::new(
            new_unique_id("explain"),
            RequestBody::Dove {
                sql: sql.into(),
                run: kind == ExplainType::Run,
            },
        );
        let result: ExplainResults<T> = self.send(request).await?;
        if !result.success {
            return Err(Error::from_reply_or(&result, "Failed to explain."));
        }
        Ok(result)
    }

    /// Contents of the server-side trace buffer.
    pub async fn get_trace_data(&self) -> Result<GetTraceDataResult> {
        let request = Request::new(new_unique_id("gettracedata"), RequestBody::GetTraceData);
        let result: GetTraceDataResult = self.send(request).await?;
        if !result.success {
            return Err(Error::from_reply_or(
                &result,
                "Failed to get trace data from backend",
            ));
        }
        Ok(result)
    }

    /// Configure server-side tracing.
    ///
    /// Also turns on logging of every raw channel frame for this job.
    pub async fn set_trace_config(
        &self,
        dest: ServerTraceDest,
        level: ServerTraceLevel,
    ) -> Result<SetConfigResult> {
        self.inner.trace_frames.store(true, Ordering::Relaxed);

        let request = Request::new(
            new_unique_id("setconfig"),
            RequestBody::SetConfig {
                tracedest: Some(dest),
                tracelevel: Some(level),
            },
        );
        let result: SetConfigResult = self.send(request).await?;
        if !result.success {
            return Err(Error::from_reply_or(
                &result,
                "Failed to set trace options on backend",
            ));
        }

        self.inner.state.lock().trace_file = result
            .tracedest
            .starts_with('/')
            .then(|| result.tracedest.clone());
        Ok(result)
    }

    /// Number of pending changes in the job's current transaction.
    pub async fn get_pending_transactions(&self) -> Result<i64> {
        let query = self.query::<Value>(PENDING_TRANSACTIONS_SQL, QueryOptions::new());
        let result = query.execute_rows(1).await?;
        query.close().await?;

        if result.success && result.data.len() == 1 {
            if let Some(count) = result.data[0].get("THECOUNT").and_then(Value::as_i64) {
                return Ok(count);
            }
        }
        Ok(0)
    }

    /// Commit or roll back the current transaction.
    pub async fn end_transaction(&self, kind: TransactionEndType) -> Result<QueryResult<Value>> {
        self.execute(kind.as_sql(), QueryOptions::new()).await
    }

    /// End the server job: send `exit`, then dispose.
    ///
    /// The `exit` request is not answered; pending requests fail with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        let channel = self.inner.state.lock().channel.clone();
        if let Some(channel) = channel {
            let request = Request::new(new_unique_id("exit"), RequestBody::Exit);
            match request.to_json() {
                Ok(text) => {
                    if let Err(e) = channel.send(text).await {
                        tracing::debug!(job = %self.inner.unique_id, error = %e, "exit not delivered");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode exit request"),
            }
        }
        self.dispose();
    }

    /// Close the channel and mark the job `Ended`. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for SqlJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlJob")
            .field("unique_id", &self.inner.unique_id)
            .field("status", &self.status())
            .field("job_name", &self.job_name())
            .finish_non_exhaustive()
    }
}

async fn pump_events(
    job: Weak<JobInner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = job.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Message(message) => {
                inner.mux.resolve(message);
            }
            ChannelEvent::Error(e) => {
                tracing::warn!(job = %inner.unique_id, error = %e, "channel error");
                inner.dispose_if_current(generation);
            }
            ChannelEvent::Closed => {
                tracing::info!(job = %inner.unique_id, "channel closed by peer");
                inner.dispose_if_current(generation);
                break;
            }
        }
    }
}
