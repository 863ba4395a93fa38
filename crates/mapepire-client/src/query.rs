//! Statement execution.
//!
//! A [`Query`] walks through
//!
//! ```text
//! NotYetRun --execute--> RunMoreDataAvailable --fetch_more--> RunDone
//!     |                        |    ^      |
//!     |                        +----+      |
//!     +--------------execute---------------+
//! ```
//!
//! and into `Error` from any request that fails. `Error` is terminal.
//! A query gets its correlation id from the first successful response;
//! continuation and close requests refer to that id.

use std::marker::PhantomData;
use std::sync::Arc;

use mapepire_protocol::{QueryResult, Request, RequestBody, ServerResponse};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::instrumentation::{self, SanitizationConfig, span_names};
use crate::job::{SqlJob, new_unique_id};
use crate::state::QueryState;

/// Rows fetched per page unless the caller asks otherwise.
pub const DEFAULT_ROWS_TO_FETCH: i64 = 100;

/// Options of a [`Query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Omit per-row metadata from results.
    pub is_terse_results: Option<bool>,
    /// The text is a CL command, not SQL.
    pub is_cl_command: bool,
    /// Positional parameters. Supplying them makes the query prepared.
    pub parameters: Option<Vec<Value>>,
    /// Release the server statement as soon as the last page arrives.
    pub auto_close: bool,
}

impl QueryOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request terse results.
    #[must_use]
    pub fn terse(mut self, terse: bool) -> Self {
        self.is_terse_results = Some(terse);
        self
    }

    /// Mark the text as a CL command.
    #[must_use]
    pub fn cl_command(mut self, is_cl: bool) -> Self {
        self.is_cl_command = is_cl;
        self
    }

    /// Bind positional parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Close automatically once all rows are fetched.
    #[must_use]
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }
}

#[derive(Debug)]
struct Progress {
    state: QueryState,
    correlation_id: Option<String>,
    rows_to_fetch: i64,
    released: bool,
    in_flight: bool,
}

/// Clears the in-flight mark when a page request finishes or is dropped.
struct InFlight<'a>(&'a QueryInner);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.progress.lock().in_flight = false;
    }
}

fn already_running() -> Error {
    Error::usage("Statement is already running")
}

/// Type-erased query state shared with the registry.
pub(crate) struct QueryInner {
    job: SqlJob,
    sql: String,
    is_prepared: bool,
    is_cl: bool,
    terse: Option<bool>,
    auto_close: bool,
    parameters: Option<Vec<Value>>,
    progress: Mutex<Progress>,
}

impl QueryInner {
    pub(crate) fn state(&self) -> QueryState {
        self.progress.lock().state
    }

    pub(crate) fn correlation_id(&self) -> Option<String> {
        self.progress.lock().correlation_id.clone()
    }

    pub(crate) fn job(&self) -> &SqlJob {
        &self.job
    }

    /// Apply a page to the state machine.
    fn record_page<T>(&self, result: &QueryResult<T>, raise_on_failure: bool) -> Result<()> {
        let mut progress = self.progress.lock();
        progress.state = if result.is_done {
            QueryState::RunDone
        } else {
            QueryState::RunMoreDataAvailable
        };

        if !result.success && raise_on_failure {
            progress.state = QueryState::Error;
            return Err(Error::from_reply(result));
        }
        Ok(())
    }

    /// Close the statement; see [`Query::close`].
    pub(crate) async fn close(&self) -> Result<Option<ServerResponse>> {
        let cont_id = {
            let mut progress = self.progress.lock();
            if progress.state != QueryState::Error {
                let was_done = progress.state == QueryState::RunDone;
                progress.state = QueryState::RunDone;
                if was_done {
                    None
                } else {
                    progress.correlation_id.clone()
                }
            } else if progress.released {
                None
            } else {
                progress.correlation_id.clone()
            }
        };

        let Some(cont_id) = cont_id else {
            return Ok(None);
        };
        // the server dropped the statement along with the job
        if !self.job.status().is_usable() {
            return Ok(None);
        }
        self.progress.lock().released = true;
        self.release(cont_id).await.map(Some)
    }

    async fn release(&self, cont_id: String) -> Result<ServerResponse> {
        let span = instrumentation::statement_span(
            span_names::CLOSE,
            self.job.unique_id(),
            &self.sql,
            &SanitizationConfig::default(),
        );
        let request = Request::new(new_unique_id("sqlclose"), RequestBody::SqlClose { cont_id });
        self.job.send(request).instrument(span).await
    }

    async fn auto_close_if_done(&self, is_done: bool) -> Result<()> {
        if !self.auto_close || !is_done {
            return Ok(());
        }
        let cont_id = {
            let mut progress = self.progress.lock();
            if progress.released {
                return Ok(());
            }
            progress.released = true;
            progress.correlation_id.clone()
        };
        if let Some(cont_id) = cont_id {
            let response = self.release(cont_id).await?;
            if !response.success {
                tracing::debug!(id = %response.id, "auto-close not acknowledged");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("job", &self.job.unique_id())
            .field("sql", &self.sql)
            .field("is_prepared", &self.is_prepared)
            .field("is_cl", &self.is_cl)
            .field("progress", &*self.progress.lock())
            .finish()
    }
}

/// One statement or CL command bound to a job.
///
/// `T` is the row type results are decoded into.
pub struct Query<T = Value> {
    inner: Arc<QueryInner>,
    _rows: PhantomData<fn() -> T>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _rows: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T> Query<T> {
    pub(crate) fn new(job: SqlJob, sql: String, options: QueryOptions) -> Self {
        let inner = Arc::new(QueryInner {
            is_prepared: options.parameters.is_some(),
            is_cl: options.is_cl_command,
            terse: options.is_terse_results,
            auto_close: options.auto_close,
            parameters: options.parameters,
            progress: Mutex::new(Progress {
                state: QueryState::NotYetRun,
                correlation_id: None,
                rows_to_fetch: DEFAULT_ROWS_TO_FETCH,
                released: false,
                in_flight: false,
            }),
            sql,
            job,
        });
        inner.job.registry().register(&inner);
        Self::from_inner(inner)
    }

    pub(crate) fn from_inner(inner: Arc<QueryInner>) -> Self {
        Self {
            inner,
            _rows: PhantomData,
        }
    }

    /// Correlation id, once the query has run.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.inner.correlation_id()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.inner.state()
    }

    /// Statement or command text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Whether parameters were supplied.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.inner.is_prepared
    }

    /// Whether this is a CL command.
    #[must_use]
    pub fn is_cl_command(&self) -> bool {
        self.inner.is_cl
    }

    /// Rows requested by the last page.
    #[must_use]
    pub fn rows_to_fetch(&self) -> i64 {
        self.inner.progress.lock().rows_to_fetch
    }

    /// Owning job.
    #[must_use]
    pub fn job(&self) -> &SqlJob {
        &self.inner.job
    }

    /// Close the statement.
    ///
    /// The state becomes `RunDone` immediately. If the server holds the
    /// statement open, a close request is sent and its response returned;
    /// otherwise nothing is sent. A failed query stays `Error` but its
    /// statement is still released. Calling this repeatedly is harmless.
    pub async fn close(&self) -> Result<Option<ServerResponse>> {
        self.inner.close().await
    }
}

fn check_rows(rows: i64) -> Result<()> {
    if rows <= 0 {
        return Err(Error::Argument("Rows to fetch must be greater than 0.".into()));
    }
    Ok(())
}

impl<T: DeserializeOwned> Query<T> {
    /// Run with the last-used page size (initially 100).
    pub async fn execute(&self) -> Result<QueryResult<T>> {
        let rows = self.rows_to_fetch();
        self.execute_rows(rows).await
    }

    /// Run, returning at most `rows` rows in the first page.
    ///
    /// A failed CL command is returned as a result with `success == false`;
    /// any other failure is an error and moves the query to `Error`.
    pub async fn execute_rows(&self, rows: i64) -> Result<QueryResult<T>> {
        check_rows(rows)?;
        let _running = {
            let mut progress = self.inner.progress.lock();
            if progress.in_flight {
                return Err(already_running());
            }
            match progress.state {
                QueryState::NotYetRun => {}
                QueryState::RunMoreDataAvailable => {
                    return Err(Error::usage("Statement has already been run"));
                }
                QueryState::RunDone => {
                    return Err(Error::usage("Statement has already been fully run"));
                }
                QueryState::Error => {
                    return Err(Error::usage("Statement failed and cannot be run again"));
                }
            }
            progress.rows_to_fetch = rows;
            progress.in_flight = true;
            InFlight(&self.inner)
        };

        let inner = &self.inner;
        let (prefix, body, span_name) = if inner.is_cl {
            (
                "clcommand",
                RequestBody::Cl {
                    cmd: inner.sql.clone(),
                    terse: inner.terse,
                },
                span_names::CL_COMMAND,
            )
        } else if let Some(parameters) = inner.parameters.clone() {
            (
                "query",
                RequestBody::PrepareSqlExecute {
                    sql: inner.sql.clone(),
                    rows,
                    terse: inner.terse,
                    parameters,
                },
                span_names::QUERY,
            )
        } else {
            (
                "query",
                RequestBody::Sql {
                    sql: inner.sql.clone(),
                    rows,
                    terse: inner.terse,
                    parameters: None,
                },
                span_names::QUERY,
            )
        };

        let span = instrumentation::statement_span(
            span_name,
            inner.job.unique_id(),
            &inner.sql,
            &SanitizationConfig::default(),
        );
        let request = Request::new(new_unique_id(prefix), body);
        let result: QueryResult<T> = inner.job.send(request).instrument(span.clone()).await?;
        instrumentation::record_result(&span, &result.id, result.update_count);

        inner.record_page(&result, !inner.is_cl)?;
        inner.progress.lock().correlation_id = Some(result.id.clone());
        inner.job.registry().correlate(&result.id, inner);

        inner.auto_close_if_done(result.is_done).await?;
        Ok(result)
    }

    /// Fetch the next page with the last-used page size.
    pub async fn fetch_more(&self) -> Result<QueryResult<T>> {
        let rows = self.rows_to_fetch();
        self.fetch_more_rows(rows).await
    }

    /// Fetch the next page of at most `rows` rows.
    pub async fn fetch_more_rows(&self, rows: i64) -> Result<QueryResult<T>> {
        check_rows(rows)?;
        let (cont_id, _running) = {
            let mut progress = self.inner.progress.lock();
            if progress.in_flight {
                return Err(already_running());
            }
            match progress.state {
                QueryState::NotYetRun => {
                    return Err(Error::usage("Statement has not yet been run"));
                }
                QueryState::RunDone => {
                    return Err(Error::usage("Statement has already been fully run"));
                }
                QueryState::Error => {
                    return Err(Error::usage("Statement failed and cannot be continued"));
                }
                QueryState::RunMoreDataAvailable => {}
            }
            let cont_id = progress
                .correlation_id
                .clone()
                .ok_or_else(|| Error::usage("Statement has not yet been run"))?;
            progress.rows_to_fetch = rows;
            progress.in_flight = true;
            (cont_id, InFlight(&self.inner))
        };

        let inner = &self.inner;
        let span = instrumentation::statement_span(
            span_names::FETCH_MORE,
            inner.job.unique_id(),
            &inner.sql,
            &SanitizationConfig::default(),
        );
        let request = Request::new(
            new_unique_id("fetchMore"),
            RequestBody::SqlMore {
                cont_id,
                sql: inner.sql.clone(),
                rows,
            },
        );
        let result: QueryResult<T> = inner.job.send(request).instrument(span.clone()).await?;
        instrumentation::record_result(&span, &result.id, result.update_count);

        inner.record_page(&result, true)?;
        inner.auto_close_if_done(result.is_done).await?;
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::JdbcOptions;
    use serde_json::json;

    fn job() -> SqlJob {
        SqlJob::new(JdbcOptions::new())
    }

    #[test]
    fn test_prepared_iff_parameters() {
        let job = job();
        let plain = job.query::<Value>("values 1", QueryOptions::new());
        let prepared = job.query::<Value>(
            "values ?",
            QueryOptions::new().parameters(vec![json!(1)]),
        );
        let empty = job.query::<Value>("values 1", QueryOptions::new().parameters(vec![]));

        assert!(!plain.is_prepared());
        assert!(prepared.is_prepared());
        assert!(empty.is_prepared());
    }

    #[tokio::test]
    async fn test_non_positive_rows_rejected_before_io() {
        let query = job().query::<Value>("values 1", QueryOptions::new());

        for rows in [0, -5] {
            let err = query.execute_rows(rows).await.unwrap_err();
            assert!(matches!(err, Error::Argument(_)));
            assert_eq!(err.to_string(), "Rows to fetch must be greater than 0.");
        }
        assert_eq!(query.state(), QueryState::NotYetRun);
    }

    #[tokio::test]
    async fn test_fetch_more_before_execute() {
        let query = job().query::<Value>("values 1", QueryOptions::new());
        let err = query.fetch_more().await.unwrap_err();
        assert!(err.is_usage());
        assert_eq!(err.to_string(), "Statement has not yet been run");
    }

    #[tokio::test]
    async fn test_close_without_run_is_local() {
        let query = job().query::<Value>("values 1", QueryOptions::new());

        assert!(query.close().await.unwrap().is_none());
        assert_eq!(query.state(), QueryState::RunDone);
        assert!(query.close().await.unwrap().is_none());
        assert_eq!(query.state(), QueryState::RunDone);
    }

    #[tokio::test]
    async fn test_execute_after_close_is_usage_error() {
        let query = job().query::<Value>("values 1", QueryOptions::new());
        query.close().await.unwrap();

        let err = query.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "Statement has already been fully run");
    }

    #[tokio::test]
    async fn test_execute_on_disconnected_job() {
        let query = job().query::<Value>("values 1", QueryOptions::new());
        assert!(matches!(query.execute().await, Err(Error::NotConnected)));
        assert_eq!(query.state(), QueryState::NotYetRun);
    }

    #[test]
    fn test_failed_page_moves_to_error() {
        let query = job().query::<Value>("select * from nope", QueryOptions::new());
        let result: QueryResult = serde_json::from_value(json!({
            "id": "query1",
            "success": false,
            "is_done": true,
            "error": "not found",
            "sql_state": "42704",
            "sql_rc": -204
        }))
        .unwrap();

        let err = query.inner.record_page(&result, true).unwrap_err();
        assert_eq!(err.to_string(), "not found, 42704, -204");
        assert_eq!(query.state(), QueryState::Error);
    }

    #[test]
    fn test_failed_cl_page_is_not_raised() {
        let query = job().clcommand("CRTLIB NOTEXIST");
        let result: QueryResult = serde_json::from_value(json!({
            "id": "clcommand1",
            "success": false,
            "is_done": true
        }))
        .unwrap();

        assert!(query.inner.record_page(&result, false).is_ok());
        assert_eq!(query.state(), QueryState::RunDone);
    }
}
