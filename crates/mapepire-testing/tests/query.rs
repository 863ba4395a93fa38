//! Query state machine and paging tests against the mock daemon.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use mapepire_client::{Error, JdbcOptions, QueryOptions, QueryState, SqlJob};
use mapepire_protocol::RequestBody;
use mapepire_testing::MockDaemon;
use serde::Deserialize;
use serde_json::{Value, json};

async fn setup(rows: usize) -> (MockDaemon, SqlJob) {
    let daemon = MockDaemon::builder().table("T", rows).start().await.unwrap();
    let job = SqlJob::new(JdbcOptions::new());
    job.connect(&daemon.server()).await.unwrap();
    (daemon, job)
}

// =============================================================================
// Paging
// =============================================================================

#[tokio::test]
async fn test_first_page_and_fetch_more_until_done() {
    let (_daemon, job) = setup(1234).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());

    let first = query.execute_rows(50).await.unwrap();
    assert_eq!(first.data.len(), 50);
    assert!(!first.is_done);
    assert_eq!(query.state(), QueryState::RunMoreDataAvailable);
    assert!(query.id().is_some());

    let mut total = first.data.len();
    loop {
        let page = query.fetch_more_rows(300).await.unwrap();
        assert!(!page.data.is_empty());
        total += page.data.len();
        if page.is_done {
            break;
        }
    }

    assert_eq!(total, 1234);
    assert_eq!(query.state(), QueryState::RunDone);
    assert_eq!(query.rows_to_fetch(), 300);
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(rename = "NAME")]
    name: String,
}

#[tokio::test]
async fn test_typed_rows() {
    let (_daemon, job) = setup(3).await;
    let query = job.query::<Row>("select * from t", QueryOptions::new());

    let result = query.execute().await.unwrap();

    assert!(result.is_done);
    assert_eq!(result.data.len(), 3);
    assert_eq!(result.data[2].id, 3);
    assert_eq!(result.data[2].name, "ROW3");
    let metadata = result.metadata.unwrap();
    assert_eq!(metadata.column_count, 2);
    assert_eq!(metadata.columns[0].type_name, "INTEGER");
}

#[tokio::test]
async fn test_terse_rows_are_arrays() {
    let (_daemon, job) = setup(2).await;
    let query = job.query::<Vec<Value>>("SELECT * FROM T", QueryOptions::new().terse(true));

    let result = query.execute().await.unwrap();

    assert_eq!(result.data[0], vec![json!(1), json!("ROW1")]);
}

#[tokio::test]
async fn test_fetch_more_reuses_last_page_size() {
    let (daemon, job) = setup(100).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());

    query.execute_rows(10).await.unwrap();
    let page = query.fetch_more().await.unwrap();

    assert_eq!(page.data.len(), 10);
    let more = daemon.requests_of("sqlmore");
    assert!(matches!(more[0].request.body, RequestBody::SqlMore { rows: 10, .. }));
}

// =============================================================================
// State machine
// =============================================================================

#[tokio::test]
async fn test_execute_twice_is_rejected_without_io() {
    let (daemon, job) = setup(500).await;

    let partial = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    partial.execute_rows(10).await.unwrap();
    let sent = daemon.requests().len();
    let err = partial.execute().await.unwrap_err();
    assert_eq!(err.to_string(), "Statement has already been run");
    assert_eq!(daemon.requests().len(), sent);

    let complete = job.query::<Value>("values 1", QueryOptions::new());
    complete.execute().await.unwrap();
    let sent = daemon.requests().len();
    let err = complete.execute().await.unwrap_err();
    assert_eq!(err.to_string(), "Statement has already been fully run");
    assert!(err.is_usage());
    assert_eq!(daemon.requests().len(), sent);
}

#[tokio::test]
async fn test_concurrent_pages_on_clones_send_once() {
    let daemon = MockDaemon::builder()
        .table("T", 500)
        .response_delay(Duration::from_millis(100))
        .start()
        .await
        .unwrap();
    let job = SqlJob::new(JdbcOptions::new());
    job.connect(&daemon.server()).await.unwrap();

    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    let other = query.clone();
    let (a, b) = tokio::join!(query.execute_rows(10), other.execute_rows(10));
    let (ok, err) = if a.is_ok() { (a, b) } else { (b, a) };
    assert_eq!(ok.unwrap().data.len(), 10);
    let err = err.unwrap_err();
    assert!(err.is_usage());
    assert_eq!(err.to_string(), "Statement is already running");
    assert_eq!(daemon.requests_of("sql").len(), 1);

    let (a, b) = tokio::join!(query.fetch_more(), other.fetch_more());
    assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
    assert_eq!(daemon.requests_of("sqlmore").len(), 1);

    // the mark clears once the page lands
    assert!(other.fetch_more().await.is_ok());
    assert_eq!(query.state(), QueryState::RunMoreDataAvailable);
}

#[tokio::test]
async fn test_fetch_more_after_done_is_rejected() {
    let (_daemon, job) = setup(5).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    query.execute().await.unwrap();

    let err = query.fetch_more().await.unwrap_err();
    assert_eq!(err.to_string(), "Statement has already been fully run");
}

#[tokio::test]
async fn test_non_positive_rows_are_rejected() {
    let (daemon, job) = setup(5).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    let sent = daemon.requests().len();

    assert!(matches!(query.execute_rows(0).await, Err(Error::Argument(_))));
    assert!(matches!(query.execute_rows(-1).await, Err(Error::Argument(_))));
    assert_eq!(daemon.requests().len(), sent);
}

#[tokio::test]
async fn test_failed_statement_is_terminal() {
    let (_daemon, job) = setup(0).await;
    let query = job.query::<Value>("select * from NONEXISTENT", QueryOptions::new());

    let err = query.execute().await.unwrap_err();
    assert!(err.is_server());
    assert_eq!(query.state(), QueryState::Error);

    assert!(query.execute().await.unwrap_err().is_usage());
    assert!(query.close().await.unwrap().is_none());
    assert_eq!(query.state(), QueryState::Error);
}

#[tokio::test]
async fn test_failed_cl_command_returns_result() {
    let (_daemon, job) = setup(0).await;
    let query = job.clcommand("CRTLIB NOTEXIST");
    assert!(query.is_cl_command());

    let result = query.execute().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.data[0]["MESSAGE_ID"], "CPF9801");
    assert_eq!(query.state(), QueryState::RunDone);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_releases_open_cursor() {
    let (daemon, job) = setup(500).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    query.execute_rows(10).await.unwrap();
    assert_eq!(daemon.open_cursors(), 1);

    let response = query.close().await.unwrap().unwrap();
    assert!(response.success);
    assert_eq!(query.state(), QueryState::RunDone);
    assert_eq!(daemon.open_cursors(), 0);

    let closes = daemon.requests_of("sqlclose");
    assert_eq!(closes.len(), 1);
    let RequestBody::SqlClose { cont_id } = &closes[0].request.body else {
        panic!("not a close request");
    };
    assert_eq!(Some(cont_id.clone()), query.id());
}

#[tokio::test]
async fn test_close_twice_is_harmless() {
    let (daemon, job) = setup(500).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    query.execute_rows(10).await.unwrap();

    assert!(query.close().await.is_ok());
    assert!(query.close().await.is_ok());

    assert_eq!(query.state(), QueryState::RunDone);
    assert_eq!(daemon.requests_of("sqlclose").len(), 1);
}

#[tokio::test]
async fn test_close_before_execute_sends_nothing() {
    let (daemon, job) = setup(5).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new());

    assert!(query.close().await.unwrap().is_none());
    assert_eq!(query.state(), QueryState::RunDone);
    assert!(daemon.requests_of("sqlclose").is_empty());
}

#[tokio::test]
async fn test_auto_close_on_last_page() {
    let (daemon, job) = setup(15).await;
    let query = job.query::<Value>("SELECT * FROM T", QueryOptions::new().auto_close(true));

    query.execute_rows(10).await.unwrap();
    assert!(daemon.requests_of("sqlclose").is_empty());

    let last = query.fetch_more().await.unwrap();
    assert!(last.is_done);
    assert_eq!(daemon.requests_of("sqlclose").len(), 1);

    assert!(query.close().await.unwrap().is_none());
    assert_eq!(daemon.requests_of("sqlclose").len(), 1);
}

// =============================================================================
// Parameters
// =============================================================================

#[tokio::test]
async fn test_parameters_are_sent_in_order() {
    let (daemon, job) = setup(0).await;
    let parameters = vec![json!("abc"), json!(42), json!(null)];
    let query = job.query::<Value>(
        "values (?, ?, ?)",
        QueryOptions::new().parameters(parameters.clone()),
    );
    assert!(query.is_prepared());

    let result = query.execute().await.unwrap();

    let prepared = daemon.requests_of("prepare_sql_execute");
    assert_eq!(prepared.len(), 1);
    let RequestBody::PrepareSqlExecute {
        parameters: sent, ..
    } = &prepared[0].request.body
    else {
        panic!("not a prepared request");
    };
    assert_eq!(sent, &parameters);
    assert_eq!(result.data[0]["00002"], 42);
    assert_eq!(result.parameter_count, Some(3));
}

#[tokio::test]
async fn test_unprepared_query_sends_sql() {
    let (daemon, job) = setup(0).await;
    let query = job.query::<Value>("values 1", QueryOptions::new());
    assert!(!query.is_prepared());

    query.execute().await.unwrap();

    assert_eq!(daemon.requests_of("sql").len(), 1);
    assert!(daemon.requests_of("prepare_sql_execute").is_empty());
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn test_registry_lookup_and_cleanup() {
    let (_daemon, job) = setup(500).await;
    let registry = job.registry().clone();

    let open = job.query::<Value>("SELECT * FROM T", QueryOptions::new());
    open.execute_rows(10).await.unwrap();
    let done = job.query::<Value>("values 1", QueryOptions::new());
    done.execute().await.unwrap();
    let failed = job.query::<Value>("select * from NONEXISTENT", QueryOptions::new());
    assert!(failed.execute().await.is_err());
    assert_eq!(registry.len(), 3);

    let open_id = open.id().unwrap();
    let found = registry.by_id(&open_id).unwrap();
    assert_eq!(found.sql(), "SELECT * FROM T");
    assert_eq!(registry.open_ids(Some(&job)), vec![open_id.clone()]);

    registry.cleanup().await.unwrap();

    // finished queries are pruned, failed ones kept
    assert_eq!(registry.len(), 2);
    assert!(registry.by_id(&open_id).is_some());
    assert!(registry.by_id(&done.id().unwrap()).is_none());
    assert_eq!(failed.state(), QueryState::Error);
}
