//! Job lifecycle tests against the mock daemon.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use mapepire_client::{
    DaemonServer, Error, ExplainType, IsolationLevel, JdbcOptions, JobStatus, QueryOptions,
    ServerTraceDest, ServerTraceLevel, SqlJob, TransactionEndType,
};
use mapepire_protocol::RequestBody;
use mapepire_testing::{MOCK_TRACE_FILE, MOCK_VERSION, MockDaemon, init_tracing};
use serde_json::Value;
use tokio_test::assert_ok;

async fn connected(daemon: &MockDaemon) -> SqlJob {
    let job = SqlJob::new(JdbcOptions::new());
    assert_ok!(job.connect(&daemon.server()).await);
    job
}

async fn wait_for_status(job: &SqlJob, status: JobStatus) {
    for _ in 0..100 {
        if job.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached {status}, still {}", job.status());
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_sets_ready_and_job_name() {
    init_tracing();
    let daemon = MockDaemon::start().await.unwrap();
    let job = SqlJob::new(JdbcOptions::new());
    assert_eq!(job.status(), JobStatus::NotStarted);

    let result = job.connect(&daemon.server()).await.unwrap();

    assert!(result.success);
    assert_eq!(job.status(), JobStatus::Ready);
    assert_eq!(job.job_name().as_deref(), Some(result.job.as_str()));
    assert_eq!(daemon.session_count(), 1);
}

#[tokio::test]
async fn test_connect_sends_options_as_props() {
    let daemon = MockDaemon::start().await.unwrap();
    let options = JdbcOptions::new()
        .libraries(["QIWS", "QGPL"])
        .transaction_isolation(IsolationLevel::ReadCommitted);
    let job = SqlJob::new(options);
    job.connect(&daemon.server()).await.unwrap();

    let connects = daemon.requests_of("connect");
    assert_eq!(connects.len(), 1);
    let RequestBody::Connect {
        technique, props, ..
    } = &connects[0].request.body
    else {
        panic!("not a connect request");
    };
    assert_eq!(technique, "tcp");
    let props = props.as_deref().unwrap();
    assert!(props.contains("libraries=QIWS,QGPL"));
    assert!(props.contains("transaction isolation=read committed"));
    assert!(job.under_commit_control());
}

#[tokio::test]
async fn test_reconnect_yields_new_server_job() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = SqlJob::new(JdbcOptions::new());

    let first = job.connect(&daemon.server()).await.unwrap();
    let second = job.connect(&daemon.server()).await.unwrap();

    assert_ne!(first.job, second.job);
    assert_eq!(job.status(), JobStatus::Ready);
    assert_eq!(daemon.session_count(), 2);

    // the replaced channel must not tear down the new one
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(job.status(), JobStatus::Ready);
    assert!(job.get_version().await.is_ok());
}

#[tokio::test]
async fn test_refused_connect_leaves_job_not_started() {
    let daemon = MockDaemon::builder()
        .refuse_connect(true)
        .start()
        .await
        .unwrap();
    let job = SqlJob::new(JdbcOptions::new());

    let err = job.connect(&daemon.server()).await.unwrap_err();

    assert!(matches!(&err, Error::ConnectRefused(msg) if msg.contains("refused")));
    assert_eq!(job.status(), JobStatus::NotStarted);
}

#[tokio::test]
async fn test_unreachable_daemon_ends_job() {
    let server = DaemonServer::new("127.0.0.1", "QUSER", "secret")
        .port(1)
        .reject_unauthorized(false)
        .connect_timeout(Duration::from_secs(2));
    let job = SqlJob::new(JdbcOptions::new());

    let err = job.connect(&server).await.unwrap_err();

    assert!(matches!(err, Error::Connection { port: 1, .. }));
    assert!(err.is_transient());
    assert_eq!(job.status(), JobStatus::Ended);
}

// =============================================================================
// Multiplexing
// =============================================================================

#[tokio::test]
async fn test_busy_while_requests_in_flight() {
    let daemon = MockDaemon::builder()
        .response_delay(Duration::from_millis(150))
        .start()
        .await
        .unwrap();
    let job = connected(&daemon).await;

    let pending = {
        let job = job.clone();
        tokio::spawn(async move { job.get_version().await })
    };
    wait_for_status(&job, JobStatus::Busy).await;
    assert_eq!(job.running_count(), 1);

    let version = pending.await.unwrap().unwrap();
    assert_eq!(version.version, MOCK_VERSION);
    assert_eq!(job.status(), JobStatus::Ready);
    assert_eq!(job.running_count(), 0);
}

#[tokio::test]
async fn test_responses_resolve_out_of_order() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let slow = job.execute::<Value>("CALL DELAY(200)", QueryOptions::new());
    let fast = job.execute::<Value>("values 7", QueryOptions::new());

    let (slow, fast) = tokio::join!(
        async {
            let r = slow.await;
            (r, std::time::Instant::now())
        },
        async {
            let r = fast.await;
            (r, std::time::Instant::now())
        }
    );

    assert!(slow.0.is_ok());
    assert_eq!(fast.0.unwrap().data[0]["00001"], 7);
    assert!(fast.1 < slow.1);
}

#[tokio::test]
async fn test_dispose_fails_pending_requests() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let pending = {
        let job = job.clone();
        tokio::spawn(async move { job.execute::<Value>("select HANG", QueryOptions::new()).await })
    };
    wait_for_status(&job, JobStatus::Busy).await;

    job.dispose();
    job.dispose();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(_)));
    assert_eq!(job.status(), JobStatus::Ended);
}

#[tokio::test]
async fn test_request_timeout() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = SqlJob::builder()
        .request_timeout(Duration::from_millis(100))
        .build();
    job.connect(&daemon.server()).await.unwrap();

    let err = job
        .execute::<Value>("select HANG", QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(job.running_count(), 0);
    assert_eq!(job.status(), JobStatus::Ready);
}

#[tokio::test]
async fn test_peer_close_ends_job() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    daemon.close_all_sessions();

    wait_for_status(&job, JobStatus::Ended).await;
    assert!(matches!(job.get_version().await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_close_sends_exit() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    job.close().await;

    assert_eq!(job.status(), JobStatus::Ended);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(daemon.requests_of("exit").len(), 1);
}

// =============================================================================
// Job operations
// =============================================================================

#[tokio::test]
async fn test_execute_raises_server_error() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let err = job
        .execute::<Value>("select * from NONEXISTENT", QueryOptions::new())
        .await
        .unwrap_err();

    assert!(err.is_server());
    assert_eq!(err.sql_state(), Some("42704"));
    let message = err.to_string();
    assert!(message.contains("SQL0204"));
    assert!(message.ends_with(", 42704, -204"));
}

#[tokio::test]
async fn test_execute_without_details_uses_generic_message() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let err = job
        .execute::<Value>("SILENTFAIL", QueryOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Failed to run query (unknown error)");
}

#[tokio::test]
async fn test_failed_cl_command_via_execute_is_error() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let err = job
        .execute::<Value>("CRTLIB NOTEXIST", QueryOptions::new().cl_command(true))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("CPF9801"));
}

#[tokio::test]
async fn test_explain() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;

    let result = job
        .explain::<Value>("select * from qiws.qcustcdt", ExplainType::Run)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.vedata["run"], true);
    assert!(result.vemetadata.is_some());

    let err = job
        .explain::<Value>("select * from NONEXISTENT", ExplainType::DoNotRun)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("SQL0204"));
}

#[tokio::test]
async fn test_trace_configuration() {
    let daemon = MockDaemon::start().await.unwrap();
    let job = connected(&daemon).await;
    assert!(!job.is_tracing_channel_data());

    let result = job
        .set_trace_config(ServerTraceDest::File, ServerTraceLevel::Datastream)
        .await
        .unwrap();

    assert_eq!(result.tracelevel, "DATASTREAM");
    assert_eq!(job.trace_file_path().as_deref(), Some(MOCK_TRACE_FILE));
    assert!(job.is_tracing_channel_data());

    let trace = job.get_trace_data().await.unwrap();
    assert!(trace.tracedata.contains("mock trace"));

    job.set_trace_config(ServerTraceDest::InMem, ServerTraceLevel::Off)
        .await
        .unwrap();
    assert_eq!(job.trace_file_path(), None);
}

#[tokio::test]
async fn test_pending_transactions_and_commit() {
    let daemon = MockDaemon::builder()
        .pending_transactions(0)
        .start()
        .await
        .unwrap();
    let job = connected(&daemon).await;
    assert_eq!(job.get_pending_transactions().await.unwrap(), 0);

    job.execute::<Value>("insert into t values (1)", QueryOptions::new())
        .await
        .unwrap();
    job.execute::<Value>("update t set c = 2", QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(job.get_pending_transactions().await.unwrap(), 2);

    job.end_transaction(TransactionEndType::Commit).await.unwrap();
    assert_eq!(job.get_pending_transactions().await.unwrap(), 0);

    let rollback = TransactionEndType::try_from("ROLLBACK").unwrap();
    assert!(job.end_transaction(rollback).await.is_ok());
    assert!(TransactionEndType::try_from("ABORT").unwrap_err().is_usage());
}

#[tokio::test]
async fn test_pending_transactions_query_is_answered() {
    let daemon = MockDaemon::builder()
        .pending_transactions(3)
        .start()
        .await
        .unwrap();
    let job = SqlJob::builder()
        .request_timeout(Duration::from_secs(2))
        .build();
    job.connect(&daemon.server()).await.unwrap();

    assert_eq!(job.get_pending_transactions().await.unwrap(), 3);

    let sent = daemon.requests_of("sql");
    let RequestBody::Sql { sql, .. } = &sent[0].request.body else {
        panic!("not a sql request");
    };
    assert!(sql.contains("changes_pending"));
}
