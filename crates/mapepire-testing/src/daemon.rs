//! Scripted in-process Mapepire daemon.
//!
//! The daemon speaks the real transport (TLS, WebSocket upgrade with Basic
//! authentication, one JSON document per text frame) and answers requests
//! from a small script keyed on the statement text:
//!
//! | statement | reply |
//! |---|---|
//! | `SELECT HANG` | none |
//! | `CALL DELAY(ms)` | success after `ms` milliseconds |
//! | contains `NONEXISTENT` or an unknown table | SQL0204, `42704`, `-204` |
//! | contains `SILENTFAIL` | `success: false` with no details |
//! | `VALUES x` | one row holding `x` or the bound parameters |
//! | `SELECT * FROM T` | paged rows of a configured table |
//! | `DB_TRANSACTION_INFO` query | `THECOUNT` of pending changes |
//! | `INSERT` / `UPDATE` / `DELETE` | one row updated, one change pending |
//! | `COMMIT` / `ROLLBACK` | clears pending changes |
//!
//! CL commands fail with `CPF9801` when they mention `NOTEXIST`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use mapepire_client::DaemonServer;
use mapepire_protocol::{Request, RequestBody, ServerTraceDest};
use parking_lot::Mutex;
use rustls::ServerConfig;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

use crate::certs::TestCertificates;
use crate::error::MockError;

/// Daemon version reported by `getversion`.
pub const MOCK_VERSION: &str = "2.1.0";

/// Trace file reported when tracing to a file.
pub const MOCK_TRACE_FILE: &str = "/tmp/mapepire/trace.txt";

/// A request as the daemon received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Zero-based index of the WebSocket session it arrived on.
    pub session: usize,
    /// The decoded request.
    pub request: Request,
}

/// Configuration of a [`MockDaemon`].
#[derive(Debug, Clone)]
pub struct MockDaemonBuilder {
    user: String,
    password: String,
    with_ca: bool,
    response_delay: Duration,
    tables: HashMap<String, usize>,
    refuse_connect: bool,
    pending_transactions: i64,
}

impl Default for MockDaemonBuilder {
    fn default() -> Self {
        Self {
            user: "QUSER".into(),
            password: "secret".into(),
            with_ca: false,
            response_delay: Duration::ZERO,
            tables: HashMap::new(),
            refuse_connect: false,
            pending_transactions: 0,
        }
    }
}

impl MockDaemonBuilder {
    /// Credentials the daemon accepts.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Serve a leaf signed by a generated CA instead of a self-signed leaf.
    #[must_use]
    pub fn with_ca(mut self) -> Self {
        self.with_ca = true;
        self
    }

    /// Delay every reply.
    #[must_use]
    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Add a table of `rows` rows with columns `ID` and `NAME`.
    #[must_use]
    pub fn table(mut self, name: &str, rows: usize) -> Self {
        self.tables.insert(name.to_ascii_uppercase(), rows);
        self
    }

    /// Answer every `connect` with `success: false`.
    #[must_use]
    pub fn refuse_connect(mut self, refuse: bool) -> Self {
        self.refuse_connect = refuse;
        self
    }

    /// Initial number of uncommitted changes.
    #[must_use]
    pub fn pending_transactions(mut self, count: i64) -> Self {
        self.pending_transactions = count;
        self
    }

    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    pub async fn start(self) -> Result<MockDaemon, MockError> {
        let certs = if self.with_ca {
            TestCertificates::with_ca()?
        } else {
            TestCertificates::self_signed()?
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs.chain().to_vec(), certs.key())?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(DaemonState {
            authorization: format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", self.user, self.password))
            ),
            pending: AtomicI64::new(self.pending_transactions),
            config: self,
            sessions: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
        });

        let (kill, kill_rx) = watch::channel(0u64);
        let accept_task =
            tokio::spawn(accept_loop(listener, acceptor, Arc::clone(&state), kill_rx));
        tracing::debug!(addr = %addr, "mock daemon listening");

        Ok(MockDaemon {
            addr,
            state,
            certs,
            kill,
            accept_task,
        })
    }
}

/// An in-process daemon listening on 127.0.0.1.
///
/// Dropping it stops accepting and closes every session.
#[derive(Debug)]
pub struct MockDaemon {
    addr: SocketAddr,
    state: Arc<DaemonState>,
    certs: TestCertificates,
    kill: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl MockDaemon {
    /// Start configuring a daemon.
    #[must_use]
    pub fn builder() -> MockDaemonBuilder {
        MockDaemonBuilder::default()
    }

    /// Start a daemon with default settings.
    pub async fn start() -> Result<Self, MockError> {
        Self::builder().start().await
    }

    /// Listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Server certificates.
    #[must_use]
    pub fn certificates(&self) -> &TestCertificates {
        &self.certs
    }

    /// Connection description that trusts this daemon's certificate.
    #[must_use]
    pub fn server(&self) -> DaemonServer {
        DaemonServer::new("127.0.0.1", &self.state.config.user, &self.state.config.password)
            .port(self.port())
            .ca(self.certs.trust_anchor_pem())
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Received requests of one `type`.
    #[must_use]
    pub fn requests_of(&self, kind: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.request.body.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of WebSocket sessions accepted so far.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Statements holding a server cursor.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.state.cursors.lock().len()
    }

    /// Close every open session with a WebSocket close frame.
    pub fn close_all_sessions(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.kill.send_modify(|generation| *generation += 1);
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    total: usize,
    next: usize,
    terse: bool,
}

#[derive(Debug)]
struct DaemonState {
    config: MockDaemonBuilder,
    authorization: String,
    sessions: AtomicUsize,
    pending: AtomicI64,
    requests: Mutex<Vec<RecordedRequest>>,
    cursors: Mutex<HashMap<String, Cursor>>,
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<DaemonState>,
    kill: watch::Receiver<u64>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "mock daemon accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let state = Arc::clone(&state);
        let kill = kill.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, acceptor, state, kill).await {
                tracing::debug!(peer = %peer, error = %e, "mock session ended with error");
            }
        });
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".into()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn serve(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    state: Arc<DaemonState>,
    mut kill: watch::Receiver<u64>,
) -> Result<(), MockError> {
    kill.mark_unchanged();
    let tls = acceptor.accept(stream).await?;

    let expected = state.authorization.clone();
    let ws = accept_hdr_async(tls, move |request: &HsRequest, response: HsResponse| {
        let supplied = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if supplied == Some(expected.as_str()) {
            Ok(response)
        } else {
            Err(unauthorized())
        }
    })
    .await?;

    let session = state.sessions.fetch_add(1, Ordering::SeqCst);
    let (sink, mut frames) = ws.split();
    let sink = Arc::new(tokio::sync::Mutex::new(sink));

    loop {
        tokio::select! {
            _ = kill.changed() => break,
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                let text = match frame? {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let request: Request = match serde_json::from_str(text.as_str()) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!(error = %e, "mock daemon got an undecodable frame");
                        continue;
                    }
                };

                state.requests.lock().push(RecordedRequest {
                    session,
                    request: request.clone(),
                });
                if matches!(request.body, RequestBody::Exit) {
                    break;
                }

                let Some((delay, reply)) = state.respond(session, &request) else {
                    continue;
                };
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = sink.lock().await.send(Message::text(reply.to_string())).await;
                });
            }
        }
    }

    let _ = sink.lock().await.close().await;
    Ok(())
}

fn job_name(session: usize) -> String {
    format!("{:06}/QUSER/QZDASOINIT", 100_001 + session)
}

fn column(name: &str, type_name: &str, precision: i64) -> Value {
    json!({
        "display_size": precision + 1,
        "label": name,
        "name": name,
        "type": type_name,
        "precision": precision,
        "scale": 0,
    })
}

fn metadata(session: usize, columns: Vec<Value>) -> Value {
    json!({
        "column_count": columns.len(),
        "columns": columns,
        "job": job_name(session),
    })
}

fn not_found(id: &str, object: &str) -> Value {
    json!({
        "id": id,
        "success": false,
        "error": format!("[SQL0204] {object} in QGPL type *FILE not found."),
        "sql_state": "42704",
        "sql_rc": -204,
        "is_done": true,
    })
}

fn done(id: &str, update_count: i64) -> Value {
    json!({
        "id": id,
        "success": true,
        "has_results": false,
        "update_count": update_count,
        "is_done": true,
        "data": [],
    })
}

fn table_row(index: usize, terse: bool) -> Value {
    let name = format!("ROW{index}");
    if terse {
        json!([index, name])
    } else {
        json!({ "ID": index, "NAME": name })
    }
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl DaemonState {
    fn respond(&self, session: usize, request: &Request) -> Option<(Duration, Value)> {
        let delay = self.config.response_delay;
        let id = request.id.as_str();

        let reply = match &request.body {
            RequestBody::Connect { .. } => {
                if self.config.refuse_connect {
                    json!({ "id": id, "success": false, "error": "Connection refused by mock daemon" })
                } else {
                    json!({ "id": id, "success": true, "job": job_name(session) })
                }
            }
            RequestBody::GetVersion => json!({
                "id": id,
                "success": true,
                "version": MOCK_VERSION,
                "build_date": "2024-06-01",
            }),
            RequestBody::Sql {
                sql,
                rows,
                terse,
                parameters,
            } => {
                let terse = terse.unwrap_or(false);
                return self.run_sql(session, id, sql, *rows, terse, parameters.as_deref(), delay);
            }
            RequestBody::PrepareSqlExecute {
                sql,
                rows,
                terse,
                parameters,
            } => {
                let terse = terse.unwrap_or(false);
                return self.run_sql(session, id, sql, *rows, terse, Some(parameters.as_slice()), delay);
            }
            RequestBody::SqlMore { cont_id, rows, .. } => {
                match self.page(cont_id, *rows) {
                    Some((data, is_done)) => json!({
                        "id": id,
                        "success": true,
                        "has_results": true,
                        "update_count": -1,
                        "is_done": is_done,
                        "data": data,
                    }),
                    None => json!({
                        "id": id,
                        "success": false,
                        "error": format!("Invalid continuation id {cont_id}"),
                        "is_done": true,
                    }),
                }
            }
            RequestBody::SqlClose { cont_id } => {
                self.cursors.lock().remove(cont_id);
                json!({ "id": id, "success": true })
            }
            RequestBody::Cl { cmd, .. } => {
                if cmd.to_ascii_uppercase().contains("NOTEXIST") {
                    json!({
                        "id": id,
                        "success": false,
                        "error": "CPF9801",
                        "is_done": true,
                        "has_results": true,
                        "data": [{
                            "MESSAGE_ID": "CPF9801",
                            "MESSAGE_TEXT": "Object NOTEXIST in library *LIBL not found.",
                        }],
                    })
                } else {
                    json!({
                        "id": id,
                        "success": true,
                        "is_done": true,
                        "has_results": true,
                        "data": [{ "MESSAGE_ID": "CPC0000", "MESSAGE_TEXT": "Command completed." }],
                    })
                }
            }
            RequestBody::Dove { sql, run } => {
                if sql.to_ascii_uppercase().contains("NONEXISTENT") {
                    not_found(id, "NONEXISTENT")
                } else {
                    json!({
                        "id": id,
                        "success": true,
                        "is_done": true,
                        "has_results": true,
                        "metadata": metadata(session, vec![column("00001", "INTEGER", 10)]),
                        "data": [],
                        "vemetadata": metadata(session, vec![column("NODE", "VARCHAR", 128)]),
                        "vedata": { "run": run, "nodes": [{ "id": 1, "title": "Final Select" }] },
                    })
                }
            }
            RequestBody::GetTraceData => json!({
                "id": id,
                "success": true,
                "tracedata": "<html><body>mock trace</body></html>",
            }),
            RequestBody::SetConfig { tracedest, tracelevel } => {
                let dest = match tracedest {
                    Some(ServerTraceDest::File) => MOCK_TRACE_FILE,
                    _ => "IN_MEM",
                };
                let level = tracelevel
                    .and_then(|l| serde_json::to_value(l).ok())
                    .unwrap_or_else(|| json!("OFF"));
                json!({
                    "id": id,
                    "success": true,
                    "tracedest": dest,
                    "tracelevel": level,
                })
            }
            RequestBody::Exit => return None,
        };

        Some((delay, reply))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_sql(
        &self,
        session: usize,
        id: &str,
        sql: &str,
        rows: i64,
        terse: bool,
        parameters: Option<&[Value]>,
        delay: Duration,
    ) -> Option<(Duration, Value)> {
        let upper = sql.trim().to_ascii_uppercase();

        if upper.starts_with("SELECT HANG") {
            return None;
        }
        if let Some(rest) = upper.strip_prefix("CALL DELAY(") {
            let ms = leading_number(rest).unwrap_or(0);
            return Some((delay + Duration::from_millis(ms), done(id, 0)));
        }
        if upper.contains("NONEXISTENT") {
            return Some((delay, not_found(id, "NONEXISTENT")));
        }
        if upper.contains("SILENTFAIL") {
            return Some((delay, json!({ "id": id, "success": false })));
        }

        let reply = if upper.contains("DB_TRANSACTION_INFO") {
            json!({
                "id": id,
                "success": true,
                "has_results": true,
                "update_count": -1,
                "is_done": true,
                "metadata": metadata(session, vec![column("THECOUNT", "INTEGER", 10)]),
                "data": [{ "THECOUNT": self.pending.load(Ordering::SeqCst) }],
            })
        } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.pending.store(0, Ordering::SeqCst);
            done(id, 0)
        } else if ["INSERT", "UPDATE", "DELETE"].iter().any(|k| upper.starts_with(k)) {
            self.pending.fetch_add(1, Ordering::SeqCst);
            done(id, 1)
        } else if let Some(rest) = sql.trim().get(6..).filter(|_| upper.starts_with("VALUES")) {
            let values: Vec<Value> = match parameters {
                Some(params) if !params.is_empty() => params.to_vec(),
                _ => {
                    let literal = rest.trim();
                    vec![serde_json::from_str(literal).unwrap_or_else(|_| json!(literal))]
                }
            };
            let row = if terse {
                Value::Array(values.clone())
            } else {
                Value::Object(
                    values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (format!("{:05}", i + 1), v.clone()))
                        .collect(),
                )
            };
            let columns = (1..=values.len())
                .map(|i| column(&format!("{i:05}"), "INTEGER", 10))
                .collect();
            json!({
                "id": id,
                "success": true,
                "has_results": true,
                "update_count": -1,
                "is_done": true,
                "metadata": metadata(session, columns),
                "data": [row],
                "parameter_count": parameters.map_or(0, <[Value]>::len),
            })
        } else if let Some(table) = upper.strip_prefix("SELECT * FROM ") {
            let table = table.split_whitespace().next().unwrap_or_default();
            let Some(&total) = self.config.tables.get(table) else {
                return Some((delay, not_found(id, table)));
            };
            self.cursors.lock().insert(
                id.to_string(),
                Cursor {
                    total,
                    next: 0,
                    terse,
                },
            );
            let (data, is_done) = self.page(id, rows).unwrap_or_default();
            json!({
                "id": id,
                "success": true,
                "has_results": true,
                "update_count": -1,
                "is_done": is_done,
                "metadata": metadata(
                    session,
                    vec![column("ID", "INTEGER", 10), column("NAME", "VARCHAR", 20)],
                ),
                "data": data,
            })
        } else {
            done(id, 0)
        };

        Some((delay, reply))
    }

    /// Next page of a cursor. Exhausted cursors are dropped.
    fn page(&self, cont_id: &str, rows: i64) -> Option<(Vec<Value>, bool)> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(cont_id)?;

        let take = usize::try_from(rows.max(0)).unwrap_or(usize::MAX);
        let end = cursor.total.min(cursor.next.saturating_add(take));
        let data = (cursor.next..end)
            .map(|i| table_row(i + 1, cursor.terse))
            .collect();
        cursor.next = end;

        let is_done = cursor.next >= cursor.total;
        if is_done {
            cursors.remove(cont_id);
        }
        Some((data, is_done))
    }
}
