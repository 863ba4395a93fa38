//! Response documents received from the daemon.
//!
//! Every response shares the `id`/`success`/`error`/`sql_rc`/`sql_state`
//! envelope, exposed uniformly through [`ServerReply`]. All fields default
//! when absent so partial payloads still decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Fallback message when a failed response carries no diagnostic fields.
pub const UNKNOWN_FAILURE: &str = "Failed to run query (unknown error)";

/// Common view over the response envelope.
pub trait ServerReply {
    /// Correlation id echoed by the daemon.
    fn id(&self) -> &str;
    /// Whether the request succeeded.
    fn success(&self) -> bool;
    /// Server-supplied error text.
    fn error(&self) -> Option<&str>;
    /// SQLSTATE of the failure.
    fn sql_state(&self) -> Option<&str>;
    /// SQL return code of the failure.
    fn sql_rc(&self) -> Option<i64>;

    /// The `error` field, or `fallback` when the server sent none.
    fn error_or(&self, fallback: &str) -> String {
        self.error().unwrap_or(fallback).to_string()
    }

    /// Composite failure message: the present fields of `error`,
    /// `sql_state` and `sql_rc` joined by `", "`.
    fn error_message(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(error) = self.error() {
            parts.push(error.to_string());
        }
        if let Some(state) = self.sql_state() {
            parts.push(state.to_string());
        }
        if let Some(rc) = self.sql_rc() {
            parts.push(rc.to_string());
        }

        if parts.is_empty() {
            UNKNOWN_FAILURE.to_string()
        } else {
            parts.join(", ")
        }
    }
}

macro_rules! impl_server_reply {
    ($($ty:ident $(<$generic:ident>)?),* $(,)?) => {
        $(
            impl$(<$generic>)? ServerReply for $ty$(<$generic>)? {
                fn id(&self) -> &str {
                    &self.id
                }

                fn success(&self) -> bool {
                    self.success
                }

                fn error(&self) -> Option<&str> {
                    self.error.as_deref()
                }

                fn sql_state(&self) -> Option<&str> {
                    self.sql_state.as_deref()
                }

                fn sql_rc(&self) -> Option<i64> {
                    self.sql_rc
                }
            }
        )*
    };
}

/// Bare response envelope, used for requests without a typed payload
/// (`sqlclose`, `exit`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
}

/// Response to `connect`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionResult {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Server-assigned job name, e.g. `123456/QUSER/QZDASOINIT`.
    #[serde(default)]
    pub job: String,
}

/// Response to `getversion`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionCheckResult {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Daemon build date.
    #[serde(default)]
    pub build_date: String,
    /// Daemon version.
    #[serde(default)]
    pub version: String,
}

/// Response to `gettracedata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetTraceDataResult {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Trace buffer contents.
    #[serde(default)]
    pub tracedata: String,
}

/// Response to `setconfig`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetConfigResult {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Effective trace destination; a path when tracing to a file.
    #[serde(default)]
    pub tracedest: String,
    /// Effective trace level.
    #[serde(default)]
    pub tracelevel: String,
    /// Effective JTOpen trace destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jtopentracedest: Option<String>,
    /// Effective JTOpen trace level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jtopentracelevel: Option<String>,
}

/// Column descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetaData {
    /// Display width.
    #[serde(default)]
    pub display_size: i64,
    /// Column label.
    #[serde(default)]
    pub label: String,
    /// Column name.
    #[serde(default)]
    pub name: String,
    /// SQL type name.
    #[serde(default, rename = "type")]
    pub type_name: String,
    /// Precision.
    #[serde(default)]
    pub precision: i64,
    /// Scale.
    #[serde(default)]
    pub scale: i64,
}

/// Parameter descriptor of a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDetail {
    /// SQL type name.
    #[serde(default, rename = "type")]
    pub type_name: String,
    /// `IN`, `OUT` or `INOUT`.
    #[serde(default)]
    pub mode: String,
    /// Precision.
    #[serde(default)]
    pub precision: i64,
    /// Scale.
    #[serde(default)]
    pub scale: i64,
    /// Parameter name.
    #[serde(default)]
    pub name: String,
}

/// Output parameter value returned by a procedure call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterResult {
    /// 1-based parameter index.
    #[serde(default)]
    pub index: i64,
    /// SQL type name.
    #[serde(default, rename = "type")]
    pub type_name: String,
    /// Precision.
    #[serde(default)]
    pub precision: i64,
    /// Scale.
    #[serde(default)]
    pub scale: i64,
    /// Parameter name.
    #[serde(default)]
    pub name: String,
    /// CCSID, for character types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccsid: Option<i64>,
    /// Returned value.
    #[serde(default)]
    pub value: Value,
}

/// Result-set metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetaData {
    /// Number of columns.
    #[serde(default)]
    pub column_count: i64,
    /// Column descriptors.
    #[serde(default)]
    pub columns: Vec<ColumnMetaData>,
    /// Job that ran the statement.
    #[serde(default)]
    pub job: String,
    /// Parameter descriptors, for prepared statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<ParameterDetail>>,
}

/// Response to `sql`, `prepare_sql_execute`, `sqlmore` and `cl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult<T = Value> {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Result-set metadata, absent on continuation pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueryMetaData>,
    /// No more rows remain on the server.
    #[serde(default)]
    pub is_done: bool,
    /// The statement produced a result set.
    #[serde(default)]
    pub has_results: bool,
    /// Rows affected by a data-change statement.
    #[serde(default)]
    pub update_count: i64,
    /// Rows of this page.
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    /// Number of parameters of a prepared statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<i64>,
    /// Output parameters of a procedure call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_parms: Option<Vec<ParameterResult>>,
}

/// Response to `dove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainResults<T = Value> {
    /// Correlation id.
    #[serde(default)]
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub success: bool,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SQL return code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_rc: Option<i64>,
    /// SQLSTATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    /// Metadata of the explained statement's result set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueryMetaData>,
    /// No more rows remain on the server.
    #[serde(default)]
    pub is_done: bool,
    /// The statement produced a result set.
    #[serde(default)]
    pub has_results: bool,
    /// Rows affected by a data-change statement.
    #[serde(default)]
    pub update_count: i64,
    /// Rows of the explained statement.
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    /// Metadata of the Visual Explain data set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vemetadata: Option<QueryMetaData>,
    /// Visual Explain data.
    #[serde(default)]
    pub vedata: Value,
}

impl_server_reply!(
    ServerResponse,
    ConnectionResult,
    VersionCheckResult,
    GetTraceDataResult,
    SetConfigResult,
    QueryResult<T>,
    ExplainResults<T>,
);

/// Decode an inbound message into a typed response.
pub fn decode_response<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::Decode {
        kind: short_type_name::<T>(),
        source,
    })
}

/// Correlation id of an inbound message, if it has one.
#[must_use]
pub fn response_id(value: &Value) -> Option<&str> {
    value.as_object()?.get("id")?.as_str()
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
