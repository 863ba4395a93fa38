//! Request documents sent to the daemon.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// A single request: a correlation id plus a typed body.
///
/// Serializes to one flat JSON object, e.g.
/// `{"id":"query3","type":"sql","sql":"values 1","rows":100}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id; the daemon echoes it in the response.
    pub id: String,
    /// Request payload, discriminated by `type`.
    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    /// Create a new request.
    #[must_use]
    pub fn new(id: impl Into<String>, body: RequestBody) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Encode the request as a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Payload of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequestBody {
    /// Establish a server job.
    #[serde(rename = "connect")]
    Connect {
        /// Connection technique (`tcp` or `cli`).
        technique: String,
        /// Client application name.
        application: String,
        /// `key=value;...` connection options.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        props: Option<String>,
    },

    /// Run a statement.
    #[serde(rename = "sql")]
    Sql {
        /// Statement text.
        sql: String,
        /// Rows to return in the first page.
        rows: i64,
        /// Omit per-row metadata when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terse: Option<bool>,
        /// Positional parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Vec<Value>>,
    },

    /// Prepare and run a parameterized statement.
    #[serde(rename = "prepare_sql_execute")]
    PrepareSqlExecute {
        /// Statement text.
        sql: String,
        /// Rows to return in the first page.
        rows: i64,
        /// Omit per-row metadata when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terse: Option<bool>,
        /// Positional parameters, or a batch of parameter rows.
        parameters: Vec<Value>,
    },

    /// Fetch more rows of an open statement.
    #[serde(rename = "sqlmore")]
    SqlMore {
        /// Correlation id of the statement being continued.
        cont_id: String,
        /// Statement text.
        sql: String,
        /// Rows to return in this page.
        rows: i64,
    },

    /// Release the server resources of an open statement.
    #[serde(rename = "sqlclose")]
    SqlClose {
        /// Correlation id of the statement being closed.
        cont_id: String,
    },

    /// Run a CL command.
    #[serde(rename = "cl")]
    Cl {
        /// Command text.
        cmd: String,
        /// Omit per-row metadata when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terse: Option<bool>,
    },

    /// Ask for the daemon version.
    #[serde(rename = "getversion")]
    GetVersion,

    /// Explain a statement.
    #[serde(rename = "dove")]
    Dove {
        /// Statement text.
        sql: String,
        /// Whether the statement is actually run while explaining.
        run: bool,
    },

    /// Fetch the server-side trace buffer.
    #[serde(rename = "gettracedata")]
    GetTraceData,

    /// Configure server-side tracing.
    #[serde(rename = "setconfig")]
    SetConfig {
        /// Where trace output goes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracedest: Option<ServerTraceDest>,
        /// Trace verbosity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tracelevel: Option<ServerTraceLevel>,
    },

    /// End the server job.
    #[serde(rename = "exit")]
    Exit,
}

impl RequestBody {
    /// Wire value of the `type` discriminator.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Sql { .. } => "sql",
            Self::PrepareSqlExecute { .. } => "prepare_sql_execute",
            Self::SqlMore { .. } => "sqlmore",
            Self::SqlClose { .. } => "sqlclose",
            Self::Cl { .. } => "cl",
            Self::GetVersion => "getversion",
            Self::Dove { .. } => "dove",
            Self::GetTraceData => "gettracedata",
            Self::SetConfig { .. } => "setconfig",
            Self::Exit => "exit",
        }
    }
}

/// Destination of server-side trace output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerTraceDest {
    /// Write to a file in the server's IFS.
    #[serde(rename = "FILE")]
    File,
    /// Keep in memory; retrieve with `gettracedata`.
    #[serde(rename = "IN_MEM")]
    InMem,
}

/// Server-side trace verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerTraceLevel {
    /// Tracing disabled.
    #[serde(rename = "OFF")]
    Off,
    /// Regular tracing.
    #[serde(rename = "ON")]
    On,
    /// Errors only.
    #[serde(rename = "ERRORS")]
    Errors,
    /// Everything, including raw data streams.
    #[serde(rename = "DATASTREAM")]
    Datastream,
}
