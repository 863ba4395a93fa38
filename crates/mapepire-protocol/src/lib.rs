//! # mapepire-protocol
//!
//! Wire-level message types for the Mapepire daemon protocol.
//!
//! Every exchange with the daemon is a single JSON object. Requests carry a
//! caller-assigned `id` and a `type` discriminator; the daemon answers each
//! request with one JSON object carrying the same `id` and a `success` flag.
//! This crate only describes those documents. It performs no I/O.
//!
//! ## Request types
//!
//! | type | purpose |
//! |---|---|
//! | `connect` | establish a server job |
//! | `sql` | run a statement |
//! | `prepare_sql_execute` | run a parameterized statement |
//! | `sqlmore` | fetch more rows of an open statement |
//! | `sqlclose` | release an open statement |
//! | `cl` | run a CL command |
//! | `getversion` | daemon version |
//! | `dove` | explain (Visual Explain) |
//! | `gettracedata` | fetch the trace buffer |
//! | `setconfig` | configure tracing |
//! | `exit` | end the server job |
//!
//! ## Example
//!
//! ```
//! use mapepire_protocol::{Request, RequestBody};
//!
//! let request = Request::new("query1", RequestBody::Sql {
//!     sql: "values 1".into(),
//!     rows: 100,
//!     terse: None,
//!     parameters: None,
//! });
//!
//! let json = request.to_json().unwrap();
//! assert!(json.contains(r#""type":"sql""#));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod props;
pub mod request;
pub mod response;

pub use error::ProtocolError;
pub use props::encode_props;
pub use request::{Request, RequestBody, ServerTraceDest, ServerTraceLevel};
pub use response::{
    ColumnMetaData, ConnectionResult, ExplainResults, GetTraceDataResult, ParameterDetail,
    ParameterResult, QueryMetaData, QueryResult, ServerReply, ServerResponse, SetConfigResult,
    VersionCheckResult, decode_response, response_id,
};

/// Default daemon port.
pub const DEFAULT_PORT: u16 = 8076;

/// Path of the daemon's WebSocket endpoint.
pub const ENDPOINT_PATH: &str = "/db/";
