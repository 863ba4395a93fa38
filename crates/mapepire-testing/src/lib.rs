//! # mapepire-testing
//!
//! Test infrastructure for the Mapepire client crates.
//!
//! [`MockDaemon`] is an in-process daemon that speaks the real transport
//! (TLS, WebSocket, JSON frames) on 127.0.0.1 and answers from a small
//! script, so that jobs, queries and pools can be exercised end to end
//! without an IBM i system.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mapepire_client::{JdbcOptions, SqlJob};
//! use mapepire_testing::MockDaemon;
//!
//! #[tokio::test]
//! async fn connects() {
//!     let daemon = MockDaemon::builder().table("T", 250).start().await.unwrap();
//!     let job = SqlJob::new(JdbcOptions::new());
//!     job.connect(&daemon.server()).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod certs;
pub mod daemon;
pub mod error;

pub use certs::TestCertificates;
pub use daemon::{MOCK_TRACE_FILE, MOCK_VERSION, MockDaemon, MockDaemonBuilder, RecordedRequest};
pub use error::MockError;

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
///
/// Safe to call from every test.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
