//! # mapepire-pool
//!
//! Elastic pool of Mapepire server jobs.
//!
//! Connecting a job costs a TLS handshake, a WebSocket upgrade and a server
//! job start. The pool amortizes that cost across callers:
//!
//! - `init` connects `starting_size` jobs up front
//! - `get_job` prefers an idle job, then the least-loaded busy one
//! - a busy pool grows in the background, one job at a time, up to `max_size`
//! - `pop_job` hands a job to the caller for exclusive use
//!
//! All jobs of a pool share one [`QueryRegistry`](mapepire_client::QueryRegistry).
//!
//! ## Example
//!
//! ```rust,ignore
//! use mapepire_client::DaemonServer;
//! use mapepire_pool::Pool;
//! use serde_json::{Value, json};
//!
//! let pool = Pool::builder(DaemonServer::new("ibmi.example.com", "QUSER", "secret"))
//!     .max_size(5)
//!     .starting_size(3)
//!     .build();
//! pool.init().await?;
//!
//! let rows = pool
//!     .sql::<Value>(&["select * from qiws.qcustcdt where cusnum = ", ""], vec![json!(938472)])
//!     .await?;
//!
//! let status = pool.status();
//! println!("pool utilization: {:.1}%", status.utilization());
//! pool.end().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod pool;

pub use config::PoolOptions;
pub use error::PoolError;
pub use pool::{GROWTH_THRESHOLD, Pool, PoolBuilder, PoolMetrics, PoolStatus};
