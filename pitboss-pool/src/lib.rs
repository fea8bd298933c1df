//! Pitboss worker pool
//!
//! A fixed-size pool of long-lived worker processes that speak a framed JSON
//! protocol over stdio. Calls are scheduled onto idle workers, optionally
//! pinned to a worker by session id, and failures are classified and handed
//! to the recovery orchestrator from `pitboss-resilience`.
//!
//! ```no_run
//! use pitboss_config::PitbossConfig;
//! use pitboss_pool::{ExecuteOptions, Pool};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let pool = Pool::start(PitbossConfig::default()).await?;
//! let value = pool
//!     .execute("echo", serde_json::json!({"hello": "world"}), ExecuteOptions::default())
//!     .await?;
//! println!("{}", value);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod health;
pub mod initializer;
pub mod launcher;
pub mod pool;
pub mod registry;
mod scheduler;
pub mod session;
mod telemetry;
pub mod testing;
pub mod worker;

// Re-export main types
pub use error::{CallResult, PoolError, PoolResult};
pub use initializer::{ConcurrentPoolInitializer, InitFailure, InitReport};
pub use launcher::{CommandLauncher, ExitStatus, LaunchedWorker, WorkerControl, WorkerLauncher};
pub use pool::{ExecuteOptions, Pool, PoolStats};
pub use registry::WorkerRegistry;
pub use scheduler::WorkerLease;
pub use session::{SessionAffinityTable, SessionBinding};
pub use worker::{WorkerExit, WorkerProcess, WorkerStats, WorkerStatus};
