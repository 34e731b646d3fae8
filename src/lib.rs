//! PostgreSQL-backed distributed locks.
//!
//! Clients in different processes or hosts acquire named locks; the
//! database guarantees that at most one client holds a given lock at
//! any moment. Locks carry a short-lived lease that holders refresh
//! with a background heartbeat, so dead holders are eventually
//! superseded. Every successful acquisition or refresh draws a strictly
//! increasing record version number from a shared sequence, which
//! doubles as a fencing token the protected resource can verify.
//!
//! ```rust,no_run
//! use pglease::{AcquireOptions, Client};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pg = pglease::config::PgConfig::from_env();
//! let pool = pglease::connect::create_pool(&pg, 4).await?;
//! let client = Client::new(pool);
//!
//! let result = client
//!     .with_lock("nightly-report", AcquireOptions::new(), |lock| async move {
//!         // hand lock.record_version_number() to the protected
//!         // resource as a fencing token, and watch lock.cancelled()
//!         // for loss of the lease
//!         42
//!     })
//!     .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```
//!
//! Serialization conflicts (SQLSTATE 40001) are retried without bound;
//! the client assumes the database eventually admits a serializable
//! schedule. A database that never does will keep the retry loop
//! spinning.

pub mod client;
pub mod config;
pub mod connect;
pub mod error;
pub mod lock;

pub use client::{
    Builder, Client, DEFAULT_HEARTBEAT_FREQUENCY, DEFAULT_LEASE_DURATION, DEFAULT_TABLE_NAME,
};
pub use error::Error;
pub use lock::{AcquireOptions, Lock};
