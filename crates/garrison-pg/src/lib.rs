//! # garrison-pg: non-blocking PostgreSQL pool
//!
//! Each worker owns one [`PgPool`]. Connections speak the frontend/backend
//! protocol over non-blocking sockets registered with the worker's
//! [`garrison_reactor::Reactor`], so a slow query never stalls HTTP traffic.
//!
//! ```text
//!   Connect ──► Ready ◄──► Busy
//!      │          │
//!      ▼          ▼
//!    Error ──► Reset ──► Ready
//! ```
//!
//! # Example
//!
//! ```no_run
//! use garrison_pg::{ConnInfo, PgPool, PgQuery, PoolConfig};
//! use garrison_reactor::Reactor;
//!
//! let mut reactor = Reactor::new(1024)?;
//! let info = ConnInfo::parse("host=localhost dbname=postgres user=postgres")?;
//! let mut pool: PgPool<u64> = PgPool::new(info, PoolConfig::default());
//! pool.start(&mut reactor)?;
//!
//! if let Err(rejected) = pool.query_start(&mut reactor, PgQuery::new("select now()", 1)) {
//!     eprintln!("query {} refused: {}", rejected.query.tag, rejected.error);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod connection;
mod conninfo;
mod error;
mod ping;
mod pool;
mod query;
mod queue;
mod result;
mod stream;

pub use connection::{ConnStatus, PgConnection, PollingStatus};
pub use conninfo::{ConnInfo, DEFAULT_DBNAME, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_USER};
pub use error::{PgError, PgResult};
pub use ping::{MAX_PING_ATTEMPTS, PING_RETRY_DELAY, PingStatus, ping, ping_with_retry};
pub use pool::{PgPool, PoolConfig};
pub use query::{Completion, PgQuery, Rejected};
pub use queue::{OVERFLOW_QUEUE_CAPACITY, OverflowQueue, PushResult};
pub use result::{DbError, QueryResult, ResultStatus};

#[cfg(test)]
mod tests;
