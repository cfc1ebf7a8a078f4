//! # garrison-server: HTTP connections, modules, and the worker runtime
//!
//! A worker owns one [`Reactor`](garrison_reactor::Reactor) and one
//! [`Runtime`]: the [`HttpServer`] accepting on the shared listener and, when
//! the database is enabled, a [`WorkerPool`] of PostgreSQL connections.
//!
//! ```text
//!  listener ─► HttpConnection ─► RequestParser ─► Module::check/execute
//!                   ▲                                   │
//!                   │                 ┌─────────────────┼──────────────┐
//!                   │                 ▼                 ▼              ▼
//!                   │              reply           stock reply     PgPool query
//!                   │                 │                 │              │
//!                   └──── keep-alive ─┴──── write ◄─────┴── QueryHandler
//! ```
//!
//! Requests are handled one at a time per connection. Input that arrives
//! while a request is in progress stays buffered until its reply is sent.

mod access_log;
mod buffer_pool;
mod connection;
mod error;
mod listener;
mod module;
pub mod modules;
mod runtime;
mod server;

pub use access_log::{ACCESS_TARGET, format_line, log_request};
pub use buffer_pool::BufferPool;
pub use connection::{ConnKey, ConnStatus, HttpConnection};
pub use error::{ServerError, ServerResult};
pub use listener::{bind, bind_addr};
pub use module::{Module, ModuleContext, Query, QueryHandler};
pub use runtime::{Runtime, build_pool};
pub use server::{HttpServer, PendingQuery, ServerSettings, WorkerPool};
