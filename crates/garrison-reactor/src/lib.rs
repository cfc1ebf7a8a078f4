//! # garrison-reactor: the poll stack
//!
//! One [`Reactor`] runs per process. It multiplexes every socket the process
//! owns (the shared listener, HTTP connections, PostgreSQL connections, and
//! the signal self-pipe) over a single `mio::Poll`:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Reactor                            │
//! │  Token → Handler { binding, interest, deadline }          │
//! │                                                           │
//! │   poll.wait ──► accept / read / write ──► EventSink       │
//! │             └─► deadlines past due   ──► on_timeout       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The reactor never performs I/O itself; owners receive callbacks through
//! [`EventSink`] and drive their non-blocking sockets. Nothing blocks except
//! the wait inside [`Reactor::run_once`].

mod error;
mod reactor;

pub use error::{ReactorError, ReactorResult};
pub use mio::{Interest, Token};
pub use reactor::{Binding, DEFAULT_EVENT_CAPACITY, EventSink, Handler, Reactor};
