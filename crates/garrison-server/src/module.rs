//! The boundary between the server and request-handling modules.
//!
//! A module inspects a complete request and either replies at once, asks
//! for a stock reply, or starts a database query whose [`QueryHandler`]
//! fills the reply once the results arrive.

use std::net::SocketAddr;

use garrison_http::{ContentType, Reply, Request, Status};
use garrison_pg::{PgError, QueryResult};

use crate::error::ServerResult;

/// Request-handling logic plugged into the server.
pub trait Module {
    fn name(&self) -> &str;

    /// `true` when this module handles `request`. The first match wins.
    fn check(&self, request: &Request) -> bool;

    /// Handles the request. Errors and panics become a stock 500.
    fn execute(&mut self, ctx: &mut ModuleContext<'_>) -> ServerResult<()>;
}

/// Receives the outcome of a query started by a module.
pub trait QueryHandler {
    /// All result sets are in the success class.
    fn on_executed(
        &mut self,
        request: &Request,
        reply: &mut Reply,
        results: &[QueryResult],
    ) -> ServerResult<()>;

    /// The query failed, was refused, or timed out.
    fn on_exception(&mut self, request: &Request, reply: &mut Reply, error: &PgError) {
        tracing::warn!(uri = %request.uri, error = %error, "query failed");
        *reply = Reply::stock(Status::InternalServerError, &reply.server_name, true);
    }
}

impl<F> QueryHandler for F
where
    F: FnMut(&Request, &mut Reply, &[QueryResult]) -> ServerResult<()>,
{
    fn on_executed(
        &mut self,
        request: &Request,
        reply: &mut Reply,
        results: &[QueryResult],
    ) -> ServerResult<()> {
        self(request, reply, results)
    }
}

/// SQL statements plus the handler that receives their results.
pub struct Query {
    pub sql: Vec<String>,
    pub(crate) handler: Box<dyn QueryHandler>,
}

impl Query {
    pub fn add(&mut self, sql: impl Into<String>) -> &mut Self {
        self.sql.push(sql.into());
        self
    }
}

/// What the module decided to do with the request.
pub(crate) enum Action {
    /// Nothing yet; the request times out unless something replies.
    Deferred,
    Reply,
    Stock(Status),
    Query(Query),
}

/// Access to the request and reply for the duration of one `execute`.
pub struct ModuleContext<'a> {
    request: &'a Request,
    reply: &'a mut Reply,
    peer: SocketAddr,
    quit_allowed: bool,
    pub(crate) action: Action,
    pub(crate) quit_requested: bool,
}

impl<'a> ModuleContext<'a> {
    pub(crate) fn new(
        request: &'a Request,
        reply: &'a mut Reply,
        peer: SocketAddr,
        quit_allowed: bool,
    ) -> Self {
        Self {
            request,
            reply,
            peer,
            quit_allowed,
            action: Action::Deferred,
            quit_requested: false,
        }
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn reply(&mut self) -> &mut Reply {
        self.reply
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends the reply built so far with `status`.
    pub fn send_reply(&mut self, status: Status) {
        self.reply.status = status;
        self.action = Action::Reply;
    }

    /// Sends `content` as JSON with `status`.
    pub fn send_json(&mut self, status: Status, content: impl Into<Vec<u8>>) {
        self.reply.content_type = ContentType::Json;
        self.reply.content = content.into();
        self.send_reply(status);
    }

    /// Sends a canned reply; the connection is closed afterwards.
    pub fn send_stock_reply(&mut self, status: Status) {
        self.action = Action::Stock(status);
    }

    /// A new query whose results go to `handler`.
    pub fn get_query(&self, handler: impl QueryHandler + 'static) -> Query {
        Query {
            sql: Vec::new(),
            handler: Box::new(handler),
        }
    }

    /// Submits `query`; the reply is sent once its handler has run.
    pub fn start_query(&mut self, query: Query) {
        self.action = Action::Query(query);
    }

    /// Whether this process accepts a shutdown request over HTTP.
    pub fn quit_allowed(&self) -> bool {
        self.quit_allowed
    }

    /// Asks the process to shut down gracefully after this reply.
    pub fn request_shutdown(&mut self) {
        self.quit_requested = true;
    }
}
