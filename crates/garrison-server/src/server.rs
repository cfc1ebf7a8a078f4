//! The HTTP side of a worker: accepting, parsing, module dispatch and reply
//! delivery.

use std::io;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use garrison_config::ServerConfig;
use garrison_http::{ParseResult, Reply, Status};
use garrison_pg::{Completion, PgError, PgPool, PgQuery};
use garrison_reactor::{Binding, Interest, Reactor, Token};
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, trace, warn};

use crate::access_log;
use crate::buffer_pool::BufferPool;
use crate::connection::{ConnKey, ConnStatus, HttpConnection};
use crate::error::ServerResult;
use crate::module::{Action, Module, ModuleContext, Query, QueryHandler};

/// A query in flight on behalf of an HTTP connection.
pub struct PendingQuery {
    pub conn: ConnKey,
    pub(crate) handler: Box<dyn QueryHandler>,
}

impl std::fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQuery").field("conn", &self.conn).finish_non_exhaustive()
    }
}

/// The pool type a worker runs.
pub type WorkerPool = PgPool<PendingQuery>;

/// Per-server settings derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub name: String,
    /// Idle and request timeout. Zero disables it.
    pub timeout: Duration,
    pub keep_alive: bool,
    /// Whether `/quit` may stop this process.
    pub quit_allowed: bool,
}

impl ServerSettings {
    pub fn from_config(config: &ServerConfig, quit_allowed: bool) -> Self {
        Self {
            name: config.name.clone(),
            timeout: config.timeout(),
            keep_alive: config.keep_alive,
            quit_allowed,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default(), false)
    }
}

/// Accepts connections and drives them through the request/reply cycle.
pub struct HttpServer {
    settings: ServerSettings,
    listener: Option<(TcpListener, Token)>,
    connections: Vec<Option<HttpConnection>>,
    next_generation: u64,
    modules: Vec<Box<dyn Module>>,
    buffers: BufferPool,
    quit_requested: bool,
    /// Set by [`HttpServer::drain`]: every reply closes its connection.
    draining: bool,
}

impl HttpServer {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            listener: None,
            connections: Vec::new(),
            next_generation: 0,
            modules: Vec::new(),
            buffers: BufferPool::default(),
            quit_requested: false,
            draining: false,
        }
    }

    /// Appends a module. Modules are consulted in the order they were added.
    pub fn add_module(&mut self, module: Box<dyn Module>) -> &mut Self {
        debug!(module = module.name(), "module added");
        self.modules.push(module);
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Starts accepting on `listener`, which must already be bound.
    pub fn listen(&mut self, reactor: &mut Reactor, listener: std::net::TcpListener) -> ServerResult<()> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        let token = reactor.register(&mut listener, Interest::READABLE, Binding::Listener)?;
        self.listener = Some((listener, token));
        Ok(())
    }

    /// Address of the listening socket, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn is_accepting(&self) -> bool {
        self.listener.is_some()
    }

    /// Stops accepting new connections. Open connections are kept.
    pub fn stop_accepting(&mut self, reactor: &mut Reactor) {
        if let Some((mut listener, token)) = self.listener.take() {
            if let Err(e) = reactor.deregister(&mut listener, token) {
                warn!(error = %e, "failed to deregister listener");
            }
            debug!("stopped accepting");
        }
    }

    /// Graceful shutdown: stops accepting and closes connections that sit
    /// between requests. Connections with a request in flight are closed once
    /// their reply is written.
    pub fn drain(&mut self, reactor: &mut Reactor) {
        self.stop_accepting(reactor);
        self.draining = true;
        let idle: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().filter(|c| c.is_between_requests()).map(|_| i))
            .collect();
        for &index in &idle {
            self.close(reactor, index);
        }
        debug!(closed = idle.len(), remaining = self.connection_count(), "draining connections");
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    /// Returns and clears the shutdown request raised by a module.
    pub fn take_quit_request(&mut self) -> bool {
        std::mem::take(&mut self.quit_requested)
    }

    /// Accepts every pending connection on the listener.
    pub fn accept(&mut self, reactor: &mut Reactor) {
        loop {
            let Some((listener, _)) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.add_connection(reactor, stream, peer) {
                        warn!(peer = %peer, error = %e, "failed to register connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn add_connection(
        &mut self,
        reactor: &mut Reactor,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> ServerResult<()> {
        let index = self
            .connections
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.connections.push(None);
                self.connections.len() - 1
            });

        let token = reactor.register(&mut stream, Interest::READABLE, Binding::Http(index))?;
        reactor.set_timeout(token, self.settings.timeout)?;

        self.next_generation += 1;
        let key = ConnKey {
            index,
            generation: self.next_generation,
        };
        let conn = HttpConnection::new(key, token, stream, peer, self.buffers.get(), self.buffers.get());
        self.connections[index] = Some(conn);
        trace!(index, peer = %peer, "accepted");
        Ok(())
    }

    /// Readable event on connection `index`.
    pub fn on_readable(&mut self, reactor: &mut Reactor, index: usize, pool: Option<&mut WorkerPool>) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        conn.touch();
        match conn.read() {
            Ok(true) => {}
            Ok(false) => {
                trace!(index, "peer closed");
                self.process_input(reactor, index, pool);
                if self.conn_mut(index).is_some_and(|c| c.is_waiting()) {
                    self.close(reactor, index);
                }
                return;
            }
            Err(e) => {
                debug!(index, error = %e, "read failed");
                self.close(reactor, index);
                return;
            }
        }
        self.process_input(reactor, index, pool);
    }

    /// Writable event on connection `index`.
    pub fn on_writable(&mut self, reactor: &mut Reactor, index: usize, pool: Option<&mut WorkerPool>) {
        if self.conn_mut(index).is_none() {
            return;
        }
        self.flush(reactor, index);
        self.process_input(reactor, index, pool);
    }

    /// The deadline of connection `index` passed.
    ///
    /// A request still waiting for its module gets a 504; anything else is
    /// simply closed.
    pub fn on_timeout(&mut self, reactor: &mut Reactor, index: usize) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        if conn.status == ConnStatus::RequestOk {
            debug!(index, uri = %conn.request.uri, "request timed out");
            self.send_stock(reactor, index, Status::GatewayTimeout);
        } else {
            trace!(index, status = ?conn.status, "idle timeout");
            self.close(reactor, index);
        }
    }

    /// Delivers the outcome of a query to the connection that started it.
    ///
    /// Completions for connections that were closed, reused, or already
    /// answered (for instance by a 504) are discarded.
    pub fn complete(
        &mut self,
        reactor: &mut Reactor,
        completion: Completion<PendingQuery>,
        pool: Option<&mut WorkerPool>,
    ) {
        let Completion {
            tag: PendingQuery { conn: key, mut handler },
            outcome,
        } = completion;

        let Some(conn) = self
            .connections
            .get_mut(key.index)
            .and_then(Option::as_mut)
            .filter(|c| c.key == key && c.status == ConnStatus::RequestOk)
        else {
            debug!(index = key.index, generation = key.generation, "query result discarded");
            return;
        };

        let failed = match outcome {
            Ok(results) => {
                match handler.on_executed(&conn.request, &mut conn.reply, &results) {
                    Ok(()) => false,
                    Err(e) => {
                        error!(uri = %conn.request.uri, error = %e, "query handler failed");
                        true
                    }
                }
            }
            Err(e) => {
                handler.on_exception(&conn.request, &mut conn.reply, &e);
                false
            }
        };

        if failed {
            self.send_stock(reactor, key.index, Status::InternalServerError);
        } else {
            self.send_reply(reactor, key.index);
        }
        self.process_input(reactor, key.index, pool);
    }

    /// Closes every client connection.
    pub fn close_all(&mut self, reactor: &mut Reactor) {
        for index in 0..self.connections.len() {
            self.close(reactor, index);
        }
    }

    /// Closes connection `index` and recycles its buffers.
    pub fn close(&mut self, reactor: &mut Reactor, index: usize) {
        let Some(mut conn) = self.connections.get_mut(index).and_then(Option::take) else {
            return;
        };
        if let Err(e) = reactor.deregister(&mut conn.stream, conn.token) {
            debug!(index, error = %e, "deregister failed");
        }
        trace!(index, peer = %conn.peer, "closed");
        let (read_buf, write_buf) = conn.into_buffers();
        self.buffers.put(read_buf);
        self.buffers.put(write_buf);
    }

    fn conn_mut(&mut self, index: usize) -> Option<&mut HttpConnection> {
        self.connections.get_mut(index).and_then(Option::as_mut)
    }

    /// Parses buffered input and dispatches every complete request, one at a
    /// time, for as long as replies go out synchronously.
    fn process_input(&mut self, reactor: &mut Reactor, index: usize, mut pool: Option<&mut WorkerPool>) {
        let timeout = self.settings.timeout;
        loop {
            let Some(conn) = self.conn_mut(index) else {
                return;
            };
            if !matches!(conn.status, ConnStatus::Connected | ConnStatus::WaitRequest)
                || !conn.has_pending_input()
            {
                return;
            }

            match conn.parse_input() {
                ParseResult::NeedMore => return,
                ParseResult::Error => {
                    debug!(index, "malformed request");
                    self.send_stock(reactor, index, Status::BadRequest);
                }
                ParseResult::Complete => {
                    if let Err(e) = reactor.set_timeout(conn.token, timeout) {
                        debug!(index, error = %e, "failed to arm request timeout");
                    }
                    self.dispatch(reactor, index, pool.as_deref_mut());
                }
            }
        }
    }

    fn dispatch(&mut self, reactor: &mut Reactor, index: usize, pool: Option<&mut WorkerPool>) {
        let Some(conn) = self.connections.get_mut(index).and_then(Option::as_mut) else {
            return;
        };

        conn.reply.server_name.clone_from(&self.settings.name);
        conn.reply.close_connection =
            self.draining || conn.peer_closed || !(self.settings.keep_alive && conn.request.keep_alive());

        let Some(module) = self.modules.iter_mut().find(|m| m.check(&conn.request)) else {
            debug!(uri = %conn.request.uri, "no module for request");
            self.send_stock(reactor, index, Status::Forbidden);
            return;
        };

        let mut ctx = ModuleContext::new(
            &conn.request,
            &mut conn.reply,
            conn.peer,
            self.settings.quit_allowed,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| module.execute(&mut ctx)));
        let mut action = std::mem::replace(&mut ctx.action, Action::Deferred);
        self.quit_requested |= ctx.quit_requested;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(module = module.name(), uri = %conn.request.uri, error = %e, "module failed");
                action = Action::Stock(Status::InternalServerError);
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(module = module.name(), uri = %conn.request.uri, panic = %message, "module panicked");
                action = Action::Stock(Status::InternalServerError);
            }
        }

        match action {
            Action::Reply => self.send_reply(reactor, index),
            Action::Stock(status) => self.send_stock(reactor, index, status),
            Action::Query(query) => self.start_query(reactor, index, query, pool),
            Action::Deferred => trace!(index, "reply deferred"),
        }
    }

    fn start_query(
        &mut self,
        reactor: &mut Reactor,
        index: usize,
        query: Query,
        pool: Option<&mut WorkerPool>,
    ) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        let Query { sql, handler } = query;
        let tag = PendingQuery {
            conn: conn.key,
            handler,
        };

        let (error, mut tag) = match pool {
            Some(pool) => match pool.query_start(reactor, PgQuery::batch(sql, tag)) {
                Ok(()) => return,
                Err(rejected) => (rejected.error, rejected.query.tag),
            },
            None => (PgError::Stopped, tag),
        };

        if let Some(conn) = self.conn_mut(index) {
            tag.handler.on_exception(&conn.request, &mut conn.reply, &error);
        }
        self.send_reply(reactor, index);
    }

    fn send_stock(&mut self, reactor: &mut Reactor, index: usize, status: Status) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        let allowed = std::mem::take(&mut conn.reply.allowed_methods);
        let mut reply = Reply::stock(status, &conn.reply.server_name, conn.request.wants_json());
        if !allowed.is_empty() {
            reply.allowed_methods = allowed;
        }
        conn.reply = reply;
        self.send_reply(reactor, index);
    }

    fn send_reply(&mut self, reactor: &mut Reactor, index: usize) {
        let timeout = self.settings.timeout;
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        conn.queue_reply();
        if let Err(e) = reactor.set_timeout(conn.token, timeout) {
            debug!(index, error = %e, "failed to arm write timeout");
        }
        self.flush(reactor, index);
    }

    fn flush(&mut self, reactor: &mut Reactor, index: usize) {
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        match conn.write() {
            Ok(true) if conn.status == ConnStatus::ReplyReady => self.finish_reply(reactor, index),
            Ok(_) => {
                let interest = conn.interest();
                if let Err(e) = reactor.reregister(&mut conn.stream, conn.token, interest) {
                    debug!(index, error = %e, "reregister failed");
                    self.close(reactor, index);
                }
            }
            Err(e) => {
                debug!(index, error = %e, "write failed");
                self.close(reactor, index);
            }
        }
    }

    fn finish_reply(&mut self, reactor: &mut Reactor, index: usize) {
        let timeout = self.settings.timeout;
        let draining = self.draining;
        let Some(conn) = self.conn_mut(index) else {
            return;
        };
        conn.status = ConnStatus::ReplySent;
        access_log::log_request(conn.peer, &conn.request, conn.reply.status, conn.reply_size);

        if conn.close_after_reply || draining || (conn.peer_closed && !conn.has_pending_input()) {
            self.close(reactor, index);
            return;
        }

        conn.reset();
        let interest = conn.interest();
        let rearmed = reactor
            .reregister(&mut conn.stream, conn.token, interest)
            .and_then(|()| reactor.set_timeout(conn.token, timeout));
        if let Err(e) = rearmed {
            debug!(index, error = %e, "failed to rearm connection");
            self.close(reactor, index);
        }
    }
}
