//! A worker's event loop state: the HTTP server plus its database pool.

use garrison_config::{GarrisonConfig, PostgresConfig};
use garrison_pg::{ConnInfo, PgPool, PoolConfig};
use garrison_reactor::{Binding, EventSink, Reactor, Token};
use tracing::{debug, error, info};

use crate::error::ServerResult;
use crate::modules::ApiModule;
use crate::server::{HttpServer, ServerSettings, WorkerPool};

/// Everything a worker process drives from its reactor.
pub struct Runtime {
    pub server: HttpServer,
    pub pool: Option<WorkerPool>,
}

impl Runtime {
    pub fn new(server: HttpServer, pool: Option<WorkerPool>) -> Self {
        Self { server, pool }
    }

    /// Builds the runtime described by `config`, with the bundled modules.
    pub fn from_config(config: &GarrisonConfig, quit_allowed: bool) -> ServerResult<Self> {
        let settings = ServerSettings::from_config(&config.server, quit_allowed);
        let mut server = HttpServer::new(settings);
        server.add_module(Box::new(ApiModule::new(config.server.keep_alive)));

        let pool = if config.postgres.enabled {
            Some(build_pool(&config.postgres)?)
        } else {
            None
        };
        Ok(Self::new(server, pool))
    }

    /// Opens the pool's initial connections. A database that cannot be
    /// reached is logged; queries then fail until it comes back.
    pub fn start(&mut self, reactor: &mut Reactor) {
        if let Some(pool) = self.pool.as_mut() {
            match pool.start(reactor) {
                Ok(()) => info!(size = pool.size(), "database pool started"),
                Err(e) => error!(error = %e, "database pool failed to start"),
            }
        }
    }

    /// `true` once no client connection is left.
    pub fn is_idle(&self) -> bool {
        self.server.connection_count() == 0
    }

    /// Returns and clears a shutdown request raised over HTTP.
    pub fn take_quit_request(&mut self) -> bool {
        self.server.take_quit_request()
    }

    /// Starts a graceful shutdown. See [`HttpServer::drain`].
    pub fn drain(&mut self, reactor: &mut Reactor) {
        self.server.drain(reactor);
    }

    /// Stops accepting, closes every connection and stops the pool.
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        self.server.stop_accepting(reactor);
        self.server.close_all(reactor);
        if let Some(pool) = self.pool.as_mut() {
            pool.stop(reactor);
            let dropped = pool.take_completions().len();
            if dropped > 0 {
                debug!(dropped, "completions dropped at shutdown");
            }
        }
    }

    /// Hands finished queries to their connections.
    fn drain_completions(&mut self, reactor: &mut Reactor) {
        loop {
            let Some(pool) = self.pool.as_mut() else {
                return;
            };
            if !pool.has_completions() {
                return;
            }
            for completion in pool.take_completions() {
                self.server.complete(reactor, completion, self.pool.as_mut());
            }
        }
    }

    pub fn on_accept(&mut self, reactor: &mut Reactor) {
        self.server.accept(reactor);
    }

    pub fn on_read(&mut self, reactor: &mut Reactor, binding: Binding) {
        match binding {
            Binding::Http(index) => self.server.on_readable(reactor, index, self.pool.as_mut()),
            Binding::Pg(slot) => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.on_read(reactor, slot);
                }
            }
            Binding::Listener | Binding::Signals => {}
        }
        self.drain_completions(reactor);
    }

    pub fn on_write(&mut self, reactor: &mut Reactor, binding: Binding) {
        match binding {
            Binding::Http(index) => self.server.on_writable(reactor, index, self.pool.as_mut()),
            Binding::Pg(slot) => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.on_write(reactor, slot);
                }
            }
            Binding::Listener | Binding::Signals => {}
        }
        self.drain_completions(reactor);
    }

    pub fn on_timeout(&mut self, reactor: &mut Reactor, binding: Binding) {
        match binding {
            Binding::Http(index) => self.server.on_timeout(reactor, index),
            Binding::Pg(slot) => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.on_timeout(reactor, slot);
                }
            }
            Binding::Listener | Binding::Signals => {}
        }
        self.drain_completions(reactor);
    }
}

impl EventSink for Runtime {
    fn on_accept(&mut self, reactor: &mut Reactor, _token: Token) {
        Runtime::on_accept(self, reactor);
    }

    fn on_read(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        Runtime::on_read(self, reactor, binding);
    }

    fn on_write(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        Runtime::on_write(self, reactor, binding);
    }

    fn on_timeout(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        Runtime::on_timeout(self, reactor, binding);
    }
}

/// Creates the pool described by `config` without connecting it.
pub fn build_pool(config: &PostgresConfig) -> ServerResult<WorkerPool> {
    let info = ConnInfo::parse(&config.conninfo_string())?;
    let pool_config = PoolConfig {
        size_min: config.size_min,
        size_max: config.size_max,
        connect_timeout: config.connect_timeout(),
        query_timeout: config.query_timeout(),
        ..PoolConfig::default()
    };
    Ok(PgPool::new(info, pool_config))
}
