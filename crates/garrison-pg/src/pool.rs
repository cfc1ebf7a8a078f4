//! The asynchronous connection pool.
//!
//! The pool owns every connection of one worker process. It is driven
//! entirely by the reactor: the worker forwards readiness and timeout events
//! for `Binding::Pg(slot)` handlers to [`PgPool::on_read`],
//! [`PgPool::on_write`] and [`PgPool::on_timeout`], and collects finished
//! queries with [`PgPool::take_completions`].
//!
//! # Sizing
//!
//! ```text
//!   start()      ping, then open size_min connections
//!   query_start  Ready idle connection?      run now
//!                Error connection?           reset it, bind query as pending
//!                below size_max?             open one, bind query as pending
//!                  (open failed)             rejected
//!                otherwise                   overflow queue (FIFO)
//!   on Ready     pending query, else queue head, else maybe shrink
//! ```

use std::time::Duration;

use garrison_reactor::Reactor;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnStatus, PgConnection, PollingStatus};
use crate::conninfo::ConnInfo;
use crate::error::{PgError, PgResult};
use crate::ping::{PingStatus, ping_with_retry};
use crate::query::{Completion, PgQuery, Rejected};
use crate::queue::{OVERFLOW_QUEUE_CAPACITY, OverflowQueue, PushResult};
use crate::result::QueryResult;

/// Sizing and deadline settings of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub size_min: usize,
    pub size_max: usize,
    pub connect_timeout: Duration,
    /// `None` lets a query run for as long as the server needs.
    pub query_timeout: Option<Duration>,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_min: 5,
            size_max: 10,
            connect_timeout: Duration::from_secs(10),
            query_timeout: None,
            queue_capacity: OVERFLOW_QUEUE_CAPACITY,
        }
    }
}

struct Slot<T> {
    conn: PgConnection,
    running: Option<PgQuery<T>>,
    pending: Option<PgQuery<T>>,
}

impl<T> Slot<T> {
    fn is_idle(&self) -> bool {
        self.conn.status() == ConnStatus::Ready && self.running.is_none() && self.pending.is_none()
    }

    fn is_alive(&self) -> bool {
        !matches!(self.conn.status(), ConnStatus::Error)
    }
}

enum Acquire {
    Ready(usize),
    Connecting(usize),
    Saturated,
}

/// Non-blocking PostgreSQL pool, generic over the tag that identifies the
/// owner of each query.
pub struct PgPool<T> {
    info: ConnInfo,
    config: PoolConfig,
    slots: Vec<Option<Slot<T>>>,
    queue: OverflowQueue<PgQuery<T>>,
    completions: Vec<Completion<T>>,
    pinged: bool,
    active: bool,
}

impl<T> PgPool<T> {
    pub fn new(info: ConnInfo, config: PoolConfig) -> Self {
        let queue = OverflowQueue::new(config.queue_capacity.max(1));
        Self {
            info,
            config,
            slots: Vec::new(),
            queue,
            completions: Vec::new(),
            pinged: false,
            active: false,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Connections in any state other than `Error`.
    pub fn size(&self) -> usize {
        self.slots().filter(|s| s.is_alive()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.slots().filter(|s| s.is_idle()).count()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Status of every allocated connection, by slot.
    pub fn statuses(&self) -> Vec<(usize, ConnStatus)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.conn.status())))
            .collect()
    }

    /// Pings the backend and opens `size_min` connections.
    ///
    /// A failing ping is an error. Failing to open a connection only stops
    /// the warm-up; the pool grows lazily on demand afterwards.
    pub fn start(&mut self, reactor: &mut Reactor) -> PgResult<()> {
        self.active = true;
        self.ensure_pinged()?;
        for _ in 0..self.config.size_min {
            if let Err(e) = self.new_connection(reactor) {
                warn!(error = %e, "pool warm-up stopped");
                break;
            }
        }
        info!(
            connections = self.size(),
            size_min = self.config.size_min,
            size_max = self.config.size_max,
            "postgres pool started"
        );
        Ok(())
    }

    /// Closes every connection and fails queries that have not completed.
    pub fn stop(&mut self, reactor: &mut Reactor) {
        self.active = false;
        for slot in std::mem::take(&mut self.slots).into_iter().flatten() {
            let Slot {
                mut conn,
                running,
                pending,
            } = slot;
            conn.close(reactor);
            for query in running.into_iter().chain(pending) {
                self.fail(query, PgError::Stopped);
            }
        }
        for query in self.queue.drain() {
            self.fail(query, PgError::Stopped);
        }
        debug!("postgres pool stopped");
    }

    /// Submits a query.
    ///
    /// The query runs at once on an idle connection, is bound to a
    /// connection being opened, or waits in the overflow queue once the pool
    /// is at `size_max`. It is handed back when the queue is full or a new
    /// connection cannot be opened.
    pub fn query_start(
        &mut self,
        reactor: &mut Reactor,
        query: PgQuery<T>,
    ) -> Result<(), Rejected<T>> {
        if !self.active {
            return Err(Rejected {
                error: PgError::Stopped,
                query,
            });
        }

        match self.get_ready_connection(reactor) {
            Ok(Acquire::Ready(idx)) => {
                self.run_on(reactor, idx, query);
                Ok(())
            }
            Ok(Acquire::Connecting(idx)) => {
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.pending = Some(query);
                }
                Ok(())
            }
            Ok(Acquire::Saturated) => self.enqueue(query),
            Err(error) => {
                debug!(error = %error, size = self.size(), "no connection for query");
                Err(Rejected { error, query })
            }
        }
    }

    /// Queries finished since the last call, in completion order.
    pub fn take_completions(&mut self) -> Vec<Completion<T>> {
        std::mem::take(&mut self.completions)
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    /// Readable event on the connection in `slot`.
    pub fn on_read(&mut self, reactor: &mut Reactor, slot: usize) {
        let Some(status) = self.status_of(slot) else {
            return;
        };
        match status {
            ConnStatus::Connect | ConnStatus::Reset => self.poll_connect(reactor, slot),
            ConnStatus::Busy => self.poll_result(reactor, slot),
            ConnStatus::Ready => {
                let result = match self.slots[slot].as_mut() {
                    Some(s) => s.conn.check_idle(),
                    None => return,
                };
                if let Err(e) = result {
                    self.connection_failed(reactor, slot, e);
                }
            }
            ConnStatus::Error => {}
        }
    }

    /// Writable event on the connection in `slot`.
    pub fn on_write(&mut self, reactor: &mut Reactor, slot: usize) {
        let Some(status) = self.status_of(slot) else {
            return;
        };
        match status {
            ConnStatus::Connect | ConnStatus::Reset => self.poll_connect(reactor, slot),
            ConnStatus::Busy | ConnStatus::Ready => {
                let result = match self.slots[slot].as_mut() {
                    Some(s) => s.conn.flush(reactor),
                    None => return,
                };
                if let Err(e) = result {
                    self.connection_failed(reactor, slot, e);
                }
            }
            ConnStatus::Error => {}
        }
    }

    /// Deadline passed on the connection in `slot`.
    pub fn on_timeout(&mut self, reactor: &mut Reactor, slot: usize) {
        match self.status_of(slot) {
            Some(ConnStatus::Connect | ConnStatus::Reset) => {
                self.connection_failed(reactor, slot, PgError::Timeout("connecting"));
            }
            Some(ConnStatus::Busy) => {
                self.connection_failed(reactor, slot, PgError::Timeout("waiting for query result"));
            }
            _ => {}
        }
    }

    fn slots(&self) -> impl Iterator<Item = &Slot<T>> {
        self.slots.iter().flatten()
    }

    fn status_of(&self, slot: usize) -> Option<ConnStatus> {
        self.slots.get(slot)?.as_ref().map(|s| s.conn.status())
    }

    /// Pings once, before the very first connection attempt, whatever the
    /// outcome. The ping blocks; later failures go through
    /// `connection_failed` and never stall the reactor.
    fn ensure_pinged(&mut self) -> PgResult<()> {
        if self.pinged {
            return Ok(());
        }
        self.pinged = true;
        let status = ping_with_retry(&self.info);
        if status != PingStatus::Ok {
            error!(host = %self.info.host, port = self.info.port, "{}", status.message());
            return Err(PgError::Ping { status });
        }
        Ok(())
    }

    fn get_ready_connection(&mut self, reactor: &mut Reactor) -> PgResult<Acquire> {
        if let Some(idx) = self.slots.iter().position(|s| s.as_ref().is_some_and(Slot::is_idle)) {
            return Ok(Acquire::Ready(idx));
        }

        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            if slot.conn.status() != ConnStatus::Error {
                continue;
            }
            match slot.conn.reset_start(reactor, self.config.connect_timeout) {
                Ok(()) => return Ok(Acquire::Connecting(idx)),
                Err(e) => {
                    warn!(slot = idx, error = %e, "connection reset failed");
                    slot.conn.close(reactor);
                    slot.conn.set_status(ConnStatus::Error);
                }
            }
        }

        let allocated = self.slots.iter().filter(|s| s.is_some()).count();
        if allocated < self.config.size_max {
            return self.new_connection(reactor).map(Acquire::Connecting);
        }
        Ok(Acquire::Saturated)
    }

    fn new_connection(&mut self, reactor: &mut Reactor) -> PgResult<usize> {
        self.ensure_pinged()?;

        let idx = match self.slots.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let mut conn = PgConnection::new(self.info.clone(), idx);
        if let Err(e) = conn.connect_start(reactor, self.config.connect_timeout) {
            conn.close(reactor);
            return Err(e);
        }
        self.slots[idx] = Some(Slot {
            conn,
            running: None,
            pending: None,
        });
        debug!(slot = idx, "connection allocated");
        Ok(idx)
    }

    fn enqueue(&mut self, query: PgQuery<T>) -> Result<(), Rejected<T>> {
        match self.queue.try_push(query) {
            PushResult::Ok => Ok(()),
            PushResult::Full(query) => {
                error!(capacity = self.queue.capacity(), "{}", PgError::QueueFull);
                Err(Rejected {
                    error: PgError::QueueFull,
                    query,
                })
            }
        }
    }

    fn poll_connect(&mut self, reactor: &mut Reactor, idx: usize) {
        let result = match self.slots[idx].as_mut() {
            Some(s) => s.conn.connect_poll(reactor),
            None => return,
        };
        match result {
            Ok(PollingStatus::Ok) => {
                if let Some(s) = self.slots[idx].as_mut() {
                    s.conn.set_status(ConnStatus::Ready);
                }
                self.connection_ready(reactor, idx);
            }
            Ok(PollingStatus::Reading | PollingStatus::Writing) => {}
            Err(e) => self.connection_failed(reactor, idx, e),
        }
    }

    fn poll_result(&mut self, reactor: &mut Reactor, idx: usize) {
        let result = match self.slots[idx].as_mut() {
            Some(s) => s.conn.check_result(reactor),
            None => return,
        };
        match result {
            Ok(true) => {
                let Some(slot) = self.slots[idx].as_mut() else {
                    return;
                };
                slot.conn.set_status(ConnStatus::Ready);
                let results = slot.conn.take_results();
                let peer_closed = slot.conn.peer_closed();
                if let Some(query) = slot.running.take() {
                    self.completions.push(Completion {
                        tag: query.tag,
                        outcome: check_results(results),
                    });
                }
                if peer_closed {
                    self.connection_failed(reactor, idx, PgError::ConnectionLost);
                } else {
                    self.connection_ready(reactor, idx);
                }
            }
            Ok(false) => {}
            Err(e) => self.connection_failed(reactor, idx, e),
        }
    }

    /// The connection in `idx` just turned `Ready`: its own pending query
    /// first, then the queue head.
    fn connection_ready(&mut self, reactor: &mut Reactor, idx: usize) {
        let next = match self.slots[idx].as_mut() {
            Some(slot) => slot.pending.take(),
            None => return,
        };
        match next.or_else(|| self.queue.pop()) {
            Some(query) => self.run_on(reactor, idx, query),
            None => self.maybe_shrink(reactor, idx),
        }
    }

    fn run_on(&mut self, reactor: &mut Reactor, idx: usize, query: PgQuery<T>) {
        let text = query.text();
        let timeout = self.config.query_timeout;
        let Some(slot) = self.slots[idx].as_mut() else {
            self.fail(query, PgError::ConnectionLost);
            return;
        };
        slot.running = Some(query);
        if let Err(e) = slot.conn.send_query(reactor, &text, timeout) {
            self.connection_failed(reactor, idx, e);
        }
    }

    fn maybe_shrink(&mut self, reactor: &mut Reactor, idx: usize) {
        if self.size() <= self.config.size_min {
            return;
        }
        let other_idle = self
            .slots
            .iter()
            .enumerate()
            .any(|(i, s)| i != idx && s.as_ref().is_some_and(Slot::is_idle));
        if !other_idle {
            return;
        }
        if let Some(mut slot) = self.slots[idx].take() {
            slot.conn.close(reactor);
            debug!(slot = idx, size = self.size(), "idle connection closed");
        }
    }

    fn connection_failed(&mut self, reactor: &mut Reactor, idx: usize, error: PgError) {
        let Some(slot) = self.slots[idx].as_mut() else {
            return;
        };
        let growing = slot.conn.status() == ConnStatus::Connect;
        warn!(slot = idx, status = ?slot.conn.status(), error = %error, "connection failed");

        slot.conn.close(reactor);
        slot.conn.set_status(ConnStatus::Error);
        let orphans: Vec<PgQuery<T>> = slot.running.take().into_iter().chain(slot.pending.take()).collect();
        if growing {
            self.slots[idx] = None;
        }

        let message = error.to_string();
        let mut error = Some(error);
        for query in orphans {
            let e = error
                .take()
                .unwrap_or_else(|| PgError::Connection(message.clone()));
            self.fail(query, e);
        }

        if self.size() == 0 && !self.queue.is_empty() {
            warn!(queued = self.queue.len(), "no connection left, failing queued queries");
            for query in self.queue.drain() {
                self.fail(query, PgError::Connection(message.clone()));
            }
        }
    }

    fn fail(&mut self, query: PgQuery<T>, error: PgError) {
        self.completions.push(Completion {
            tag: query.tag,
            outcome: Err(error),
        });
    }
}

/// Every result of a batch must be in the success class.
fn check_results(results: Vec<QueryResult>) -> Result<Vec<QueryResult>, PgError> {
    if let Some(bad) = results.iter().find(|r| !r.status.is_success()) {
        return Err(match &bad.error {
            Some(db) => PgError::Query {
                sqlstate: db.code.clone(),
                message: db.message.clone(),
            },
            None => PgError::UnexpectedStatus(bad.status.to_string()),
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{DbError, ResultStatus};

    #[test]
    fn test_check_results_accepts_tuples() {
        let results = vec![
            QueryResult::new(ResultStatus::TuplesOk),
            QueryResult::new(ResultStatus::SingleTuple),
        ];
        assert_eq!(check_results(results).map(|r| r.len()).ok(), Some(2));
    }

    #[test]
    fn test_check_results_reports_server_error() {
        let mut failed = QueryResult::new(ResultStatus::FatalError);
        failed.error = Some(DbError {
            severity: "ERROR".to_string(),
            code: "42P01".to_string(),
            message: "relation \"nope\" does not exist".to_string(),
            detail: None,
        });
        let results = vec![QueryResult::new(ResultStatus::TuplesOk), failed];
        match check_results(results) {
            Err(PgError::Query { sqlstate, .. }) => assert_eq!(sqlstate, "42P01"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_check_results_command_ok_is_unexpected() {
        let results = vec![QueryResult::new(ResultStatus::CommandOk)];
        match check_results(results) {
            Err(PgError::UnexpectedStatus(status)) => assert_eq!(status, "PGRES_COMMAND_OK"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_query_rejected_when_not_started() {
        let mut reactor = Reactor::new(16).expect("reactor");
        let mut pool: PgPool<u8> = PgPool::new(ConnInfo::default(), PoolConfig::default());
        let rejected = pool
            .query_start(&mut reactor, PgQuery::new("select 1", 9))
            .expect_err("inactive pool must reject");
        assert!(matches!(rejected.error, PgError::Stopped));
        assert_eq!(rejected.query.tag, 9);
    }
}
