//! One non-blocking backend connection and its polling state machine.
//!
//! Connection establishment follows libpq's model: [`PgConnection::connect_start`]
//! opens the socket without blocking, and [`PgConnection::connect_poll`] is
//! called on every readiness event until it reports [`PollingStatus::Ok`].
//! Queries use the simple query protocol; every statement in the batch yields
//! one [`QueryResult`].

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use garrison_reactor::{Binding, Interest, Reactor, Token};
use postgres_protocol::authentication::{
    self,
    sasl::{ChannelBinding, SCRAM_SHA_256, ScramSha256},
};
use postgres_protocol::message::backend::{ErrorResponseBody, Message};
use postgres_protocol::message::frontend;
use tracing::{debug, trace, warn};

use crate::conninfo::ConnInfo;
use crate::error::{PgError, PgResult};
use crate::result::{DbError, QueryResult, ResultStatus};
use crate::stream::PgStream;

const READ_CHUNK: usize = 8 * 1024;

/// Pool-visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Establishing a fresh connection.
    Connect,
    /// Re-establishing a connection that failed.
    Reset,
    /// Idle and able to take a query.
    Ready,
    /// A query is in flight.
    Busy,
    /// Unusable until reset.
    Error,
}

/// Progress reported by [`PgConnection::connect_poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Waiting for the socket to become readable.
    Reading,
    /// Waiting for the socket to become writable.
    Writing,
    /// The connection is established and idle.
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Connecting,
    Startup,
    Open,
}

/// A single PostgreSQL connection bound to a reactor slot.
pub struct PgConnection {
    info: ConnInfo,
    slot: usize,
    stream: Option<PgStream>,
    token: Option<Token>,
    status: ConnStatus,
    phase: Phase,
    read_buf: BytesMut,
    write_buf: BytesMut,
    scram: Option<ScramSha256>,
    current: Option<QueryResult>,
    results: Vec<QueryResult>,
    query_done: bool,
    peer_closed: bool,
    backend_pid: Option<i32>,
    server_params: Vec<(String, String)>,
    started_at: Option<Instant>,
}

impl PgConnection {
    pub fn new(info: ConnInfo, slot: usize) -> Self {
        Self {
            info,
            slot,
            stream: None,
            token: None,
            status: ConnStatus::Connect,
            phase: Phase::Closed,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(1024),
            scram: None,
            current: None,
            results: Vec::new(),
            query_done: true,
            peer_closed: false,
            backend_pid: None,
            server_params: Vec::new(),
            started_at: None,
        }
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ConnStatus) {
        self.status = status;
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn backend_pid(&self) -> Option<i32> {
        self.backend_pid
    }

    /// A server parameter reported during startup (`server_version`, ...).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `true` while the socket is open and the handshake has finished.
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Open && !self.peer_closed
    }

    /// `true` once the server has closed its end of the socket.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Starts a fresh non-blocking connection.
    pub fn connect_start(&mut self, reactor: &mut Reactor, timeout: Duration) -> PgResult<()> {
        self.open(reactor, timeout)?;
        self.status = ConnStatus::Connect;
        Ok(())
    }

    /// Drops the current socket and starts over, keeping this slot.
    pub fn reset_start(&mut self, reactor: &mut Reactor, timeout: Duration) -> PgResult<()> {
        self.close(reactor);
        self.open(reactor, timeout)?;
        self.status = ConnStatus::Reset;
        Ok(())
    }

    fn open(&mut self, reactor: &mut Reactor, timeout: Duration) -> PgResult<()> {
        let mut stream = PgStream::connect(&self.info)
            .map_err(|e| PgError::Connection(format!("{}: {e}", self.info)))?;
        let token = reactor.register(
            &mut stream,
            Interest::READABLE | Interest::WRITABLE,
            Binding::Pg(self.slot),
        )?;
        reactor.set_timeout(token, timeout)?;

        self.stream = Some(stream);
        self.token = Some(token);
        self.phase = Phase::Connecting;
        self.read_buf.clear();
        self.write_buf.clear();
        self.scram = None;
        self.peer_closed = false;
        self.backend_pid = None;
        self.server_params.clear();
        self.started_at = Some(Instant::now());
        debug!(slot = self.slot, "connecting to {}", self.info);
        Ok(())
    }

    /// Advances connection establishment. Call on every readiness event
    /// while the status is `Connect` or `Reset`.
    pub fn connect_poll(&mut self, reactor: &mut Reactor) -> PgResult<PollingStatus> {
        if self.phase == Phase::Connecting {
            let stream = self.stream.as_ref().ok_or(PgError::ConnectionLost)?;
            if !stream
                .check_connected()
                .map_err(|e| PgError::Connection(format!("{}: {e}", self.info)))?
            {
                return Ok(PollingStatus::Writing);
            }
            frontend::startup_message(self.info.startup_params(), &mut self.write_buf)?;
            self.phase = Phase::Startup;
        }

        self.write_pending()?;
        let open = self.read_pending()?;
        self.process_startup()?;
        self.write_pending()?;

        if self.phase == Phase::Open {
            self.update_interest(reactor)?;
            if let Some(token) = self.token {
                reactor.set_deadline(token, None)?;
            }
            debug!(
                slot = self.slot,
                backend_pid = ?self.backend_pid,
                elapsed_ms = self.started_at.map(|t| t.elapsed().as_millis()),
                "connection established"
            );
            return Ok(PollingStatus::Ok);
        }
        if !open {
            return Err(PgError::Connection(
                "server closed the connection unexpectedly".to_string(),
            ));
        }

        self.update_interest(reactor)?;
        Ok(if self.write_buf.is_empty() {
            PollingStatus::Reading
        } else {
            PollingStatus::Writing
        })
    }

    /// Sends a batch of statements and marks the connection `Busy`.
    pub fn send_query(
        &mut self,
        reactor: &mut Reactor,
        sql: &str,
        timeout: Option<Duration>,
    ) -> PgResult<()> {
        if self.phase != Phase::Open {
            return Err(PgError::ConnectionLost);
        }
        frontend::query(sql, &mut self.write_buf)?;
        self.results.clear();
        self.current = None;
        self.query_done = false;
        self.status = ConnStatus::Busy;
        trace!(slot = self.slot, sql, "query sent");

        if let (Some(token), Some(timeout)) = (self.token, timeout) {
            reactor.set_timeout(token, timeout)?;
        }
        self.flush(reactor)?;
        Ok(())
    }

    /// Reads whatever the server sent and collects results.
    ///
    /// Returns `true` once every result of the batch has been drained and
    /// the server is idle again.
    pub fn check_result(&mut self, reactor: &mut Reactor) -> PgResult<bool> {
        let open = self.read_pending()?;
        self.process_query()?;
        self.flush(reactor)?;

        if self.query_done {
            if let Some(token) = self.token {
                reactor.set_deadline(token, None)?;
            }
            return Ok(true);
        }
        if !open {
            return Err(PgError::ConnectionLost);
        }
        Ok(false)
    }

    /// Handles a readable event on an idle connection. An idle backend
    /// only speaks up to report notices or that it is going away.
    pub fn check_idle(&mut self) -> PgResult<()> {
        let open = self.read_pending()?;
        self.process_query()?;
        if !open {
            return Err(PgError::ConnectionLost);
        }
        if let Some(error) = self.results.pop() {
            return Err(PgError::Connection(
                error.error_message().unwrap_or("unexpected error").to_string(),
            ));
        }
        Ok(())
    }

    /// Results collected for the finished batch.
    pub fn take_results(&mut self) -> Vec<QueryResult> {
        std::mem::take(&mut self.results)
    }

    /// Writes buffered output. Returns `true` when nothing is left to send.
    pub fn flush(&mut self, reactor: &mut Reactor) -> PgResult<bool> {
        self.write_pending()?;
        self.update_interest(reactor)?;
        Ok(self.write_buf.is_empty())
    }

    /// Sends `Terminate` if possible and releases the socket.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(mut stream) = self.stream.take() {
            if self.phase == Phase::Open {
                let mut bye = BytesMut::new();
                frontend::terminate(&mut bye);
                let _ = stream.write(&bye);
            }
            if let Some(token) = self.token.take() {
                if let Err(e) = reactor.deregister(&mut stream, token) {
                    warn!(slot = self.slot, error = %e, "deregister failed");
                }
            }
        }
        self.phase = Phase::Closed;
        self.query_done = true;
        self.current = None;
    }

    fn update_interest(&mut self, reactor: &mut Reactor) -> PgResult<()> {
        let (Some(stream), Some(token)) = (self.stream.as_mut(), self.token) else {
            return Ok(());
        };
        let interest = if self.write_buf.is_empty() && self.phase != Phase::Connecting {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        reactor.reregister(stream, token, interest)?;
        Ok(())
    }

    /// Reads until the socket would block. Returns `false` on EOF.
    fn read_pending(&mut self) -> PgResult<bool> {
        let stream = self.stream.as_mut().ok_or(PgError::ConnectionLost)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(false);
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_pending(&mut self) -> PgResult<()> {
        let stream = self.stream.as_mut().ok_or(PgError::ConnectionLost)?;
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(PgError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    )));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn process_startup(&mut self) -> PgResult<()> {
        while self.phase == Phase::Startup {
            let Some(message) = Message::parse(&mut self.read_buf)? else {
                break;
            };
            match message {
                Message::AuthenticationOk => trace!(slot = self.slot, "authenticated"),
                Message::AuthenticationCleartextPassword => {
                    let password = required_password(&self.info)?;
                    frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = required_password(&self.info)?;
                    let hash = authentication::md5_hash(
                        self.info.user.as_bytes(),
                        password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut offered = false;
                    let mut mechanisms = body.mechanisms();
                    while let Some(mechanism) = mechanisms.next()? {
                        offered |= mechanism == SCRAM_SHA_256;
                    }
                    if !offered {
                        return Err(PgError::Connection(
                            "server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    let password = required_password(&self.info)?;
                    let scram = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());
                    frontend::sasl_initial_response(SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
                    self.scram = Some(scram);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let scram = self.scram.as_mut().ok_or_else(|| {
                        PgError::Protocol("unexpected SASL continuation".to_string())
                    })?;
                    scram.update(body.data())?;
                    frontend::sasl_response(scram.message(), &mut self.write_buf)?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let mut scram = self.scram.take().ok_or_else(|| {
                        PgError::Protocol("unexpected SASL final message".to_string())
                    })?;
                    scram.finish(body.data())?;
                }
                Message::AuthenticationKerberosV5
                | Message::AuthenticationScmCredential
                | Message::AuthenticationGss
                | Message::AuthenticationSspi
                | Message::AuthenticationGssContinue(_) => {
                    return Err(PgError::Connection(
                        "unsupported authentication method requested by server".to_string(),
                    ));
                }
                Message::BackendKeyData(body) => self.backend_pid = Some(body.process_id()),
                Message::ParameterStatus(body) => {
                    self.server_params
                        .push((body.name()?.to_string(), body.value()?.to_string()));
                }
                Message::NoticeResponse(body) => {
                    let notice = db_error(body.fields())?;
                    warn!(slot = self.slot, code = %notice.code, "{}", notice.message);
                }
                Message::ErrorResponse(body) => {
                    let error = db_error_from(&body)?;
                    return Err(PgError::Connection(error.message));
                }
                Message::ReadyForQuery(_) => {
                    self.phase = Phase::Open;
                    self.query_done = true;
                }
                _ => {
                    return Err(PgError::Protocol(
                        "unexpected message during startup".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn process_query(&mut self) -> PgResult<()> {
        while let Some(message) = Message::parse(&mut self.read_buf)? {
            match message {
                Message::RowDescription(body) => {
                    let mut result = QueryResult::new(ResultStatus::TuplesOk);
                    let mut fields = body.fields();
                    while let Some(field) = fields.next()? {
                        result.columns.push(field.name().to_string());
                    }
                    self.current = Some(result);
                }
                Message::DataRow(body) => {
                    let result = self
                        .current
                        .get_or_insert_with(|| QueryResult::new(ResultStatus::TuplesOk));
                    let buffer = body.buffer();
                    let mut row = Vec::with_capacity(result.columns.len());
                    let mut ranges = body.ranges();
                    while let Some(range) = ranges.next()? {
                        row.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
                    }
                    result.rows.push(row);
                }
                Message::CommandComplete(body) => {
                    let mut result = self
                        .current
                        .take()
                        .unwrap_or_else(|| QueryResult::new(ResultStatus::CommandOk));
                    result.command_tag = Some(body.tag()?.to_string());
                    self.results.push(result);
                }
                Message::EmptyQueryResponse => {
                    self.results.push(QueryResult::new(ResultStatus::EmptyQuery));
                }
                Message::ErrorResponse(body) => {
                    self.current = None;
                    let mut result = QueryResult::new(ResultStatus::FatalError);
                    result.error = Some(db_error_from(&body)?);
                    self.results.push(result);
                }
                Message::CopyInResponse(_) => {
                    self.results.push(QueryResult::new(ResultStatus::BadResponse));
                    frontend::copy_fail("COPY is not supported", &mut self.write_buf)?;
                }
                Message::CopyOutResponse(_) => {
                    self.results.push(QueryResult::new(ResultStatus::BadResponse));
                }
                Message::CopyData(_) | Message::CopyDone => {}
                Message::NoticeResponse(body) => {
                    let notice = db_error(body.fields())?;
                    debug!(slot = self.slot, code = %notice.code, "{}", notice.message);
                }
                Message::NotificationResponse(body) => {
                    debug!(slot = self.slot, channel = body.channel()?, "notification ignored");
                }
                Message::ParameterStatus(body) => {
                    let name = body.name()?.to_string();
                    let value = body.value()?.to_string();
                    match self.server_params.iter_mut().find(|(k, _)| *k == name) {
                        Some(entry) => entry.1 = value,
                        None => self.server_params.push((name, value)),
                    }
                }
                Message::ReadyForQuery(_) => {
                    if let Some(result) = self.current.take() {
                        self.results.push(result);
                    }
                    self.query_done = true;
                }
                _ => {
                    return Err(PgError::Protocol("unexpected message in query".to_string()));
                }
            }
        }
        Ok(())
    }
}

fn required_password(info: &ConnInfo) -> PgResult<&str> {
    info.password
        .as_deref()
        .ok_or_else(|| PgError::Connection("password required by server but none supplied".to_string()))
}

fn db_error_from(body: &ErrorResponseBody) -> io::Result<DbError> {
    db_error(body.fields())
}

fn db_error<'a, I>(mut fields: I) -> io::Result<DbError>
where
    I: FallibleIterator<Item = postgres_protocol::message::backend::ErrorField<'a>, Error = io::Error>,
{
    let mut error = DbError::default();
    while let Some(field) = fields.next()? {
        let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
        match field.type_() {
            b'S' => error.severity = value,
            b'C' => error.code = value,
            b'M' => error.message = value,
            b'D' => error.detail = Some(value),
            _ => {}
        }
    }
    Ok(error)
}
