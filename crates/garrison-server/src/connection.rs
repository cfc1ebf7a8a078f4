//! HTTP connection state.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use garrison_http::{ParseResult, Reply, Request, RequestParser};
use mio::net::TcpStream;
use mio::{Interest, Token};

/// Identifies a connection across slot reuse.
///
/// Slots in the connection table are recycled; the generation tells a late
/// query completion that the connection it was started for is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub index: usize,
    pub generation: u64,
}

/// Life-cycle of an HTTP connection.
///
/// ```text
/// Connected ─► WaitRequest ─┬─► RequestOk ──► ReplyReady ─► ReplySent
///                  ▲         └─► RequestError ─► (stock 400) ─┘   │
///                  └──────────── keep-alive ──────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connected,
    WaitRequest,
    /// A complete request is being handled by a module.
    RequestOk,
    RequestError,
    /// A reply is queued and partly written.
    ReplyReady,
    ReplySent,
}

/// State of a client connection.
pub struct HttpConnection {
    pub key: ConnKey,
    pub token: Token,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub status: ConnStatus,
    pub parser: RequestParser,
    pub request: Request,
    pub reply: Reply,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    /// Close the socket once the current reply is written.
    pub close_after_reply: bool,
    /// The client shut down its write side. Buffered requests are still
    /// answered, then the socket is closed.
    pub peer_closed: bool,
    /// Body size of the reply in flight, for the access log.
    pub reply_size: usize,
    /// Last activity timestamp.
    pub last_activity: Instant,
}

impl HttpConnection {
    pub fn new(
        key: ConnKey,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        read_buf: BytesMut,
        write_buf: BytesMut,
    ) -> Self {
        Self {
            key,
            token,
            stream,
            peer,
            status: ConnStatus::Connected,
            parser: RequestParser::new(),
            request: Request::default(),
            reply: Reply::default(),
            read_buf,
            write_buf,
            close_after_reply: true,
            peer_closed: false,
            reply_size: 0,
            last_activity: Instant::now(),
        }
    }

    /// Updates the last activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Reads data from the socket into the read buffer.
    ///
    /// Returns `true` if the connection is still open. On end of stream the
    /// bytes read so far stay buffered and `peer_closed` is set.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut temp_buf = [0u8; 4096];

        loop {
            match self.stream.read(&mut temp_buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(false);
                }
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes data from the write buffer to the socket.
    ///
    /// Returns `true` if all data was written.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Feeds buffered input to the request parser.
    ///
    /// Only runs while waiting for a request; bytes that arrive while a
    /// request is being handled stay buffered for the next one.
    pub fn parse_input(&mut self) -> ParseResult {
        if !matches!(self.status, ConnStatus::Connected | ConnStatus::WaitRequest) {
            return self.parser.result();
        }
        self.status = ConnStatus::WaitRequest;

        let (result, used) = self.parser.parse(&mut self.request, &self.read_buf);
        let _ = self.read_buf.split_to(used);

        match result {
            ParseResult::Complete => self.status = ConnStatus::RequestOk,
            ParseResult::Error => self.status = ConnStatus::RequestError,
            ParseResult::NeedMore => {}
        }
        result
    }

    /// Serializes `self.reply` into the write buffer.
    pub fn queue_reply(&mut self) {
        self.close_after_reply = self.reply.close_connection || self.peer_closed;
        self.reply_size = if self.reply.status.is_bodyless() {
            0
        } else {
            self.reply.content.len()
        };
        self.reply.write_to(&mut self.write_buf);
        self.status = ConnStatus::ReplyReady;
    }

    /// Prepares the connection for the next request on a kept-alive socket.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.request.clear();
        self.reply.clear();
        self.reply_size = 0;
        self.close_after_reply = true;
        self.status = ConnStatus::WaitRequest;
    }

    /// `true` when a pipelined request is already buffered.
    pub fn has_pending_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// `true` while no complete request is held by the connection.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, ConnStatus::Connected | ConnStatus::WaitRequest)
    }

    /// `true` between requests: nothing buffered, nothing half parsed and
    /// nothing in flight.
    pub fn is_between_requests(&self) -> bool {
        self.is_waiting() && self.read_buf.is_empty() && self.request.method.is_empty()
    }

    /// Returns the interest flags for this connection.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Hands the buffers back for recycling.
    pub fn into_buffers(self) -> (BytesMut, BytesMut) {
        (self.read_buf, self.write_buf)
    }
}
