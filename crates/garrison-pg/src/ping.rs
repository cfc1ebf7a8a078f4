//! Blocking reachability probe, run before the pool opens its first
//! connection.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use tracing::{debug, warn};

use crate::conninfo::ConnInfo;

/// Attempts made before giving up on a backend.
pub const MAX_PING_ATTEMPTS: u32 = 3;

/// Pause between two ping attempts.
pub const PING_RETRY_DELAY: Duration = Duration::from_secs(1);

/// SQLSTATE sent by a server that is starting up or shutting down.
const CANNOT_CONNECT_NOW: &str = "57P03";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// The server is accepting connections.
    Ok,
    /// The server is running but refuses connections right now.
    Reject,
    /// The server could not be contacted.
    NoResponse,
    /// The parameters were unusable, so nothing was attempted.
    NoAttempt,
}

impl PingStatus {
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "The server is running and appears to be accepting connections.",
            Self::Reject => {
                "The server is running but is in a state that disallows connections \
                 (startup, shutdown, or crash recovery)."
            }
            Self::NoResponse => "The server could not be contacted.",
            Self::NoAttempt => {
                "No attempt was made to contact the server, because the supplied parameters \
                 were obviously incorrect or there was some client-side problem \
                 (for example, out of memory)."
            }
        }
    }
}

/// Pings the backend, retrying up to [`MAX_PING_ATTEMPTS`] times.
pub fn ping_with_retry(info: &ConnInfo) -> PingStatus {
    let mut status = PingStatus::NoResponse;
    for attempt in 1..=MAX_PING_ATTEMPTS {
        status = ping(info);
        match status {
            PingStatus::Ok => return status,
            PingStatus::NoAttempt => return status,
            _ if attempt < MAX_PING_ATTEMPTS => {
                warn!(attempt, host = %info.host, "{}", status.message());
                thread::sleep(PING_RETRY_DELAY);
            }
            _ => {}
        }
    }
    status
}

/// Single probe: connect, send a startup packet, and classify the first reply.
pub fn ping(info: &ConnInfo) -> PingStatus {
    if info.is_obviously_invalid() {
        return PingStatus::NoAttempt;
    }

    let result = match info.socket_path() {
        Some(path) => UnixStream::connect(path).and_then(|s| probe(s, info)),
        None => connect_tcp(info).and_then(|s| probe(s, info)),
    };

    match result {
        Ok(status) => status,
        Err(e) => {
            debug!(error = %e, "ping failed");
            PingStatus::NoResponse
        }
    }
}

fn connect_tcp(info: &ConnInfo) -> io::Result<TcpStream> {
    let timeout = info.connect_timeout.unwrap_or(PROBE_TIMEOUT);
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no address");
    for addr in (info.host.as_str(), info.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

trait ProbeStream: Read + Write {
    fn set_timeouts(&self, timeout: Duration) -> io::Result<()>;
}

impl ProbeStream for TcpStream {
    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

impl ProbeStream for UnixStream {
    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))?;
        self.set_write_timeout(Some(timeout))
    }
}

fn probe<S: ProbeStream>(mut stream: S, info: &ConnInfo) -> io::Result<PingStatus> {
    stream.set_timeouts(PROBE_TIMEOUT)?;

    let mut out = BytesMut::new();
    frontend::startup_message(info.startup_params(), &mut out)?;
    stream.write_all(&out)?;

    let mut input = BytesMut::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let status = loop {
        if let Some(message) = backend::Message::parse(&mut input)? {
            break classify(message)?;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        input.extend_from_slice(&chunk[..n]);
    };

    out.clear();
    frontend::terminate(&mut out);
    let _ = stream.write_all(&out);
    Ok(status)
}

/// Any reply means the server is alive; only "cannot connect now" is a reject.
fn classify(message: backend::Message) -> io::Result<PingStatus> {
    if let backend::Message::ErrorResponse(body) = message {
        let mut fields = body.fields();
        while let Some(field) = fields.next()? {
            if field.type_() == b'C' && field.value_bytes() == CANNOT_CONNECT_NOW.as_bytes() {
                return Ok(PingStatus::Reject);
            }
        }
    }
    Ok(PingStatus::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obviously_invalid_is_no_attempt() {
        let info = ConnInfo {
            port: 0,
            ..ConnInfo::default()
        };
        assert_eq!(ping(&info), PingStatus::NoAttempt);
    }

    #[test]
    fn test_closed_port_is_no_response() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let info = ConnInfo {
            host: "127.0.0.1".to_string(),
            port,
            ..ConnInfo::default()
        };
        assert_eq!(ping(&info), PingStatus::NoResponse);
    }

    #[test]
    fn test_messages_match_status() {
        assert!(PingStatus::Reject.message().contains("disallows connections"));
        assert_eq!(
            PingStatus::NoResponse.message(),
            "The server could not be contacted."
        );
    }
}
