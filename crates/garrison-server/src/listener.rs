//! The shared listening socket.
//!
//! The master (or the single process) binds once; workers inherit the
//! descriptor across `fork` and register their own clone with their reactor.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use garrison_config::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::error::{ServerError, ServerResult};

/// Binds the listening socket described by `config`.
pub fn bind(config: &ServerConfig) -> ServerResult<TcpListener> {
    let address = config.bind_address();
    let addr = resolve(&address)?;
    let listener = bind_addr(addr, config.backlog).map_err(|source| ServerError::BindFailed {
        addr: address.clone(),
        source,
    })?;
    info!(addr = %address, backlog = config.backlog, "listening");
    Ok(listener)
}

/// Binds `addr` with `SO_REUSEADDR` and the given backlog.
pub fn bind_addr(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

fn resolve(address: &str) -> ServerResult<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|source| ServerError::BindFailed {
            addr: address.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ServerError::BindFailed {
            addr: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
        })
}
