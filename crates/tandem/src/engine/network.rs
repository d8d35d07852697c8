//! Listener creation.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Bind a non-blocking listener on `addr`.
///
/// The listener is a std socket so it can be bound on the caller's thread
/// and handed to the runtime that serves it; port 0 picks a free port.
pub fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Ephemeral loopback listener.
pub fn localhost_listener() -> std::io::Result<std::net::TcpListener> {
    create_listener(SocketAddr::from(([127, 0, 0, 1], 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_ports_differ() {
        let a = localhost_listener().unwrap();
        let b = localhost_listener().unwrap();
        let (a, b) = (a.local_addr().unwrap(), b.local_addr().unwrap());
        assert_ne!(a.port(), 0);
        assert_ne!(a.port(), b.port());
        assert!(a.ip().is_loopback());
    }
}
