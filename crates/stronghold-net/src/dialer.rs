//! Marked outbound dialer (§4.7): every socket the proxy opens for forwarded
//! requests, origin TLS, facilitator calls, scanner calls, and Solana RPC carries
//! the packet mark `STRONGHOLD_MARK` so the firewall's redirect chain exempts it.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

pub const STRONGHOLD_MARK: u32 = 0x2702;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("failed to create socket: {0}")]
    Socket(std::io::Error),
    #[error("failed to set packet mark: {0}")]
    Mark(std::io::Error),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
}

/// Dials `addr`, applying `mark` to the socket before connecting.
///
/// `mark` is a no-op outside Linux: macOS relies on an installer-authored pf
/// `tagged stronghold` rule instead (§4.7, §9 open question on non-macOS BSDs).
pub async fn dial_marked(addr: SocketAddr, mark: u32, timeout: Duration) -> Result<TcpStream, DialError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(DialError::Socket)?;
    socket.set_nonblocking(true).map_err(DialError::Socket)?;
    apply_mark(&socket, mark)?;

    let connect_fut = async {
        match socket.connect(&addr.into()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    };

    tokio::time::timeout(timeout, connect_fut)
        .await
        .map_err(|_| DialError::Timeout(timeout))?
        .map_err(DialError::Connect)?;

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream).map_err(DialError::Connect)?;
    // Surface any late connect error (e.g. ECONNREFUSED) by probing writability.
    stream.writable().await.map_err(DialError::Connect)?;
    if let Some(err) = stream.take_error().map_err(DialError::Connect)? {
        return Err(DialError::Connect(err));
    }
    Ok(stream)
}

#[cfg(target_os = "linux")]
fn apply_mark(socket: &Socket, mark: u32) -> Result<(), DialError> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(DialError::Mark(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply_mark(_socket: &Socket, _mark: u32) -> Result<(), DialError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = dial_marked(addr, STRONGHOLD_MARK, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(stream.peer_addr().unwrap() == addr);
        accept.await.unwrap();
    }
}
