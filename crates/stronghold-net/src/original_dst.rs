//! Recovers the pre-redirect destination of a transparently-proxied connection
//! via `SO_ORIGINAL_DST` (§4.1, §6.1).

use std::net::SocketAddr;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
#[error("SO_ORIGINAL_DST unavailable: {0}")]
pub struct OriginalDstError(std::io::Error);

#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> Result<SocketAddr, OriginalDstError> {
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(OriginalDstError(std::io::Error::last_os_error()));
    }

    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(std::net::IpAddr::V4(ip), port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> Result<SocketAddr, OriginalDstError> {
    Err(OriginalDstError(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on Linux; fall back to SNI parsing",
    )))
}
