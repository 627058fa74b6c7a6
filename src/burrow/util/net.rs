use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Kernel buffer sizes applied to proxied sockets; zero leaves the OS default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketBuffers {
    pub send: usize,
    pub recv: usize,
}

pub fn apply_tcp_options(
    stream: &tokio::net::TcpStream,
    buffers: SocketBuffers,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    if buffers.send > 0 {
        sock.set_send_buffer_size(buffers.send)?;
    }
    if buffers.recv > 0 {
        sock.set_recv_buffer_size(buffers.recv)?;
    }
    Ok(())
}

/// Creates a non-blocking UDP socket bound to `addr` and registers it with
/// tokio.
pub fn bind_udp(addr: SocketAddr) -> std::io::Result<tokio::net::UdpSocket> {
    let sockaddr = socket2::SockAddr::from(addr);
    let socket = Socket::new(sockaddr.domain(), Type::DGRAM, Some(Protocol::UDP))?;
    if sockaddr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr)?;
    tokio::net::UdpSocket::try_from(std::net::UdpSocket::from(socket))
}

/// Creates an unprivileged ICMP echo socket (SOCK_DGRAM + IPPROTO_ICMP).
/// The kernel owns the echo identifier; replies are delivered to the same
/// socket without raw-socket privileges.
pub fn bind_icmp(v6: bool) -> std::io::Result<tokio::net::UdpSocket> {
    let (domain, proto) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(proto))?;
    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::try_from(std::net::UdpSocket::from(socket))
}

/// Propagates the don't-fragment semantic of a tunneled packet onto the
/// outbound socket where the OS permits.
#[cfg(target_os = "linux")]
pub fn set_dont_fragment(socket: &tokio::net::UdpSocket, on: bool) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = if on {
        libc::IP_PMTUDISC_DO
    } else {
        libc::IP_PMTUDISC_DONT
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_dont_fragment(_socket: &tokio::net::UdpSocket, _on: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_udp_any_port() {
        let sock = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = sock.local_addr().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn tcp_options_apply() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let client = tokio::spawn(async move {
            tokio::net::TcpStream::connect(addr).await.unwrap()
        });
        let (server, _) = ln.accept().await.unwrap();
        apply_tcp_options(
            &server,
            SocketBuffers {
                send: 64 * 1024,
                recv: 64 * 1024,
            },
        )
        .unwrap();
        client.await.unwrap();
    }
}
