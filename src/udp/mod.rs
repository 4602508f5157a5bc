//! UDP roles.
//!
//! use `Server` to run the rendezvous server.
//!
//! use `Peer` to register, connect through a relay, or act as a relay.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::Result;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

#[cfg(feature = "peer")]
mod peer;
#[cfg(feature = "peer")]
pub use peer::{Peer, PeerEvent, PeerStatus, RelayEndpoint};

#[cfg(feature = "peer")]
mod relay;
#[cfg(feature = "peer")]
pub use relay::RelayEngine;

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::Server;

/// Bind a nonblocking udp socket with SO_REUSEADDR and hand it to tokio.
pub(crate) fn bind_socket(local_addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(local_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local_addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Unspecified address of the same family as `addr`, port 0.
pub(crate) fn any_addr(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_socket() {
        let a = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = bind_socket(any_addr(&"127.0.0.1:1".parse().unwrap())).unwrap();
        let b_port = b.local_addr().unwrap().port();
        assert_ne!(b_port, 0);

        a.send_to(b"hello", ("127.0.0.1", b_port)).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_any_addr() {
        assert!(any_addr(&"[::1]:1".parse().unwrap()).is_ipv6());
        assert_eq!(
            any_addr(&"10.0.0.1:8888".parse().unwrap()),
            "0.0.0.0:0".parse::<SocketAddr>().unwrap()
        );
    }
}
