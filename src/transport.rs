//! Transport seams: listening and connecting.
//!
//! Platform-specific implementations:
//! - Linux: vsock (`AF_VSOCK`) via tokio-vsock
//! - Any platform: loopback TCP, for development and tests
//!
//! Both hand back plain byte streams; framing and deadlines are layered on
//! top by [`Connection`](crate::connection::Connection).

use crate::address::EndpointAddress;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Display;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Hypervisor sockets (Linux only).
    Vsock,
    /// TCP on 127.0.0.1; the context id is ignored.
    Tcp,
}

/// Source of accepted connections.
#[async_trait]
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Peer: Display + Send;

    async fn accept(&mut self) -> io::Result<(Self::Stream, Self::Peer)>;

    fn local_addr(&self) -> io::Result<String>;
}

/// Establishes outbound connections.
#[async_trait]
pub trait Connector: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, addr: EndpointAddress) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;
    type Peer = SocketAddr;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<String> {
        TcpListener::local_addr(self).map(|addr| addr.to_string())
    }
}

/// Bind a loopback TCP listener on the address's port.
pub async fn bind_tcp(addr: EndpointAddress) -> io::Result<TcpListener> {
    TcpListener::bind(loopback(addr)).await
}

/// Connects to `127.0.0.1:<port>`, ignoring the context id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: EndpointAddress) -> io::Result<TcpStream> {
        TcpStream::connect(loopback(addr)).await
    }
}

fn loopback(addr: EndpointAddress) -> SocketAddr {
    // EndpointAddress guarantees the port fits in 1..=65535.
    SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port() as u16))
}

#[cfg(target_os = "linux")]
pub use self::vsock::{bind_vsock, local_cid, VsockConnector};

#[cfg(target_os = "linux")]
mod vsock {
    use super::{Connector, Listener};
    use crate::address::EndpointAddress;
    use async_trait::async_trait;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use tokio_vsock::{VsockAddr, VsockStream};

    pub use tokio_vsock::VsockListener;

    /// `_IO(7, 0xb9)` from `linux/vm_sockets.h`.
    const IOCTL_VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x7b9;

    /// Read this machine's context id from `/dev/vsock`.
    pub fn local_cid() -> io::Result<u32> {
        let device = File::open("/dev/vsock")?;
        let mut cid: libc::c_uint = 0;
        // SAFETY: the ioctl writes a single c_uint through the pointer.
        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                IOCTL_VM_SOCKETS_GET_LOCAL_CID as _,
                &mut cid as *mut libc::c_uint,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(cid)
    }

    pub fn bind_vsock(addr: EndpointAddress) -> io::Result<VsockListener> {
        VsockListener::bind(VsockAddr::new(addr.cid(), addr.port()))
    }

    #[async_trait]
    impl Listener for VsockListener {
        type Stream = VsockStream;
        // Ephemeral vsock ports span the full u32 range, so the peer is
        // not an `EndpointAddress`.
        type Peer = String;

        async fn accept(&mut self) -> io::Result<(VsockStream, String)> {
            let (stream, peer) = VsockListener::accept(self).await?;
            Ok((stream, format!("vsock://{}:{}", peer.cid(), peer.port())))
        }

        fn local_addr(&self) -> io::Result<String> {
            VsockListener::local_addr(self)
                .map(|addr| format!("vsock://{}:{}", addr.cid(), addr.port()))
        }
    }

    /// Connects over `AF_VSOCK`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct VsockConnector;

    #[async_trait]
    impl Connector for VsockConnector {
        type Stream = VsockStream;

        async fn connect(&self, addr: EndpointAddress) -> io::Result<VsockStream> {
            VsockStream::connect(VsockAddr::new(addr.cid(), addr.port())).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_listener_and_connector() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port: u32 = Listener::local_addr(&listener)
            .unwrap()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let addr = EndpointAddress::new(crate::address::CID_PARENT, port).unwrap();
        let dial = tokio::spawn(async move { TcpConnector.connect(addr).await });

        let (mut accepted, peer) = Listener::accept(&mut listener).await.unwrap();
        assert!(peer.ip().is_loopback());

        let mut dialed = dial.await.unwrap().unwrap();
        dialed.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_transport_type_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: TransportType,
        }
        let w: Wrapper = toml::from_str(r#"transport = "tcp""#).unwrap();
        assert_eq!(w.transport, TransportType::Tcp);
        let w: Wrapper = toml::from_str(r#"transport = "vsock""#).unwrap();
        assert_eq!(w.transport, TransportType::Vsock);
    }
}
