use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::probe::TlsSummary;

/// A connected socket, carried through each I/O step and handed back.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Udp(UdpSocket),
}

impl Transport {
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf).await,
            Transport::Tls(stream) => stream.read(buf).await,
            Transport::Udp(socket) => socket.recv(buf).await,
        }
    }

    pub async fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(data).await,
            Transport::Tls(stream) => {
                let written = stream.write(data).await?;
                stream.flush().await?;
                Ok(written)
            }
            Transport::Udp(socket) => socket.send(data).await,
        }
    }

    /// Shut down the sending side. TLS and UDP keep theirs open.
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.shutdown().await,
            Transport::Tls(_) | Transport::Udp(_) => Ok(()),
        }
    }

    pub fn tls_summary(&self) -> Option<TlsSummary> {
        let Transport::Tls(stream) = self else {
            return None;
        };
        let (_, session) = stream.get_ref();
        let leaf = session.peer_certificates().and_then(<[_]>::first);
        Some(TlsSummary {
            protocol: session.protocol_version().map_or_else(|| "unknown".into(), |version| format!("{version:?}")),
            cipher: session
                .negotiated_cipher_suite()
                .map_or_else(|| "unknown".into(), |suite| format!("{:?}", suite.suite())),
            peer_certificates: session.peer_certificates().map_or(0, <[_]>::len),
            not_after: leaf
                .and_then(|der| X509Certificate::from_der(der.as_ref()).ok())
                .map(|(_, parsed)| parsed.validity().not_after.timestamp()),
        })
    }
}

pub async fn connect_tcp(addr: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
    if let Some(source) = source {
        socket.bind(SocketAddr::new(source, 0))?;
    }
    socket.connect(addr).await
}

pub async fn connect_udp(addr: SocketAddr, source: Option<IpAddr>) -> io::Result<UdpSocket> {
    let local = source.unwrap_or(if addr.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    });
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_round_trip_and_half_close() -> io::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            stream.write_all(b"220 ready\r\n").await?;
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await?;
            io::Result::Ok(received)
        });

        let mut transport = Transport::Tcp(connect_tcp(addr, Some("127.0.0.1".parse().unwrap())).await?);
        let mut buf = [0u8; 64];
        let read = transport.read_some(&mut buf).await?;
        assert_eq!(&buf[..read], b"220 ready\r\n");

        assert_eq!(transport.write_some(b"QUIT\r\n").await?, 6);
        transport.shutdown_write().await?;
        assert_eq!(server.await.unwrap()?, b"QUIT\r\n");
        assert!(transport.tls_summary().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn udp_is_connected() -> io::Result<()> {
        let peer = UdpSocket::bind("127.0.0.1:0").await?;
        let mut transport = Transport::Udp(connect_udp(peer.local_addr()?, None).await?);
        transport.write_some(b"ping").await?;

        let mut buf = [0u8; 16];
        let (count, from) = peer.recv_from(&mut buf).await?;
        assert_eq!(&buf[..count], b"ping");
        peer.send_to(b"pong", from).await?;
        let count = transport.read_some(&mut buf).await?;
        assert_eq!(&buf[..count], b"pong");
        Ok(())
    }
}
