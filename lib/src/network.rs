//! Connections from the harness to targets.
//! Stream protocols (Modbus, MQTT, HTTP, gRPC) use TCP, CoAP uses a connected UDP socket.
use crate::protocol::Transport;
use crate::target::Endpoint;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::trace;

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Debug + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Debug + Send {}

/// An open conversation channel with a target.
#[derive(Debug)]
pub enum Link {
    Stream(Box<dyn ByteStream>),
    Datagram(UdpSocket),
}

impl Link {
    pub fn from_stream(stream: impl ByteStream + 'static) -> Self {
        Link::Stream(Box::new(stream))
    }

    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Link::Stream(stream) => {
                stream.write_all(bytes).await?;
                stream.flush().await
            }
            Link::Datagram(socket) => socket.send(bytes).await.map(|_| ()),
        }
    }

    /// Reads whatever the target answers with. `Ok(0)` on a stream means the peer closed.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Link::Stream(stream) => stream.read(buf).await,
            Link::Datagram(socket) => socket.recv(buf).await,
        }
    }
}

async fn resolve(endpoint: &Endpoint) -> io::Result<SocketAddr> {
    lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not resolve {}", endpoint.address()),
            )
        })
}

pub async fn connect_to_target(
    endpoint: &Endpoint,
    transport: Transport,
    timeout: Duration,
) -> io::Result<Link> {
    let connect = async {
        let address = resolve(endpoint).await?;
        trace!("Connecting to {address} over {transport:?}");
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(address).await?;
                stream.set_nodelay(true)?;
                Ok(Link::from_stream(stream))
            }
            Transport::Udp => {
                let bind = if address.is_ipv6() {
                    "[::]:0"
                } else {
                    "0.0.0.0:0"
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(address).await?;
                Ok(Link::Datagram(socket))
            }
        }
    };
    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stream_link_round_trips_bytes() {
        let (client, mut server) = duplex(1024);
        let mut link = Link::from_stream(client);
        link.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        server.write_all(&[9]).await.unwrap();
        let n = link.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9]);
    }

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = connect_to_target(
            &Endpoint::new("127.0.0.1", port),
            Transport::Tcp,
            Duration::from_millis(500),
        )
        .await
        .unwrap();
        assert!(matches!(link, Link::Stream(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let res = connect_to_target(
            &Endpoint::new("127.0.0.1", port),
            Transport::Tcp,
            Duration::from_millis(500),
        )
        .await;
        assert!(res.is_err());
    }
}
