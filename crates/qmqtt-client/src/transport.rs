//! Byte-stream transports.
//!
//! The event loop only needs an ordered, reliable, bidirectional byte stream.
//! Anything implementing tokio's `AsyncRead + AsyncWrite` qualifies: a plain
//! `TcpStream`, a TLS stream wrapping one, or an in-memory `DuplexStream`.

use std::future::Future;
use std::io;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A connected byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Opens a fresh transport for each connection attempt.
pub trait Connector: Send {
    type Transport: Transport;

    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

/// Plain TCP connector with `TCP_NODELAY` set.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Connector for TcpConnector {
    type Transport = TcpStream;

    fn connect(&mut self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let address = self.address.clone();
        let connect_timeout = self.connect_timeout;
        async move {
            debug!("Opening TCP connection to {}", address);
            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", address),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut connector = TcpConnector::new(address, Duration::from_secs(5));
        let mut stream = connector.connect().await.unwrap();
        assert!(stream.nodelay().unwrap());
        stream.write_all(&[0xC0, 0x00]).await.unwrap();

        assert_eq!(server.await.unwrap(), [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port with nothing listening
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut connector = TcpConnector::new(address, Duration::from_secs(5));
        assert!(connector.connect().await.is_err());
    }
}
