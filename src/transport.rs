//! Stream setup abstraction.
//!
//! The engine drives any bidirectional byte stream; a [`Connector`] decides
//! how that stream is established. The default [`TcpConnector`] opens plain
//! TCP. Deployments that need TLS supply their own connector and interpret
//! the opaque [`TlsOptions`] there; the engine only stores and forwards
//! that configuration.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::options::TlsOptions;

/// Raw socket descriptor exposed for external multiplexer integration.
#[cfg(unix)]
pub type SocketHandle = std::os::fd::RawFd;
#[cfg(not(unix))]
pub type SocketHandle = i32;

/// A connected byte stream the engine can frame packets over.
pub trait NetworkStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// The underlying descriptor, when the stream has one.
    fn socket_handle(&self) -> Option<SocketHandle> {
        None
    }
}

impl NetworkStream for TcpStream {
    #[cfg(unix)]
    fn socket_handle(&self) -> Option<SocketHandle> {
        use std::os::fd::AsRawFd;
        Some(self.as_raw_fd())
    }
}

/// Establishes streams to a broker endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to `host:port`. `tls` is the session's opaque TLS
    /// configuration, present when the application supplied one.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: Option<&TlsOptions>,
    ) -> io::Result<Box<dyn NetworkStream>>;
}

/// Plain TCP with `TCP_NODELAY`, the default connector.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: Option<&TlsOptions>,
    ) -> io::Result<Box<dyn NetworkStream>> {
        if tls.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS configuration requires a TLS-capable connector",
            ));
        }
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
