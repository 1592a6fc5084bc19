//! Upstream connection establishment (plain TCP or TLS).

use std::fmt;
use std::io;
use std::net::Ipv6Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::tls::{build_client_config, TlsError, TlsOptions};

/// Host and port of the real database server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Errors opening an upstream connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            DialError::Connect { .. } => "upstream_connect",
            DialError::InvalidServerName(_) => "invalid_server_name",
            DialError::TlsHandshake { .. } => "tls_handshake",
        }
    }
}

/// An open upstream connection.
#[derive(Debug)]
pub enum UpstreamStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl UpstreamStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, UpstreamStream::Tls(_))
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens connections to one upstream target.
///
/// Cheap to clone; the TLS connector is shared.
#[derive(Clone)]
pub struct UpstreamDialer {
    target: UpstreamTarget,
    tls: Option<TlsConnector>,
}

impl UpstreamDialer {
    /// Dialer for plain TCP.
    pub fn plain(target: UpstreamTarget) -> Self {
        Self { target, tls: None }
    }

    /// Dialer for TLS. Certificate material is loaded here, once.
    pub fn tls(target: UpstreamTarget, options: &TlsOptions) -> Result<Self, TlsError> {
        let config = build_client_config(options)?;
        Ok(Self {
            target,
            tls: Some(TlsConnector::from(Arc::new(config))),
        })
    }

    /// Plain or TLS depending on `tls`.
    pub fn new(target: UpstreamTarget, tls: Option<&TlsOptions>) -> Result<Self, TlsError> {
        match tls {
            Some(options) => Self::tls(target, options),
            None => Ok(Self::plain(target)),
        }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new upstream connection. No retry and no timeout.
    pub async fn dial(&self) -> Result<UpstreamStream, DialError> {
        let addr = self.target.to_string();

        let tcp = TcpStream::connect((self.target.host.as_str(), self.target.port))
            .await
            .map_err(|source| DialError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let Some(connector) = &self.tls else {
            debug!(upstream = %addr, "Connected to upstream");
            return Ok(UpstreamStream::Tcp(tcp));
        };

        let server_name = ServerName::try_from(self.target.host.clone())
            .map_err(|_| DialError::InvalidServerName(self.target.host.clone()))?;

        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| DialError::TlsHandshake {
                addr: addr.clone(),
                source,
            })?;

        debug!(upstream = %addr, "Connected to upstream over TLS");
        Ok(UpstreamStream::Tls(Box::new(stream)))
    }
}

impl fmt::Debug for UpstreamDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamDialer")
            .field("target", &self.target)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_target_display() {
        assert_eq!(UpstreamTarget::new("db", 3306).to_string(), "db:3306");
        assert_eq!(
            UpstreamTarget::new("127.0.0.1", 3307).to_string(),
            "127.0.0.1:3307"
        );
        assert_eq!(UpstreamTarget::new("::1", 3306).to_string(), "[::1]:3306");
    }

    #[tokio::test]
    async fn test_plain_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let dialer = UpstreamDialer::plain(UpstreamTarget::new("127.0.0.1", port));
        assert!(!dialer.is_tls());

        let mut stream = dialer.dial().await.unwrap();
        assert!(!stream.is_tls());

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = UpstreamDialer::plain(UpstreamTarget::new("127.0.0.1", port));
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
        assert_eq!(err.reason_code(), "upstream_connect");
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
    }

    #[test]
    fn test_tls_dialer_surfaces_material_errors() {
        let options = TlsOptions {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let err = UpstreamDialer::new(UpstreamTarget::new("db", 3306), Some(&options)).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }
}
