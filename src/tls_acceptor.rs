//! TLS acceptor with client identity extraction
//!
//! Wraps the tokio-rustls acceptor so that every accepted stream carries the
//! identity of the peer: the Subject Common Name of the client certificate
//! that the handshake already verified against the configured CA.
//!
//! # Usage
//! ```ignore
//! let acceptor = AuthenticatedTlsAcceptor::new(tls_provider.server_config());
//! if let Some(stream) = acceptor.accept(tcp_stream, remote_addr).await? {
//!     // stream.conn_info.common_name is the verified client identity
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Connection info carrying the verified client identity
#[derive(Clone, Debug)]
pub struct AuthenticatedConnection {
    pub remote_addr: SocketAddr,
    /// Subject Common Name of the verified client certificate
    pub common_name: String,
}

pin_project! {
    /// TLS stream wrapper that includes the authenticated client identity
    pub struct AuthenticatedTlsStream<S> {
        #[pin]
        inner: S,
        pub conn_info: AuthenticatedConnection,
    }
}

impl<S> AuthenticatedTlsStream<S> {
    pub fn new(inner: S, conn_info: AuthenticatedConnection) -> Self {
        Self { inner, conn_info }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for AuthenticatedTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for AuthenticatedTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// TLS acceptor that resolves the peer certificate to a client identity
pub struct AuthenticatedTlsAcceptor {
    tls_acceptor: tokio_rustls::TlsAcceptor,
}

impl AuthenticatedTlsAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            tls_acceptor: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Accept a TLS connection and extract the client identity.
    ///
    /// Returns `Ok(None)` when the handshake succeeded but the peer
    /// certificate carries no usable Common Name; such connections cannot be
    /// attributed to a client and are dropped by the caller.
    pub async fn accept(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> io::Result<Option<AuthenticatedTlsStream<TlsStream<TcpStream>>>> {
        let tls_stream = self.tls_acceptor.accept(stream).await.map_err(|e| {
            debug!("TLS handshake failed for {}: {}", remote_addr, e);
            io::Error::new(io::ErrorKind::ConnectionAborted, e)
        })?;

        let common_name = {
            let (_, connection) = tls_stream.get_ref();
            connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(extract_common_name)
        };

        let Some(common_name) = common_name else {
            debug!(
                "Client certificate from {} has no Common Name, dropping",
                remote_addr
            );
            return Ok(None);
        };

        debug!("Client {} authenticated as '{}'", remote_addr, common_name);

        let conn_info = AuthenticatedConnection {
            remote_addr,
            common_name,
        };

        Ok(Some(AuthenticatedTlsStream::new(tls_stream, conn_info)))
    }
}

/// Extract the Subject Common Name from a DER-encoded certificate
fn extract_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;

    for cn in parsed.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            if !cn.is_empty() {
                return Some(cn.to_string());
            }
        }
    }

    None
}
