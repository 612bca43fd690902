//! TLS transport adapter
//!
//! Thin wrapper around the `openssl` crate: `TlsConfig` builds an
//! `SslContext` for one side of the connection, `TlsStream` drives the
//! handshake and record layer without ever blocking. All certificate and
//! record-level work stays inside OpenSSL; this module only translates
//! between its would-block signalling and the `Ok(None)` convention used
//! by the socket layer.

use super::{Error, Result};
use crate::net::TcpSocket;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder,
    SslFiletype, SslMethod, SslStream, SslVerifyMode,
};
use openssl::x509::X509;
use std::path::Path;

impl From<ErrorStack> for Error {
    fn from(e: ErrorStack) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Immutable TLS configuration for one side of a connection
#[derive(Clone)]
pub struct TlsConfig {
    ctx: SslContext,
    is_server: bool,
    servername: Option<String>,
}

impl TlsConfig {
    /// Start building a client configuration
    pub fn client() -> Result<TlsConfigBuilder> {
        TlsConfigBuilder::new(false)
    }

    /// Start building a server configuration
    pub fn server() -> Result<TlsConfigBuilder> {
        TlsConfigBuilder::new(true)
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }
}

/// Builder for `TlsConfig`
pub struct TlsConfigBuilder {
    ctx_builder: SslContextBuilder,
    is_server: bool,
    servername: Option<String>,
}

impl TlsConfigBuilder {
    fn new(is_server: bool) -> Result<Self> {
        let method = if is_server {
            SslMethod::tls_server()
        } else {
            SslMethod::tls_client()
        };
        let mut ctx_builder = SslContextBuilder::new(method)?;

        // Peer verification is opt-in; test rigs run on self-signed certs.
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(TlsConfigBuilder {
            ctx_builder,
            is_server,
            servername: None,
        })
    }

    /// Load a PEM certificate chain from a file
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.ctx_builder.set_certificate_chain_file(path)?;
        Ok(self)
    }

    /// Load a PEM private key from a file
    pub fn key_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.ctx_builder
            .set_private_key_file(path, SslFiletype::PEM)?;
        Ok(self)
    }

    /// Load a certificate and private key from one in-memory PEM bundle
    pub fn cert_pem(mut self, pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(pem)?;
        self.ctx_builder.set_certificate(&cert)?;
        let key = PKey::private_key_from_pem(pem)?;
        self.ctx_builder.set_private_key(&key)?;
        Ok(self)
    }

    /// Require and verify the peer certificate
    pub fn verify_peer(mut self, verify: bool) -> Self {
        let mode = if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        };
        self.ctx_builder.set_verify(mode);
        self
    }

    /// SNI servername sent by the client side
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    pub fn build(self) -> TlsConfig {
        TlsConfig {
            ctx: self.ctx_builder.build(),
            is_server: self.is_server,
            servername: self.servername,
        }
    }
}

/// Handshake outcome of one non-blocking step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The handshake is complete; the record layer is usable
    Done,
    /// More peer bytes are needed; wait for readability
    WantRead,
    /// Output is pending; wait for writability
    WantWrite,
}

enum Inner {
    Mid(MidHandshakeSslStream<TcpSocket>),
    Active(SslStream<TcpSocket>),
    Gone,
}

/// A TLS session over a non-blocking socket.
///
/// The handshake is advanced step-wise with `handshake_step`; reads and
/// writes follow the socket convention of `Ok(None)` for would-block and
/// `Ok(Some(0))` for an orderly close.
pub struct TlsStream {
    inner: Inner,
}

impl TlsStream {
    /// Start a client-side handshake over a connected socket
    pub fn connect(config: &TlsConfig, socket: TcpSocket) -> Result<Self> {
        if config.is_server {
            return Err(Error::InvalidState("server config on client connection"));
        }
        let mut ssl = Ssl::new(&config.ctx)?;
        if let Some(ref name) = config.servername {
            ssl.set_hostname(name)?;
        }
        Self::from_handshake(ssl.connect(socket))
    }

    /// Start a server-side handshake over an accepted socket
    pub fn accept(config: &TlsConfig, socket: TcpSocket) -> Result<Self> {
        if !config.is_server {
            return Err(Error::InvalidState("client config on server accept"));
        }
        let ssl = Ssl::new(&config.ctx)?;
        Self::from_handshake(ssl.accept(socket))
    }

    fn from_handshake(
        result: std::result::Result<SslStream<TcpSocket>, HandshakeError<TcpSocket>>,
    ) -> Result<Self> {
        match result {
            Ok(stream) => Ok(TlsStream {
                inner: Inner::Active(stream),
            }),
            Err(HandshakeError::WouldBlock(mid)) => Ok(TlsStream {
                inner: Inner::Mid(mid),
            }),
            Err(HandshakeError::Failure(mid)) => {
                Err(Error::Tls(format!("handshake failed: {}", mid.error())))
            }
            Err(HandshakeError::SetupFailure(e)) => Err(Error::Tls(e.to_string())),
        }
    }

    /// Advance the handshake by one step.
    ///
    /// Returns what the session is waiting for; `Done` once complete and on
    /// every later call. A failed handshake is terminal.
    pub fn handshake_step(&mut self) -> Result<HandshakeStatus> {
        match std::mem::replace(&mut self.inner, Inner::Gone) {
            Inner::Active(stream) => {
                self.inner = Inner::Active(stream);
                Ok(HandshakeStatus::Done)
            }
            Inner::Mid(mid) => match mid.handshake() {
                Ok(stream) => {
                    self.inner = Inner::Active(stream);
                    Ok(HandshakeStatus::Done)
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let status = match mid.error().code() {
                        ErrorCode::WANT_WRITE => HandshakeStatus::WantWrite,
                        _ => HandshakeStatus::WantRead,
                    };
                    self.inner = Inner::Mid(mid);
                    Ok(status)
                }
                Err(HandshakeError::Failure(mid)) => {
                    Err(Error::Tls(format!("handshake failed: {}", mid.error())))
                }
                Err(HandshakeError::SetupFailure(e)) => Err(Error::Tls(e.to_string())),
            },
            Inner::Gone => Err(Error::InvalidState("tls stream closed")),
        }
    }

    /// True once the handshake has completed
    pub fn is_active(&self) -> bool {
        matches!(self.inner, Inner::Active(_))
    }

    fn active_mut(&mut self) -> Result<&mut SslStream<TcpSocket>> {
        match &mut self.inner {
            Inner::Active(stream) => Ok(stream),
            Inner::Mid(_) => Err(Error::InvalidState("tls handshake not complete")),
            Inner::Gone => Err(Error::InvalidState("tls stream closed")),
        }
    }

    /// Non-blocking read of decrypted bytes.
    ///
    /// `Ok(None)` means would-block, `Ok(Some(0))` means the peer closed
    /// the session (close_notify or transport EOF).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let stream = self.active_mut()?;
        match stream.ssl_read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) => match e.code() {
                ErrorCode::ZERO_RETURN => Ok(Some(0)),
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Ok(None),
                ErrorCode::SYSCALL if e.io_error().is_none() => Ok(Some(0)),
                _ => Err(Error::Tls(e.to_string())),
            },
        }
    }

    /// Non-blocking write of plaintext bytes. `Ok(None)` means would-block.
    pub fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        let stream = self.active_mut()?;
        match stream.ssl_write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Ok(None),
                _ => Err(Error::Tls(e.to_string())),
            },
        }
    }

    /// Decrypted bytes already buffered inside the session.
    ///
    /// A socket can be quiet while a previous record still holds readable
    /// plaintext; readiness checks must consult this first.
    pub fn pending(&self) -> usize {
        match &self.inner {
            Inner::Active(stream) => stream.ssl().pending(),
            _ => 0,
        }
    }

    /// Access the underlying socket
    pub fn socket(&self) -> Option<&TcpSocket> {
        match &self.inner {
            Inner::Mid(mid) => Some(mid.get_ref()),
            Inner::Active(stream) => Some(stream.get_ref()),
            Inner::Gone => None,
        }
    }

    /// Send close_notify and drop the session. Idempotent.
    pub fn shutdown(&mut self) {
        if let Inner::Active(mut stream) = std::mem::replace(&mut self.inner, Inner::Gone) {
            let _ = stream.shutdown();
            stream.get_mut().close();
        }
    }
}

impl Drop for TlsStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::self_signed_pem;
    use super::*;
    use crate::net::{Endpoint, PollEvents, TcpListenerSocket, TcpSocket};
    use std::thread;
    use std::time::Duration;

    fn drive_handshake(stream: &mut TlsStream) {
        loop {
            match stream.handshake_step().unwrap() {
                HandshakeStatus::Done => return,
                HandshakeStatus::WantRead => {
                    stream
                        .socket()
                        .unwrap()
                        .poll(PollEvents::Read, Some(Duration::from_secs(5)))
                        .unwrap();
                }
                HandshakeStatus::WantWrite => {
                    stream
                        .socket()
                        .unwrap()
                        .poll(PollEvents::Write, Some(Duration::from_secs(5)))
                        .unwrap();
                }
            }
        }
    }

    #[test]
    fn test_handshake_and_echo() {
        let pem = self_signed_pem();
        let server_config = TlsConfig::server()
            .unwrap()
            .cert_pem(&pem)
            .unwrap()
            .build();
        let client_config = TlsConfig::client().unwrap().servername("localhost").build();

        let listener = TcpListenerSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            assert!(listener.poll(Some(Duration::from_secs(5))).unwrap());
            let socket = listener.accept().unwrap().unwrap();
            let mut tls = TlsStream::accept(&server_config, socket).unwrap();
            drive_handshake(&mut tls);

            let mut buf = [0u8; 16];
            let n = loop {
                match tls.read(&mut buf).unwrap() {
                    Some(n) => break n,
                    None => {
                        tls.socket()
                            .unwrap()
                            .poll(PollEvents::Read, Some(Duration::from_secs(5)))
                            .unwrap();
                    }
                }
            };
            assert_eq!(&buf[..n], b"ping");
            assert_eq!(tls.write(b"pong").unwrap(), Some(4));
        });

        let endpoint = Endpoint::from(addr);
        let socket = TcpSocket::connect(&endpoint, Some(Duration::from_secs(5))).unwrap();
        let mut tls = TlsStream::connect(&client_config, socket).unwrap();
        drive_handshake(&mut tls);
        assert!(tls.is_active());

        assert_eq!(tls.write(b"ping").unwrap(), Some(4));
        let mut buf = [0u8; 16];
        let n = loop {
            match tls.read(&mut buf).unwrap() {
                Some(n) => break n,
                None => {
                    tls.socket()
                        .unwrap()
                        .poll(PollEvents::Read, Some(Duration::from_secs(5)))
                        .unwrap();
                }
            }
        };
        assert_eq!(&buf[..n], b"pong");

        handle.join().unwrap();
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let client_config = TlsConfig::client().unwrap().build();
        let listener = TcpListenerSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let _peer = std::net::TcpStream::connect(addr).unwrap();
        listener.poll(Some(Duration::from_secs(2))).unwrap();
        let socket = listener.accept().unwrap().unwrap();

        assert!(matches!(
            TlsStream::accept(&client_config, socket),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_self_signed_pem_loads() {
        let pem = self_signed_pem();
        TlsConfig::server().unwrap().cert_pem(&pem).unwrap().build();
    }
}
