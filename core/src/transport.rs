//! Non-blocking sockets and TLS sessions.
//!
//! # Design
//! `connect` issues a non-blocking TCP connect and returns at once; its
//! outcome is observed by the connection on the first writable round.
//! `Stream` wraps the socket, optionally inside a rustls session, together
//! with its registration in the engine's poller. The registration starts with
//! no interest; the engine arms it per round with `Stream::watch`, and `Drop`
//! removes it before the socket is closed.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use polling::{Event, Poller};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::connection::Transport;
use crate::error::EngineError;

/// Start a non-blocking connect to `addr`.
pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Build the rustls client configuration used for every TLS connection of an
/// engine. Without verification any server certificate is accepted.
pub fn client_config(verify_certificate: bool) -> Result<Arc<ClientConfig>, EngineError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if verify_certificate {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        let schemes = provider.signature_verification_algorithms.supported_schemes();
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(schemes)))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Start a client session for `host`, used for SNI and verification.
pub fn tls_session(config: Arc<ClientConfig>, host: &str) -> Result<ClientConnection, EngineError> {
    let name = ServerName::try_from(host.to_string()).map_err(|e| EngineError::InvalidUrl {
        url: host.to_string(),
        reason: e.to_string(),
    })?;
    Ok(ClientConnection::new(config, name)?)
}

#[derive(Debug)]
struct AcceptAnyCertificate(Vec<SignatureScheme>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.clone()
    }
}

enum Io {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

/// A connected (or connecting) socket registered with a poller.
pub struct Stream {
    io: Io,
    poller: Arc<Poller>,
    key: usize,
}

impl Stream {
    /// Register `tcp` with `poller` under `key`, wrapping it in `session`
    /// when given.
    pub fn new(
        tcp: TcpStream,
        session: Option<ClientConnection>,
        poller: Arc<Poller>,
        key: usize,
    ) -> io::Result<Self> {
        // SAFETY: `Drop` deletes the registration before `tcp` is closed.
        unsafe { poller.add(&tcp, Event::none(key))? };
        let io = match session {
            Some(conn) => Io::Tls(Box::new(StreamOwned::new(conn, tcp))),
            None => Io::Plain(tcp),
        };
        Ok(Self { io, poller, key })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.io, Io::Tls(_))
    }

    /// Replace the poller interest for the next wait.
    pub fn watch(&self, readable: bool, writable: bool) -> io::Result<()> {
        self.poller
            .modify(self.tcp(), Event::new(self.key, readable, writable))
    }

    fn tcp(&self) -> &TcpStream {
        match &self.io {
            Io::Plain(tcp) => tcp,
            Io::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.io {
            Io::Plain(tcp) => tcp.read(buf),
            Io::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.io {
            Io::Plain(tcp) => tcp.write(buf),
            Io::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.io {
            Io::Plain(tcp) => tcp.flush(),
            Io::Tls(tls) => tls.flush(),
        }
    }
}

impl Transport for Stream {
    fn take_connect_error(&mut self) -> io::Result<Option<io::Error>> {
        self.tcp().take_error()
    }

    fn wants_read(&self) -> bool {
        match &self.io {
            Io::Plain(_) => false,
            Io::Tls(tls) => tls.conn.is_handshaking() && !tls.conn.wants_write(),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.poller.delete(self.tcp()) {
            trace!(key = self.key, error = %e, "poller deregistration failed");
        }
    }
}
