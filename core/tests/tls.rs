//! HTTPS against a local rustls server with a self-signed certificate.
//!
//! The server is a blocking thread around `rustls::StreamOwned`; each
//! connection reads one request head and writes a canned reply, then either
//! sends `close_notify` or drops the socket without it.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;

use memchr::memmem;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use volley_core::{Client, EngineConfig, TransferError};

#[derive(Clone, Copy)]
enum Ending {
    CloseNotify,
    Drop,
}

fn server_config() -> Arc<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key)
    .unwrap();
    Arc::new(config)
}

/// Serve `reply` to every connection and return the `https://localhost` base.
fn tls_server(reply: &'static [u8], ending: Ending) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = server_config();

    std::thread::spawn(move || {
        for tcp in listener.incoming().flatten() {
            let conn = ServerConnection::new(config.clone()).unwrap();
            // Handshake failures are the client's business; keep serving.
            let _ = serve(StreamOwned::new(conn, tcp), reply, ending);
        }
    });
    format!("https://localhost:{port}")
}

fn serve(
    mut stream: StreamOwned<ServerConnection, TcpStream>,
    reply: &[u8],
    ending: Ending,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while memmem::find(&head, b"\r\n\r\n").is_none() {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }

    stream.write_all(reply)?;
    if let Ending::CloseNotify = ending {
        stream.conn.send_close_notify();
    }
    stream.flush()?;
    stream.sock.shutdown(Shutdown::Write)
}

fn client(verify: bool) -> Client {
    Client::new(EngineConfig::new(verify, 5_000, 5_000)).unwrap()
}

#[test]
fn fixed_length_body_over_tls() {
    let base = tls_server(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        Ending::CloseNotify,
    );
    let mut client = client(false);

    let response = client.get(&format!("{base}/"), &[]).unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert!(client.was_sent());
}

#[test]
fn close_delimited_body_without_close_notify() {
    let base = tls_server(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nuntil close",
        Ending::Drop,
    );
    let mut client = client(false);

    let response = client.get(&format!("{base}/"), &[]).unwrap().unwrap();
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.text(), "until close");
}

#[test]
fn close_delimited_body_with_close_notify() {
    let base = tls_server(b"HTTP/1.0 200 OK\r\n\r\nbye", Ending::CloseNotify);
    let mut client = client(false);

    let response = client.get(&format!("{base}/"), &[]).unwrap().unwrap();
    assert_eq!(response.version, "HTTP/1.0");
    assert_eq!(response.text(), "bye");
}

#[test]
fn verified_client_rejects_a_self_signed_certificate() {
    let base = tls_server(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        Ending::CloseNotify,
    );
    let mut client = client(true);

    assert!(client.get(&format!("{base}/"), &[]).unwrap().is_none());
    match client.last_error() {
        Some(TransferError::Protocol(err)) => panic!("handshake failure parsed as {err:?}"),
        Some(err) => assert!(!err.is_timeout(), "handshake failure timed out: {err:?}"),
        None => panic!("expected a handshake failure"),
    }
}
