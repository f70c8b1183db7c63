//! Scripted raw-TCP responder.
//!
//! Every accepted connection reads one request (head plus any
//! `Content-Length` body), then writes the script's fragments with a pause
//! between them, and finally either closes or keeps the socket open for a
//! while. The bytes are written verbatim, so a script can produce framing
//! that no compliant server library would.

use std::io;
use std::time::Duration;

use memchr::memmem;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Written in order, each with its own write call.
    pub fragments: Vec<Vec<u8>>,
    /// Sleep before each fragment after the first.
    pub pause: Duration,
    /// Keep the socket open this long after the last fragment.
    pub hold: Duration,
}

impl Script {
    /// A single reply written in one piece, then closed.
    pub fn reply(bytes: &[u8]) -> Self {
        Self {
            fragments: vec![bytes.to_vec()],
            ..Self::default()
        }
    }

    /// `bytes` split at `splits` into separately written fragments.
    pub fn split(bytes: &[u8], splits: &[usize], pause: Duration) -> Self {
        let mut fragments = Vec::new();
        let mut start = 0;
        for &at in splits {
            let at = at.clamp(start, bytes.len());
            fragments.push(bytes[start..at].to_vec());
            start = at;
        }
        fragments.push(bytes[start..].to_vec());
        Self {
            fragments,
            pause,
            hold: Duration::ZERO,
        }
    }

    /// Accept and read the request but never answer until `hold` elapses.
    pub fn silent(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }
}

/// Serve `script` on every connection accepted from `listener`.
pub async fn serve(listener: TcpListener, script: Script) -> io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "raw connection");
        let script = script.clone();
        tokio::spawn(async move {
            if let Err(e) = respond(socket, &script).await {
                warn!(%peer, error = %e, "raw responder failed");
            }
        });
    }
}

async fn respond(mut socket: TcpStream, script: &Script) -> io::Result<()> {
    let request = read_request(&mut socket).await?;
    debug!(bytes = request.len(), "raw request read");

    for (i, fragment) in script.fragments.iter().enumerate() {
        if i > 0 && !script.pause.is_zero() {
            tokio::time::sleep(script.pause).await;
        }
        socket.write_all(fragment).await?;
        socket.flush().await?;
    }
    if !script.hold.is_zero() {
        tokio::time::sleep(script.hold).await;
    }
    socket.shutdown().await
}

/// Read one request head and its `Content-Length` body.
pub async fn read_request(socket: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = memmem::find(&request, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(request);
        }
        request.extend_from_slice(&buf[..n]);
    };

    let body_len = content_length(&request[..head_end]).unwrap_or(0);
    while request.len() < head_end + body_len {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    Ok(request)
}

fn content_length(head: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(head).split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_produces_contiguous_fragments() {
        let script = Script::split(b"abcdef", &[2, 4], Duration::ZERO);
        assert_eq!(script.fragments, vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()]);
    }

    #[test]
    fn split_clamps_out_of_range_points() {
        let script = Script::split(b"abc", &[5, 1], Duration::ZERO);
        assert_eq!(script.fragments.concat(), b"abc");
    }

    #[test]
    fn content_length_is_case_insensitive() {
        let head = b"POST / HTTP/1.1\r\ncontent-LENGTH: 12\r\n\r\n";
        assert_eq!(content_length(head), Some(12));
        assert_eq!(content_length(b"GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn read_request_stops_after_the_declared_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"POST / HTTP/1.1\r\nContent-Length: 3\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.write_all(b"\n\r\nab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            stream.write_all(b"c").await.unwrap();
            stream
        });

        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await.unwrap();
        assert_eq!(request, b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        drop(client.await.unwrap());
    }
}
