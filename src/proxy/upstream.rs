use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Settings;
use crate::proxy::line_reader::{read_header_block, ReadError};

const CONNECT_HEADERS_MAX_COUNT: usize = 32;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to reach {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send CONNECT to {proxy}: {source}")]
    HandshakeWrite {
        proxy: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read CONNECT response from {proxy}: {source}")]
    HandshakeRead {
        proxy: String,
        #[source]
        source: ReadError,
    },
    #[error("malformed CONNECT response from {proxy}: {reason}")]
    MalformedResponse { proxy: String, reason: String },
    #[error("{proxy} refused the tunnel with status {status} {reason}")]
    Rejected {
        proxy: String,
        status: u16,
        reason: String,
    },
}

/// Dials `address` over TCP within `timeout`.
pub async fn dial(address: &str, timeout: Duration, nodelay: bool) -> io::Result<TcpStream> {
    let socket = connect_within(timeout, TcpStream::connect(address)).await?;
    socket.set_nodelay(nodelay)?;
    Ok(socket)
}

async fn connect_within<T>(
    timeout: Duration,
    connect: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(timeout, connect).await {
        Ok(connected) => connected,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connection timed out after {}s", timeout.as_secs_f32()),
        )),
    }
}

/// Opens outbound byte streams towards CONNECT targets, either directly or
/// through the configured upstream proxy.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    upstream: Option<String>,
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl UpstreamConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            upstream: settings.upstream_proxy.clone(),
            connect_timeout: settings.connect_timeout(),
            tcp_nodelay: settings.tcp_nodelay,
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, ConnectError> {
        dial(address, self.connect_timeout, self.tcp_nodelay)
            .await
            .map_err(|source| ConnectError::Dial {
                address: address.to_owned(),
                source,
            })
    }

    /// Returns a stream that behaves as a transparent pipe to `target`.
    /// `version` is the protocol version of the client's CONNECT request and
    /// is repeated towards the upstream proxy.
    pub async fn connect(&self, target: &str, version: &str) -> Result<TcpStream, ConnectError> {
        let Some(ref upstream) = self.upstream else {
            let socket = self.dial(target).await?;
            debug!("Connected {target}");
            return Ok(socket);
        };

        let mut socket = self.dial(upstream).await?;
        // On error the socket is dropped here, closing the half-negotiated tunnel.
        let status = negotiate_connect(&mut socket, upstream, target, version).await?;
        debug!("Proxy to {target} via {upstream}: {status}");

        Ok(socket)
    }
}

/// Sends a minimal `CONNECT` to an HTTP proxy over `stream` and waits for a
/// 2xx answer. Returns the response status line.
pub async fn negotiate_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    proxy: &str,
    target: &str,
    version: &str,
) -> Result<String, ConnectError> {
    let request = format!("CONNECT {target} {version}\r\n\r\n");
    let write = async {
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await
    };
    write.await.map_err(|source| ConnectError::HandshakeWrite {
        proxy: proxy.to_owned(),
        source,
    })?;

    let block = read_header_block(stream)
        .await
        .map_err(|source| ConnectError::HandshakeRead {
            proxy: proxy.to_owned(),
            source,
        })?;

    let raw = format!("{block}\r\n\r\n");
    let mut headers = [httparse::EMPTY_HEADER; CONNECT_HEADERS_MAX_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(raw.as_bytes())
        .map_err(|e| ConnectError::MalformedResponse {
            proxy: proxy.to_owned(),
            reason: e.to_string(),
        })?;

    let code = response.code.ok_or_else(|| ConnectError::MalformedResponse {
        proxy: proxy.to_owned(),
        reason: "missing status code".to_owned(),
    })?;
    let reason = response.reason.unwrap_or("").to_owned();
    if !(200..300).contains(&code) {
        return Err(ConnectError::Rejected {
            proxy: proxy.to_owned(),
            status: code,
            reason,
        });
    }

    Ok(block.lines().next().unwrap_or_default().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn settings(upstream: Option<String>) -> Settings {
        Settings {
            upstream_proxy: upstream,
            connect_timeout: chrono::Duration::seconds(2),
            ..Settings::default()
        }
    }

    /// Fake upstream proxy answering every CONNECT with `response`, then
    /// echoing whatever the tunnel carries.
    async fn fake_upstream(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_header_block(&mut socket).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            let mut buf = [0u8; 64];
            if let Ok(n) = socket.read(&mut buf).await {
                let _ = socket.write_all(&buf[..n]).await;
            }
            request
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_direct_connect_reaches_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let connector = UpstreamConnector::new(&settings(None));
        let socket = connector.connect(&target.to_string(), "HTTP/1.1").await.unwrap();

        assert_eq!(socket.peer_addr().unwrap(), target);
    }

    #[tokio::test]
    async fn test_direct_connect_failure_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = UpstreamConnector::new(&settings(None));
        let err = connector.connect(&target, "HTTP/1.1").await.unwrap_err();

        assert!(matches!(err, ConnectError::Dial { ref address, .. } if *address == target));
    }

    #[tokio::test]
    async fn test_dial_gives_up_after_the_timeout() {
        let started = tokio::time::Instant::now();
        let err = connect_within::<TcpStream>(
            Duration::from_millis(100),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "connection timed out after 0.1s");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_line_is_written_before_any_read() {
        let (mut proxy_side, mut peer) = tokio::io::duplex(1024);

        let handshake = tokio::spawn(async move {
            negotiate_connect(&mut proxy_side, "proxy.local:8001", "example.com:443", "HTTP/1.1").await
        });

        let expected = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        peer.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await.unwrap();
        let status = handshake.await.unwrap().unwrap();
        assert_eq!(status, "HTTP/1.1 200 Connection established");

        // The handshake task dropped its end; nothing else was sent.
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connect_through_upstream() {
        let (upstream, server) = fake_upstream("HTTP/1.1 200 Connection established\r\nProxy-Agent: test\r\n\r\n").await;

        let connector = UpstreamConnector::new(&settings(Some(upstream)));
        let mut socket = connector.connect("example.com:443", "HTTP/1.1").await.unwrap();

        socket.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        socket.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        assert_eq!(server.await.unwrap(), "CONNECT example.com:443 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let (upstream, _server) = fake_upstream("HTTP/1.1 502 Bad Gateway\r\n\r\n").await;

        let connector = UpstreamConnector::new(&settings(Some(upstream)));
        let err = connector.connect("example.com:443", "HTTP/1.1").await.unwrap_err();

        assert!(matches!(err, ConnectError::Rejected { status: 502, ref reason, .. } if reason == "Bad Gateway"));
    }

    #[tokio::test]
    async fn test_garbage_response_is_malformed() {
        let (upstream, _server) = fake_upstream("SSH-2.0-OpenSSH_9.6\r\n\r\n").await;

        let connector = UpstreamConnector::new(&settings(Some(upstream)));
        let err = connector.connect("example.com:443", "HTTP/1.1").await.unwrap_err();

        assert!(matches!(err, ConnectError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_upstream_closing_early_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let connector = UpstreamConnector::new(&settings(Some(upstream)));
        let err = connector.connect("example.com:443", "HTTP/1.1").await.unwrap_err();

        assert!(matches!(
            err,
            ConnectError::HandshakeRead { source: ReadError::Closed, .. }
                | ConnectError::HandshakeRead { source: ReadError::Io(_), .. }
                | ConnectError::HandshakeWrite { .. }
        ));
    }
}
