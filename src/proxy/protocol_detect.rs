/// TLS handshake record: content type 0x16, major version 0x03.
const TLS_RECORD_PREFIX: [u8; 2] = [0x16, 0x03];

/// Whether the first bytes of a connection look like a TLS ClientHello,
/// i.e. a client configured with `https://` for this plain HTTP proxy.
pub async fn detect_tls(
    stream: &tokio::net::TcpStream,
) -> std::io::Result<bool> {
    let mut buf = [0u8; 3];
    let n = stream.peek(&mut buf).await?;

    Ok(looks_like_tls(&buf[..n]))
}

fn looks_like_tls(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix.starts_with(&TLS_RECORD_PREFIX)
}
