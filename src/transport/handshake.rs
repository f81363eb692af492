/// HTTP upgrade handshake for both ends of the transport
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Fixed GUID appended to the request key when deriving the accept key.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEAD_LEN: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted { accept_key: Option<String> },
    Rejected(String),
}

/// Parsed upgrade request as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub path: String,
    pub key: String,
}

pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// `base64(sha1(key + GUID))`
pub fn accept_key_for(key: &str) -> String {
    let digest = sha1_smol::Sha1::from(format!("{}{}", key.trim(), ACCEPT_GUID)).digest();
    STANDARD.encode(digest.bytes())
}

/// Builds the upgrade request. Returns the bytes to send and the key used.
pub fn build_handshake_request(host: &str, path: &str) -> (Vec<u8>, String) {
    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    (request.into_bytes(), key)
}

/// Accepts on a `101` status line alone; the accept key is returned for
/// optional verification by the caller.
pub fn parse_handshake_response(lines: &[&str]) -> HandshakeOutcome {
    let Some(status) = lines.first() else {
        return HandshakeOutcome::Rejected("empty response".to_string());
    };
    let mut parts = status.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") || code != "101" {
        return HandshakeOutcome::Rejected(status.trim().to_string());
    }

    let accept_key = lines[1..]
        .iter()
        .find_map(|line| header_value(line, "sec-websocket-accept"))
        .map(str::to_string);
    HandshakeOutcome::Accepted { accept_key }
}

pub fn parse_handshake_request(head: &str) -> Result<ClientHello, ProtocolError> {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some("GET"), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::MalformedHandshake(format!(
            "bad request line {:?}",
            request_line
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(ProtocolError::MalformedHandshake(format!(
            "unsupported version {}",
            version
        )));
    }

    let mut upgrade = false;
    let mut key = None;
    for line in lines {
        if let Some(value) = header_value(line, "upgrade") {
            upgrade = value.eq_ignore_ascii_case("websocket");
        } else if let Some(value) = header_value(line, "sec-websocket-key") {
            key = Some(value.to_string());
        }
    }
    if !upgrade {
        return Err(ProtocolError::MalformedHandshake(
            "missing upgrade header".to_string(),
        ));
    }
    let key = key.ok_or_else(|| {
        ProtocolError::MalformedHandshake("missing Sec-WebSocket-Key".to_string())
    })?;

    Ok(ClientHello {
        path: path.to_string(),
        key,
    })
}

pub fn build_handshake_response(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key_for(key)
    )
    .into_bytes()
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    key.trim()
        .eq_ignore_ascii_case(name)
        .then(|| value.trim())
}

/// Reads up to the blank line ending an HTTP head. Bytes read past it are
/// returned so the frame reader can start from them.
pub async fn read_http_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(String, Vec<u8>), ProtocolError> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end + 4);
            let head = String::from_utf8(buf).map_err(|_| {
                ProtocolError::MalformedHandshake("head is not valid utf-8".to_string())
            })?;
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(ProtocolError::MalformedHandshake("head too long".to_string()));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Client side of the upgrade. Returns any bytes received after the head.
pub async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    strict: bool,
) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, key) = build_handshake_request(host, path);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let (head, leftover) = read_http_head(stream).await?;
    let lines: Vec<&str> = head.lines().collect();
    match parse_handshake_response(&lines) {
        HandshakeOutcome::Accepted { accept_key } => {
            if strict && accept_key.as_deref() != Some(accept_key_for(&key).as_str()) {
                return Err(ProtocolError::AcceptMismatch);
            }
            debug!("Handshake accepted by {}", host);
            Ok(leftover)
        }
        HandshakeOutcome::Rejected(status) => Err(ProtocolError::HandshakeRejected(status)),
    }
}

/// Server side of the upgrade. Malformed requests get a `400` before the error is returned.
pub async fn server_handshake<S>(stream: &mut S) -> Result<(ClientHello, Vec<u8>), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_http_head(stream).await?;
    match parse_handshake_request(&head) {
        Ok(hello) => {
            stream.write_all(&build_handshake_response(&hello.key)).await?;
            stream.flush().await?;
            Ok((hello, leftover))
        }
        Err(e) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_reference_vector() {
        assert_eq!(
            accept_key_for("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn request_carries_upgrade_headers_and_fresh_key() {
        let (bytes, key) = build_handshake_request("192.168.4.1:8765", "/ws");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: 192.168.4.1:8765\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", key)));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);

        let (_, other) = build_handshake_request("h", "/");
        assert_ne!(key, other);
    }

    #[test]
    fn response_is_accepted_on_status_line() {
        assert_eq!(
            parse_handshake_response(&["HTTP/1.1 101 Switching Protocols"]),
            HandshakeOutcome::Accepted { accept_key: None }
        );
        assert_eq!(
            parse_handshake_response(&[
                "HTTP/1.1 101 Switching Protocols",
                "sec-websocket-accept:  abc= ",
            ]),
            HandshakeOutcome::Accepted {
                accept_key: Some("abc=".into())
            }
        );
        assert!(matches!(
            parse_handshake_response(&["HTTP/1.1 403 Forbidden"]),
            HandshakeOutcome::Rejected(_)
        ));
        assert!(matches!(parse_handshake_response(&[]), HandshakeOutcome::Rejected(_)));
    }

    #[test]
    fn server_parses_request_built_by_client() {
        let (bytes, key) = build_handshake_request("gw", "/ws");
        let hello = parse_handshake_request(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(hello, ClientHello { path: "/ws".into(), key });
    }

    #[test]
    fn server_rejects_plain_http() {
        let head = "GET / HTTP/1.1\r\nHost: gw\r\n\r\n";
        assert!(matches!(
            parse_handshake_request(head),
            Err(ProtocolError::MalformedHandshake(_))
        ));
        assert!(parse_handshake_request("POST /ws HTTP/1.1\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn both_ends_complete_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_side = tokio::spawn(async move {
            let (hello, leftover) = server_handshake(&mut server).await.unwrap();
            server.write_all(b"\x81\x04PING").await.unwrap();
            (hello, leftover)
        });

        let leftover = client_handshake(&mut client, "gw", "/ws", true).await.unwrap();
        let (hello, server_leftover) = server_side.await.unwrap();
        assert_eq!(hello.path, "/ws");
        assert!(server_leftover.is_empty());

        // any frame bytes that arrived with the head are handed back
        let mut rest = leftover;
        while rest.len() < 6 {
            let mut byte = [0u8; 1];
            client.read_exact(&mut byte).await.unwrap();
            rest.push(byte[0]);
        }
        assert_eq!(rest, b"\x81\x04PING");
    }

    #[tokio::test]
    async fn strict_client_rejects_wrong_accept_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = read_http_head(&mut server).await;
            let response = b"HTTP/1.1 101 Switching Protocols\r\n\
                Sec-WebSocket-Accept: nope\r\n\r\n";
            server.write_all(response).await.unwrap();
        });
        assert!(matches!(
            client_handshake(&mut client, "gw", "/ws", true).await,
            Err(ProtocolError::AcceptMismatch)
        ));
    }
}
