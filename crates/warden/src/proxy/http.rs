//! Minimal HTTP/1.1 head handling for the forward proxy

use base64::Engine as _;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header carrying the session id for clients that cannot set proxy credentials
pub const SESSION_HEADER: &str = "x-warden-session";

pub type Headers = Vec<(String, String)>;

pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Read until the blank line ending a message head. Returns the head and
/// whatever body bytes arrived with it; `None` on a clean EOF before any
/// byte.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > max {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message head too large"));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside message head"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<Headers> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| invalid("malformed header line"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

pub fn parse_request(head: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(head).map_err(|_| invalid("request head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let first = lines.next().ok_or_else(|| invalid("empty request"))?;
    let mut parts = first.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(invalid("malformed request line")),
    };
    Ok(RequestHead {
        method: method.to_uppercase(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_headers(lines)?,
    })
}

pub fn parse_response(head: &[u8]) -> io::Result<ResponseHead> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let first = lines.next().ok_or_else(|| invalid("empty response"))?;
    let mut parts = first.splitn(3, ' ');
    let version = parts.next().unwrap_or_default().to_string();
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("malformed status line"))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers: parse_headers(lines)?,
    })
}

/// Destination of a proxied request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    /// Origin-form path for plain HTTP; empty for CONNECT
    pub path: String,
}

/// `host:port` authority, with bracketed IPv6 literals
pub fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None if !authority.is_empty() => Some((authority.to_string(), default_port)),
        None => None,
    }
}

/// Destination of an absolute-form `http://` request target
pub fn parse_absolute(target: &str) -> Option<Destination> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("HTTP://"))?;
    let (authority, path) = match rest.find(['/', '?']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    // userinfo is never forwarded
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let (host, port) = parse_authority(authority, 80)?;
    let path = if path.starts_with('?') {
        format!("/{}", path)
    } else {
        path.to_string()
    };
    Some(Destination { host, port, path })
}

/// Session and actor from `Proxy-Authorization: Basic` or `X-Warden-Session`
pub fn identity(headers: &Headers) -> Option<(String, String)> {
    if let Some(value) = header(headers, "proxy-authorization") {
        let mut parts = value.splitn(2, ' ');
        if let (Some(scheme), Some(encoded)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("basic") {
                if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
                    let decoded = String::from_utf8_lossy(&decoded).to_string();
                    let (session, actor) = match decoded.split_once(':') {
                        Some((s, a)) => (s.to_string(), a.to_string()),
                        None => (decoded.clone(), String::new()),
                    };
                    if !session.is_empty() {
                        return Some((session, actor));
                    }
                }
            }
        }
    }
    header(headers, SESSION_HEADER).map(|s| (s.to_string(), String::new()))
}

/// Request head rewritten to origin-form for the upstream server
pub fn upstream_request(head: &RequestHead, dest: &Destination) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, dest.path);
    let host = if dest.host.contains(':') {
        format!("[{}]", dest.host)
    } else {
        dest.host.clone()
    };
    if dest.port == 80 {
        out.push_str(&format!("Host: {}\r\n", host));
    } else {
        out.push_str(&format!("Host: {}:{}\r\n", host, dest.port));
    }

    let connection_tokens: Vec<String> = header(&head.headers, "connection")
        .map(|v| v.split(',').map(|t| t.trim().to_lowercase()).collect())
        .unwrap_or_default();
    for (name, value) in &head.headers {
        let lower = name.to_lowercase();
        if lower == "host"
            || lower == SESSION_HEADER
            || lower.starts_with("proxy-")
            || (HOP_BY_HOP.contains(&lower.as_str()) && lower != "transfer-encoding")
            || connection_tokens.contains(&lower)
        {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// Whether a response body may be buffered and redacted
pub fn is_textual(headers: &Headers) -> bool {
    if let Some(encoding) = header(headers, "content-encoding") {
        if !encoding.eq_ignore_ascii_case("identity") {
            return false;
        }
    }
    let content_type = match header(headers, "content-type") {
        Some(ct) => ct.to_lowercase(),
        None => return false,
    };
    content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("xml")
        || content_type.contains("javascript")
}

pub fn is_chunked(headers: &Headers) -> bool {
    header(headers, "transfer-encoding")
        .map(|te| te.to_lowercase().contains("chunked"))
        .unwrap_or(false)
}

pub fn content_length(headers: &Headers) -> Option<usize> {
    header(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

/// Response head with a fixed body length and the connection closed
pub fn rewritten_response(head: &ResponseHead, body_len: usize) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", head.version, head.status, head.reason);
    for (name, value) in &head.headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body_len));
    out.into_bytes()
}

/// Complete chunked body decoded, or `None` while more bytes are needed.
/// Errors on malformed framing.
pub fn decode_chunked(buf: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = match buf[pos..].windows(2).position(|w| w == b"\r\n") {
            Some(i) => pos + i,
            None => return Ok(None),
        };
        let size_line = String::from_utf8_lossy(&buf[pos..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16).map_err(|_| invalid("bad chunk size"))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailers end with an empty line
            let tail = &buf[pos..];
            let done = tail.starts_with(b"\r\n") || tail.windows(4).any(|w| w == b"\r\n\r\n");
            return Ok(if done { Some(out) } else { None });
        }
        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        out.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

/// A complete plain-text response written by the proxy itself
pub fn simple_response(status: u16, reason: &str, extra: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in extra {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!(
        "Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_head_splits_body() {
        let data = b"POST http://a/ HTTP/1.1\r\nHost: a\r\n\r\nbody".to_vec();
        let (head, rest) = read_head(&mut data.as_slice(), 1024).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, b"body");
        assert!(read_head(&mut &b""[..], 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_head_limit() {
        let data = vec![b'a'; 200];
        assert!(read_head(&mut data.as_slice(), 64).await.is_err());
    }

    #[test]
    fn test_parse_absolute() {
        let dest = parse_absolute("http://example.com:8080/a/b?c=1").unwrap();
        assert_eq!(dest.host, "example.com");
        assert_eq!(dest.port, 8080);
        assert_eq!(dest.path, "/a/b?c=1");

        let dest = parse_absolute("http://user:pw@[::1]?x").unwrap();
        assert_eq!(dest.host, "::1");
        assert_eq!(dest.port, 80);
        assert_eq!(dest.path, "/?x");

        assert!(parse_absolute("/relative").is_none());
        assert!(parse_absolute("https://example.com/").is_none());
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(parse_authority("github.com:443", 443), Some(("github.com".into(), 443)));
        assert_eq!(parse_authority("[2001:db8::1]:22", 443), Some(("2001:db8::1".into(), 22)));
        assert_eq!(parse_authority("host", 443), Some(("host".into(), 443)));
        assert_eq!(parse_authority("host:notaport", 443), None);
    }

    #[test]
    fn test_identity() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("sess-1:claude");
        let headers = vec![("Proxy-Authorization".to_string(), format!("Basic {}", encoded))];
        assert_eq!(identity(&headers), Some(("sess-1".into(), "claude".into())));

        let headers = vec![("X-Warden-Session".to_string(), "sess-2".to_string())];
        assert_eq!(identity(&headers), Some(("sess-2".into(), String::new())));
        assert_eq!(identity(&Vec::new()), None);
    }

    #[test]
    fn test_upstream_request_strips_proxy_headers() {
        let head = parse_request(
            b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic abc\r\nX-Warden-Session: s\r\nConnection: keep-alive, X-Trace\r\nX-Trace: 1\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();
        let dest = parse_absolute(&head.target).unwrap();
        let out = String::from_utf8(upstream_request(&head, &dest)).unwrap();
        assert!(out.starts_with("GET /x HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(out.contains("Accept: */*\r\n"));
        assert!(!out.contains("Proxy-Authorization"));
        assert!(!out.contains("X-Warden-Session"));
        assert!(!out.contains("X-Trace"));
        assert!(out.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_textual_detection() {
        let json = vec![("Content-Type".to_string(), "application/json".to_string())];
        assert!(is_textual(&json));
        let mut gzipped = json.clone();
        gzipped.push(("Content-Encoding".to_string(), "gzip".to_string()));
        assert!(!is_textual(&gzipped));
        let binary = vec![("Content-Type".to_string(), "image/png".to_string())];
        assert!(!is_textual(&binary));
    }

    #[test]
    fn test_decode_chunked() {
        assert_eq!(
            decode_chunked(b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n").unwrap(),
            Some(b"hello world".to_vec())
        );
        assert_eq!(decode_chunked(b"5\r\nhel").unwrap(), None);
        assert!(decode_chunked(b"zz\r\n").is_err());
    }

    #[test]
    fn test_parse_response_and_rewrite() {
        let head =
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(head.status, 200);
        assert!(is_chunked(&head.headers));
        let out = String::from_utf8(rewritten_response(&head, 12)).unwrap();
        assert!(out.contains("Content-Length: 12\r\n"));
        assert!(!out.contains("Transfer-Encoding"));
    }
}
