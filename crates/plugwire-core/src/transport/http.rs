//! Minimal HTTP/1.1 POST client for talking to devices.
//!
//! Devices run a non-compliant HTTP server that rejects lowercase header
//! names, which rules out the common HTTP client crates (they lowercase every
//! header). [`RawHttpClient`] writes title-case requests over a plain
//! [`TcpStream`] instead.
//!
//! Each request opens its own connection. Devices tie the session to the
//! `TP_SESSIONID` cookie rather than the socket, so the handshake and later
//! commands need not share one.
//!
//! The [`HttpClient`] trait is the seam the handshake, detector and session
//! code are written against, so tests can stand in a scripted device.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Error;

/// Session cookie name used by KLAP devices.
pub const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Content type of handshake and command bodies.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type of plain JSON requests (protocol detection).
pub const JSON: &str = "application/json";

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Value of the `TP_SESSIONID` cookie, if the response set one.
    pub session_cookie: Option<String>,
}

impl HttpResponse {
    /// Creates a response without a session cookie.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            session_cookie: None,
        }
    }

    /// Attaches a session cookie.
    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }
}

/// Sends HTTP POST requests to a single device.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Posts `body` to `path` and returns the device's response.
    ///
    /// `cookie` is the bare `TP_SESSIONID` value; implementations add the
    /// cookie name.
    async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error>;

    /// Returns the device host.
    fn host(&self) -> &str;

    /// Returns the device port.
    fn port(&self) -> u16;
}

#[async_trait]
impl<'a, T: HttpClient + ?Sized> HttpClient for &'a T {
    async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        (**self).post(path, content_type, body, cookie).await
    }

    fn host(&self) -> &str {
        (**self).host()
    }

    fn port(&self) -> u16 {
        (**self).port()
    }
}

/// [`HttpClient`] over a fresh TCP connection per request.
#[derive(Debug, Clone)]
pub struct RawHttpClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl RawHttpClient {
    /// Creates a client for `host:port`; every connect, write and read is
    /// bounded by `timeout`.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn build_request(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Vec<u8> {
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Accept: */*\r\n",
            path,
            self.host,
            self.port,
            content_type,
            body.len()
        );

        if let Some(cookie_value) = cookie {
            request.push_str(&format!(
                "Cookie: {}={}\r\n",
                SESSION_COOKIE_NAME, cookie_value
            ));
        }

        request.push_str("\r\n");

        let mut bytes = request.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }

    async fn read_chunk(&self, stream: &mut TcpStream, buf: &mut [u8]) -> Result<usize, Error> {
        timeout(self.timeout, stream.read(buf))
            .await
            .map_err(|_| Error::Timeout(format!("read from {}:{} timed out", self.host, self.port)))?
            .map_err(|e| Error::ConnectionFailed(format!("read failed: {}", e)))
    }
}

#[async_trait]
impl HttpClient for RawHttpClient {
    async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(addr = %addr, path, bytes = body.len(), "HTTP POST");

        let mut stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connection to {} timed out", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("connection to {} failed: {}", addr, e)))?;

        let request = self.build_request(path, content_type, body, cookie);
        timeout(self.timeout, stream.write_all(&request))
            .await
            .map_err(|_| Error::Timeout(format!("write to {} timed out", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("write failed: {}", e)))?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];

        let header_end = loop {
            let n = self.read_chunk(&mut stream, &mut buf).await?;
            if n == 0 {
                return Err(Error::Protocol(
                    "connection closed before end of HTTP headers".into(),
                ));
            }
            response.extend_from_slice(&buf[..n]);

            if let Some(end) = find_header_end(&response) {
                break end;
            }
        };

        let headers = String::from_utf8_lossy(&response[..header_end]).into_owned();
        let body_start = header_end + 4;

        if let Some(expected_len) = parse_content_length(&headers) {
            while response.len() - body_start < expected_len {
                let n = self.read_chunk(&mut stream, &mut buf).await?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buf[..n]);
            }
            response.truncate(body_start + expected_len);
        }

        let status = parse_status_code(&headers)
            .ok_or_else(|| Error::Protocol("invalid HTTP response: no status code".into()))?;

        debug!(addr = %addr, path, status, "HTTP response");

        Ok(HttpResponse {
            status,
            body: response[body_start..].to_vec(),
            session_cookie: parse_session_cookie(&headers),
        })
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Find the position of "\r\n\r\n" in the response (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the HTTP status code from the response headers.
fn parse_status_code(headers: &str) -> Option<u16> {
    // "HTTP/1.1 200 OK"
    let first_line = headers.lines().next()?;
    first_line.split_whitespace().nth(1)?.parse().ok()
}

/// Parse the Content-Length header value.
fn parse_content_length(headers: &str) -> Option<usize> {
    header_values(headers, "content-length")
        .next()
        .and_then(|value| value.parse().ok())
}

/// Parse the session cookie from the Set-Cookie headers.
fn parse_session_cookie(headers: &str) -> Option<String> {
    header_values(headers, "set-cookie").find_map(|value| {
        value.split(';').find_map(|pair| {
            let (name, cookie) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE_NAME).then(|| cookie.to_string())
        })
    })
}

fn header_values<'a>(headers: &'a str, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers.lines().skip(1).filter_map(move |line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    const HEADERS: &str = "HTTP/1.1 200 OK\r\n\
                           Content-Type: text/html\r\n\
                           Set-Cookie: TP_SESSIONID=ABCDEF0123;TIMEOUT=86400\r\n\
                           Content-Length: 48";

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code(HEADERS), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 403 Forbidden"), Some(403));
        assert_eq!(parse_status_code("garbage"), None);
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length(HEADERS), Some(48));
        assert_eq!(
            parse_content_length("HTTP/1.1 200 OK\r\ncontent-length: 7"),
            Some(7)
        );
        assert_eq!(parse_content_length("HTTP/1.1 200 OK"), None);
    }

    #[test]
    fn test_parse_session_cookie() {
        assert_eq!(parse_session_cookie(HEADERS), Some("ABCDEF0123".into()));
        assert_eq!(
            parse_session_cookie("HTTP/1.1 200 OK\r\nset-cookie: OTHER=1; TP_SESSIONID=xyz"),
            Some("xyz".into())
        );
        assert_eq!(
            parse_session_cookie("HTTP/1.1 200 OK\r\nSet-Cookie: OTHER=1"),
            None
        );
    }

    #[test]
    fn test_request_uses_title_case_headers() {
        let client = RawHttpClient::new("10.0.0.2", 80, Duration::from_secs(1));
        let request = client.build_request("/app/request?seq=5", OCTET_STREAM, b"abc", Some("c00k"));
        let text = String::from_utf8(request).unwrap();

        assert!(text.starts_with("POST /app/request?seq=5 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.2:80\r\n"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Cookie: TP_SESSIONID=c00k\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[tokio::test]
    async fn test_post_against_loopback_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while find_header_end(&request).is_none() {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Set-Cookie: TP_SESSIONID=loopback;TIMEOUT=1440\r\n\
                      Content-Length: 5\r\n\r\nhello",
                )
                .await
                .unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let client = RawHttpClient::new("127.0.0.1", port, Duration::from_secs(5));
        let response = client
            .post("/app/handshake1", OCTET_STREAM, &[0u8; 16], None)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
        assert_eq!(response.session_cookie.as_deref(), Some("loopback"));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /app/handshake1 HTTP/1.1"));
        assert!(!request.contains("Cookie:"));
    }

    #[tokio::test]
    async fn test_post_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let client = RawHttpClient::new("127.0.0.1", port, Duration::from_millis(100));
        let result = client.post("/", JSON, b"{}", None).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        server.abort();
    }
}
