//! FastCGI transport.
//!
//! # Responsibilities
//! - Speak the FastCGI responder role to a backend over TCP
//! - Translate the forwarded request into CGI parameters
//! - Parse the CGI response header (`Status:`) into an HTTP response
//!
//! # Design Decisions
//! - One connection per request (`FCGI_KEEP_CONN` is never set), so
//!   there is no pool to invalidate
//! - The response body is streamed from STDOUT records as they arrive;
//!   STDERR output is logged, never forwarded

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use crate::http::request::OutRequest;
use crate::transport::{Transport, TransportError, TransportErrorKind, TransportSettings};

const VERSION_1: u8 = 1;
const BEGIN_REQUEST: u8 = 1;
const END_REQUEST: u8 = 3;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
const STDOUT: u8 = 6;
const STDERR: u8 = 7;
const ROLE_RESPONDER: u16 = 1;
const REQUEST_ID: u16 = 1;
const MAX_CONTENT: usize = 65_535;
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// FastCGI client for one cluster.
#[derive(Debug)]
pub struct FcgiTransport {
    connect_timeout: Duration,
    response_header_timeout: Duration,
    root: String,
    env: BTreeMap<String, String>,
}

impl FcgiTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            response_header_timeout: settings.response_header_timeout,
            root: settings.fcgi.root.trim_end_matches('/').to_string(),
            env: settings.fcgi.env.clone(),
        }
    }

    fn params(&self, req: &OutRequest, backend: SocketAddr) -> Vec<(String, String)> {
        let path = req.uri.path();
        let query = req.uri.query().unwrap_or("");
        let request_uri = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(path);

        let mut params = vec![
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("SERVER_SOFTWARE".to_string(), "edge-proxy".to_string()),
            ("SERVER_PROTOCOL".to_string(), format!("{:?}", req.version)),
            ("REQUEST_METHOD".to_string(), req.method.to_string()),
            ("REQUEST_URI".to_string(), request_uri.to_string()),
            ("QUERY_STRING".to_string(), query.to_string()),
            ("SCRIPT_NAME".to_string(), path.to_string()),
            ("SCRIPT_FILENAME".to_string(), format!("{}{}", self.root, path)),
            ("DOCUMENT_ROOT".to_string(), self.root.clone()),
            ("SERVER_ADDR".to_string(), backend.ip().to_string()),
            ("SERVER_PORT".to_string(), backend.port().to_string()),
            ("CONTENT_LENGTH".to_string(), req.body.len().to_string()),
        ];
        if let Some(ct) = req.headers.get("content-type").and_then(|v| v.to_str().ok()) {
            params.push(("CONTENT_TYPE".to_string(), ct.to_string()));
        }
        if let Some(client) = req
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
        {
            params.push(("REMOTE_ADDR".to_string(), client.trim().to_string()));
        }
        for (name, value) in &req.headers {
            if name == "content-type" || name == "content-length" {
                continue;
            }
            let Ok(value) = value.to_str() else { continue };
            let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            params.push((key, value.to_string()));
        }
        params.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }
}

#[async_trait]
impl Transport for FcgiTransport {
    async fn round_trip(&self, req: &OutRequest) -> Result<Response<Body>, TransportError> {
        let Some(addr) = req.backend else {
            return Err(TransportError::new(
                TransportErrorKind::Other,
                "request is not bound to a backend",
            ));
        };

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::new(
                    TransportErrorKind::Connect,
                    format!("{addr}: {e}"),
                ))
            }
            Err(_) => {
                return Err(TransportError::new(
                    TransportErrorKind::Connect,
                    format!("{addr}: connect timed out"),
                ))
            }
        };
        let (read_half, mut write_half) = stream.into_split();

        let payload = encode_request(&self.params(req, addr), &req.body);
        write_half.write_all(&payload).await.map_err(|e| {
            TransportError::new(TransportErrorKind::WriteRequest, format!("{addr}: {e}"))
        })?;

        let mut reader = RecordReader::new(read_half);
        let head = tokio::time::timeout(self.response_header_timeout, reader.read_head())
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::ResponseHeaderTimeout,
                    format!("no response header from {addr}"),
                )
            })?
            .map_err(|e| TransportError::new(TransportErrorKind::ReadResponseHeader, e.to_string()))?;

        let (status, headers, leftover) = parse_head(head)
            .map_err(|e| TransportError::new(TransportErrorKind::ReadResponseHeader, e.to_string()))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        // keep the write half alive until the body is drained
        let records = stream::unfold((reader, write_half), |(mut reader, writer)| async move {
            match reader.next_stdout().await {
                Ok(Some(chunk)) => Some((Ok::<_, io::Error>(chunk), (reader, writer))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (reader, writer))),
            }
        });
        let body = stream::iter((!leftover.is_empty()).then(|| Ok(leftover))).chain(records);

        builder
            .body(Body::from_stream(body))
            .map_err(|e| TransportError::new(TransportErrorKind::ReadResponseHeader, e.to_string()))
    }
}

fn write_record(buf: &mut BytesMut, kind: u8, content: &[u8]) {
    let padding = (8 - content.len() % 8) % 8;
    buf.put_u8(VERSION_1);
    buf.put_u8(kind);
    buf.put_u16(REQUEST_ID);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding);
}

fn write_stream(buf: &mut BytesMut, kind: u8, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT) {
        write_record(buf, kind, chunk);
    }
    write_record(buf, kind, &[]);
}

fn encode_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

fn encode_request(params: &[(String, String)], body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(1024 + body.len());

    let mut begin = BytesMut::with_capacity(8);
    begin.put_u16(ROLE_RESPONDER);
    begin.put_bytes(0, 6);
    write_record(&mut out, BEGIN_REQUEST, &begin);

    let mut encoded = BytesMut::new();
    for (name, value) in params {
        encode_length(&mut encoded, name.len());
        encode_length(&mut encoded, value.len());
        encoded.put_slice(name.as_bytes());
        encoded.put_slice(value.as_bytes());
    }
    write_stream(&mut out, PARAMS, &encoded);
    write_stream(&mut out, STDIN, body);
    out
}

struct RecordReader {
    inner: BufReader<OwnedReadHalf>,
    finished: bool,
}

impl RecordReader {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(read),
            finished: false,
        }
    }

    /// Next record as `(type, content)`, or `None` at clean EOF.
    async fn read_record(&mut self) -> io::Result<Option<(u8, Bytes)>> {
        let mut header = [0u8; 8];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut fields = &header[..];
        let _version = fields.get_u8();
        let kind = fields.get_u8();
        let _request_id = fields.get_u16();
        let content_len = fields.get_u16() as usize;
        let padding = fields.get_u8() as usize;

        let mut content = vec![0u8; content_len + padding];
        self.inner.read_exact(&mut content).await?;
        content.truncate(content_len);
        Ok(Some((kind, Bytes::from(content))))
    }

    /// Next non-empty STDOUT payload, or `None` once the request ended.
    async fn next_stdout(&mut self) -> io::Result<Option<Bytes>> {
        while !self.finished {
            match self.read_record().await? {
                Some((STDOUT, data)) if !data.is_empty() => return Ok(Some(data)),
                Some((STDERR, data)) if !data.is_empty() => {
                    tracing::warn!(stderr = %String::from_utf8_lossy(&data), "FastCGI backend wrote to stderr");
                }
                Some((END_REQUEST, _)) | None => self.finished = true,
                Some(_) => {}
            }
        }
        Ok(None)
    }

    /// Collect STDOUT until the CGI header terminator has been seen.
    async fn read_head(&mut self) -> io::Result<BytesMut> {
        let mut head = BytesMut::new();
        loop {
            if find_header_end(&head).is_some() {
                return Ok(head);
            }
            if head.len() > MAX_HEADER_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "FastCGI response header too large",
                ));
            }
            match self.next_stdout().await? {
                Some(chunk) => head.extend_from_slice(&chunk),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "FastCGI request ended before the response header",
                    ))
                }
            }
        }
    }
}

/// Returns `(header_len, terminator_len)`.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

type Head = (StatusCode, Vec<(HeaderName, HeaderValue)>, Bytes);

fn parse_head(mut buf: BytesMut) -> io::Result<Head> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
    let (len, terminator) = find_header_end(&buf).ok_or_else(|| invalid("missing header end"))?;
    let head = buf.split_to(len);
    buf.advance(terminator);

    let text = std::str::from_utf8(&head).map_err(|_| invalid("header is not utf-8"))?;
    let mut status = None;
    let mut headers = Vec::new();
    let mut has_location = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid("malformed header line"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or("");
            let code = code
                .parse::<u16>()
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| invalid("invalid Status header"))?;
            status = Some(code);
            continue;
        }
        if name.eq_ignore_ascii_case("location") {
            has_location = true;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid("invalid header name"))?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid("invalid header value"))?;
        headers.push((name, value));
    }

    let status = status.unwrap_or(if has_location {
        StatusCode::FOUND
    } else {
        StatusCode::OK
    });
    Ok((status, headers, buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FcgiConfig, PoolConfig};
    use crate::transport::BackendProtocol;
    use axum::http::{HeaderMap, Method};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn decode_params(mut data: &[u8]) -> HashMap<String, String> {
        fn len(data: &mut &[u8]) -> usize {
            if data[0] & 0x80 == 0 {
                data.get_u8() as usize
            } else {
                (data.get_u32() & 0x7fff_ffff) as usize
            }
        }
        let mut out = HashMap::new();
        while !data.is_empty() {
            let n = len(&mut data);
            let v = len(&mut data);
            let name = String::from_utf8(data[..n].to_vec()).unwrap();
            data.advance(n);
            let value = String::from_utf8(data[..v].to_vec()).unwrap();
            data.advance(v);
            out.insert(name, value);
        }
        out
    }

    async fn read_request(socket: &mut TcpStream) -> (HashMap<String, String>, Vec<u8>) {
        let mut params = Vec::new();
        let mut stdin = Vec::new();
        loop {
            let mut header = [0u8; 8];
            socket.read_exact(&mut header).await.unwrap();
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut content = vec![0u8; len + header[6] as usize];
            socket.read_exact(&mut content).await.unwrap();
            content.truncate(len);
            match header[1] {
                PARAMS => params.extend_from_slice(&content),
                STDIN if content.is_empty() => break,
                STDIN => stdin.extend_from_slice(&content),
                _ => {}
            }
        }
        (decode_params(&params), stdin)
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            protocol: BackendProtocol::Fcgi,
            connect_timeout: Duration::from_secs(1),
            response_header_timeout: Duration::from_secs(1),
            pool: PoolConfig::default(),
            fcgi: FcgiConfig {
                root: "/srv/app/".into(),
                env: BTreeMap::from([("APP_ENV".to_string(), "test".to_string())]),
            },
        }
    }

    #[tokio::test]
    async fn forwards_params_and_streams_stdout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (params, stdin) = read_request(&mut socket).await;

            let mut out = BytesMut::new();
            write_record(&mut out, STDOUT, b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmis");
            write_record(&mut out, STDERR, b"notice");
            write_record(&mut out, STDOUT, b"sing");
            write_record(&mut out, STDOUT, b"");
            write_record(&mut out, END_REQUEST, &[0u8; 8]);
            socket.write_all(&out).await.unwrap();
            (params, stdin)
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        let mut req = OutRequest::new(
            Method::POST,
            "/index.php?a=1".parse().unwrap(),
            headers,
            Bytes::from_static(b"payload"),
        );
        req.set_backend(addr);

        let transport = FcgiTransport::new(&settings());
        let resp = transport.round_trip(&req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"missing");

        let (params, stdin) = server.await.unwrap();
        assert_eq!(params["REQUEST_METHOD"], "POST");
        assert_eq!(params["SCRIPT_FILENAME"], "/srv/app/index.php");
        assert_eq!(params["QUERY_STRING"], "a=1");
        assert_eq!(params["HTTP_X_TRACE"], "abc");
        assert_eq!(params["APP_ENV"], "test");
        assert_eq!(params["CONTENT_LENGTH"], "7");
        assert_eq!(stdin, b"payload");
    }

    #[tokio::test]
    async fn end_before_header_is_a_header_read_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            let mut out = BytesMut::new();
            write_record(&mut out, END_REQUEST, &[0u8; 8]);
            socket.write_all(&out).await.unwrap();
        });

        let mut req = OutRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new(), Bytes::new());
        req.set_backend(addr);
        let err = FcgiTransport::new(&settings()).round_trip(&req).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::ReadResponseHeader);
    }

    #[test]
    fn location_without_status_is_a_redirect() {
        let (status, headers, rest) =
            parse_head(BytesMut::from(&b"Location: /next\n\nbody"[..])).unwrap();
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers[0].0, "location");
        assert_eq!(&rest[..], b"body");
    }
}
