//! HTTP(S) endpoint the appliance polls in place of the vendor cloud.
//!
//! Requests are handled one thread per connection. The device sends
//! `GET` or `POST` to `.../GetBasicCommands` and `.../GetAllCommands`;
//! anything else is a 404.

pub mod proxy;
pub mod router;
pub mod tls;

pub use proxy::{DeviceFetcher, HttpDeviceProxy};
pub use router::{extract_xml, RequestRouter};

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(200);
const BASIC_COMMANDS: &str = "/GetBasicCommands";
const ALL_COMMANDS: &str = "/GetAllCommands";

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct HttpServer {
    addr: String,
    tls: Option<Arc<rustls::ServerConfig>>,
    router: Arc<RequestRouter>,
}

impl HttpServer {
    pub fn new(addr: impl Into<String>, router: Arc<RequestRouter>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            router,
        }
    }

    /// Serve HTTPS with `config` instead of plain HTTP.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!(
            "Listening for devices on {} ({})",
            addr,
            if self.tls.is_some() { "https" } else { "http" }
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            run_server(move || listener.accept(), self.router, self.tls, shutdown_thread);
            log::debug!("http server on {} stopped", addr);
        });

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// Accepts until `shutdown` is set. Accept errors (fd exhaustion, aborted
/// handshakes) are logged and retried.
fn run_server<A>(
    mut accept: A,
    router: Arc<RequestRouter>,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: Arc<AtomicBool>,
) where
    A: FnMut() -> std::io::Result<(TcpStream, SocketAddr)>,
{
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match accept() {
            Ok((stream, peer)) => {
                let router = router.clone();
                let tls = tls.clone();
                std::thread::spawn(move || {
                    if let Err(err) = serve_connection(stream, peer, &router, tls) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: &RequestRouter,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    match tls {
        Some(config) => {
            let conn = rustls::ServerConnection::new(config)?;
            let mut tls_stream = rustls::StreamOwned::new(conn, stream);
            handle_connection(&mut tls_stream, peer, router)?;
            tls_stream.conn.send_close_notify();
            tls_stream.flush()?;
        }
        None => {
            let mut stream = stream;
            handle_connection(&mut stream, peer, router)?;
        }
    }
    Ok(())
}

fn handle_connection<S: Read + Write>(
    stream: &mut S,
    peer: SocketAddr,
    router: &RequestRouter,
) -> Result<()> {
    let request = read_request(stream)?;
    let client_ip = request
        .forwarded_for()
        .unwrap_or_else(|| normalize_ip(peer.ip()).to_string());
    log::debug!("{} {} from {}", request.method, request.path, client_ip);

    if request.method != "GET" && request.method != "POST" {
        return write_response(stream, 405, "text/plain", b"method not allowed");
    }
    if request.method == "POST" && request.has_unsized_body() {
        log::debug!("rejecting POST from {} without Content-Length", client_ip);
        return write_response(stream, 411, "text/plain", b"length required");
    }

    let body = if request.path.ends_with(BASIC_COMMANDS) {
        router.handle_basic(Some(&client_ip))
    } else if request.path.ends_with(ALL_COMMANDS) {
        let payload = if request.method == "GET" {
            request.query.clone()
        } else {
            String::from_utf8_lossy(&request.body).into_owned()
        };
        router.handle_all(&payload)
    } else {
        return write_response(stream, 404, "text/plain", b"not found");
    };
    write_response(stream, 200, "text/xml", body.as_bytes())
}

/// Strips the IPv4-mapped form so the device proxy gets a dialable address.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

fn normalize_ip_text(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<IpAddr>() {
        Ok(ip) => normalize_ip(ip).to_string(),
        Err(_) => raw.strip_prefix("::ffff:").unwrap_or(raw).to_string(),
    }
}

fn read_request<S: Read>(stream: &mut S) -> Result<HttpRequest> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length: {}", value))?,
        None => 0,
    };
    if header_end + 4 + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (raw_path.to_string(), String::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        query,
        headers,
        body,
    })
}

fn write_response<S: Write>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        411 => "HTTP/1.1 411 Length Required",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// A body is announced but its length is not. Chunked decoding is not
    /// supported, so such a body would otherwise be read as empty.
    fn has_unsized_body(&self) -> bool {
        !self.headers.contains_key("content-length")
            && self.headers.contains_key("transfer-encoding")
    }

    /// First hop of `X-Forwarded-For`, if present.
    fn forwarded_for(&self) -> Option<String> {
        self.headers
            .get("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(normalize_ip_text)
            .filter(|ip| !ip.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandSet;
    use crate::transport::RecordingPublisher;
    use crate::DeviceRegistry;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn accept_errors_do_not_stop_the_server() {
        let publisher = Arc::new(RecordingPublisher::new());
        let registry = DeviceRegistry::new(publisher, CommandSet::default());
        let router = Arc::new(RequestRouter::new(Arc::new(registry)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let flag = shutdown.clone();
        let counter = calls.clone();
        let accept = move || -> std::io::Result<(TcpStream, SocketAddr)> {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                flag.store(true, Ordering::SeqCst);
            }
            Err(std::io::Error::other("too many open files"))
        };
        run_server(accept, router, None, shutdown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn normalize_ip_unwraps_mapped_v4() {
        let mapped: IpAddr = "::ffff:192.168.1.40".parse().unwrap();
        assert_eq!(normalize_ip(mapped).to_string(), "192.168.1.40");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(normalize_ip(v6), v6);
        assert_eq!(normalize_ip_text(" ::ffff:10.0.0.1 "), "10.0.0.1");
    }

    #[test]
    fn read_request_reads_body_by_content_length() {
        let raw = "POST /WebServices/SyrConnectLimexWebService.asmx/GetAllCommands HTTP/1.1\r\n\
                   Host: syrconnect.de\r\nContent-Length: 9\r\n\
                   X-Forwarded-For: ::ffff:10.1.2.3, 172.17.0.1\r\n\r\nxml=%3Csc";
        let request = read_request(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap();
        assert_eq!(request.method, "POST");
        assert!(request.path.ends_with(ALL_COMMANDS));
        assert_eq!(request.body, b"xml=%3Csc");
        assert_eq!(request.forwarded_for().as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn read_request_splits_query() {
        let raw = "GET /GetAllCommands?xml=%3Csc%2F%3E HTTP/1.1\r\nHost: x\r\n\r\n";
        let request = read_request(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap();
        assert_eq!(request.path, "/GetAllCommands");
        assert_eq!(request.query, "xml=%3Csc%2F%3E");
        assert!(request.body.is_empty());
        assert_eq!(request.forwarded_for(), None);
    }

    #[test]
    fn chunked_request_is_detected() {
        let raw = "POST /GetAllCommands HTTP/1.1\r\nHost: x\r\n\
                   Transfer-Encoding: chunked\r\n\r\n9\r\nxml=%3Csc\r\n0\r\n\r\n";
        let request = read_request(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap();
        assert!(request.has_unsized_body());
        assert!(request.body.is_empty());

        let raw = "POST /GetAllCommands HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
        let request = read_request(&mut Cursor::new(raw.as_bytes().to_vec())).unwrap();
        assert!(!request.has_unsized_body());
    }

    #[test]
    fn length_required_status_line() {
        let mut out = Vec::new();
        write_response(&mut out, 411, "text/plain", b"length required").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(text.ends_with("\r\n\r\nlength required"));
    }

    #[test]
    fn read_request_rejects_truncated_headers() {
        let raw = "GET / HTTP/1.1\r\nHost: x";
        assert!(read_request(&mut Cursor::new(raw.as_bytes().to_vec())).is_err());
    }
}
