// ABOUTME: Forward proxy serving the allow-list over TCP and per-session unix sockets
// Supports CONNECT tunnels and absolute-form plain HTTP; refused destinations get 403

use crate::gateway::{Allowlist, GatewayError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_HEAD_BYTES: usize = 8192;

/// The proxy itself. One instance serves any number of listeners; per-session
/// unix sockets are just extra front doors onto the same allow-list.
pub struct Gateway {
    allowlist: Allowlist,
}

/// Handle for the externally routable TCP listener. Dropping it stops the
/// accept loop.
pub struct TcpGatewayHandle {
    local_addr: std::net::SocketAddr,
    task: JoinHandle<()>,
}

impl TcpGatewayHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpGatewayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One restricted session's private leg onto the gateway. The socket lives in
/// the session's state directory and is bind-mounted into its sandbox; when
/// the environment goes away the endpoint goes with it.
pub struct SessionSocket {
    socket_path: PathBuf,
    task: JoinHandle<()>,
}

impl SessionSocket {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished() && self.socket_path.exists()
    }
}

impl Drop for SessionSocket {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Gateway {
    pub fn new(allowlist: Allowlist) -> Self {
        Self { allowlist }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    /// Binds the externally routable listener and serves until the handle is
    /// dropped.
    pub async fn serve_tcp(
        self: &Arc<Self>,
        addr: std::net::SocketAddr,
    ) -> Result<TcpGatewayHandle, GatewayError> {
        let listener = TcpListener::bind(addr).await.map_err(GatewayError::Bind)?;
        let local_addr = listener.local_addr().map_err(GatewayError::Bind)?;
        info!(%local_addr, entries = self.allowlist.len(), "gateway listening");

        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let gateway = Arc::clone(&gateway);
                        tokio::spawn(async move {
                            if let Err(err) = gateway.handle_connection(stream).await {
                                debug!(%peer, "proxy connection ended: {}", err);
                            }
                        });
                    }
                    Err(err) => {
                        warn!("gateway accept failed: {}", err);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(TcpGatewayHandle { local_addr, task })
    }

    /// Opens a session's unix-socket endpoint. Stale sockets from a previous
    /// environment are replaced.
    pub async fn bind_session_socket(
        self: &Arc<Self>,
        socket_path: &Path,
    ) -> Result<SessionSocket, GatewayError> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(GatewayError::Bind)?;
        }
        let listener = UnixListener::bind(socket_path).map_err(GatewayError::Bind)?;
        debug!(path = %socket_path.display(), "session gateway socket bound");

        let gateway = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let gateway = Arc::clone(&gateway);
                        tokio::spawn(async move {
                            if let Err(err) = gateway.handle_connection(stream).await {
                                debug!("session proxy connection ended: {}", err);
                            }
                        });
                    }
                    Err(err) => {
                        warn!("session socket accept failed: {}", err);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(SessionSocket {
            socket_path: socket_path.to_path_buf(),
            task,
        })
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<(), GatewayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (head, remainder) = read_request_head(&mut stream).await?;
        let request = parse_request_head(&head)?;

        let (host, port) = request.destination();
        if !self.allowlist.permits(host, port) {
            warn!(host, port, "egress denied: destination not in allow-list");
            let body = format!("destination {}:{} not in allow-list\n", host, port);
            let response = format!(
                "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
            return Ok(());
        }

        let mut upstream = match TcpStream::connect((host, port)).await {
            Ok(upstream) => upstream,
            Err(err) => {
                debug!(host, port, "upstream connect failed: {}", err);
                stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await?;
                return Ok(());
            }
        };

        match request {
            ProxyRequest::Connect { .. } => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?;
                upstream.write_all(&remainder).await?;
            }
            ProxyRequest::Http { origin_head, .. } => {
                upstream.write_all(&origin_head).await?;
                upstream.write_all(&remainder).await?;
            }
        }

        let _ = copy_bidirectional(&mut stream, &mut upstream).await;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum ProxyRequest {
    /// `CONNECT host:port` — opaque tunnel, used for TLS.
    Connect { host: String, port: u16 },
    /// Absolute-form plain HTTP, rewritten to origin-form for the upstream.
    Http {
        host: String,
        port: u16,
        origin_head: Vec<u8>,
    },
}

impl ProxyRequest {
    fn destination(&self) -> (&str, u16) {
        match self {
            ProxyRequest::Connect { host, port } | ProxyRequest::Http { host, port, .. } => {
                (host.as_str(), *port)
            }
        }
    }
}

/// Reads up to the end of the request head. Returns the head (through the
/// blank line) and any bytes the client pipelined after it.
async fn read_request_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), GatewayError>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let remainder = buf.split_off(end);
            return Ok((buf, remainder));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(GatewayError::BadRequest("request head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::BadRequest(
                "connection closed before end of request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

pub(crate) fn parse_request_head(head: &[u8]) -> Result<ProxyRequest, GatewayError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| GatewayError::BadRequest("request head is not valid utf-8".into()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| GatewayError::BadRequest("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| GatewayError::BadRequest("missing method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| GatewayError::BadRequest("missing target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| GatewayError::BadRequest("missing http version".into()))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, None)?;
        return Ok(ProxyRequest::Connect { host, port });
    }

    // Plain HTTP must arrive in absolute form; TLS arrives via CONNECT.
    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, Some(80))?;

        let mut origin_head = format!("{} {} {}\r\n", method, path, version);
        let mut saw_host = false;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            // Hop-by-hop header meant for us, not the origin.
            if lower.starts_with("proxy-connection:") {
                continue;
            }
            if lower.starts_with("host:") {
                saw_host = true;
            }
            origin_head.push_str(line);
            origin_head.push_str("\r\n");
        }
        if !saw_host {
            origin_head.push_str(&format!("Host: {}\r\n", host));
        }
        origin_head.push_str("\r\n");

        return Ok(ProxyRequest::Http {
            host,
            port,
            origin_head: origin_head.into_bytes(),
        });
    }

    if target.starts_with("https://") {
        return Err(GatewayError::BadRequest(
            "https must be tunneled with CONNECT".into(),
        ));
    }
    Err(GatewayError::BadRequest(
        "proxy requires absolute-form requests".into(),
    ))
}

/// Splits `host[:port]`. An IPv6 bracket literal comes out with the brackets
/// still attached, which no allow-list entry can match: v6 targets are
/// denied at the policy check rather than parsed here.
fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16), GatewayError> {
    match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str.parse::<u16>().map_err(|_| {
                GatewayError::BadRequest(format!("invalid port in '{}'", authority))
            })?;
            Ok((host.to_ascii_lowercase(), port))
        }
        _ => match default_port {
            Some(port) => Ok((authority.to_ascii_lowercase(), port)),
            None => Err(GatewayError::BadRequest(format!(
                "expected host:port, got '{}'",
                authority
            ))),
        },
    }
}
