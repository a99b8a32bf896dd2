//! Non-blocking HTTP GET of a device description.
//!
//! The control point is driven by repeated `poll_for_changes()` calls and
//! must never block inside one. [`DescriptionFetch`] is therefore an explicit
//! state machine over a non-blocking TCP socket: every [`poll`] performs at
//! most one connect, send or receive step and returns immediately.
//!
//! A fetch that makes no progress is reset once it is older than the
//! configured timeout *and* has been polled more than the configured minimum
//! number of times, so a caller that polls rarely does not cause spurious
//! timeouts. Every reset counts as one failure.
//!
//! Only literal IPv4 hosts are fetched. A hostname would need a blocking DNS
//! lookup, so such a location fails to connect like an unreachable device.
//!
//! [`poll`]: DescriptionFetch::poll

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use url::{Position, Url};

use crate::config::UpnpConfig;
use crate::protocol_constants::{DESCRIPTION_RECV_CHUNK, HTTP_DEFAULT_PORT};

/// Where the GET goes and what it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestTarget {
    host: String,
    port: u16,
    netloc: String,
    path: String,
}

impl RequestTarget {
    /// Accepts absolute locations and, as a fallback, scheme-less
    /// `host[:port]/path` forms some devices announce.
    fn parse(location: &str) -> Option<Self> {
        let url = Url::parse(location)
            .ok()
            .filter(|u| u.host_str().is_some())
            .or_else(|| Url::parse(&format!("http://{}", location.trim_start_matches('/'))).ok())?;
        let host = url.host_str()?.to_string();
        Some(Self {
            port: url.port_or_known_default().unwrap_or(HTTP_DEFAULT_PORT),
            netloc: url[Position::BeforeHost..Position::AfterPort].to_string(),
            path: url[Position::BeforePath..].to_string(),
            host,
        })
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\n\
             HOST: {}\r\n\
             ACCEPT-ENCODING: identity\r\n\
             CONNECTION: close\r\n\
             \r\n",
            self.path, self.netloc
        )
    }
}

enum Stage {
    Idle,
    Connecting(Socket),
    Receiving { socket: Socket, buffer: Vec<u8> },
}

/// One device's description download, advanced by [`poll`](Self::poll).
pub struct DescriptionFetch {
    target: RequestTarget,
    timeout: Duration,
    min_polls: u32,
    stage: Stage,
    failures: u32,
    reset_at: Instant,
    polls_since_reset: u32,
}

impl std::fmt::Debug for DescriptionFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = match self.stage {
            Stage::Idle => "idle",
            Stage::Connecting(_) => "connecting",
            Stage::Receiving { .. } => "receiving",
        };
        f.debug_struct("DescriptionFetch")
            .field("target", &self.target)
            .field("stage", &stage)
            .field("failures", &self.failures)
            .field("polls_since_reset", &self.polls_since_reset)
            .finish()
    }
}

impl DescriptionFetch {
    /// Returns `None` when `location` names no host to fetch from.
    pub fn new(location: &str, config: &UpnpConfig, now: Instant) -> Option<Self> {
        let Some(target) = RequestTarget::parse(location) else {
            log::debug!("[UPnP] Unusable description location {:?}", location);
            return None;
        };
        Some(Self {
            target,
            timeout: config.description_timeout(),
            min_polls: config.description_min_polls,
            stage: Stage::Idle,
            failures: 0,
            reset_at: now,
            polls_since_reset: 0,
        })
    }

    /// Number of resets so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Abandons the current attempt and counts a failure.
    pub fn reset(&mut self, now: Instant) {
        close_quietly(std::mem::replace(&mut self.stage, Stage::Idle));
        self.failures += 1;
        self.reset_at = now;
        self.polls_since_reset = 0;
    }

    /// Performs at most one I/O step.
    ///
    /// Returns the response body once a complete `200` response has been
    /// read. Any other outcome, including errors, returns `None`; errors also
    /// reset the fetch.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if now.saturating_duration_since(self.reset_at) > self.timeout
            && self.polls_since_reset > self.min_polls
        {
            log::debug!("[UPnP] Description fetch timed out: {:?}", self.target);
            self.reset(now);
        }
        self.polls_since_reset += 1;

        let target = &self.target;
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => match connect(target) {
                Ok(socket) => self.stage = Stage::Connecting(socket),
                Err(e) => {
                    log::debug!("[UPnP] Connect to {}:{} failed: {}", target.host, target.port, e);
                    self.reset(now);
                }
            },
            Stage::Connecting(socket) => match connection_state(&socket) {
                Ok(false) => self.stage = Stage::Connecting(socket),
                Ok(true) => match (&socket).write_all(target.request().as_bytes()) {
                    Ok(()) => {
                        self.stage = Stage::Receiving {
                            socket,
                            buffer: Vec::new(),
                        }
                    }
                    Err(e) => {
                        log::debug!("[UPnP] Sending description request failed: {}", e);
                        self.stage = Stage::Connecting(socket);
                        self.reset(now);
                    }
                },
                Err(e) => {
                    log::debug!("[UPnP] Connect to {}:{} failed: {}", target.host, target.port, e);
                    self.reset(now);
                }
            },
            Stage::Receiving { socket, mut buffer } => {
                let mut chunk = [0u8; DESCRIPTION_RECV_CHUNK];
                match (&socket).read(&mut chunk) {
                    Ok(0) => return self.finish(buffer, now),
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        self.stage = Stage::Receiving { socket, buffer };
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) =>
                    {
                        self.stage = Stage::Receiving { socket, buffer };
                    }
                    Err(e) => {
                        log::debug!("[UPnP] Reading description failed: {}", e);
                        self.reset(now);
                    }
                }
            }
        }
        None
    }

    /// Handles a closed connection with everything the peer sent.
    fn finish(&mut self, buffer: Vec<u8>, now: Instant) -> Option<String> {
        if buffer.is_empty() {
            self.reset(now);
            return None;
        }
        match parse_http_response(&buffer) {
            Some((200, body)) => Some(String::from_utf8_lossy(&body).into_owned()),
            Some((status, _)) => {
                log::error!(
                    "[UPnP] Got an error response {} from {}:{}",
                    status,
                    self.target.host,
                    self.target.port
                );
                self.reset(now);
                None
            }
            None => {
                log::debug!("[UPnP] Unparseable description response ({} bytes)", buffer.len());
                self.reset(now);
                None
            }
        }
    }
}

impl Drop for DescriptionFetch {
    fn drop(&mut self) {
        close_quietly(std::mem::replace(&mut self.stage, Stage::Idle));
    }
}

/// Some devices' UPnP stacks crash when a connection is closed without
/// being read from, so give the peer one last read before closing.
fn close_quietly(stage: Stage) {
    let socket = match stage {
        Stage::Idle => return,
        Stage::Connecting(socket) | Stage::Receiving { socket, .. } => socket,
    };
    let mut scratch = [0u8; DESCRIPTION_RECV_CHUNK];
    let _ = (&socket).read(&mut scratch);
}

fn connect(target: &RequestTarget) -> io::Result<Socket> {
    let ip: Ipv4Addr = target.host.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "location host is not an IPv4 address")
    })?;
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, target.port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if connect_in_progress(&e) => Ok(socket),
        Err(e) => Err(e),
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

/// `Ok(true)` once connected, `Ok(false)` while the handshake is pending.
fn connection_state(socket: &Socket) -> io::Result<bool> {
    if let Some(e) = socket.take_error()? {
        return Err(e);
    }
    match socket.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a complete HTTP/1.x response into status code and decoded body.
///
/// Honors `Transfer-Encoding: chunked` and `Content-Length`; otherwise the
/// body runs to the end of the buffer.
fn parse_http_response(raw: &[u8]) -> Option<(u16, Vec<u8>)> {
    let head_end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..head_end]).ok()?;
    let body = &raw[head_end + 4..];

    let mut lines = head.split("\r\n");
    let mut status_line = lines.next()?.split_whitespace();
    if !status_line.next()?.starts_with("HTTP/") {
        return None;
    }
    let status: u16 = status_line.next()?.parse().ok()?;

    let mut chunked = false;
    let mut content_length: Option<usize> = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.trim().eq_ignore_ascii_case("chunked");
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().ok();
        }
    }

    let body = if chunked {
        decode_chunked(body)?
    } else if let Some(len) = content_length {
        body.get(..len)?.to_vec()
    } else {
        body.to_vec()
    };
    Some((status, body))
}

fn decode_chunked(mut raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = raw.windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&raw[..line_end]).ok()?;
        let size_hex = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        raw = &raw[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        out.extend_from_slice(raw.get(..size)?);
        raw = raw.get(size + 2..)?;
    }
}
