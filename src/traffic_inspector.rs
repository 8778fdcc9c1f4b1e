//! Passive inspection of relayed SOCKS connections
//!
//! Follows the SOCKS4/4a/5 handshake to learn where a connection goes, then
//! watches the tunnelled bytes. HTTP exchanges answered with an HTML page are
//! recorded as page views; TLS connections are recorded as https requests
//! keyed by destination host. Anything unexpected switches inspection off for
//! the rest of the connection while the relay keeps forwarding.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use tracing::trace;

use crate::stats::Stats;

/// Header blocks larger than this are not treated as HTTP.
const MAX_HTTP_HEADERS_LENGTH: usize = 16384;
const MAX_PENDING_REQUESTS: usize = 64;
const MAX_HEADERS: usize = 64;

const HTTPS_PORT: u16 = 443;
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REPLY_LEN: usize = 8;

enum Step {
    NeedMore,
    Consumed(usize),
    Stop,
}

/// Client side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Greeting,
    Socks5Request,
    Tunnelled,
}

/// Server side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    AwaitRequest,
    Socks4,
    Socks5Method,
    Socks5Reply,
    Tunnelled,
}

enum BodyLength {
    Known(u64),
    Unknown,
}

#[derive(Debug, Clone)]
struct Destination {
    host: String,
    port: u16,
}

/// Per-connection inspector fed with both directions of a relayed stream
pub struct TrafficInspector {
    stats: Arc<Stats>,
    active: bool,
    handshake: Handshake,
    reply: Reply,
    destination: Option<Destination>,
    classified: bool,
    requests: Vec<u8>,
    responses: Vec<u8>,
    request_body_left: u64,
    response_body_left: u64,
    /// Request URLs waiting for their response, in pipeline order
    pending: VecDeque<String>,
}

impl TrafficInspector {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            stats,
            active: true,
            handshake: Handshake::Greeting,
            reply: Reply::AwaitRequest,
            destination: None,
            classified: false,
            requests: Vec::new(),
            responses: Vec::new(),
            request_body_left: 0,
            response_body_left: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bytes the local application sent towards the tunnel.
    pub fn client_bytes(&mut self, data: &[u8]) {
        if !self.active {
            return;
        }
        self.requests.extend_from_slice(data);

        while self.active && !self.requests.is_empty() {
            let step = match self.handshake {
                Handshake::Greeting => self.parse_greeting(),
                Handshake::Socks5Request => self.parse_socks5_request(),
                Handshake::Tunnelled => self.parse_request(),
            };
            match step {
                Step::NeedMore => {
                    if self.requests.len() > MAX_HTTP_HEADERS_LENGTH {
                        self.stop("request headers too long");
                    }
                    break;
                }
                Step::Consumed(len) => {
                    self.requests.drain(..len);
                }
                Step::Stop => self.stop("request side"),
            }
        }
    }

    /// Bytes the tunnel delivered back to the local application.
    pub fn server_bytes(&mut self, data: &[u8]) {
        if !self.active {
            return;
        }
        self.responses.extend_from_slice(data);

        while self.active && !self.responses.is_empty() {
            let step = match self.reply {
                Reply::AwaitRequest => Step::Stop,
                Reply::Socks4 => self.parse_socks4_reply(),
                Reply::Socks5Method => self.parse_socks5_method(),
                Reply::Socks5Reply => self.parse_socks5_reply(),
                Reply::Tunnelled => self.parse_response(),
            };
            match step {
                Step::NeedMore => {
                    if self.responses.len() > MAX_HTTP_HEADERS_LENGTH {
                        self.stop("response headers too long");
                    }
                    break;
                }
                Step::Consumed(len) => {
                    self.responses.drain(..len);
                }
                Step::Stop => self.stop("response side"),
            }
        }
    }

    fn stop(&mut self, reason: &str) {
        trace!("traffic inspection stopped: {}", reason);
        self.active = false;
        self.requests = Vec::new();
        self.responses = Vec::new();
        self.pending.clear();
    }

    fn parse_greeting(&mut self) -> Step {
        match self.requests.first().copied() {
            Some(SOCKS5_VERSION) => {
                let Some(&methods) = self.requests.get(1) else {
                    return Step::NeedMore;
                };
                let len = 2 + methods as usize;
                if self.requests.len() < len {
                    return Step::NeedMore;
                }
                self.handshake = Handshake::Socks5Request;
                self.reply = Reply::Socks5Method;
                Step::Consumed(len)
            }
            Some(SOCKS4_VERSION) => self.parse_socks4_request(),
            _ => Step::Stop,
        }
    }

    /// `VN CD DSTPORT DSTIP USERID NUL [HOST NUL]`
    fn parse_socks4_request(&mut self) -> Step {
        let buf = &self.requests;
        if buf.len() < 9 {
            return Step::NeedMore;
        }
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        let Some(user_end) = nul_terminated(buf, 8) else {
            return Step::NeedMore;
        };

        // 4a: 0.0.0.x with x != 0 means a host name follows the user id
        let octets = ip.octets();
        let (host, len) = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
            let Some(host_end) = nul_terminated(buf, user_end) else {
                return Step::NeedMore;
            };
            let host = String::from_utf8_lossy(&buf[user_end..host_end - 1]).into_owned();
            (host, host_end)
        } else {
            (ip.to_string(), user_end)
        };

        self.destination = Some(Destination { host, port });
        self.handshake = Handshake::Tunnelled;
        self.reply = Reply::Socks4;
        Step::Consumed(len)
    }

    /// `VER CMD RSV ATYP DST.ADDR DST.PORT`
    fn parse_socks5_request(&mut self) -> Step {
        let buf = &self.requests;
        if buf.len() < 5 {
            return Step::NeedMore;
        }
        if buf[0] != SOCKS5_VERSION {
            return Step::Stop;
        }
        let (host, addr_end) = match socks5_address(buf, 3) {
            Ok(Some(address)) => address,
            Ok(None) => return Step::NeedMore,
            Err(()) => return Step::Stop,
        };
        if buf.len() < addr_end + 2 {
            return Step::NeedMore;
        }
        let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);

        self.destination = Some(Destination { host, port });
        self.handshake = Handshake::Tunnelled;
        Step::Consumed(addr_end + 2)
    }

    fn parse_socks4_reply(&mut self) -> Step {
        if self.responses.len() < SOCKS4_REPLY_LEN {
            return Step::NeedMore;
        }
        if self.responses[1] != SOCKS4_GRANTED {
            return Step::Stop;
        }
        self.reply = Reply::Tunnelled;
        Step::Consumed(SOCKS4_REPLY_LEN)
    }

    fn parse_socks5_method(&mut self) -> Step {
        if self.responses.len() < 2 {
            return Step::NeedMore;
        }
        // only the no-authentication method keeps the stream readable
        if self.responses[1] != 0 {
            return Step::Stop;
        }
        self.reply = Reply::Socks5Reply;
        Step::Consumed(2)
    }

    /// `VER REP RSV ATYP BND.ADDR BND.PORT`
    fn parse_socks5_reply(&mut self) -> Step {
        let buf = &self.responses;
        if buf.len() < 5 {
            return Step::NeedMore;
        }
        if buf[0] != SOCKS5_VERSION || buf[1] != 0 {
            return Step::Stop;
        }
        let addr_end = match socks5_address(buf, 3) {
            Ok(Some((_, end))) => end,
            Ok(None) => return Step::NeedMore,
            Err(()) => return Step::Stop,
        };
        if buf.len() < addr_end + 2 {
            return Step::NeedMore;
        }
        self.reply = Reply::Tunnelled;
        Step::Consumed(addr_end + 2)
    }

    fn parse_request(&mut self) -> Step {
        if self.request_body_left > 0 {
            let len = self.request_body_left.min(self.requests.len() as u64);
            self.request_body_left -= len;
            return Step::Consumed(len as usize);
        }

        let Some(destination) = self.destination.as_ref() else {
            return Step::Stop;
        };

        if !self.classified {
            self.classified = true;
            if destination.port == HTTPS_PORT
                || self.requests.first() == Some(&TLS_HANDSHAKE_RECORD)
            {
                self.stats.upsert_https_request(&destination.host);
                return Step::Stop;
            }
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let len = match request.parse(&self.requests) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Step::NeedMore,
            Err(_) => return Step::Stop,
        };

        let path = request.path.unwrap_or("/");
        let url = if path.starts_with("http://") {
            path.to_string()
        } else {
            let host = header(request.headers, "host").unwrap_or(destination.host.as_str());
            format!("http://{}{}", host, path)
        };

        // a request without a declared length has no body
        match body_length(request.headers) {
            Some(BodyLength::Known(body)) => self.request_body_left = body,
            Some(BodyLength::Unknown) => return Step::Stop,
            None => {}
        }

        if self.pending.len() >= MAX_PENDING_REQUESTS {
            return Step::Stop;
        }
        self.pending.push_back(url);
        Step::Consumed(len)
    }

    fn parse_response(&mut self) -> Step {
        if self.response_body_left > 0 {
            let len = self.response_body_left.min(self.responses.len() as u64);
            self.response_body_left -= len;
            return Step::Consumed(len as usize);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let len = match response.parse(&self.responses) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Step::NeedMore,
            Err(_) => return Step::Stop,
        };
        let code = response.code.unwrap_or(0);

        // interim responses precede the real one for the same request
        if (100..200).contains(&code) {
            return Step::Consumed(len);
        }

        let Some(url) = self.pending.pop_front() else {
            return Step::Stop;
        };

        if code == 200 && is_page(header(response.headers, "content-type")) {
            self.stats.upsert_page_view(&url);
        }

        match body_length(response.headers) {
            Some(BodyLength::Known(body)) => self.response_body_left = body,
            None if code == 204 || code == 304 => {}
            // chunked or read-until-close bodies cannot be skipped reliably
            _ => return Step::Stop,
        }
        Step::Consumed(len)
    }
}

/// Index just past the NUL that ends the string starting at `start`.
fn nul_terminated(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .iter()
        .position(|&b| b == 0)
        .map(|pos| start + pos + 1)
}

/// Decode `ATYP ADDR` at `at`. `Ok(None)` means more bytes are needed.
fn socks5_address(buf: &[u8], at: usize) -> Result<Option<(String, usize)>, ()> {
    let Some(&atyp) = buf.get(at) else {
        return Ok(None);
    };
    let start = at + 1;
    match atyp {
        1 => {
            let end = start + 4;
            if buf.len() < end {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(buf[start], buf[start + 1], buf[start + 2], buf[start + 3]);
            Ok(Some((ip.to_string(), end)))
        }
        3 => {
            let Some(&len) = buf.get(start) else {
                return Ok(None);
            };
            let end = start + 1 + len as usize;
            if buf.len() < end {
                return Ok(None);
            }
            let host = String::from_utf8_lossy(&buf[start + 1..end]).into_owned();
            Ok(Some((host, end)))
        }
        4 => {
            let end = start + 16;
            if buf.len() < end {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[start..end]);
            Ok(Some((Ipv6Addr::from(octets).to_string(), end)))
        }
        _ => Err(()),
    }
}

fn header<'h>(headers: &[httparse::Header<'h>], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

/// `None` when the message declares no body at all.
fn body_length(headers: &[httparse::Header<'_>]) -> Option<BodyLength> {
    if let Some(encoding) = header(headers, "transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return Some(BodyLength::Unknown);
        }
    }
    let length = header(headers, "content-length")?;
    Some(match length.parse() {
        Ok(len) => BodyLength::Known(len),
        Err(_) => BodyLength::Unknown,
    })
}

fn is_page(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text/html") || ct.contains("application/xhtml+xml")
        })
        .unwrap_or(false)
}
