//! The HTTP-like exchange that opens a relay connection.

use {
    super::errors::{SessionError, SessionErrorValue},
    crate::{utils::ChannelId, AGENT},
    std::fmt::Write,
};

pub const CHANNEL_PATH_PREFIX: &str = "/channel/";
pub const STREAM_PATH_PREFIX: &str = "/stream/";
pub const HEADER_PCP: &str = "x-peercast-pcp";
pub const HEADER_POS: &str = "x-peercast-pos";
pub const PCP_CONTENT_TYPE: &str = "application/x-peercast-pcp";

const MAX_HEADERS: usize = 32;

/// `GET /channel/<id>` as sent by a downstream relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub channel_id: ChannelId,
    /// Value of `x-peercast-pcp`; relays send 1.
    pub pcp_version: Option<u32>,
    /// Value of `x-peercast-pos`: stream only content after this position.
    /// Carries the low 32 bits, like packet positions on the wire.
    pub position: Option<u32>,
    pub user_agent: Option<String>,
}

impl RelayRequest {
    #[must_use]
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            pcp_version: Some(1),
            position: None,
            user_agent: Some(AGENT.to_string()),
        }
    }

    #[must_use]
    pub fn with_position(mut self, position: Option<u32>) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut req = format!(
            "GET {CHANNEL_PATH_PREFIX}{} HTTP/1.0\r\n",
            self.channel_id
        );
        if let Some(agent) = &self.user_agent {
            let _ = write!(req, "User-Agent: {agent}\r\n");
        }
        if let Some(version) = self.pcp_version {
            let _ = write!(req, "{HEADER_PCP}: {version}\r\n");
        }
        if let Some(position) = self.position {
            let _ = write!(req, "{HEADER_POS}: {position}\r\n");
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    /// Parse a complete request header. `Ok(None)` means more bytes are needed;
    /// on success the header length is returned alongside the request.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, SessionError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(err) => return Err(SessionErrorValue::BadRequest(err.to_string()).into()),
        };

        if !req.method.is_some_and(|m| m.eq_ignore_ascii_case("GET")) {
            return Err(SessionErrorValue::BadRequest("method is not GET".into()).into());
        }
        let channel_id = req
            .path
            .and_then(channel_id_from_path)
            .ok_or_else(|| SessionErrorValue::BadRequest("not a channel path".into()))?;

        let mut request = Self {
            channel_id,
            pcp_version: None,
            position: None,
            user_agent: None,
        };
        for header in req.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();
            if header.name.eq_ignore_ascii_case(HEADER_PCP) {
                request.pcp_version = value.parse().ok();
            } else if header.name.eq_ignore_ascii_case(HEADER_POS) {
                // wider values from older peers keep their low bits
                request.position = value.parse::<u64>().ok().map(|pos| pos as u32);
            } else if header.name.eq_ignore_ascii_case("User-Agent") {
                request.user_agent = Some(value.to_string());
            }
        }
        Ok(Some((request, len)))
    }
}

/// `GET /stream/<id>` from a media player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    pub channel_id: ChannelId,
    pub user_agent: Option<String>,
}

impl PlayRequest {
    /// Same contract as [`RelayRequest::parse`].
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, SessionError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(err) => return Err(SessionErrorValue::BadRequest(err.to_string()).into()),
        };
        if !req.method.is_some_and(|m| m.eq_ignore_ascii_case("GET")) {
            return Err(SessionErrorValue::BadRequest("method is not GET".into()).into());
        }
        let channel_id = req
            .path
            .and_then(|path| id_from_path(path, STREAM_PATH_PREFIX))
            .ok_or_else(|| SessionErrorValue::BadRequest("not a stream path".into()))?;
        let user_agent = req
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("User-Agent"))
            .map(|header| String::from_utf8_lossy(header.value).trim().to_string());
        Ok(Some((
            Self {
                channel_id,
                user_agent,
            },
            len,
        )))
    }
}

/// Channel id from the request line alone, for sniffing before the full header
/// has arrived.
#[must_use]
pub fn sniff_channel_id(buf: &[u8]) -> Option<ChannelId> {
    sniff_path_id(buf, CHANNEL_PATH_PREFIX)
}

/// Like [`sniff_channel_id`] for player requests.
#[must_use]
pub fn sniff_stream_id(buf: &[u8]) -> Option<ChannelId> {
    sniff_path_id(buf, STREAM_PATH_PREFIX)
}

fn sniff_path_id(buf: &[u8], prefix: &str) -> Option<ChannelId> {
    let end = buf.iter().position(|b| *b == b'\n')?;
    let line = std::str::from_utf8(&buf[..end]).ok()?.trim_end();
    let mut parts = line.split_ascii_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("GET") {
        return None;
    }
    let path = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    id_from_path(path, prefix)
}

/// `/channel/<32 hex>` optionally followed by an extension or a query.
fn channel_id_from_path(path: &str) -> Option<ChannelId> {
    id_from_path(path, CHANNEL_PATH_PREFIX)
}

fn id_from_path(path: &str, prefix: &str) -> Option<ChannelId> {
    let rest = path.strip_prefix(prefix)?;
    let hex = rest.get(..32)?;
    let tail = &rest[32..];
    if !(tail.is_empty() || tail.starts_with('?') || tail.starts_with('.')) {
        return None;
    }
    ChannelId::parse_hex(hex)
}

#[must_use]
pub const fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Status line and headers answering a relay request.
#[must_use]
pub fn response_bytes(status: u16) -> Vec<u8> {
    let mut res = format!("HTTP/1.0 {status} {}\r\n", status_text(status));
    let _ = write!(res, "Server: {AGENT}\r\n");
    if status == 200 || status == 503 {
        let _ = write!(res, "Content-Type: {PCP_CONTENT_TYPE}\r\n");
        let _ = write!(res, "{HEADER_PCP}: 1\r\n");
    }
    res.push_str("\r\n");
    res.into_bytes()
}

/// Status line and headers answering a player. The body is the raw stream.
#[must_use]
pub fn play_response_bytes(status: u16, mime_type: &str) -> Vec<u8> {
    let mut res = format!("HTTP/1.0 {status} {}\r\n", status_text(status));
    let _ = write!(res, "Server: {AGENT}\r\n");
    if status == 200 {
        let mime_type = if mime_type.is_empty() {
            "application/octet-stream"
        } else {
            mime_type
        };
        let _ = write!(res, "Content-Type: {mime_type}\r\n");
    }
    res.push_str("\r\n");
    res.into_bytes()
}

/// Status code of a complete response header and the header length.
pub fn parse_response(buf: &[u8]) -> Result<Option<(u16, usize)>, SessionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let code = res
                .code
                .ok_or_else(|| SessionErrorValue::BadResponse("missing status".into()))?;
            Ok(Some((code, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(SessionErrorValue::BadResponse(err.to_string()).into()),
    }
}
