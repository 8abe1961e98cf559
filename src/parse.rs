use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, StatusCode};
use n0_error::{e, stack_error};

use crate::HEADER_SECTION_MAX_LENGTH;

/// Which half of the proxied conversation a parser is framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Side {
    /// Client to backend: request messages.
    #[display("request")]
    Request,
    /// Backend to client: response messages.
    #[display("response")]
    Response,
}

/// Framing errors surfaced while parsing a message stream.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ParseError {
    /// The status/request line or a header line is malformed.
    #[error("malformed {side} head")]
    MalformedHead {
        side: Side,
        #[error(source, std_err)]
        source: httparse::Error,
    },
    /// A header name or value did not survive normalization.
    #[error("invalid header in {side} head")]
    InvalidHeader { side: Side },
    /// The head section grew past the configured limit.
    #[error("{side} head exceeds {limit} bytes")]
    HeadTooLarge { side: Side, limit: usize },
    /// A chunk-size line in a chunked body is not valid hex.
    #[error("invalid chunk size line")]
    InvalidChunkSize,
}

/// An ordered, case-insensitive multi-map of header fields.
///
/// Names are normalized to lowercase by [`HeaderName`]; values are kept
/// verbatim. Duplicate names retain every occurrence in input order, and
/// iteration yields fields in registration order, which is also the order
/// the serializer writes them in.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(HeaderName, HeaderValue)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first value registered under `name`.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns every value registered under `name`, in input order.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Appends a field after all existing ones.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.0.push((name, value));
    }

    /// Replaces the first occurrence of `name` in place and drops the rest.
    /// Appends if the field is absent.
    pub fn set(&mut self, name: HeaderName, value: HeaderValue) {
        let mut replaced = false;
        self.0.retain_mut(|(n, v)| {
            if *n != name {
                return true;
            }
            if replaced {
                return false;
            }
            *v = value.clone();
            replaced = true;
            true
        });
        if !replaced {
            self.0.push((name, value));
        }
    }

    /// Removes every occurrence of `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.as_str().eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Checks whether any comma-separated value of `name` equals `token`
    /// (ASCII case-insensitive).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.all(name)
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n, v))
    }
}

/// Start line of a message; a message is a request or a response, never both.
#[derive(Debug, Clone)]
pub enum StartLine {
    Request {
        method: Method,
        /// Request target as received (origin-form for proxied traffic).
        target: String,
    },
    Response {
        status: StatusCode,
        /// Reason phrase as received; may differ from the canonical one.
        reason: String,
    },
}

/// A parsed HTTP/1.x message head.
///
/// Interceptors mutate this value in place before it is re-serialized; the
/// body is never part of it and streams separately.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    /// `(major, minor)` protocol version from the start line.
    pub version: (u8, u8),
    pub start: StartLine,
    pub headers: Headers,
    /// Whether the head carries HTTP upgrade signaling.
    pub upgrade: bool,
    /// Whether the peer asked to keep the connection open after this message.
    pub keep_alive: bool,
}

impl HttpMessage {
    /// Creates a request head with no headers.
    pub fn request(method: Method, target: impl Into<String>) -> Self {
        Self {
            version: (1, 1),
            start: StartLine::Request {
                method,
                target: target.into(),
            },
            headers: Headers::new(),
            upgrade: false,
            keep_alive: true,
        }
    }

    /// Creates a response head with the canonical reason phrase.
    pub fn response(status: StatusCode) -> Self {
        Self {
            version: (1, 1),
            start: StartLine::Response {
                status,
                reason: status.canonical_reason().unwrap_or("").to_string(),
            },
            headers: Headers::new(),
            upgrade: false,
            keep_alive: true,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    /// Hostname from the `host` header with any `:port` suffix stripped.
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get("host")?.to_str().ok()?;
        Some(host.split(':').next().unwrap_or(host))
    }

    /// The protocol token announced in the `upgrade` header, if any.
    pub fn upgrade_token(&self) -> Option<String> {
        let token = self.headers.get("upgrade")?.to_str().ok()?;
        Some(token.trim().to_ascii_lowercase())
    }

    /// Serializes the head: start line, header lines in stored order, and the
    /// terminating blank line. Framing headers are written as-is; whoever
    /// mutated the message owns their consistency with the streamed body.
    pub fn encode_head(&self) -> Bytes {
        let line = match &self.start {
            StartLine::Request { method, target } => format!(
                "{} {} HTTP/{}.{}\r\n",
                method, target, self.version.0, self.version.1
            ),
            StartLine::Response { status, reason } => format!(
                "HTTP/{}.{} {} {}\r\n",
                self.version.0,
                self.version.1,
                status.as_u16(),
                reason
            ),
        };
        let mut buf = BytesMut::with_capacity(line.len() + self.headers.len() * 32 + 2);
        buf.extend_from_slice(line.as_bytes());
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.freeze()
    }
}

/// One parser observation, in stream order.
#[derive(Debug)]
pub enum ParseEvent {
    /// The head completed; the message carries everything up to the blank line.
    Headers(HttpMessage),
    /// A run of raw body bytes inside the chunk passed to [`MessageParser::feed`].
    /// The range covers the wire bytes verbatim, chunked framing included.
    Body { offset: usize, len: usize },
}

#[derive(Debug)]
enum ChunkPhase {
    /// Accumulating a chunk-size line up to its LF.
    Size { line: Vec<u8> },
    /// Inside chunk data.
    Data { remaining: u64 },
    /// The CRLF that trails each data chunk.
    DataEnd { remaining: u8 },
    /// Trailer section after the zero-size chunk; ends at an empty line.
    Trailer { line: Vec<u8> },
}

#[derive(Debug)]
enum BodyFraming {
    /// `Content-Length` countdown.
    Remaining(u64),
    /// `Transfer-Encoding: chunked` state machine.
    Chunked(ChunkPhase),
    /// Body runs until the peer closes (responses only).
    UntilClose,
}

#[derive(Debug)]
enum State {
    Head,
    Body(BodyFraming),
}

/// Incremental HTTP/1.x message parser.
///
/// Feed arbitrary byte chunks; partial head input is retained across calls
/// while body bytes are only ever described by [`ParseEvent::Body`] ranges
/// into the chunk that carried them, so memory stays bounded by the head
/// size. After a message's body completes the parser returns to head state
/// and frames the next message on the same stream.
#[derive(Debug)]
pub struct MessageParser {
    side: Side,
    state: State,
    buf: BytesMut,
    max_head: usize,
}

impl MessageParser {
    pub fn new(side: Side) -> Self {
        Self::with_max_head(side, HEADER_SECTION_MAX_LENGTH)
    }

    pub fn with_max_head(side: Side, max_head: usize) -> Self {
        Self {
            side,
            state: State::Head,
            buf: BytesMut::new(),
            max_head,
        }
    }

    /// Bytes received but not yet framed (a partial head). The transducer
    /// emits these on flush so a half-closed stream loses nothing.
    pub fn take_unframed(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Consumes one chunk and returns the events it produced, in order.
    ///
    /// On error the unframed remainder stays available via
    /// [`Self::take_unframed`] for best-effort forwarding.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ParseEvent>, ParseError> {
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < chunk.len() {
            match &mut self.state {
                State::Head => {
                    self.buf.extend_from_slice(&chunk[pos..]);
                    pos = chunk.len();
                    let Some((head_len, message)) = self.parse_head()? else {
                        // The limit only applies to a head that is genuinely
                        // incomplete; a finished head may share its chunk with
                        // an arbitrarily large run of body bytes.
                        if self.buf.len() > self.max_head {
                            return Err(e!(ParseError::HeadTooLarge {
                                side: self.side,
                                limit: self.max_head
                            }));
                        }
                        continue;
                    };
                    // Any surplus past the head arrived in this very chunk,
                    // since the head is re-parsed after every feed.
                    let surplus = self.buf.len() - head_len;
                    self.buf.clear();
                    pos = chunk.len() - surplus;
                    self.state = match body_framing(self.side, &message) {
                        Some(framing) => State::Body(framing),
                        None => State::Head,
                    };
                    events.push(ParseEvent::Headers(message));
                }
                State::Body(framing) => {
                    let (consumed, done) = advance_body(framing, &chunk[pos..])?;
                    if consumed > 0 {
                        events.push(ParseEvent::Body {
                            offset: pos,
                            len: consumed,
                        });
                    }
                    pos += consumed;
                    if done {
                        self.state = State::Head;
                    }
                }
            }
        }
        Ok(events)
    }

    /// Attempts to parse the accumulated head buffer.
    fn parse_head(&self) -> Result<Option<(usize, HttpMessage)>, ParseError> {
        parse_head(self.side, &self.buf)
    }
}

/// Parses one complete head from the front of `buf` without consuming it.
/// Returns `None` while the head is still incomplete.
pub fn parse_head(side: Side, buf: &[u8]) -> Result<Option<(usize, HttpMessage)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    match side {
        Side::Request => {
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(buf) {
                Ok(httparse::Status::Partial) => Ok(None),
                Ok(httparse::Status::Complete(head_len)) => {
                    let message = request_message(&req)
                        .ok_or_else(|| e!(ParseError::InvalidHeader { side }))?;
                    Ok(Some((head_len, message)))
                }
                Err(source) => Err(e!(ParseError::MalformedHead { side, source })),
            }
        }
        Side::Response => {
            let mut res = httparse::Response::new(&mut headers);
            match res.parse(buf) {
                Ok(httparse::Status::Partial) => Ok(None),
                Ok(httparse::Status::Complete(head_len)) => {
                    let message = response_message(&res)
                        .ok_or_else(|| e!(ParseError::InvalidHeader { side }))?;
                    Ok(Some((head_len, message)))
                }
                Err(source) => Err(e!(ParseError::MalformedHead { side, source })),
            }
        }
    }
}

fn request_message(req: &httparse::Request<'_, '_>) -> Option<HttpMessage> {
    let method = Method::from_bytes(req.method?.as_bytes()).ok()?;
    let target = req.path?.to_string();
    let version = (1, req.version?);
    let headers = collect_headers(req.headers)?;
    let upgrade = has_upgrade_signaling(&headers);
    let keep_alive = keep_alive_hint(version, &headers);
    Some(HttpMessage {
        version,
        start: StartLine::Request { method, target },
        headers,
        upgrade,
        keep_alive,
    })
}

fn response_message(res: &httparse::Response<'_, '_>) -> Option<HttpMessage> {
    let status = StatusCode::from_u16(res.code?).ok()?;
    let reason = res.reason.unwrap_or("").to_string();
    let version = (1, res.version?);
    let headers = collect_headers(res.headers)?;
    let upgrade = status == StatusCode::SWITCHING_PROTOCOLS || has_upgrade_signaling(&headers);
    let keep_alive = keep_alive_hint(version, &headers);
    Some(HttpMessage {
        version,
        start: StartLine::Response { status, reason },
        headers,
        upgrade,
        keep_alive,
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Option<Headers> {
    let mut headers = Headers::new();
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        headers.append(name, value);
    }
    Some(headers)
}

fn has_upgrade_signaling(headers: &Headers) -> bool {
    headers.get("upgrade").is_some() && headers.contains_token("connection", "upgrade")
}

fn keep_alive_hint(version: (u8, u8), headers: &Headers) -> bool {
    if headers.contains_token("connection", "close") {
        return false;
    }
    version.1 != 0 || headers.contains_token("connection", "keep-alive")
}

/// Decides how the body after `message`'s head is delimited, or `None` for a
/// bodiless message.
fn body_framing(side: Side, message: &HttpMessage) -> Option<BodyFraming> {
    // Once upgrade signaling is on the wire, HTTP framing rules stop applying;
    // whatever follows is tunnel payload until the peer closes.
    match side {
        Side::Request if message.upgrade => return Some(BodyFraming::UntilClose),
        Side::Response if message.status() == Some(StatusCode::SWITCHING_PROTOCOLS) => {
            return Some(BodyFraming::UntilClose);
        }
        _ => {}
    }
    if side == Side::Response
        && let Some(status) = message.status()
        && (status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED)
    {
        return None;
    }
    if message.headers.contains_token("transfer-encoding", "chunked") {
        return Some(BodyFraming::Chunked(ChunkPhase::Size { line: Vec::new() }));
    }
    if let Some(value) = message.headers.all("content-length").last() {
        // With duplicate content-length fields the last one wins; an
        // unparseable value counts as no body and the stream either stalls or
        // fails at the next head, which is the peer's problem to begin with.
        let length = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        return match length {
            0 => None,
            n => Some(BodyFraming::Remaining(n)),
        };
    }
    match side {
        Side::Request => None,
        Side::Response => Some(BodyFraming::UntilClose),
    }
}

/// Walks the body state machine over `avail`, returning how many bytes belong
/// to the current body and whether the body completed inside them.
fn advance_body(framing: &mut BodyFraming, avail: &[u8]) -> Result<(usize, bool), ParseError> {
    match framing {
        BodyFraming::UntilClose => Ok((avail.len(), false)),
        BodyFraming::Remaining(remaining) => {
            let take = (*remaining).min(avail.len() as u64) as usize;
            *remaining -= take as u64;
            Ok((take, *remaining == 0))
        }
        BodyFraming::Chunked(phase) => {
            let mut consumed = 0;
            while consumed < avail.len() {
                match phase {
                    ChunkPhase::Size { line } => {
                        let Some(nl) = avail[consumed..].iter().position(|&b| b == b'\n') else {
                            line.extend_from_slice(&avail[consumed..]);
                            return Ok((avail.len(), false));
                        };
                        line.extend_from_slice(&avail[consumed..consumed + nl + 1]);
                        consumed += nl + 1;
                        let size = parse_chunk_size(line)?;
                        *phase = if size == 0 {
                            ChunkPhase::Trailer { line: Vec::new() }
                        } else {
                            ChunkPhase::Data { remaining: size }
                        };
                    }
                    ChunkPhase::Data { remaining } => {
                        let take = (*remaining).min((avail.len() - consumed) as u64) as usize;
                        *remaining -= take as u64;
                        consumed += take;
                        if *remaining == 0 {
                            *phase = ChunkPhase::DataEnd { remaining: 2 };
                        }
                    }
                    ChunkPhase::DataEnd { remaining } => {
                        let take = (*remaining as usize).min(avail.len() - consumed);
                        *remaining -= take as u8;
                        consumed += take;
                        if *remaining == 0 {
                            *phase = ChunkPhase::Size { line: Vec::new() };
                        }
                    }
                    ChunkPhase::Trailer { line } => {
                        let Some(nl) = avail[consumed..].iter().position(|&b| b == b'\n') else {
                            line.extend_from_slice(&avail[consumed..]);
                            return Ok((avail.len(), false));
                        };
                        line.extend_from_slice(&avail[consumed..consumed + nl + 1]);
                        consumed += nl + 1;
                        if matches!(line.as_slice(), b"\n" | b"\r\n") {
                            return Ok((consumed, true));
                        }
                        line.clear();
                    }
                }
            }
            Ok((consumed, false))
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| e!(ParseError::InvalidChunkSize))?;
    let size = text
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size, 16).map_err(|_| e!(ParseError::InvalidChunkSize))
}
