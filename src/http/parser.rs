//! Incremental HTTP/1.x message head parser.

use super::HttpError;

/// A parsed request or reply borrowing the receive buffer.
///
/// Requests have `resp_code == 0`; replies carry the status code and leave
/// `method` and `uri` empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpMessage<'a> {
    /// Head plus whatever part of the body is available.
    pub message: &'a [u8],
    pub method: &'a str,
    pub uri: &'a str,
    pub proto: &'a str,
    pub resp_code: u16,
    pub resp_status_msg: &'a str,
    /// Text after `?` in the request target.
    pub query_string: &'a str,
    /// Header lines in arrival order, at most the configured count.
    pub headers: Vec<(&'a str, &'a str)>,
    /// Body bytes available so far.
    pub body: &'a [u8],
    head_len: usize,
    content_length: Option<usize>,
}

impl<'a> HttpMessage<'a> {
    /// First header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }

    /// Whether this is a request rather than a reply.
    #[must_use]
    pub fn is_request(&self) -> bool { self.resp_code == 0 }

    /// Length of the head including the blank line.
    #[must_use]
    pub fn head_len(&self) -> usize { self.head_len }

    /// Declared or implied body length; `None` means the body runs until the
    /// peer closes.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> { self.content_length }

    /// Head plus body length, when the body length is known.
    #[must_use]
    pub fn total_len(&self) -> Option<usize> {
        self.content_length
            .and_then(|n| self.head_len.checked_add(n))
    }

    /// Whether the body uses chunked transfer coding.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }
}

/// Length of the head up to and including the blank line, `Ok(None)` if the
/// blank line has not arrived yet.
fn head_length(buf: &[u8]) -> Result<Option<usize>, HttpError> {
    for (i, &b) in buf.iter().enumerate() {
        if b < 0x20 && !matches!(b, b'\r' | b'\n' | b'\t') || b == 0x7f {
            return Err(HttpError::BadByte(b));
        }
        if b != b'\n' {
            continue;
        }
        match buf.get(i + 1..) {
            Some([b'\n', ..]) => return Ok(Some(i + 2)),
            Some([b'\r', b'\n', ..]) => return Ok(Some(i + 3)),
            _ => {}
        }
    }
    Ok(None)
}

fn no_body_status(code: u16) -> bool { (100..200).contains(&code) || code == 204 || code == 304 }

/// Parse the head of a request (`is_request`) or reply at the start of
/// `buf`.
///
/// Returns `Ok(None)` while the head is incomplete. Requests other than
/// `POST` and `PUT` without `Content-Length` have an empty body; replies
/// without it run until the connection closes. At most `max_headers` header
/// lines are kept.
///
/// # Errors
///
/// Returns an [`HttpError`] for malformed heads; the connection should be
/// closed.
///
/// # Examples
///
/// ```
/// use netmux::http::parse_http;
///
/// let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: x\r\n\r\n";
/// let msg = parse_http(raw, true, 20).unwrap().unwrap();
/// assert_eq!(msg.method, "GET");
/// assert_eq!(msg.uri, "/a");
/// assert_eq!(msg.query_string, "b=1");
/// assert_eq!(msg.header("host"), Some("x"));
/// assert_eq!(msg.total_len(), Some(raw.len()));
/// ```
pub fn parse_http(
    buf: &[u8],
    is_request: bool,
    max_headers: usize,
) -> Result<Option<HttpMessage<'_>>, HttpError> {
    let Some(head_len) = head_length(buf)? else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..head_len]).map_err(|_| HttpError::InvalidEncoding)?;
    let mut lines = head.lines();
    let first = lines.next().unwrap_or_default();
    let mut msg = HttpMessage {
        head_len,
        ..HttpMessage::default()
    };

    if is_request {
        let mut parts = first.split_ascii_whitespace();
        let (Some(method), Some(target), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::BadRequestLine);
        };
        if !proto.starts_with("HTTP/") {
            return Err(HttpError::BadRequestLine);
        }
        msg.method = method;
        msg.proto = proto;
        match target.split_once('?') {
            Some((uri, query)) => {
                msg.uri = uri;
                msg.query_string = query;
            }
            None => msg.uri = target,
        }
    } else {
        let (proto, rest) = first.split_once(' ').ok_or(HttpError::BadStatusLine)?;
        let rest = rest.trim_start();
        let (code, status) = rest.split_once(' ').unwrap_or((rest, ""));
        let code: u16 = code.parse().map_err(|_| HttpError::BadStatusLine)?;
        if !proto.starts_with("HTTP/") || !(100..600).contains(&code) {
            return Err(HttpError::BadStatusLine);
        }
        msg.proto = proto;
        msg.resp_code = code;
        msg.resp_status_msg = status.trim();
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if msg.headers.len() >= max_headers {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(HttpError::MalformedHeader)?;
        msg.headers.push((name.trim(), value.trim()));
    }

    msg.content_length = match msg.header("Content-Length") {
        Some(v) => {
            if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::BadContentLength);
            }
            let n: usize = v.parse().map_err(|_| HttpError::BadContentLength)?;
            if head_len.checked_add(n).is_none() {
                return Err(HttpError::BadContentLength);
            }
            Some(n)
        }
        None if is_request => {
            let has_body = msg.method.eq_ignore_ascii_case("POST")
                || msg.method.eq_ignore_ascii_case("PUT");
            (!has_body).then_some(0)
        }
        None if no_body_status(msg.resp_code) => Some(0),
        None => None,
    };

    let available = buf.len() - head_len;
    let body_len = msg.content_length.map_or(available, |n| n.min(available));
    msg.body = &buf[head_len..head_len + body_len];
    msg.message = &buf[..head_len + body_len];
    Ok(Some(msg))
}
