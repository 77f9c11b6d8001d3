//! URI, address and form-encoding helpers shared by the protocol layers.
//!
//! Everything here borrows from its input where it can; only percent-decoded
//! values are returned as owned data.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use thiserror::Error;

/// Errors produced while parsing URLs or form-encoded values.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UriError {
    /// The port component is not a number in `0..=65535`.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    /// A bracketed IPv6 host is missing its closing bracket.
    #[error("unterminated IPv6 literal")]
    UnterminatedIpv6,
    /// A `%xx` escape is truncated or not hexadecimal.
    #[error("malformed percent escape at byte {0}")]
    BadEscape(usize),
    /// Path normalisation requires an absolute path.
    #[error("path must start with '/'")]
    RelativePath,
    /// The URL has no host component.
    #[error("missing host")]
    MissingHost,
    /// The scheme is not handled by the caller.
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
}

/// Errors produced while parsing a bind or connect address.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The `proto://` prefix names an unknown transport.
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    /// The port component is missing or not a number.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
    /// A bracketed IPv6 host is missing its closing bracket.
    #[error("unterminated IPv6 literal in {0:?}")]
    UnterminatedIpv6(String),
}

/// Components of a URL, borrowed from the parsed text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Uri<'a> {
    pub scheme: &'a str,
    pub user_info: &'a str,
    pub host: &'a str,
    pub port: Option<u16>,
    pub path: &'a str,
    pub query: &'a str,
    pub fragment: &'a str,
}

/// Split `[scheme://[user_info@]]host[:port][/path][?query][#fragment]`.
///
/// # Errors
///
/// Returns [`UriError::InvalidPort`] for a non-numeric port and
/// [`UriError::UnterminatedIpv6`] for a bracketed host without `]`.
///
/// # Examples
///
/// ```
/// use netmux::uri::parse_uri;
///
/// let uri = parse_uri("ws://user@[::1]:8080/chat?room=1#top").unwrap();
/// assert_eq!(uri.scheme, "ws");
/// assert_eq!(uri.user_info, "user");
/// assert_eq!(uri.host, "::1");
/// assert_eq!(uri.port, Some(8080));
/// assert_eq!(uri.path, "/chat");
/// assert_eq!(uri.query, "room=1");
/// assert_eq!(uri.fragment, "top");
/// ```
pub fn parse_uri(input: &str) -> Result<Uri<'_>, UriError> {
    let mut uri = Uri::default();
    let mut rest = input;

    if let Some(pos) = rest.find("://") {
        if !rest[..pos].contains(['/', '?', '#']) {
            uri.scheme = &rest[..pos];
            rest = &rest[pos + 3..];
        }
    }

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (mut authority, tail) = rest.split_at(authority_end);

    if let Some(at) = authority.rfind('@') {
        uri.user_info = &authority[..at];
        authority = &authority[at + 1..];
    }

    let (host, port) = split_host_port(authority).map_err(|e| match e {
        HostPortError::Ipv6 => UriError::UnterminatedIpv6,
        HostPortError::Port => UriError::InvalidPort(input.to_owned()),
    })?;
    uri.host = host;
    uri.port = port;

    let (before_fragment, fragment) = match tail.find('#') {
        Some(i) => (&tail[..i], &tail[i + 1..]),
        None => (tail, ""),
    };
    uri.fragment = fragment;
    match before_fragment.find('?') {
        Some(i) => {
            uri.path = &before_fragment[..i];
            uri.query = &before_fragment[i + 1..];
        }
        None => uri.path = before_fragment,
    }
    Ok(uri)
}

enum HostPortError {
    Ipv6,
    Port,
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), HostPortError> {
    if let Some(inner) = authority.strip_prefix('[') {
        let close = inner.find(']').ok_or(HostPortError::Ipv6)?;
        let host = &inner[..close];
        let after = &inner[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| HostPortError::Port)?),
            None if after.is_empty() => None,
            None => return Err(HostPortError::Port),
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Ok((host, Some(port.parse().map_err(|_| HostPortError::Port)?)))
        }
        _ => Ok((authority, None)),
    }
}

/// Resolve `.` and `..` segments of an absolute path.
///
/// `..` never climbs above the root; a trailing slash is kept.
///
/// # Errors
///
/// Returns [`UriError::RelativePath`] when `path` does not start with `/`.
///
/// # Examples
///
/// ```
/// use netmux::uri::normalize_uri_path;
///
/// assert_eq!(normalize_uri_path("/a/./b/../c/").unwrap(), "/a/c/");
/// assert_eq!(normalize_uri_path("/../x").unwrap(), "/x");
/// ```
pub fn normalize_uri_path(path: &str) -> Result<String, UriError> {
    if !path.starts_with('/') {
        return Err(UriError::RelativePath);
    }
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing = false;
    for segment in path[1..].split('/') {
        trailing = false;
        match segment {
            "" | "." => trailing = true,
            ".." => {
                segments.pop();
                trailing = true;
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    for s in &segments {
        out.push('/');
        out.push_str(s);
    }
    if trailing || out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Transport named by a bind or connect address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        })
    }
}

/// Parsed `[proto://][host]:port` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub transport: Transport,
    /// `None` when the host was omitted, meaning all interfaces.
    pub host: Option<String>,
    pub port: u16,
}

impl Address {
    /// Socket address for an omitted or literal host; `None` for names that
    /// still need resolving.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            None => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)),
            Some(h) => h.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, self.port)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.as_deref() {
            Some(h) if h.contains(':') => write!(f, "{}://[{h}]:{}", self.transport, self.port),
            Some(h) => write!(f, "{}://{h}:{}", self.transport, self.port),
            None => write!(f, "{}://:{}", self.transport, self.port),
        }
    }
}

/// Parse a bind/connect address such as `udp://:53`, `1883` or `[::1]:80`.
///
/// # Errors
///
/// Returns an [`AddressError`] for unknown transports, missing or invalid
/// ports, and unterminated IPv6 literals.
///
/// # Examples
///
/// ```
/// use netmux::uri::{Transport, parse_address};
///
/// let addr = parse_address("udp://:5353").unwrap();
/// assert_eq!(addr.transport, Transport::Udp);
/// assert_eq!(addr.host, None);
/// assert_eq!(addr.port, 5353);
/// ```
pub fn parse_address(input: &str) -> Result<Address, AddressError> {
    let (transport, rest) = match input.split_once("://") {
        Some(("tcp", rest)) => (Transport::Tcp, rest),
        Some(("udp", rest)) => (Transport::Udp, rest),
        Some((other, _)) => return Err(AddressError::UnknownTransport(other.to_owned())),
        None => (Transport::Tcp, input),
    };
    let invalid_port = || AddressError::InvalidPort(input.to_owned());
    if let Ok(port) = rest.parse::<u16>() {
        return Ok(Address {
            transport,
            host: None,
            port,
        });
    }
    let (host, port) = split_host_port(rest).map_err(|e| match e {
        HostPortError::Ipv6 => AddressError::UnterminatedIpv6(input.to_owned()),
        HostPortError::Port => invalid_port(),
    })?;
    let port = port.ok_or_else(invalid_port)?;
    Ok(Address {
        transport,
        host: (!host.is_empty()).then(|| host.to_owned()),
        port,
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%xx` escapes, and `+` as space when `is_form` is set.
///
/// # Errors
///
/// Returns [`UriError::BadEscape`] with the offset of a truncated or
/// non-hexadecimal escape.
///
/// # Examples
///
/// ```
/// use netmux::uri::url_decode;
///
/// assert_eq!(url_decode(b"a%20b+c", true).unwrap(), b"a b c");
/// assert_eq!(url_decode(b"a+b", false).unwrap(), b"a+b");
/// ```
pub fn url_decode(src: &[u8], is_form: bool) -> Result<Vec<u8>, UriError> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'%' => {
                let hi = src.get(i + 1).copied().and_then(hex_value);
                let lo = src.get(i + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => return Err(UriError::BadEscape(i)),
                }
                i += 3;
            }
            b'+' if is_form => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Look up a variable in a query string or form-encoded body.
///
/// Names are compared case-insensitively. Values are URL-decoded; a value
/// with a broken escape is treated as absent.
///
/// # Examples
///
/// ```
/// use netmux::uri::get_http_var;
///
/// let body = "name=J%C3%B6rg&City=Oslo+Centre";
/// assert_eq!(get_http_var(body, "city").as_deref(), Some("Oslo Centre"));
/// assert_eq!(get_http_var(body, "name").as_deref(), Some("Jörg"));
/// assert_eq!(get_http_var(body, "zip"), None);
/// ```
#[must_use]
pub fn get_http_var(buf: &str, name: &str) -> Option<String> {
    buf.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if !key.eq_ignore_ascii_case(name) {
            return None;
        }
        let decoded = url_decode(value.as_bytes(), true).ok()?;
        Some(String::from_utf8_lossy(&decoded).into_owned())
    })
}

/// Extract `name=value` or `name="value"` from a header value such as
/// `form-data; name="file"; filename="a.txt"`.
///
/// # Examples
///
/// ```
/// use netmux::uri::parse_header_var;
///
/// let v = r#"form-data; name="upload"; filename="a b.txt""#;
/// assert_eq!(parse_header_var(v, "filename"), Some("a b.txt"));
/// assert_eq!(parse_header_var(v, "name"), Some("upload"));
/// assert_eq!(parse_header_var("Digest realm=x, nonce=y", "nonce"), Some("y"));
/// ```
#[must_use]
pub fn parse_header_var<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let bytes = header.as_bytes();
    let mut start = 0;
    while let Some(found) = header[start..].find(name) {
        let pos = start + found;
        let end = pos + name.len();
        let boundary = pos == 0 || matches!(bytes[pos - 1], b' ' | b';' | b',' | b'\t');
        if boundary && bytes.get(end) == Some(&b'=') {
            let value = &header[end + 1..];
            if let Some(quoted) = value.strip_prefix('"') {
                let close = quoted.find('"').unwrap_or(quoted.len());
                return Some(&quoted[..close]);
            }
            let stop = value.find([';', ',', ' ']).unwrap_or(value.len());
            return Some(&value[..stop]);
        }
        start = end;
    }
    None
}

/// One element of a comma-separated list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListEntry<'a> {
    /// The whole entry, trimmed.
    pub value: &'a str,
    /// The part after `=`, when present.
    pub eq_value: Option<&'a str>,
}

/// Split the next entry off a list such as `a=1, b, c=3`.
///
/// Returns the entry and the remaining list, or `None` when the list is
/// exhausted.
///
/// # Examples
///
/// ```
/// use netmux::uri::next_comma_list_entry;
///
/// let (entry, rest) = next_comma_list_entry("x=1, y").unwrap();
/// assert_eq!(entry.value, "x=1");
/// assert_eq!(entry.eq_value, Some("1"));
/// let (entry, rest) = next_comma_list_entry(rest).unwrap();
/// assert_eq!(entry.value, "y");
/// assert!(next_comma_list_entry(rest).is_none());
/// ```
#[must_use]
pub fn next_comma_list_entry(list: &str) -> Option<(ListEntry<'_>, &str)> {
    let list = list.trim_start_matches([',', ' ']);
    if list.is_empty() {
        return None;
    }
    let (raw, rest) = list.split_once(',').unwrap_or((list, ""));
    let value = raw.trim();
    let eq_value = value.split_once('=').map(|(_, v)| v.trim());
    Some((ListEntry { value, eq_value }, rest))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{
        AddressError,
        Transport,
        UriError,
        normalize_uri_path,
        parse_address,
        parse_uri,
        url_decode,
    };

    #[rstest]
    #[case("8000", Transport::Tcp, None, 8000)]
    #[case(":8000", Transport::Tcp, None, 8000)]
    #[case("tcp://127.0.0.1:80", Transport::Tcp, Some("127.0.0.1"), 80)]
    #[case("udp://[::1]:53", Transport::Udp, Some("::1"), 53)]
    #[case("example.org:1883", Transport::Tcp, Some("example.org"), 1883)]
    fn addresses_parse(
        #[case] input: &str,
        #[case] transport: Transport,
        #[case] host: Option<&str>,
        #[case] port: u16,
    ) {
        let addr = parse_address(input).expect("valid address");
        assert_eq!(addr.transport, transport);
        assert_eq!(addr.host.as_deref(), host);
        assert_eq!(addr.port, port);
    }

    #[rstest]
    #[case("sctp://:1", AddressError::UnknownTransport("sctp".into()))]
    #[case("localhost", AddressError::InvalidPort("localhost".into()))]
    #[case("host:99999", AddressError::InvalidPort("host:99999".into()))]
    #[case("[::1:80", AddressError::UnterminatedIpv6("[::1:80".into()))]
    fn bad_addresses_are_rejected(#[case] input: &str, #[case] expected: AddressError) {
        assert_eq!(parse_address(input), Err(expected));
    }

    #[test]
    fn name_addresses_need_resolving() {
        let addr = parse_address("tcp://broker.local:1883").expect("valid");
        assert!(addr.socket_addr().is_none());
        assert_eq!(addr.to_string(), "tcp://broker.local:1883");
    }

    #[test]
    fn uri_without_scheme_or_port() {
        let uri = parse_uri("example.com/index.html").expect("valid");
        assert_eq!(uri.scheme, "");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, None);
        assert_eq!(uri.path, "/index.html");
    }

    #[test]
    fn uri_with_bad_port() {
        assert!(matches!(
            parse_uri("http://h:port/"),
            Err(UriError::InvalidPort(_))
        ));
    }

    #[rstest]
    #[case("/", "/")]
    #[case("/a/b/..", "/a/")]
    #[case("/a//b/./c", "/a/b/c")]
    #[case("/../../etc/passwd", "/etc/passwd")]
    fn paths_normalise(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_uri_path(input).as_deref(), Ok(expected));
    }

    #[test]
    fn truncated_escape_is_an_error() {
        assert_eq!(url_decode(b"ab%4", false), Err(UriError::BadEscape(2)));
    }
}
