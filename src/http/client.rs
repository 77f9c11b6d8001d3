//! Outbound HTTP and WebSocket connections.

use crate::{
    connection::{ConnId, HandlerId},
    error::NetmuxError,
    manager::{ConnectOptions, Context, Manager, core::Core},
    uri::{UriError, parse_uri},
};

struct Target {
    addr: String,
    host: String,
    path: String,
}

fn target(url: &str) -> Result<Target, UriError> {
    let uri = parse_uri(url)?;
    match uri.scheme {
        "" | "http" | "ws" => {}
        other => return Err(UriError::UnsupportedScheme(other.to_owned())),
    }
    if uri.host.is_empty() {
        return Err(UriError::MissingHost);
    }
    let port = uri.port.unwrap_or(80);
    let addr = if uri.host.contains(':') {
        format!("tcp://[{}]:{port}", uri.host)
    } else {
        format!("tcp://{}:{port}", uri.host)
    };
    let mut path = if uri.path.is_empty() { "/".to_owned() } else { uri.path.to_owned() };
    if !uri.query.is_empty() {
        path.push('?');
        path.push_str(uri.query);
    }
    Ok(Target {
        addr,
        host: uri.host.to_owned(),
        path,
    })
}

impl Core {
    fn connect_http(
        &mut self,
        handler: HandlerId,
        url: &str,
        extra_headers: &str,
        post_data: Option<&[u8]>,
    ) -> Result<ConnId, NetmuxError> {
        let t = target(url)?;
        let id = self.connect(&t.addr, Some(handler), ConnectOptions::default())?;
        let conn = &mut self.conns[id];
        conn.set_protocol_http_websocket();
        let body = post_data.unwrap_or_default();
        let method = if post_data.is_some() { "POST" } else { "GET" };
        conn.send_fmt(format_args!(
            "{method} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n{extra_headers}\r\n",
            t.path,
            t.host,
            body.len()
        ));
        conn.send(body);
        Ok(id)
    }

    fn connect_ws(
        &mut self,
        handler: HandlerId,
        url: &str,
        protocol: Option<&str>,
        extra_headers: &str,
    ) -> Result<ConnId, NetmuxError> {
        let t = target(url)?;
        let id = self.connect(&t.addr, Some(handler), ConnectOptions::default())?;
        let conn = &mut self.conns[id];
        conn.set_protocol_http_websocket();
        conn.send_websocket_handshake(&t.path, Some(&t.host), protocol, extra_headers);
        Ok(id)
    }
}

impl Manager {
    /// Fetch `url` (`http://` only); the reply arrives as
    /// [`HttpEvent::Reply`](super::HttpEvent::Reply).
    ///
    /// Sends `POST` when `post_data` is given, `GET` otherwise.
    /// `extra_headers` must be empty or end with CRLF.
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::Uri`] for unsupported or malformed URLs.
    pub fn connect_http(
        &mut self,
        handler: HandlerId,
        url: &str,
        extra_headers: &str,
        post_data: Option<&[u8]>,
    ) -> Result<ConnId, NetmuxError> {
        self.core.connect_http(handler, url, extra_headers, post_data)
    }

    /// Open a WebSocket to `url` (`ws://` only).
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::Uri`] for unsupported or malformed URLs.
    pub fn connect_ws(
        &mut self,
        handler: HandlerId,
        url: &str,
        protocol: Option<&str>,
        extra_headers: &str,
    ) -> Result<ConnId, NetmuxError> {
        self.core.connect_ws(handler, url, protocol, extra_headers)
    }
}

impl Context<'_> {
    /// See [`Manager::connect_http`].
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::Uri`] for unsupported or malformed URLs.
    pub fn connect_http(
        &mut self,
        handler: HandlerId,
        url: &str,
        extra_headers: &str,
        post_data: Option<&[u8]>,
    ) -> Result<ConnId, NetmuxError> {
        self.core().connect_http(handler, url, extra_headers, post_data)
    }

    /// See [`Manager::connect_ws`].
    ///
    /// # Errors
    ///
    /// Returns [`NetmuxError::Uri`] for unsupported or malformed URLs.
    pub fn connect_ws(
        &mut self,
        handler: HandlerId,
        url: &str,
        protocol: Option<&str>,
        extra_headers: &str,
    ) -> Result<ConnId, NetmuxError> {
        self.core().connect_ws(handler, url, protocol, extra_headers)
    }
}
