//! Server-side reply helpers.

use crate::connection::Connection;

const SERVER: &str = concat!("netmux/", env!("CARGO_PKG_VERSION"));

/// Reason phrase for `status`, or `"OK"` for unknown codes.
#[must_use]
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        416 => "Requested Range Not Satisfiable",
        418 => "I'm a teapot",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

impl Connection {
    /// Queue a status line and a `Server` header, but not the blank line.
    ///
    /// `extra_headers` are written verbatim, one per line, without a
    /// trailing CRLF.
    pub fn send_response_line(&mut self, status: u16, extra_headers: Option<&str>) {
        self.send_fmt(format_args!(
            "HTTP/1.1 {status} {}\r\nServer: {SERVER}\r\n",
            status_text(status)
        ));
        if let Some(extra) = extra_headers.filter(|e| !e.is_empty()) {
            self.send_fmt(format_args!("{extra}\r\n"));
        }
    }

    /// Queue a complete reply head.
    ///
    /// With `content_length == None` the body must follow as
    /// [`send_http_chunk`](Self::send_http_chunk) calls ending with an empty
    /// chunk.
    pub fn send_head(&mut self, status: u16, content_length: Option<usize>, extra_headers: Option<&str>) {
        self.send_response_line(status, extra_headers);
        match content_length {
            Some(n) => self.send_fmt(format_args!("Content-Length: {n}\r\n\r\n")),
            None => self.send(b"Transfer-Encoding: chunked\r\n\r\n"),
        }
    }

    /// Queue one chunk of a chunked body; an empty `data` ends the body.
    pub fn send_http_chunk(&mut self, data: &[u8]) {
        self.send_fmt(format_args!("{:X}\r\n", data.len()));
        self.send(data);
        self.send(b"\r\n");
    }

    /// Queue a redirect to `location` with a short HTML body.
    pub fn send_redirect(&mut self, status: u16, location: &str, extra_headers: Option<&str>) {
        let body = format!("<p>Moved <a href='{location}'>here</a>.\r\n");
        let mut headers = format!("Location: {location}\r\nContent-Type: text/html");
        if let Some(extra) = extra_headers.filter(|e| !e.is_empty()) {
            headers.push_str("\r\n");
            headers.push_str(extra);
        }
        self.send_head(status, Some(body.len()), Some(&headers));
        self.send(body.as_bytes());
    }

    /// Queue a plain-text error reply and close once it is written.
    ///
    /// The body is `reason`, or the status text when `reason` is `None`.
    pub fn send_error(&mut self, status: u16, reason: Option<&str>) {
        let body = reason.unwrap_or_else(|| status_text(status));
        self.send_head(
            status,
            Some(body.len()),
            Some("Content-Type: text/plain\r\nConnection: close"),
        );
        self.send(body.as_bytes());
        self.close_after_send();
    }
}
