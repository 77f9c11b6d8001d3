//! `multipart/form-data` parsing, buffered and streaming.

use super::{HttpError, HttpEvent, find_subslice};
use crate::{buffer::Buffer, event::Event, manager::Context, uri::parse_header_var};

/// One part of a multipart body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultipartPart<'a> {
    /// `name` from the part's `Content-Disposition`.
    pub var_name: &'a str,
    /// `filename` from the part's `Content-Disposition`, empty if absent.
    pub file_name: &'a str,
    /// Part body, or the slice of it delivered by this event.
    pub data: &'a [u8],
}

fn disposition<'a>(headers: &'a str) -> (&'a str, &'a str) {
    headers
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("Content-Disposition"))
        .map_or(("", ""), |(_, v)| {
            (
                parse_header_var(v, "name").unwrap_or_default(),
                parse_header_var(v, "filename").unwrap_or_default(),
            )
        })
}

/// Parse the next part of a fully buffered multipart body.
///
/// The boundary is taken from the first line. Returns the part and the
/// number of bytes to skip to reach the next boundary line, or `None` when
/// no complete part remains.
///
/// # Examples
///
/// ```
/// use netmux::http::parse_multipart;
///
/// let body = b"--xy\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--xy\r\n\
/// Content-Disposition: form-data; name=\"f\"; filename=\"b.txt\"\r\n\r\nhi\r\n--xy--\r\n";
/// let (first, used) = parse_multipart(body).unwrap();
/// assert_eq!((first.var_name, first.data), ("a", &b"1"[..]));
/// let (second, _) = parse_multipart(&body[used..]).unwrap();
/// assert_eq!((second.var_name, second.file_name), ("f", "b.txt"));
/// assert_eq!(second.data, b"hi");
/// ```
#[must_use]
pub fn parse_multipart(buf: &[u8]) -> Option<(MultipartPart<'_>, usize)> {
    let line_end = find_subslice(buf, b"\r\n")?;
    let boundary = &buf[..line_end];
    if boundary.len() < 3 || !boundary.starts_with(b"--") || boundary.ends_with(b"--") {
        return None;
    }
    let headers_start = line_end + 2;
    let headers_end = if buf[headers_start..].starts_with(b"\r\n") {
        headers_start
    } else {
        headers_start + find_subslice(&buf[headers_start..], b"\r\n\r\n")? + 2
    };
    let headers = std::str::from_utf8(&buf[headers_start..headers_end]).ok()?;
    let (var_name, file_name) = disposition(headers);
    let data_start = headers_end + 2;
    let mut delimiter = b"\r\n".to_vec();
    delimiter.extend_from_slice(boundary);
    let data_len = find_subslice(&buf[data_start..], &delimiter)?;
    let part = MultipartPart {
        var_name,
        file_name,
        data: &buf[data_start..data_start + data_len],
    };
    Some((part, data_start + data_len + 2))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Boundary,
    Headers,
    Data,
}

/// Streaming multipart state kept between `Recv` events.
#[derive(Debug)]
pub(super) struct MultipartStream {
    boundary: Vec<u8>,
    delimiter: Vec<u8>,
    stage: Stage,
    var_name: String,
    file_name: String,
}

impl MultipartStream {
    pub(super) fn new(boundary: &str) -> Self {
        let mut dashed = b"--".to_vec();
        dashed.extend_from_slice(boundary.as_bytes());
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&dashed);
        Self {
            boundary: dashed,
            delimiter,
            stage: Stage::Boundary,
            var_name: String::new(),
            file_name: String::new(),
        }
    }

    fn part<'a>(&'a self, data: &'a [u8]) -> MultipartPart<'a> {
        MultipartPart {
            var_name: &self.var_name,
            file_name: &self.file_name,
            data,
        }
    }
}

/// Emit events for every complete piece of the body in `buf`.
///
/// Returns `Ok(true)` once the closing boundary has been consumed.
pub(super) fn feed(
    ctx: &mut Context<'_>,
    mp: &mut MultipartStream,
    buf: &mut Buffer,
) -> Result<bool, HttpError> {
    loop {
        if ctx.conn().flags().is_closing() {
            return Ok(false);
        }
        match mp.stage {
            Stage::Boundary => {
                let blen = mp.boundary.len();
                let data = buf.as_slice();
                if data.len() < blen + 2 {
                    return Ok(false);
                }
                if !data.starts_with(&mp.boundary) {
                    return Err(HttpError::BadMultipart);
                }
                match &data[blen..blen + 2] {
                    b"\r\n" => {
                        buf.remove(blen + 2);
                        mp.stage = Stage::Headers;
                    }
                    b"--" => {
                        buf.remove(blen + 2);
                        if buf.as_slice().starts_with(b"\r\n") {
                            buf.remove(2);
                        }
                        ctx.deliver(Event::Http(HttpEvent::MultipartRequestEnd));
                        return Ok(true);
                    }
                    _ => return Err(HttpError::BadMultipart),
                }
            }
            Stage::Headers => {
                let data = buf.as_slice();
                let end = if data.starts_with(b"\r\n") {
                    0
                } else {
                    match find_subslice(data, b"\r\n\r\n") {
                        Some(pos) => pos + 2,
                        None => return Ok(false),
                    }
                };
                let headers =
                    std::str::from_utf8(&data[..end]).map_err(|_| HttpError::BadMultipart)?;
                let (var_name, file_name) = disposition(headers);
                mp.var_name = var_name.to_owned();
                mp.file_name = file_name.to_owned();
                buf.remove(end + 2);
                mp.stage = Stage::Data;
                ctx.deliver(Event::Http(HttpEvent::PartBegin(&mp.part(&[]))));
            }
            Stage::Data => {
                let data = buf.as_slice();
                if let Some(pos) = find_subslice(data, &mp.delimiter) {
                    if pos > 0 {
                        ctx.deliver(Event::Http(HttpEvent::PartData(&mp.part(&data[..pos]))));
                    }
                    ctx.deliver(Event::Http(HttpEvent::PartEnd(&mp.part(&[]))));
                    buf.remove(pos + 2);
                    mp.stage = Stage::Boundary;
                    continue;
                }
                let keep = mp.delimiter.len() - 1;
                if data.len() > keep {
                    let n = data.len() - keep;
                    ctx.deliver(Event::Http(HttpEvent::PartData(&mp.part(&data[..n]))));
                    buf.remove(n);
                }
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_multipart;

    #[test]
    fn closing_boundary_ends_iteration() {
        assert!(parse_multipart(b"--xy--\r\n").is_none());
    }

    #[test]
    fn part_without_headers() {
        let (part, used) = parse_multipart(b"--b\r\n\r\nraw\r\n--b--").expect("one part");
        assert_eq!(part.var_name, "");
        assert_eq!(part.data, b"raw");
        assert_eq!(used, 12);
    }

    #[test]
    fn incomplete_part_is_not_returned() {
        assert!(parse_multipart(b"--b\r\nContent-Disposition: form-data; name=x\r\n\r\nda").is_none());
    }
}
