//! In-place reassembly of `Transfer-Encoding: chunked` bodies.
//!
//! The receive buffer is laid out as `[head][decoded body][encoded rest]`.
//! Each complete chunk has its size line and trailing CRLF cut out so its data
//! joins the decoded body, and a [`HttpEvent::Chunk`] is delivered.

use super::{HttpError, HttpEvent, find_subslice, parse_http};
use crate::{buffer::Buffer, connection::ConnFlags, event::Event, manager::Context};

/// Longest size line accepted, extensions included.
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    /// A data chunk: size line length and data length.
    Data { line_len: usize, data_len: usize },
    /// The zero-size chunk plus trailers, `total` bytes in all.
    Last { total: usize },
}

fn parse_chunk(buf: &[u8]) -> Result<Option<Chunk>, HttpError> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return if buf.len() > MAX_SIZE_LINE {
            Err(HttpError::BadChunk)
        } else {
            Ok(None)
        };
    };
    let line = std::str::from_utf8(&buf[..nl]).map_err(|_| HttpError::BadChunk)?;
    let size_text = line
        .trim_end_matches('\r')
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::BadChunk);
    }
    let data_len = usize::from_str_radix(size_text, 16).map_err(|_| HttpError::BadChunk)?;
    let line_len = nl + 1;

    if data_len == 0 {
        let rest = &buf[line_len..];
        if rest.starts_with(b"\r\n") {
            return Ok(Some(Chunk::Last {
                total: line_len + 2,
            }));
        }
        return Ok(find_subslice(rest, b"\r\n\r\n").map(|end| Chunk::Last {
            total: line_len + end + 4,
        }));
    }

    let needed = line_len
        .checked_add(data_len)
        .and_then(|n| n.checked_add(2))
        .ok_or(HttpError::BadChunk)?;
    if buf.len() < needed {
        return Ok(None);
    }
    if &buf[needed - 2..needed] != b"\r\n" {
        return Err(HttpError::BadChunk);
    }
    Ok(Some(Chunk::Data { line_len, data_len }))
}

/// Consume as many chunks as are available.
///
/// Returns `Ok(true)` once the message completed and has been removed from
/// `buf`, `Ok(false)` when more bytes are needed.
pub(super) fn process(
    ctx: &mut Context<'_>,
    body_len: &mut usize,
    buf: &mut Buffer,
    is_request: bool,
    max_headers: usize,
) -> Result<bool, HttpError> {
    loop {
        let Some(head_len) = parse_http(buf.as_slice(), is_request, max_headers)?
            .map(|m| m.head_len())
        else {
            return Ok(false);
        };
        let encoded_at = head_len + *body_len;
        let Some(chunk) = parse_chunk(&buf.as_slice()[encoded_at..])? else {
            return Ok(false);
        };
        match chunk {
            Chunk::Data { line_len, data_len } => {
                buf.remove_range(encoded_at, line_len);
                buf.remove_range(encoded_at + data_len, 2);
                *body_len += data_len;
                ctx.conn_mut().flags_mut().remove(ConnFlags::DELETE_CHUNK);
                deliver(ctx, buf.as_slice(), head_len + *body_len, is_request, max_headers, true)?;
                if ctx.conn().flags().contains(ConnFlags::DELETE_CHUNK) {
                    buf.remove_range(head_len, *body_len);
                    *body_len = 0;
                    ctx.conn_mut().flags_mut().remove(ConnFlags::DELETE_CHUNK);
                }
            }
            Chunk::Last { total } => {
                buf.remove_range(encoded_at, total);
                let end = head_len + *body_len;
                deliver(ctx, buf.as_slice(), end, is_request, max_headers, false)?;
                buf.remove(end);
                *body_len = 0;
                return Ok(true);
            }
        }
        if ctx.conn().flags().is_closing() {
            return Ok(false);
        }
    }
}

fn deliver(
    ctx: &mut Context<'_>,
    buf: &[u8],
    end: usize,
    is_request: bool,
    max_headers: usize,
    partial: bool,
) -> Result<(), HttpError> {
    let Some(mut msg) = parse_http(&buf[..end], is_request, max_headers)? else {
        return Ok(());
    };
    msg.body = &buf[msg.head_len()..end];
    msg.message = &buf[..end];
    let event = match (partial, is_request) {
        (true, _) => HttpEvent::Chunk(&msg),
        (false, true) => HttpEvent::Request(&msg),
        (false, false) => HttpEvent::Reply(&msg),
    };
    ctx.deliver(Event::Http(event));
    Ok(())
}
