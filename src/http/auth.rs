//! HTTP Digest authentication with `qop=auth`.
//!
//! Passwords are kept in `htdigest` form: one `user:realm:HA1` line per
//! account, where `HA1 = MD5(user:realm:password)`. Nonces are the issue
//! time in hexadecimal seconds, so no server-side nonce table is needed.

use std::{
    fmt::Write as _,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use md5::{Digest, Md5};
use rand::Rng;

use super::HttpMessage;
use crate::{connection::Connection, uri::parse_header_var};

/// Age after which a nonce is refused.
pub const NONCE_LIFETIME: Duration = Duration::from_secs(3600);

/// Credentials guarding an endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DigestAuth {
    /// Realm announced in the challenge and matched against password lines.
    pub realm: String,
    /// `htdigest` lines, see [`htdigest_line`].
    pub passwords: String,
}

fn md5_hex(parts: &[&str]) -> String {
    let mut md5 = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            md5.update(b":");
        }
        md5.update(part.as_bytes());
    }
    md5.finalize()
        .iter()
        .fold(String::with_capacity(32), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

fn digest_response(ha1: &str, method: &str, uri: &str, nonce: &str, nc: &str, cnonce: &str, qop: &str) -> String {
    let ha2 = md5_hex(&[method, uri]);
    md5_hex(&[ha1, nonce, nc, cnonce, qop, &ha2])
}

/// One `htdigest` password line for `user` in `realm`.
///
/// # Examples
///
/// ```
/// use netmux::http::htdigest_line;
///
/// let line = htdigest_line("joe", "home", "secret");
/// assert!(line.starts_with("joe:home:"));
/// assert_eq!(line.len(), "joe:home:".len() + 32);
/// ```
#[must_use]
pub fn htdigest_line(user: &str, realm: &str, password: &str) -> String {
    format!("{user}:{realm}:{}", md5_hex(&[user, realm, password]))
}

/// Nonce encoding the issue time `at`.
#[must_use]
pub fn digest_nonce(at: SystemTime) -> String {
    let secs = at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    format!("{secs:x}")
}

fn nonce_is_fresh(nonce: &str, now: SystemTime) -> bool {
    if nonce.is_empty() || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    let Ok(secs) = u64::from_str_radix(nonce, 16) else {
        return false;
    };
    let Some(issued) = UNIX_EPOCH.checked_add(Duration::from_secs(secs)) else {
        return false;
    };
    now.duration_since(issued)
        .is_ok_and(|age| age < NONCE_LIFETIME)
}

/// `Authorization` header line, CRLF included, answering a challenge with
/// `nonce` for a request of `method` on `uri`.
#[must_use]
pub fn create_digest_auth_header(
    method: &str,
    uri: &str,
    realm: &str,
    user: &str,
    password: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&[user, realm, password]);
    let cnonce = format!("{:08x}", rand::thread_rng().r#gen::<u32>());
    let response = digest_response(&ha1, method, uri, nonce, "00000001", &cnonce, "auth");
    format!(
        "Authorization: Digest username=\"{user}\", realm=\"{realm}\", nonce=\"{nonce}\", \
         uri=\"{uri}\", qop=auth, nc=00000001, cnonce=\"{cnonce}\", response=\"{response}\"\r\n"
    )
}

/// Whether `msg` carries valid Digest credentials for `realm`.
///
/// The nonce must have been issued by [`digest_nonce`] less than
/// [`NONCE_LIFETIME`] before `now`. The user must appear in `passwords`
/// under `realm`.
#[must_use]
pub fn check_digest_auth(msg: &HttpMessage<'_>, realm: &str, passwords: &str, now: SystemTime) -> bool {
    let Some(params) = msg
        .header("Authorization")
        .and_then(|h| h.get(..7).filter(|s| s.eq_ignore_ascii_case("digest ")).map(|_| &h[7..]))
    else {
        return false;
    };
    let field = |name| parse_header_var(params, name);
    let (Some(user), Some(nonce), Some(uri), Some(nc), Some(cnonce), Some(qop), Some(response)) = (
        field("username"),
        field("nonce"),
        field("uri"),
        field("nc"),
        field("cnonce"),
        field("qop"),
        field("response"),
    ) else {
        return false;
    };
    if field("realm").is_some_and(|r| r != realm) || !nonce_is_fresh(nonce, now) {
        return false;
    }
    passwords
        .lines()
        .filter_map(|line| {
            let mut it = line.trim().splitn(3, ':');
            Some((it.next()?, it.next()?, it.next()?))
        })
        .filter(|&(u, r, _)| u == user && r == realm)
        .any(|(_, _, ha1)| {
            digest_response(ha1, msg.method, uri, nonce, nc, cnonce, qop).eq_ignore_ascii_case(response)
        })
}

impl Connection {
    /// Queue a `401` reply challenging the client to authenticate in
    /// `realm` with a nonce issued at `now`.
    pub fn send_digest_auth_request(&mut self, realm: &str, now: SystemTime) {
        let challenge = format!(
            "WWW-Authenticate: Digest qop=\"auth\", realm=\"{realm}\", nonce=\"{}\"",
            digest_nonce(now)
        );
        self.send_head(401, Some(0), Some(&challenge));
    }
}
