//! System resolver files: `/etc/hosts` and `/etc/resolv.conf`.

use std::{fs, net::IpAddr};

use tracing::debug;

const HOSTS_PATH: &str = "/etc/hosts";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
/// Nameserver used when `/etc/resolv.conf` names none.
pub const DEFAULT_NAMESERVER: &str = "udp://8.8.8.8:53";

fn entries(text: &str) -> impl Iterator<Item = Vec<&str>> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| !fields.is_empty())
}

/// Address mapped to `name` in hosts-file `text`.
///
/// Names compare case-insensitively; the first matching line wins.
///
/// # Examples
///
/// ```
/// use netmux::dns::parse_hosts;
///
/// let hosts = "127.0.0.1 localhost\n# comment\n10.1.2.3 db db.lan\n";
/// assert_eq!(parse_hosts(hosts, "DB.lan"), Some([10, 1, 2, 3].into()));
/// assert_eq!(parse_hosts(hosts, "web"), None);
/// ```
#[must_use]
pub fn parse_hosts(text: &str, name: &str) -> Option<IpAddr> {
    entries(text).find_map(|fields| {
        let ip = fields[0].parse::<IpAddr>().ok()?;
        fields[1..]
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(name))
            .then_some(ip)
    })
}

/// Look `name` up in `/etc/hosts`.
#[must_use]
pub fn lookup_host(name: &str) -> Option<IpAddr> {
    let text = fs::read_to_string(HOSTS_PATH)
        .inspect_err(|e| debug!(path = HOSTS_PATH, error = %e, "hosts file unreadable"))
        .ok()?;
    parse_hosts(&text, name)
}

/// First `nameserver` of resolv.conf `text` as a `udp://` address.
///
/// # Examples
///
/// ```
/// use netmux::dns::parse_resolv_conf;
///
/// let conf = "search lan\nnameserver fe80::1\nnameserver 1.1.1.1\n";
/// assert_eq!(parse_resolv_conf(conf).as_deref(), Some("udp://[fe80::1]:53"));
/// ```
#[must_use]
pub fn parse_resolv_conf(text: &str) -> Option<String> {
    entries(text).find_map(|fields| match fields.as_slice() {
        ["nameserver", ip, ..] => match ip.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => Some(format!("udp://{v4}:53")),
            IpAddr::V6(v6) => Some(format!("udp://[{v6}]:53")),
        },
        _ => None,
    })
}

/// Nameserver from `/etc/resolv.conf`, or [`DEFAULT_NAMESERVER`].
pub(crate) fn system_nameserver() -> String {
    fs::read_to_string(RESOLV_CONF_PATH)
        .ok()
        .and_then(|text| parse_resolv_conf(&text))
        .unwrap_or_else(|| DEFAULT_NAMESERVER.to_owned())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{parse_hosts, parse_resolv_conf};

    #[rstest]
    #[case::trailing_comment("192.168.0.9 nas # storage", "nas", Some("192.168.0.9"))]
    #[case::commented_out("#10.0.0.1 nas", "nas", None)]
    #[case::ipv6("::1 localhost ip6-localhost", "ip6-localhost", Some("::1"))]
    #[case::bad_address("not-an-ip nas", "nas", None)]
    fn hosts_lines(#[case] text: &str, #[case] name: &str, #[case] expected: Option<&str>) {
        let expected = expected.map(|s| s.parse().expect("test address"));
        assert_eq!(parse_hosts(text, name), expected);
    }

    #[test]
    fn resolv_conf_without_nameserver() {
        assert_eq!(parse_resolv_conf("search example.com\noptions ndots:2\n"), None);
        assert_eq!(
            parse_resolv_conf("nameserver 9.9.9.9 # quad9").as_deref(),
            Some("udp://9.9.9.9:53")
        );
    }
}
