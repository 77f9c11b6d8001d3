//! IPv4 access control lists for listeners.
//!
//! An ACL is a comma-separated list of `+` (allow) or `-` (deny) entries,
//! each an address with an optional prefix length: `-0.0.0.0/0,+10.0.0.0/8`.
//! The last matching entry decides. A non-empty list denies peers no entry
//! matches; an empty list allows everyone.

use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

use thiserror::Error;

/// Reasons an ACL string is rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AclError {
    /// An entry does not start with `+` or `-`.
    #[error("ACL entry {0:?} must start with '+' or '-'")]
    BadFlag(String),
    /// The address or prefix length of an entry is malformed.
    #[error("invalid network in ACL entry {0:?}")]
    BadNetwork(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rule {
    allow: bool,
    net: u32,
    mask: u32,
}

/// Parsed access control list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpAcl {
    rules: Vec<Rule>,
}

fn parse_octet(text: &str) -> Option<u8> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_rule(entry: &str) -> Result<Rule, AclError> {
    let allow = match entry.as_bytes().first() {
        Some(b'+') => true,
        Some(b'-') => false,
        _ => return Err(AclError::BadFlag(entry.to_owned())),
    };
    let bad = || AclError::BadNetwork(entry.to_owned());
    let (addr, bits) = match entry[1..].split_once('/') {
        Some((addr, bits)) => (addr, parse_octet(bits).filter(|&b| b <= 32).ok_or_else(bad)?),
        None => (&entry[1..], 32),
    };
    let mut octets = [0u8; 4];
    let mut parts = addr.split('.');
    for octet in &mut octets {
        *octet = parts.next().and_then(parse_octet).ok_or_else(bad)?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    let mask = u32::MAX.checked_shl(32 - u32::from(bits)).unwrap_or(0);
    Ok(Rule {
        allow,
        net: u32::from(Ipv4Addr::from(octets)) & mask,
        mask,
    })
}

impl IpAcl {
    /// Parse `acl`.
    ///
    /// # Errors
    ///
    /// Returns an [`AclError`] naming the first malformed entry.
    pub fn parse(acl: &str) -> Result<Self, AclError> {
        let rules = acl
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_rule)
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Whether a peer at `ip` may connect.
    ///
    /// IPv6 peers match no entry unless they are IPv4-mapped.
    #[must_use]
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let v4 = match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        };
        let Some(addr) = v4.map(u32::from) else {
            return false;
        };
        self.rules
            .iter()
            .rev()
            .find(|rule| addr & rule.mask == rule.net)
            .is_some_and(|rule| rule.allow)
    }
}

impl FromStr for IpAcl {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

/// Check `ip` against the ACL text `acl`.
///
/// # Errors
///
/// Returns an [`AclError`] if `acl` is malformed.
///
/// # Examples
///
/// ```
/// use netmux::acl::check_ip_acl;
///
/// let acl = "-0.0.0.0/0,+192.168.0.0/16";
/// assert_eq!(check_ip_acl(acl, "192.168.7.1".parse().unwrap()), Ok(true));
/// assert_eq!(check_ip_acl(acl, "10.0.0.1".parse().unwrap()), Ok(false));
/// ```
pub fn check_ip_acl(acl: &str, ip: IpAddr) -> Result<bool, AclError> {
    Ok(IpAcl::parse(acl)?.allows(ip))
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use rstest::rstest;

    use super::{AclError, IpAcl, check_ip_acl};

    fn ip(text: &str) -> IpAddr { text.parse().expect("address literal") }

    #[rstest]
    #[case::empty_allows_all("", "203.0.113.5", true)]
    #[case::unmatched_is_denied("+10.0.0.0/8", "192.0.2.1", false)]
    #[case::network_match("+10.0.0.0/8", "10.200.3.4", true)]
    #[case::last_entry_wins("+10.0.0.0/8,-10.1.0.0/16", "10.1.2.3", false)]
    #[case::later_allow_overrides("-0.0.0.0/0,+10.1.2.3", "10.1.2.3", true)]
    #[case::host_without_prefix("+10.1.2.3", "10.1.2.4", false)]
    #[case::host_bits_in_entry_are_ignored("+10.9.9.9/8", "10.0.0.1", true)]
    #[case::mapped_ipv6("+10.0.0.0/8", "::ffff:10.0.0.7", true)]
    #[case::plain_ipv6("-0.0.0.0/0,+0.0.0.0/0", "2001:db8::1", false)]
    fn acl_decisions(#[case] acl: &str, #[case] peer: &str, #[case] allowed: bool) {
        assert_eq!(check_ip_acl(acl, ip(peer)), Ok(allowed));
    }

    #[rstest]
    #[case::missing_flag("10.0.0.0/8", AclError::BadFlag("10.0.0.0/8".to_owned()))]
    #[case::short_address("+192.168/16", AclError::BadNetwork("+192.168/16".to_owned()))]
    #[case::octet_overflow("+10.0.0.256", AclError::BadNetwork("+10.0.0.256".to_owned()))]
    #[case::prefix_too_long("+10.0.0.0/33", AclError::BadNetwork("+10.0.0.0/33".to_owned()))]
    #[case::signed_octet("+10.+1.0.0", AclError::BadNetwork("+10.+1.0.0".to_owned()))]
    #[case::extra_octet("+1.2.3.4.5", AclError::BadNetwork("+1.2.3.4.5".to_owned()))]
    fn malformed_acls(#[case] acl: &str, #[case] expected: AclError) {
        assert_eq!(IpAcl::parse(acl), Err(expected));
    }

    #[test]
    fn entries_tolerate_spaces() {
        let acl: IpAcl = " -0.0.0.0/0 , +127.0.0.1 ".parse().expect("valid acl");
        assert!(acl.allows(ip("127.0.0.1")));
        assert!(!acl.allows(ip("127.0.0.2")));
    }
}
