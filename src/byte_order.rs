//! Helpers for explicit network byte-order conversions.
//!
//! The DNS, MQTT, CoAP and WebSocket codecs all carry big-endian integers on
//! the wire. These helpers keep Clippy expectations scoped to the conversion
//! points and give the parsers bounds-checked accessors into raw packets.

/// Serialise a `u16` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use netmux::byte_order::write_network_u16;
///
/// assert_eq!(write_network_u16(0x1234), [0x12, 0x34]);
/// ```
#[must_use]
pub fn write_network_u16(value: u16) -> [u8; 2] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u16` from its on-wire representation.
///
/// # Examples
///
/// ```
/// use netmux::byte_order::read_network_u16;
///
/// assert_eq!(read_network_u16([0x12, 0x34]), 0x1234);
/// ```
#[must_use]
pub fn read_network_u16(bytes: [u8; 2]) -> u16 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u16::from_be_bytes(bytes)
}

/// Serialise a `u32` in network byte order (big-endian).
#[must_use]
pub fn write_network_u32(value: u32) -> [u8; 4] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u32` from its on-wire representation.
#[must_use]
pub fn read_network_u32(bytes: [u8; 4]) -> u32 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u32::from_be_bytes(bytes)
}

/// Serialise a `u64` in network byte order (big-endian).
#[must_use]
pub fn write_network_u64(value: u64) -> [u8; 8] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u64` from its on-wire representation.
#[must_use]
pub fn read_network_u64(bytes: [u8; 8]) -> u64 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u64::from_be_bytes(bytes)
}

/// Read a network-order `u16` at `offset`, or `None` if `buf` is too short.
///
/// # Examples
///
/// ```
/// use netmux::byte_order::u16_at;
///
/// assert_eq!(u16_at(&[0xff, 0x12, 0x34], 1), Some(0x1234));
/// assert_eq!(u16_at(&[0x12], 0), None);
/// ```
#[must_use]
pub fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let bytes = buf.get(offset..end)?;
    <[u8; 2]>::try_from(bytes).ok().map(read_network_u16)
}

/// Read a network-order `u32` at `offset`, or `None` if `buf` is too short.
#[must_use]
pub fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes = buf.get(offset..end)?;
    <[u8; 4]>::try_from(bytes).ok().map(read_network_u32)
}

/// Read a network-order `u64` at `offset`, or `None` if `buf` is too short.
#[must_use]
pub fn u64_at(buf: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    let bytes = buf.get(offset..end)?;
    <[u8; 8]>::try_from(bytes).ok().map(read_network_u64)
}

#[cfg(test)]
mod tests {
    //! Round-trip tests for network byte-order conversion helpers.

    use rstest::rstest;

    use super::{
        read_network_u16,
        read_network_u32,
        read_network_u64,
        u16_at,
        u32_at,
        u64_at,
        write_network_u16,
        write_network_u32,
        write_network_u64,
    };

    /// Verify that each network-order write/read pair round-trips correctly.
    #[rstest]
    #[case::u16(
        0x1234u64,
        &write_network_u16(0x1234)[..],
        &[0x12, 0x34],
        u64::from(read_network_u16([0x12, 0x34]))
    )]
    #[case::u32(
        0x1234_5678u64,
        &write_network_u32(0x1234_5678)[..],
        &[0x12, 0x34, 0x56, 0x78],
        u64::from(read_network_u32([0x12, 0x34, 0x56, 0x78]))
    )]
    #[case::u64(
        0x1122_3344_5566_7788u64,
        &write_network_u64(0x1122_3344_5566_7788)[..],
        &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
        read_network_u64([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
    )]
    fn network_byte_order_round_trip(
        #[case] value: u64,
        #[case] written: &[u8],
        #[case] expected_bytes: &[u8],
        #[case] read_back: u64,
    ) {
        assert_eq!(written, expected_bytes);
        assert_eq!(read_back, value);
    }

    #[rstest]
    #[case::in_bounds(&[0, 0, 0xab, 0xcd], 2, Some(0xabcd))]
    #[case::truncated(&[0, 0, 0xab], 2, None)]
    #[case::overflowing_offset(&[0, 0], usize::MAX, None)]
    fn offset_reads_are_bounds_checked(
        #[case] buf: &[u8],
        #[case] offset: usize,
        #[case] expected: Option<u16>,
    ) {
        assert_eq!(u16_at(buf, offset), expected);
    }

    #[test]
    fn wide_offset_reads() {
        let buf = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(u32_at(&buf, 1), Some(0x0203_0405));
        assert_eq!(u64_at(&buf, 1), Some(0x0203_0405_0607_0809));
        assert_eq!(u64_at(&buf, 2), None);
    }
}
