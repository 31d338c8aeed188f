//! IPv4 packet helpers
//!
//! Field accessors, checksum and ICMP echo-reply synthesis over raw packet
//! buffers read from the TUN device. Every accessor bounds-checks: a buffer
//! too short for the field yields `None` (or `false` for mutators) and is
//! left untouched.

use std::net::Ipv4Addr;

/// Smallest legal IPv4 header
pub const MIN_HEADER_LEN: usize = 20;

const PROTO_ICMP: u8 = 0x01;
const SRC_OFFSET: usize = 12;
const DST_OFFSET: usize = 16;
const CHECKSUM_OFFSET: usize = 10;

/// IP version (upper nibble of byte 0)
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// Header length in bytes (IHL × 4)
pub fn header_len(packet: &[u8]) -> Option<usize> {
    packet.first().map(|b| ((b & 0x0F) as usize) << 2)
}

fn addr_at(packet: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let bytes = packet.get(offset..offset + 4)?;
    Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn write_addr_at(packet: &mut [u8], offset: usize, addr: Ipv4Addr) -> bool {
    match packet.get_mut(offset..offset + 4) {
        Some(slot) => {
            slot.copy_from_slice(&addr.octets());
            true
        }
        None => false,
    }
}

/// Source address (bytes 12-15)
pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < MIN_HEADER_LEN {
        return None;
    }
    addr_at(packet, SRC_OFFSET)
}

/// Destination address (bytes 16-19)
pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < MIN_HEADER_LEN {
        return None;
    }
    addr_at(packet, DST_OFFSET)
}

pub fn set_source(packet: &mut [u8], addr: Ipv4Addr) -> bool {
    packet.len() >= MIN_HEADER_LEN && write_addr_at(packet, SRC_OFFSET, addr)
}

pub fn set_destination(packet: &mut [u8], addr: Ipv4Addr) -> bool {
    packet.len() >= MIN_HEADER_LEN && write_addr_at(packet, DST_OFFSET, addr)
}

/// Exchange source and destination in place
pub fn swap_source_destination(packet: &mut [u8]) -> bool {
    if packet.len() < MIN_HEADER_LEN {
        return false;
    }
    let (head, tail) = packet.split_at_mut(DST_OFFSET);
    head[SRC_OFFSET..DST_OFFSET].swap_with_slice(&mut tail[..4]);
    true
}

/// IPv4 packet carrying ICMP
pub fn is_icmp(packet: &[u8]) -> bool {
    packet.len() >= MIN_HEADER_LEN && ip_version(packet) == Some(4) && packet[9] == PROTO_ICMP
}

/// One's-complement checksum over the IP header.
///
/// Zeroes the header checksum field (bytes 10-11) *before* summing, then sums
/// the little-endian 16-bit words from `offset` up to the header length,
/// folds carries and returns the complement. The caller writes the result
/// back wherever it belongs. Returns `None` if the header is shorter than 20
/// bytes or runs past the end of the buffer.
pub fn ip_checksum(packet: &mut [u8], offset: usize) -> Option<u16> {
    let len = header_len(packet)?;
    if len < MIN_HEADER_LEN || len > packet.len() {
        return None;
    }

    packet[CHECKSUM_OFFSET] = 0;
    packet[CHECKSUM_OFFSET + 1] = 0;

    let mut sum: u64 = 0;
    let mut i = offset;
    while i + 1 < len {
        sum += u16::from_le_bytes([packet[i], packet[i + 1]]) as u64;
        i += 2;
    }
    // Odd trailing byte, only reachable with an odd offset
    if i < len {
        sum += packet[i] as u64;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    Some(!(sum as u16))
}

/// Rewrite an ICMP packet in place into an echo reply.
///
/// Sets the ICMP type to 0, zeroes the ICMP checksum and stores the result
/// of [`ip_checksum`] computed from the ICMP offset, little-endian, in the
/// ICMP checksum bytes. Peers already rely on exactly this encoding, so it
/// is not a textbook ICMP checksum. Non-ICMP packets are left unchanged.
pub fn make_icmp_response(packet: &mut [u8]) -> bool {
    if !is_icmp(packet) {
        return false;
    }
    let offset = match header_len(packet) {
        Some(ihl) if ihl >= MIN_HEADER_LEN && ihl + 4 <= packet.len() => ihl,
        _ => return false,
    };

    packet[offset] = 0x00;
    packet[offset + 2] = 0;
    packet[offset + 3] = 0;

    let checksum = match ip_checksum(packet, offset) {
        Some(c) => c,
        None => return false,
    };
    packet[offset + 2..offset + 4].copy_from_slice(&checksum.to_le_bytes());
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal IPv4 packet of `total` bytes
    pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total: usize) -> Vec<u8> {
        let len = total.max(MIN_HEADER_LEN);
        let mut pkt = vec![0u8; len];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = protocol;
        pkt[12..16].copy_from_slice(&src.octets());
        pkt[16..20].copy_from_slice(&dst.octets());
        for (i, b) in pkt.iter_mut().enumerate().skip(MIN_HEADER_LEN) {
            *b = i as u8;
        }
        pkt
    }

    fn echo_request() -> Vec<u8> {
        let mut pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 1, 28);
        pkt[20] = 8; // echo request
        pkt[21] = 0;
        pkt[22] = 0xF7;
        pkt[23] = 0xFF;
        pkt
    }

    #[test]
    fn test_field_accessors() {
        let pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 6, 60);
        assert_eq!(ip_version(&pkt), Some(4));
        assert_eq!(header_len(&pkt), Some(20));
        assert_eq!(source(&pkt), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(destination(&pkt), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!is_icmp(&pkt));
    }

    #[test]
    fn test_short_packets_fail_closed() {
        let mut short = vec![0x45u8; 12];
        assert_eq!(source(&short), None);
        assert_eq!(destination(&short), None);
        assert!(!set_source(&mut short, Ipv4Addr::LOCALHOST));
        assert!(!swap_source_destination(&mut short));
        assert_eq!(ip_checksum(&mut short, 0), None);
        assert!(!make_icmp_response(&mut short));
        assert_eq!(short, vec![0x45u8; 12]);

        assert_eq!(ip_version(&[]), None);
    }

    #[test]
    fn test_header_length_past_buffer() {
        // IHL of 15 words claims a 60-byte header in a 24-byte buffer
        let mut pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 1, 24);
        pkt[0] = 0x4F;
        assert_eq!(ip_checksum(&mut pkt, 0), None);
        assert!(!make_icmp_response(&mut pkt));
    }

    #[test]
    fn test_set_addresses() {
        let mut pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 17, 40);
        assert!(set_source(&mut pkt, Ipv4Addr::new(192, 168, 1, 1)));
        assert!(set_destination(&mut pkt, Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(source(&pkt), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(destination(&pkt), Some(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_swap_is_its_own_inverse() {
        let original = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 6, 60);
        let mut pkt = original.clone();

        assert!(swap_source_destination(&mut pkt));
        assert_eq!(source(&pkt), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(destination(&pkt), Some(Ipv4Addr::new(10, 0, 0, 2)));

        assert!(swap_source_destination(&mut pkt));
        assert_eq!(&pkt[12..20], &original[12..20]);
        assert_eq!(pkt, original);
    }

    #[test]
    fn test_checksum_self_verifies() {
        let mut pkt = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 6, 60);
        pkt[4] = 0x1c;
        pkt[5] = 0x46;
        pkt[6] = 0x40;

        let checksum = ip_checksum(&mut pkt, 0).unwrap();
        pkt[10..12].copy_from_slice(&checksum.to_le_bytes());

        // Sum over the now-correct header, checksum field included
        let mut sum: u32 = 0;
        for chunk in pkt[..20].chunks(2) {
            sum += u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);

        // Recomputing clears the field again and lands on the same value
        assert_eq!(ip_checksum(&mut pkt, 0), Some(checksum));
        assert_eq!(&pkt[10..12], &[0, 0]);
    }

    #[test]
    fn test_checksum_zeroes_field_first() {
        let mut a = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 6, 20);
        let mut b = a.clone();
        b[10] = 0xAB;
        b[11] = 0xCD;
        assert_eq!(ip_checksum(&mut a, 0), ip_checksum(&mut b, 0));
    }

    #[test]
    fn test_icmp_response_leaves_other_packets_alone() {
        let original = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 5), 17, 48);
        let mut pkt = original.clone();
        assert!(!make_icmp_response(&mut pkt));
        assert_eq!(pkt, original);

        // IPv6 with a byte 9 of 1 is not ICMPv4
        let mut v6 = original.clone();
        v6[0] = 0x60;
        v6[9] = 1;
        let before = v6.clone();
        assert!(!make_icmp_response(&mut v6));
        assert_eq!(v6, before);
    }

    #[test]
    fn test_icmp_echo_response() {
        let original = echo_request();
        let mut pkt = original.clone();
        assert!(is_icmp(&pkt));

        assert!(make_icmp_response(&mut pkt));
        assert_eq!(pkt[20], 0);
        assert_ne!(&pkt[22..24], &original[22..24]);
        // IP header checksum field is zeroed as a side effect
        assert_eq!(&pkt[10..12], &[0, 0]);
        // Everything past the ICMP checksum is untouched
        assert_eq!(&pkt[24..], &original[24..]);
    }

    #[test]
    fn test_icmp_response_quirk_value() {
        // The stored value is ip_checksum() over the ICMP region, written little-endian
        let mut pkt = echo_request();
        assert!(make_icmp_response(&mut pkt));
        let stored = u16::from_le_bytes([pkt[22], pkt[23]]);

        let mut expected = echo_request();
        expected[20] = 0;
        expected[22] = 0;
        expected[23] = 0;
        let value = ip_checksum(&mut expected, 20).unwrap();
        assert_eq!(stored, value);
        // With a 20-byte header the summed region is empty
        assert_eq!(stored, 0xFFFF);
    }
}
