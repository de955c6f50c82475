//! Per-packet UDP multicast rewriting between a fixed input (S,G) and a
//! fixed output (S,G), across all four address-family combinations.
//!
//! The rewrite never recomputes a covered checksum from scratch where an
//! incremental patch suffices: the address delta is folded into the existing
//! IP and UDP checksums. Only the IPv4 header synthesized for a v6→v4
//! translation gets a fresh checksum, because the input had none.

use crate::checksum::{self, AddressRewrite};
use std::net::IpAddr;

const UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

fn packed(src: IpAddr, grp: IpAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32);

    match src {
        IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
    }
    match grp {
        IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
    }

    bytes
}

#[derive(Debug, thiserror::Error)]
pub enum TranslatorError {
    #[error("input source {0} and group {1} must be of the same address family")]
    InputFamilyMismatch(IpAddr, IpAddr),
    #[error("output source {0} and group {1} must be of the same address family")]
    OutputFamilyMismatch(IpAddr, IpAddr),
}

/// Stateless rewriter for one (input SG, output SG) pair.
pub struct Translator {
    in_family: Family,
    out_family: Family,
    out_addrs: Vec<u8>,
    rewrite: AddressRewrite,
}

impl Translator {
    pub fn new(
        in_src: IpAddr,
        in_grp: IpAddr,
        out_src: IpAddr,
        out_grp: IpAddr,
    ) -> Result<Self, TranslatorError> {
        if Family::of(in_src) != Family::of(in_grp) {
            return Err(TranslatorError::InputFamilyMismatch(in_src, in_grp));
        }
        if Family::of(out_src) != Family::of(out_grp) {
            return Err(TranslatorError::OutputFamilyMismatch(out_src, out_grp));
        }

        let in_addrs = packed(in_src, in_grp);
        let out_addrs = packed(out_src, out_grp);

        Ok(Self {
            in_family: Family::of(in_src),
            out_family: Family::of(out_src),
            rewrite: AddressRewrite::new(&in_addrs, &out_addrs),
            out_addrs,
        })
    }

    /// Rewrites one packet, starting at the IP header.
    ///
    /// Returns [`None`] for anything that is not a well-formed, unfragmented
    /// UDP datagram of the configured input family.
    pub fn translate(&self, pkt: &[u8]) -> Option<Vec<u8>> {
        match (self.in_family, self.out_family) {
            (Family::V4, Family::V4) => self.translate_4_to_4(pkt),
            (Family::V6, Family::V6) => self.translate_6_to_6(pkt),
            (Family::V4, Family::V6) => self.translate_4_to_6(pkt),
            (Family::V6, Family::V4) => self.translate_6_to_4(pkt),
        }
    }

    fn translate_4_to_4(&self, pkt: &[u8]) -> Option<Vec<u8>> {
        let hdr = parse_v4(pkt)?;
        let udp_off = hdr.header_len;

        let out_ip_ck = self.rewrite.patch(read_field(pkt, 10));
        let out_udp_ck = self.patch_udp(read_field(pkt, udp_off + 6));

        let mut out = Vec::with_capacity(pkt.len());
        out.extend_from_slice(&pkt[..10]);
        push_field(&mut out, out_ip_ck);
        out.extend_from_slice(&self.out_addrs);
        out.extend_from_slice(&pkt[20..udp_off + 6]);
        push_field(&mut out, out_udp_ck);
        out.extend_from_slice(&pkt[udp_off + 8..]);

        Some(out)
    }

    fn translate_6_to_6(&self, pkt: &[u8]) -> Option<Vec<u8>> {
        let hdr = parse_v6(pkt)?;
        let udp_off = hdr.udp_offset;

        let out_udp_ck = self.patch_udp(read_field(pkt, udp_off + 6));

        let mut out = Vec::with_capacity(pkt.len());
        out.extend_from_slice(&pkt[..8]);
        out.extend_from_slice(&self.out_addrs);
        out.extend_from_slice(&pkt[40..udp_off + 6]);
        push_field(&mut out, out_udp_ck);
        out.extend_from_slice(&pkt[udp_off + 8..]);

        Some(out)
    }

    fn translate_4_to_6(&self, pkt: &[u8]) -> Option<Vec<u8>> {
        let hdr = parse_v4(pkt)?;
        let udp_off = hdr.header_len;

        let out_udp_ck = self.patch_udp(read_field(pkt, udp_off + 6));
        let payload_len = hdr.total_len - hdr.header_len;

        let mut out = Vec::with_capacity(40 + pkt.len() - udp_off);
        out.push(0x60 | (hdr.tos >> 4));
        out.push((hdr.tos & 0x0f) << 4); // low TC nibble, flow label stays 0
        out.push(0);
        out.push(0);
        out.push((payload_len >> 8) as u8);
        out.push(payload_len as u8);
        out.push(UDP);
        out.push(hdr.ttl);
        out.extend_from_slice(&self.out_addrs);
        out.extend_from_slice(&pkt[udp_off..udp_off + 6]);
        push_field(&mut out, out_udp_ck);
        out.extend_from_slice(&pkt[udp_off + 8..]);

        Some(out)
    }

    fn translate_6_to_4(&self, pkt: &[u8]) -> Option<Vec<u8>> {
        let hdr = parse_v6(pkt)?;
        let udp_off = hdr.udp_offset;

        let in_udp_ck = read_field(pkt, udp_off + 6);
        if in_udp_ck == 0 {
            // UDP over IPv6 requires a checksum; without one we have nothing
            // to patch and the v4 output could not carry a valid non-zero
            // checksum either.
            return None;
        }
        let out_udp_ck = match self.rewrite.patch(in_udp_ck) {
            0 => 0xffff,
            ck => ck,
        };

        let udp_len = hdr.payload_end - udp_off;
        let total_len = 20 + udp_len;
        if total_len > usize::from(u16::MAX) {
            return None;
        }
        let ident: u16 = rand::random();

        let front = [
            0x45,
            hdr.traffic_class,
            (total_len >> 8) as u8,
            total_len as u8,
            (ident >> 8) as u8,
            ident as u8,
            0,
            0,
            hdr.hop_limit,
            UDP,
        ];
        let ip_ck = checksum::invert(checksum::carry_add(
            checksum::ones_sum(&front),
            checksum::ones_sum(&self.out_addrs),
        ));

        let mut out = Vec::with_capacity(20 + pkt.len() - udp_off);
        out.extend_from_slice(&front);
        push_field(&mut out, ip_ck);
        out.extend_from_slice(&self.out_addrs);
        out.extend_from_slice(&pkt[udp_off..udp_off + 6]);
        push_field(&mut out, out_udp_ck);
        out.extend_from_slice(&pkt[udp_off + 8..]);

        Some(out)
    }

    /// A UDP checksum of zero means "unchecked" and stays zero; a patched
    /// checksum that lands on zero is stored as 0xffff.
    fn patch_udp(&self, in_ck: u16) -> u16 {
        if in_ck == 0 {
            return 0;
        }

        match self.rewrite.patch(in_ck) {
            0 => 0xffff,
            ck => ck,
        }
    }
}

struct V4Header {
    header_len: usize,
    tos: u8,
    total_len: usize,
    ttl: u8,
}

fn parse_v4(pkt: &[u8]) -> Option<V4Header> {
    if pkt.len() < 28 {
        return None;
    }

    let header_len = usize::from(pkt[0] & 0x0f) * 4;
    if header_len < 20 || header_len + 8 > pkt.len() {
        return None;
    }

    let total_len = usize::from(u16::from_be_bytes([pkt[2], pkt[3]]));
    if total_len > pkt.len() || total_len < header_len + 8 {
        return None;
    }

    if pkt[9] != UDP {
        return None;
    }

    let more_fragments = pkt[6] & 0x20 != 0;
    let fragment_offset = u16::from_be_bytes([pkt[6] & 0x1f, pkt[7]]);
    if more_fragments || fragment_offset != 0 {
        return None;
    }

    Some(V4Header {
        header_len,
        tos: pkt[1],
        total_len,
        ttl: pkt[8],
    })
}

struct V6Header {
    traffic_class: u8,
    hop_limit: u8,
    /// End of the IPv6 payload: 40 + Payload Length.
    payload_end: usize,
    /// Start of the UDP header, past any walked extension headers.
    udp_offset: usize,
}

const HOP_BY_HOP: u8 = 0;
const ROUTING: u8 = 43;
const DEST_OPTS: u8 = 60;

fn parse_v6(pkt: &[u8]) -> Option<V6Header> {
    if pkt.len() < 48 {
        return None;
    }

    let payload_len = usize::from(u16::from_be_bytes([pkt[4], pkt[5]]));
    if payload_len > pkt.len() - 40 {
        return None;
    }
    let payload_end = 40 + payload_len;

    // Walk the extension chain until we hit UDP. Fragment headers (44) and
    // anything we don't know fall through to the drop arm.
    let mut next_header = pkt[6];
    let mut offset = 40;
    loop {
        match next_header {
            UDP => break,
            HOP_BY_HOP | ROUTING | DEST_OPTS => {
                if offset + 8 > payload_end {
                    return None;
                }
                next_header = pkt[offset];
                offset += (usize::from(pkt[offset + 1]) + 1) * 8;
                if offset > payload_end {
                    return None;
                }
            }
            _ => return None,
        }
    }

    if offset + 8 > payload_end {
        return None;
    }

    Some(V6Header {
        traffic_class: (pkt[0] << 4) | (pkt[1] >> 4),
        hop_limit: pkt[7],
        payload_end,
        udp_offset: offset,
    })
}

/// Checksum fields are read low-byte first, the same word order
/// [`checksum::ones_sum`] uses.
fn read_field(pkt: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([pkt[offset], pkt[offset + 1]])
}

fn push_field(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, PacketBuilder, UdpHeaderSlice};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn translator(in_sg: (&str, &str), out_sg: (&str, &str)) -> Translator {
        Translator::new(
            in_sg.0.parse().unwrap(),
            in_sg.1.parse().unwrap(),
            out_sg.0.parse().unwrap(),
            out_sg.1.parse().unwrap(),
        )
        .unwrap()
    }

    fn v4_udp_packet(src: [u8; 4], dst: [u8; 4], ttl: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketBuilder::ipv4(src, dst, ttl)
            .udp(5000, 1234)
            .write(&mut buf, payload)
            .unwrap();

        buf
    }

    fn v6_udp_packet(src: [u8; 16], dst: [u8; 16], hop_limit: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        PacketBuilder::ipv6(src, dst, hop_limit)
            .udp(5000, 1234)
            .write(&mut buf, payload)
            .unwrap();

        buf
    }

    #[test]
    fn rewrites_4_to_4() {
        // Hand-written vector: 20-byte header, UDP checksum zero.
        let mut input = vec![
            0x45, 0x00, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 192, 168, 1,
            2, 232, 1, 1, 1, // IP
            0x12, 0x34, 0x56, 0x78, 0x00, 0x0c, 0x00, 0x00, // UDP
            0xde, 0xad, 0xbe, 0xef, // payload
        ];
        let ip_ck = checksum::invert(checksum::ones_sum(&input[..20]));
        input[10] = ip_ck as u8;
        input[11] = (ip_ck >> 8) as u8;

        let translator = translator(("192.168.1.2", "232.1.1.1"), ("10.0.0.2", "239.1.1.1"));

        let out = translator.translate(&input).unwrap();

        let ip = Ipv4HeaderSlice::from_slice(&out).unwrap();
        assert_eq!(ip.source_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ip.destination_addr(), Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(ip.ttl(), 0x40);
        assert_eq!(ip.header_checksum(), ip.to_header().calc_header_checksum());

        // Zero (unchecked) UDP checksum must stay zero.
        let udp = UdpHeaderSlice::from_slice(&out[20..]).unwrap();
        assert_eq!(udp.checksum(), 0);
        assert_eq!(&out[28..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn patched_udp_checksum_verifies_4_to_4() {
        let input = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"hello multicast");
        let translator = translator(("192.168.1.2", "232.1.1.1"), ("10.0.0.2", "239.1.1.1"));

        let out = translator.translate(&input).unwrap();

        let ip = Ipv4HeaderSlice::from_slice(&out).unwrap();
        let udp = UdpHeaderSlice::from_slice(&out[20..]).unwrap();
        let expected = udp
            .to_header()
            .calc_checksum_ipv4(&ip.to_header(), &out[28..])
            .unwrap();
        assert_eq!(udp.checksum(), expected);
    }

    #[test]
    fn rewrites_4_to_6() {
        let input = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"payload");
        let translator = translator(
            ("192.168.1.2", "232.1.1.1"),
            ("2001:db8::2", "ff3e::8000:1"),
        );

        let out = translator.translate(&input).unwrap();

        let ip = Ipv6HeaderSlice::from_slice(&out).unwrap();
        assert_eq!(out[0] >> 4, 6);
        assert_eq!(ip.traffic_class(), 0);
        assert_eq!(ip.flow_label().value(), 0);
        assert_eq!(ip.hop_limit(), 64);
        assert_eq!(ip.next_header(), etherparse::IpNumber::UDP);
        assert_eq!(usize::from(ip.payload_length()), input.len() - 20);
        assert_eq!(ip.source_addr(), "2001:db8::2".parse::<Ipv6Addr>().unwrap());

        let udp = UdpHeaderSlice::from_slice(&out[40..]).unwrap();
        let expected = udp
            .to_header()
            .calc_checksum_ipv6(&ip.to_header(), &out[48..])
            .unwrap();
        assert_eq!(udp.checksum(), expected);
    }

    #[test]
    fn rewrites_6_to_6() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();
        let input = v6_udp_packet(src.octets(), grp.octets(), 17, b"data");

        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("2001:db8::aa", "ff38::1:2"),
        );

        let out = translator.translate(&input).unwrap();

        let ip = Ipv6HeaderSlice::from_slice(&out).unwrap();
        assert_eq!(ip.hop_limit(), 17);
        assert_eq!(ip.destination_addr(), "ff38::1:2".parse::<Ipv6Addr>().unwrap());

        let udp = UdpHeaderSlice::from_slice(&out[40..]).unwrap();
        let expected = udp
            .to_header()
            .calc_checksum_ipv6(&ip.to_header(), &out[48..])
            .unwrap();
        assert_eq!(udp.checksum(), expected);
    }

    #[test]
    fn rewrites_6_to_4() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();
        let input = v6_udp_packet(src.octets(), grp.octets(), 42, b"going local");

        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("10.9.1.2", "239.1.1.1"),
        );

        let out = translator.translate(&input).unwrap();

        let ip = Ipv4HeaderSlice::from_slice(&out).unwrap();
        let header = ip.to_header();
        assert_eq!(header.header_len(), 20);
        assert_eq!(header.time_to_live, 42);
        assert_eq!(header.protocol, etherparse::IpNumber::UDP);
        assert_eq!(usize::from(header.total_len), out.len());
        assert!(!header.more_fragments);
        assert_eq!(header.fragment_offset, etherparse::IpFragOffset::ZERO);
        assert_eq!(ip.header_checksum(), header.calc_header_checksum());

        let udp = UdpHeaderSlice::from_slice(&out[20..]).unwrap();
        assert_ne!(udp.checksum(), 0);
        let expected = udp
            .to_header()
            .calc_checksum_ipv4(&ip.to_header(), &out[28..])
            .unwrap();
        assert_eq!(udp.checksum(), expected);
    }

    #[test]
    fn identity_rewrite_4_to_4_is_byte_equal() {
        let input = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"unchanged");
        let translator = translator(
            ("192.168.1.2", "232.1.1.1"),
            ("192.168.1.2", "232.1.1.1"),
        );

        assert_eq!(translator.translate(&input).unwrap(), input);
    }

    #[test]
    fn identity_rewrite_6_to_6_is_byte_equal() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();
        let input = v6_udp_packet(src.octets(), grp.octets(), 64, b"unchanged");
        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("2001:db8::1", "ff3e::8000:1"),
        );

        assert_eq!(translator.translate(&input).unwrap(), input);
    }

    #[test]
    fn drops_v4_fragments() {
        let mut input = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"frag");
        input[6] |= 0x20; // MF

        let translator = translator(("192.168.1.2", "232.1.1.1"), ("10.0.0.2", "239.1.1.1"));

        assert_eq!(translator.translate(&input), None);

        let mut offset_frag = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"frag");
        offset_frag[7] = 0x08;

        assert_eq!(translator.translate(&offset_frag), None);
    }

    #[test]
    fn drops_non_udp() {
        let mut input = v4_udp_packet([192, 168, 1, 2], [232, 1, 1, 1], 64, b"not udp");
        input[9] = 6; // TCP

        let translator = translator(("192.168.1.2", "232.1.1.1"), ("10.0.0.2", "239.1.1.1"));

        assert_eq!(translator.translate(&input), None);
    }

    #[test]
    fn drops_truncated_packets() {
        let translator = translator(("192.168.1.2", "232.1.1.1"), ("10.0.0.2", "239.1.1.1"));

        assert_eq!(translator.translate(&[0x45; 27]), None);
    }

    #[test]
    fn walks_v6_extension_headers() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();

        // Build a plain v6 UDP packet, then splice a hop-by-hop header in
        // front of the UDP header.
        let plain = v6_udp_packet(src.octets(), grp.octets(), 64, b"ext");
        let mut input = Vec::new();
        input.extend_from_slice(&plain[..40]);
        input.extend_from_slice(&[UDP, 0, 0, 0, 0, 0, 0, 0]); // hop-by-hop, 8 bytes
        input.extend_from_slice(&plain[40..]);
        input[6] = HOP_BY_HOP;
        let payload_len = (input.len() - 40) as u16;
        input[4..6].copy_from_slice(&payload_len.to_be_bytes());

        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("2001:db8::aa", "ff38::1:2"),
        );

        let out = translator.translate(&input).unwrap();

        // Extension chain is preserved, addresses swapped.
        assert_eq!(out[6], HOP_BY_HOP);
        assert_eq!(out[40], UDP);
        assert_eq!(
            Ipv6HeaderSlice::from_slice(&out).unwrap().destination_addr(),
            "ff38::1:2".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(&out[out.len() - 3..], b"ext");
    }

    #[test]
    fn drops_v6_fragment_header() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();

        let plain = v6_udp_packet(src.octets(), grp.octets(), 64, b"frag");
        let mut input = Vec::new();
        input.extend_from_slice(&plain[..40]);
        input.extend_from_slice(&[UDP, 0, 0, 0, 0, 0, 0, 0]);
        input.extend_from_slice(&plain[40..]);
        input[6] = 44; // fragment header
        let payload_len = (input.len() - 40) as u16;
        input[4..6].copy_from_slice(&payload_len.to_be_bytes());

        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("2001:db8::aa", "ff38::1:2"),
        );

        assert_eq!(translator.translate(&input), None);
    }

    #[test]
    fn drops_6_to_4_without_udp_checksum() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let grp: Ipv6Addr = "ff3e::8000:1".parse().unwrap();
        let mut input = v6_udp_packet(src.octets(), grp.octets(), 42, b"no ck");
        input[46] = 0;
        input[47] = 0;

        let translator = translator(
            ("2001:db8::1", "ff3e::8000:1"),
            ("10.9.1.2", "239.1.1.1"),
        );

        assert_eq!(translator.translate(&input), None);
    }

    #[test]
    fn rejects_mixed_family_configuration() {
        let result = Translator::new(
            "192.168.1.2".parse().unwrap(),
            "ff3e::8000:1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "239.1.1.1".parse().unwrap(),
        );

        assert!(matches!(
            result,
            Err(TranslatorError::InputFamilyMismatch(_, _))
        ));
    }
}
