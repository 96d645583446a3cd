// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hand-rolled IPv4 + TCP header encode/decode and checksum. A small
//! from-scratch codec rather than a `pnet`/`pcap` dependency: IPv4 with no
//! options, TCP with no options, is all the test server ever needs to build
//! or parse.

use std::fmt;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;

/// TCP control bits the test server cares about. The wire protocol's
/// `flags: Option<String>` fields use a short string of single-letter codes:
/// `S`yn, `A`ck, `F`in, `R`st, `P`ush, `U`rgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn parse(s: &str) -> Self {
        let mut flags = TcpFlags::default();
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'F' => flags.fin = true,
                'S' => flags.syn = true,
                'R' => flags.rst = true,
                'P' => flags.psh = true,
                'A' => flags.ack = true,
                'U' => flags.urg = true,
                _ => {}
            }
        }
        flags
    }

    pub fn from_bits(bits: u8) -> Self {
        TcpFlags {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
            psh: bits & 0x08 != 0,
            ack: bits & 0x10 != 0,
            urg: bits & 0x20 != 0,
        }
    }

    pub fn to_bits(self) -> u8 {
        let mut bits = 0u8;
        if self.fin {
            bits |= 0x01;
        }
        if self.syn {
            bits |= 0x02;
        }
        if self.rst {
            bits |= 0x04;
        }
        if self.psh {
            bits |= 0x08;
        }
        if self.ack {
            bits |= 0x10;
        }
        if self.urg {
            bits |= 0x20;
        }
        bits
    }

    /// True iff every flag set in `required` is also set here — the
    /// "missing flags" check the sniffer's receive filter applies.
    pub fn contains(self, required: TcpFlags) -> bool {
        (!required.fin || self.fin)
            && (!required.syn || self.syn)
            && (!required.rst || self.rst)
            && (!required.psh || self.psh)
            && (!required.ack || self.ack)
            && (!required.urg || self.urg)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // canonical bit order, matching scapy's FSRPAU sprintf convention
        for (set, letter) in [
            (self.fin, 'F'),
            (self.syn, 'S'),
            (self.rst, 'R'),
            (self.psh, 'P'),
            (self.ack, 'A'),
            (self.urg, 'U'),
        ] {
            if set {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Payload length plus one per SYN/FIN flag: these flags consume one
    /// byte of sequence space even though they carry no payload.
    pub fn logical_length(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.syn {
            len += 1;
        }
        if self.flags.fin {
            len += 1;
        }
        len
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IPV4_HEADER_LEN + TCP_HEADER_LEN + self.payload.len());

        let total_len = (IPV4_HEADER_LEN + TCP_HEADER_LEN + self.payload.len()) as u16;
        buf.push(0x45); // version 4, IHL 5 (no options)
        buf.push(0x00); // DSCP/ECN
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // identification
        buf.extend_from_slice(&0x4000u16.to_be_bytes()); // flags: don't fragment
        buf.push(64); // ttl
        buf.push(6); // protocol: TCP
        buf.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        buf.extend_from_slice(&self.src_ip.octets());
        buf.extend_from_slice(&self.dst_ip.octets());

        let ip_checksum = internet_checksum(&buf[..IPV4_HEADER_LEN]);
        buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

        let tcp_start = buf.len();
        buf.extend_from_slice(&self.sport.to_be_bytes());
        buf.extend_from_slice(&self.dport.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        let data_offset = ((TCP_HEADER_LEN / 4) as u8) << 4;
        buf.push(data_offset);
        buf.push(self.flags.to_bits());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        buf.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
        buf.extend_from_slice(&self.payload);

        let tcp_checksum = tcp_checksum(self.src_ip, self.dst_ip, &buf[tcp_start..]);
        buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

        buf
    }

    pub fn decode(buf: &[u8]) -> Option<TcpSegment> {
        if buf.len() < IPV4_HEADER_LEN {
            return None;
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return None;
        }
        let ihl = (buf[0] & 0x0f) as usize * 4;
        if buf.len() < ihl || buf[9] != 6 {
            return None;
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let src_ip = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let dst_ip = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

        let tcp = &buf[ihl..total_len.min(buf.len())];
        if tcp.len() < TCP_HEADER_LEN {
            return None;
        }
        let sport = u16::from_be_bytes([tcp[0], tcp[1]]);
        let dport = u16::from_be_bytes([tcp[2], tcp[3]]);
        let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
        let ack = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);
        let data_offset = ((tcp[12] >> 4) as usize) * 4;
        let flags = TcpFlags::from_bits(tcp[13]);
        let window = u16::from_be_bytes([tcp[14], tcp[15]]);

        if tcp.len() < data_offset {
            return None;
        }
        let payload = tcp[data_offset..].to_vec();

        Some(TcpSegment {
            src_ip,
            dst_ip,
            sport,
            dport,
            seq,
            ack,
            flags,
            window,
            payload,
        })
    }
}

/// One's-complement sum over 16-bit words, folding carries back in — the
/// shared core of both the IPv4 header checksum and the TCP checksum.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// TCP checksum over the pseudo-header (src/dst IP, zero byte, protocol,
/// TCP length) followed by the TCP segment itself.
fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + tcp_segment.len());
    pseudo.extend_from_slice(&src_ip.octets());
    pseudo.extend_from_slice(&dst_ip.octets());
    pseudo.push(0);
    pseudo.push(6); // protocol: TCP
    pseudo.extend_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(tcp_segment);
    internet_checksum(&pseudo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_through_string_and_bits() {
        let flags = TcpFlags::parse("SA");
        assert!(flags.syn && flags.ack && !flags.fin && !flags.rst);
        assert_eq!(flags.to_string(), "SA");
        assert_eq!(TcpFlags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn contains_checks_every_required_bit() {
        let syn_ack = TcpFlags::parse("SA");
        assert!(syn_ack.contains(TcpFlags::parse("S")));
        assert!(syn_ack.contains(TcpFlags::parse("A")));
        assert!(syn_ack.contains(TcpFlags::parse("SA")));
        assert!(!syn_ack.contains(TcpFlags::parse("F")));
    }

    #[test]
    fn logical_length_adds_one_per_syn_or_fin() {
        let mut seg = TcpSegment {
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            sport: 1000,
            dport: 2000,
            seq: 0,
            ack: 0,
            flags: TcpFlags::parse("A"),
            window: 0,
            payload: b"x".repeat(100),
        };
        assert_eq!(seg.logical_length(), 100);

        seg.flags = TcpFlags::parse("SA");
        assert_eq!(seg.logical_length(), 101);

        seg.flags = TcpFlags::parse("FA");
        assert_eq!(seg.logical_length(), 101);

        seg.payload.clear();
        seg.flags = TcpFlags::parse("S");
        assert_eq!(seg.logical_length(), 1);
    }

    #[test]
    fn encode_then_decode_recovers_fields() {
        let original = TcpSegment {
            src_ip: Ipv4Addr::new(192, 168, 1, 10),
            dst_ip: Ipv4Addr::new(192, 168, 1, 20),
            sport: 6000,
            dport: 5000,
            seq: 1234,
            ack: 5678,
            flags: TcpFlags::parse("SA"),
            window: 65535,
            payload: b"x".repeat(300),
        };

        let bytes = original.encode();
        let decoded = TcpSegment::decode(&bytes).expect("decode should succeed");

        assert_eq!(decoded.src_ip, original.src_ip);
        assert_eq!(decoded.dst_ip, original.dst_ip);
        assert_eq!(decoded.sport, original.sport);
        assert_eq!(decoded.dport, original.dport);
        assert_eq!(decoded.seq, original.seq);
        assert_eq!(decoded.ack, original.ack);
        assert_eq!(decoded.flags, original.flags);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn decode_rejects_non_ipv4_or_non_tcp() {
        let mut garbage = vec![0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN];
        garbage[0] = 0x60; // version 6
        assert!(TcpSegment::decode(&garbage).is_none());

        garbage[0] = 0x45;
        garbage[9] = 17; // UDP, not TCP
        assert!(TcpSegment::decode(&garbage).is_none());
    }

    #[test]
    fn internet_checksum_of_known_vector_matches_rfc_example() {
        // RFC 1071 §2.3 worked example.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), 0x220d);
    }
}
