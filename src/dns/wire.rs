//! RFC 1035 message encode/decode: header, question, and the resource
//! record types the resolver actually inspects plus the ones it merely
//! has to skip correctly (SPEC_FULL §4.10).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Resource record type. The full original table is carried even though
/// only `A`/`Aaaa`/`Cname`/`Ns` drive resolution logic, so `RrType` stays
/// exhaustive for every header a response can legally contain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrType {
    A,
    Ns,
    Cname,
    Soa,
    Wks,
    Ptr,
    Hinfo,
    Minfo,
    Mx,
    Txt,
    Aaaa,
    Other(u16),
}

impl RrType {
    pub fn as_u16(self) -> u16 {
        match self {
            RrType::A => 1,
            RrType::Ns => 2,
            RrType::Cname => 5,
            RrType::Soa => 6,
            RrType::Wks => 11,
            RrType::Ptr => 12,
            RrType::Hinfo => 13,
            RrType::Minfo => 14,
            RrType::Mx => 15,
            RrType::Txt => 16,
            RrType::Aaaa => 28,
            RrType::Other(n) => n,
        }
    }

    pub fn from_u16(v: u16) -> RrType {
        match v {
            1 => RrType::A,
            2 => RrType::Ns,
            5 => RrType::Cname,
            6 => RrType::Soa,
            11 => RrType::Wks,
            12 => RrType::Ptr,
            13 => RrType::Hinfo,
            14 => RrType::Minfo,
            15 => RrType::Mx,
            16 => RrType::Txt,
            28 => RrType::Aaaa,
            n => RrType::Other(n),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrClass {
    In,
    Cs,
    Ch,
    Hs,
    Any,
    Other(u16),
}

impl RrClass {
    pub fn as_u16(self) -> u16 {
        match self {
            RrClass::In => 1,
            RrClass::Cs => 2,
            RrClass::Ch => 3,
            RrClass::Hs => 4,
            RrClass::Any => 255,
            RrClass::Other(n) => n,
        }
    }

    pub fn from_u16(v: u16) -> RrClass {
        match v {
            1 => RrClass::In,
            2 => RrClass::Cs,
            3 => RrClass::Ch,
            4 => RrClass::Hs,
            255 => RrClass::Any,
            n => RrClass::Other(n),
        }
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// `hostn_to_dns_format`: `www.apple.com` → `3www5apple3com0`. Labels over
/// 63 bytes or a total name over 255 bytes are rejected rather than
/// silently truncated (spec §8, testable property 7).
pub fn encode_name(name: &str) -> io::Result<Vec<u8>> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.len() > 255 {
        return Err(invalid_input("dns name too long"));
    }
    let mut out = Vec::with_capacity(trimmed.len() + 2);
    for label in trimmed.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > 63 {
            return Err(invalid_input("dns label too long"));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(out)
}

/// Cap on compression-pointer hops while decoding a name, so a malicious
/// or corrupt response cannot loop forever (spec §4.10).
const MAX_POINTER_HOPS: usize = 32;

/// `hostn_to_dot_format`: decodes a label-length-prefixed name starting
/// at `start`, following `0xC0` back-reference pointers. Returns the
/// decoded name and the offset immediately after the name *as it
/// appeared inline* (a pointer short-circuits further reading of the
/// original run, matching RFC 1035 §4.1.4).
pub fn decode_name(buf: &[u8], start: usize) -> io::Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_pos: Option<usize> = None;
    let mut hops = 0usize;

    loop {
        if pos >= buf.len() {
            return Err(invalid_data("truncated dns name"));
        }
        let len = buf[pos];
        if len == 0 {
            pos += 1;
            if end_pos.is_none() {
                end_pos = Some(pos);
            }
            break;
        } else if len & 0xC0 == 0xC0 {
            if pos + 1 >= buf.len() {
                return Err(invalid_data("truncated dns compression pointer"));
            }
            if end_pos.is_none() {
                end_pos = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(invalid_data("dns compression pointer nested too deep"));
            }
            let ptr = (((len & 0x3F) as usize) << 8) | buf[pos + 1] as usize;
            if ptr >= pos {
                return Err(invalid_data("dns compression pointer does not point backward"));
            }
            pos = ptr;
        } else {
            let label_len = len as usize;
            pos += 1;
            if pos + label_len > buf.len() {
                return Err(invalid_data("truncated dns label"));
            }
            labels.push(String::from_utf8_lossy(&buf[pos..pos + label_len]).into_owned());
            pos += label_len;
        }
    }

    Ok((labels.join("."), end_pos.unwrap_or(pos)))
}

#[derive(Copy, Clone, Debug)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        let b1 = ((self.qr as u8) << 7)
            | ((self.opcode & 0x0F) << 3)
            | ((self.aa as u8) << 2)
            | ((self.tc as u8) << 1)
            | (self.rd as u8);
        let b2 = ((self.ra as u8) << 7) | (self.rcode & 0x0F);
        out.push(b1);
        out.push(b2);
        out.extend_from_slice(&self.qdcount.to_be_bytes());
        out.extend_from_slice(&self.ancount.to_be_bytes());
        out.extend_from_slice(&self.nscount.to_be_bytes());
        out.extend_from_slice(&self.arcount.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> io::Result<Header> {
        if buf.len() < 12 {
            return Err(invalid_data("dns header too short"));
        }
        let b1 = buf[2];
        let b2 = buf[3];
        Ok(Header {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            qr: b1 & 0x80 != 0,
            opcode: (b1 >> 3) & 0x0F,
            aa: b1 & 0x04 != 0,
            tc: b1 & 0x02 != 0,
            rd: b1 & 0x01 != 0,
            ra: b2 & 0x80 != 0,
            rcode: b2 & 0x0F,
            qdcount: u16::from_be_bytes([buf[4], buf[5]]),
            ancount: u16::from_be_bytes([buf[6], buf[7]]),
            nscount: u16::from_be_bytes([buf[8], buf[9]]),
            arcount: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

/// A decoded resource record. `ip` is populated for `A`/`Aaaa`; `target`
/// for `Cname`/`Ns` (whose RDATA is itself a compressed name); every
/// other type is skipped structurally (RDLENGTH bookkeeping only),
/// matching the original's generic `dns_rr_parse` before type dispatch.
#[derive(Clone, Debug)]
pub struct Rr {
    pub name: String,
    pub rtype: RrType,
    pub rclass: RrClass,
    pub ttl: u32,
    pub ip: Option<IpAddr>,
    pub target: Option<String>,
}

fn decode_rr(buf: &[u8], pos: usize) -> io::Result<(Rr, usize)> {
    let (name, pos) = decode_name(buf, pos)?;
    if pos + 10 > buf.len() {
        return Err(invalid_data("truncated rr header"));
    }
    let rtype = RrType::from_u16(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
    let rclass = RrClass::from_u16(u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]));
    let ttl = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
    let rdlen = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
    let rdata_start = pos + 10;
    if rdata_start + rdlen > buf.len() {
        return Err(invalid_data("truncated rdata"));
    }

    let (ip, target) = match rtype {
        RrType::A if rdlen == 4 => {
            let d = &buf[rdata_start..rdata_start + 4];
            (Some(IpAddr::V4(Ipv4Addr::new(d[0], d[1], d[2], d[3]))), None)
        }
        RrType::Aaaa if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[rdata_start..rdata_start + 16]);
            (Some(IpAddr::V6(Ipv6Addr::from(octets))), None)
        }
        RrType::Cname | RrType::Ns => {
            let (target_name, _) = decode_name(buf, rdata_start)?;
            (None, Some(target_name))
        }
        _ => (None, None),
    };

    Ok((
        Rr {
            name,
            rtype,
            rclass,
            ttl,
            ip,
            target,
        },
        rdata_start + rdlen,
    ))
}

pub struct Message {
    pub header: Header,
    pub qname: String,
    pub qtype: RrType,
    pub qclass: RrClass,
    pub answers: Vec<Rr>,
    pub authorities: Vec<Rr>,
    pub additionals: Vec<Rr>,
}

/// Builds an `RD=1` standard query (spec §6: "the resolver produces
/// `RD=1` queries").
pub fn encode_query(id: u16, name: &str) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let header = Header {
        id,
        qr: false,
        opcode: 0,
        aa: false,
        tc: false,
        rd: true,
        ra: false,
        rcode: 0,
        qdcount: 1,
        ancount: 0,
        nscount: 0,
        arcount: 0,
    };
    header.encode(&mut out);
    out.extend(encode_name(name)?);
    out.extend_from_slice(&RrType::A.as_u16().to_be_bytes());
    out.extend_from_slice(&RrClass::In.as_u16().to_be_bytes());
    Ok(out)
}

/// Peeks the 16-bit message id out of a raw UDP datagram without
/// decoding the rest, so the resolver's read path can route the
/// datagram to its in-flight message before doing any real parsing.
pub fn peek_msg_id(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

pub fn decode_message(buf: &[u8]) -> io::Result<Message> {
    let header = Header::decode(buf)?;
    let (qname, mut pos) = decode_name(buf, 12)?;
    if pos + 4 > buf.len() {
        return Err(invalid_data("truncated dns question"));
    }
    let qtype = RrType::from_u16(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
    let qclass = RrClass::from_u16(u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]));
    pos += 4;

    let mut answers = Vec::with_capacity(header.ancount as usize);
    for _ in 0..header.ancount {
        let (rr, next) = decode_rr(buf, pos)?;
        pos = next;
        answers.push(rr);
    }

    let mut authorities = Vec::with_capacity(header.nscount as usize);
    for _ in 0..header.nscount {
        let (rr, next) = decode_rr(buf, pos)?;
        pos = next;
        authorities.push(rr);
    }

    let mut additionals = Vec::with_capacity(header.arcount as usize);
    for _ in 0..header.arcount {
        let (rr, next) = decode_rr(buf, pos)?;
        pos = next;
        additionals.push(rr);
    }

    Ok(Message {
        header,
        qname,
        qtype,
        qclass,
        answers,
        authorities,
        additionals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_encode_decode() {
        for name in ["example.com", "www.apple.com", "a.b.c.d.example"] {
            let encoded = encode_name(name).unwrap();
            let (decoded, next) = decode_name(&encoded, 0).unwrap();
            assert_eq!(decoded, name);
            assert_eq!(next, encoded.len());
        }
    }

    #[test]
    fn rejects_label_over_63_bytes() {
        let label = "a".repeat(64);
        assert!(encode_name(&label).is_err());
    }

    #[test]
    fn decodes_compressed_pointer() {
        let mut buf = encode_name("example.com").unwrap();
        let ptr_offset = buf.len();
        // A second name, "www.example.com", whose tail is a pointer back
        // to "example.com" at offset 0.
        buf.push(3);
        buf.extend_from_slice(b"www");
        buf.push(0xC0);
        buf.push(0x00);

        let (decoded, next) = decode_name(&buf, ptr_offset).unwrap();
        assert_eq!(decoded, "www.example.com");
        assert_eq!(next, buf.len());
    }

    #[test]
    fn rejects_self_referential_pointer_loop() {
        let mut buf = vec![0u8; 4];
        buf[0] = 0xC0;
        buf[1] = 0x00;
        // byte 0 points at itself; the backward-only check catches this
        // immediately (ptr(0) >= pos(0)).
        assert!(decode_name(&buf, 0).is_err());
    }

    #[test]
    fn query_roundtrips_through_header_and_question() {
        let buf = encode_query(42, "example.com").unwrap();
        let header = Header::decode(&buf).unwrap();
        assert_eq!(header.id, 42);
        assert!(header.rd);
        assert_eq!(header.qdcount, 1);

        let (qname, pos) = decode_name(&buf, 12).unwrap();
        assert_eq!(qname, "example.com");
        let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        assert_eq!(qtype, RrType::A.as_u16());
    }
}
