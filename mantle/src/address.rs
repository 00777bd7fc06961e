//! The address header that prefixes every session: a type byte, a variable
//! length destination and a big-endian port, optionally followed by a
//! one-time auth tag announced through the high bits of the type byte.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use crate::auth::ONETIMEAUTH_FLAG;
use crate::error::Fault;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const ADDRTYPE_MASK: u8 = 0x0F;

/// Destination named by the client header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DestAddr {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Destination {
    pub addr: DestAddr,
    pub port: u16,
    pub one_time_auth: bool,
}

impl Destination {
    /// The concrete address, when no resolver round-trip is needed. Literal
    /// IPs inside a domain field count.
    pub fn ip(&self) -> Option<IpAddr> {
        match &self.addr {
            DestAddr::Ip(ip) => Some(*ip),
            DestAddr::Domain(name) => name.parse().ok(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.addr {
            DestAddr::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            DestAddr::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            DestAddr::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Length of the address and port fields following the type byte, or `None`
/// when the type is unknown or the data is too short to tell. `body` starts
/// right after the type byte.
pub fn header_len(atyp: u8, body: &[u8]) -> Option<usize> {
    match atyp & ADDRTYPE_MASK {
        ATYP_IPV4 => Some(4 + 2),
        ATYP_DOMAIN => body.first().map(|&n| 1 + n as usize + 2),
        ATYP_IPV6 => Some(16 + 2),
        _ => None,
    }
}

/// Parses a decrypted session header starting at the type byte. Returns the
/// destination and the bytes consumed, not counting any auth tag. A header
/// whose announced length extends past the received bytes is malformed; the
/// client must deliver it in one piece.
pub fn parse(data: &[u8]) -> Result<(Destination, usize), Fault> {
    let atyp = *data.first().ok_or(Fault::BadHeader)?;
    let body = &data[1..];

    let (addr, addr_len) = match atyp & ADDRTYPE_MASK {
        ATYP_IPV4 => {
            if body.len() < 4 + 2 {
                return Err(Fault::BadHeader);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[..4]);
            (DestAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets))), 4)
        }
        ATYP_DOMAIN => {
            let name_len = *body.first().ok_or(Fault::BadHeader)? as usize;
            if body.len() < 1 + name_len + 2 {
                return Err(Fault::BadHeader);
            }
            let name =
                std::str::from_utf8(&body[1..1 + name_len]).map_err(|_| Fault::BadHeader)?;
            if name.is_empty() || !name.is_ascii() {
                return Err(Fault::BadHeader);
            }
            (DestAddr::Domain(name.to_owned()), 1 + name_len)
        }
        ATYP_IPV6 => {
            if body.len() < 16 + 2 {
                return Err(Fault::BadHeader);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            (DestAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets))), 16)
        }
        _ => return Err(Fault::BadHeader),
    };

    let port = BigEndian::read_u16(&body[addr_len..addr_len + 2]);
    let dest = Destination {
        addr,
        port,
        one_time_auth: atyp & ONETIMEAUTH_FLAG != 0,
    };
    Ok((dest, 1 + addr_len + 2))
}

/// Encodes a header the way a conforming client emits it.
pub fn encode(dest: &Destination) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 1 + 255 + 2);
    let flag = if dest.one_time_auth {
        ONETIMEAUTH_FLAG
    } else {
        0
    };

    match &dest.addr {
        DestAddr::Ip(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4 | flag);
            out.extend_from_slice(&ip.octets());
        }
        DestAddr::Ip(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6 | flag);
            out.extend_from_slice(&ip.octets());
        }
        DestAddr::Domain(name) => {
            debug_assert!(name.len() <= 255);
            out.push(ATYP_DOMAIN | flag);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
    }

    out.extend_from_slice(&dest.port.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(addr: DestAddr, port: u16) -> Destination {
        Destination {
            addr,
            port,
            one_time_auth: false,
        }
    }

    #[test]
    fn test_roundtrip_ipv4() {
        for port in [0u16, 80, 443, 65535] {
            let d = dest(DestAddr::Ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))), port);
            let wire = encode(&d);
            let (parsed, consumed) = parse(&wire).unwrap();
            assert_eq!(parsed, d);
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn test_roundtrip_ipv6() {
        let ip: Ipv6Addr = "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap();
        let d = dest(DestAddr::Ip(IpAddr::V6(ip)), 8080);
        let wire = encode(&d);
        let (parsed, consumed) = parse(&wire).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(consumed, 1 + 16 + 2);
    }

    #[test]
    fn test_roundtrip_domain() {
        let d = dest(DestAddr::Domain("example.com".to_owned()), 80);
        let wire = encode(&d);
        let (parsed, consumed) = parse(&wire).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(consumed, 1 + 1 + 11 + 2);
    }

    #[test]
    fn test_trailing_payload_is_not_consumed() {
        let d = dest(DestAddr::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)), 80);
        let mut wire = encode(&d);
        wire.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");

        let (parsed, consumed) = parse(&wire).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(&wire[consumed..], b"GET / HTTP/1.0\r\n\r\n");
    }

    #[test]
    fn test_auth_flag() {
        let mut d = dest(DestAddr::Domain("example.com".to_owned()), 80);
        d.one_time_auth = true;
        let wire = encode(&d);
        assert_eq!(wire[0], ATYP_DOMAIN | ONETIMEAUTH_FLAG);

        let (parsed, _) = parse(&wire).unwrap();
        assert!(parsed.one_time_auth);
    }

    #[test]
    fn test_unknown_atyp() {
        assert_eq!(parse(&[0x05, 0, 0, 0, 0, 0, 80]), Err(Fault::BadHeader));
        assert_eq!(parse(&[]), Err(Fault::BadHeader));
    }

    #[test]
    fn test_truncated_headers() {
        // IPv4 missing part of the port
        assert_eq!(parse(&[ATYP_IPV4, 127, 0, 0, 1, 0]), Err(Fault::BadHeader));

        // domain whose announced length runs past the data
        let mut wire = vec![ATYP_DOMAIN, 20];
        wire.extend_from_slice(b"short");
        assert_eq!(parse(&wire), Err(Fault::BadHeader));

        // empty domain
        assert_eq!(parse(&[ATYP_DOMAIN, 0, 0, 80]), Err(Fault::BadHeader));
    }

    #[test]
    fn test_header_len() {
        assert_eq!(header_len(ATYP_IPV4, &[]), Some(6));
        assert_eq!(header_len(ATYP_IPV6 | ONETIMEAUTH_FLAG, &[]), Some(18));
        assert_eq!(header_len(ATYP_DOMAIN, &[11]), Some(14));
        assert_eq!(header_len(ATYP_DOMAIN, &[]), None);
        assert_eq!(header_len(0x0f, &[]), None);
    }

    #[test]
    fn test_literal_ip_in_domain_field() {
        let d = dest(DestAddr::Domain("127.0.0.1".to_owned()), 80);
        assert_eq!(d.ip(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let d = dest(DestAddr::Domain("example.com".to_owned()), 80);
        assert_eq!(d.ip(), None);
    }
}
