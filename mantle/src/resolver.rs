//! Asynchronous hostname resolution on the relay's own event loop: a single
//! UDP socket, wire-format A/AAAA queries against the configured
//! nameservers, and per-query retry/timeout bookkeeping swept from the
//! housekeeping tick. Answers are delivered to the owning session exactly
//! once; cancelled queries are dropped silently.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use mio::net::UdpSocket;
use mio::{Poll, PollOpt, Ready, Token};
use rand::Rng;

use crate::error::{Fault, SetupError};
use crate::logging::{self, Logger};

const DNS_PORT: u16 = 53;
const MAX_PACKET: usize = 512;
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// Identifies an in-flight lookup, for cancellation on session teardown.
pub type QueryId = u16;

/// A finished lookup, addressed back to its owner.
#[derive(Debug)]
pub struct Answer {
    pub id: QueryId,
    pub owner: usize,
    pub addr: Option<SocketAddr>,
}

struct Query {
    host: String,
    port: u16,
    owner: usize,
    qtype: u16,
    ns: usize,
    sent_at: Instant,
}

pub struct Resolver {
    socket: UdpSocket,
    nameservers: Vec<SocketAddr>,
    pending: HashMap<QueryId, Query>,
    log: Logger,
}

impl Resolver {
    /// Binds the stub socket and registers it with the poll under `token`.
    pub fn new(
        nameservers: Vec<SocketAddr>,
        token: Token,
        poll: &Poll,
        log: &Logger,
    ) -> Result<Resolver, SetupError> {
        let first_family_v4 = nameservers.first().map_or(true, |ns| ns.is_ipv4());
        let nameservers: Vec<SocketAddr> = nameservers
            .into_iter()
            .filter(|ns| ns.is_ipv4() == first_family_v4)
            .collect();
        if nameservers.is_empty() {
            return Err(SetupError::NoNameservers);
        }

        let bind = if first_family_v4 {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(&bind)?;
        poll.register(&socket, token, Ready::readable(), PollOpt::level())?;

        for ns in &nameservers {
            logging::info!(log, "using nameserver"; "addr" => %ns);
        }

        Ok(Resolver {
            socket,
            nameservers,
            pending: HashMap::new(),
            log: log.new(logging::o!()),
        })
    }

    /// Nameservers from `/etc/resolv.conf`, or a public fallback when none
    /// can be read.
    pub fn system_nameservers() -> Vec<SocketAddr> {
        let mut out = parse_resolv_conf(
            &fs::read_to_string("/etc/resolv.conf").unwrap_or_default(),
        );
        if out.is_empty() {
            out.push(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                DNS_PORT,
            ));
        }
        out
    }

    #[inline]
    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    /// Starts a lookup. The answer arrives through `drain` or `sweep`.
    pub fn lookup(&mut self, host: &str, port: u16, owner: usize) -> Result<QueryId, Fault> {
        let mut rng = rand::thread_rng();
        let mut id: QueryId = rng.gen();
        while self.pending.contains_key(&id) {
            id = rng.gen();
        }

        let query = Query {
            host: host.to_owned(),
            port,
            owner,
            qtype: QTYPE_A,
            ns: 0,
            sent_at: Instant::now(),
        };
        self.send_query(id, &query)?;

        logging::debug!(self.log, "lookup started";
                        "context" => "resolve",
                        "host" => host,
                        "query_id" => id);

        self.pending.insert(id, query);
        Ok(id)
    }

    /// Forgets an in-flight query; a late response is dropped.
    pub fn cancel(&mut self, id: QueryId) {
        self.pending.remove(&id);
    }

    /// Drains datagrams after readable readiness.
    pub fn drain(&mut self) -> Vec<Answer> {
        let mut done = Vec::new();
        let mut buf = [0u8; MAX_PACKET];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Some(answer) = self.handle_packet(&buf[..n], from) {
                        done.push(answer);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    logging::warn!(self.log, "resolver socket error"; "error" => %e);
                    break;
                }
            }
        }

        done
    }

    /// Retries stale queries against the next nameserver and expires the
    /// hopeless ones. Driven by the housekeeping tick.
    pub fn sweep(&mut self, now: Instant) -> Vec<Answer> {
        let stale: Vec<QueryId> = self
            .pending
            .iter()
            .filter(|(_, q)| now.duration_since(q.sent_at) >= QUERY_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();

        let mut done = Vec::new();
        for id in stale {
            let mut query = self.pending.remove(&id).expect("stale id still pending");
            query.ns += 1;
            if query.ns < self.nameservers.len() {
                query.sent_at = now;
                if self.send_query(id, &query).is_ok() {
                    self.pending.insert(id, query);
                    continue;
                }
            }

            logging::debug!(self.log, "lookup expired";
                            "context" => "resolve",
                            "host" => %query.host,
                            "query_id" => id);
            done.push(Answer {
                id,
                owner: query.owner,
                addr: None,
            });
        }

        done
    }

    fn handle_packet(&mut self, packet: &[u8], from: SocketAddr) -> Option<Answer> {
        if !self.nameservers.contains(&from) || packet.len() < 12 {
            return None;
        }

        let id = BigEndian::read_u16(&packet[..2]);
        let query = self.pending.get_mut(&id)?;

        match parse_answer(packet, query.qtype) {
            Ok(Some(ip)) => {
                let query = self.pending.remove(&id).expect("query still pending");
                logging::debug!(self.log, "lookup finished";
                                "context" => "resolve",
                                "host" => %query.host,
                                "addr" => %ip);
                Some(Answer {
                    id,
                    owner: query.owner,
                    addr: Some(SocketAddr::new(ip, query.port)),
                })
            }
            Ok(None) => {
                // negative answer: fall back from A to AAAA once
                if query.qtype == QTYPE_A {
                    query.qtype = QTYPE_AAAA;
                    query.sent_at = Instant::now();
                    let resend = Query {
                        host: query.host.clone(),
                        port: query.port,
                        owner: query.owner,
                        qtype: QTYPE_AAAA,
                        ns: query.ns,
                        sent_at: query.sent_at,
                    };
                    if self.send_query(id, &resend).is_ok() {
                        return None;
                    }
                }
                let query = self.pending.remove(&id).expect("query still pending");
                Some(Answer {
                    id,
                    owner: query.owner,
                    addr: None,
                })
            }
            // garbage packet: keep waiting, the sweep handles silence
            Err(_) => None,
        }
    }

    fn send_query(&self, id: QueryId, query: &Query) -> Result<(), Fault> {
        let packet = build_query(id, &query.host, query.qtype)?;
        match self
            .socket
            .send_to(&packet, &self.nameservers[query.ns])
        {
            Ok(_) => Ok(()),
            // a full socket buffer is survivable, the sweep retries
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err(Fault::ResolveFail),
        }
    }
}

/// Builds a recursion-desired question for `host`.
fn build_query(id: QueryId, host: &str, qtype: u16) -> Result<Vec<u8>, Fault> {
    let name = host.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(Fault::ResolveFail);
    }

    let mut out = Vec::with_capacity(17 + name.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&[0x01, 0x00]); // RD
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0u8; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Fault::ResolveFail);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);

    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(out)
}

/// Extracts the first address record matching `qtype`. `Ok(None)` is an
/// authoritative negative answer.
fn parse_answer(packet: &[u8], qtype: u16) -> Result<Option<IpAddr>, Fault> {
    if packet.len() < 12 {
        return Err(Fault::ResolveFail);
    }

    let flags = BigEndian::read_u16(&packet[2..4]);
    if flags & 0x8000 == 0 {
        return Err(Fault::ResolveFail); // not a response
    }
    if flags & 0x000F != 0 {
        return Ok(None); // NXDOMAIN and friends
    }

    let qdcount = BigEndian::read_u16(&packet[4..6]) as usize;
    let ancount = BigEndian::read_u16(&packet[6..8]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos = pos.checked_add(4).ok_or(Fault::ResolveFail)?;
        if pos > packet.len() {
            return Err(Fault::ResolveFail);
        }
    }

    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return Err(Fault::ResolveFail);
        }
        let rtype = BigEndian::read_u16(&packet[pos..pos + 2]);
        let rdlen = BigEndian::read_u16(&packet[pos + 8..pos + 10]) as usize;
        pos += 10;
        if pos + rdlen > packet.len() {
            return Err(Fault::ResolveFail);
        }

        if rtype == qtype {
            let rdata = &packet[pos..pos + rdlen];
            if qtype == QTYPE_A && rdlen == 4 {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(rdata);
                return Ok(Some(IpAddr::V4(Ipv4Addr::from(octets))));
            }
            if qtype == QTYPE_AAAA && rdlen == 16 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                return Ok(Some(IpAddr::V6(Ipv6Addr::from(octets))));
            }
        }
        pos += rdlen;
    }

    Ok(None)
}

/// Steps over a possibly compressed name.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, Fault> {
    loop {
        let len = *packet.get(pos).ok_or(Fault::ResolveFail)? as usize;
        if len & 0xC0 == 0xC0 {
            if pos + 2 > packet.len() {
                return Err(Fault::ResolveFail);
            }
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + len;
        if pos > packet.len() {
            return Err(Fault::ResolveFail);
        }
    }
}

fn parse_resolv_conf(text: &str) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut words = line.split_whitespace();
        if words.next() != Some("nameserver") {
            continue;
        }
        if let Some(addr) = words.next() {
            if let Ok(ip) = addr.parse::<IpAddr>() {
                out.push(SocketAddr::new(ip, DNS_PORT));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_layout() {
        let packet = build_query(0x1234, "example.com", QTYPE_A).unwrap();

        assert_eq!(&packet[..2], &[0x12, 0x34]);
        assert_eq!(&packet[2..4], &[0x01, 0x00]); // RD
        assert_eq!(BigEndian::read_u16(&packet[4..6]), 1); // one question

        // 7example3com0
        let mut name = vec![7u8];
        name.extend_from_slice(b"example");
        name.push(3);
        name.extend_from_slice(b"com");
        name.push(0);
        assert_eq!(&packet[12..12 + name.len()], &name[..]);

        let tail = &packet[12 + name.len()..];
        assert_eq!(BigEndian::read_u16(&tail[..2]), QTYPE_A);
        assert_eq!(BigEndian::read_u16(&tail[2..4]), QCLASS_IN);
    }

    #[test]
    fn test_build_query_rejects_bad_names() {
        assert!(build_query(1, "", QTYPE_A).is_err());
        assert!(build_query(1, "a..b", QTYPE_A).is_err());
        let long = "x".repeat(64);
        assert!(build_query(1, &long, QTYPE_A).is_err());
    }

    /// Builds a response to `build_query` output with one A record answered
    /// through a compression pointer.
    fn fake_response(id: u16, ip: [u8; 4]) -> Vec<u8> {
        let mut packet = build_query(id, "example.com", QTYPE_A).unwrap();
        packet[2] = 0x81; // QR + RD
        packet[3] = 0x80; // RA
        BigEndian::write_u16(&mut packet[6..8], 1); // ANCOUNT

        packet.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
        packet.extend_from_slice(&QTYPE_A.to_be_bytes());
        packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes()); // TTL
        packet.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
        packet.extend_from_slice(&ip);
        packet
    }

    #[test]
    fn test_parse_answer_with_compression() {
        let packet = fake_response(7, [93, 184, 216, 34]);
        let ip = parse_answer(&packet, QTYPE_A).unwrap().unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
    }

    #[test]
    fn test_parse_answer_negative() {
        let mut packet = build_query(9, "nosuch.example", QTYPE_A).unwrap();
        packet[2] = 0x81;
        packet[3] = 0x83; // NXDOMAIN
        assert_eq!(parse_answer(&packet, QTYPE_A).unwrap(), None);
    }

    #[test]
    fn test_parse_answer_rejects_queries_and_runts() {
        let packet = build_query(9, "example.com", QTYPE_A).unwrap();
        assert!(parse_answer(&packet, QTYPE_A).is_err()); // QR not set
        assert!(parse_answer(&[0u8; 4], QTYPE_A).is_err());
    }

    #[test]
    fn test_parse_answer_skips_wrong_rtype() {
        // CNAME record ahead of the A record
        let mut packet = build_query(3, "example.com", QTYPE_A).unwrap();
        packet[2] = 0x81;
        packet[3] = 0x80;
        BigEndian::write_u16(&mut packet[6..8], 2);

        // CNAME answer: name pointer, type 5, class IN, ttl, rdlength 2, data
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&5u16.to_be_bytes());
        packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&2u16.to_be_bytes());
        packet.extend_from_slice(&[0xC0, 0x0C]);

        // then the real A record
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&QTYPE_A.to_be_bytes());
        packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&[10, 1, 2, 3]);

        let ip = parse_answer(&packet, QTYPE_A).unwrap().unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_parse_resolv_conf() {
        let text = "# comment\n\
                    ; comment\n\
                    search example.com\n\
                    nameserver 127.0.0.53\n\
                    nameserver 2001:4860:4860::8888\n\
                    nameserver not-an-ip\n";
        let servers = parse_resolv_conf(text);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0], "127.0.0.53:53".parse().unwrap());
        assert_eq!(servers[1], "[2001:4860:4860::8888]:53".parse().unwrap());
    }
}
