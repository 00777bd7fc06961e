//! The listener and event loop: accepts client connections, owns the session
//! table, the shared replay cache and the resolver, and sweeps idle sessions
//! from a housekeeping tick.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::acl::Acl;
use crate::crypto::CipherSuite;
use crate::error::{Fault, SetupError};
use crate::logging::{self, Logger};
use crate::net;
use crate::replay::ReplayCache;
use crate::resolver::{Answer, Resolver};
use crate::session::{IoCtx, Session, Side};

const RESOLVER_TOKEN: usize = 0;
const SHUTDOWN_TOKEN: usize = 1;
const LISTENER_BASE: usize = 2;
const SESSION_BASE: usize = 64;

const EVENTS_CAPACITY: usize = 1024;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Relay-wide tunables, shared with the per-session pumps.
pub struct RelayConfig {
    pub listen: Vec<SocketAddr>,
    /// Idle window for established relays; pre-relay stages wait at most 30 s.
    pub timeout: Duration,
    pub fast_open: bool,
    /// Require one-time auth even when a header does not announce it.
    pub force_auth: bool,
    /// Outbound interface for target connections.
    pub iface: Option<String>,
    pub nameservers: Vec<SocketAddr>,
}

/// Flips the relay's run flag from a signal handler or another thread and
/// wakes the poll.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    ready: SetReadiness,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.ready.set_readiness(Ready::readable());
    }
}

pub struct Relay {
    poll: Poll,
    events: Events,
    listeners: Vec<TcpListener>,
    sessions: Vec<Option<Session>>,
    free: Vec<usize>,
    resolver: Resolver,
    replay: ReplayCache,
    suite: CipherSuite,
    acl: Option<Acl>,
    cfg: RelayConfig,
    shutdown: Arc<AtomicBool>,
    shutdown_ready: SetReadiness,
    _shutdown_registration: Registration,
    tx: u64,
    rx: u64,
    last_housekeeping: Instant,
    log: Logger,
}

impl Relay {
    /// Binds every configured listen address and wires up the resolver and
    /// the shutdown wakeup.
    pub fn bind(
        cfg: RelayConfig,
        suite: CipherSuite,
        acl: Option<Acl>,
        log: Logger,
    ) -> Result<Relay, SetupError> {
        if cfg.listen.is_empty() {
            return Err(SetupError::NoListeners);
        }

        let poll = Poll::new()?;

        let mut listeners = Vec::with_capacity(cfg.listen.len());
        for (i, addr) in cfg.listen.iter().enumerate() {
            let listener = net::bind_listener(*addr, cfg.fast_open, &log)?;
            poll.register(
                &listener,
                Token(LISTENER_BASE + i),
                Ready::readable(),
                PollOpt::level(),
            )?;
            let bound = listener.local_addr()?;
            logging::info!(log, "listening"; "addr" => %bound);
            listeners.push(listener);
        }

        let resolver = Resolver::new(cfg.nameservers.clone(), Token(RESOLVER_TOKEN), &poll, &log)?;

        let (registration, shutdown_ready) = Registration::new2();
        poll.register(
            &registration,
            Token(SHUTDOWN_TOKEN),
            Ready::readable(),
            PollOpt::edge(),
        )?;

        Ok(Relay {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
            sessions: Vec::new(),
            free: Vec::new(),
            resolver,
            replay: ReplayCache::default(),
            suite,
            acl,
            cfg,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_ready,
            _shutdown_registration: registration,
            tx: 0,
            rx: 0,
            last_housekeeping: Instant::now(),
            log,
        })
    }

    /// The bound listen addresses, with ephemeral ports filled in.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            ready: self.shutdown_ready.clone(),
        }
    }

    /// Bytes relayed client→target and target→client so far.
    pub fn traffic(&self) -> (u64, u64) {
        (self.tx, self.rx)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Runs until the shutdown handle fires, then tears everything down.
    pub fn run(&mut self) -> Result<(), SetupError> {
        while self.poll_once(HOUSEKEEPING_INTERVAL)? {}
        self.finish();
        Ok(())
    }

    /// One poll iteration. Returns `false` once shutdown has been requested.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<bool, SetupError> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let fired: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();
        for (token, readiness) in fired {
            self.dispatch(token, readiness);
        }

        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(false);
        }

        if self.last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
            self.housekeeping();
        }

        Ok(true)
    }

    /// Destructive teardown of every live session. Called once the loop ends.
    pub fn finish(&mut self) {
        let live: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i)
            .collect();
        for idx in live {
            self.teardown(idx, Fault::Closed);
        }
        logging::info!(self.log, "closed gracefully");
    }

    fn dispatch(&mut self, token: Token, readiness: Ready) {
        match token.0 {
            t if t >= SESSION_BASE => self.session_ready(t, readiness),
            t if t >= LISTENER_BASE => self.accept_ready(t - LISTENER_BASE),
            RESOLVER_TOKEN => self.resolver_ready(),
            // shutdown wake: the flag is checked after dispatch
            _ => {}
        }
    }

    fn accept_ready(&mut self, idx: usize) {
        loop {
            match self.listeners[idx].accept() {
                Ok((stream, peer)) => self.accept_session(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    logging::error!(self.log, "accept failed"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn accept_session(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        if let Some(acl) = &self.acl {
            if acl.blocks(peer.ip()) {
                logging::info!(self.log, "access denied"; "peer" => %peer);
                return;
            }
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.sessions.push(None);
                self.sessions.len() - 1
            }
        };

        let client_token = Token(SESSION_BASE + id * 2);
        let target_token = Token(SESSION_BASE + id * 2 + 1);
        match Session::new(
            id,
            stream,
            peer,
            client_token,
            target_token,
            &self.suite,
            &self.poll,
            &self.log,
        ) {
            Ok(session) => {
                logging::debug!(self.log, "connection accepted";
                                "session_id" => id,
                                "peer" => %peer);
                self.sessions[id] = Some(session);
            }
            Err(e) => {
                logging::error!(self.log, "session setup failed"; "error" => %e);
                self.free.push(id);
            }
        }
    }

    fn session_ready(&mut self, token: usize, readiness: Ready) {
        let offset = token - SESSION_BASE;
        let idx = offset / 2;
        let side = if offset % 2 == 0 {
            Side::Client
        } else {
            Side::Target
        };

        let result = {
            let Relay {
                ref poll,
                ref suite,
                ref cfg,
                ref mut sessions,
                ref mut resolver,
                ref mut replay,
                ref mut tx,
                ref mut rx,
                ..
            } = *self;

            let session = match sessions.get_mut(idx).and_then(|slot| slot.as_mut()) {
                Some(session) => session,
                // already torn down earlier in this batch
                None => return,
            };

            let mut ctx = IoCtx {
                poll,
                suite,
                replay,
                resolver,
                cfg,
                tx,
                rx,
            };
            session.ready(side, readiness, &mut ctx)
        };

        if let Err(fault) = result {
            self.teardown(idx, fault);
        }
    }

    fn resolver_ready(&mut self) {
        for answer in self.resolver.drain() {
            self.deliver_answer(answer);
        }
    }

    fn deliver_answer(&mut self, answer: Answer) {
        let idx = answer.owner;
        let result = {
            let Relay {
                ref poll,
                ref suite,
                ref cfg,
                ref mut sessions,
                ref mut resolver,
                ref mut replay,
                ref mut tx,
                ref mut rx,
                ..
            } = *self;

            let session = match sessions.get_mut(idx).and_then(|slot| slot.as_mut()) {
                Some(session) => session,
                None => return,
            };
            // stale answers for recycled slots are dropped here
            if !session.take_query(answer.id) {
                return;
            }

            let mut ctx = IoCtx {
                poll,
                suite,
                replay,
                resolver,
                cfg,
                tx,
                rx,
            };
            session.resolved(answer.addr, &mut ctx)
        };

        if let Err(fault) = result {
            self.teardown(idx, fault);
        }
    }

    fn housekeeping(&mut self) {
        self.last_housekeeping = Instant::now();
        let now = Instant::now();

        for answer in self.resolver.sweep(now) {
            self.deliver_answer(answer);
        }

        let idle: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|s| s.idle(now, self.cfg.timeout))
                    .map(|_| i)
            })
            .collect();
        for idx in idle {
            self.teardown(idx, Fault::Timeout);
        }
    }

    /// Single exit path for a session: cancel its query, stop its watchers,
    /// close its sockets, recycle the slot.
    fn teardown(&mut self, idx: usize, fault: Fault) {
        let mut session = match self.sessions.get_mut(idx).and_then(|slot| slot.take()) {
            Some(session) => session,
            None => return,
        };
        session.close(&self.poll, &mut self.resolver);
        self.free.push(idx);

        match fault {
            Fault::Closed => {
                logging::debug!(self.log, "connection closed"; "session_id" => idx)
            }
            Fault::Timeout => {
                logging::debug!(self.log, "connection timed out"; "session_id" => idx)
            }
            _ => logging::error!(self.log, "session failed";
                                 "session_id" => idx,
                                 "fault" => %fault),
        }

        if matches!(fault, Fault::BadHeader | Fault::AuthFail) {
            logging::error!(self.log, "failed to handshake"; "peer" => %session.peer());
            if let Some(acl) = &mut self.acl {
                if acl.ban(session.peer().ip()) {
                    logging::info!(self.log, "peer black-listed"; "peer" => %session.peer());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{encode, DestAddr, Destination};
    use crate::auth::{onetime_tag, ChunkSigner};
    use crate::buffer::Buffer;
    use crate::crypto::EncryptContext;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::sync::mpsc;
    use std::thread;

    const PASSWORD: &str = "relay-test-password";

    fn test_relay(method: &str, force_auth: bool) -> Relay {
        let cfg = RelayConfig {
            listen: vec!["127.0.0.1:0".parse().unwrap()],
            timeout: Duration::from_secs(60),
            fast_open: false,
            force_auth,
            iface: None,
            // never queried by these tests
            nameservers: vec!["127.0.0.1:5300".parse().unwrap()],
        };
        let suite = CipherSuite::new(method, PASSWORD).unwrap();
        Relay::bind(cfg, suite, None, crate::logging::discard()).unwrap()
    }

    /// Polls the relay until the channel delivers, or the test times out.
    fn drive<T>(relay: &mut Relay, rx: &mpsc::Receiver<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            relay.poll_once(Duration::from_millis(10)).unwrap();
            if let Ok(value) = rx.try_recv() {
                return value;
            }
            assert!(Instant::now() < deadline, "test timed out");
        }
    }

    fn ipv4_dest(port: u16) -> Destination {
        Destination {
            addr: DestAddr::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port,
            one_time_auth: false,
        }
    }

    fn seal_wire(ctx: &mut EncryptContext, plain: &[u8]) -> Vec<u8> {
        let mut buf = Buffer::new(8192);
        buf.push(plain);
        ctx.encrypt(&mut buf).unwrap();
        buf.pending().to_vec()
    }

    #[test]
    fn test_ipv4_relay_roundtrip() {
        let mut relay = test_relay("aes-256-cfb", false);
        let relay_addr = relay.local_addrs()[0];

        let target = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_addr = target.local_addr().unwrap();

        let request = b"GET / HTTP/1.0\r\n\r\n";
        let response = b"HTTP/1.0 200 OK\r\n\r\nhello";

        let (target_tx, target_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut conn, _) = target.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut got = vec![0u8; request.len()];
            conn.read_exact(&mut got).unwrap();
            conn.write_all(response).unwrap();
            target_tx.send(got).unwrap();
        });

        let suite = CipherSuite::new("aes-256-cfb", PASSWORD).unwrap();
        let mut plain = encode(&ipv4_dest(target_addr.port()));
        plain.extend_from_slice(request);
        let wire = seal_wire(&mut suite.encrypt_context(), &plain);

        let (client_tx, client_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            conn.write_all(&wire).unwrap();

            let mut cipher = vec![0u8; 16 + response.len()];
            conn.read_exact(&mut cipher).unwrap();
            client_tx.send(cipher).unwrap();
        });

        // the target sees the exact cleartext request
        let got_request = drive(&mut relay, &target_rx);
        assert_eq!(got_request, request);

        // and the client can decrypt the relayed response
        let cipher = drive(&mut relay, &client_rx);
        let mut buf = Buffer::new(4096);
        buf.push(&cipher);
        suite.decrypt_context().decrypt(&mut buf, None).unwrap();
        assert_eq!(buf.pending(), response);
    }

    #[test]
    fn test_literal_domain_skips_resolver() {
        let mut relay = test_relay("chacha20", false);
        let relay_addr = relay.local_addrs()[0];

        let target = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = target.local_addr().unwrap().port();

        let (target_tx, target_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut conn, _) = target.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut got = vec![0u8; 4];
            conn.read_exact(&mut got).unwrap();
            target_tx.send(got).unwrap();
        });

        let suite = CipherSuite::new("chacha20", PASSWORD).unwrap();
        let dest = Destination {
            addr: DestAddr::Domain("127.0.0.1".to_owned()),
            port: target_port,
            one_time_auth: false,
        };
        let mut plain = encode(&dest);
        plain.extend_from_slice(b"ping");
        let wire = seal_wire(&mut suite.encrypt_context(), &plain);

        thread::spawn(move || {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.write_all(&wire).unwrap();
            // hold the connection open while the relay works
            thread::sleep(Duration::from_secs(5));
        });

        let got = drive(&mut relay, &target_rx);
        assert_eq!(got, b"ping");
        // a literal IP in the domain field never touches the stub resolver
        assert_eq!(relay.resolver.pending_queries(), 0);
    }

    #[test]
    fn test_replayed_iv_is_rejected() {
        let mut relay = test_relay("aes-128-cfb", false);
        let relay_addr = relay.local_addrs()[0];

        let target = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = target.local_addr().unwrap().port();

        let (accept_tx, accept_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut held = Vec::new();
            loop {
                match target.accept() {
                    Ok((conn, _)) => {
                        if accept_tx.send(()).is_err() {
                            return;
                        }
                        // keep the connection alive for the test duration
                        held.push(conn);
                    }
                    Err(_) => return,
                }
            }
        });

        let suite = CipherSuite::new("aes-128-cfb", PASSWORD).unwrap();
        let mut plain = encode(&ipv4_dest(target_port));
        plain.extend_from_slice(b"ping");

        let iv = vec![9u8; 16];
        let first = seal_wire(&mut suite.encrypt_context_with_iv(iv.clone()), &plain);
        let second = seal_wire(&mut suite.encrypt_context_with_iv(iv), &plain);

        let _client1 = {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.write_all(&first).unwrap();
            conn
        };
        drive(&mut relay, &accept_rx);
        assert_eq!(relay.replay.len(), 1);

        // the replayed IV is refused before any target socket is opened
        let (eof_tx, eof_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            conn.write_all(&second).unwrap();
            let mut byte = [0u8; 1];
            let n = conn.read(&mut byte).unwrap();
            eof_tx.send(n).unwrap();
        });

        let n = drive(&mut relay, &eof_rx);
        assert_eq!(n, 0, "replayed session must be closed");
        assert_eq!(relay.replay.len(), 1);
        assert!(accept_rx.try_recv().is_err(), "no second target connection");
    }

    #[test]
    fn test_forced_auth_chunks_reach_target() {
        let mut relay = test_relay("aes-256-cfb", true);
        let relay_addr = relay.local_addrs()[0];

        let target = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = target.local_addr().unwrap().port();

        let (target_tx, target_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut conn, _) = target.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut got = vec![0u8; 15];
            conn.read_exact(&mut got).unwrap();
            target_tx.send(got).unwrap();
        });

        let suite = CipherSuite::new("aes-256-cfb", PASSWORD).unwrap();
        let mut enc = suite.encrypt_context();
        let iv = enc.iv().to_vec();

        let mut dest = ipv4_dest(target_port);
        dest.one_time_auth = true;
        let header = encode(&dest);

        let mut plain = header.clone();
        plain.extend_from_slice(&onetime_tag(&header, &iv, suite.key()));

        let mut signer = ChunkSigner::new();
        plain.extend(signer.seal(b"0123456789", &iv));
        plain.extend(signer.seal(b"abcde", &iv));

        let wire = seal_wire(&mut enc, &plain);
        thread::spawn(move || {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.write_all(&wire).unwrap();
            thread::sleep(Duration::from_secs(5));
        });

        let got = drive(&mut relay, &target_rx);
        assert_eq!(got, b"0123456789abcde");
    }

    #[test]
    fn test_tampered_chunk_closes_connection() {
        let mut relay = test_relay("aes-256-cfb", true);
        let relay_addr = relay.local_addrs()[0];

        let target = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = target.local_addr().unwrap().port();

        let (target_tx, target_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut conn, _) = target.accept().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut got = vec![0u8; 10];
            conn.read_exact(&mut got).unwrap();
            target_tx.send(got.clone()).unwrap();

            // nothing of the tampered chunk may arrive; the relay closes
            let mut byte = [0u8; 1];
            let n = match conn.read(&mut byte) {
                Ok(n) => n as u8,
                Err(_) => 255,
            };
            target_tx.send(vec![n]).unwrap();
        });

        let suite = CipherSuite::new("aes-256-cfb", PASSWORD).unwrap();
        let mut enc = suite.encrypt_context();
        let iv = enc.iv().to_vec();

        let mut dest = ipv4_dest(target_port);
        dest.one_time_auth = true;
        let header = encode(&dest);

        let mut first = header.clone();
        first.extend_from_slice(&onetime_tag(&header, &iv, suite.key()));
        let mut signer = ChunkSigner::new();
        first.extend(signer.seal(b"0123456789", &iv));

        let mut tampered = signer.seal(b"abcde", &iv);
        *tampered.last_mut().unwrap() ^= 1;

        let wire1 = seal_wire(&mut enc, &first);
        let wire2 = seal_wire(&mut enc, &tampered);

        thread::spawn(move || {
            let mut conn = StdTcpStream::connect(relay_addr).unwrap();
            conn.write_all(&wire1).unwrap();
            // let the relay forward the good chunk before the bad one lands
            thread::sleep(Duration::from_millis(500));
            let _ = conn.write_all(&wire2);
            thread::sleep(Duration::from_secs(5));
        });

        let got = drive(&mut relay, &target_rx);
        assert_eq!(got, b"0123456789");

        let eof = drive(&mut relay, &target_rx);
        assert_eq!(eof, vec![0], "target side must see the close");
    }
}
