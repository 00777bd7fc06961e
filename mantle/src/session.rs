//! The per-connection engine: one [`Session`] owns the client-facing socket
//! and, once the header names a destination, the target-facing socket. The
//! lifecycle runs header intake, target resolution and connect, then the two
//! mirrored byte pumps with partial-write backpressure.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};

use crate::address::{self, DestAddr};
use crate::auth::{self, ChunkVerifier, ONETIMEAUTH_BYTES};
use crate::buffer::Buffer;
use crate::crypto::{CipherSuite, DecryptContext, EncryptContext};
use crate::error::{Fault, RelayError, RelayResult};
use crate::logging::{self, Logger};
use crate::net;
use crate::relay::RelayConfig;
use crate::replay::ReplayCache;
use crate::resolver::{QueryId, Resolver};
use crate::BUF_SIZE;

/// Pre-relay stages share a shorter patience window than the idle relay.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    /// Accumulating the IV and the address header.
    AwaitHeader,
    /// Resolving the target name or waiting for the TCP handshake.
    Connecting,
    /// Both pumps running.
    Relaying,
}

/// Which of the session's sockets an event fired on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Client,
    Target,
}

/// Loop-owned state the pump handlers need: the poll for interest changes,
/// the shared cipher suite, replay cache and resolver, and the traffic
/// counters.
pub struct IoCtx<'a> {
    pub poll: &'a Poll,
    pub suite: &'a CipherSuite,
    pub replay: &'a mut ReplayCache,
    pub resolver: &'a mut Resolver,
    pub cfg: &'a RelayConfig,
    pub tx: &'a mut u64,
    pub rx: &'a mut u64,
}

/// One socket with its registered interest set.
struct Sock {
    stream: TcpStream,
    token: Token,
    interest: Ready,
}

impl Sock {
    fn register(stream: TcpStream, token: Token, poll: &Poll) -> io::Result<Sock> {
        poll.register(&stream, token, Ready::empty(), PollOpt::level())?;
        Ok(Sock {
            stream,
            token,
            interest: Ready::empty(),
        })
    }

    fn set_interest(&mut self, poll: &Poll, interest: Ready) -> io::Result<()> {
        if interest == self.interest {
            return Ok(());
        }
        poll.reregister(&self.stream, self.token, interest, PollOpt::level())?;
        self.interest = interest;
        Ok(())
    }

    #[inline]
    fn enable(&mut self, poll: &Poll, what: Ready) -> io::Result<()> {
        self.set_interest(poll, self.interest | what)
    }

    #[inline]
    fn disable(&mut self, poll: &Poll, what: Ready) -> io::Result<()> {
        self.set_interest(poll, self.interest - what)
    }
}

struct Target {
    sock: Sock,
    /// Decrypted client bytes on their way to the target.
    buf: Buffer,
    connected: bool,
}

pub struct Session {
    id: usize,
    client: Sock,
    peer: SocketAddr,
    /// Header intake in stage zero, then encrypted target bytes on their way
    /// to the client.
    client_buf: Buffer,
    e_ctx: EncryptContext,
    d_ctx: DecryptContext,
    stage: Stage,
    auth: bool,
    chunk: ChunkVerifier,
    target: Option<Target>,
    target_token: Token,
    query: Option<QueryId>,
    last_active: Instant,
    log: Logger,
}

impl Session {
    pub fn new(
        id: usize,
        stream: TcpStream,
        peer: SocketAddr,
        client_token: Token,
        target_token: Token,
        suite: &CipherSuite,
        poll: &Poll,
        log: &Logger,
    ) -> io::Result<Session> {
        let _ = stream.set_nodelay(true);
        let mut client = Sock::register(stream, client_token, poll)?;
        client.enable(poll, Ready::readable())?;

        Ok(Session {
            id,
            client,
            peer,
            client_buf: Buffer::new(BUF_SIZE),
            e_ctx: suite.encrypt_context(),
            d_ctx: suite.decrypt_context(),
            stage: Stage::AwaitHeader,
            auth: false,
            chunk: ChunkVerifier::new(),
            target: None,
            target_token,
            query: None,
            last_active: Instant::now(),
            log: log.new(logging::o!("session_id" => id)),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Claims a resolver answer if it belongs to this session's outstanding
    /// query.
    pub fn take_query(&mut self, id: QueryId) -> bool {
        if self.query == Some(id) {
            self.query = None;
            true
        } else {
            false
        }
    }

    /// True once the inactivity window for the current stage has elapsed.
    pub fn idle(&self, now: Instant, timeout: Duration) -> bool {
        let limit = match self.stage {
            Stage::Relaying => timeout,
            _ => timeout.min(MAX_CONNECT_TIMEOUT),
        };
        now.duration_since(self.last_active) >= limit
    }

    /// Handles a readiness event on one of the session's sockets.
    pub fn ready(&mut self, side: Side, readiness: Ready, ctx: &mut IoCtx) -> Result<(), Fault> {
        if readiness.is_readable() {
            match side {
                Side::Client => self.client_readable(ctx)?,
                Side::Target => self.target_readable(ctx)?,
            }
        }
        if readiness.is_writable() {
            match side {
                Side::Client => self.client_writable(ctx)?,
                Side::Target => self.target_writable(ctx)?,
            }
        }
        Ok(())
    }

    /// Resolver completion for this session's pending query.
    pub fn resolved(&mut self, addr: Option<SocketAddr>, ctx: &mut IoCtx) -> Result<(), Fault> {
        match addr {
            Some(addr) => {
                logging::debug!(self.log, "name resolved"; "context" => "resolve", "addr" => %addr);
                self.open_target(addr, ctx)
            }
            None => Err(Fault::ResolveFail),
        }
    }

    /// Synchronous teardown: cancels the resolver query and deregisters both
    /// sockets. Buffers and contexts go down with the value.
    pub fn close(&mut self, poll: &Poll, resolver: &mut Resolver) {
        if let Some(query) = self.query.take() {
            resolver.cancel(query);
        }
        let _ = poll.deregister(&self.client.stream);
        if let Some(target) = &self.target {
            let _ = poll.deregister(&target.sock.stream);
        }
        logging::debug!(self.log, "session closed";
                        "context" => "close",
                        "peer" => %self.peer,
                        "stage" => ?self.stage);
    }

    fn client_readable(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        match self.stage {
            Stage::AwaitHeader => self.read_header(ctx),
            Stage::Relaying => self.pump_request(ctx),
            // reads are paused while resolving/connecting
            Stage::Connecting => Ok(()),
        }
    }

    /// Stage zero: accumulate the IV, key the decrypt context, parse the
    /// header and move on to the target.
    fn read_header(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let n = match read_step(&mut self.client_buf, &self.client.stream) {
            Ok(n) => n,
            Err(RelayError::Wait) => return Ok(()),
            Err(RelayError::Fatal(fault)) => return Err(fault),
        };
        *ctx.tx += n as u64;
        self.last_active = Instant::now();

        if self.client_buf.remaining() <= ctx.suite.iv_len() {
            logging::debug!(self.log, "incomplete header";
                            "context" => "handshake",
                            "have" => self.client_buf.remaining());
            return Ok(());
        }

        self.d_ctx.decrypt(&mut self.client_buf, Some(ctx.replay))?;
        self.process_header(ctx)
    }

    fn process_header(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let data = self.client_buf.pending();
        let atyp = *data.first().ok_or(Fault::BadHeader)?;

        // the tag is verified whenever auth is forced by configuration or
        // announced by the header; either way the session is authenticated
        // from here on
        if ctx.cfg.force_auth || atyp & auth::ONETIMEAUTH_FLAG != 0 {
            let hlen = address::header_len(atyp, &data[1..]).ok_or(Fault::BadHeader)?;
            let need = 1 + hlen + ONETIMEAUTH_BYTES;
            if data.len() < need {
                return Err(Fault::BadHeader);
            }
            if !auth::onetime_verify(
                &data[..1 + hlen],
                &data[1 + hlen..need],
                self.d_ctx.iv(),
                ctx.suite.key(),
            ) {
                return Err(Fault::AuthFail);
            }
            self.auth = true;
        }

        let (dest, consumed) = address::parse(self.client_buf.pending())?;
        let mut offset = consumed;
        if self.auth {
            offset += ONETIMEAUTH_BYTES;
        }
        self.client_buf.strip_front(offset);

        logging::debug!(self.log, "destination parsed";
                        "context" => "handshake",
                        "dest" => %dest,
                        "auth" => self.auth);

        // any bytes past the header are the first payload
        if self.auth && !self.client_buf.is_empty() {
            let iv = self.d_ctx.iv().to_vec();
            verify_chunks(&mut self.client_buf, &mut self.chunk, &iv)?;
        }

        match dest.ip() {
            Some(ip) => self.open_target(SocketAddr::new(ip, dest.port), ctx),
            None => {
                let host = match &dest.addr {
                    DestAddr::Domain(name) => name.clone(),
                    DestAddr::Ip(_) => unreachable!("ip destinations never resolve"),
                };
                self.query = Some(ctx.resolver.lookup(&host, dest.port, self.id)?);
                self.stage = Stage::Connecting;
                self.client
                    .disable(ctx.poll, Ready::readable())
                    .map_err(io_fault)?;
                Ok(())
            }
        }
    }

    /// Opens the target socket; the first payload travels in its buffer and,
    /// with fast open, in the SYN itself.
    fn open_target(&mut self, addr: SocketAddr, ctx: &mut IoCtx) -> Result<(), Fault> {
        let mut buf = Buffer::new(BUF_SIZE);
        if !self.client_buf.is_empty() {
            buf.push(self.client_buf.pending());
            self.client_buf.clear();
        }

        let stream = net::connect_target(
            addr,
            ctx.cfg.iface.as_deref(),
            ctx.cfg.fast_open,
            &mut buf,
        )
        .map_err(|e| {
            logging::error!(self.log, "connect failed"; "addr" => %addr, "error" => %e);
            Fault::Io
        })?;

        let mut sock = Sock::register(stream, self.target_token, ctx.poll).map_err(io_fault)?;
        sock.enable(ctx.poll, Ready::writable()).map_err(io_fault)?;

        self.target = Some(Target {
            sock,
            buf,
            connected: false,
        });
        self.stage = Stage::Connecting;
        self.client
            .disable(ctx.poll, Ready::readable())
            .map_err(io_fault)?;
        Ok(())
    }

    /// Relay stage, request direction: recv, decrypt, verify chunks when
    /// authenticated, forward, park leftovers under backpressure.
    fn pump_request(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let target = self.target.as_mut().ok_or(Fault::Io)?;
        if !target.buf.is_empty() {
            // reads are paused while the forward buffer drains
            return Ok(());
        }

        let n = match read_step(&mut target.buf, &self.client.stream) {
            Ok(n) => n,
            Err(RelayError::Wait) => return Ok(()),
            Err(RelayError::Fatal(fault)) => return Err(fault),
        };
        *ctx.tx += n as u64;
        self.last_active = Instant::now();

        self.d_ctx.decrypt(&mut target.buf, Some(ctx.replay))?;

        if self.auth {
            let iv = self.d_ctx.iv().to_vec();
            verify_chunks(&mut target.buf, &mut self.chunk, &iv)?;
        }
        if target.buf.is_empty() {
            return Ok(());
        }

        match write_step(&mut target.buf, &target.sock.stream) {
            Ok(_) => Ok(()),
            Err(RelayError::Wait) => {
                self.client
                    .disable(ctx.poll, Ready::readable())
                    .map_err(io_fault)?;
                target
                    .sock
                    .enable(ctx.poll, Ready::writable())
                    .map_err(io_fault)?;
                Ok(())
            }
            Err(RelayError::Fatal(fault)) => Err(fault),
        }
    }

    /// Relay stage, response direction: recv from the target, encrypt,
    /// forward to the client, mirror the backpressure.
    fn target_readable(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let target = match self.target.as_mut() {
            Some(target) => target,
            None => return Ok(()),
        };
        if !self.client_buf.is_empty() {
            return Ok(());
        }

        let n = match read_step(&mut self.client_buf, &target.sock.stream) {
            Ok(n) => n,
            Err(RelayError::Wait) => return Ok(()),
            Err(RelayError::Fatal(fault)) => return Err(fault),
        };
        *ctx.rx += n as u64;
        self.last_active = Instant::now();

        self.e_ctx.encrypt(&mut self.client_buf)?;

        match write_step(&mut self.client_buf, &self.client.stream) {
            Ok(_) => Ok(()),
            Err(RelayError::Wait) => {
                target
                    .sock
                    .disable(ctx.poll, Ready::readable())
                    .map_err(io_fault)?;
                self.client
                    .enable(ctx.poll, Ready::writable())
                    .map_err(io_fault)?;
                Ok(())
            }
            Err(RelayError::Fatal(fault)) => Err(fault),
        }
    }

    /// Writable on the target: first fire confirms the handshake, afterwards
    /// it drains parked request bytes.
    fn target_writable(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let target = match self.target.as_mut() {
            Some(target) => target,
            None => return Ok(()),
        };

        if !target.connected {
            match target.sock.stream.peer_addr() {
                Ok(_) => {
                    target.connected = true;
                    logging::debug!(self.log, "target connected"; "context" => "connect");
                }
                Err(e) => {
                    logging::error!(self.log, "target handshake failed";
                                    "context" => "connect",
                                    "error" => %e);
                    return Err(Fault::Io);
                }
            }
        }

        if target.buf.is_empty() {
            return self.start_relaying(ctx);
        }

        match write_step(&mut target.buf, &target.sock.stream) {
            Ok(_) => self.start_relaying(ctx),
            Err(RelayError::Wait) => Ok(()),
            Err(RelayError::Fatal(fault)) => Err(fault),
        }
    }

    /// Writable on the client: drain the parked response bytes, then resume
    /// reading the target.
    fn client_writable(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        if self.client_buf.is_empty() {
            self.client
                .disable(ctx.poll, Ready::writable())
                .map_err(io_fault)?;
            return Ok(());
        }

        match write_step(&mut self.client_buf, &self.client.stream) {
            Ok(_) => {
                self.client
                    .disable(ctx.poll, Ready::writable())
                    .map_err(io_fault)?;
                if let Some(target) = &mut self.target {
                    target
                        .sock
                        .enable(ctx.poll, Ready::readable())
                        .map_err(io_fault)?;
                }
                Ok(())
            }
            Err(RelayError::Wait) => Ok(()),
            Err(RelayError::Fatal(fault)) => Err(fault),
        }
    }

    /// The forward buffer has drained: stop write-watching the target and
    /// run both read pumps.
    fn start_relaying(&mut self, ctx: &mut IoCtx) -> Result<(), Fault> {
        let target = self.target.as_mut().ok_or(Fault::Io)?;
        target
            .sock
            .disable(ctx.poll, Ready::writable())
            .map_err(io_fault)?;
        target
            .sock
            .enable(ctx.poll, Ready::readable())
            .map_err(io_fault)?;
        self.client
            .enable(ctx.poll, Ready::readable())
            .map_err(io_fault)?;

        if self.stage != Stage::Relaying {
            self.stage = Stage::Relaying;
            logging::debug!(self.log, "relay established"; "context" => "connect");
        }
        Ok(())
    }
}

/// Runs the buffer through the chunk verifier, replacing its contents with
/// the authenticated payload bytes.
fn verify_chunks(buf: &mut Buffer, chunk: &mut ChunkVerifier, iv: &[u8]) -> Result<(), Fault> {
    let mut out = Vec::with_capacity(buf.remaining());
    chunk.push(buf.pending(), iv, &mut out)?;
    buf.set(&out);
    Ok(())
}

/// One recv pass. An orderly end of stream is a fatal `Closed`.
fn read_step(buf: &mut Buffer, stream: &TcpStream) -> RelayResult<usize> {
    let mut reader = stream;
    match buf.recv(&mut reader) {
        Ok(0) => Err(RelayError::Fatal(Fault::Closed)),
        Ok(n) => Ok(n),
        Err(e) => Err(RelayError::from(e)),
    }
}

/// Drains the buffer into the socket; a blocked writer surfaces as `Wait`
/// with the partial progress parked at the drain offset.
fn write_step(buf: &mut Buffer, stream: &TcpStream) -> RelayResult<usize> {
    let mut writer = stream;
    buf.send(&mut writer).map_err(RelayError::from)
}

#[inline]
fn io_fault(_err: io::Error) -> Fault {
    Fault::Io
}
