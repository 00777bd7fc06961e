//! Per-message authentication: the one-time header tag and the framed
//! per-chunk tags on the request direction.
//!
//! Both use HMAC-SHA1 truncated to its leftmost 10 bytes. The header tag is
//! keyed with `IV ‖ K`; chunk tags are keyed with `IV ‖ counter` where the
//! counter is big-endian and starts at zero.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::Fault;

type HmacSha1 = Hmac<Sha1>;

/// Truncated HMAC-SHA1 tag length.
pub const ONETIMEAUTH_BYTES: usize = 10;
/// Chunk length prefix size.
pub const CLEN_BYTES: usize = 2;
/// Framing overhead per authenticated chunk: length prefix plus tag.
pub const AUTH_BYTES: usize = CLEN_BYTES + ONETIMEAUTH_BYTES;
/// ATYP bit announcing a one-time authenticated header.
pub const ONETIMEAUTH_FLAG: u8 = 0x10;

fn tag(key: &[u8], msg: &[u8]) -> [u8; ONETIMEAUTH_BYTES] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    let full = mac.finalize().into_bytes();

    let mut out = [0u8; ONETIMEAUTH_BYTES];
    out.copy_from_slice(&full[..ONETIMEAUTH_BYTES]);
    out
}

fn verify(key: &[u8], msg: &[u8], expected: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.verify_truncated_left(expected).is_ok()
}

fn onetime_key(iv: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(iv.len() + key.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(key);
    out
}

fn chunk_key(iv: &[u8], counter: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(iv.len() + 4);
    out.extend_from_slice(iv);
    out.extend_from_slice(&counter.to_be_bytes());
    out
}

/// Tag over the session header, keyed with `IV ‖ K`.
pub fn onetime_tag(header: &[u8], iv: &[u8], key: &[u8]) -> [u8; ONETIMEAUTH_BYTES] {
    tag(&onetime_key(iv, key), header)
}

/// Constant-time check of a header tag.
pub fn onetime_verify(header: &[u8], tag_bytes: &[u8], iv: &[u8], key: &[u8]) -> bool {
    verify(&onetime_key(iv, key), header, tag_bytes)
}

/// Emitting half of the chunk framing, as a conforming client produces it:
/// wraps a payload as `LEN | MAC | PAYLOAD` and advances the counter.
pub struct ChunkSigner {
    counter: u32,
}

impl ChunkSigner {
    pub fn new() -> ChunkSigner {
        ChunkSigner { counter: 0 }
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn seal(&mut self, payload: &[u8], iv: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= u16::MAX as usize);

        let mut out = Vec::with_capacity(AUTH_BYTES + payload.len());
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&tag(&chunk_key(iv, self.counter), payload));
        out.extend_from_slice(payload);

        self.counter = self.counter.wrapping_add(1);
        out
    }
}

impl Default for ChunkSigner {
    fn default() -> ChunkSigner {
        ChunkSigner::new()
    }
}

/// Verifying half: reassembles `LEN | MAC | PAYLOAD` records from a decrypted
/// byte stream and emits only authenticated payload bytes. Bytes of an
/// incomplete record are held back until the rest arrives; the counter
/// advances only on an in-order successful verification.
pub struct ChunkVerifier {
    buf: Vec<u8>,
    counter: u32,
}

impl ChunkVerifier {
    pub fn new() -> ChunkVerifier {
        ChunkVerifier {
            buf: Vec::new(),
            counter: 0,
        }
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Bytes held back as part of an incomplete record.
    #[inline]
    pub fn held(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, input: &[u8], iv: &[u8], out: &mut Vec<u8>) -> Result<(), Fault> {
        self.buf.extend_from_slice(input);

        loop {
            if self.buf.len() < CLEN_BYTES {
                return Ok(());
            }
            let clen = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            let total = AUTH_BYTES + clen;
            if self.buf.len() < total {
                return Ok(());
            }

            let key = chunk_key(iv, self.counter);
            if !verify(&key, &self.buf[AUTH_BYTES..total], &self.buf[CLEN_BYTES..AUTH_BYTES]) {
                return Err(Fault::AuthFail);
            }

            out.extend_from_slice(&self.buf[AUTH_BYTES..total]);
            self.buf.drain(..total);
            self.counter = self.counter.wrapping_add(1);
        }
    }
}

impl Default for ChunkVerifier {
    fn default() -> ChunkVerifier {
        ChunkVerifier::new()
    }
}
