//! The cipher abstraction: a process-wide [`CipherSuite`] holding the
//! password-derived key, and per-connection encrypt/decrypt contexts that
//! stream bytes through the configured method.
//!
//! The backends are a tagged set behind one small object-safe trait: the
//! table substitution, RC4 variants, the CFB block-cipher family, and the
//! counter-driven Salsa/ChaCha family.

pub mod kdf;
pub mod method;
pub mod table;

pub use method::Method;

use crate::auth::{self, ONETIMEAUTH_BYTES};
use crate::buffer::Buffer;
use crate::error::{Fault, SetupError};
use crate::replay::ReplayCache;
use table::TableCipher;

use cfb_mode::{BufDecryptor, BufEncryptor};
use cipher::consts::U16;
use cipher::{
    BlockCipher, BlockEncryptMut, InnerIvInit, InvalidLength, KeyInit, KeyIvInit, StreamCipher,
};
use md5::{Digest, Md5};
use rand::Rng;

/// Immutable process-wide cipher configuration: the selected method and the
/// key derived from the shared password. Built once at startup and passed by
/// reference into every connection.
pub struct CipherSuite {
    method: Method,
    key: Vec<u8>,
    table: Option<TableCipher>,
}

impl CipherSuite {
    pub fn new(method_name: &str, password: &str) -> Result<CipherSuite, SetupError> {
        let method = Method::from_name(method_name)
            .ok_or_else(|| SetupError::UnknownMethod(method_name.to_owned()))?;
        if password.is_empty() {
            return Err(SetupError::EmptyPassword);
        }

        Ok(match method {
            Method::Table => CipherSuite {
                method,
                key: Vec::new(),
                table: Some(TableCipher::new(password)),
            },
            _ => CipherSuite {
                method,
                key: kdf::bytes_to_key(password.as_bytes(), method.key_len()),
                table: None,
            },
        })
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[inline]
    pub fn iv_len(&self) -> usize {
        self.method.iv_len()
    }

    /// New encrypting half for a connection, seeded with a random IV.
    pub fn encrypt_context(&self) -> EncryptContext {
        let mut iv = vec![0u8; self.iv_len()];
        rand::thread_rng().fill(&mut iv[..]);
        EncryptContext {
            ctx: StreamContext::new(self, iv, Direction::Encrypt),
        }
    }

    /// New decrypting half; its IV arrives on the wire.
    pub fn decrypt_context(&self) -> DecryptContext {
        DecryptContext {
            ctx: StreamContext::new(self, Vec::new(), Direction::Decrypt),
        }
    }

    /// Single-shot encryption for datagram-style callers: optionally appends
    /// a one-time auth tag, seals the buffer and prefixes a fresh IV.
    pub fn encrypt_all(&self, buf: &mut Buffer, auth_tag: bool) -> Result<(), Fault> {
        if let Some(table) = &self.table {
            table.encrypt(buf.pending_mut());
            return Ok(());
        }

        let mut ctx = self.encrypt_context();
        if auth_tag {
            let tag = auth::onetime_tag(buf.pending(), ctx.iv(), &self.key);
            buf.push(&tag);
        }
        ctx.encrypt(buf)
    }

    /// Single-shot decryption: consumes the leading IV and, when the tag flag
    /// is forced or announced by the payload, verifies and strips the
    /// trailing one-time auth tag.
    pub fn decrypt_all(&self, buf: &mut Buffer, auth_tag: bool) -> Result<(), Fault> {
        if let Some(table) = &self.table {
            table.decrypt(buf.pending_mut());
            return Ok(());
        }

        if buf.remaining() <= self.iv_len() {
            return Err(Fault::CipherFail);
        }

        let mut ctx = self.decrypt_context();
        ctx.decrypt(buf, None)?;

        let flagged = auth_tag
            || buf
                .pending()
                .first()
                .map_or(false, |&b| b & auth::ONETIMEAUTH_FLAG != 0);
        if flagged {
            if buf.remaining() <= ONETIMEAUTH_BYTES {
                return Err(Fault::AuthFail);
            }
            let body_len = buf.remaining() - ONETIMEAUTH_BYTES;
            let (body, tag_bytes) = buf.pending().split_at(body_len);
            if !auth::onetime_verify(body, tag_bytes, ctx.iv(), &self.key) {
                return Err(Fault::AuthFail);
            }
            buf.truncate(body_len);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn encrypt_context_with_iv(&self, iv: Vec<u8>) -> EncryptContext {
        debug_assert_eq!(iv.len(), self.iv_len());
        EncryptContext {
            ctx: StreamContext::new(self, iv, Direction::Encrypt),
        }
    }
}

/// Encrypting half of a session. The first `encrypt` call emits the random
/// IV in cleartext ahead of the ciphertext.
pub struct EncryptContext {
    ctx: StreamContext,
}

impl EncryptContext {
    #[inline]
    pub fn iv(&self) -> &[u8] {
        &self.ctx.iv
    }

    /// Bytes processed so far. For the counter family this is exactly the
    /// keystream position.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.ctx.counter
    }

    /// Encrypts the pending region in place.
    pub fn encrypt(&mut self, buf: &mut Buffer) -> Result<(), Fault> {
        let first = !self.ctx.init;
        if first {
            self.ctx.prime()?;
        }
        self.ctx.apply(buf.pending_mut())?;
        if first {
            let iv = self.ctx.iv.clone();
            buf.prepend(&iv);
        }
        Ok(())
    }
}

/// Decrypting half of a session. The first `decrypt` call consumes the wire
/// IV, runs the replay check and keys the backend before any plaintext byte
/// is produced.
pub struct DecryptContext {
    ctx: StreamContext,
}

impl DecryptContext {
    /// The session IV once the first chunk has been seen.
    #[inline]
    pub fn iv(&self) -> &[u8] {
        &self.ctx.iv
    }

    #[inline]
    pub fn counter(&self) -> u64 {
        self.ctx.counter
    }

    #[inline]
    pub fn primed(&self) -> bool {
        self.ctx.init
    }

    /// Decrypts the pending region in place. Pass the shared replay cache on
    /// connection paths; single-shot callers pass `None`.
    pub fn decrypt(
        &mut self,
        buf: &mut Buffer,
        replay: Option<&mut ReplayCache>,
    ) -> Result<(), Fault> {
        if !self.ctx.init {
            let iv_len = self.ctx.method.iv_len();
            if buf.remaining() < iv_len {
                return Err(Fault::CipherFail);
            }
            let iv = buf.pending()[..iv_len].to_vec();
            if iv_len > 0 {
                if let Some(cache) = replay {
                    cache.check_and_insert(&iv)?;
                }
            }
            self.ctx.set_iv(iv)?;
            buf.strip_front(iv_len);
        }
        self.ctx.apply(buf.pending_mut())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Shared per-direction cipher state: the method, its key material, the
/// session IV and the running byte counter.
struct StreamContext {
    method: Method,
    key: Vec<u8>,
    direction: Direction,
    iv: Vec<u8>,
    init: bool,
    counter: u64,
    engine: Option<Box<dyn StreamTransform>>,
}

impl StreamContext {
    fn new(suite: &CipherSuite, iv: Vec<u8>, direction: Direction) -> StreamContext {
        // IV-less methods are keyed right away; the rest wait for the IV.
        let engine: Option<Box<dyn StreamTransform>> = match suite.method {
            Method::Table => Some(Box::new(TableTransform {
                table: suite
                    .table
                    .clone()
                    .expect("table method carries its tables"),
                direction,
            })),
            Method::Rc4 => Some(Box::new(Keystream(
                rc4::Rc4::<U16>::new_from_slice(&suite.key).expect("rc4 key length is fixed"),
            ))),
            _ => None,
        };

        StreamContext {
            method: suite.method,
            key: suite.key.clone(),
            direction,
            iv,
            init: false,
            counter: 0,
            engine,
        }
    }

    /// Keys the backend from the stored IV, if that has not happened yet.
    fn prime(&mut self) -> Result<(), Fault> {
        if self.engine.is_none() {
            self.engine = Some(build_engine(
                self.method,
                &self.key,
                &self.iv,
                self.direction,
            )?);
        }
        self.init = true;
        Ok(())
    }

    fn set_iv(&mut self, iv: Vec<u8>) -> Result<(), Fault> {
        self.iv = iv;
        self.prime()
    }

    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault> {
        let engine = self.engine.as_mut().ok_or(Fault::CipherFail)?;
        engine.apply(data)?;
        self.counter += data.len() as u64;
        Ok(())
    }
}

/// One in-place transform step of a keyed backend.
trait StreamTransform {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault>;
}

/// Pure keystream ciphers (RC4 variants and the counter family).
struct Keystream<C: StreamCipher>(C);

impl<C: StreamCipher> StreamTransform for Keystream<C> {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault> {
        self.0
            .try_apply_keystream(data)
            .map_err(|_| Fault::CipherFail)
    }
}

struct CfbEncrypt<C: BlockEncryptMut + BlockCipher>(BufEncryptor<C>);

impl<C: BlockEncryptMut + BlockCipher> StreamTransform for CfbEncrypt<C> {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault> {
        self.0.encrypt(data);
        Ok(())
    }
}

struct CfbDecrypt<C: BlockEncryptMut + BlockCipher>(BufDecryptor<C>);

impl<C: BlockEncryptMut + BlockCipher> StreamTransform for CfbDecrypt<C> {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault> {
        self.0.decrypt(data);
        Ok(())
    }
}

struct TableTransform {
    table: TableCipher,
    direction: Direction,
}

impl StreamTransform for TableTransform {
    fn apply(&mut self, data: &mut [u8]) -> Result<(), Fault> {
        match self.direction {
            Direction::Encrypt => self.table.encrypt(data),
            Direction::Decrypt => self.table.decrypt(data),
        }
        Ok(())
    }
}

#[inline]
fn keyed<T>(result: Result<T, InvalidLength>) -> Result<T, Fault> {
    result.map_err(|_| Fault::CipherFail)
}

fn cfb_engine<C>(cipher: C, iv: &[u8], direction: Direction) -> Result<Box<dyn StreamTransform>, Fault>
where
    C: BlockEncryptMut + BlockCipher + 'static,
{
    Ok(match direction {
        Direction::Encrypt => Box::new(CfbEncrypt(keyed(BufEncryptor::inner_iv_slice_init(
            cipher, iv,
        ))?)),
        Direction::Decrypt => Box::new(CfbDecrypt(keyed(BufDecryptor::inner_iv_slice_init(
            cipher, iv,
        ))?)),
    })
}

fn build_engine(
    method: Method,
    key: &[u8],
    iv: &[u8],
    direction: Direction,
) -> Result<Box<dyn StreamTransform>, Fault> {
    Ok(match method {
        Method::Table | Method::Rc4 => unreachable!("keyed at construction"),
        Method::Rc4Md5 => {
            let mut seed = Vec::with_capacity(key.len() + iv.len());
            seed.extend_from_slice(key);
            seed.extend_from_slice(iv);
            let true_key: [u8; 16] = Md5::digest(&seed).into();
            Box::new(Keystream(keyed(rc4::Rc4::<U16>::new_from_slice(
                &true_key,
            ))?))
        }
        Method::Aes128Cfb => cfb_engine(keyed(aes::Aes128::new_from_slice(key))?, iv, direction)?,
        Method::Aes192Cfb => cfb_engine(keyed(aes::Aes192::new_from_slice(key))?, iv, direction)?,
        Method::Aes256Cfb => cfb_engine(keyed(aes::Aes256::new_from_slice(key))?, iv, direction)?,
        Method::BfCfb => {
            let cipher: blowfish::Blowfish = keyed(KeyInit::new_from_slice(key))?;
            cfb_engine(cipher, iv, direction)?
        }
        Method::Camellia128Cfb => {
            cfb_engine(keyed(camellia::Camellia128::new_from_slice(key))?, iv, direction)?
        }
        Method::Camellia192Cfb => {
            cfb_engine(keyed(camellia::Camellia192::new_from_slice(key))?, iv, direction)?
        }
        Method::Camellia256Cfb => {
            cfb_engine(keyed(camellia::Camellia256::new_from_slice(key))?, iv, direction)?
        }
        Method::Cast5Cfb => cfb_engine(keyed(cast5::Cast5::new_from_slice(key))?, iv, direction)?,
        Method::DesCfb => cfb_engine(keyed(des::Des::new_from_slice(key))?, iv, direction)?,
        Method::IdeaCfb => cfb_engine(keyed(idea::Idea::new_from_slice(key))?, iv, direction)?,
        Method::Rc2Cfb => cfb_engine(
            rc2::Rc2::new_with_eff_key_len(key, key.len() * 8),
            iv,
            direction,
        )?,
        Method::Salsa20 => Box::new(Keystream(keyed(salsa20::Salsa20::new_from_slices(
            key, iv,
        ))?)),
        Method::ChaCha20 => Box::new(Keystream(keyed(
            chacha20::ChaCha20Legacy::new_from_slices(key, iv),
        )?)),
        Method::ChaCha20Ietf => Box::new(Keystream(keyed(chacha20::ChaCha20::new_from_slices(
            key, iv,
        ))?)),
    })
}
