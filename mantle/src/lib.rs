//! `mantle` is the protocol engine of an encrypted TCP relay server. Clients
//! prefix each stream with a random IV and an encrypted destination header;
//! the relay decrypts, opens a cleartext connection to the named target and
//! pumps bytes both ways, encrypting the response direction.
//!
//! The crate is organized around one single-threaded [`relay::Relay`] event
//! loop owning [`session::Session`] records; everything underneath
//! ([`crypto`], [`auth`], [`replay`], [`address`], [`buffer`]) is plain
//! state with no I/O of its own.

pub mod acl;
pub mod address;
pub mod auth;
pub mod buffer;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod net;
pub mod relay;
pub mod replay;
pub mod resolver;
pub mod session;

pub use error::{Fault, RelayError, RelayResult, SetupError};

/// Fixed per-connection buffer size shared by both relay directions.
pub const BUF_SIZE: usize = 2048;
