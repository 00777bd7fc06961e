use std::fmt;
use std::io;

use thiserror::Error;

/// Why a connection was torn down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// The peer closed the connection.
    Closed,
    /// An unrecoverable socket error.
    Io,
    /// The address header was malformed or truncated.
    BadHeader,
    /// A one-time or per-chunk MAC did not verify.
    AuthFail,
    /// The decryption IV was seen before.
    Replay,
    /// The cipher backend failed.
    CipherFail,
    /// Name resolution produced no usable address.
    ResolveFail,
    /// The idle timer expired.
    Timeout,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Fault::Closed => "closed",
            Fault::Io => "io",
            Fault::BadHeader => "bad header",
            Fault::AuthFail => "auth fail",
            Fault::Replay => "replay",
            Fault::CipherFail => "cipher fail",
            Fault::ResolveFail => "resolve fail",
            Fault::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Outcome of a single relay operation. `Wait` is the benign readiness case,
/// everything `Fatal` converges on session teardown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RelayError {
    /// The operation would block; retry on the next readiness event.
    Wait,
    /// The connection must be closed.
    Fatal(Fault),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RelayError::Wait,
            _ => RelayError::Fatal(Fault::Io),
        }
    }
}

/// Startup failure. These abort the process before the event loop begins.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("unknown cipher method \"{0}\"")]
    UnknownMethod(String),
    #[error("the password must not be empty")]
    EmptyPassword,
    #[error("a password is required")]
    MissingPassword,
    #[error("a server port is required")]
    MissingPort,
    #[error("invalid address \"{0}\"")]
    BadAddress(String),
    #[error("no listen addresses configured")]
    NoListeners,
    #[error("no usable nameservers")]
    NoNameservers,
    #[error("the UDP relay mode is not available")]
    UdpOnly,
    #[error(transparent)]
    Io(#[from] io::Error),
}
