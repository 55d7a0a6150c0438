//! Error types for the S2S routing core.

use std::fmt;
use std::io;

/// Top-level error type returned by this crate's fallible operations.
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O error (socket read/write, accept, connect).
    Io(io::Error),

    /// A JID failed to parse.
    JidParse(jid::Error),

    /// The peer violated the stream or stanza protocol in a way that
    /// is fatal to the whole `NetSession`.
    Stream(StreamError),

    /// A dialback or TLS-policy check failed for one `Route` pair; the
    /// underlying session may still be usable for other domain pairs.
    Auth(AuthError),

    /// DNS resolution failed.
    Dns(hickory_resolver::error::ResolveError),

    /// Parsing a wire element into its typed representation failed.
    Xso(xso::error::Error),

    /// Parsing raw bytes into XML events failed.
    Xml(minidom::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::JidParse(e) => write!(f, "invalid jid: {}", e),
            Error::Stream(e) => write!(f, "stream error: {}", e),
            Error::Auth(e) => write!(f, "auth error: {}", e),
            Error::Dns(e) => write!(f, "dns error: {}", e),
            Error::Xso(e) => write!(f, "xml element error: {}", e),
            Error::Xml(e) => write!(f, "xml parse error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Stream(e) => Some(e),
            Error::Auth(e) => Some(e),
            Error::Dns(e) => Some(e),
            Error::Xso(e) => Some(e),
            Error::Xml(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Error {
        Error::JidParse(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Error {
        Error::Stream(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Error {
        Error::Auth(e)
    }
}

impl From<hickory_resolver::error::ResolveError> for Error {
    fn from(e: hickory_resolver::error::ResolveError) -> Error {
        Error::Dns(e)
    }
}

impl From<xso::error::Error> for Error {
    fn from(e: xso::error::Error) -> Error {
        Error::Xso(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Error {
        Error::Xml(e)
    }
}

/// Stream-fatal protocol violations: the whole `NetSession` must be
/// torn down with a `<stream:error>` naming the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The remote used an unsupported stanza or stream element type.
    UnsupportedStanzaType,
    /// A `jabber:server:dialback` element referenced a `to`/`from`
    /// domain this server does not serve or does not recognise, and
    /// the condition is unrecoverable (e.g. the session's declared
    /// domain doesn't match).
    HostUnknown,
    /// The peer's declared transport is not `s2s` (component/C2S
    /// traffic arriving on the wrong listener).
    InvalidNamespace,
    /// The peer closed the stream or TCP connection.
    StreamClosed,
    /// A read or response deadline elapsed.
    Timeout,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StreamError::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamError::HostUnknown => "host-unknown",
            StreamError::InvalidNamespace => "invalid-namespace",
            StreamError::StreamClosed => "stream closed by peer",
            StreamError::Timeout => "timed out waiting for peer",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for StreamError {}

/// Auth-fatal failures scoped to a single `(local, remote)` `Route`
/// pair: the pair's authorization state is downgraded, but the
/// underlying `NetSession` (and any other pairs multiplexed on it)
/// keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A dialback `db:verify` key did not match the expected HMAC.
    KeyMismatch,
    /// The peer sent `db:result type='invalid'` or `type='error'`.
    ///
    /// Metre's C++ origin treats both as unimplemented; this crate
    /// treats them identically as a hard failure of the pair (see
    /// DESIGN.md Open Question 1).
    Rejected,
    /// TLS is required by local policy for this domain pair but the
    /// underlying `NetSession` is not secured.
    TlsRequired,
    /// No verified route could be established after all SRV targets
    /// were exhausted.
    NoRoute(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::KeyMismatch => f.write_str("dialback key mismatch"),
            AuthError::Rejected => f.write_str("dialback rejected by peer"),
            AuthError::TlsRequired => f.write_str("tls required but session is not secured"),
            AuthError::NoRoute(domain) => write!(f, "no route to {}", domain),
        }
    }
}

impl std::error::Error for AuthError {}
