//! Error and status types for BEEP peer operations.

use std::io;

/// Result type for peer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Session status codes.
///
/// Every session records the last status observed on it, together with a
/// human readable message (see `Session::status` / `Session::message`).
/// The set is closed; variant names are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Session is (or finished) operating correctly.
    Ok,
    /// Generic connect failure.
    ConnectionError,
    /// Host name resolution failed.
    NameResolvFailure,
    /// Socket creation hit a reserved descriptor or a configured limit.
    SocketSanityError,
    /// Malformed frame or greeting; always fatal to the session.
    ProtocolError,
    /// Greetings content failed validation.
    XmlValidationError,
    /// Greetings exchange timed out or never completed.
    GreetingsFailure,
    /// Orderly local close was requested.
    ConnectionCloseCalled,
    /// Unilateral shutdown was requested.
    ConnectionForcedClose,
    /// The remote peer vanished mid-stream without closing.
    UnnotifiedConnectionClose,
    /// Memory allocation failed.
    MemoryFail,
    /// An operation was attempted on a stale or invalid reference.
    WrongReference,
    /// Generic fatal condition not covered by the variants above.
    Error,
}

impl Status {
    /// Check whether this status still allows the session to operate.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Short lowercase name, used in log lines and error pushes.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::ConnectionError => "connection-error",
            Status::NameResolvFailure => "name-resolv-failure",
            Status::SocketSanityError => "socket-sanity-error",
            Status::ProtocolError => "protocol-error",
            Status::XmlValidationError => "xml-validation-error",
            Status::GreetingsFailure => "greetings-failure",
            Status::ConnectionCloseCalled => "connection-close-called",
            Status::ConnectionForcedClose => "connection-forced-close",
            Status::UnnotifiedConnectionClose => "unnotified-connection-close",
            Status::MemoryFail => "memory-fail",
            Status::WrongReference => "wrong-reference",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during BEEP peer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Host name resolution failed.
    #[error("name resolution failed: {0}")]
    NameResolution(String),

    /// Socket creation or configuration hit a sanity check.
    #[error("socket sanity check failed: {0}")]
    SocketSanity(String),

    /// TCP connect failed or timed out.
    #[error("unable to connect: {0}")]
    Connection(String),

    /// The greetings exchange failed or timed out.
    #[error("greetings exchange failed: {0}")]
    Greetings(String),

    /// Malformed frame, header or trailer. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Greetings content did not match the channel management grammar.
    #[error("greetings validation failed: {0}")]
    XmlValidation(String),

    /// Frame encoding did not fit the caller supplied buffer.
    #[error("frame encoding failed: {0}")]
    Encoding(String),

    /// An operation required a connected session.
    #[error("session is not connected")]
    NotConnected,

    /// A connection action requested the creation path to fail.
    #[error("connection action failed, closing session")]
    ActionFailed,

    /// An operation was called on a session of the wrong role or state,
    /// for example accepting on a non-listener session.
    #[error("{0}")]
    Misuse(String),
}

impl Error {
    /// Shorthand for a protocol error with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// The status code a session records when this error is fatal to it.
    pub fn status(&self) -> Status {
        match self {
            Error::Io(_) => Status::Error,
            Error::NameResolution(_) => Status::NameResolvFailure,
            Error::SocketSanity(_) => Status::SocketSanityError,
            Error::Connection(_) => Status::ConnectionError,
            Error::Greetings(_) => Status::GreetingsFailure,
            Error::Protocol(_) => Status::ProtocolError,
            Error::XmlValidation(_) => Status::XmlValidationError,
            Error::Encoding(_) => Status::Error,
            Error::NotConnected => Status::ConnectionError,
            Error::ActionFailed => Status::ConnectionCloseCalled,
            Error::Misuse(_) => Status::WrongReference,
        }
    }

    /// Check if this error came from a would-block read or write on a
    /// non-blocking socket. Such errors drive retry loops and are never
    /// fatal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Check if this error is a transient interruption (EINTR).
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}
