use std::fmt;

use crate::names::OwnedErrorName;

/// The error type for this crate.
///
/// Mirrors the taxonomy described in the design: protocol/name failures, the four standard
/// routing errors, property access violations, name-request outcomes, the bus-ready handshake
/// timeout, user-originated errors (carrying their own D-Bus error name), and cancellation.
#[derive(Debug)]
pub enum Error {
    /// A frame could not be interpreted: unknown message type, or a signature mismatch while
    /// bridging marshal and high-level forms.
    Protocol(String),

    /// A bus, interface, path or member name failed `zbus_names`/`zvariant` validation.
    InvalidName(String),

    /// `org.freedesktop.DBus.Error.UnknownObject`.
    UnknownObject(String),

    /// `org.freedesktop.DBus.Error.UnknownInterface`.
    UnknownInterface(String),

    /// `org.freedesktop.DBus.Error.UnknownMethod`.
    UnknownMethod(String),

    /// `org.freedesktop.DBus.Error.UnknownService`.
    UnknownService(String),

    /// The named property exists but is write-only.
    PropertyWriteOnly(String),

    /// The named property exists but is read-only.
    PropertyReadOnly(String),

    /// `RequestName` did not return `PrimaryOwner`.
    RequestNameFailed(RequestNameOutcome),

    /// The bus-ready handshake (`Hello`) did not complete within the configured timeout.
    BusNotReady,

    /// A user method implementation returned an error; `name` is mapped onto
    /// `org.freedesktop.DBus.<name>` when sent over the wire.
    User { name: OwnedErrorName, text: String },

    /// A pending call was cancelled before it completed.
    Cancelled,

    /// This operation is not supported in the current configuration (e.g. property caching
    /// disabled).
    Unsupported,

    /// Propagated from `zvariant` (codec / signature errors).
    Variant(zvariant::Error),

    /// Propagated from `zbus_names` (bus/interface/member name validation).
    Names(zbus_names::Error),

    /// Propagated from `zbus_xml` (introspection document parsing).
    Xml(String),

    /// Transport-level I/O failure.
    Io(String),
}

/// Non-`PrimaryOwner` outcomes of a `RequestName` call (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameOutcome {
    InQueue,
    Exists,
    AlreadyOwner,
}

impl fmt::Display for RequestNameOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestNameOutcome::InQueue => write!(f, "request for name queued, not yet owner"),
            RequestNameOutcome::Exists => write!(f, "name is already owned by another peer"),
            RequestNameOutcome::AlreadyOwner => write!(f, "caller is already the owner"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::InvalidName(msg) => write!(f, "invalid name: {msg}"),
            Error::UnknownObject(path) => write!(f, "unknown object: {path}"),
            Error::UnknownInterface(name) => write!(f, "unknown interface: {name}"),
            Error::UnknownMethod(name) => write!(f, "unknown method: {name}"),
            Error::UnknownService(name) => write!(f, "unknown service: {name}"),
            Error::PropertyWriteOnly(name) => write!(f, "property is write-only: {name}"),
            Error::PropertyReadOnly(name) => write!(f, "property is read-only: {name}"),
            Error::RequestNameFailed(outcome) => write!(f, "request_name failed: {outcome}"),
            Error::BusNotReady => write!(f, "bus handshake did not complete in time"),
            Error::User { name, text } => write!(f, "{name}: {text}"),
            Error::Cancelled => write!(f, "call was cancelled"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::Variant(e) => write!(f, "{e}"),
            Error::Names(e) => write!(f, "{e}"),
            Error::Xml(msg) => write!(f, "introspection XML error: {msg}"),
            Error::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Variant(e) => Some(e),
            Error::Names(e) => Some(e),
            _ => None,
        }
    }
}

impl From<zvariant::Error> for Error {
    fn from(e: zvariant::Error) -> Self {
        Error::Variant(e)
    }
}

impl From<zbus_names::Error> for Error {
    fn from(e: zbus_names::Error) -> Self {
        Error::Names(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias for operations whose only failure mode is one of the standard `org.freedesktop.DBus`
/// errors (routing and property-access failures); kept distinct from [`Error`] the way the
/// teacher's `fdo::Result` is kept distinct from its top-level `Result`.
pub type FdoResult<T> = std::result::Result<T, Error>;
