//! Error and Result types shared across the proxy.

use std::error::Error as StdError;
use std::fmt;

/// Result type returned from most fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// The error type for this crate.
///
/// Like most of the taxonomy below, the shape of this type (a thin handle
/// around a boxed, enum-tagged inner struct) follows the pattern used by
/// `hyper::Error`: a single-word `Error` that is cheap to move around,
/// carrying an optional source `cause` and a `Kind` describing which part
/// of the proxy produced it.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Malformed request line, header, or netstring that the proxy itself
    /// rejects before forwarding it anywhere.
    Parse(Parse),
    /// Error bringing up a listening socket.
    Listen,
    /// Error accepting a client connection.
    Accept,
    /// I/O error on a client, upstream, worker, or resolver socket/pipe.
    Io,
    /// Error connecting to an upstream origin server.
    Connect,
    /// The classifier pool could not provision or reach a worker.
    Worker,
    /// A redirector worker exited or produced a malformed reply.
    WorkerProtocol,
    /// A DNS query failed, timed out, or the resolver returned garbage.
    Resolve,
    /// The on-disk configuration is invalid.
    Config,
    /// A pending item (job, query, connection) was dropped before it
    /// could be processed, usually because of shutdown.
    Canceled,
    /// A channel the proxy relies on internally was closed unexpectedly.
    ChannelClosed,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    TooLarge,
    Netstring,
}

// Sentinel type used to tag a cause as "this was a timeout", mirroring
// how hyper's Error::is_timeout() walks the source chain for one of these.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// True if this was a malformed request/header/netstring.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// True if the operation was canceled rather than failing outright.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// True if a channel this crate depends on internally was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// True if this was an error connecting to an upstream server.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// True if this came from the classifier worker pool.
    pub fn is_worker(&self) -> bool {
        matches!(self.inner.kind, Kind::Worker | Kind::WorkerProtocol)
    }

    /// True if this came from the resolver.
    pub fn is_resolve(&self) -> bool {
        matches!(self.inner.kind, Kind::Resolve)
    }

    /// True if the error was (or was caused by) a timeout.
    pub fn is_timeout(&self) -> bool {
        self.find_source::<TimedOut>().is_some()
    }

    /// Consumes the error, returning its underlying cause, if any.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_worker<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Worker).with(cause)
    }

    pub(crate) fn new_worker_protocol() -> Error {
        Error::new(Kind::WorkerProtocol)
    }

    pub(crate) fn new_resolve<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Resolve).with(cause)
    }

    pub(crate) fn new_resolve_timeout() -> Error {
        Error::new(Kind::Resolve).with(TimedOut)
    }

    pub(crate) fn new_config<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_netstring() -> Error {
        Error::new(Kind::Parse(Parse::Netstring))
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::UriTooLong) => "URI too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "request head is too large",
            Kind::Parse(Parse::Netstring) => "malformed netstring on redirector pipe",
            Kind::Listen => "error creating listener",
            Kind::Accept => "error accepting connection",
            Kind::Io => "connection error",
            Kind::Connect => "error connecting to upstream",
            Kind::Worker => "error provisioning classifier worker",
            Kind::WorkerProtocol => "classifier worker sent a malformed reply",
            Kind::Resolve => "DNS resolution failed",
            Kind::Config => "invalid configuration",
            Kind::Canceled => "operation was canceled",
            Kind::ChannelClosed => "internal channel closed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("exaproxy::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[doc(hidden)]
impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Header,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::method::InvalidMethod> for Parse {
    fn from(_: http::method::InvalidMethod) -> Parse {
        Parse::Method
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn is_timeout_walks_source_chain() {
        let err = Error::new_resolve_timeout();
        assert!(err.is_timeout());
        assert!(err.is_resolve());
    }

    #[test]
    fn is_timeout_false_for_unrelated_cause() {
        let err = Error::new_connect(std::io::Error::new(std::io::ErrorKind::Other, "refused"));
        assert!(!err.is_timeout());
        assert!(err.is_connect());
    }

    #[test]
    fn netstring_parse_error_message() {
        let err = Error::new_netstring();
        assert!(err.is_parse());
        assert_eq!(
            err.message().to_string(),
            "malformed netstring on redirector pipe"
        );
    }
}
