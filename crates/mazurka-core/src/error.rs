use std::io;

use thiserror::Error;

/// Which token stream a parse failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPart {
    RequestLine,
    Headers,
    Trailers,
    ChunkFrame,
}

impl std::fmt::Display for HeadPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HeadPart::RequestLine => "request-line",
            HeadPart::Headers => "headers",
            HeadPart::Trailers => "trailers",
            HeadPart::ChunkFrame => "chunk frame",
        };
        f.write_str(s)
    }
}

/// Why the channel writer refused a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The writer was dismissed at the end of the exchange.
    Dismissed,
    /// A final response was already written for this exchange.
    AlreadyFinal,
    /// A previous `write` call has not completed.
    InFlight,
    /// An interim response cannot be delivered to this client's protocol version.
    ProtocolNotSupported,
    /// The exchange ended without any final response being produced.
    NotFinal,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rejection::Dismissed => "writer dismissed",
            Rejection::AlreadyFinal => "final response already written",
            Rejection::InFlight => "previous write still in flight",
            Rejection::ProtocolNotSupported => "interim response not supported by client protocol",
            Rejection::NotFinal => "exchange produced no final response",
        };
        f.write_str(s)
    }
}

/// Everything that can go wrong while serving one exchange.
///
/// Each variant maps to a default response status through [`Error::status_code`];
/// the default error handler uses that mapping when the application's own
/// handlers delegate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed {part}: byte {byte:#04x} (previous {prev:?}) at offset {pos}")]
    Parse {
        part: HeadPart,
        byte: u8,
        prev: Option<u8>,
        pos: u64,
    },

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request trailers exceed {limit} bytes")]
    TrailersTooLarge { limit: usize },

    #[error("HTTP version {0} is too old")]
    VersionTooOld(String),

    #[error("HTTP version {0} is not supported")]
    VersionTooNew(String),

    #[error("request body not allowed: {0}")]
    IllegalRequestBody(&'static str),

    #[error("response body not allowed: {0}")]
    IllegalResponseBody(&'static str),

    #[error("illegal response header: {0}")]
    IllegalHeader(String),

    #[error("Content-Length {declared} does not match actual body length {actual}")]
    MismatchedLength { declared: u64, actual: u64 },

    #[error("response rejected: {0}")]
    ResponseRejected(Rejection),

    #[error("no route matches {0}")]
    NoRouteFound(String),

    #[error("method {method} not allowed here")]
    MethodNotAllowed { method: String },

    #[error("end of stream while bytes were still expected")]
    EndOfStream,

    /// The client disconnected before sending the first byte of a request
    /// head. Ends the exchange silently, no response is attempted.
    #[error("client aborted before sending a request")]
    ClientAborted,

    #[error("idle connection timed out")]
    TimeoutIdleConnection,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

impl Error {
    /// The status code the default error handler responds with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Parse { .. } => 400,
            Error::HeadTooLarge { .. } => 413,
            Error::TrailersTooLarge { .. } => 413,
            Error::VersionTooOld(_) => 426,
            Error::VersionTooNew(_) => 505,
            Error::IllegalRequestBody(_) => 400,
            Error::IllegalResponseBody(_) => 500,
            Error::IllegalHeader(_) => 500,
            Error::MismatchedLength { .. } => 500,
            Error::ResponseRejected(_) => 500,
            Error::NoRouteFound(_) => 404,
            Error::MethodNotAllowed { .. } => 405,
            Error::TimeoutIdleConnection => 408,
            Error::EndOfStream => 400,
            Error::ClientAborted | Error::ChannelClosed | Error::Read(_) | Error::Write(_) => 500,
        }
    }

    /// Whether the read stream can no longer be trusted to be on a message
    /// boundary. The default handler closes the connection for these.
    pub fn corrupts_request_stream(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. }
                | Error::HeadTooLarge { .. }
                | Error::TrailersTooLarge { .. }
                | Error::EndOfStream
                | Error::TimeoutIdleConnection
                | Error::ChannelClosed
                | Error::Read(_)
                | Error::Write(_)
        )
    }

    /// Whether the exchange must end without attempting any response.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ClientAborted | Error::ChannelClosed | Error::Read(_) | Error::Write(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
