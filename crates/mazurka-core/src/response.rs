//! The response value produced by application code.

use std::sync::Arc;

use crate::headers::Headers;

/// Response body: nothing, bytes, or a lazily produced stream of byte
/// windows whose total length may be unknown.
///
/// Stream bodies are restartable: the supplier is invoked once per write
/// attempt, so framing a response is free of side effects.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream {
        supplier: Box<dyn Fn() -> Box<dyn Iterator<Item = Vec<u8>> + Send> + Send + Sync>,
        /// Declared total length; `None` means unknown.
        length: Option<u64>,
    },
}

impl Body {
    /// Declared length. `None` is unknown and forces chunked delimiting on
    /// HTTP/1.1.
    pub fn length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }

    pub fn is_known_empty(&self) -> bool {
        self.length() == Some(0)
    }

    /// Start one pass over the body's byte windows.
    pub fn windows(&self) -> Box<dyn Iterator<Item = Vec<u8>> + Send> {
        match self {
            Body::Empty => Box::new(std::iter::empty()),
            Body::Bytes(b) => {
                let b = b.clone();
                if b.is_empty() {
                    Box::new(std::iter::empty())
                } else {
                    Box::new(std::iter::once(b))
                }
            }
            Body::Stream { supplier, .. } => supplier(),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length {length:?})"),
        }
    }
}

/// Producer for the trailer block of a chunked response. Invoked after the
/// last body window has been written.
pub type TrailersProducer = Arc<dyn Fn() -> Headers + Send + Sync>;

pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: Headers,
    body: Body,
    trailers: Option<TrailersProducer>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            reason: None,
            headers: Headers::new(),
            body: Body::Empty,
            trailers: None,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Response::new(200).with_body(body.into())
    }

    pub fn text(body: impl Into<String>) -> Self {
        Response::new(200)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn no_content() -> Self {
        Response::new(204)
    }

    pub fn bad_request() -> Self {
        Response::new(400)
    }

    pub fn not_found() -> Self {
        Response::new(404)
    }

    pub fn internal_error() -> Self {
        Response::new(500)
    }

    pub fn r#continue() -> Self {
        Response::new(100)
    }

    /// A streaming body of unknown length; delimited with chunked framing
    /// on HTTP/1.1.
    pub fn stream<I, F>(supplier: F) -> Self
    where
        I: Iterator<Item = Vec<u8>> + Send + 'static,
        F: Fn() -> I + Send + Sync + 'static,
    {
        Response::new(200).with_stream(supplier, None)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = body.into();
        self.body = if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(bytes)
        };
        self
    }

    pub fn with_stream<I, F>(mut self, supplier: F, length: Option<u64>) -> Self
    where
        I: Iterator<Item = Vec<u8>> + Send + 'static,
        F: Fn() -> I + Send + Sync + 'static,
    {
        self.body = Body::Stream {
            supplier: Box::new(move || Box::new(supplier())),
            length,
        };
        self
    }

    pub fn with_trailers(mut self, producer: impl Fn() -> Headers + Send + Sync + 'static) -> Self {
        self.trailers = Some(Arc::new(producer));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status))
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn trailers(&self) -> Option<&TrailersProducer> {
        self.trailers.as_ref()
    }

    pub(crate) fn drop_trailers(&mut self) {
        self.trailers = None;
    }

    /// Interim responses (1xx) do not conclude the exchange.
    pub fn is_final(&self) -> bool {
        !(100..200).contains(&self.status)
    }

    /// Client or server error family.
    pub fn is_unsuccessful(&self) -> bool {
        (400..600).contains(&self.status)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .finish()
    }
}

/// Default reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
