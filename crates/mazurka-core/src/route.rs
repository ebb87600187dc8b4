//! Routes, patterns and the application callback traits.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

/// One segment of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Matches exactly this literal.
    Static(String),
    /// `:name` — matches any single segment and binds it.
    Param(String),
    /// `*name` — matches and binds all remaining segments. Only valid last.
    CatchAll(String),
}

impl Segment {
    /// The trie key this segment is stored under.
    pub fn key(&self) -> &str {
        match self {
            Segment::Static(s) => s,
            Segment::Param(_) => ":",
            Segment::CatchAll(_) => "*",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty segment in pattern {0}")]
    EmptySegment(String),
    #[error("catch-all must be the last segment in {0}")]
    CatchAllNotLast(String),
    #[error("duplicate parameter name {0}")]
    DuplicateName(String),
}

/// A parsed route or action pattern like `/users/:id/files/*path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> std::result::Result<Pattern, PatternError> {
        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            let seg = if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(PatternError::EmptySegment(pattern.to_string()));
                }
                names.push(name);
                Segment::Param(name.to_string())
            } else if let Some(name) = part.strip_prefix('*') {
                if name.is_empty() {
                    return Err(PatternError::EmptySegment(pattern.to_string()));
                }
                if i + 1 != parts.len() {
                    return Err(PatternError::CatchAllNotLast(pattern.to_string()));
                }
                names.push(name);
                Segment::CatchAll(name.to_string())
            } else {
                Segment::Static(part.to_string())
            };
            segments.push(seg);
        }
        for (i, n) in names.iter().enumerate() {
            if names[..i].contains(n) {
                return Err(PatternError::DuplicateName(n.to_string()));
            }
        }
        Ok(Pattern {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn ends_in_catch_all(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::CatchAll(_)))
    }

    /// Bind this pattern's parameters against the request segments. The
    /// caller has already established that the pattern matches.
    ///
    /// A catch-all that consumed nothing binds `/`; otherwise the remainder
    /// segments are joined with `/` separators.
    pub fn bind(&self, raw_segments: &[String], decoded_segments: &[String]) -> Params {
        let mut raw = HashMap::new();
        let mut decoded = HashMap::new();
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Static(_) => {}
                Segment::Param(name) => {
                    if let (Some(r), Some(d)) = (raw_segments.get(i), decoded_segments.get(i)) {
                        raw.insert(name.clone(), r.clone());
                        decoded.insert(name.clone(), d.clone());
                    }
                }
                Segment::CatchAll(name) => {
                    let join = |segs: &[String]| {
                        if segs.len() <= i {
                            "/".to_string()
                        } else {
                            segs[i..].join("/")
                        }
                    };
                    raw.insert(name.clone(), join(raw_segments));
                    decoded.insert(name.clone(), join(decoded_segments));
                }
            }
        }
        Params { raw, decoded }
    }
}

/// Parameters bound from a matched pattern.
///
/// Maps are empty unless the pattern contained `:name` or `*name` segments.
#[derive(Debug, Clone, Default)]
pub struct Params {
    raw: HashMap<String, String>,
    decoded: HashMap<String, String>,
}

impl Params {
    /// Percent-decoded parameter value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.decoded.get(name).map(String::as_str)
    }

    /// Parameter value exactly as it appeared on the wire.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.raw.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.decoded.is_empty()
    }
}

/// Application request handler for one method of a route.
pub trait Handler: Send + Sync {
    fn handle(&self, req: &mut Request, params: &Params) -> Result<Response>;
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &Params) -> Result<Response> + Send + Sync,
{
    fn handle(&self, req: &mut Request, params: &Params) -> Result<Response> {
        self(req, params)
    }
}

/// Runs before the route handler. Returning a response short-circuits the
/// chain and the handler.
pub trait BeforeAction: Send + Sync {
    fn apply(&self, req: &mut Request, params: &Params) -> Result<Option<Response>>;
}

impl<F> BeforeAction for F
where
    F: Fn(&mut Request, &Params) -> Result<Option<Response>> + Send + Sync,
{
    fn apply(&self, req: &mut Request, params: &Params) -> Result<Option<Response>> {
        self(req, params)
    }
}

/// Runs against each response just before it is framed; may substitute a
/// different response.
pub trait AfterAction: Send + Sync {
    fn apply(&self, params: &Params, response: Response) -> Result<Response>;
}

impl<F> AfterAction for F
where
    F: Fn(&Params, Response) -> Result<Response> + Send + Sync,
{
    fn apply(&self, params: &Params, response: Response) -> Result<Response> {
        self(params, response)
    }
}

/// Translates an exchange error into a response, or delegates to the next
/// handler in the chain by returning the error.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &crate::error::Error, req: Option<&mut Request>) -> Result<Response>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&crate::error::Error, Option<&mut Request>) -> Result<Response> + Send + Sync,
{
    fn handle(&self, error: &crate::error::Error, req: Option<&mut Request>) -> Result<Response> {
        self(error, req)
    }
}

/// A resource: one pattern, one handler per method.
pub struct Route {
    pattern: Pattern,
    handlers: HashMap<Method, Arc<dyn Handler>>,
}

impl Route {
    pub fn new(pattern: &str) -> std::result::Result<Route, PatternError> {
        Ok(Route {
            pattern: Pattern::parse(pattern)?,
            handlers: HashMap::new(),
        })
    }

    pub fn on(mut self, method: Method, handler: impl Handler + 'static) -> Route {
        self.handlers.insert(method, Arc::new(handler));
        self
    }

    pub fn get(self, handler: impl Handler + 'static) -> Route {
        self.on(Method::Get, handler)
    }

    pub fn post(self, handler: impl Handler + 'static) -> Route {
        self.on(Method::Post, handler)
    }

    pub fn put(self, handler: impl Handler + 'static) -> Route {
        self.on(Method::Put, handler)
    }

    pub fn delete(self, handler: impl Handler + 'static) -> Route {
        self.on(Method::Delete, handler)
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn handler(&self, method: Method) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = Method> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.raw)
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
