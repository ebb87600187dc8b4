//! The request value handed to application code.

use std::any::Any;
use std::collections::HashMap;
use std::time::Instant;

use percent_encoding::percent_decode_str;

use crate::body::Body;
use crate::error::{Error, HeadPart, Result};
use crate::headers::Headers;
use crate::route::Method;

/// HTTP protocol version of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_1_0: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_1_1: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Parse a version token like `HTTP/1.1` or `HTTP/2`.
    pub fn parse(token: &str) -> Result<HttpVersion> {
        let fail = || Error::Parse {
            part: HeadPart::RequestLine,
            byte: token.as_bytes().last().copied().unwrap_or(0),
            prev: None,
            pos: 0,
        };
        let rest = token.strip_prefix("HTTP/").ok_or_else(fail)?;
        let (major, minor) = match rest.split_once('.') {
            Some((ma, mi)) => (ma, Some(mi)),
            None => (rest, None),
        };
        let major: u8 = major.parse().map_err(|_| fail())?;
        let minor: u8 = match minor {
            Some(mi) => mi.parse().map_err(|_| fail())?,
            None => 0,
        };
        Ok(HttpVersion { major, minor })
    }

    pub fn is_at_least(&self, other: HttpVersion) -> bool {
        *self >= other
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// The pre-parsed request-target: raw and percent-decoded segment
/// sequences plus the raw query string.
///
/// Decoding applies to lookup segments only, never to raw match
/// parameters.
#[derive(Debug, Clone)]
pub struct Target {
    path: String,
    query: Option<String>,
    raw_segments: Vec<String>,
    decoded_segments: Vec<String>,
}

impl Target {
    pub fn parse(target: &str) -> Target {
        let no_fragment = match target.split_once('#') {
            Some((t, _)) => t,
            None => target,
        };
        let (path, query) = match no_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (no_fragment, None),
        };
        let raw_segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let decoded_segments = raw_segments
            .iter()
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect();
        Target {
            path: path.to_string(),
            query,
            raw_segments,
            decoded_segments,
        }
    }

    /// Path component exactly as received.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query component exactly as received, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn raw_segments(&self) -> &[String] {
        &self.raw_segments
    }

    pub fn decoded_segments(&self) -> &[String] {
        &self.decoded_segments
    }
}

/// Exchange-scoped attribute store for passing state between actions and
/// the handler.
#[derive(Default)]
pub struct Attributes {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn set(&mut self, name: impl Into<String>, value: impl Any + Send + Sync) {
        self.map.insert(name.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.map.get(name).and_then(|v| v.downcast_ref())
    }

    pub fn take<T: Any>(&mut self, name: &str) -> Option<Box<T>> {
        let v = self.map.remove(name)?;
        match v.downcast() {
            Ok(t) => Some(t),
            Err(v) => {
                self.map.insert(name.to_string(), v);
                None
            }
        }
    }
}

/// One parsed request. Head data is immutable for the exchange; the body
/// is consumed through `body_mut`, attributes carry cross-callback state.
pub struct Request {
    method: Method,
    method_token: String,
    target: Target,
    version: HttpVersion,
    headers: Headers,
    body: Option<Body>,
    attributes: Attributes,
    head_started: Instant,
}

impl Request {
    pub(crate) fn new(
        method_token: String,
        target: Target,
        version: HttpVersion,
        headers: Headers,
        body: Body,
        head_started: Instant,
    ) -> Request {
        Request {
            method: Method::from_bytes(method_token.as_bytes()),
            method_token,
            target,
            version,
            headers,
            body: Some(body),
            attributes: Attributes::default(),
            head_started,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The method token as sent, also for methods the engine has no name
    /// for.
    pub fn method_token(&self) -> &str {
        &self.method_token
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        self.body.as_ref().expect("body taken only at exchange end")
    }

    pub fn body_mut(&mut self) -> &mut Body {
        self.body.as_mut().expect("body taken only at exchange end")
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// When the first byte of the request line arrived.
    pub fn head_started(&self) -> Instant {
        self.head_started
    }

    pub(crate) fn take_body(&mut self) -> Body {
        self.body.take().expect("body taken only once")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tokens() {
        assert_eq!(HttpVersion::parse("HTTP/1.1").unwrap(), HttpVersion::HTTP_1_1);
        assert_eq!(
            HttpVersion::parse("HTTP/0.9").unwrap(),
            HttpVersion { major: 0, minor: 9 }
        );
        assert_eq!(
            HttpVersion::parse("HTTP/2").unwrap(),
            HttpVersion { major: 2, minor: 0 }
        );
        assert!(HttpVersion::parse("ICY/1.1").is_err());
        assert!(HttpVersion::parse("HTTP/one").is_err());
    }

    #[test]
    fn version_ordering() {
        assert!(HttpVersion::HTTP_1_1.is_at_least(HttpVersion::HTTP_1_0));
        assert!(!HttpVersion { major: 0, minor: 9 }.is_at_least(HttpVersion::HTTP_1_0));
    }

    #[test]
    fn target_segments_raw_and_decoded() {
        let t = Target::parse("/a%20b/c?x=1&y=2");
        assert_eq!(t.path(), "/a%20b/c");
        assert_eq!(t.query(), Some("x=1&y=2"));
        assert_eq!(t.raw_segments(), &["a%20b".to_string(), "c".to_string()]);
        assert_eq!(t.decoded_segments(), &["a b".to_string(), "c".to_string()]);
    }

    #[test]
    fn target_root() {
        let t = Target::parse("/");
        assert!(t.raw_segments().is_empty());
        assert_eq!(t.path(), "/");
        assert_eq!(t.query(), None);
    }

    #[test]
    fn attributes_typed_roundtrip() {
        let mut a = Attributes::default();
        a.set("n", 42u32);
        assert_eq!(a.get::<u32>("n"), Some(&42));
        assert_eq!(a.get::<String>("n"), None);
        assert_eq!(*a.take::<u32>("n").unwrap(), 42);
        assert!(a.get::<u32>("n").is_none());
    }
}
