//! Response delimiting: Content-Length vs. chunked vs. connection-close.
//!
//! The framer runs against each response just before its bytes are written.
//! It rewrites the response into a wire-compliant form, rejects illegal
//! header/body combinations, and tells the writer how the connection is to
//! be treated afterwards.

use tracing::debug;

use crate::error::{Error, Result};
use crate::request::HttpVersion;
use crate::response::{Response, TrailersProducer};
use crate::route::Method;

/// Per-exchange facts the framer needs besides the response itself.
#[derive(Debug, Clone, Copy)]
pub struct FrameInputs {
    /// Effective HTTP version of the exchange.
    pub version: HttpVersion,
    /// Request method, when a request was parsed at all.
    pub method: Option<Method>,
    /// The request carried `Connection: close`.
    pub request_close: bool,
    /// The read half is shut or has seen EOS.
    pub input_shut: bool,
    /// The server is stopping.
    pub server_stopping: bool,
}

/// A response ready for the wire.
pub struct Framed {
    pub response: Response,
    /// Body byte windows, already chunk-encoded when `chunked`.
    pub body: Box<dyn Iterator<Item = Vec<u8>> + Send>,
    pub chunked: bool,
    /// Shut the output stream down after this response.
    pub close_connection: bool,
    /// Fully close the connection after this response.
    pub close_channel: bool,
}

/// Framing state carried across all responses of one connection.
pub struct Framer {
    max_unsuccessful: u32,
    unsuccessful: u32,
    /// An earlier response in this connection carried `Connection: close`.
    prior_close: bool,
    scheduled_close: Option<String>,
}

impl Framer {
    pub fn new(max_unsuccessful: u32) -> Self {
        Framer {
            max_unsuccessful,
            unsuccessful: 0,
            prior_close: false,
            scheduled_close: None,
        }
    }

    /// Ask for `Connection: close` on the next final response, with an
    /// output shutdown after it.
    pub fn schedule_close(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.scheduled_close.is_none() {
            debug!(%reason, "connection close scheduled");
            self.scheduled_close = Some(reason);
        }
    }

    pub fn close_scheduled(&self) -> bool {
        self.scheduled_close.is_some()
    }

    /// Apply all transformations and validations to one response.
    pub fn frame(&mut self, mut response: Response, inputs: &FrameInputs) -> Result<Framed> {
        let version = inputs.version;

        // 1. HTTP/1.0 auto-close on final responses.
        if response.is_final()
            && version < HttpVersion::HTTP_1_1
            && !response.headers().connection_close()
        {
            response.headers_mut().add("Connection", "close");
        }

        // 2. Chunked decision.
        let mut chunked = false;
        let wants_chunked = version >= HttpVersion::HTTP_1_1
            && (response.trailers().is_some() || response.body().length().is_none());
        let te_present = response.headers().contains("Transfer-Encoding");
        if te_present && !response.headers().transfer_encoding_chunked() {
            return Err(Error::IllegalHeader(
                "Transfer-Encoding with an unsupported coding".into(),
            ));
        }
        if wants_chunked {
            if !te_present {
                response.headers_mut().add("Transfer-Encoding", "chunked");
            }
            chunked = true;
        } else if te_present {
            // the application framed it chunked on its own
            chunked = true;
        } else if version < HttpVersion::HTTP_1_1 && response.trailers().is_some() {
            debug!("dropping response trailers for an HTTP/1.0 exchange");
            response.drop_trailers();
        }

        // A body of unknown length that cannot be chunk-encoded is
        // delimited by closing the connection.
        let close_delimited = !chunked && response.body().length().is_none();
        if close_delimited {
            response.headers_mut().add_if_absent("Connection", "close");
        }

        // 3. Connection-close propagation.
        if response.headers().connection_close() {
            self.prior_close = true;
        }
        if response.is_final()
            && (self.prior_close
                || inputs.request_close
                || inputs.input_shut
                || inputs.server_stopping
                || self.scheduled_close.is_some())
        {
            response.headers_mut().add_if_absent("Connection", "close");
            self.prior_close = true;
        }

        // 4. Unsuccessful tracking.
        let mut close_channel = false;
        if response.is_final() {
            if response.is_unsuccessful() {
                self.unsuccessful += 1;
                if self.unsuccessful >= self.max_unsuccessful {
                    debug!(
                        count = self.unsuccessful,
                        "too many unsuccessful responses, closing the connection"
                    );
                    close_channel = true;
                }
            } else {
                self.unsuccessful = 0;
            }
        }

        // 5. Framing validation per RFC 7230 §3.3.
        self.validate(&mut response, inputs, chunked, close_delimited)?;

        let close_connection =
            close_delimited || (response.is_final() && response.headers().connection_close());

        let body: Box<dyn Iterator<Item = Vec<u8>> + Send> = if chunked {
            Box::new(ChunkedEncoder::new(
                response.body().windows(),
                response.trailers().cloned(),
            ))
        } else {
            response.body().windows()
        };

        Ok(Framed {
            response,
            body,
            chunked,
            close_connection,
            close_channel,
        })
    }

    fn validate(
        &self,
        response: &mut Response,
        inputs: &FrameInputs,
        chunked: bool,
        close_delimited: bool,
    ) -> Result<()> {
        let status = response.status();
        let informational = !response.is_final();
        let no_body_status = informational || status == 204;
        let body_len = response.body().length();
        let body_empty = body_len == Some(0);
        let connect_2xx =
            inputs.method == Some(Method::Connect) && (200..300).contains(&status);

        if chunked && no_body_status {
            return Err(Error::IllegalHeader(
                "Transfer-Encoding on a response that cannot carry a body".into(),
            ));
        }
        let declared = response
            .headers()
            .content_length()
            .map_err(|_| Error::IllegalHeader("malformed Content-Length".into()))?;
        if chunked && declared.is_some() {
            return Err(Error::IllegalHeader(
                "Transfer-Encoding together with Content-Length".into(),
            ));
        }
        if inputs.method == Some(Method::Head) && !body_empty {
            return Err(Error::IllegalResponseBody("HEAD response must be empty"));
        }
        if status == 304 && !body_empty {
            return Err(Error::IllegalResponseBody("304 response must be empty"));
        }
        if let Some(declared) = declared {
            if no_body_status {
                return if body_empty {
                    Err(Error::IllegalHeader(
                        "Content-Length on a response that cannot carry a body".into(),
                    ))
                } else {
                    Err(Error::IllegalResponseBody(
                        "body on a response that cannot carry one",
                    ))
                };
            }
            if connect_2xx {
                return Err(Error::IllegalHeader(
                    "Content-Length on a 2xx response to CONNECT".into(),
                ));
            }
            if let Some(actual) = body_len
                && declared != actual
            {
                return Err(Error::MismatchedLength { declared, actual });
            }
        } else if !chunked && !close_delimited {
            // no framing header at all
            match body_len {
                Some(0) => {
                    if !no_body_status && !connect_2xx {
                        response.headers_mut().add("Content-Length", "0");
                    }
                }
                Some(actual) => {
                    if no_body_status {
                        return Err(Error::IllegalResponseBody(
                            "body on a response that cannot carry one",
                        ));
                    }
                    response
                        .headers_mut()
                        .add("Content-Length", actual.to_string());
                }
                None => unreachable!("unknown length is chunked or close-delimited"),
            }
        } else if close_delimited && no_body_status {
            return Err(Error::IllegalResponseBody(
                "body on a response that cannot carry one",
            ));
        }
        Ok(())
    }
}

/// Chunk-encodes body windows on the way out.
///
/// Every non-empty window becomes `<lowercase-hex-size>CRLF <bytes> CRLF`;
/// the end is `0 CRLF`, the trailer block if any, then a bare `CRLF`.
pub struct ChunkedEncoder {
    inner: Box<dyn Iterator<Item = Vec<u8>> + Send>,
    trailers: Option<TrailersProducer>,
    finished: bool,
}

impl ChunkedEncoder {
    pub fn new(
        inner: Box<dyn Iterator<Item = Vec<u8>> + Send>,
        trailers: Option<TrailersProducer>,
    ) -> Self {
        ChunkedEncoder {
            inner,
            trailers,
            finished: false,
        }
    }

    fn terminator(&mut self) -> Vec<u8> {
        let mut out = Vec::from(&b"0\r\n"[..]);
        if let Some(producer) = self.trailers.take() {
            for (name, value) in producer().iter() {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl Iterator for ChunkedEncoder {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(window) if window.is_empty() => continue,
                Some(window) => {
                    let mut out = format!("{:x}\r\n", window.len()).into_bytes();
                    out.extend_from_slice(&window);
                    out.extend_from_slice(b"\r\n");
                    return Some(out);
                }
                None => {
                    self.finished = true;
                    return Some(self.terminator());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;

    fn inputs_11() -> FrameInputs {
        FrameInputs {
            version: HttpVersion::HTTP_1_1,
            method: Some(Method::Get),
            request_close: false,
            input_shut: false,
            server_stopping: false,
        }
    }

    fn framer() -> Framer {
        Framer::new(7)
    }

    fn collect(body: Box<dyn Iterator<Item = Vec<u8>> + Send>) -> Vec<u8> {
        body.flatten().collect()
    }

    #[test]
    fn known_length_gets_content_length() {
        let f = framer().frame(Response::ok("world"), &inputs_11()).unwrap();
        assert_eq!(f.response.headers().get("Content-Length"), Some("5"));
        assert!(!f.chunked);
        assert!(!f.close_connection);
        assert_eq!(collect(f.body), b"world");
    }

    #[test]
    fn empty_body_gets_content_length_zero() {
        let f = framer().frame(Response::new(200), &inputs_11()).unwrap();
        assert_eq!(f.response.headers().get("Content-Length"), Some("0"));
    }

    #[test]
    fn existing_content_length_zero_left_alone() {
        let r = Response::new(200).with_header("Content-Length", "0");
        let f = framer().frame(r, &inputs_11()).unwrap();
        let cls: Vec<_> = f.response.headers().get_all("Content-Length").collect();
        assert_eq!(cls, vec!["0"]);
    }

    #[test]
    fn http_1_0_final_gets_auto_close() {
        let mut inputs = inputs_11();
        inputs.version = HttpVersion::HTTP_1_0;
        let f = framer().frame(Response::new(200), &inputs).unwrap();
        assert!(f.response.headers().connection_close());
        assert!(f.close_connection);
    }

    #[test]
    fn unknown_length_is_chunked_on_1_1() {
        let r = Response::stream(|| vec![b"ab".to_vec(), b"c".to_vec()].into_iter());
        let f = framer().frame(r, &inputs_11()).unwrap();
        assert!(f.chunked);
        assert_eq!(
            f.response.headers().get("Transfer-Encoding"),
            Some("chunked")
        );
        assert_eq!(collect(f.body), b"2\r\nab\r\n1\r\nc\r\n0\r\n\r\n");
    }

    #[test]
    fn unknown_length_on_1_0_is_close_delimited() {
        let r = Response::stream(|| vec![b"ab".to_vec()].into_iter());
        let mut inputs = inputs_11();
        inputs.version = HttpVersion::HTTP_1_0;
        let f = framer().frame(r, &inputs).unwrap();
        assert!(!f.chunked);
        assert!(f.close_connection);
        assert!(!f.response.headers().contains("Transfer-Encoding"));
        assert!(!f.response.headers().contains("Content-Length"));
        assert_eq!(collect(f.body), b"ab");
    }

    #[test]
    fn trailers_force_chunked_and_are_emitted() {
        let r = Response::ok("hi").with_trailers(|| {
            let mut t = Headers::new();
            t.add("X-Checksum", "abc");
            t
        });
        let f = framer().frame(r, &inputs_11()).unwrap();
        assert!(f.chunked);
        assert_eq!(
            collect(f.body),
            b"2\r\nhi\r\n0\r\nX-Checksum: abc\r\n\r\n"
        );
    }

    #[test]
    fn trailers_dropped_for_1_0() {
        let r = Response::ok("hi").with_trailers(Headers::new);
        let mut inputs = inputs_11();
        inputs.version = HttpVersion::HTTP_1_0;
        let f = framer().frame(r, &inputs).unwrap();
        assert!(!f.chunked);
        assert!(f.response.trailers().is_none());
    }

    #[test]
    fn foreign_transfer_coding_rejected() {
        let r = Response::ok("x").with_header("Transfer-Encoding", "gzip");
        assert!(matches!(
            framer().frame(r, &inputs_11()),
            Err(Error::IllegalHeader(_))
        ));
    }

    #[test]
    fn transfer_encoding_with_content_length_rejected() {
        let r = Response::stream(|| std::iter::once(b"x".to_vec()))
            .with_header("Content-Length", "1");
        assert!(matches!(
            framer().frame(r, &inputs_11()),
            Err(Error::IllegalHeader(_))
        ));
    }

    #[test]
    fn head_with_body_rejected() {
        let mut inputs = inputs_11();
        inputs.method = Some(Method::Head);
        assert!(matches!(
            framer().frame(Response::ok("abc"), &inputs),
            Err(Error::IllegalResponseBody(_))
        ));
    }

    #[test]
    fn not_modified_with_body_rejected() {
        let r = Response::new(304).with_body("abc");
        assert!(matches!(
            framer().frame(r, &inputs_11()),
            Err(Error::IllegalResponseBody(_))
        ));
    }

    #[test]
    fn content_length_on_204_rejected() {
        let r = Response::new(204).with_header("Content-Length", "0");
        assert!(matches!(
            framer().frame(r, &inputs_11()),
            Err(Error::IllegalHeader(_))
        ));
    }

    #[test]
    fn mismatched_content_length_rejected() {
        let r = Response::new(200)
            .with_header("Content-Length", "5")
            .with_body("abcd");
        assert!(matches!(
            framer().frame(r, &inputs_11()),
            Err(Error::MismatchedLength {
                declared: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn content_length_on_connect_2xx_rejected() {
        let mut inputs = inputs_11();
        inputs.method = Some(Method::Connect);
        let r = Response::new(200).with_header("Content-Length", "0");
        assert!(matches!(
            framer().frame(r, &inputs),
            Err(Error::IllegalHeader(_))
        ));
        // and no Content-Length is synthesized either
        let f = framer().frame(Response::new(200), &inputs).unwrap();
        assert!(!f.response.headers().contains("Content-Length"));
    }

    #[test]
    fn close_propagates_to_later_finals() {
        let mut f = framer();
        let first = Response::new(200).with_header("Connection", "close");
        let framed = f.frame(first, &inputs_11()).unwrap();
        assert!(framed.close_connection);
        let second = f.frame(Response::new(200), &inputs_11()).unwrap();
        assert!(second.response.headers().connection_close());
    }

    #[test]
    fn request_close_is_echoed() {
        let mut inputs = inputs_11();
        inputs.request_close = true;
        let f = framer().frame(Response::new(200), &inputs).unwrap();
        assert!(f.response.headers().connection_close());
        assert!(f.close_connection);
    }

    #[test]
    fn scheduled_close_is_applied() {
        let mut f = framer();
        f.schedule_close("maintenance");
        let framed = f.frame(Response::new(200), &inputs_11()).unwrap();
        assert!(framed.response.headers().connection_close());
    }

    #[test]
    fn unsuccessful_responses_trip_channel_close() {
        let mut f = Framer::new(3);
        for i in 0..2 {
            let framed = f.frame(Response::new(500), &inputs_11()).unwrap();
            assert!(!framed.close_channel, "attempt {i}");
        }
        let framed = f.frame(Response::new(500), &inputs_11()).unwrap();
        assert!(framed.close_channel);
    }

    #[test]
    fn successful_response_resets_the_counter() {
        let mut f = Framer::new(2);
        assert!(!f.frame(Response::new(500), &inputs_11()).unwrap().close_channel);
        assert!(!f.frame(Response::new(200), &inputs_11()).unwrap().close_channel);
        assert!(!f.frame(Response::new(500), &inputs_11()).unwrap().close_channel);
        assert!(f.frame(Response::new(500), &inputs_11()).unwrap().close_channel);
    }

    #[test]
    fn framing_twice_is_a_no_op() {
        let mut f = framer();
        let once = f.frame(Response::ok("hello"), &inputs_11()).unwrap();
        let head_once: Vec<(String, String)> = once
            .response
            .headers()
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        let body_once = collect(once.body);

        let twice = f.frame(once.response, &inputs_11()).unwrap();
        let head_twice: Vec<(String, String)> = twice
            .response
            .headers()
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        assert_eq!(head_once, head_twice);
        assert_eq!(body_once, collect(twice.body));
    }

    #[test]
    fn framing_chunked_twice_is_a_no_op() {
        let mut f = framer();
        let r = Response::stream(|| vec![b"ab".to_vec()].into_iter());
        let once = f.frame(r, &inputs_11()).unwrap();
        let body_once = collect(f.frame(once.response, &inputs_11()).unwrap().body);
        assert_eq!(body_once, b"2\r\nab\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_round_trip() {
        use crate::body::Body as RequestBody;
        use crate::reader::ChannelReader;
        use crate::reader::test_support::Scripted;

        let original: Vec<Vec<u8>> = vec![b"ab".to_vec(), vec![], b"cdef".to_vec(), b"g".to_vec()];
        let encoder = ChunkedEncoder::new(Box::new(original.clone().into_iter()), None);
        let wire: Vec<u8> = encoder.flatten().collect();

        // feed the encoded stream through the request-side decoder
        let wire: &'static [u8] = wire.leak();
        let reader = ChannelReader::new(Scripted::new([wire]));
        let mut body = RequestBody::chunked(reader, 8000);
        let decoded = body.bytes().unwrap();
        let flat: Vec<u8> = original.into_iter().flatten().collect();
        assert_eq!(decoded, flat);
    }
}
