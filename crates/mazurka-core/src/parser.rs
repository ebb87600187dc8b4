//! Request-line and header parsers.
//!
//! Both consume one byte at a time from the channel reader, accept `LF` and
//! `CRLF` line terminators equally (a bare `CR` is discarded unless followed
//! by `LF`), and count every byte against a size budget. On any parse
//! failure the input stream is shut down, because the message framing can no
//! longer be trusted.

use std::time::Instant;

use crate::error::{Error, HeadPart, Result};
use crate::headers::Headers;
use crate::reader::ChannelReader;

const SP: u8 = b' ';
const HTAB: u8 = b'\t';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Parsed first line of a request head.
#[derive(Debug)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Bytes consumed, including the terminator.
    pub length: usize,
    pub started: Instant,
}

/// Byte feed with budget accounting and error context.
struct Feed<'r> {
    reader: &'r mut ChannelReader,
    part: HeadPart,
    max: usize,
    count: usize,
    prev: Option<u8>,
    cur: Option<u8>,
}

impl<'r> Feed<'r> {
    fn new(reader: &'r mut ChannelReader, part: HeadPart, max: usize) -> Self {
        Feed {
            reader,
            part,
            max,
            count: 0,
            prev: None,
            cur: None,
        }
    }

    /// Next byte, `None` at EOS. Budget overrun shuts the input down and
    /// fails with the size error for this head part.
    fn next_byte(&mut self) -> Result<Option<u8>> {
        let b = match self.reader.next()? {
            None => return Ok(None),
            Some(mut view) => match view.read_u8() {
                Some(b) => b,
                None => return Ok(None),
            },
        };
        self.count += 1;
        if self.count > self.max {
            self.reader.shutdown_input();
            return Err(match self.part {
                HeadPart::Trailers => Error::TrailersTooLarge { limit: self.max },
                _ => Error::HeadTooLarge { limit: self.max },
            });
        }
        self.prev = self.cur;
        self.cur = Some(b);
        Ok(Some(b))
    }

    fn fail(&mut self) -> Error {
        self.reader.shutdown_input();
        Error::Parse {
            part: self.part,
            byte: self.cur.unwrap_or(0),
            prev: self.prev,
            pos: self.count.saturating_sub(1) as u64,
        }
    }

    fn unexpected_eos(&mut self) -> Error {
        self.reader.shutdown_input();
        Error::EndOfStream
    }
}

/// The byte classes a line-oriented parser reacts to.
enum Token {
    Newline,
    Byte(u8),
}

/// Fold `CR`/`LF` handling into a token stream: `CRLF` and bare `LF` are a
/// newline, a `CR` not followed by `LF` is discarded.
fn next_token(feed: &mut Feed<'_>, pending_cr: &mut bool) -> Result<Option<Token>> {
    loop {
        let b = match feed.next_byte()? {
            Some(b) => b,
            None => return Ok(None),
        };
        if *pending_cr {
            *pending_cr = false;
            if b == LF {
                return Ok(Some(Token::Newline));
            }
            if b == CR {
                *pending_cr = true;
                continue;
            }
            return Ok(Some(Token::Byte(b)));
        }
        if b == CR {
            *pending_cr = true;
            continue;
        }
        if b == LF {
            return Ok(Some(Token::Newline));
        }
        return Ok(Some(Token::Byte(b)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Method,
    Target,
    Version,
}

/// Parse the request line under the head budget.
///
/// Fails *client-aborted* if EOS arrives before the first byte.
pub fn parse_request_line(reader: &mut ChannelReader, max_head: usize) -> Result<RequestLine> {
    let started = Instant::now();
    let mut feed = Feed::new(reader, HeadPart::RequestLine, max_head);

    let mut state = LineState::Method;
    let mut method = Vec::new();
    let mut target = Vec::new();
    let mut version = Vec::new();
    let mut pending_cr = false;

    loop {
        let token = match next_token(&mut feed, &mut pending_cr)? {
            Some(t) => t,
            None if feed.count == 0 => return Err(Error::ClientAborted),
            None => return Err(feed.unexpected_eos()),
        };
        let b = match token {
            Token::Newline => {
                if state != LineState::Version || version.is_empty() {
                    return Err(feed.fail());
                }
                return Ok(RequestLine {
                    method: String::from_utf8_lossy(&method).into_owned(),
                    target: String::from_utf8_lossy(&target).into_owned(),
                    version: String::from_utf8_lossy(&version).into_owned(),
                    length: feed.count,
                    started,
                });
            }
            Token::Byte(b) => b,
        };

        if b.is_ascii_control() {
            return Err(feed.fail());
        }
        match state {
            LineState::Method => {
                if b == SP {
                    if method.is_empty() {
                        return Err(feed.fail());
                    }
                    state = LineState::Target;
                } else if b == HTAB {
                    return Err(feed.fail());
                } else {
                    method.push(b);
                }
            }
            LineState::Target => {
                if b == SP {
                    if target.is_empty() {
                        return Err(feed.fail());
                    }
                    state = LineState::Version;
                } else if b == HTAB {
                    return Err(feed.fail());
                } else {
                    target.push(b);
                }
            }
            LineState::Version => {
                if b == SP || b == HTAB {
                    return Err(feed.fail());
                }
                version.push(b);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldState {
    LineStart,
    Name,
    Value,
}

/// Parse a header block (everything between the request line and the empty
/// terminator line) under the given budget. Also parses chunked-body
/// trailers when `part == HeadPart::Trailers`.
///
/// Values may be empty and may be line-folded; a continuation is appended
/// to the previous value with a single intervening space unless that value
/// already ended in whitespace.
pub fn parse_headers(
    reader: &mut ChannelReader,
    part: HeadPart,
    max: usize,
) -> Result<(Headers, usize)> {
    let mut feed = Feed::new(reader, part, max);
    let mut headers = Headers::new();

    let mut state = FieldState::LineStart;
    let mut name = Vec::new();
    let mut value: Vec<u8> = Vec::new();
    let mut have_field = false;
    let mut skip_ws = false;
    let mut pending_cr = false;

    macro_rules! flush {
        () => {
            if have_field {
                let n = String::from_utf8_lossy(&name).into_owned();
                let v = String::from_utf8_lossy(&value).trim().to_string();
                headers.add(n, v);
                name.clear();
                value.clear();
                have_field = false;
            }
        };
    }

    loop {
        let b = match next_token(&mut feed, &mut pending_cr)? {
            Some(Token::Newline) => match state {
                FieldState::LineStart => {
                    // empty line terminates the block
                    flush!();
                    return Ok((headers, feed.count));
                }
                // a line without a colon
                FieldState::Name => return Err(feed.fail()),
                FieldState::Value => {
                    state = FieldState::LineStart;
                    continue;
                }
            },
            Some(Token::Byte(b)) => b,
            None => return Err(feed.unexpected_eos()),
        };

        if state == FieldState::LineStart {
            if b == SP || b == HTAB {
                // folded continuation of the previous field's value
                if !have_field {
                    return Err(feed.fail());
                }
                if !value.is_empty() && !matches!(value.last(), Some(&SP) | Some(&HTAB)) {
                    value.push(SP);
                }
                state = FieldState::Value;
                skip_ws = true;
                continue;
            }
            flush!();
            state = FieldState::Name;
        }

        match state {
            FieldState::Name => {
                if b == b':' {
                    if name.is_empty() {
                        return Err(feed.fail());
                    }
                    state = FieldState::Value;
                    have_field = true;
                    skip_ws = true;
                } else if b == SP || b == HTAB || b.is_ascii_control() {
                    // no whitespace in names or before the colon
                    return Err(feed.fail());
                } else {
                    name.push(b);
                }
            }
            FieldState::Value => {
                if b == SP || b == HTAB {
                    if !skip_ws {
                        value.push(b);
                    }
                    continue;
                }
                if b.is_ascii_control() {
                    return Err(feed.fail());
                }
                skip_ws = false;
                value.push(b);
            }
            FieldState::LineStart => unreachable!("handled above"),
        }
    }
}
