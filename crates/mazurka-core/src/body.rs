//! Request body: a known-length window over the channel reader, or a
//! chunked decoder on top of it.

use memchr::memchr;
use tracing::debug;

use crate::error::{Error, HeadPart, Result};
use crate::headers::Headers;
use crate::parser;
use crate::reader::ChannelReader;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Longest accepted chunk-size token. 16 hex digits already covers u64.
const MAX_CHUNK_SIZE_DIGITS: usize = 16;

/// Cap on one chunk control line, extensions included.
const MAX_FRAME_LINE: usize = 1024;

enum Framing {
    Empty,
    /// The reader is limited to the declared Content-Length.
    Length,
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    Done,
}

/// Callback delivering a deferred `100 Continue` on first body access.
pub(crate) type ContinueTrigger = Box<dyn FnOnce() + Send>;

pub struct Body {
    reader: ChannelReader,
    framing: Framing,
    trailers: Option<Headers>,
    max_trailers: usize,
    on_first_access: Option<ContinueTrigger>,
    /// Body control bytes consumed, for chunk-frame error positions.
    frame_pos: u64,
}

impl Body {
    pub(crate) fn empty(reader: ChannelReader) -> Body {
        Body::build(reader, Framing::Empty, 0)
    }

    pub(crate) fn fixed(mut reader: ChannelReader, len: u64) -> Body {
        reader.limit(len);
        let framing = if len == 0 { Framing::Empty } else { Framing::Length };
        Body::build(reader, framing, 0)
    }

    pub(crate) fn chunked(reader: ChannelReader, max_trailers: usize) -> Body {
        Body::build(reader, Framing::Chunked(ChunkState::Size), max_trailers)
    }

    fn build(reader: ChannelReader, framing: Framing, max_trailers: usize) -> Body {
        Body {
            reader,
            framing,
            trailers: None,
            max_trailers,
            on_first_access: None,
            frame_pos: 0,
        }
    }

    pub(crate) fn set_continue_trigger(&mut self, trigger: ContinueTrigger) {
        self.on_first_access = Some(trigger);
    }

    /// Total bytes remaining, or `None` while a chunked body is undecoded.
    pub fn length(&self) -> Option<u64> {
        match &self.framing {
            Framing::Empty => Some(0),
            Framing::Length => self.reader.length(),
            Framing::Chunked(ChunkState::Done) => Some(0),
            Framing::Chunked(_) => None,
        }
    }

    /// Whether the body is known to hold no bytes without reading it.
    pub fn is_known_empty(&self) -> bool {
        matches!(self.framing, Framing::Empty)
    }

    /// Next window of body bytes, `None` when the body ends. For chunked
    /// bodies the terminating frame also parses any trailers.
    pub fn next_window(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(trigger) = self.on_first_access.take() {
            trigger();
        }
        match self.framing {
            Framing::Empty => Ok(None),
            Framing::Length => match self.reader.next()? {
                Some(mut view) => Ok(Some(view.read_slice(usize::MAX).to_vec())),
                None => Ok(None),
            },
            Framing::Chunked(state) => self.next_chunk_window(state),
        }
    }

    /// Buffer the whole remaining body.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(window) = self.next_window()? {
            out.extend_from_slice(&window);
        }
        Ok(out)
    }

    /// The whole remaining body as text, invalid sequences replaced.
    pub fn text(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Consume and drop the remainder. Returns the number of bytes dropped.
    pub fn discard(&mut self) -> Result<u64> {
        let mut dropped = 0u64;
        while let Some(window) = self.next_window()? {
            dropped += window.len() as u64;
        }
        if dropped > 0 {
            debug!(bytes = dropped, "discarded unconsumed request body");
        }
        Ok(dropped)
    }

    /// Trailers of a fully consumed chunked body.
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    fn next_chunk_window(&mut self, state: ChunkState) -> Result<Option<Vec<u8>>> {
        match state {
            ChunkState::Done => Ok(None),
            ChunkState::Size => {
                let size = self.read_chunk_size()?;
                if size == 0 {
                    let (trailers, _) = parser::parse_headers(
                        &mut self.reader,
                        HeadPart::Trailers,
                        self.max_trailers,
                    )?;
                    if !trailers.is_empty() {
                        self.trailers = Some(trailers);
                    }
                    self.framing = Framing::Chunked(ChunkState::Done);
                    return Ok(None);
                }
                self.framing = Framing::Chunked(ChunkState::Data { remaining: size });
                self.next_chunk_window(ChunkState::Data { remaining: size })
            }
            ChunkState::Data { remaining } => {
                let window = match self.reader.next()? {
                    Some(mut view) => {
                        let take = usize::try_from(remaining).unwrap_or(usize::MAX);
                        view.read_slice(take).to_vec()
                    }
                    None => return Err(self.eos()),
                };
                self.frame_pos += window.len() as u64;
                let left = remaining - window.len() as u64;
                if left == 0 {
                    self.read_chunk_terminator()?;
                    self.framing = Framing::Chunked(ChunkState::Size);
                } else {
                    self.framing = Framing::Chunked(ChunkState::Data { remaining: left });
                }
                Ok(Some(window))
            }
        }
    }

    /// `hex-size [;extensions] CRLF`. Extensions are tolerated and dropped.
    fn read_chunk_size(&mut self) -> Result<u64> {
        let line = self.read_frame_line()?;
        let mut token = &line[..line.len() - 1];
        if token.last() == Some(&CR) {
            token = &token[..token.len() - 1];
        }
        if let Some(i) = memchr(b';', token) {
            token = &token[..i];
        }
        let digits = std::str::from_utf8(token).unwrap_or("").trim();
        if digits.is_empty() || digits.len() > MAX_CHUNK_SIZE_DIGITS {
            return Err(self.frame_error(token.first().copied().unwrap_or(LF)));
        }
        u64::from_str_radix(digits, 16)
            .map_err(|_| self.frame_error(token.first().copied().unwrap_or(0)))
    }

    /// One frame control line, up to and including its `LF`.
    fn read_frame_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let mut view = match self.reader.next()? {
                Some(v) => v,
                None => return Err(self.eos()),
            };
            match view.find(LF) {
                Some(i) => {
                    line.extend_from_slice(view.read_slice(i + 1));
                    self.frame_pos += (i + 1) as u64;
                    return Ok(line);
                }
                None => {
                    let run = view.read_slice(usize::MAX);
                    self.frame_pos += run.len() as u64;
                    line.extend_from_slice(run);
                    if line.len() > MAX_FRAME_LINE {
                        return Err(self.frame_error(*line.last().unwrap_or(&0)));
                    }
                }
            }
        }
    }

    /// The CRLF (or LF) closing a data frame.
    fn read_chunk_terminator(&mut self) -> Result<()> {
        let b = self.read_frame_byte()?;
        if b == LF {
            return Ok(());
        }
        if b != CR {
            return Err(self.frame_error(b));
        }
        let b = self.read_frame_byte()?;
        if b != LF {
            return Err(self.frame_error(b));
        }
        Ok(())
    }

    fn read_frame_byte(&mut self) -> Result<u8> {
        let b = match self.reader.next()? {
            Some(mut view) => view.read_u8(),
            None => None,
        };
        match b {
            Some(b) => {
                self.frame_pos += 1;
                Ok(b)
            }
            None => Err(self.eos()),
        }
    }

    fn frame_error(&mut self, byte: u8) -> Error {
        self.reader.shutdown_input();
        Error::Parse {
            part: HeadPart::ChunkFrame,
            byte,
            prev: None,
            pos: self.frame_pos,
        }
    }

    fn eos(&mut self) -> Error {
        self.reader.shutdown_input();
        Error::EndOfStream
    }

    /// Hand the reader back at exchange end. A spent length-limited reader
    /// is returned to unlimited mode for the successor.
    pub(crate) fn into_reader(mut self) -> ChannelReader {
        if matches!(self.framing, Framing::Length | Framing::Empty)
            && self.reader.length().is_some()
            && self.reader.is_empty()
            && !self.reader.is_dismissed()
            && !self.reader.input_shutdown_seen()
        {
            self.reader.reset();
        }
        self.reader
    }

    pub(crate) fn reader(&self) -> &ChannelReader {
        &self.reader
    }
}
