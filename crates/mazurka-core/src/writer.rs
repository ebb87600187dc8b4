//! Serializes responses through the framer onto the byte stream.
//!
//! The writer is sequential per connection. It tracks bytes written, the
//! final-response flag and the interim-response count across all writes of
//! one exchange.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::{Error, Rejection, Result};
use crate::framer::{FrameInputs, Framer};
use crate::registry::ResolvedAction;
use crate::request::HttpVersion;
use crate::response::Response;
use crate::route::AfterAction;

/// The byte stream under the writer, with independent shutdown of the
/// write half and full closure.
pub trait Sink: Write + Send {
    fn shutdown_output(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

impl Sink for TcpStream {
    fn shutdown_output(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// What a successful `write` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent {
        status: u16,
        is_final: bool,
        close_connection: bool,
        close_channel: bool,
    },
    /// An interim response was dropped, not written.
    Discarded,
}

pub struct ChannelWriter {
    sink: Box<dyn Sink>,
    framer: Framer,
    discard_rejected_informational: bool,
    /// `100 Continue` responses attempted on this exchange, shared with the
    /// deferred-continue trigger.
    continue_count: Arc<AtomicU32>,
    dismissed: bool,
    wrote_final: bool,
    in_flight: bool,
    output_shut: bool,
    bytes_written: u64,
}

impl ChannelWriter {
    pub fn new(
        sink: impl Sink + 'static,
        framer: Framer,
        discard_rejected_informational: bool,
    ) -> Self {
        ChannelWriter {
            sink: Box::new(sink),
            framer,
            discard_rejected_informational,
            continue_count: Arc::new(AtomicU32::new(0)),
            dismissed: false,
            wrote_final: false,
            in_flight: false,
            output_shut: false,
            bytes_written: 0,
        }
    }

    /// Counter shared with the deferred-continue trigger, so an interim
    /// response sent on first body access suppresses later application 100s.
    pub(crate) fn continue_counter(&self) -> Arc<AtomicU32> {
        self.continue_count.clone()
    }

    pub fn wrote_final(&self) -> bool {
        self.wrote_final
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn output_shutdown(&self) -> bool {
        self.output_shut
    }

    pub fn schedule_close(&mut self, reason: impl Into<String>) {
        self.framer.schedule_close(reason);
    }

    /// Invalidate the writer at end of exchange; further writes fail.
    pub fn dismiss(&mut self) {
        self.dismissed = true;
    }

    /// Spawn the successor for the next exchange. The sink and per-
    /// connection framer state carry over; per-exchange flags reset.
    ///
    /// # Panics
    ///
    /// Panics unless this writer was dismissed.
    pub fn new_writer(mut self) -> ChannelWriter {
        assert!(self.dismissed, "successor requires a dismissed writer");
        self.dismissed = false;
        self.wrote_final = false;
        self.in_flight = false;
        self.continue_count = Arc::new(AtomicU32::new(0));
        self
    }

    pub fn write(
        &mut self,
        response: Response,
        inputs: &FrameInputs,
        after_actions: &[ResolvedAction<dyn AfterAction>],
    ) -> Result<WriteOutcome> {
        if self.dismissed {
            return Err(Error::ResponseRejected(Rejection::Dismissed));
        }
        if self.wrote_final {
            return Err(Error::ResponseRejected(Rejection::AlreadyFinal));
        }
        if self.in_flight {
            return Err(Error::ResponseRejected(Rejection::InFlight));
        }
        self.in_flight = true;
        let result = self.write_inner(response, inputs, after_actions);
        self.in_flight = false;
        result
    }

    fn write_inner(
        &mut self,
        mut response: Response,
        inputs: &FrameInputs,
        after_actions: &[ResolvedAction<dyn AfterAction>],
    ) -> Result<WriteOutcome> {
        if !response.is_final() && inputs.version < HttpVersion::HTTP_1_1 {
            if self.discard_rejected_informational {
                debug!(
                    status = response.status(),
                    "discarding interim response for an HTTP/1.0 client"
                );
                return Ok(WriteOutcome::Discarded);
            }
            return Err(Error::ResponseRejected(Rejection::ProtocolNotSupported));
        }

        if response.status() == 100 {
            let n = self.continue_count.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                debug!("ignoring repeated 100 Continue");
                return Ok(WriteOutcome::Discarded);
            }
            if n > 2 {
                warn!(count = n, "ignoring repeated 100 Continue");
                return Ok(WriteOutcome::Discarded);
            }
        }

        for resolved in after_actions {
            response = resolved.action.apply(&resolved.params, response)?;
        }

        let framed = self.framer.frame(response, inputs)?;

        let head = head_bytes(inputs.version, &framed.response);
        self.write_all(&head)?;
        for window in framed.body {
            if !window.is_empty() {
                self.write_all(&window)?;
            }
        }
        self.sink.flush().map_err(|e| self.write_failed(e))?;

        let status = framed.response.status();
        let is_final = framed.response.is_final();
        if is_final {
            self.wrote_final = true;
        }
        if framed.close_channel {
            let _ = self.sink.close();
            self.output_shut = true;
            self.dismissed = true;
        } else if framed.close_connection {
            let _ = self.sink.shutdown_output();
            self.output_shut = true;
        }
        Ok(WriteOutcome::Sent {
            status,
            is_final,
            close_connection: framed.close_connection,
            close_channel: framed.close_channel,
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self.sink.write_all(bytes) {
            Ok(()) => {
                self.bytes_written += bytes.len() as u64;
                Ok(())
            }
            Err(e) => Err(self.write_failed(e)),
        }
    }

    fn write_failed(&mut self, e: io::Error) -> Error {
        self.dismissed = true;
        self.output_shut = true;
        let _ = self.sink.shutdown_output();
        Error::Write(e)
    }
}

/// `status-line CRLF headers CRLF`.
fn head_bytes(version: HttpVersion, response: &Response) -> Vec<u8> {
    let mut out = format!(
        "{} {} {}\r\n",
        version,
        response.status(),
        response.reason()
    )
    .into_bytes();
    for (name, value) in response.headers().iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// The interim response line the exchange sends for `Expect: 100-continue`.
pub(crate) const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
