//! One HTTP exchange: parse, invoke, write, recover, decide persistence.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::body::Body;
use crate::config::Config;
use crate::error::{Error, HeadPart, Rejection, Result};
use crate::events::{EventHub, ServerEvent};
use crate::framer::FrameInputs;
use crate::parser::{self, RequestLine};
use crate::reader::ChannelReader;
use crate::registry::{ActionRegistry, ResolvedAction, RouteRegistry};
use crate::request::{HttpVersion, Request, Target};
use crate::response::Response;
use crate::route::{AfterAction, BeforeAction, ErrorHandler, Method};
use crate::timeout::TimerService;
use crate::writer::{CONTINUE_LINE, ChannelWriter, WriteOutcome};

/// Everything an exchange borrows from its connection and server.
pub struct ExchangeContext<'a> {
    pub config: &'a Config,
    pub routes: &'a RouteRegistry,
    pub befores: &'a ActionRegistry<dyn BeforeAction>,
    pub afters: &'a ActionRegistry<dyn AfterAction>,
    pub error_handlers: &'a [Arc<dyn ErrorHandler>],
    pub events: &'a EventHub,
    /// Timer delivering the idle-connection timeout; absent in unit tests.
    pub timer: Option<&'a TimerService>,
    /// Shuts the connection's read half down, unblocking a parked read.
    pub cancel_read: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Writes raw interim bytes, for the deferred 100-continue.
    pub continue_sink: Option<Arc<dyn Fn(&[u8]) -> io::Result<()> + Send + Sync>>,
    pub server_stopping: &'a AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The connection loop may spawn successors and serve another exchange.
    KeepAlive,
    Close,
}

pub struct ExchangeResult {
    pub outcome: ExchangeOutcome,
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
}

/// Drive one exchange to completion. The reader and writer come back
/// dismissed; on [`ExchangeOutcome::KeepAlive`] their successors serve the
/// next exchange.
pub fn run(ctx: &ExchangeContext<'_>, reader: ChannelReader, writer: ChannelWriter) -> ExchangeResult {
    let mut reader = reader;
    let mut writer = writer;

    let head = {
        let _guard = match (ctx.timer, &ctx.cancel_read) {
            (Some(timer), Some(cancel)) => {
                let cancel = cancel.clone();
                Some(timer.schedule(ctx.config.timeout_idle_connection(), move || cancel()))
            }
            _ => None,
        };
        let head = parse_head(ctx, &mut reader);
        match head {
            Err(e) if _guard.as_ref().is_some_and(|g| g.fired()) => Err(classify_timeout(e)),
            other => other,
        }
    };

    let (line, headers) = match head {
        Ok(parts) => parts,
        Err(e) => return early_failure(ctx, e, HttpVersion::HTTP_1_1, reader, writer),
    };

    let version = match HttpVersion::parse(&line.version) {
        Ok(v) => v,
        Err(e) => return early_failure(ctx, e, HttpVersion::HTTP_1_1, reader, writer),
    };
    // responses to out-of-range versions are framed for the nearest
    // protocol this engine speaks
    let effective = version.clamp(HttpVersion::HTTP_1_0, HttpVersion::HTTP_1_1);
    if version < HttpVersion::HTTP_1_0
        || (version == HttpVersion::HTTP_1_0 && ctx.config.reject_clients_using_http1_0)
    {
        let e = Error::VersionTooOld(line.version);
        return early_failure(ctx, e, effective, reader, writer);
    }
    if version > HttpVersion::HTTP_1_1 {
        let e = Error::VersionTooNew(line.version);
        return early_failure(ctx, e, effective, reader, writer);
    }
    let version = effective;

    ctx.events.dispatch(&ServerEvent::RequestHeadReceived {
        method: line.method.clone(),
        target: line.target.clone(),
        version,
    });

    // request framing checks that must precede body construction
    let chunked = headers.transfer_encoding_chunked();
    if headers.contains("Transfer-Encoding") && !chunked {
        let e = Error::IllegalRequestBody("unsupported transfer coding");
        return early_failure(ctx, e, version, reader, writer);
    }
    let content_length = match headers.content_length() {
        Ok(cl) => cl,
        Err(_) => {
            let e = Error::IllegalRequestBody("invalid Content-Length");
            return early_failure(ctx, e, version, reader, writer);
        }
    };
    let method = Method::from_bytes(line.method.as_bytes());
    if method == Method::Trace && (chunked || content_length.unwrap_or(0) > 0) {
        let e = Error::IllegalRequestBody("TRACE request with a body");
        return early_failure(ctx, e, version, reader, writer);
    }

    let mut body = if chunked {
        Body::chunked(reader, ctx.config.max_request_trailers_size)
    } else {
        match content_length {
            Some(n) if n > 0 => Body::fixed(reader, n),
            _ => Body::empty(reader),
        }
    };

    // Expect: 100-continue
    let mut send_immediate_continue = false;
    if version >= HttpVersion::HTTP_1_1 && headers.expects_100_continue() {
        if ctx.config.immediately_continue_expect_100 {
            send_immediate_continue = true;
        } else if let Some(sink) = &ctx.continue_sink {
            let sink = sink.clone();
            let counter = writer.continue_counter();
            body.set_continue_trigger(Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    if let Err(e) = sink(CONTINUE_LINE) {
                        debug!(error = %e, "failed to send deferred 100 Continue");
                    }
                }
            }));
        }
    }

    let mut request = Request::new(
        line.method,
        Target::parse(&line.target),
        version,
        headers,
        body,
        line.started,
    );

    let afters = ctx.afters.lookup(request.target());

    let invoked = (|| -> Result<WriteOutcome> {
        if send_immediate_continue {
            writer.write(
                Response::r#continue(),
                &frame_inputs(ctx, version, Some(&request)),
                &afters,
            )?;
        }
        invoke(ctx, &mut request, &mut writer, &afters)
    })();

    let outcome = match invoked {
        Ok(outcome) => Ok(outcome),
        Err(e) => recover(ctx, e, version, Some(&mut request), &mut writer, &afters),
    };

    let clean = match outcome {
        Ok(_) => {
            // drain what the application left unread, so the successor
            // starts on a message boundary
            request.body_mut().discard().is_ok()
        }
        Err(ref e) => {
            trace!(error = %e, "exchange ends without a response");
            false
        }
    };

    let mut reader = request.take_body().into_reader();
    finish(&mut reader, &mut writer, clean);
    ExchangeResult {
        outcome: decide(ctx, &reader, &writer, clean),
        reader,
        writer,
    }
}

fn parse_head(
    ctx: &ExchangeContext<'_>,
    reader: &mut ChannelReader,
) -> Result<(RequestLine, crate::headers::Headers)> {
    let max = ctx.config.max_request_head_size;
    let line = parser::parse_request_line(reader, max)?;
    let (headers, _) = parser::parse_headers(reader, HeadPart::Headers, max - line.length)?;
    Ok((line, headers))
}

fn classify_timeout(e: Error) -> Error {
    match e {
        Error::EndOfStream | Error::ClientAborted | Error::Read(_) => Error::TimeoutIdleConnection,
        other => other,
    }
}

/// Route, before-actions, handler, write.
fn invoke(
    ctx: &ExchangeContext<'_>,
    request: &mut Request,
    writer: &mut ChannelWriter,
    afters: &[ResolvedAction<dyn AfterAction>],
) -> Result<WriteOutcome> {
    let befores = ctx.befores.lookup(request.target());
    let mut response = None;
    for before in &befores {
        if let Some(early) = before.action.apply(request, &before.params)? {
            response = Some(early);
            break;
        }
    }
    let response = match response {
        Some(r) => r,
        None => {
            let matched = ctx.routes.lookup(request.target())?;
            let handler = matched
                .route
                .handler(request.method())
                .ok_or_else(|| Error::MethodNotAllowed {
                    method: request.method_token().to_string(),
                })?;
            handler.handle(request, &matched.params)?
        }
    };

    let version = request.version();
    let outcome = writer.write(response, &frame_inputs(ctx, version, Some(request)), afters)?;
    if !writer.wrote_final() {
        return Err(Error::ResponseRejected(Rejection::NotFinal));
    }
    dispatch_sent(ctx, &outcome);
    Ok(outcome)
}

/// Classify, run the application error-handler chain, fall back to the
/// default handler, and write whatever response comes out. New errors
/// raised on the way re-enter the loop, capped by the configured attempts.
fn recover(
    ctx: &ExchangeContext<'_>,
    error: Error,
    version: HttpVersion,
    mut request: Option<&mut Request>,
    writer: &mut ChannelWriter,
    afters: &[ResolvedAction<dyn AfterAction>],
) -> Result<WriteOutcome> {
    let mut error = error;
    let mut attempts = 0u32;
    loop {
        if error.is_terminal() {
            return Err(error);
        }
        if attempts >= ctx.config.max_error_recovery_attempts {
            debug!(error = %error, attempts, "error recovery attempts exhausted");
            return Err(error);
        }
        attempts += 1;

        let response = resolve_error_response(ctx, &error, request.as_deref_mut(), writer);
        let inputs = frame_inputs(ctx, version, request.as_deref());
        match writer.write(response, &inputs, afters) {
            Ok(outcome) => {
                dispatch_sent(ctx, &outcome);
                return Ok(outcome);
            }
            Err(next) => {
                debug!(error = %next, "writing the error response failed");
                error = next;
            }
        }
    }
}

fn resolve_error_response(
    ctx: &ExchangeContext<'_>,
    error: &Error,
    mut request: Option<&mut Request>,
    writer: &mut ChannelWriter,
) -> Response {
    for handler in ctx.error_handlers {
        match handler.handle(error, request.as_deref_mut()) {
            Ok(response) => return response,
            Err(delegated) => {
                trace!(error = %delegated, "error handler delegated");
            }
        }
    }
    default_error_response(error, writer)
}

/// The shared fallback: translate the error kind to a status code and close
/// the connection when the read stream is corrupt.
fn default_error_response(error: &Error, writer: &mut ChannelWriter) -> Response {
    if error.corrupts_request_stream() {
        writer.schedule_close(error.to_string());
    }
    Response::new(error.status_code())
}

fn frame_inputs(
    ctx: &ExchangeContext<'_>,
    version: HttpVersion,
    request: Option<&Request>,
) -> FrameInputs {
    FrameInputs {
        version,
        method: request.map(|r| r.method()),
        request_close: request
            .map(|r| r.headers().connection_close())
            .unwrap_or(false),
        input_shut: request
            .map(|r| r.body().reader().input_shutdown_seen())
            .unwrap_or(false),
        server_stopping: ctx.server_stopping.load(Ordering::Relaxed),
    }
}

fn dispatch_sent(ctx: &ExchangeContext<'_>, outcome: &WriteOutcome) {
    if let WriteOutcome::Sent {
        status,
        is_final: true,
        close_connection,
        ..
    } = outcome
    {
        ctx.events.dispatch(&ServerEvent::ResponseSent {
            status: *status,
            close_connection: *close_connection,
        });
    }
}

/// Errors before a request value exists: recover without one, then close.
/// The body, if any, was never read, so the stream offset is unknown and
/// the connection cannot serve another exchange.
fn early_failure(
    ctx: &ExchangeContext<'_>,
    error: Error,
    version: HttpVersion,
    mut reader: ChannelReader,
    mut writer: ChannelWriter,
) -> ExchangeResult {
    if matches!(error, Error::ClientAborted) {
        trace!("client disconnected between exchanges");
    } else {
        writer.schedule_close("request rejected before its body was read");
        let _ = recover(ctx, error, version, None, &mut writer, &[]);
    }
    reader.discard();
    writer.dismiss();
    ExchangeResult {
        outcome: ExchangeOutcome::Close,
        reader,
        writer,
    }
}

fn finish(reader: &mut ChannelReader, writer: &mut ChannelWriter, clean: bool) {
    if clean && !reader.is_dismissed() {
        reader.dismiss();
    } else {
        reader.discard();
    }
    writer.dismiss();
}

fn decide(
    ctx: &ExchangeContext<'_>,
    reader: &ChannelReader,
    writer: &ChannelWriter,
    clean: bool,
) -> ExchangeOutcome {
    let keep = clean
        && writer.wrote_final()
        && !reader.input_shutdown_seen()
        && !writer.output_shutdown()
        && !ctx.server_stopping.load(Ordering::Relaxed);
    if keep {
        ExchangeOutcome::KeepAlive
    } else {
        ExchangeOutcome::Close
    }
}
