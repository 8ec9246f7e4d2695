//! One accepted socket, from the first byte to the shutdown.
//!
//! ```text
//!  bytes ──> parser ──> [slot 1][slot 2][slot 3] ──> socket
//!                          │       │       │
//!                       handler handler handler   (concurrent tasks)
//! ```
//!
//! Every parsed request gets a slot at the back of the queue and a handler
//! task. Handlers finish in any order; only the slot at the head writes, so
//! responses leave in request order.

use crate::{
    errors::ErrorKind,
    http::{
        request::{Parsed, Request, RequestParser},
        response::Response,
    },
    limits::{ConnLimits, RespLimits},
    server::{
        event_stream::{EventStream, Frame, StreamStep},
        server_impl::{AllLimits, Handler},
        writer::SocketWriter,
    },
};
use futures::FutureExt;
use std::{
    collections::VecDeque, future::pending, io, net::SocketAddr, panic::AssertUnwindSafe,
    sync::Arc,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 4096;

/// Where a connection is in its cycle, derived from what it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Nothing buffered, nothing in flight. Only here does the idle timer run.
    Idle,
    /// Part of a request is buffered.
    Reading,
    /// Handlers are running, nothing is ready to write.
    Dispatched,
    /// Serialized bytes or an event stream own the socket.
    Writing,
    Closing,
}

enum SlotState {
    Pending,
    Ready(Box<Response>),
}

struct Slot {
    id: u64,
    request: Option<Arc<Request>>,
    task: Option<JoinHandle<()>>,
    deadline: Instant,
    keep_alive: bool,
    state: SlotState,
}

impl Slot {
    #[inline(always)]
    fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// What a handler task hands back: its response, or the error to answer with.
type Completion = Result<Response, ErrorKind>;

enum Output {
    Flushed,
    Partial,
    Stream(StreamStep),
}

enum Wake {
    Shutdown,
    Output(Output),
    Completed(u64, Completion),
    Read(io::Result<usize>),
    ResponseTimeout,
    WriteStall,
    Idle,
}

pub(crate) struct HttpConnection<H: Handler, P: RequestParser> {
    handler: Arc<H>,
    parser: P,

    conn_limits: ConnLimits,
    resp_limits: RespLimits,
    json_errors: bool,

    client_addr: SocketAddr,
    buffer: Vec<u8>,
    queue: VecDeque<Slot>,
    event_stream: Option<EventStream>,

    done_tx: mpsc::UnboundedSender<(u64, Completion)>,
    done_rx: mpsc::UnboundedReceiver<(u64, Completion)>,
    next_id: u64,

    requests: usize,
    reading: bool,
    closing: bool,
    idle_deadline: Instant,
    write_progress: Option<Instant>,
}

impl<H: Handler, P: RequestParser> HttpConnection<H, P> {
    pub(crate) fn new(handler: Arc<H>, limits: &AllLimits) -> Self {
        let (server_limits, conn_limits, req_limits, resp_limits) = limits;
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Self {
            handler,
            parser: P::new(req_limits),

            conn_limits: conn_limits.clone(),
            resp_limits: resp_limits.clone(),
            json_errors: server_limits.json_errors,

            client_addr: Request::UNKNOWN_CLIENT,
            buffer: Vec::with_capacity(READ_CHUNK),
            queue: VecDeque::with_capacity(conn_limits.max_pipelined_requests),
            event_stream: None,

            done_tx,
            done_rx,
            next_id: 0,

            requests: 0,
            reading: true,
            closing: false,
            idle_deadline: Instant::now(),
            write_progress: None,
        }
    }

    // Slot ids keep counting across sockets, so a completion left over from the
    // previous socket never matches a new slot.
    fn reset(&mut self, client_addr: SocketAddr) {
        self.client_addr = client_addr;
        self.buffer.clear();
        self.queue.clear();
        self.event_stream = None;
        while self.done_rx.try_recv().is_ok() {}

        self.requests = 0;
        self.reading = true;
        self.closing = false;
        self.idle_deadline = Instant::now() + self.conn_limits.idle_timeout;
        self.write_progress = None;
    }

    pub(crate) fn state(&self) -> State {
        if self.closing {
            State::Closing
        } else if self.has_output() {
            State::Writing
        } else if !self.queue.is_empty() {
            State::Dispatched
        } else if !self.buffer.is_empty() {
            State::Reading
        } else {
            State::Idle
        }
    }

    /// Binds an event stream to this connection and queues its header, so a
    /// stream that never sends an event still answers the request. Returns
    /// `false`, leaving the bound stream untouched, when one is already bound.
    pub(crate) fn set_event_stream(&mut self, frames: mpsc::Receiver<Frame>) -> bool {
        if self.event_stream.is_some() {
            return false;
        }

        let mut stream = EventStream::new(frames);
        stream.send_header();
        self.event_stream = Some(stream);
        self.buffer.clear();
        true
    }
}

// Main loop
impl<H: Handler, P: RequestParser> HttpConnection<H, P> {
    /// Serves `io` until the peer leaves, a response closes the connection,
    /// a timer fires, or `shutdown` turns `true`.
    pub(crate) async fn run<IO>(
        &mut self,
        io: IO,
        client_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.reset(client_addr);
        debug!(peer = %client_addr, "connection opened");

        let (mut reader, writer) = tokio::io::split(io);
        let mut writer = SocketWriter::new(writer);

        while !self.closing {
            trace!(peer = %self.client_addr, state = ?self.state(), slots = self.queue.len());

            let has_output = self.has_output();
            let reading = self.reading && self.queue.len() < self.conn_limits.max_pipelined_requests;
            let idle = self.queue.is_empty() && self.event_stream.is_none();
            let response_deadline = self.next_response_deadline();
            let stall_deadline = self
                .write_progress
                .map(|at| at + self.conn_limits.socket_write_timeout);
            let idle_deadline = self.idle_deadline;

            if reading {
                self.buffer.reserve(READ_CHUNK);
            }

            let Self {
                queue,
                event_stream,
                buffer,
                done_rx,
                ..
            } = &mut *self;

            let wake = tokio::select! {
                biased;

                _ = shutdown_signal(&mut shutdown) => Wake::Shutdown,
                out = drive_output(queue, event_stream, &mut writer), if has_output => {
                    Wake::Output(out)
                }
                Some((id, outcome)) = done_rx.recv() => Wake::Completed(id, outcome),
                read = reader.read_buf(buffer), if reading => Wake::Read(read),
                _ = sleep_opt(response_deadline) => Wake::ResponseTimeout,
                _ = sleep_opt(stall_deadline) => Wake::WriteStall,
                _ = sleep_until(idle_deadline), if idle => Wake::Idle,
            };

            match wake {
                Wake::Shutdown => {
                    debug!(peer = %self.client_addr, "server shutting down, closing connection");
                    self.closing = true;
                }
                Wake::Output(out) => self.on_output(out, &writer),
                Wake::Completed(id, outcome) => self.on_completed(id, outcome),
                Wake::Read(Ok(0)) => {
                    debug!(peer = %self.client_addr, "peer closed the connection");
                    self.closing = true;
                }
                Wake::Read(Ok(n)) => self.on_read(n),
                Wake::Read(Err(err)) => {
                    debug!(peer = %self.client_addr, error = %err, "socket read failed");
                    self.closing = true;
                }
                Wake::ResponseTimeout => self.expire_responses(),
                Wake::WriteStall => {
                    debug!(peer = %self.client_addr, "peer stopped reading, closing");
                    self.closing = true;
                }
                Wake::Idle => {
                    debug!(peer = %self.client_addr, "idle timeout");
                    self.closing = true;
                }
            }
        }

        self.teardown(&mut writer).await;
    }

    async fn teardown<W: AsyncWrite + Unpin>(&mut self, writer: &mut SocketWriter<W>) {
        self.queue.clear();
        self.event_stream = None;
        self.buffer.clear();

        if !writer.is_closed()
            && timeout(self.conn_limits.socket_write_timeout, writer.shutdown())
                .await
                .is_err()
        {
            debug!(peer = %self.client_addr, "socket shutdown timed out");
        }
        debug!(peer = %self.client_addr, requests = self.requests, "connection closed");
    }
}

// Events
impl<H: Handler, P: RequestParser> HttpConnection<H, P> {
    fn on_output<W: AsyncWrite + Unpin>(&mut self, out: Output, writer: &SocketWriter<W>) {
        match out {
            Output::Flushed => {
                self.write_progress = None;

                let keep_alive = match self.queue.pop_front() {
                    Some(Slot {
                        state: SlotState::Ready(ref response),
                        ..
                    }) => response.keep_alive,
                    _ => true,
                };
                if !keep_alive || writer.is_closed() {
                    self.closing = true;
                    return;
                }

                if self.queue.is_empty() {
                    self.idle_deadline = Instant::now() + self.conn_limits.idle_timeout;
                }
                self.advance_head();
                self.parse_buffered();
            }
            Output::Partial => self.write_progress = Some(Instant::now()),
            Output::Stream(StreamStep::Progress) => {
                self.write_progress = match self.event_stream.as_ref() {
                    Some(stream) if stream.is_draining() => Some(Instant::now()),
                    _ => None,
                };
            }
            Output::Stream(StreamStep::Finished) => {
                debug!(peer = %self.client_addr, "event stream finished");
                self.closing = true;
            }
        }
    }

    fn on_completed(&mut self, id: u64, outcome: Completion) {
        let Some(slot) = self.queue.iter_mut().find(|slot| slot.id == id) else {
            trace!(id, "completion for a slot that is gone");
            return;
        };
        if !slot.is_pending() {
            trace!(id, "completion after timeout ignored");
            return;
        }

        slot.task = None;
        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                warn!(peer = %self.client_addr, id, "handler panicked");
                error_response(&self.resp_limits, self.json_errors, slot, error)
            }
        };
        slot.state = SlotState::Ready(Box::new(response));
        self.advance_head();
    }

    fn on_read(&mut self, n: usize) {
        self.idle_deadline = Instant::now() + self.conn_limits.idle_timeout;

        if self.event_stream.is_some() {
            trace!(peer = %self.client_addr, bytes = n, "ignoring input on an event stream");
            self.buffer.clear();
            return;
        }
        self.parse_buffered();
    }

    fn expire_responses(&mut self) {
        let now = Instant::now();

        for slot in self.queue.iter_mut() {
            if !slot.is_pending() || slot.deadline > now {
                continue;
            }
            warn!(peer = %self.client_addr, id = slot.id, "handler did not respond in time");

            if let Some(task) = slot.task.take() {
                task.abort();
            }

            let response = error_response(
                &self.resp_limits,
                self.json_errors,
                slot,
                ErrorKind::ResponseTimeout,
            );
            slot.state = SlotState::Ready(Box::new(response));
        }

        self.advance_head();
    }
}

// Queue
impl<H: Handler, P: RequestParser> HttpConnection<H, P> {
    #[inline]
    fn has_output(&self) -> bool {
        self.event_stream.is_some()
            || matches!(
                self.queue.front(),
                Some(Slot { state: SlotState::Ready(response), .. }) if response.is_prepared()
            )
    }

    fn next_response_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter(|slot| slot.is_pending())
            .map(|slot| slot.deadline)
            .min()
    }

    /// Brings the head slot to the point where it can write: binds an event
    /// stream, discards responses queued behind one, or serializes.
    fn advance_head(&mut self) {
        loop {
            let Some(Slot {
                state: SlotState::Ready(response),
                ..
            }) = self.queue.front_mut()
            else {
                return;
            };
            if response.is_prepared() {
                return;
            }

            if let Some(frames) = response.take_upgrade() {
                self.queue.pop_front();
                if !self.set_event_stream(frames) {
                    warn!(peer = %self.client_addr, "second event stream on one connection dropped");
                }
                continue;
            }

            if self.event_stream.is_some() {
                let id = self.queue.pop_front().map(|slot| slot.id);
                debug!(peer = %self.client_addr, ?id, "response behind an event stream discarded");
                continue;
            }

            response.prepare_to_send();
            self.write_progress = Some(Instant::now());
            return;
        }
    }

    /// Runs the parser over the buffered bytes until it needs more, the queue
    /// is full, or reading has stopped.
    fn parse_buffered(&mut self) {
        while self.reading
            && self.event_stream.is_none()
            && !self.buffer.is_empty()
            && self.queue.len() < self.conn_limits.max_pipelined_requests
        {
            match self.parser.parse(&self.buffer) {
                Parsed::Complete { request, consumed } => {
                    self.buffer.drain(..consumed);
                    self.dispatch(request);
                }
                Parsed::Incomplete => break,
                Parsed::Malformed { error, consumed } => {
                    debug!(peer = %self.client_addr, %error, "malformed request");
                    match consumed {
                        Some(n) => drop(self.buffer.drain(..n)),
                        None => {
                            self.buffer.clear();
                            self.reading = false;
                        }
                    }
                    self.reject(error);
                }
            }
        }

        self.advance_head();
    }

    fn next_slot(&mut self) -> (u64, bool) {
        let id = self.next_id;
        self.next_id += 1;
        self.requests += 1;

        let keep_alive = self.reading
            && self.conn_limits.keep_alive
            && self.requests < self.conn_limits.max_requests_per_connection;
        (id, keep_alive)
    }

    fn dispatch(&mut self, mut request: Request) {
        request.client_addr = self.client_addr;
        let (id, allowed) = self.next_slot();

        let mut response = Response::new(&self.resp_limits);
        response.setup_from_request(&request);
        response.event_capacity = self.conn_limits.event_stream_capacity;
        response.keep_alive &= allowed;

        let keep_alive = response.keep_alive;
        if !keep_alive {
            self.reading = false;
        }

        trace!(peer = %self.client_addr, id, method = ?request.method(), uri = request.target());

        let request = Arc::new(request);
        let task = tokio::spawn({
            let handler = self.handler.clone();
            let request = request.clone();
            let done = self.done_tx.clone();

            async move {
                let mut response = response;
                let outcome = AssertUnwindSafe(handler.handle(&request, &mut response))
                    .catch_unwind()
                    .await;

                let outcome = outcome
                    .map(|_| response)
                    .map_err(|_| ErrorKind::HandlerPanicked);
                let _ = done.send((id, outcome));
            }
        });

        self.queue.push_back(Slot {
            id,
            request: Some(request),
            task: Some(task),
            deadline: Instant::now() + self.conn_limits.response_timeout,
            keep_alive,
            state: SlotState::Pending,
        });
    }

    fn reject(&mut self, error: ErrorKind) {
        let (id, allowed) = self.next_slot();

        let mut response = Response::new(&self.resp_limits);
        response.keep_alive = allowed;
        response.set_error_kind(error, self.json_errors);

        if !response.keep_alive {
            self.reading = false;
        }

        self.queue.push_back(Slot {
            id,
            request: None,
            task: None,
            deadline: Instant::now(),
            keep_alive: allowed,
            state: SlotState::Ready(Box::new(response)),
        });
    }
}

// Answers a slot whose handler gave no usable response.
fn error_response(limits: &RespLimits, json: bool, slot: &Slot, error: ErrorKind) -> Response {
    let mut response = Response::new(limits);
    if let Some(request) = &slot.request {
        response.setup_from_request(request);
    }
    response.keep_alive &= slot.keep_alive;
    response.set_error_kind(error, json);
    response
}

async fn drive_output<W>(
    queue: &mut VecDeque<Slot>,
    event_stream: &mut Option<EventStream>,
    writer: &mut SocketWriter<W>,
) -> Output
where
    W: AsyncWrite + Unpin,
{
    if let Some(stream) = event_stream {
        return Output::Stream(stream.drive(writer).await);
    }

    match queue.front_mut() {
        Some(Slot {
            state: SlotState::Ready(response),
            ..
        }) => match response.write_chunk(writer).await {
            true => Output::Flushed,
            false => Output::Partial,
        },
        _ => pending().await,
    }
}

// A dropped sender means nobody can ask for a shutdown any more.
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
