//! Server-sent events over an upgraded connection.
//!
//! A handler calls [`Response::event_stream`](crate::Response::event_stream) and
//! keeps the returned [`EventSender`]. Once the response reaches the head of the
//! connection's queue, the connection binds an [`EventStream`] to its socket and
//! from then on only forwards frames:
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! Content-Type: text/event-stream\r\n
//! Connection: keep-alive\r\n
//! Cache-Control: no-cache\r\n
//! \r\n
//! event: tick\r\n
//! data: 1\r\n
//! \r\n
//! : ping\r\n
//! \r\n
//! ```

use crate::server::writer::{PendingWrite, SocketWriter};
use memchr::memchr2;
use std::{borrow::Cow, error, fmt, time::Duration};
use tokio::{
    io::AsyncWrite,
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};

pub(crate) const HEARTBEAT: Duration = Duration::from_secs(30);

const HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: keep-alive\r\n\
    Cache-Control: no-cache\r\n\
    \r\n";

const PING: &[u8] = b": ping\r\n\r\n";

#[derive(Debug)]
pub(crate) struct Frame {
    event: String,
    data: String,
}

/// Sending side of an event stream, returned by
/// [`Response::event_stream`](crate::Response::event_stream).
///
/// Cloning gives another handle to the same stream. The stream ends, and the
/// connection closes, once every sender is dropped and the queued events are
/// written.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Frame>,
}

impl EventSender {
    #[inline]
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Queues one event. Waits while the connection is
    /// [`event_stream_capacity`](crate::limits::ConnLimits::event_stream_capacity)
    /// events behind.
    ///
    /// `data` containing line breaks is sent as several `data:` lines. Line
    /// breaks in `event` are removed. An empty `event` omits the `event:` line,
    /// which clients read as `message`.
    ///
    /// # Errors
    /// [`StreamClosed`] once the connection is gone or the stream was never bound.
    pub async fn send<E, D>(&self, event: E, data: D) -> Result<(), StreamClosed>
    where
        E: Into<String>,
        D: Into<String>,
    {
        let frame = Frame {
            event: event.into(),
            data: data.into(),
        };
        self.tx.send(frame).await.map_err(|_| StreamClosed)
    }

    /// Whether the receiving connection is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The connection behind an [`EventSender`] no longer accepts events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl error::Error for StreamClosed {}
impl fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("event stream closed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamStep {
    Progress,
    Finished,
}

/// Connection side of one event stream.
#[derive(Debug)]
pub(crate) struct EventStream {
    header_sent: bool,
    pending: PendingWrite,
    frames: Option<mpsc::Receiver<Frame>>,
    heartbeat: Interval,
}

impl EventStream {
    pub(crate) fn new(frames: mpsc::Receiver<Frame>) -> Self {
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT, HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            header_sent: false,
            pending: PendingWrite::default(),
            frames: Some(frames),
            heartbeat,
        }
    }

    pub(crate) fn write(&mut self, event: &str, data: &str) {
        self.send_header();

        let event: Cow<'_, str> = match memchr2(b'\r', b'\n', event.as_bytes()) {
            Some(_) => event.replace(|c| c == '\r' || c == '\n', "").into(),
            None => event.into(),
        };
        if !event.is_empty() {
            self.push_field("event", &event);
        }
        for line in data.split('\n') {
            self.push_field("data", line.strip_suffix('\r').unwrap_or(line));
        }
        self.pending.push(b"\r\n");
    }

    pub(crate) fn ping(&mut self) {
        self.send_header();
        self.pending.push(PING);
    }

    /// Bytes are waiting for the socket.
    #[inline(always)]
    pub(crate) fn is_draining(&self) -> bool {
        !self.pending.is_empty()
    }

    #[inline]
    pub(crate) async fn write_chunk<W>(&mut self, writer: &mut SocketWriter<W>) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        self.pending.write_chunk(writer).await
    }

    /// Does one unit of work: flushes pending bytes, or else waits for the next
    /// event or heartbeat. Nothing new is taken while bytes are still draining.
    ///
    /// Cancel safe.
    pub(crate) async fn drive<W>(&mut self, writer: &mut SocketWriter<W>) -> StreamStep
    where
        W: AsyncWrite + Unpin,
    {
        if writer.is_closed() {
            return StreamStep::Finished;
        }

        if !self.pending.is_empty() {
            self.write_chunk(writer).await;

            return match writer.is_closed() {
                true => StreamStep::Finished,
                false => StreamStep::Progress,
            };
        }

        let Some(frames) = self.frames.as_mut() else {
            return StreamStep::Finished;
        };

        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => self.write(&frame.event, &frame.data),
                None => self.frames = None,
            },
            _ = self.heartbeat.tick() => self.ping(),
        }

        StreamStep::Progress
    }

    /// Queues the response header unless it already went out.
    #[inline]
    pub(crate) fn send_header(&mut self) {
        if !self.header_sent {
            self.header_sent = true;
            self.pending.push(HEADER);
        }
    }

    #[inline]
    fn push_field(&mut self, name: &str, value: &str) {
        self.pending.push(name.as_bytes());
        self.pending.push(b": ");
        self.pending.push(value.as_bytes());
        self.pending.push(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{str_op, Broken, Trickle};

    fn stream() -> (EventStream, EventSender) {
        let (tx, rx) = mpsc::channel(8);
        (EventStream::new(rx), EventSender::new(tx))
    }

    async fn drain(stream: &mut EventStream, writer: &mut SocketWriter<Trickle>) {
        while !stream.write_chunk(writer).await {}
    }

    #[tokio::test]
    async fn header_sent_once() {
        let (mut stream, _tx) = stream();
        let mut writer = SocketWriter::new(Trickle::new(5));

        stream.write("tick", "1");
        stream.write("tick", "2");
        stream.ping();
        drain(&mut stream, &mut writer).await;
        stream.write("tock", "3");
        drain(&mut stream, &mut writer).await;

        let out = str_op(&writer.get_ref().written);
        assert_eq!(out.matches("text/event-stream").count(), 1);
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/event-stream\r\n\
             Connection: keep-alive\r\n\
             Cache-Control: no-cache\r\n\
             \r\n\
             event: tick\r\ndata: 1\r\n\r\n\
             event: tick\r\ndata: 2\r\n\r\n\
             : ping\r\n\r\n\
             event: tock\r\ndata: 3\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn ping_first_sends_header() {
        let (mut stream, _tx) = stream();
        let mut writer = SocketWriter::new(Trickle::new(usize::MAX));

        stream.ping();
        drain(&mut stream, &mut writer).await;

        let out = str_op(&writer.get_ref().written);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\n: ping\r\n\r\n"));
    }

    #[tokio::test]
    async fn frame_layout() {
        let (mut stream, _tx) = stream();
        let mut writer = SocketWriter::new(Trickle::new(usize::MAX));

        stream.write("", "plain");
        stream.write("multi", "a\r\nb\nc");
        stream.write("split\r\ndata: forged", "x");
        drain(&mut stream, &mut writer).await;

        let out = str_op(&writer.get_ref().written);
        let frames = &out[HEADER.len()..];
        assert_eq!(
            frames,
            "data: plain\r\n\r\n\
             event: multi\r\ndata: a\r\ndata: b\r\ndata: c\r\n\r\n\
             event: splitdata: forged\r\ndata: x\r\n\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drive_forwards_events_then_heartbeats() {
        let (mut stream, tx) = stream();
        let mut writer = SocketWriter::new(Trickle::new(usize::MAX));

        tx.send("greeting", "hi").await.unwrap();
        assert_eq!(stream.drive(&mut writer).await, StreamStep::Progress);
        assert_eq!(stream.drive(&mut writer).await, StreamStep::Progress);
        assert!(str_op(&writer.get_ref().written).ends_with("event: greeting\r\ndata: hi\r\n\r\n"));

        let start = Instant::now();
        assert_eq!(stream.drive(&mut writer).await, StreamStep::Progress);
        assert_eq!(start.elapsed(), HEARTBEAT);
        assert_eq!(stream.drive(&mut writer).await, StreamStep::Progress);
        assert!(str_op(&writer.get_ref().written).ends_with(": ping\r\n\r\n"));
    }

    #[tokio::test]
    async fn dropped_senders_finish_the_stream() {
        let (mut stream, tx) = stream();
        let mut writer = SocketWriter::new(Trickle::new(usize::MAX));

        tx.send("last", "words").await.unwrap();
        drop(tx);

        let mut steps = 0;
        while stream.drive(&mut writer).await == StreamStep::Progress {
            steps += 1;
        }

        assert_eq!(steps, 3);
        assert!(str_op(&writer.get_ref().written).ends_with("data: words\r\n\r\n"));
    }

    #[tokio::test]
    async fn write_error_finishes() {
        let (mut stream, _tx) = stream();
        let mut writer = SocketWriter::new(Broken::new(false));

        stream.write("x", "y");
        assert_eq!(stream.drive(&mut writer).await, StreamStep::Finished);
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn sender_sees_closed_stream() {
        let (stream, tx) = stream();
        assert!(!tx.is_closed());

        drop(stream);
        assert!(tx.is_closed());
        assert_eq!(tx.send("e", "d").await, Err(StreamClosed));
    }
}
