//! Server configuration: limits, timeouts and defaults
//!
//! # Security-First Defaults
//!
//! Default limits are conservative, to guard against:
//! - Resource exhaustion attacks
//! - Slowloris attacks (see [`ConnLimits::idle_timeout`])
//! - Header flooding
//! - Pipelining floods (see [`ConnLimits::max_pipelined_requests`])
//!
//! # Examples
//!
//! ```no_run
//! # ferry_web::impt_default_handler!{MyHandler}
//! use ferry_web::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             idle_timeout: Duration::from_secs(30),
//!             response_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 64 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency, queueing, and socket options.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue has room | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /-------------------------\   No   [------]
/// [ Worker ] <====== | Is there a free worker? | =====> [ Wait ]
/// [--------]         \-------------------------/        [------]
/// ```
///
/// A worker owns one connection at a time and runs it to completion before
/// taking the next socket from the queue.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of connections served at the same time (default: `100`).
    ///
    /// Exactly this many workers are spawned by [`ServerBuilder::build`](crate::ServerBuilder::build).
    pub max_connections: usize,

    /// Maximum number of accepted sockets waiting for a worker (default: `250`).
    ///
    /// When the queue is full, new sockets get an immediate `503` response.
    pub max_pending_connections: usize,

    /// How idle workers wait for the next socket (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Tasks answering `503` to sockets that overflowed the queue (default: `1`).
    ///
    /// Set to 0 to drop such sockets without a response.
    pub count_503_handlers: usize,

    /// Format for responses produced by the server itself (default: `true`)
    ///
    /// If `true`, a malformed request is answered with:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// Content-Type: application/json\r
    /// Content-Length: 55\r
    /// \r
    /// {"error":"Invalid HTTP method","code":"INVALID_METHOD"}
    /// ```
    /// If `false`, the body is empty and `Content-Length` is `0`.
    pub json_errors: bool,

    /// Sets `TCP_NODELAY` on accepted sockets (default: `true`).
    pub tcp_nodelay: bool,

    /// Idle time before TCP keepalive probes start, `None` leaves the OS default
    /// (default: `None`).
    pub tcp_keepalive: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
            json_errors: true,
            tcp_nodelay: true,
            tcp_keepalive: None,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// # Note
    /// Keeps a core busy. Only useful for latency benchmarks.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// Connection-level limits and timeouts
///
/// # Timers
///
/// A connection runs three kinds of timers:
/// - one **idle** timer, armed only while nothing is in flight;
/// - one **response** timer per dispatched request;
/// - one **write stall** timer while output is waiting for the socket.
///
/// ```text
///  bytes in ──> [ Reading ] ──> [ Dispatched ] ──> [ Writing ] ──> [ Idle ]
///                   ^            response timer     write timer       |
///                   |                                                 |
///                   \─────────────────── idle timer ──────────────────/
/// ```
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Time a connection may sit with no incoming bytes and nothing in flight
    /// (default: `10 seconds`)
    ///
    /// The timer is suspended while any response is pending or while an event
    /// stream is bound. When it fires, the connection is closed without a response.
    pub idle_timeout: Duration,

    /// Time a handler has to finish its [`Response`](crate::Response) (default: `30 seconds`)
    ///
    /// On expiry the handler task is aborted and the client receives
    /// `500 Internal Server Error`. The response still goes out in request order.
    pub response_timeout: Duration,

    /// Time pending output may wait for the socket without progress (default: `3 seconds`)
    ///
    /// A peer that stops reading is disconnected once this elapses.
    pub socket_write_timeout: Duration,

    /// Maximum number of requests served on one connection (default: `100`)
    ///
    /// The response to the last allowed request carries `Connection: close`.
    pub max_requests_per_connection: usize,

    /// Maximum number of requests in flight on one connection (default: `16`)
    ///
    /// Pipelined requests beyond this stay unread in the socket until earlier
    /// responses have been written.
    pub max_pipelined_requests: usize,

    /// Allows persistent connections (default: `true`)
    ///
    /// With `false`, every response closes the connection.
    pub keep_alive: bool,

    /// Events an application may queue ahead of the socket for one event
    /// stream (default: `64`)
    pub event_stream_capacity: usize,

    /// Time allowed for the TLS handshake (default: `5 seconds`)
    pub tls_handshake_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,
            max_pipelined_requests: 16,
            keep_alive: true,
            event_stream_capacity: 64,
            tls_handshake_timeout: Duration::from_secs(5),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits for the default [`Http1Parser`](crate::Http1Parser)
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate requests
/// - `414 URI Too Long` for normal API calls
/// - `431 Request Header Fields Too Large`
///
/// # Head size
///
/// The largest request head accepted before the parser gives up waiting for
/// the blank line:
///
/// | Component | Formula | Default |
/// |-----------|---------|---------|
/// | First Line | `19 + url_size` | 1,043 B |
/// | Header Line | `header_name_size + header_value_size + 4` | 1,092 B |
/// | **Head** | `first line + header_count × header line + 2` | **35,989 B** |
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request target length, path and query included (default: `1024 B`)
    pub url_size: usize,

    /// Maximum number of headers per request (default: `32`)
    pub header_count: usize,
    /// Maximum header name length in bytes (default: `64 B`)
    pub header_name_size: usize,
    /// Maximum header value length in bytes (default: `1024 B`)
    pub header_value_size: usize,

    /// Maximum request body size in bytes (default: `1 MB`)
    ///
    /// Bodies are buffered in memory before the handler runs.
    pub body_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub precalc: ReqLimitsPrecalc,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            url_size: 1024,

            header_count: 32,
            header_name_size: 64,
            header_value_size: 1024,

            body_size: 1024 * 1024,

            precalc: ReqLimitsPrecalc::default(),
        }
    }
}

impl ReqLimits {
    /// Returns the largest request head (first line, headers and the blank line)
    /// these limits accept.
    ///
    /// # Example
    /// ```
    /// use ferry_web::limits::ReqLimits;
    ///
    /// assert_eq!(ReqLimits::default().max_head_size(), 35_989);
    /// ```
    #[inline(always)]
    pub fn max_head_size(self) -> usize {
        self.precalculate().precalc.head
    }

    #[inline(always)]
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = self.first_line();
        self.precalc.head = self.precalc.first_line + self.header_count * self.h_line() + 2;

        self
    }

    #[inline(always)]
    // Formula: Method(7) + " " + URl + " " + Version(8) + "\r\n"
    fn first_line(&self) -> usize {
        19 + self.url_size
    }

    #[inline(always)]
    // Formula: Name + ": " + Value +  "\r\n"
    fn h_line(&self) -> usize {
        self.header_name_size + self.header_value_size + 4
    }
}

#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct ReqLimitsPrecalc {
    pub(crate) first_line: usize,
    pub(crate) head: usize,
}

/// Configuration for building responses.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the serialized response buffer (default: `1024 B`)
    pub default_capacity: usize,

    /// gzip level used by [`Response::send_file`](crate::Response::send_file)
    /// when [`FileOptions`](crate::FileOptions) does not name one (default: `None`,
    /// no compression)
    ///
    /// Values are clamped to `-1..=9`, where `-1` is the codec's default level.
    pub compression_level: Option<i32>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            compression_level: None,

            _priv: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_size() {
        let cases = [
            (ReqLimits::default(), 35_989),
            (
                ReqLimits {
                    url_size: 10,
                    header_count: 0,
                    ..ReqLimits::default()
                },
                31,
            ),
            (
                ReqLimits {
                    url_size: 1,
                    header_count: 2,
                    header_name_size: 3,
                    header_value_size: 4,
                    ..ReqLimits::default()
                },
                20 + 2 * 11 + 2,
            ),
        ];

        for (limits, expected) in cases {
            let limits = limits.precalculate();
            assert_eq!(limits.precalc.head, expected);
            assert_eq!(limits.precalc.first_line, 19 + limits.url_size);
        }
    }
}
