//! ferry_web - embeddable HTTP/1.1 server engine with pipelining and event streams
//!
//! The server owns the connection lifecycle: it reads and parses requests,
//! hands each one to your [`Handler`] together with a fresh [`Response`], and
//! writes the responses back in request order, however the handlers interleave.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections and pipelining (several requests in
//!   flight on one connection)
//! - **HTTP/1.0**: `Connection: keep-alive` opt-in
//! - **Server-sent events**: a handler may turn its response into a long-lived
//!   event stream, see [`Response::event_stream`]
//! - **TLS** (feature `tls`): `tokio-rustls` acceptor
//!
//! Bodies are framed by `Content-Length` only. Chunked transfer encoding is
//! refused on input and never produced.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use ferry_web::{Handled, Handler, Request, Response, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!").finish()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Routing on the path:
//! ```no_run
//! use ferry_web::{Handled, Handler, Request, Response, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
//!         match req.path().split('/').collect::<Vec<_>>()[..] {
//!             ["", "api", user, "name"] => resp.set_status_with(StatusCode::Ok, user, "text/plain"),
//!             ["", "api", "echo"] => resp.body(req.body()).finish(),
//!             ["", "old"] => resp.redirect("/api/echo", true),
//!             _ => resp.set_status(StatusCode::NotFound),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Advanced configuration:
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
//!             max_connections: 5000, // Higher concurrency
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             idle_timeout: Duration::from_secs(5),
//!             max_pipelined_requests: 32,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 18,      // More headers for complex APIs
//!             body_size: 16 * 1024,  // 16KB for larger payloads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Logging
//!
//! The crate reports through [`tracing`](https://docs.rs/tracing) and never
//! installs a subscriber. Connection events are logged at `debug`, dropped
//! data and misconfiguration at `warn`.

pub(crate) mod http {
    pub(crate) mod cookie;
    pub(crate) mod mime;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod event_stream;
    pub(crate) mod server_impl;
    pub(crate) mod writer;
}
pub mod compress;
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::ErrorKind,
    http::{
        cookie::{Cookie, SameSite},
        request::{Http1Parser, Parsed, Request, RequestParser},
        response::{
            write::{BodyWriter, WriteBuffer},
            FileOptions, Handled, Response,
        },
        types::{reason_phrase, Header, Method, StatusCode, Version},
    },
    server::{
        event_stream::{EventSender, StreamClosed},
        server_impl::{Handler, Server, ServerBuilder, ShutdownHandle},
    },
};

#[doc(hidden)]
#[track_caller]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(raw: &[u8], f: F) {
    let limits = crate::limits::ReqLimits::default();

    let Parsed::Complete { request, .. } = Http1Parser::new(&limits).parse(raw) else {
        panic!("run_test needs a complete request");
    };
    let mut response = Response::new(&crate::limits::RespLimits::default());
    response.setup_from_request(&request);

    f(&request, &mut response);
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use ferry_web::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!").finish()
            }
        }
    };
}

#[cfg(test)]
pub mod tools {
    use crate::{limits::ReqLimits, Http1Parser, Parsed, Request, RequestParser, Response};
    use std::{
        io,
        pin::Pin,
        str::from_utf8,
        task::{Context, Poll},
    };
    use tokio::io::AsyncWrite;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[track_caller]
    pub fn request(raw: &[u8]) -> Request {
        match Http1Parser::new(&ReqLimits::default()).parse(raw) {
            Parsed::Complete { request, .. } => request,
            other => panic!("not a complete request: {other:?}"),
        }
    }

    /// Serializes `resp` and returns what would go on the wire.
    pub fn wire(resp: &mut Response) -> String {
        resp.prepare_to_send();
        str_op(resp.unsent()).to_owned()
    }

    /// Writer accepting at most `step` bytes per call.
    #[derive(Debug, Default)]
    pub struct Trickle {
        pub written: Vec<u8>,
        pub calls: usize,
        step: usize,
    }

    impl Trickle {
        pub fn new(step: usize) -> Self {
            Self {
                written: Vec::new(),
                calls: 0,
                step,
            }
        }
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.step);
            self.calls += 1;
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Writer that fails every call, with `Ok(0)` when `zero` is set.
    #[derive(Debug)]
    pub struct Broken {
        pub calls: usize,
        zero: bool,
    }

    impl Broken {
        pub fn new(zero: bool) -> Self {
            Self { calls: 0, zero }
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.calls += 1;
            Poll::Ready(match self.zero {
                true => Ok(0),
                false => Err(io::ErrorKind::BrokenPipe.into()),
            })
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
