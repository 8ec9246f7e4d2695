use crate::{
    errors::ErrorKind,
    http::{
        request::{Http1Parser, Request, RequestParser},
        response::{Handled, Response},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    server::{
        connection::{shutdown_signal, HttpConnection},
        writer::SocketWriter,
    },
};
use crossbeam::queue::SegQueue;
use socket2::{SockRef, TcpKeepalive};
use std::{
    future::Future,
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::{yield_now, JoinHandle},
    time::{sleep as tokio_sleep, timeout},
};
use tracing::{debug, info, warn};

#[cfg(feature = "tls")]
use tokio_rustls::TlsAcceptor;

/// A trait for handling HTTP requests and generating responses.
///
/// `&self` is shared by every connection, so put shared state (a database
/// pool, a router, counters) behind it. Each call runs in its own task and may
/// take as long as [`ConnLimits::response_timeout`] allows; calls on the same
/// connection run concurrently and their responses are still written in
/// request order.
///
/// # Examples
///
/// Basic Request Handler
/// ```
/// use ferry_web::{Handled, Handler, Request, Response, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
///         // Simple echo handler
///         if req.path() == "/echo" {
///             resp.body(req.body()).finish()
///         } else {
///             resp.set_error(StatusCode::NotFound, "Not found :(", false)
///         }
///     }
/// }
/// ```
/// Handler with shared state
/// ```
/// use ferry_web::{Handled, Handler, Request, Response};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// struct CountingHandler {
///     served: AtomicUsize,
/// }
///
/// impl Handler for CountingHandler {
///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
///         let n = self.served.fetch_add(1, Ordering::Relaxed) + 1;
///         resp.body(format!("Request #{n}")).finish()
///     }
/// }
/// ```
pub trait Handler
where
    Self: Sync + Send + 'static,
{
    /// Fills in `response` for `request`.
    ///
    /// The returned [`Handled`] can only be obtained from a finishing method of
    /// [`Response`], so every path through the handler answers the request.
    ///
    /// A handler that runs past [`response_timeout`](ConnLimits::response_timeout)
    /// is aborted and answered with `500 Internal Server Error`. A handler that
    /// panics is answered the same way as soon as it unwinds.
    fn handle(
        &self,
        request: &Request,
        response: &mut Response,
    ) -> impl Future<Output = Handled> + Send;
}

/// Stops a running [`Server`] and reports how many connections it serves.
///
/// # Examples
///
/// ```no_run
/// # ferry_web::impt_default_handler!{ MyStruct }
/// # #[tokio::main]
/// # async fn main() {
/// use ferry_web::Server;
/// use tokio::net::TcpListener;
///
/// let server = Server::builder()
///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///     .handler(MyStruct)
///     .build();
///
/// let handle = server.shutdown_handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.unwrap();
///     handle.shutdown();
/// });
///
/// server.launch().await; // returns once every connection is closed
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl ShutdownHandle {
    fn new() -> Self {
        Self {
            signal: Arc::new(watch::channel(false).0),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stops accepting, closes every open connection and lets
    /// [`Server::launch`] return. Responses not yet written are dropped.
    #[inline]
    pub fn shutdown(&self) {
        self.signal.send_replace(true);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        *self.signal.borrow()
    }

    /// Connections currently being served (queued sockets are not counted).
    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

/// An HTTP server that processes incoming connections and requests.
///
/// A fixed pool of workers, one connection each, is spawned by
/// [`build`](ServerBuilder::build); [`launch`](Server::launch) feeds them
/// accepted sockets.
///
/// # Examples
///
/// ```no_run
/// use ferry_web::{Handled, Handler, Request, Response, Server};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
///         resp.body("Hello world!").finish()
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
    shutdown: ShutdownHandle,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use tokio::net::TcpListener;
    /// use ferry_web::Server;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build();
    /// # }
    /// ```
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            handler: None,
            _parser: PhantomData,

            server_limits: None,
            request_limits: None,
            response_limits: None,
            connection_limits: None,

            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// A handle for stopping the server from another task.
    #[inline]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Address the listener is bound to.
    #[inline]
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until [`ShutdownHandle::shutdown`] is called, then
    /// waits for the workers to close their connections.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use ferry_web::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    pub async fn launch(self) {
        let mut stop = self.shutdown.subscribe();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, workers = self.workers.len(), "server listening");
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown_signal(&mut stop) => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            self.configure(&stream, addr);

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push((stream, addr)),
                false => {
                    debug!(peer = %addr, "connection queue full");
                    self.error_queue.push((stream, addr));
                }
            }
        }

        info!("server shutting down");
        drop(self.listener);
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }
        info!("server stopped");
    }

    fn configure(&self, stream: &TcpStream, addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(self.server_limits.tcp_nodelay) {
            debug!(peer = %addr, error = %err, "TCP_NODELAY not set");
        }

        if let Some(idle) = self.server_limits.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(idle);
            if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                debug!(peer = %addr, error = %err, "TCP keepalive not set");
            }
        }
    }

    // `None` once the server is shutting down.
    #[inline]
    async fn get_stream(
        queue: &TcpQueue,
        wait: &WaitStrategy,
        stop: &watch::Receiver<bool>,
    ) -> Option<(TcpStream, SocketAddr)> {
        loop {
            if *stop.borrow() {
                return None;
            }
            if let Some(value) = queue.pop() {
                return Some(value);
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// `P` is the [`RequestParser`] every connection uses, [`Http1Parser`] unless
/// replaced with [`parser`](Self::parser).
pub struct ServerBuilder<H, P = Http1Parser>
where
    H: Handler,
    P: RequestParser,
{
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    _parser: PhantomData<P>,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
    connection_limits: Option<ConnLimits>,

    #[cfg(feature = "tls")]
    tls: Option<TlsAcceptor>,
}

impl<H, P> ServerBuilder<H, P>
where
    H: Handler,
    P: RequestParser,
{
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the request handler that will process incoming requests.
    ///
    /// **This is a required component.**
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ferry_web::{Handled, Handler, Request, Response, Server};
    /// use tokio::net::TcpListener;
    ///
    /// struct MyStruct;
    ///
    /// impl Handler for MyStruct {
    ///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
    ///         resp.body("Hello World!").finish()
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Replaces the request parser.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// use ferry_web::{limits::ReqLimits, Http1Parser, Parsed, RequestParser, Server};
    /// use tokio::net::TcpListener;
    ///
    /// /// Logs every request head before parsing it.
    /// struct Traced(Http1Parser);
    ///
    /// impl RequestParser for Traced {
    ///     fn new(limits: &ReqLimits) -> Self {
    ///         Traced(Http1Parser::new(limits))
    ///     }
    ///
    ///     fn parse(&mut self, buf: &[u8]) -> Parsed {
    ///         let parsed = self.0.parse(buf);
    ///         if let Parsed::Complete { request, .. } = &parsed {
    ///             println!("{:?} {}", request.method(), request.target());
    ///         }
    ///         parsed
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .parser::<Traced>()
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn parser<NewP: RequestParser>(self) -> ServerBuilder<H, NewP> {
        ServerBuilder {
            listener: self.listener,
            handler: self.handler,
            _parser: PhantomData,
            server_limits: self.server_limits,
            request_limits: self.request_limits,
            response_limits: self.response_limits,
            connection_limits: self.connection_limits,

            #[cfg(feature = "tls")]
            tls: self.tls,
        }
    }

    /// Serves every connection over TLS.
    ///
    /// A failed or slow handshake (see
    /// [`tls_handshake_timeout`](ConnLimits::tls_handshake_timeout)) drops
    /// the socket without a response.
    #[cfg(feature = "tls")]
    #[inline(always)]
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Configures worker count, queueing and socket options.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use ferry_web::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: 2500,
    ///         max_pending_connections: 10000,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures connection timeouts, pipelining and keep-alive.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use ferry_web::{Server, limits::ConnLimits};
    /// use tokio::net::TcpListener;
    /// use std::time::Duration;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .connection_limits(ConnLimits {
    ///         // Your changes
    ///         idle_timeout: Duration::from_secs(5),
    ///         socket_write_timeout: Duration::from_secs(2),
    ///         max_pipelined_requests: 4,
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use ferry_web::{Server, limits::ReqLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .request_limits(ReqLimits {
    ///         // Your changes
    ///         url_size: 1024,
    ///         header_count: 32,
    ///         ..ReqLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response buffers and the default compression level.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # ferry_web::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use ferry_web::{Server, limits::RespLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .response_limits(RespLimits {
    ///         // Your changes
    ///         default_capacity: 1024,
    ///         compression_level: Some(6),
    ///         ..RespLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder, spawns the workers and constructs a [`Server`].
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `handler` method must be called to create``
    ///
    /// Panics when:
    /// - The `listener` method was not called.
    /// - The `handler` method was not called.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        #[cfg(feature = "tls")]
        let tls = self.tls.clone();
        #[cfg(not(feature = "tls"))]
        let tls = ();
        let (listener, handler, limits) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());
        let shutdown = ShutdownHandle::new();
        let mut workers = Vec::with_capacity(limits.0.max_connections + limits.0.count_503_handlers);

        for _ in 0..limits.0.max_connections {
            workers.push(Self::spawn_worker(
                &stream_queue,
                &limits,
                &handler,
                &shutdown,
                tls.clone(),
            ));
        }
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                workers.push(Self::spawn_alarmist(&error_queue, &limits, &shutdown));
            }
        } else {
            workers.push(Self::spawn_quiet_alarmist(&error_queue, &limits, &shutdown));
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.0,
            shutdown,
            workers,
        }
    }

    #[inline]
    fn spawn_worker(
        queue: &TcpQueue,
        limits: &AllLimits,
        handler: &Arc<H>,
        shutdown: &ShutdownHandle,
        tls: Tls,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let wait = limits.0.wait_strategy.clone();
        let stop = shutdown.subscribe();
        let active = shutdown.active.clone();
        let handshake_timeout = limits.1.tls_handshake_timeout;
        let mut conn = HttpConnection::<H, P>::new(handler.clone(), limits);

        tokio::spawn(async move {
            while let Some((stream, addr)) = Server::get_stream(&queue, &wait, &stop).await {
                active.fetch_add(1, Ordering::Relaxed);
                serve(&mut conn, &tls, handshake_timeout, stream, addr, &stop).await;
                active.fetch_sub(1, Ordering::Relaxed);
            }
        })
    }

    #[inline]
    fn spawn_alarmist(
        queue: &TcpQueue,
        limits: &AllLimits,
        shutdown: &ShutdownHandle,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let stop = shutdown.subscribe();
        let (server_limits, conn_limits, _, resp_limits) = limits.clone();

        tokio::spawn(async move {
            while let Some((stream, addr)) =
                Server::get_stream(&queue, &server_limits.wait_strategy, &stop).await
            {
                let mut response = Response::new(&resp_limits);
                response.close();
                response.set_error_kind(ErrorKind::ServiceUnavailable, server_limits.json_errors);
                response.prepare_to_send();

                let mut writer = SocketWriter::new(stream);
                let sent = timeout(conn_limits.socket_write_timeout, async {
                    while !response.write_chunk(&mut writer).await {}
                    writer.shutdown().await;
                })
                .await;

                if sent.is_err() {
                    debug!(peer = %addr, "503 response timed out");
                }
            }
        })
    }

    #[inline]
    fn spawn_quiet_alarmist(
        queue: &TcpQueue,
        limits: &AllLimits,
        shutdown: &ShutdownHandle,
    ) -> JoinHandle<()> {
        let queue = queue.clone();
        let stop = shutdown.subscribe();
        let wait = limits.0.wait_strategy.clone();

        tokio::spawn(async move {
            while let Some((stream, _)) = Server::get_stream(&queue, &wait, &stop).await {
                drop(stream);
            }
        })
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<H>, AllLimits) {
        (
            self.listener
                .expect("The `listener` method must be called to create"),
            self.handler
                .expect("The `handler` method must be called to create"),
            (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.request_limits.unwrap_or_default().precalculate(),
                self.response_limits.unwrap_or_default(),
            ),
        )
    }
}

#[cfg(feature = "tls")]
type Tls = Option<TlsAcceptor>;
#[cfg(not(feature = "tls"))]
type Tls = ();

#[cfg(not(feature = "tls"))]
async fn serve<H: Handler, P: RequestParser>(
    conn: &mut HttpConnection<H, P>,
    _: &Tls,
    _: Duration,
    stream: TcpStream,
    addr: SocketAddr,
    stop: &watch::Receiver<bool>,
) {
    conn.run(stream, addr, stop.clone()).await;
}

#[cfg(feature = "tls")]
async fn serve<H: Handler, P: RequestParser>(
    conn: &mut HttpConnection<H, P>,
    tls: &Tls,
    handshake_timeout: Duration,
    stream: TcpStream,
    addr: SocketAddr,
    stop: &watch::Receiver<bool>,
) {
    let Some(acceptor) = tls else {
        return conn.run(stream, addr, stop.clone()).await;
    };

    match timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => conn.run(stream, addr, stop.clone()).await,
        Ok(Err(err)) => debug!(peer = %addr, error = %err, "TLS handshake failed"),
        Err(_) => debug!(peer = %addr, "TLS handshake timed out"),
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, ReqLimits, RespLimits);
