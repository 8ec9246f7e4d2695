//! The HTTP response a handler fills in and the connection serializes.

use crate::{
    compress,
    errors::ErrorKind,
    http::{
        cookie::Cookie,
        mime,
        types::{reason_phrase, HeaderMap},
    },
    limits::RespLimits,
    server::{
        event_stream::{EventSender, Frame},
        writer::{PendingWrite, SocketWriter},
    },
    Method, Request, StatusCode, Version,
};
use memchr::memchr2;
use std::{fmt::Write as _, io, path::Path, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, warn};

/// HTTP response under construction.
///
/// Instances are created by the connection, one per request, and passed to
/// [`Handler::handle`](crate::Handler::handle). Setters return `&mut Self` and
/// can be chained. A response is done once a *finishing* method runs (any
/// method returning [`Handled`]); it is then serialized and written when all
/// earlier responses on the connection have been written.
///
/// Everything not set explicitly has a default: status `200 OK`, no headers,
/// empty body. `Content-Length` and `Connection` are always computed by the
/// server.
///
/// # Examples
/// ```
/// # ferry_web::run_test(b"GET / HTTP/1.1\r\n\r\n", |_, resp| {
/// use ferry_web::{Cookie, StatusCode};
///
/// resp.status(StatusCode::Ok)
///     .header("content-type", "text/html")
///     .set_cookie(Cookie::new("visited", "1").path("/"))
///     .body("<h1>Hello World</h1>")
///     .finish()
/// # });
/// ```
///
/// # Panics
/// Every method that changes the response panics in `debug` builds when the
/// response is already finished (`Response is already finished`). In `release`
/// builds such calls are ignored.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: Vec<u8>,
    finished: bool,

    pub(crate) keep_alive: bool,
    version: Version,
    head_request: bool,
    accepts_gzip: bool,
    compression_level: Option<i32>,
    pub(crate) event_capacity: usize,

    pending: PendingWrite,
    prepared: bool,
    upgrade: Option<mpsc::Receiver<Frame>>,
}

/// Proof that a [`Response`] was finished. Returned by every finishing method
/// and required as the result of [`Handler::handle`](crate::Handler::handle).
#[doc(hidden)]
#[derive(Debug)]
pub struct Handled(());

/// Options for [`Response::send_file`] and [`Response::send_reader`].
///
/// # Examples
/// ```
/// use ferry_web::FileOptions;
/// use std::time::Duration;
///
/// let options = FileOptions {
///     charset: Some("utf-8".into()),
///     compression_level: Some(6),
///     max_age: Some(Duration::from_secs(3600)),
///     ..FileOptions::default()
/// };
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// `Content-Type` to send. When `None` it is derived from the file
    /// extension, then from the content (`text/plain` for UTF-8,
    /// `application/octet-stream` otherwise).
    pub mime_type: Option<String>,

    /// Appended to the content type as `; charset=...`.
    pub charset: Option<String>,

    /// Sends at most this many bytes from the start of the source.
    pub len: Option<usize>,

    /// gzip level for the body, see [`Response::compress_body`]. Falls back to
    /// [`RespLimits::compression_level`] when `None`.
    pub compression_level: Option<i32>,

    /// Adds `Content-Disposition: attachment; filename="..."`.
    pub attachment_filename: Option<String>,

    /// Adds `Cache-Control: max-age=N` (whole seconds).
    pub max_age: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Response {
    #[inline]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            status: StatusCode::Ok.as_u16(),
            headers: HeaderMap::default(),
            cookies: Vec::new(),
            body: Vec::new(),
            finished: false,

            keep_alive: true,
            version: Version::Http11,
            head_request: false,
            accepts_gzip: false,
            compression_level: limits.compression_level,
            event_capacity: 64,

            pending: PendingWrite::with_capacity(limits.default_capacity),
            prepared: false,
            upgrade: None,
        }
    }

    /// Takes over what the request decides about the response: keep-alive,
    /// `HEAD` (no body bytes on the wire) and gzip acceptance.
    pub(crate) fn setup_from_request(&mut self, request: &Request) {
        self.keep_alive = request.is_keep_alive();
        self.version = request.version();
        self.head_request = request.method() == Method::Head;
        self.accepts_gzip = request
            .header("accept-encoding")
            .is_some_and(accepts_gzip);
    }

    #[inline(always)]
    #[track_caller]
    fn is_open(&self) -> bool {
        debug_assert!(!self.finished, "Response is already finished");
        !self.finished
    }
}

// Inspection
impl Response {
    #[inline(always)]
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Value of a header set on this response, case-insensitive.
    #[inline]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    #[inline(always)]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// Setters
impl Response {
    /// Sets the status code.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET / HTTP/1.1\r\n\r\n", |_, resp| {
    /// use ferry_web::StatusCode;
    ///
    /// resp.status(StatusCode::NotFound)
    ///     .body(r#"{"status": "not found", "code": 404}"#)
    ///     .finish()
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.raw_status(status.as_u16())
    }

    /// Sets a numeric status code. A code without a registered reason phrase
    /// is sent as `500 Internal Server Error`.
    #[inline]
    #[track_caller]
    pub fn raw_status(&mut self, code: u16) -> &mut Self {
        if self.is_open() {
            self.status = code;
        }
        self
    }

    /// Sets a header, replacing any earlier value under the same name
    /// (compared case-insensitively).
    ///
    /// `Content-Length` and `Connection` are computed by the server; values set
    /// here for them are not sent. Use [`close()`](Response::close) to end the
    /// connection.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET / HTTP/1.1\r\n\r\n", |_, resp| {
    /// resp.header("content-type", "text/plain")
    ///     .header("x-custom-id", 128)
    ///     .header("x-cache-enabled", true)
    ///     .body("Done")
    ///     .finish()
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn header<N: Into<String>, V: ToString>(&mut self, name: N, value: V) -> &mut Self {
        if self.is_open() {
            let (name, value) = (name.into(), value.to_string());

            match valid_header(&name, &value) {
                true => self.headers.insert(name, value),
                false => warn!(name = ?name, "header with a line break or bad name dropped"),
            }
        }
        self
    }

    /// Adds a cookie. A cookie with exactly the same name replaces the earlier
    /// one; names are case-sensitive.
    #[inline]
    #[track_caller]
    pub fn set_cookie(&mut self, cookie: Cookie) -> &mut Self {
        if self.is_open() {
            if has_line_break(&cookie.to_string()) {
                warn!(name = ?cookie.name(), "cookie with a line break dropped");
                return self;
            }

            match self.cookies.iter_mut().find(|c| c.name() == cookie.name()) {
                Some(existing) => *existing = cookie,
                None => self.cookies.push(cookie),
            }
        }
        self
    }

    /// Replaces the body.
    #[inline]
    #[track_caller]
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> &mut Self {
        if self.is_open() {
            self.body.clear();
            data.write_to(&mut self.body);
        }
        self
    }

    /// Replaces the body with whatever the closure writes.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET / HTTP/1.1\r\n\r\n", |_, resp| {
    /// use std::io::Write;
    ///
    /// resp.header("content-type", "application/json")
    ///     .body_with(|w| {
    ///         let _ = write!(w, r#"{{"id": {}, "online": {}}}"#, 7, true);
    ///     })
    ///     .finish()
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> &mut Self {
        if self.is_open() {
            self.body.clear();
            f(&mut BodyWriter(&mut self.body));
        }
        self
    }

    /// Closes the connection after this response.
    #[inline]
    #[track_caller]
    pub fn close(&mut self) -> &mut Self {
        if self.is_open() {
            self.keep_alive = false;
        }
        self
    }

    /// gzip-compresses the current body and sets `Content-Encoding: gzip`.
    ///
    /// Does nothing when the request did not accept gzip, the body is empty or
    /// already encoded. If the codec fails the body is kept as is.
    #[track_caller]
    pub fn compress_body(&mut self, level: i32) -> &mut Self {
        if !self.is_open()
            || !self.accepts_gzip
            || self.body.is_empty()
            || self.headers.contains("content-encoding")
        {
            return self;
        }

        let packed = compress::compress(&self.body, level);
        if packed.is_empty() {
            warn!(len = self.body.len(), "gzip failed, sending body uncompressed");
            return self;
        }

        debug!(from = self.body.len(), to = packed.len(), "body compressed");
        self.body = packed;
        self.headers
            .insert("Content-Encoding".to_owned(), "gzip".to_owned());
        self
    }
}

// Finishing
impl Response {
    /// Finishes the response as it is.
    #[inline]
    #[track_caller]
    pub fn finish(&mut self) -> Handled {
        if self.is_open() {
            self.finished = true;
        }
        Handled(())
    }

    /// Sets the status and finishes. Used without a body, the response carries
    /// `Content-Length: 0`.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET /missing HTTP/1.1\r\n\r\n", |_, resp| {
    /// use ferry_web::StatusCode;
    ///
    /// resp.set_status(StatusCode::NotFound)
    /// # });
    /// ```
    #[inline]
    #[track_caller]
    pub fn set_status(&mut self, status: StatusCode) -> Handled {
        self.status(status).finish()
    }

    /// Sets body, `Content-Type` and status, then finishes.
    #[inline]
    #[track_caller]
    pub fn set_status_with<T: WriteBuffer>(
        &mut self,
        status: StatusCode,
        body: T,
        content_type: &str,
    ) -> Handled {
        self.status(status)
            .header("Content-Type", content_type)
            .body(body)
            .finish()
    }

    /// Sends `message` as a plain-text error, optionally closing the connection.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"POST /upload HTTP/1.1\r\n\r\n", |req, resp| {
    /// use ferry_web::StatusCode;
    ///
    /// if req.body().is_empty() {
    ///     return resp.set_error(StatusCode::BadRequest, "empty upload", true);
    /// }
    /// resp.finish()
    /// # });
    /// ```
    #[track_caller]
    pub fn set_error(&mut self, status: StatusCode, message: &str, close: bool) -> Handled {
        if close {
            self.close();
        }
        self.set_status_with(status, message, "text/plain; charset=utf-8")
    }

    /// Redirects to `url` with `308 Permanent Redirect` or
    /// `307 Temporary Redirect`, both of which keep the request method.
    #[track_caller]
    pub fn redirect(&mut self, url: &str, permanent: bool) -> Handled {
        let status = match permanent {
            true => StatusCode::PermanentRedirect,
            false => StatusCode::TemporaryRedirect,
        };

        self.status(status).header("Location", url).body("").finish()
    }

    /// Turns the connection into a server-sent event stream and finishes.
    ///
    /// Events sent through the returned [`EventSender`] are written after every
    /// earlier response on the connection. No further requests are served on
    /// it; the connection closes when all senders are dropped.
    ///
    /// # Examples
    /// ```no_run
    /// use ferry_web::{Handled, Handler, Request, Response};
    /// use std::time::Duration;
    ///
    /// struct Clock;
    ///
    /// impl Handler for Clock {
    ///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
    ///         let (handled, events) = resp.event_stream();
    ///
    ///         tokio::spawn(async move {
    ///             for tick in 0u64.. {
    ///                 if events.send("tick", tick.to_string()).await.is_err() {
    ///                     break;
    ///                 }
    ///                 tokio::time::sleep(Duration::from_secs(1)).await;
    ///             }
    ///         });
    ///         handled
    ///     }
    /// }
    /// ```
    #[track_caller]
    pub fn event_stream(&mut self) -> (Handled, EventSender) {
        let (tx, rx) = mpsc::channel(self.event_capacity.max(1));

        if self.is_open() {
            self.upgrade = Some(rx);
            self.finished = true;
        }
        (Handled(()), EventSender::new(tx))
    }

    /// Sends a file and finishes.
    ///
    /// A missing file gives `404 Not Found`, any other I/O error
    /// `500 Internal Server Error`.
    ///
    /// # Examples
    /// ```no_run
    /// use ferry_web::{FileOptions, Handled, Handler, Request, Response};
    ///
    /// struct Assets;
    ///
    /// impl Handler for Assets {
    ///     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
    ///         let path = format!("./public{}", req.path());
    ///         resp.send_file(path, FileOptions::default()).await
    ///     }
    /// }
    /// ```
    pub async fn send_file<P: AsRef<Path>>(&mut self, path: P, options: FileOptions) -> Handled {
        let path = path.as_ref();

        match File::open(path).await {
            Ok(file) => self.send_source(file, options, mime::from_path(path)).await,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "file not found");
                self.set_status(StatusCode::NotFound)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot open file");
                self.set_status(StatusCode::InternalServerError)
            }
        }
    }

    /// Like [`send_file`](Response::send_file), reading from an already open
    /// source. Without [`FileOptions::mime_type`] the type is sniffed.
    pub async fn send_reader<R>(&mut self, reader: R, options: FileOptions) -> Handled
    where
        R: AsyncRead + Unpin + Send,
    {
        self.send_source(reader, options, None).await
    }

    async fn send_source<R>(
        &mut self,
        reader: R,
        options: FileOptions,
        guessed: Option<&'static str>,
    ) -> Handled
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.is_open() {
            return Handled(());
        }

        let limit = options.len.map_or(u64::MAX, |len| len as u64);
        let mut data = Vec::new();
        if let Err(err) = reader.take(limit).read_to_end(&mut data).await {
            warn!(error = %err, read = data.len(), "cannot read response body source");
            return self.set_status(StatusCode::InternalServerError);
        }

        let mime = options
            .mime_type
            .as_deref()
            .or(guessed)
            .unwrap_or_else(|| mime::sniff(&data));
        let content_type = match &options.charset {
            Some(charset) => format!("{mime}; charset={charset}"),
            None => mime.to_owned(),
        };
        self.header("Content-Type", content_type);

        if let Some(name) = &options.attachment_filename {
            self.header(
                "Content-Disposition",
                format!("attachment; filename=\"{name}\""),
            );
        }
        if let Some(max_age) = options.max_age {
            self.header("Cache-Control", format!("max-age={}", max_age.as_secs()));
        }

        self.body = data;
        if let Some(level) = options.compression_level.or(self.compression_level) {
            self.compress_body(level);
        }

        self.finish()
    }
}

// Connection side
impl Response {
    /// Replaces everything with the server's own answer to `kind`.
    pub(crate) fn set_error_kind(&mut self, kind: ErrorKind, json: bool) -> Handled {
        self.status = kind.status().as_u16();
        self.headers = HeaderMap::default();
        self.cookies.clear();
        self.body.clear();

        if json {
            self.headers
                .insert("Content-Type".to_owned(), "application/json".to_owned());
            self.body.extend_from_slice(kind.json().as_bytes());
        }

        self.finished = true;
        Handled(())
    }

    #[inline(always)]
    pub(crate) fn is_prepared(&self) -> bool {
        self.prepared
    }

    #[inline]
    pub(crate) fn take_upgrade(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.upgrade.take()
    }

    /// Serializes the status line, headers, `Set-Cookie` lines and body into
    /// the write buffer. Runs once; later calls do nothing.
    pub(crate) fn prepare_to_send(&mut self) {
        if self.prepared {
            return;
        }
        self.prepared = true;
        self.finished = true;

        let reason = match reason_phrase(self.status) {
            "" => {
                warn!(status = self.status, "status code has no reason phrase, sending 500");
                self.status = StatusCode::InternalServerError.as_u16();
                StatusCode::InternalServerError.reason_phrase()
            }
            reason => reason,
        };

        let mut head = String::with_capacity(64 + 48 * (self.headers.len() + self.cookies.len()));
        let _ = write!(head, "HTTP/1.1 {} {reason}\r\n", self.status);

        for header in self.headers.iter() {
            let name = header.name();
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            let _ = write!(head, "{name}: {}\r\n", header.value());
        }

        let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        match (self.keep_alive, self.version) {
            (false, _) => head.push_str("Connection: close\r\n"),
            (true, Version::Http10) => head.push_str("Connection: keep-alive\r\n"),
            (true, Version::Http11) => {}
        }

        for cookie in &self.cookies {
            cookie.write_header(&mut head);
        }
        head.push_str("\r\n");

        self.pending.push(head.as_bytes());
        if !self.head_request {
            self.pending.push(&self.body);
        }
    }

    #[cfg(test)]
    pub(crate) fn unsent(&self) -> &[u8] {
        self.pending.unsent()
    }

    /// One write attempt of the serialized response, see [`PendingWrite::write_chunk`].
    #[inline]
    pub(crate) async fn write_chunk<W>(&mut self, writer: &mut SocketWriter<W>) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        self.pending.write_chunk(writer).await
    }
}

#[inline]
fn has_line_break(value: &str) -> bool {
    memchr2(b'\r', b'\n', value.as_bytes()).is_some()
}

// Names are HTTP tokens, values may not end the header line early.
fn valid_header(name: &str, value: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b))
        && !has_line_break(value)
}

fn accepts_gzip(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|item| {
        let mut params = item.split(';');
        let coding = params.next().unwrap_or_default().trim();

        let refused = params.any(|param| {
            param
                .trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });

        (coding.eq_ignore_ascii_case("gzip") || coding == "*") && !refused
    })
}

pub mod write {
    use std::{borrow::Cow, io, io::Write as _, rc::Rc, sync::Arc};

    /// Writer for the response body, used in
    /// [`body_with`](crate::Response::body_with).
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET / HTTP/1.1\r\n\r\n", |_, resp| {
    /// resp.body_with(|w| {
    ///     w.write("count: ");
    ///     w.write(42);
    ///     w.write(b", ok: ");
    ///     w.write(true);
    /// })
    /// .finish()
    /// # });
    /// ```
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends a value to the body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Values that can be written into a response body.
    ///
    /// Implemented for strings, byte slices, integers, `bool` and `char`.
    /// Floats are left out on purpose: format them yourself with the precision
    /// you need.
    ///
    /// # Example
    /// ```
    /// use ferry_web::WriteBuffer;
    ///
    /// struct Celsius(i16);
    ///
    /// impl WriteBuffer for Celsius {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         self.0.write_to(buffer);
    ///         buffer.extend_from_slice("°C".as_bytes());
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (as_bytes => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    let bytes: &[u8] = self.as_ref();
                    buffer.extend_from_slice(bytes);
                }
            })*
        };
        (as_str => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    let text: &str = self.as_ref();
                    buffer.extend_from_slice(text.as_bytes());
                }
            })*
        };
        (display => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline]
                fn write_to(&self, buffer: &mut Vec<u8>) {
                    let _ = write!(buffer, "{self}");
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }

    impl WriteBuffer for str {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self.as_bytes());
        }
    }

    impl WriteBuffer for [u8] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }

    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }

    impl_write_buffer! {
        as_str => String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        as_bytes => Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl_write_buffer! {
        display => u8, u16, u32, u64, u128, usize,
            i8, i16, i32, i64, i128, isize, bool, char
    }
}

pub use write::{BodyWriter, WriteBuffer};




#[cfg(test)]
mod body_tests {
    use super::*;

    macro_rules! test_body {
        ($($data:expr => $expected:expr;)*) => {$(
            let mut resp = Response::new(&RespLimits::default());
            resp.body("replaced").body($data);
            assert_eq!(resp.body_bytes(), $expected);
        )*};
    }

    #[test]
    fn body_values() {
        test_body! {
            "sample body" => b"sample body";
            String::from("owned") => b"owned";
            vec![35u8, 33, 43] => b"#!+";
            [1u8, 2] => &[1u8, 2];
            -1234 => b"-1234";
            u128::MAX => b"340282366920938463463374607431768211455";
            true => b"true";
            'ж' => "ж".as_bytes();
        }
    }

    #[test]
    fn body_with_writer() {
        use std::io::Write;

        let mut resp = Response::new(&RespLimits::default());
        resp.body("old").body_with(|w| {
            w.write("id=");
            w.write(7u8);
            let _ = write!(w, ", {}-{}", 6, 2);
        });

        assert_eq!(resp.body_bytes(), b"id=7, 6-2");
    }

    #[test]
    fn composites() {
        let mut resp = Response::new(&RespLimits::default());
        resp.set_status_with(StatusCode::Created, r#"{"id":1}"#, "application/json");
        assert_eq!(resp.status_code(), 201);
        assert_eq!(resp.header_value("content-type"), Some("application/json"));
        assert_eq!(resp.body_bytes(), br#"{"id":1}"#);

        let mut resp = Response::new(&RespLimits::default());
        resp.set_error(StatusCode::Forbidden, "no access", true);
        assert_eq!(resp.status_code(), 403);
        assert!(!resp.keep_alive);
        assert_eq!(
            resp.header_value("content-type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(resp.body_bytes(), b"no access");

        for (permanent, code) in [(true, 308), (false, 307)] {
            let mut resp = Response::new(&RespLimits::default());
            resp.body("stale").redirect("/new", permanent);
            assert_eq!(resp.status_code(), code);
            assert_eq!(resp.header_value("location"), Some("/new"));
            assert!(resp.body_bytes().is_empty());
        }
    }

    #[test]
    fn error_kinds() {
        for json in [true, false] {
            let mut resp = Response::new(&RespLimits::default());
            resp.header("x-user", 1).body("partial");
            resp.set_error_kind(ErrorKind::ResponseTimeout, json);

            assert!(resp.is_finished());
            assert_eq!(resp.status_code(), 500);
            assert_eq!(resp.header_value("x-user"), None);
            match json {
                true => assert_eq!(resp.body_bytes(), ErrorKind::ResponseTimeout.json().as_bytes()),
                false => assert!(resp.body_bytes().is_empty()),
            }
        }
    }
}

#[cfg(test)]
mod compression_tests {
    use super::*;
    use crate::tools::*;
    use memchr::memmem;

    fn response(accept: Option<&str>) -> Response {
        let raw = match accept {
            Some(value) => format!("GET / HTTP/1.1\r\nAccept-Encoding: {value}\r\n\r\n"),
            None => "GET / HTTP/1.1\r\n\r\n".to_owned(),
        };

        let mut resp = Response::new(&RespLimits::default());
        resp.setup_from_request(&request(raw.as_bytes()));
        resp
    }

    #[test]
    fn negotiation() {
        #[rustfmt::skip]
        let cases = [
            (Some("gzip"),                  true),
            (Some("deflate, GZIP;q=0.5"),   true),
            (Some("br, *"),                 true),
            (Some("gzip;q=0"),              false),
            (Some("gzip; q=0.0, br"),       false),
            (Some("deflate, br"),           false),
            (Some(""),                      false),
            (None,                          false),
        ];

        for (accept, expected) in cases {
            assert_eq!(response(accept).accepts_gzip, expected, "{accept:?}");
        }
    }

    #[test]
    fn compresses_when_accepted() {
        let text = "lorem ipsum dolor sit amet ".repeat(400);

        let mut resp = response(Some("gzip"));
        resp.body(text.as_str()).compress_body(6);

        assert_eq!(resp.header_value("content-encoding"), Some("gzip"));
        assert!(resp.body_bytes().len() < text.len());
        assert_eq!(compress::decompress(resp.body_bytes()), text.as_bytes());

        // Not twice.
        let once = resp.body_bytes().to_vec();
        resp.compress_body(9);
        assert_eq!(resp.body_bytes(), once);

        resp.finish();
        resp.prepare_to_send();
        let len = format!("Content-Length: {}\r\n", once.len());
        assert!(memmem::find(resp.unsent(), len.as_bytes()).is_some());
        assert!(resp.unsent().ends_with(&once));
    }

    #[test]
    fn skipped() {
        let mut resp = response(None);
        resp.body("plain").compress_body(6);
        assert_eq!(resp.header_value("content-encoding"), None);
        assert_eq!(resp.body_bytes(), b"plain");

        let mut resp = response(Some("gzip"));
        resp.compress_body(6);
        assert_eq!(resp.header_value("content-encoding"), None);
        assert!(resp.body_bytes().is_empty());
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;
    use crate::tools::*;
    use std::path::PathBuf;

    struct TempFile(PathBuf);

    impl TempFile {
        fn new(name: &str, content: &[u8]) -> Self {
            let dir = std::env::temp_dir().join(format!("ferry_web-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();

            let path = dir.join(name);
            std::fs::write(&path, content).unwrap();
            Self(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[tokio::test]
    async fn sends_file_with_type() {
        let file = TempFile::new("index.html", b"<h1>hi</h1>");
        let mut resp = Response::new(&RespLimits::default());

        resp.send_file(&file.0, FileOptions::default()).await;

        assert!(resp.is_finished());
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.header_value("content-type"), Some("text/html"));
        assert_eq!(resp.body_bytes(), b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn options() {
        let file = TempFile::new("report.csv", b"a,b\n1,2\n3,4\n");
        let mut resp = Response::new(&RespLimits::default());

        let options = FileOptions {
            charset: Some("utf-8".into()),
            len: Some(4),
            attachment_filename: Some("report.csv".into()),
            max_age: Some(Duration::from_millis(90_500)),
            ..FileOptions::default()
        };
        resp.send_file(&file.0, options).await;

        assert_eq!(resp.body_bytes(), b"a,b\n");
        assert_eq!(
            resp.header_value("content-type"),
            Some("text/csv; charset=utf-8")
        );
        assert_eq!(
            resp.header_value("content-disposition"),
            Some("attachment; filename=\"report.csv\"")
        );
        assert_eq!(resp.header_value("cache-control"), Some("max-age=90"));
    }

    #[tokio::test]
    async fn missing_file() {
        let mut resp = Response::new(&RespLimits::default());
        resp.send_file("/definitely/not/here.txt", FileOptions::default())
            .await;

        assert_eq!(resp.status_code(), 404);
        assert!(resp.body_bytes().is_empty());
    }

    #[tokio::test]
    async fn directory_is_server_error() {
        let dir = std::env::temp_dir();
        let mut resp = Response::new(&RespLimits::default());
        resp.send_file(&dir, FileOptions::default()).await;

        assert_eq!(resp.status_code(), 500);
    }

    #[tokio::test]
    async fn reader_sniffing() {
        let cases: [(&[u8], Option<&str>, &str); 3] = [
            (b"just text", None, "text/plain"),
            (&[0xde, 0xad, 0xbe, 0xef], None, "application/octet-stream"),
            (b"{}", Some("application/json"), "application/json"),
        ];

        for (data, mime_type, expected) in cases {
            let mut resp = Response::new(&RespLimits::default());
            let options = FileOptions {
                mime_type: mime_type.map(str::to_owned),
                ..FileOptions::default()
            };
            resp.send_reader(data, options).await;

            assert_eq!(resp.header_value("content-type"), Some(expected));
            assert_eq!(resp.body_bytes(), data);
        }
    }

    #[tokio::test]
    async fn default_compression_level() {
        let text = "compressible ".repeat(500);
        let limits = RespLimits {
            compression_level: Some(6),
            ..RespLimits::default()
        };

        let mut resp = Response::new(&limits);
        resp.setup_from_request(&request(
            b"GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n",
        ));
        resp.send_reader(text.as_bytes(), FileOptions::default())
            .await;

        assert_eq!(resp.header_value("content-encoding"), Some("gzip"));
        assert_eq!(compress::decompress(resp.body_bytes()), text.as_bytes());
    }
}

#[cfg(test)]
mod write_tests {
    use super::*;
    use crate::tools::*;

    #[tokio::test]
    async fn partial_writes() {
        let mut resp = Response::new(&RespLimits::default());
        resp.body("x".repeat(1000)).finish();
        resp.prepare_to_send();

        let expected = resp.unsent().to_vec();
        let mut writer = SocketWriter::new(Trickle::new(64));

        let mut attempts = 1;
        while !resp.write_chunk(&mut writer).await {
            attempts += 1;
        }

        assert_eq!(writer.get_ref().written, expected);
        assert_eq!(attempts, expected.len().div_ceil(64));
        assert!(resp.write_chunk(&mut writer).await);
        assert_eq!(writer.get_ref().calls, attempts);
    }

    #[test]
    fn upgrade() {
        let mut resp = Response::new(&RespLimits::default());
        let (_, events) = resp.event_stream();

        assert!(resp.is_finished());
        assert!(!events.is_closed());

        let rx = resp.take_upgrade();
        assert!(rx.is_some());
        drop(rx);
        assert!(events.is_closed());
    }
}
