use crate::{
    errors::ErrorKind,
    http::types::{self, Header, HeaderMap},
    limits::ReqLimits,
    Method, Version,
};
use memchr::{memchr, memmem, memrchr};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A parsed HTTP request.
///
/// The request owns its data, so a handler may keep using it across `.await`
/// points while the connection keeps reading pipelined requests.
///
/// # Input data requirements
///
/// The request head (everything before the body) must be `UTF-8`. Otherwise the
/// parser rejects the request with `400 Bad Request`.
///
/// #### General designations
/// - `SP`: ASCII space (0x20)
/// - `CRLF`: `"\r\n"`, **exactly this sequence required**
/// ---
/// - `[METHOD]`: See the values in [Method](crate::Method)
/// - `[TARGET]`: origin form `/path?query`, see
///   [[RFC7230, Section 5.3.1](https://datatracker.ietf.org/doc/html/rfc7230#section-5.3.1)],
///   or `*` for `OPTIONS`
///
/// ## First line
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/" ("1.0" | "1.1") CRLF
/// ```
///
/// ## Header
/// ```text
/// [NAME] ":" OWS [VALUE] OWS CRLF
/// ```
/// Names are matched case-insensitively, surrounding spaces and tabs are
/// stripped from values.
///
/// The parser interprets three headers:
///
/// | Header              | Purpose                 | Values                                        |
/// |---------------------|-------------------------|-----------------------------------------------|
/// | `Content-Length`    | Body size               | Any `usize` up to [`ReqLimits::body_size`]     |
/// | `Connection`        | Keep-alive flag         | `keep-alive` or `close` tokens                |
/// | `Transfer-Encoding` | Rejected with `501`     | Not supported                                 |
///
/// ## Body
///
/// Only bodies framed by `Content-Length` are accepted. The body is fully
/// buffered before the handler runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    target: String,
    path_end: usize,
    version: Version,

    headers: HeaderMap,
    content_length: Option<usize>,
    keep_alive: bool,

    body: Vec<u8>,

    pub(crate) client_addr: SocketAddr,
}

impl Request {
    pub(crate) const UNKNOWN_CLIENT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
}

// Public API
impl Request {
    /// Address of the peer, `0.0.0.0:0` when unknown.
    #[inline(always)]
    pub const fn client_addr(&self) -> &SocketAddr {
        &self.client_addr
    }

    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The request target as sent, path and query included.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target without its query.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.target[..self.path_end]
    }

    /// The raw query after `?`, if any.
    #[inline]
    pub fn query(&self) -> Option<&str> {
        self.target.get(self.path_end + 1..)
    }

    /// Value of the first `key=value` pair of the query with this exact key.
    /// A bare `key` yields an empty value. Nothing is percent-decoded.
    ///
    /// # Examples
    /// ```
    /// # ferry_web::run_test(b"GET /search?q=rust&page=2&raw HTTP/1.1\r\n\r\n", |req, resp| {
    /// assert_eq!(req.query_param("q"), Some("rust"));
    /// assert_eq!(req.query_param("raw"), Some(""));
    /// assert_eq!(req.query_param("missing"), None);
    /// # resp.finish()
    /// # });
    /// ```
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query()?
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    /// Uses linear search.
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All headers in the order they were received.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the client asked to keep the connection open.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The request body, empty when none was sent.
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Outcome of one [`RequestParser::parse`] call.
#[derive(Debug)]
pub enum Parsed {
    /// A full request was found at the start of the buffer.
    Complete {
        request: Request,
        /// Bytes of the buffer this request occupied.
        consumed: usize,
    },

    /// More bytes are needed.
    Incomplete,

    /// The buffer does not start with a valid request.
    Malformed {
        error: ErrorKind,
        /// Bytes to skip to reach the next request, `None` when the stream
        /// cannot be resynchronized and the connection must close.
        consumed: Option<usize>,
    },
}

/// Turns buffered bytes into [`Request`]s.
///
/// The connection calls [`parse`](RequestParser::parse) with everything it has
/// buffered and not yet consumed, every time new bytes arrive or a slot frees up.
pub trait RequestParser: Send + 'static {
    fn new(limits: &ReqLimits) -> Self
    where
        Self: Sized;

    fn parse(&mut self, buf: &[u8]) -> Parsed;
}

/// The default HTTP/1.x parser.
#[derive(Debug, Clone)]
pub struct Http1Parser {
    limits: ReqLimits,
}

impl RequestParser for Http1Parser {
    #[inline]
    fn new(limits: &ReqLimits) -> Self {
        Self {
            limits: limits.clone().precalculate(),
        }
    }

    fn parse(&mut self, buf: &[u8]) -> Parsed {
        let max_head = self.limits.precalc.head;
        let window = &buf[..buf.len().min(max_head)];

        let Some(head_end) = memmem::find(window, b"\r\n\r\n") else {
            if buf.len() >= max_head {
                return Parsed::Malformed {
                    error: ErrorKind::HeadTooLarge,
                    consumed: None,
                };
            }
            return Parsed::Incomplete;
        };

        let head = &buf[..head_end];
        let body_start = head_end + 4;

        let mut request = match self.parse_head(head) {
            Ok(request) => request,
            Err(error) => {
                return Parsed::Malformed {
                    error,
                    consumed: skippable(head).then_some(body_start),
                };
            }
        };

        let end = body_start + request.content_length.unwrap_or(0);
        if buf.len() < end {
            return Parsed::Incomplete;
        }

        request.body = buf[body_start..end].to_vec();
        Parsed::Complete {
            request,
            consumed: end,
        }
    }
}

impl Http1Parser {
    fn parse_head(&self, head: &[u8]) -> Result<Request, ErrorKind> {
        let head = simdutf8::basic::from_utf8(head).map_err(|_| ErrorKind::InvalidEncoding)?;
        let mut lines = head.split("\r\n");

        let first_line = lines.next().unwrap_or_default();
        if first_line.len() > self.limits.precalc.first_line {
            return Err(ErrorKind::UrlTooLong);
        }

        let (method, target, version, keep_alive) = self.parse_first_line(first_line)?;
        let path_end = target.find('?').unwrap_or(target.len());

        let mut request = Request {
            method,
            target: target.to_owned(),
            path_end,
            version,

            headers: HeaderMap::with_capacity(self.limits.header_count.min(16)),
            content_length: None,
            keep_alive,

            body: Vec::new(),

            client_addr: Request::UNKNOWN_CLIENT,
        };

        for line in lines {
            if request.headers.len() >= self.limits.header_count {
                return Err(ErrorKind::TooManyHeaders);
            }
            self.parse_header(&mut request, line)?;
        }

        Ok(request)
    }

    #[inline]
    fn parse_first_line<'a>(
        &self,
        line: &'a str,
    ) -> Result<(Method, &'a str, Version, bool), ErrorKind> {
        let bytes = line.as_bytes();

        let method_end = memchr(b' ', bytes).ok_or(ErrorKind::InvalidMethod)?;
        let method = Method::from_bytes(&bytes[..method_end])?;

        let version_start = memrchr(b' ', bytes)
            .filter(|pos| *pos > method_end)
            .ok_or(ErrorKind::InvalidVersion)?;

        let target = &line[method_end + 1..version_start];
        if target.len() > self.limits.url_size {
            return Err(ErrorKind::UrlTooLong);
        }

        let origin_form = target.starts_with('/');
        let asterisk_form = target == "*" && method == Method::Options;
        if !(origin_form || asterisk_form)
            || target.bytes().any(|b| b == b' ' || b.is_ascii_control())
        {
            return Err(ErrorKind::InvalidUrl);
        }

        let (version, keep_alive) = Version::from_bytes(&bytes[version_start + 1..])?;
        Ok((method, target, version, keep_alive))
    }

    #[inline]
    fn parse_header(&self, request: &mut Request, line: &str) -> Result<(), ErrorKind> {
        let colon = memchr(b':', line.as_bytes()).ok_or(ErrorKind::InvalidHeader)?;

        let name = &line[..colon];
        if name.is_empty()
            || name.len() > self.limits.header_name_size
            || name.bytes().any(|b| b.is_ascii_whitespace())
        {
            return Err(ErrorKind::InvalidHeader);
        }

        let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
        if value.len() > self.limits.header_value_size {
            return Err(ErrorKind::InvalidHeader);
        }

        if name.eq_ignore_ascii_case("content-length") {
            let len = types::slice_to_usize(value.as_bytes())
                .ok_or(ErrorKind::InvalidContentLength)?;

            if request.content_length.is_some_and(|prev| prev != len) {
                return Err(ErrorKind::InvalidContentLength);
            }
            if len > self.limits.body_size {
                return Err(ErrorKind::BodyTooLarge);
            }
            request.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    request.keep_alive = false;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    request.keep_alive = true;
                }
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        }

        request.headers.append(name.to_owned(), value.to_owned());
        Ok(())
    }
}

// A head that announces a body cannot be skipped: its body bytes would be read
// as the next request.
fn skippable(head: &[u8]) -> bool {
    !head.split(|&b| b == b'\n').skip(1).any(|line| {
        let name = match memchr(b':', line) {
            Some(colon) => &line[..colon],
            None => return false,
        };
        let name = match name.iter().rposition(|b| !b.is_ascii_whitespace()) {
            Some(last) => &name[..=last],
            None => return false,
        };

        name.eq_ignore_ascii_case(b"content-length")
            || name.eq_ignore_ascii_case(b"transfer-encoding")
    })
}
