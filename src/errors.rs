use crate::StatusCode;
use std::{error, fmt};

/// Reasons a connection answers on its own instead of calling the [`Handler`](crate::Handler).
///
/// Produced by a [`RequestParser`](crate::RequestParser) for malformed input, and by
/// the server itself when it is overloaded or a handler times out or panics. Every
/// kind maps to a fixed status code and a static JSON body, see
/// [`ServerLimits::json_errors`](crate::limits::ServerLimits::json_errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidMethod,
    InvalidUrl,
    UrlTooLong,

    InvalidVersion,
    UnsupportedVersion,

    InvalidEncoding,
    InvalidHeader,
    TooManyHeaders,
    HeadTooLarge,
    InvalidContentLength,
    UnsupportedTransferEncoding,

    BodyTooLarge,

    ServiceUnavailable,
    ResponseTimeout,
    HandlerPanicked,
}

macro_rules! http_errors {
    ($($name:ident: $status:ident => $json:literal; )*) => {
        /// Status code sent back for this error.
        #[inline]
        pub const fn status(&self) -> StatusCode {
            match self { $(
                Self::$name => StatusCode::$status,
            )* }
        }

        /// Static JSON body sent back for this error.
        #[inline]
        pub const fn json(&self) -> &'static str {
            match self { $(
                Self::$name => $json,
            )* }
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: BadRequest
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        InvalidUrl: BadRequest
            => r#"{"error":"Invalid URL format","code":"INVALID_URL"}"#;
        UrlTooLong: UriTooLong
            => r#"{"error":"URL too long","code":"URL_TOO_LONG"}"#;

        InvalidVersion: BadRequest
            => r#"{"error":"Invalid HTTP version","code":"INVALID_VERSION"}"#;
        UnsupportedVersion: HttpVersionNotSupported
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;

        InvalidEncoding: BadRequest
            => r#"{"error":"Request head is not valid UTF-8","code":"INVALID_ENCODING"}"#;
        InvalidHeader: BadRequest
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        TooManyHeaders: RequestHeaderFieldsTooLarge
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        HeadTooLarge: RequestHeaderFieldsTooLarge
            => r#"{"error":"Request head too large","code":"HEAD_TOO_LARGE"}"#;
        InvalidContentLength: BadRequest
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        UnsupportedTransferEncoding: NotImplemented
            => r#"{"error":"Transfer-Encoding is not supported","code":"UNSUPPORTED_TRANSFER_ENCODING"}"#;

        BodyTooLarge: PayloadTooLarge
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;

        ServiceUnavailable: ServiceUnavailable
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
        ResponseTimeout: InternalServerError
            => r#"{"error":"Response was not produced in time","code":"RESPONSE_TIMEOUT"}"#;
        HandlerPanicked: InternalServerError
            => r#"{"error":"Internal server error","code":"HANDLER_PANICKED"}"#;
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.status().as_u16())
    }
}
