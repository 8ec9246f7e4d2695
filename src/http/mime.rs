//! Content types for [`Response::send_file`](crate::Response::send_file).

use std::path::Path;

macro_rules! mime_table {
    ($($($ext:literal)|+ => $mime:literal;)*) => {
        /// Looks up the MIME type of a file extension (case-insensitive, without the dot).
        pub(crate) fn from_extension(ext: &str) -> Option<&'static str> {
            let ext = ext.to_ascii_lowercase();
            match ext.as_str() {
                $($($ext)|+ => Some($mime),)*
                _ => None,
            }
        }
    };
}

mime_table! {
    "html" | "htm" => "text/html";
    "css" => "text/css";
    "js" | "mjs" => "text/javascript";
    "txt" | "log" => "text/plain";
    "csv" => "text/csv";
    "md" => "text/markdown";
    "xml" => "application/xml";
    "json" => "application/json";
    "wasm" => "application/wasm";
    "pdf" => "application/pdf";
    "zip" => "application/zip";
    "gz" => "application/gzip";
    "png" => "image/png";
    "jpg" | "jpeg" => "image/jpeg";
    "gif" => "image/gif";
    "webp" => "image/webp";
    "svg" => "image/svg+xml";
    "ico" => "image/x-icon";
    "woff" => "font/woff";
    "woff2" => "font/woff2";
    "mp3" => "audio/mpeg";
    "mp4" => "video/mp4";
    "webm" => "video/webm";
}

/// MIME type from the path's extension.
pub(crate) fn from_path(path: &Path) -> Option<&'static str> {
    from_extension(path.extension()?.to_str()?)
}

/// Fallback when nothing names the type: UTF-8 text or opaque bytes.
pub(crate) fn sniff(data: &[u8]) -> &'static str {
    match simdutf8::basic::from_utf8(data) {
        Ok(_) => "text/plain",
        Err(_) => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",      Some("text/html")),
            ("INDEX.HTM",       Some("text/html")),
            ("app.min.js",      Some("text/javascript")),
            ("data.json",       Some("application/json")),
            ("photo.JPEG",      Some("image/jpeg")),
            ("archive.tar.gz",  Some("application/gzip")),
            ("Makefile",        None),
            ("notes.unknown",   None),
            (".hidden",         None),
        ];

        for (name, expected) in cases {
            assert_eq!(from_path(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn sniffing() {
        assert_eq!(sniff(b"plain words"), "text/plain");
        assert_eq!(sniff("привет".as_bytes()), "text/plain");
        assert_eq!(sniff(&[0xff, 0xfe, 0x00]), "application/octet-stream");
    }
}
