//! gzip codec used for response bodies.
//!
//! Both directions are pure functions over byte slices: no state is shared
//! between calls and failures are reported as an empty result.
//!
//! # Examples
//! ```
//! use ferry_web::compress::{compress, decompress};
//!
//! let body = b"hello hello hello hello".repeat(100);
//! let packed = compress(&body, 6);
//!
//! assert!(packed.len() < body.len());
//! assert_eq!(decompress(&packed), body);
//! assert!(compress(b"", 6).is_empty());
//! ```

use flate2::{
    read::{GzDecoder, GzEncoder},
    Compression,
};
use std::io::{self, Read};
use tracing::warn;

const MIN_CHUNK: usize = 1024;
const MAX_CHUNK: usize = 128 * 1024;

/// gzip-compresses `data`.
///
/// `level` is clamped to `-1..=9`; `-1` selects the codec's default level,
/// `0` stores without compression. Returns an empty vector for empty input or
/// when the encoder fails.
pub fn compress(data: &[u8], level: i32) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    let level = match level.clamp(-1, 9) {
        -1 => Compression::default(),
        level => Compression::new(level as u32),
    };

    match drain(GzEncoder::new(data, level), chunk_size(data.len())) {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err, len = data.len(), "gzip compression failed");
            Vec::new()
        }
    }
}

/// Inflates one gzip member.
///
/// Returns an empty vector for empty input, corrupt data or a truncated stream.
pub fn decompress(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }

    // Output is assumed to be about twice the input.
    match drain(GzDecoder::new(data), chunk_size(data.len().saturating_mul(2))) {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err, len = data.len(), "gzip decompression failed");
            Vec::new()
        }
    }
}

#[inline]
fn chunk_size(hint: usize) -> usize {
    hint.checked_next_power_of_two()
        .unwrap_or(MAX_CHUNK)
        .clamp(MIN_CHUNK, MAX_CHUNK)
}

// Reads until end of stream, growing the output one chunk at a time.
fn drain<R: Read>(mut reader: R, chunk: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut filled = 0;

    loop {
        if filled == out.len() {
            out.resize(filled + chunk, 0);
        }

        match reader.read(&mut out[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    out.truncate(filled);
    Ok(out)
}
