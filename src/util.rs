//! Small standalone helpers ported from the surrounding "trivial glue"
//! source file alongside the socket/TLS machinery: unpadded base64url
//! encode/decode and request-path normalization (`.`/`..`/percent-decoding
//! collapse). Neither touches a socket or the TLS engine.

use base64::alphabet::URL_SAFE;
use base64::engine::{general_purpose::NO_PAD, GeneralPurpose};
use base64::Engine;

const BASE64URL: GeneralPurpose = GeneralPurpose::new(&URL_SAFE, NO_PAD);

/// Encodes to unpadded base64url, matching the wire form used for things
/// like HTTP/2 Huffman-free header dumps and cookie-safe tokens.
pub fn base64url_encode(data: &[u8]) -> String {
    BASE64URL.encode(data)
}

/// Decodes unpadded base64url. Malformed input (bad alphabet, truncated
/// group) is reported as a plain `Err` rather than panicking.
pub fn base64url_decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64URL.decode(encoded)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `%XX` escapes in place; an incomplete or malformed
/// escape (not enough bytes, non-hex digits) is left as literal text
/// rather than rejected.
fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' && i + 2 < input.len() {
            if let (Some(hi), Some(lo)) = (hex_val(input[i + 1]), hex_val(input[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Normalizes an HTTP request path: strips any query string, percent-decodes
/// escapes, and collapses `.`/`..` segments against the (implicit) leading
/// `/`. A trailing `/`, `/.`, or `/..` in the input always leaves a trailing
/// slash in the output; `..` past the root is clamped rather than erroring.
///
/// Returns raw bytes rather than `String` since a percent-decoded path is
/// not guaranteed to be valid UTF-8.
pub fn normalize_path(path: &str) -> Vec<u8> {
    let bytes = path.as_bytes();
    let before_query = match bytes.iter().position(|&b| b == b'?') {
        Some(i) => &bytes[..i],
        None => bytes,
    };
    let decoded = percent_decode(before_query);
    let body = decoded.strip_prefix(b"/").unwrap_or(&decoded);
    let components: Vec<&[u8]> = body.split(|&b| b == b'/').collect();
    let trailing_slash = components.last().is_none_or(|c| c.is_empty() || *c == b"." || *c == b"..");

    let mut stack: Vec<&[u8]> = Vec::new();
    for comp in &components {
        match *comp {
            b"" | b"." => {}
            b".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut out = Vec::with_capacity(decoded.len());
    out.push(b'/');
    for (i, seg) in stack.iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(seg);
    }
    if trailing_slash && out.last() != Some(&b'/') {
        out.push(b'/');
    }
    out
}
