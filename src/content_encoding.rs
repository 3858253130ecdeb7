use std::io::{self, Read};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};

/// `Accept-Encoding` sent when the transport asks for compression on the caller's behalf.
pub(crate) const SUPPORTED_ENCODINGS: &str = "gzip, deflate, br, zstd";

#[derive(Debug)]
pub(crate) enum DecodeError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, DecodeError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error: io::Error| DecodeError::Decode {
                encoding: encoding.to_owned(),
                message: error.to_string(),
            })?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(DecodeError::TooLarge {
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

pub(crate) fn has_decodable_body(method: &Method, status: StatusCode, body_len: usize) -> bool {
    body_len > 0
        && *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

/// Undoes every coding listed in `Content-Encoding`, last applied first.
///
/// Decoded output is capped at `max_bytes` so a small compressed body cannot
/// expand without bound.
pub(crate) fn decode_body(
    mut body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, DecodeError> {
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let content_encoding = content_encoding
        .to_str()
        .map_err(|error| DecodeError::Decode {
            encoding: "content-encoding".to_owned(),
            message: error.to_string(),
        })?;
    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(encoding) = encodings.pop() {
        let decoded = match encoding.to_ascii_lowercase().as_str() {
            "identity" => continue,
            "gzip" | "x-gzip" => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            "br" => {
                let mut decoder = brotli::Decompressor::new(body.as_ref(), 4096);
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            "zstd" => {
                let mut decoder = zstd::stream::read::Decoder::new(body.as_ref()).map_err(
                    |error| DecodeError::Decode {
                        encoding: encoding.to_owned(),
                        message: error.to_string(),
                    },
                )?;
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            other => {
                return Err(DecodeError::Decode {
                    encoding: other.to_owned(),
                    message: "unsupported content-encoding".to_owned(),
                });
            }
        };
        body = Bytes::from(decoded);
    }

    Ok(body)
}

/// After decoding, the body no longer matches these headers.
pub(crate) fn remove_content_encoding_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
}
