use std::io::{self, Read};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl ContentCoding {
    pub(crate) fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(Self::Identity),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    fn decoder<'a>(self, body: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Identity => Box::new(body),
            Self::Gzip => Box::new(flate2::read::MultiGzDecoder::new(body)),
            Self::Deflate => Box::new(flate2::read::ZlibDecoder::new(body)),
            Self::Brotli => Box::new(brotli::Decompressor::new(body, 4096)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(body)?),
        })
    }
}

#[derive(Debug)]
pub(crate) enum DecodeContentEncodingError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

/// Codings listed in a `Content-Encoding` header, in the order they were applied.
pub(crate) fn parse_content_codings(
    value: &HeaderValue,
) -> Result<Vec<ContentCoding>, DecodeContentEncodingError> {
    let text = value
        .to_str()
        .map_err(|error| DecodeContentEncodingError::Decode {
            encoding: "content-encoding".to_owned(),
            message: error.to_string(),
        })?;
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            ContentCoding::parse(item).ok_or_else(|| DecodeContentEncodingError::Decode {
                encoding: item.to_owned(),
                message: "unsupported content-encoding".to_owned(),
            })
        })
        .collect()
}

/// Responses without a payload keep their headers untouched.
pub(crate) fn should_decode_content_encoded_body(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    let declared_empty = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        == Some(0);
    !declared_empty && headers.contains_key(CONTENT_ENCODING)
}

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    coding: ContentCoding,
    max_bytes: usize,
) -> Result<Vec<u8>, DecodeContentEncodingError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error| decode_error(coding, &error))?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(DecodeContentEncodingError::TooLarge {
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

fn decode_error(coding: ContentCoding, error: &io::Error) -> DecodeContentEncodingError {
    DecodeContentEncodingError::Decode {
        encoding: format!("{coding:?}").to_ascii_lowercase(),
        message: error.to_string(),
    }
}

/// Undoes `codings` from the outermost inwards. An empty body stays empty.
pub(crate) fn decode_body_limited(
    mut body: Bytes,
    codings: &[ContentCoding],
    max_bytes: usize,
) -> Result<Bytes, DecodeContentEncodingError> {
    let max_bytes = max_bytes.max(1);
    if body.is_empty() {
        return Ok(body);
    }

    for coding in codings.iter().rev().copied() {
        if coding == ContentCoding::Identity {
            continue;
        }
        let mut decoder = coding
            .decoder(body.as_ref())
            .map_err(|error| decode_error(coding, &error))?;
        let decoded = read_to_end_limited(&mut decoder, coding, max_bytes)?;
        drop(decoder);
        body = Bytes::from(decoded);
    }

    if body.len() > max_bytes {
        return Err(DecodeContentEncodingError::TooLarge {
            actual_bytes: body.len(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue};
    use http::{HeaderMap, Method, StatusCode};

    use super::{
        ContentCoding, DecodeContentEncodingError, decode_body_limited, parse_content_codings,
        should_decode_content_encoded_body,
    };

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("write gzip payload");
        encoder.finish().expect("finish gzip payload")
    }

    #[test]
    fn decodes_stacked_codings_in_reverse_order() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&gzip(b"payload")).expect("write zlib payload");
        let body = zlib.finish().expect("finish zlib payload");

        let codings = parse_content_codings(&HeaderValue::from_static("gzip, deflate"))
            .expect("codings should parse");
        assert_eq!(codings, [ContentCoding::Gzip, ContentCoding::Deflate]);

        let decoded = decode_body_limited(Bytes::from(body), &codings, 1024).expect("decode");
        assert_eq!(decoded.as_ref(), b"payload");
    }

    #[test]
    fn rejects_unknown_coding() {
        let error = parse_content_codings(&HeaderValue::from_static("snappy"))
            .expect_err("unknown coding should fail");
        assert!(matches!(
            error,
            DecodeContentEncodingError::Decode { ref encoding, .. } if encoding == "snappy"
        ));
    }

    #[test]
    fn decoded_size_is_limited() {
        let body = Bytes::from(gzip(&[b'a'; 4096]));
        let error = decode_body_limited(body, &[ContentCoding::Gzip], 100)
            .expect_err("decoded body exceeds limit");
        assert!(matches!(error, DecodeContentEncodingError::TooLarge { .. }));
    }

    #[test]
    fn skips_decoding_for_bodiless_responses() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(should_decode_content_encoded_body(
            &Method::GET,
            StatusCode::OK,
            &headers
        ));
        assert!(!should_decode_content_encoded_body(
            &Method::HEAD,
            StatusCode::OK,
            &headers
        ));
        assert!(!should_decode_content_encoded_body(
            &Method::GET,
            StatusCode::NO_CONTENT,
            &headers
        ));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!should_decode_content_encoded_body(
            &Method::GET,
            StatusCode::OK,
            &headers
        ));
    }
}
