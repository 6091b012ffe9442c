//! RESP framing
//!
//! Requests, replies and bulk pushes are all RESP values. Parsing is
//! incremental: `RespParser::parse` returns `Incomplete` until a whole value
//! is buffered, so `RespCodec` can sit under a `tokio_util::codec::Framed`.

use crate::error::MonError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest bulk string accepted from a peer
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest array accepted from a peer
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Bounds applied while decoding untrusted input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespLimits {
    /// Arrays may nest at most this many levels
    pub max_depth: usize,
    pub max_array_len: usize,
    pub max_bulk_len: usize,
    /// Bytes buffered for one frame before the peer is cut off
    pub max_frame_len: usize,
}

impl RespLimits {
    /// Replies and bulk pushes received by a client or sink
    pub const PEER: RespLimits = RespLimits {
        max_depth: 8,
        max_array_len: MAX_ARRAY_LEN,
        max_bulk_len: MAX_BULK_LEN,
        max_frame_len: MAX_BULK_LEN + 64 * 1024,
    };

    /// Requests received by a provider: one flat array of short arguments
    pub const REQUEST: RespLimits = RespLimits {
        max_depth: 2,
        max_array_len: 8,
        max_bulk_len: 4 * 1024,
        max_frame_len: 64 * 1024,
    };
}

impl Default for RespLimits {
    fn default() -> Self {
        RespLimits::PEER
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    #[inline]
    pub fn bulk_str(s: &str) -> Self {
        RespValue::BulkString(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[inline]
    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    #[inline]
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    #[inline]
    pub fn nil() -> Self {
        RespValue::BulkString(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Need more bytes
    Incomplete,
    /// Malformed input; the stream cannot be resynchronised
    Invalid(String),
}

pub struct RespParser;

impl RespParser {
    /// Parse one value from the front of `input`, returning it and the
    /// number of bytes consumed.
    pub fn parse(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        Self::parse_with(input, &RespLimits::PEER)
    }

    /// `parse` under explicit limits
    pub fn parse_with(input: &[u8], limits: &RespLimits) -> Result<(RespValue, usize), ParseError> {
        Self::parse_value(input, limits, 0)
    }

    fn parse_value(
        input: &[u8],
        limits: &RespLimits,
        depth: usize,
    ) -> Result<(RespValue, usize), ParseError> {
        if input.is_empty() {
            return Err(ParseError::Incomplete);
        }

        match input[0] {
            b'+' => Self::parse_simple_string(input),
            b'-' => Self::parse_error(input),
            b':' => Self::parse_integer(input),
            b'$' => Self::parse_bulk_string(input, limits),
            b'*' => Self::parse_array(input, limits, depth),
            other => Err(ParseError::Invalid(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn parse_line(input: &[u8]) -> Result<(&[u8], usize), ParseError> {
        match Self::find_crlf(input) {
            Some(pos) => Ok((&input[1..pos], pos + 2)),
            None => Err(ParseError::Incomplete),
        }
    }

    fn parse_number(line: &[u8]) -> Result<i64, ParseError> {
        std::str::from_utf8(line)
            .map_err(|e| ParseError::Invalid(e.to_string()))?
            .parse::<i64>()
            .map_err(|e| ParseError::Invalid(e.to_string()))
    }

    fn parse_simple_string(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (line, consumed) = Self::parse_line(input)?;
        let s = String::from_utf8_lossy(line).to_string();
        Ok((RespValue::SimpleString(s), consumed))
    }

    fn parse_error(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (line, consumed) = Self::parse_line(input)?;
        let s = String::from_utf8_lossy(line).to_string();
        Ok((RespValue::Error(s), consumed))
    }

    fn parse_integer(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (line, consumed) = Self::parse_line(input)?;
        Ok((RespValue::Integer(Self::parse_number(line)?), consumed))
    }

    fn parse_bulk_string(input: &[u8], limits: &RespLimits) -> Result<(RespValue, usize), ParseError> {
        let (line, header) = Self::parse_line(input)?;
        let len = Self::parse_number(line)?;

        if len == -1 {
            return Ok((RespValue::BulkString(None), header));
        }
        if len < 0 || len as usize > limits.max_bulk_len {
            return Err(ParseError::Invalid(format!("bad bulk length {}", len)));
        }

        let start = header;
        let end = start + len as usize;
        if end + 2 > input.len() {
            return Err(ParseError::Incomplete);
        }
        if &input[end..end + 2] != b"\r\n" {
            return Err(ParseError::Invalid("bulk string not CRLF-terminated".to_string()));
        }

        let data = Bytes::copy_from_slice(&input[start..end]);
        Ok((RespValue::BulkString(Some(data)), end + 2))
    }

    fn parse_array(
        input: &[u8],
        limits: &RespLimits,
        depth: usize,
    ) -> Result<(RespValue, usize), ParseError> {
        if depth >= limits.max_depth {
            return Err(ParseError::Invalid(format!(
                "arrays nested deeper than {}",
                limits.max_depth
            )));
        }
        let (line, header) = Self::parse_line(input)?;
        let len = Self::parse_number(line)?;

        if len == -1 {
            return Ok((RespValue::Array(None), header));
        }
        if len < 0 || len as usize > limits.max_array_len {
            return Err(ParseError::Invalid(format!("bad array length {}", len)));
        }

        let mut elements = Vec::with_capacity((len as usize).min(1024));
        let mut offset = header;
        for _ in 0..len {
            if offset >= input.len() {
                return Err(ParseError::Incomplete);
            }
            let (value, consumed) = Self::parse_value(&input[offset..], limits, depth + 1)?;
            elements.push(value);
            offset += consumed;
        }

        Ok((RespValue::Array(Some(elements)), offset))
    }

    #[inline]
    fn find_crlf(input: &[u8]) -> Option<usize> {
        memchr::memchr(b'\r', input).and_then(|pos| {
            if pos + 1 < input.len() && input[pos + 1] == b'\n' {
                Some(pos)
            } else {
                None
            }
        })
    }

    pub fn encode(value: &RespValue) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        Self::encode_into(value, &mut buf);
        buf
    }

    pub fn encode_into(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.reserve(data.len() + 16);
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for elem in elements {
                    Self::encode_into(elem, buf);
                }
            }
        }
    }
}

/// `tokio_util` codec over `RespParser`
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec {
    limits: RespLimits,
}

impl RespCodec {
    /// Codec for the provider side of a connection
    pub fn server() -> Self {
        Self::with_limits(RespLimits::REQUEST)
    }

    pub fn with_limits(limits: RespLimits) -> Self {
        RespCodec { limits }
    }

    pub fn limits(&self) -> &RespLimits {
        &self.limits
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = MonError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, MonError> {
        match RespParser::parse_with(src, &self.limits) {
            Ok((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Err(ParseError::Incomplete) if src.len() > self.limits.max_frame_len => {
                Err(MonError::transport(format!(
                    "frame exceeds {} bytes",
                    self.limits.max_frame_len
                )))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(msg)) => Err(MonError::transport(msg)),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = MonError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), MonError> {
        RespParser::encode_into(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_array() {
        let input = b"*3\r\n$4\r\nLIST\r\n:7\r\n*2\r\n:1\r\n:2\r\n";
        let (value, consumed) = RespParser::parse(input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            value,
            RespValue::array(vec![
                RespValue::bulk_str("LIST"),
                RespValue::Integer(7),
                RespValue::array(vec![RespValue::Integer(1), RespValue::Integer(2)]),
            ])
        );
    }

    #[test]
    fn test_incomplete_input() {
        assert_eq!(RespParser::parse(b""), Err(ParseError::Incomplete));
        assert_eq!(RespParser::parse(b"$5\r\nab"), Err(ParseError::Incomplete));
        assert_eq!(RespParser::parse(b"*2\r\n:1\r\n"), Err(ParseError::Incomplete));
        assert_eq!(RespParser::parse(b":12"), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(RespParser::parse(b"?x\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(RespParser::parse(b":abc\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(RespParser::parse(b"$-5\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(RespParser::parse(b"$2\r\nabcd"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_binary_bulk_payload() {
        let payload: Vec<u8> = vec![0, b'\r', b'\n', 255, 13];
        let value = RespValue::bulk(payload.clone());
        let encoded = RespParser::encode(&value);
        let (decoded, consumed) = RespParser::parse(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, RespValue::bulk(payload));
    }

    #[test]
    fn test_codec_decodes_frames_one_at_a_time() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(RespValue::Integer(1), &mut buf).unwrap();
        codec.encode(RespValue::ok(), &mut buf).unwrap();
        buf.extend_from_slice(b"$3\r\nab");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::Integer(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::ok()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"c\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(RespValue::bulk_str("abc")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_deep_nesting_rejected_without_recursing() {
        let mut input = "*1\r\n".repeat(500_000).into_bytes();
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(RespParser::parse(&input), Err(ParseError::Invalid(_))));
        assert!(matches!(
            RespParser::parse_with(&input, &RespLimits::REQUEST),
            Err(ParseError::Invalid(_))
        ));

        // Two levels are still accepted on the request side
        let (value, _) = RespParser::parse_with(b"*1\r\n*1\r\n:1\r\n", &RespLimits::REQUEST).unwrap();
        assert_eq!(value, RespValue::array(vec![RespValue::array(vec![RespValue::Integer(1)])]));
        assert!(matches!(
            RespParser::parse_with(b"*1\r\n*1\r\n*1\r\n:1\r\n", &RespLimits::REQUEST),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn test_request_limits_bound_arrays_and_bulks() {
        let limits = RespLimits::REQUEST;
        assert!(matches!(
            RespParser::parse_with(b"*1000000\r\n", &limits),
            Err(ParseError::Invalid(_))
        ));
        assert!(matches!(
            RespParser::parse_with(b"$536870912\r\n", &limits),
            Err(ParseError::Invalid(_))
        ));
        // The same headers are only incomplete for a peer
        assert_eq!(RespParser::parse(b"*1000000\r\n"), Err(ParseError::Incomplete));

        let seven: Vec<RespValue> = (0..7).map(RespValue::Integer).collect();
        let encoded = RespParser::encode(&RespValue::array(seven.clone()));
        let (value, _) = RespParser::parse_with(&encoded, &limits).unwrap();
        assert_eq!(value, RespValue::array(seven));
    }

    #[test]
    fn test_codec_cuts_off_oversized_frame() {
        let mut codec = RespCodec::with_limits(RespLimits { max_frame_len: 16, ..RespLimits::REQUEST });
        let mut buf = BytesMut::from(&b"*2\r\n$8\r\nabcdefgh\r\n$8\r\nabc"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(MonError::Transport(_))));

        let mut server = RespCodec::server();
        let mut deep = BytesMut::from("*1\r\n".repeat(64).as_bytes());
        assert!(matches!(server.decode(&mut deep), Err(MonError::Transport(_))));
    }
}
