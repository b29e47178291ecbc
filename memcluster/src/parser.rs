use std::str;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cmd::Request;
use crate::errors::{parse_error, CacheError, CacheResult, ErrorKind};

/// Response lines never get anywhere near this long; a buffer this size
/// without a line break means the peer is not speaking the protocol.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Largest value a server may announce. memcached refuses to store items
/// above 1 GiB whatever its `-I` setting.
const MAX_VALUE_LENGTH: usize = 1024 * 1024 * 1024;

/// Upper bound of a single buffer reservation while a value is streaming in.
const MAX_RESERVE: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const END: &[u8] = b"END\r\n";

/// A value returned by a retrieval command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// The key as echoed by the server.
    pub key: String,
    /// Flags stored with the value.
    pub flags: u32,
    /// The payload.
    pub data: Bytes,
}

/// A single response of the memcached text protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// `STORED`
    Stored,
    /// `NOT_STORED`
    NotStored,
    /// `EXISTS`
    Exists,
    /// `NOT_FOUND`
    NotFound,
    /// `DELETED`
    Deleted,
    /// `TOUCHED`
    Touched,
    /// `VALUE ... END`
    Value(Item),
    /// A bare `END`: the key was not found.
    Miss,
    /// `VERSION <version>`
    Version(String),
    /// `ERROR`: the server did not understand the command.
    Error,
    /// `CLIENT_ERROR <message>`
    ClientError(String),
    /// `SERVER_ERROR <message>`
    ServerError(String),
}

impl Response {
    /// Turns error replies into errors, passing everything else through.
    pub fn into_result(self) -> CacheResult<Response> {
        match self {
            Response::Error => Err(CacheError::from((
                ErrorKind::ClientError,
                "Server does not know the command",
            ))),
            Response::ClientError(msg) => Err(CacheError::from((
                ErrorKind::ClientError,
                "Server rejected the request",
                msg,
            ))),
            Response::ServerError(msg) => Err(CacheError::from((
                ErrorKind::ServerError,
                "Server failed to process the request",
                msg,
            ))),
            other => Ok(other),
        }
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == CRLF)
        .map(|pos| pos + from)
}

fn parse_value_header(line: &str) -> CacheResult<(String, u32, usize)> {
    // VALUE <key> <flags> <bytes> [<cas unique>]
    let mut parts = line.split(' ').skip(1);
    let (Some(key), Some(flags), Some(len)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(parse_error("Malformed VALUE line", line));
    };
    let flags = flags
        .parse()
        .map_err(|_| parse_error("Malformed flags in VALUE line", line))?;
    let len = len
        .parse()
        .map_err(|_| parse_error("Malformed length in VALUE line", line))?;
    Ok((key.to_string(), flags, len))
}

fn parse_status_line(line: &str) -> CacheResult<Response> {
    let (word, rest) = match line.split_once(' ') {
        Some((word, rest)) => (word, Some(rest)),
        None => (line, None),
    };
    let response = match (word, rest) {
        ("STORED", None) => Response::Stored,
        ("NOT_STORED", None) => Response::NotStored,
        ("EXISTS", None) => Response::Exists,
        ("NOT_FOUND", None) => Response::NotFound,
        ("DELETED", None) => Response::Deleted,
        ("TOUCHED", None) => Response::Touched,
        ("END", None) => Response::Miss,
        ("ERROR", None) => Response::Error,
        ("VERSION", Some(version)) => Response::Version(version.to_string()),
        ("CLIENT_ERROR", msg) => Response::ClientError(msg.unwrap_or_default().to_string()),
        ("SERVER_ERROR", msg) => Response::ServerError(msg.unwrap_or_default().to_string()),
        _ => return Err(parse_error("Unexpected response line", line)),
    };
    Ok(response)
}

/// Frames requests and responses of the memcached text protocol.
#[derive(Default, Debug)]
pub struct MemcacheCodec {
    _private: (),
}

impl MemcacheCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_response(&mut self, bytes: &mut BytesMut) -> CacheResult<Option<Response>> {
        let Some(line_end) = find_crlf(bytes, 0) else {
            if bytes.len() > MAX_LINE_LENGTH {
                return Err(parse_error(
                    "Response line too long",
                    format!("{} bytes without a line break", bytes.len()),
                ));
            }
            return Ok(None);
        };
        let line = str::from_utf8(&bytes[..line_end]).map_err(|_| {
            parse_error(
                "Response line is not UTF-8",
                format!("{:?}", &bytes[..line_end]),
            )
        })?;

        if !line.starts_with("VALUE ") {
            let response = parse_status_line(line)?;
            bytes.advance(line_end + CRLF.len());
            return Ok(Some(response));
        }

        let (key, flags, len) = parse_value_header(line)?;
        if len > MAX_VALUE_LENGTH {
            return Err(parse_error(
                "Value length exceeds limit",
                format!("key {key}, declared length {len}"),
            ));
        }
        let data_start = line_end + CRLF.len();
        let data_end = data_start + len;
        let frame_end = data_end + CRLF.len() + END.len();
        if bytes.len() < frame_end {
            bytes.reserve((frame_end - bytes.len()).min(MAX_RESERVE));
            return Ok(None);
        }
        if &bytes[data_end..data_end + CRLF.len()] != CRLF {
            return Err(parse_error(
                "Value is not terminated by CRLF",
                format!("key {key}, declared length {len}"),
            ));
        }
        if &bytes[data_end + CRLF.len()..frame_end] != END {
            return Err(parse_error("Expected END after value", format!("key {key}")));
        }

        let mut frame = bytes.split_to(frame_end);
        frame.advance(data_start);
        let data = frame.split_to(len).freeze();
        Ok(Some(Response::Value(Item { key, flags, data })))
    }
}

impl Encoder<&Request> for MemcacheCodec {
    type Error = CacheError;

    fn encode(&mut self, item: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_packed(dst);
        Ok(())
    }
}

impl Decoder for MemcacheCodec {
    type Item = Response;
    type Error = CacheError;

    fn decode(&mut self, bytes: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_response(bytes)
    }
}

/// Parses a single complete response.
///
/// This is the most straightforward way to parse something into a response
/// instead of having to set up a framed stream.
pub fn parse_response(bytes: &[u8]) -> CacheResult<Response> {
    let mut buf = BytesMut::from(bytes);
    match MemcacheCodec::new().decode(&mut buf)? {
        Some(response) => Ok(response),
        None => Err(CacheError::from(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        ))),
    }
}
