use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{CacheError, CacheResult, ErrorKind};

/// Longest key the text protocol accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// Relative expirations above this many seconds are read by the server as
/// absolute unix timestamps.
const RELATIVE_EXPIRATION_LIMIT: u64 = 60 * 60 * 24 * 30;

/// A single request of the memcached text protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// `set <key> <flags> <exptime> <bytes>`
    Set {
        /// Target key.
        key: String,
        /// Opaque flags stored alongside the value.
        flags: u32,
        /// Encoded expiration, see [`encode_ttl`].
        exptime: u32,
        /// Payload.
        value: Bytes,
    },
    /// `add <key> <flags> <exptime> <bytes>`, stores only if the key is absent.
    Add {
        /// Target key.
        key: String,
        /// Opaque flags stored alongside the value.
        flags: u32,
        /// Encoded expiration, see [`encode_ttl`].
        exptime: u32,
        /// Payload.
        value: Bytes,
    },
    /// `get <key>`
    Get {
        /// Target key.
        key: String,
    },
    /// `delete <key>`
    Delete {
        /// Target key.
        key: String,
    },
    /// `touch <key> <exptime>`
    Touch {
        /// Target key.
        key: String,
        /// Encoded expiration, see [`encode_ttl`].
        exptime: u32,
    },
    /// `version`
    Version,
}

impl Request {
    /// Returns the key the request is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Set { key, .. }
            | Request::Add { key, .. }
            | Request::Get { key }
            | Request::Delete { key }
            | Request::Touch { key, .. } => Some(key),
            Request::Version => None,
        }
    }

    /// Returns the command name as sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Set { .. } => "set",
            Request::Add { .. } => "add",
            Request::Get { .. } => "get",
            Request::Delete { .. } => "delete",
            Request::Touch { .. } => "touch",
            Request::Version => "version",
        }
    }

    /// Writes the packed request into `out`.
    pub fn write_packed(&self, out: &mut BytesMut) {
        let mut writer = out.writer();
        // Writing into a BytesMut cannot fail.
        let _ = match self {
            Request::Set {
                key,
                flags,
                exptime,
                value,
            }
            | Request::Add {
                key,
                flags,
                exptime,
                value,
            } => write!(
                writer,
                "{} {key} {flags} {exptime} {}\r\n",
                self.name(),
                value.len()
            ),
            Request::Get { key } => write!(writer, "get {key}\r\n"),
            Request::Delete { key } => write!(writer, "delete {key}\r\n"),
            Request::Touch { key, exptime } => write!(writer, "touch {key} {exptime}\r\n"),
            Request::Version => write!(writer, "version\r\n"),
        };
        let out = writer.into_inner();
        if let Request::Set { value, .. } | Request::Add { value, .. } = self {
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Returns the packed request as a byte vector.
    pub fn get_packed(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        self.write_packed(&mut out);
        out.to_vec()
    }
}

/// Checks that `key` can be sent over the text protocol.
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::from((ErrorKind::ClientError, "Key is empty")));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::from((
            ErrorKind::ClientError,
            "Key is too long",
            format!("{} bytes, limit is {MAX_KEY_LENGTH}", key.len()),
        )));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(CacheError::from((
            ErrorKind::ClientError,
            "Key contains whitespace or control characters",
            key.escape_debug().to_string(),
        )));
    }
    Ok(())
}

/// Encodes a time to live as a protocol expiration.
///
/// `Duration::ZERO` means the entry never expires. Fractions of a second are
/// rounded up so that a short TTL never turns into "no expiration". TTLs
/// longer than 30 days are sent as absolute unix timestamps.
pub fn encode_ttl(ttl: Duration) -> u32 {
    if ttl.is_zero() {
        return 0;
    }
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    if secs > RELATIVE_EXPIRATION_LIMIT {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        secs = now.saturating_add(secs);
    }
    u32::try_from(secs).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_storage_commands_with_payload() {
        let req = Request::Set {
            key: "key1".into(),
            flags: 0,
            exptime: 10,
            value: Bytes::from_static(b"value1"),
        };
        assert_eq!(req.get_packed(), b"set key1 0 10 6\r\nvalue1\r\n");

        let req = Request::Add {
            key: "k".into(),
            flags: 3,
            exptime: 0,
            value: Bytes::new(),
        };
        assert_eq!(req.get_packed(), b"add k 3 0 0\r\n\r\n");
    }

    #[test]
    fn packs_retrieval_and_deletion() {
        assert_eq!(
            Request::Get { key: "a".into() }.get_packed(),
            b"get a\r\n"
        );
        assert_eq!(
            Request::Delete { key: "a".into() }.get_packed(),
            b"delete a\r\n"
        );
        assert_eq!(
            Request::Touch {
                key: "a".into(),
                exptime: 5
            }
            .get_packed(),
            b"touch a 5\r\n"
        );
        assert_eq!(Request::Version.get_packed(), b"version\r\n");
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("user:42").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());
        for bad in ["", "has space", "tab\there", "nl\n"] {
            assert_eq!(
                validate_key(bad).unwrap_err().kind(),
                ErrorKind::ClientError,
                "{bad:?}"
            );
        }
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn ttl_encoding() {
        assert_eq!(encode_ttl(Duration::ZERO), 0);
        assert_eq!(encode_ttl(Duration::from_secs(10)), 10);
        assert_eq!(encode_ttl(Duration::from_millis(1)), 1);
        assert_eq!(encode_ttl(Duration::from_millis(1500)), 2);
        assert_eq!(
            encode_ttl(Duration::from_secs(RELATIVE_EXPIRATION_LIMIT)),
            RELATIVE_EXPIRATION_LIMIT as u32
        );
        // absolute timestamps are well past the relative limit
        let absolute = encode_ttl(Duration::from_secs(RELATIVE_EXPIRATION_LIMIT + 1));
        assert!(absolute as u64 > RELATIVE_EXPIRATION_LIMIT * 10);
        assert_eq!(encode_ttl(Duration::MAX), u32::MAX);
    }
}
