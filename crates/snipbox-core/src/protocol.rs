//! Wire protocol for daemon communication
//!
//! Every message is one frame: a 4-byte big-endian length followed by a
//! MessagePack body with named fields.

use crate::result::{ExecutionResult, SandboxStatus};
use crate::{Result, SnipboxError};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Largest frame either side accepts
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Request types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Run a snippet in the user's sandbox
    Execute { user: String, code: String },
    /// Replace the user's sandbox with an empty one
    Reset { user: String },
    /// End the user's session and remove the sandbox
    Logout { user: String },
    /// Read a published artifact
    Fetch { user: String, artifact: String },
    /// Sandbox status for the user
    Status { user: String },
    Ping,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Execute(ExecutionResult),
    Reset,
    Logout,
    Artifact {
        #[serde(with = "serde_bytes_compat")]
        content: Vec<u8>,
    },
    Forbidden,
    NotFound,
    Status(SandboxStatus),
    Pong,
    Error { message: String },
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> std::result::Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> std::result::Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Length prefix for a body, refusing oversized frames
pub fn frame_header(len: usize) -> Result<[u8; 4]> {
    if len > MAX_FRAME {
        return Err(SnipboxError::Protocol(format!("frame too large: {len} bytes")));
    }
    let len = u32::try_from(len)
        .map_err(|_| SnipboxError::Protocol(format!("frame too large: {len} bytes")))?;
    Ok(len.to_be_bytes())
}

/// Body length from a received prefix, refusing oversized frames
pub fn frame_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(SnipboxError::Protocol(format!("frame too large: {len} bytes")));
    }
    Ok(len)
}

/// Encode `msg` and write it as one frame
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let body = encode(msg).map_err(|e| SnipboxError::Protocol(e.to_string()))?;
    writer.write_all(&frame_header(body.len())?)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read and decode one frame.
///
/// Returns `None` on a clean end of stream before the length prefix.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut body = vec![0u8; frame_len(header)?];
    reader.read_exact(&mut body)?;

    decode(&body)
        .map(Some)
        .map_err(|e| SnipboxError::Protocol(e.to_string()))
}

/// Artifact bodies travel as msgpack `bin`, not as an array of integers
mod serde_bytes_compat {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte buffer")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(v.as_bytes().to_vec())
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Outcome;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn requests_survive_a_frame() {
        let mut wire = Vec::new();
        let sent = Request::Execute {
            user: "alice".into(),
            code: "print('hi')".into(),
        };
        write_frame(&mut wire, &sent).unwrap();
        write_frame(&mut wire, &Request::Ping).unwrap();

        let mut reader = Cursor::new(wire);
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), Some(sent));
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), Some(Request::Ping));
        assert_eq!(read_frame::<_, Request>(&mut reader).unwrap(), None);
    }

    #[test]
    fn responses_carry_results_and_bytes() {
        let mut wire = Vec::new();
        let result = ExecutionResult::message(Outcome::Completed, "hello\n", Duration::from_millis(12));
        write_frame(&mut wire, &Response::Execute(result)).unwrap();
        write_frame(&mut wire, &Response::Artifact { content: b"<p>\xff</p>".to_vec() }).unwrap();

        let mut reader = Cursor::new(wire);
        match read_frame(&mut reader).unwrap() {
            Some(Response::Execute(r)) => {
                assert_eq!(r.output, "hello\n");
                assert_eq!(r.outcome, Outcome::Completed);
                assert_eq!(r.duration, Duration::from_millis(12));
            }
            other => panic!("unexpected {other:?}"),
        }
        match read_frame(&mut reader).unwrap() {
            Some(Response::Artifact { content }) => assert_eq!(content, b"<p>\xff</p>"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_frames_are_refused() {
        let header = u32::try_from(MAX_FRAME + 1).unwrap().to_be_bytes();
        let mut reader = Cursor::new(header.to_vec());
        assert!(matches!(
            read_frame::<_, Request>(&mut reader),
            Err(SnipboxError::Protocol(_))
        ));
        assert!(frame_header(MAX_FRAME + 1).is_err());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Request::Status { user: "bob".into() }).unwrap();
        wire.truncate(wire.len() - 1);
        assert!(read_frame::<_, Request>(&mut Cursor::new(wire)).is_err());
    }
}
