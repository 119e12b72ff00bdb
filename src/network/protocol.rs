//! Packet Wire Format
//!
//! Application packets are bare JSON objects with two fields:
//!
//! ```text
//! {"event_name":"event1","event_body":{"message":"Hello, World!"}}
//! ```
//!
//! Packets are not length-prefixed. [`PacketCodec`] parses the byte stream
//! incrementally, so one read may carry several packets and one packet may
//! span several reads. Whitespace between packets is ignored.

use std::fmt;

use bytes::{Buf, BytesMut};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Default upper bound on a single buffered packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// A decoded application packet.
///
/// Only the object form decodes; a JSON array is rejected even when its
/// elements line up with the fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    /// Routing key into the event registry. Missing decodes as empty.
    pub event_name: String,
    /// Opaque payload handed to the handler. Missing decodes as `None`.
    pub event_body: Option<Value>,
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(PacketVisitor)
    }
}

struct PacketVisitor;

impl<'de> Visitor<'de> for PacketVisitor {
    type Value = Packet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a packet object with event_name and event_body")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Packet, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut event_name: Option<String> = None;
        let mut event_body: Option<Option<Value>> = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "event_name" => {
                    if event_name.is_some() {
                        return Err(de::Error::duplicate_field("event_name"));
                    }
                    event_name = Some(map.next_value()?);
                }
                "event_body" => {
                    if event_body.is_some() {
                        return Err(de::Error::duplicate_field("event_body"));
                    }
                    event_body = Some(map.next_value()?);
                }
                _ => {
                    map.next_value::<de::IgnoredAny>()?;
                }
            }
        }

        Ok(Packet {
            event_name: event_name.unwrap_or_default(),
            event_body: event_body.flatten(),
        })
    }
}

impl Packet {
    /// Build a packet.
    pub fn new(event_name: impl Into<String>, event_body: Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_body: Some(event_body),
        }
    }

    /// Whether the body carries a value. JSON `null` counts as empty.
    pub fn has_body(&self) -> bool {
        !matches!(self.event_body, None | Some(Value::Null))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Framing and decode errors. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes that can never become a packet.
    #[error("malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A pending packet grew past the size limit.
    #[error("packet exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit.
        limit: usize,
    },
    /// Stream ended in the middle of a packet.
    #[error("stream closed with {0} bytes of partial packet")]
    Truncated(usize),
    /// Transport failure while reading.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental JSON packet decoder.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    /// Create a codec that rejects packets larger than `max_packet_size` bytes.
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Configured packet size limit.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let skip = src
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(src.len());
        src.advance(skip);
        if src.is_empty() {
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<Packet>();
        match stream.next() {
            Some(Ok(packet)) => {
                let consumed = stream.byte_offset();
                src.advance(consumed);
                Ok(Some(packet))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_packet_size {
                    Err(CodecError::TooLarge {
                        limit: self.max_packet_size,
                    })
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => Err(CodecError::Malformed(e)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated(src.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const HELLO: &str = r#"{"event_name":"event1","event_body":{"message":"Hello, World!"}}"#;

    fn decode_all(codec: &mut PacketCodec, buf: &mut BytesMut) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(packet) = codec.decode(buf).unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn test_packet_json_roundtrip() {
        let packet = Packet::new("event1", json!({"message": "Hello, World!"}));
        let json = packet.to_json().unwrap();
        let parsed = Packet::from_json(&json).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_missing_fields_decode_as_empty() {
        let packet = Packet::from_json(r#"{"event_body":{"k":1}}"#).unwrap();
        assert!(packet.event_name.is_empty());

        let packet = Packet::from_json(r#"{"event_name":"event1"}"#).unwrap();
        assert!(!packet.has_body());

        let packet = Packet::from_json(r#"{"event_name":"event1","event_body":null}"#).unwrap();
        assert!(!packet.has_body());

        let packet = Packet::from_json(r#"{"event_name":"e","event_body":{},"extra":true}"#).unwrap();
        assert!(packet.has_body());
    }

    #[test]
    fn test_array_form_rejected() {
        assert!(Packet::from_json(r#"["event1",{"k":1}]"#).is_err());
        assert!(Packet::from_json(r#"{"event_name":"a","event_name":"b"}"#).is_err());
        assert!(Packet::from_json(r#"{"event_name":null}"#).is_err());

        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(r#"["event1",{"k":1}]"#);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_single_packet() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(HELLO);

        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.event_name, "event1");
        assert_eq!(packet.event_body.unwrap()["message"], "Hello, World!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_concatenated_packets_in_one_read() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(
            r#"{"event_name":"a","event_body":1}{"event_name":"b","event_body":2}
               {"event_name":"c","event_body":3}"#,
        );

        let names: Vec<_> = decode_all(&mut codec, &mut buf)
            .into_iter()
            .map(|p| p.event_name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_packet_split_across_reads() {
        let mut codec = PacketCodec::default();
        let (head, tail) = HELLO.split_at(20);

        let mut buf = BytesMut::from(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], head.as_bytes());

        buf.extend_from_slice(tail.as_bytes());
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.event_name, "event1");
    }

    #[test]
    fn test_whitespace_only_is_pending() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(" \r\n\t ");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_fatal() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from("invalid_packet");
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_wrong_field_type_is_fatal() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(r#"{"event_name":42,"event_body":{}}"#);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_oversized_pending_packet() {
        let mut codec = PacketCodec::new(32);
        let mut buf = BytesMut::from(r#"{"event_name":"event1","event_body":{"message":"#);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { limit: 32 })
        ));
    }

    #[test]
    fn test_truncated_at_eof() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(r#"{"event_name":"ev"#);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Truncated(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_split_points_do_not_change_output(
            cuts in proptest::collection::btree_set(1usize..200, 0..6),
        ) {
            let stream = format!(
                "{}\n{}{}",
                HELLO,
                r#"{"event_name":"event2","event_body":[1,2,3]}"#,
                r#"  {"event_name":"","event_body":"x"}"#,
            );
            let bytes = stream.as_bytes();

            let mut codec = PacketCodec::default();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            let mut last = 0;
            for cut in cuts.into_iter().filter(|c| *c < bytes.len()).chain(Some(bytes.len())) {
                buf.extend_from_slice(&bytes[last..cut]);
                last = cut;
                decoded.extend(decode_all(&mut codec, &mut buf));
            }

            prop_assert!(codec.decode_eof(&mut buf).unwrap().is_none());
            let names: Vec<_> = decoded.iter().map(|p| p.event_name.as_str()).collect();
            prop_assert_eq!(names, vec!["event1", "event2", ""]);
        }
    }
}
