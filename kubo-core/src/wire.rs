//! Decoding of engine-produced JSON envelopes into typed values.
//!
//! Decoders never fail the caller over optional fields. Advisory data (listings) decodes
//! to empty collections when malformed.

use std::fmt;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Prefix the engine adds to stream-mount protocol names.
pub const PROTOCOL_PREFIX: &str = "/x/";

/// One pubsub message as delivered by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Peer id of the sender.
    pub from: String,
    pub data: Vec<u8>,
    pub topic_id: String,
    pub seqno: Option<Vec<u8>>,
    pub topics: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, rename = "topicID")]
    topic_id: String,
    #[serde(default)]
    seqno: Option<Value>,
    #[serde(default)]
    topics: Option<Vec<String>>,
}

/// Decode one message envelope `{from, data, topicID, seqno?, topics?}`.
///
/// Only a structurally invalid envelope is an error; a missing or malformed payload
/// decodes to empty bytes.
pub fn decode_message(json: &str) -> Result<Message> {
    let raw: RawMessage = serde_json::from_str(json)?;
    let data = match raw.data {
        Some(Value::String(s)) => decode_base64(&s).unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(Message {
        from: raw.from,
        data,
        topic_id: raw.topic_id,
        seqno: raw.seqno.as_ref().and_then(decode_bytes_value),
        topics: raw.topics,
    })
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD.decode(s).or_else(|_| URL_SAFE.decode(s)).ok()
}

/// Byte fields arrive either as base64 text or as an array of byte values.
fn decode_bytes_value(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::String(s) if !s.is_empty() => decode_base64(s),
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        _ => None,
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(text) => write!(
                f,
                "Message(from={}, topic={}, data={})",
                self.from, self.topic_id, text
            ),
            Err(_) => {
                write!(f, "Message(from={}, topic={}, data=0x", self.from, self.topic_id)?;
                for b in &self.data {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A listener or forwarder record. Snapshot only, not a live handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Mapping {
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    #[serde(rename = "ListenAddress", default)]
    pub listen_address: String,
    #[serde(rename = "TargetAddress", default)]
    pub target_address: String,
}

impl Mapping {
    /// Protocol name without the engine's `/x/` prefix.
    pub fn service_name(&self) -> &str {
        self.protocol
            .strip_prefix(PROTOCOL_PREFIX)
            .unwrap_or(&self.protocol)
    }
}

/// An active end-to-end stream over a mapping. Snapshot only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Stream {
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    #[serde(rename = "LocalAddr", default)]
    pub origin_address: String,
    #[serde(rename = "RemoteAddr", default)]
    pub target_address: String,
}

/// Point-in-time listing of stream-mount state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Connections {
    #[serde(rename = "Listens", default, deserialize_with = "null_as_empty")]
    pub listeners: Vec<Mapping>,
    #[serde(rename = "Forwards", default, deserialize_with = "null_as_empty")]
    pub forwarders: Vec<Mapping>,
    #[serde(rename = "Streams", default, deserialize_with = "null_as_empty")]
    pub streams: Vec<Stream>,
}

fn null_as_empty<'de, D, T>(d: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

impl Connections {
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.forwarders.is_empty() && self.streams.is_empty()
    }
}

/// Decode the `{Listens, Forwards, Streams}` listing. Malformed input yields three empty lists.
pub fn decode_listing(json: &str) -> Connections {
    if json.trim().is_empty() {
        return Connections::default();
    }
    match serde_json::from_str(json) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "malformed p2p listing");
            Connections::default()
        }
    }
}

/// Decode a JSON array of strings (peer ids, topics, pins). Degrades to empty on failure.
pub fn decode_string_list(json: &str) -> Vec<String> {
    match serde_json::from_str::<Option<Vec<String>>>(json) {
        Ok(list) => list.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "malformed string list");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrips_through_envelope() {
        let json = format!(
            r#"{{"from":"12D3KooW","data":"{}","topicID":"chat"}}"#,
            STANDARD.encode(b"hello")
        );
        let msg = decode_message(&json).unwrap();
        assert_eq!(msg.data, b"hello");
        assert_eq!(msg.topic_id, "chat");
        assert_eq!(msg.from, "12D3KooW");
        assert_eq!(msg.seqno, None);
        assert_eq!(msg.topics, None);
    }

    #[test]
    fn url_safe_payload_accepted() {
        let bytes = [0xfbu8, 0xff, 0xfe];
        let json = format!(r#"{{"data":"{}","topicID":"t"}}"#, URL_SAFE.encode(bytes));
        assert_eq!(decode_message(&json).unwrap().data, bytes);
    }

    #[test]
    fn missing_or_bad_payload_is_empty() {
        let msg = decode_message(r#"{"from":"p","topicID":"t"}"#).unwrap();
        assert!(msg.data.is_empty());
        let msg = decode_message(r#"{"from":"p","data":"!!not base64!!","topicID":"t"}"#).unwrap();
        assert!(msg.data.is_empty());
        let msg = decode_message(r#"{"from":"p","data":42,"topicID":"t"}"#).unwrap();
        assert!(msg.data.is_empty());
    }

    #[test]
    fn seqno_and_topics() {
        let json = r#"{"from":"p","data":"aGk=","topicID":"t","seqno":"AAEC","topics":["t","u"]}"#;
        let msg = decode_message(json).unwrap();
        assert_eq!(msg.seqno, Some(vec![0, 1, 2]));
        assert_eq!(msg.topics, Some(vec!["t".to_string(), "u".to_string()]));

        let json = r#"{"from":"p","data":"aGk=","topicID":"t","seqno":[7,8]}"#;
        assert_eq!(decode_message(json).unwrap().seqno, Some(vec![7, 8]));

        let json = r#"{"from":"p","data":"aGk=","topicID":"t","seqno":[700]}"#;
        assert_eq!(decode_message(json).unwrap().seqno, None);
    }

    #[test]
    fn invalid_envelope_is_error() {
        assert!(decode_message("not json").is_err());
        assert!(decode_message("").is_err());
    }

    #[test]
    fn display_falls_back_to_hex() {
        let mut msg = decode_message(r#"{"from":"p","data":"aGk=","topicID":"t"}"#).unwrap();
        assert_eq!(msg.to_string(), "Message(from=p, topic=t, data=hi)");
        msg.data = vec![0xff, 0x00];
        assert_eq!(msg.to_string(), "Message(from=p, topic=t, data=0xff00)");
    }

    #[test]
    fn listing_decodes_all_three_arrays() {
        let json = r#"{
            "Listens":[{"Protocol":"/x/echo","ListenAddress":"/p2p/QmSelf","TargetAddress":"/ip4/127.0.0.1/tcp/9000"}],
            "Forwards":[{"Protocol":"/x/web","ListenAddress":"/ip4/127.0.0.1/tcp/8080","TargetAddress":"/p2p/QmPeer"}],
            "Streams":[{"Protocol":"/x/echo","LocalAddr":"/ip4/127.0.0.1/tcp/5000","RemoteAddr":"/p2p/QmPeer","ID":"1"}]
        }"#;
        let c = decode_listing(json);
        assert_eq!(c.listeners.len(), 1);
        assert_eq!(c.listeners[0].service_name(), "echo");
        assert_eq!(c.listeners[0].target_address, "/ip4/127.0.0.1/tcp/9000");
        assert_eq!(c.forwarders[0].listen_address, "/ip4/127.0.0.1/tcp/8080");
        assert_eq!(c.streams[0].origin_address, "/ip4/127.0.0.1/tcp/5000");
        assert_eq!(c.streams[0].target_address, "/p2p/QmPeer");
    }

    #[test]
    fn listing_degrades_to_empty() {
        assert!(decode_listing("").is_empty());
        assert!(decode_listing("{oops").is_empty());
        let c = decode_listing(r#"{"Listens":null,"Forwards":[]}"#);
        assert!(c.is_empty());
    }

    #[test]
    fn string_lists() {
        assert_eq!(decode_string_list(r#"["a","b"]"#), vec!["a", "b"]);
        assert!(decode_string_list("null").is_empty());
        assert!(decode_string_list("[1,2]").is_empty());
        assert!(decode_string_list("").is_empty());
    }
}
