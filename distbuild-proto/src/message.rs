//! Wire message kinds carried inside a `distbuild_core` frame.
//!
//! The frame itself (length prefix, partial-read reassembly) is
//! `distbuild_core`'s job; this module only defines what goes in the body
//! and how to get it to and from bytes. The exact bytes are not part of any
//! external contract distbuild has to match, so a self-describing
//! `serde_json` envelope is enough — it keeps messages field-tagged and
//! human-readable on the wire without hand-rolling a binary schema.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canon::Command;

/// One entry in a cache manifest: a header path and the content hash it had
/// when the manifest was recorded.
pub type HeaderHash = (String, [u8; 16]);

/// A message exchanged on any distbuild Connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Message {
    /// Emitter -> Absorber: run `command` against `source`, which is
    /// already preprocessed. `deps` carries the manifest header list when
    /// the Emitter wants the Absorber to validate it remotely (unused by
    /// the default Emitter policy, which validates locally).
    Execute {
        command: Command,
        #[serde(with = "bytes_as_hex")]
        source: Bytes,
        deps: Option<Vec<HeaderHash>>,
    },

    /// Absorber -> Emitter: compile outcome.
    Result {
        #[serde(with = "opt_bytes_as_hex")]
        object: Option<Bytes>,
        #[serde(with = "bytes_as_hex")]
        stderr: Bytes,
        exit_code: i32,
    },

    /// Either direction: a status/heartbeat/metrics-push envelope.
    Status { code: StatusCode, description: String },

    /// Absorber -> Emitter: the bounded task queue is full, try another peer.
    Overloaded,

    /// Absorber -> Emitter: task was queued but shutdown started before a
    /// worker could pick it up.
    Shutting,

    Ping,
    Pong,
}

/// `Status` codes used for Coordinator registration, staleness queries, and
/// Collector metrics pushes — the same envelope shape serves all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Absorber announcing itself to a Coordinator.
    Registered,
    /// Coordinator replying with its current peer table.
    PeerList,
    /// A daemon pushing a metrics snapshot to a Collector.
    MetricsPush,
}

/// Coordinator peer-table entry, carried in a `Status { code: PeerList, .. }`
/// description as JSON (kept out of the `Message` enum itself since only
/// the Coordinator and its Emitter clients need to parse it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListing {
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
    pub threads: u32,
}

/// A metrics snapshot pushed to the Collector, carried the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub peer_id: String,
    pub counters: BTreeMap<String, u64>,
}

/// Errors encoding or decoding a `Message`.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message serialization failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message deserialization failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Message {
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails (should not
    /// happen for well-formed `Message` values).
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(self).map(Bytes::from).map_err(CodecError::Encode)
    }

    /// # Errors
    ///
    /// Returns `CodecError::Decode` if `bytes` is not a valid encoded
    /// `Message` — the caller should treat this as a protocol violation and
    /// close the Connection.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

mod bytes_as_hex {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let hexstr = String::deserialize(d)?;
        hex::decode(hexstr)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod opt_bytes_as_hex {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        bytes.as_ref().map(hex::encode).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let hexstr: Option<String> = Option::deserialize(d)?;
        hexstr
            .map(|s| hex::decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canon::{Action, Command};

    #[test]
    fn execute_round_trips() {
        let msg = Message::Execute {
            command: Command {
                action: Action::Compile,
                executable: "clang++".into(),
                cwd: "/tmp/build".into(),
                args: vec!["-c".into(), "a.cc".into()],
                env: vec![],
                inputs: vec!["a.cc".into()],
                output: Some("a.o".into()),
                language: Some("c++".into()),
                flags: Default::default(),
            },
            source: Bytes::from_static(b"int main() {}"),
            deps: None,
        };

        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Execute { source, .. } => assert_eq!(&source[..], b"int main() {}"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn overloaded_round_trips() {
        let encoded = Message::Overloaded.encode().unwrap();
        assert!(matches!(Message::decode(&encoded).unwrap(), Message::Overloaded));
    }

    #[test]
    fn decode_garbage_is_protocol_error() {
        assert!(Message::decode(b"not json").is_err());
    }
}
