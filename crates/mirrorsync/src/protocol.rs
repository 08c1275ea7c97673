//! Peer wire protocol.
//!
//! Peers share a single bidirectional stream per connection carrying two
//! kinds of frames: small JSON control records driving the bootstrap
//! handshake, and raw binary CRDT update blobs. Frames are length-prefixed;
//! the two kinds are told apart by parse success, not by an envelope: any
//! frame that is not a valid control record is routed as an update blob,
//! and a frame that *is* JSON but not a known control record is dropped as
//! a protocol error.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum accepted frame size. Update frames carry whole file contents,
/// so this bounds the largest syncable file.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Control records exchanged during the bootstrap handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// "I hold a full tree; want a snapshot of it?"
    MirrorProposal,
    /// Accept a proposed bootstrap
    MirrorApproval,
    /// Reject a proposed bootstrap; the receiver is already mid-bootstrap
    MirrorDenial,
    /// Where the receiver can pull the published snapshot from
    DriveKey {
        /// Snapshot locator, hex encoded
        value: String,
    },
    /// The receiver has materialized the snapshot; the sender may release
    /// its transfer resources
    MirrorComplete,
}

impl ControlMessage {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Bytes {
        // Serialization of a closed enum of strings cannot fail
        Bytes::from(serde_json::to_vec(self).expect("control message serializes"))
    }
}

/// An inbound frame after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A well-formed control record
    Control(ControlMessage),
    /// A raw CRDT update blob
    Update(Bytes),
    /// Valid JSON that is not a known control record; logged and dropped
    Malformed,
}

/// Classify a received frame by parse success.
#[must_use]
pub fn classify(payload: Bytes) -> Frame {
    match serde_json::from_slice::<ControlMessage>(&payload) {
        Ok(msg) => Frame::Control(msg),
        Err(_) => {
            if serde_json::from_slice::<serde_json::Value>(&payload).is_ok() {
                Frame::Malformed
            } else {
                Frame::Update(payload)
            }
        }
    }
}

/// Write a length-prefixed frame.
///
/// Format: `[4-byte length BE][payload]`.
pub async fn write_frame(send: &mut iroh::endpoint::SendStream, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::swarm(format!("frame too large: {} bytes", payload.len())));
    }
    let len = (payload.len() as u32).to_be_bytes();
    send.write_all(&len)
        .await
        .map_err(|e| Error::swarm(format!("failed to send frame length: {e}")))?;
    send.write_all(payload)
        .await
        .map_err(|e| Error::swarm(format!("failed to send frame payload: {e}")))?;
    Ok(())
}

/// Read one length-prefixed frame, or `None` when the peer closed the
/// stream cleanly between frames.
pub async fn read_frame(recv: &mut iroh::endpoint::RecvStream) -> Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(iroh::endpoint::ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(e) => return Err(Error::swarm(format!("failed to read frame length: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::swarm(format!("frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload)
        .await
        .map_err(|e| Error::swarm(format!("failed to read frame payload: {e}")))?;
    Ok(Some(Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_form() {
        assert_eq!(
            ControlMessage::MirrorProposal.encode(),
            Bytes::from(&br#"{"type":"mirror-proposal"}"#[..])
        );

        let key = ControlMessage::DriveKey { value: "abcd".to_string() };
        let json: serde_json::Value = serde_json::from_slice(&key.encode()).unwrap();
        assert_eq!(json["type"], "drive-key");
        assert_eq!(json["value"], "abcd");
    }

    #[test]
    fn test_classify_control_roundtrip() {
        for msg in [
            ControlMessage::MirrorProposal,
            ControlMessage::MirrorApproval,
            ControlMessage::MirrorDenial,
            ControlMessage::DriveKey { value: "00ff".to_string() },
            ControlMessage::MirrorComplete,
        ] {
            assert_eq!(classify(msg.encode()), Frame::Control(msg));
        }
    }

    #[test]
    fn test_classify_binary_as_update() {
        // Automerge blobs start with a magic byte sequence that is never
        // valid JSON
        let blob = Bytes::from(vec![0x85, 0x6f, 0x4a, 0x83, 0x01, 0x02]);
        assert_eq!(classify(blob.clone()), Frame::Update(blob));
    }

    #[test]
    fn test_classify_unknown_json_as_malformed() {
        assert_eq!(
            classify(Bytes::from(&br#"{"type":"mirror-hijack"}"#[..])),
            Frame::Malformed
        );
        assert_eq!(classify(Bytes::from(&b"42"[..])), Frame::Malformed);
    }
}
