use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::metrics::{METRIC_TRANSPORT_FRAMES_RECEIVED, METRIC_TRANSPORT_FRAMES_SENT};
use crate::types::{
    Address, AttestationKind, AttestationRequest, Bytes, PostAssembly, PreAssembly,
    PrivateTransaction, ResolvedVerifier,
};

/// Maximum accepted frame body. Anything larger is treated as a corrupt or
/// hostile peer stream.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EndorsementReply {
    Attested {
        kind: AttestationKind,
        payload: Bytes,
        verifier: ResolvedVerifier,
    },
    Revert {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationOutcome {
    Dispatched,
    Reverted { reason: String },
}

/// Messages exchanged between nodes. Responses are matched to requests on
/// `(tx_id, attestation name, party)`; all handlers are idempotent under
/// redelivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TransportMessage {
    EndorsementRequest {
        tx_id: Uuid,
        domain: String,
        contract: Address,
        attestation: AttestationRequest,
        party: String,
        pre_assembly: PreAssembly,
        post_assembly: PostAssembly,
    },
    EndorsementResponse {
        tx_id: Uuid,
        contract: Address,
        attestation_name: String,
        party: String,
        reply: EndorsementReply,
    },
    DelegationRequest {
        delegation_id: Uuid,
        transaction: PrivateTransaction,
    },
    DelegationAck {
        delegation_id: Uuid,
        tx_id: Uuid,
        contract: Address,
    },
    DelegationResult {
        tx_id: Uuid,
        contract: Address,
        outcome: DelegationOutcome,
    },
}

impl TransportMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            TransportMessage::EndorsementRequest { .. } => 1,
            TransportMessage::EndorsementResponse { .. } => 2,
            TransportMessage::DelegationRequest { .. } => 3,
            TransportMessage::DelegationAck { .. } => 4,
            TransportMessage::DelegationResult { .. } => 5,
        }
    }
}

/// One wire frame: the sending node plus a typed payload. The redundant
/// `message_type` byte lets a receiver reject unknown payloads without
/// decoding the body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub message_type: u8,
    pub node: String,
    pub payload: TransportMessage,
}

impl Frame {
    pub fn new(node: impl Into<String>, payload: TransportMessage) -> Self {
        Self {
            message_type: payload.message_type(),
            node: node.into(),
            payload,
        }
    }
}

/// Encodes a frame as a u32 big-endian length prefix followed by the JSON
/// body. State data inside assemblies is arbitrary JSON, so the body uses
/// the same encoding end to end.
pub fn encode_frame(frame: &Frame) -> EngineResult<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(EngineError::InvalidInput(format!(
            "frame of {} bytes exceeds maximum",
            body.len()
        )));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental decode from a stream buffer. Returns `None` until a whole
/// frame is buffered; consumes exactly one frame per call otherwise.
pub fn decode_frame(buf: &mut BytesMut) -> EngineResult<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(EngineError::InvalidInput(format!(
            "frame length {len} exceeds maximum"
        )));
    }
    if buf.len() < 4 + len as usize {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(len as usize);
    let frame: Frame = serde_json::from_slice(&body)?;
    if frame.message_type != frame.payload.message_type() {
        return Err(EngineError::InvalidInput(format!(
            "frame type byte {} does not match payload",
            frame.message_type
        )));
    }
    Ok(Some(frame))
}

/// Outbound half of the inter-node transport. Inbound frames arrive on the
/// receiver handed out when the transport is registered with a node.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_node(&self) -> &str;

    async fn send(&self, to: &str, message: TransportMessage) -> EngineResult<()>;
}

/// In-process transport connecting nodes within one process. Frames still
/// pass through the wire codec so framing is exercised on every send.
pub struct InProcessTransport {
    node: String,
    peers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Frame>>>>,
}

impl InProcessTransport {
    pub fn new(node: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let node = node.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let peers = Arc::new(RwLock::new(HashMap::new()));
        peers.write().insert(node.clone(), tx);
        (Self { node, peers }, rx)
    }

    /// Makes two transports visible to each other.
    pub fn connect(a: &InProcessTransport, b: &InProcessTransport) {
        let a_sender = a
            .peers
            .read()
            .get(&a.node)
            .cloned()
            .expect("own inbox present");
        let b_sender = b
            .peers
            .read()
            .get(&b.node)
            .cloned()
            .expect("own inbox present");
        a.peers.write().insert(b.node.clone(), b_sender);
        b.peers.write().insert(a.node.clone(), a_sender);
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn local_node(&self) -> &str {
        &self.node
    }

    async fn send(&self, to: &str, message: TransportMessage) -> EngineResult<()> {
        let sender = self
            .peers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| EngineError::Routing(format!("unknown node {to}")))?;

        // round-trip through the codec so in-process tests exercise framing
        let encoded = encode_frame(&Frame::new(self.node.clone(), message))?;
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = decode_frame(&mut buf)?
            .ok_or_else(|| EngineError::Fatal("encoded frame did not decode".into()))?;

        metrics::counter!(METRIC_TRANSPORT_FRAMES_SENT, 1, "peer" => to.to_string());
        sender
            .send(frame)
            .map_err(|_| EngineError::Transient(format!("node {to} inbox closed")))?;
        metrics::counter!(METRIC_TRANSPORT_FRAMES_RECEIVED, 1, "peer" => to.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> TransportMessage {
        TransportMessage::DelegationAck {
            delegation_id: Uuid::new_v4(),
            tx_id: Uuid::new_v4(),
            contract: Address::repeat_byte(0x42),
        }
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new("node1", sample_message());
        let encoded = encode_frame(&frame).expect("encode");
        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode_frame(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded.node, "node1");
        assert_eq!(decoded.message_type, frame.message_type);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none() {
        let frame = Frame::new("node1", sample_message());
        let encoded = encode_frame(&frame).expect("encode");
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode_frame(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = encode_frame(&Frame::new("node1", sample_message())).unwrap();
        let second = encode_frame(&Frame::new("node2", sample_message())).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);
        let a = decode_frame(&mut buf).unwrap().expect("first");
        let b = decode_frame(&mut buf).unwrap().expect("second");
        assert_eq!(a.node, "node1");
        assert_eq!(b.node, "node2");
    }

    #[test]
    fn mismatched_type_byte_rejected() {
        let mut frame = Frame::new("node1", sample_message());
        frame.message_type = 99;
        let encoded = encode_frame(&frame).expect("encode");
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[tokio::test]
    async fn in_process_delivery() {
        let (a, _rx_a) = InProcessTransport::new("node1");
        let (b, mut rx_b) = InProcessTransport::new("node2");
        InProcessTransport::connect(&a, &b);

        a.send("node2", sample_message()).await.expect("send");
        let frame = rx_b.recv().await.expect("delivered");
        assert_eq!(frame.node, "node1");
    }

    #[tokio::test]
    async fn unknown_peer_is_routing_error() {
        let (a, _rx) = InProcessTransport::new("node1");
        let err = a.send("nowhere", sample_message()).await.unwrap_err();
        assert!(matches!(err, EngineError::Routing(_)));
    }
}
