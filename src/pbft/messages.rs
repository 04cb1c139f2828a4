/***************************************************************************************************
Wire records and the tag-prefixed framing shared by replicas and clients
***************************************************************************************************/

use log::warn;
use serde::{Deserialize, Serialize};

use chain_utils::conv;
use chain_utils::crypto;

/// Number of bytes reserved for the command tag at the start of every frame,
/// NUL-padded on the right.
pub const PREFIX_CMD_LENGTH: usize = 12;

/// Tag for client requests and packed-block requests.
pub const CMD_REQUEST: &str = "request";
/// Tag for the primary's pre-prepare broadcast.
pub const CMD_PREPREPARE: &str = "preprepare";
/// Tag for prepare votes.
pub const CMD_PREPARE: &str = "prepare";
/// Tag for commit votes.
pub const CMD_COMMIT: &str = "commit";

/// The payload carried through consensus and into the committed log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Raw content; for packed blocks this is the serialized block.
    #[serde(
        rename = "Content",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub content: Vec<u8>,
    /// Message id chosen by the sender (clients: random; packer: block height).
    #[serde(rename = "ID")]
    pub id: i64,
}

/// <REQUEST, o, t, c>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub message: Message,
    /// Client-side send time in nanoseconds.
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    /// Reply address; empty for packer-synthesized block requests.
    #[serde(rename = "ClientAddr")]
    pub client_addr: String,
}

/// <<PRE-PREPARE, v, n, d>, m>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    #[serde(rename = "RequestMessage")]
    pub request: Request,
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "SequenceID")]
    pub sequence_id: i64,
    #[serde(
        rename = "Sign",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub sign: Vec<u8>,
}

/// <PREPARE, v, n, d, i>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "SequenceID")]
    pub sequence_id: i64,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(
        rename = "Sign",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub sign: Vec<u8>,
}

/// <COMMIT, v, n, D(m), i>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "SequenceID")]
    pub sequence_id: i64,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    #[serde(
        rename = "Sign",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub sign: Vec<u8>,
}

/// Tagged view of a raw peer-to-peer frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

/// Prefixes `content` with the NUL-padded command tag.
pub fn joint_message(cmd: &str, content: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; PREFIX_CMD_LENGTH];
    frame[..cmd.len()].copy_from_slice(cmd.as_bytes());
    frame.extend_from_slice(content);
    frame
}

/// Splits a frame into its command tag (trailing NULs stripped) and body.
/// Returns `None` for frames shorter than the command prefix.
pub fn split_message(raw: &[u8]) -> Option<(&str, &[u8])> {
    if raw.len() < PREFIX_CMD_LENGTH {
        return None;
    }
    let prefix = &raw[..PREFIX_CMD_LENGTH];
    let end = prefix.iter().position(|b| *b == 0).unwrap_or(PREFIX_CMD_LENGTH);
    let cmd = std::str::from_utf8(&prefix[..end]).ok()?;
    Some((cmd, &raw[PREFIX_CMD_LENGTH..]))
}

/// Decodes a raw frame into its tagged variant. Malformed frames, unknown
/// tags and unparsable bodies are dropped with a log line.
pub fn decode_frame(raw: &[u8]) -> Option<Frame> {
    let (cmd, content) = match split_message(raw) {
        Some(parts) => parts,
        None => {
            warn!(target: "consensus", "frame shorter than the command prefix, dropping");
            return None;
        }
    };
    let frame = match cmd {
        CMD_REQUEST => serde_json::from_slice(content).map(Frame::Request),
        CMD_PREPREPARE => serde_json::from_slice(content).map(Frame::PrePrepare),
        CMD_PREPARE => serde_json::from_slice(content).map(Frame::Prepare),
        CMD_COMMIT => serde_json::from_slice(content).map(Frame::Commit),
        other => {
            warn!(target: "consensus", "unknown command tag '{}', dropping frame", other);
            return None;
        }
    };
    match frame {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(target: "consensus", "malformed '{}' body, dropping frame: {}", cmd, e);
            None
        }
    }
}

/// Hex-encoded SHA-256 over the canonical JSON encoding of a request.
/// Every replica runs the same serializer, so digests agree bit-for-bit.
pub fn get_digest(request: &Request) -> String {
    let encoded = serde_json::to_vec(request).expect("request serialization cannot fail");
    hex::encode(crypto::sha256(&encoded))
}
