/***************************************************************************************************
Transactions: immutable wrappers around raw client requests
***************************************************************************************************/

use serde::{Deserialize, Serialize};

use crate::pbft::messages::Request;
use chain_utils::{conv, crypto};

/// A single transaction. `content` is the serialized client request; the
/// sender address is lifted out of it at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Position of the transaction inside its block's batch.
    #[serde(rename = "TxID")]
    pub tx_id: i64,
    #[serde(
        rename = "Content",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub content: Vec<u8>,
    /// SHA-256 of `content`.
    #[serde(
        rename = "TxHash",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    pub tx_hash: Vec<u8>,
    /// Reply address of the originating client; empty if `content` does not
    /// parse as a request.
    #[serde(rename = "Sender")]
    pub sender: String,
}

impl Transaction {
    /// Wraps a serialized client request as a transaction.
    pub fn new(tx_id: i64, content: Vec<u8>) -> Self {
        let sender = serde_json::from_slice::<Request>(&content)
            .map(|request| request.client_addr)
            .unwrap_or_default();
        let tx_hash = crypto::sha256(&content);
        Transaction {
            tx_id,
            content,
            tx_hash,
            sender,
        }
    }

    /// JSON encoding used inside serialized blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transaction serialization cannot fail")
    }

    /// Inverse of [`Transaction::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Transaction, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
