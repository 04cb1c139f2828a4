/***************************************************************************************************
Blocks: header hashing and the wire encoding fed through consensus
***************************************************************************************************/

use chrono::Local;
use serde::{Deserialize, Serialize};

use super::merkle::MerkleTree;
use super::transaction::Transaction;
use chain_utils::{conv, crypto};

/// A block. The header hash covers the previous hash, the timestamp bytes and
/// the transaction Merkle root; the body is the ordered transaction list.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub height: i64,
    /// Hash of the predecessor; empty for the genesis block.
    pub prev_block_hash: Vec<u8>,
    pub hash: Vec<u8>,
    pub timestamp: String,
    /// Root of the Merkle tree over the transactions' hashes in body order.
    pub tx_mht_root: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

/// Wire shape of a block; transactions travel as serialized bytes.
#[derive(Serialize, Deserialize)]
struct SeBlock {
    #[serde(rename = "Height")]
    height: i64,
    #[serde(
        rename = "PrevBlockHash",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    prev_block_hash: Vec<u8>,
    #[serde(
        rename = "Hash",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    hash: Vec<u8>,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(
        rename = "TxMHTRoot",
        serialize_with = "conv::ser_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_u8"
    )]
    tx_mht_root: Vec<u8>,
    #[serde(
        rename = "Transactions",
        serialize_with = "conv::ser_vec_vec_u8_to_str",
        deserialize_with = "conv::de_str_to_vec_vec_u8"
    )]
    transactions: Vec<Vec<u8>>,
}

impl Block {
    /// Assembles a block over `transactions`, anchoring them under a Merkle
    /// root. Requires at least one transaction.
    pub fn new(height: i64, prev_block_hash: Vec<u8>, transactions: Vec<Transaction>) -> Self {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let tx_hashes: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.tx_hash.clone()).collect();
        let tx_mht_root = MerkleTree::new(&tx_hashes).root_hash().to_vec();
        let hash = Self::header_hash(&prev_block_hash, &timestamp, &tx_mht_root);
        Block {
            height,
            prev_block_hash,
            hash,
            timestamp,
            tx_mht_root,
            transactions,
        }
    }

    /// `sha256(prev_hash + timestamp_bytes + tx_mht_root)`.
    pub fn header_hash(prev_block_hash: &[u8], timestamp: &str, tx_mht_root: &[u8]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend_from_slice(prev_block_hash);
        content.extend_from_slice(timestamp.as_bytes());
        content.extend_from_slice(tx_mht_root);
        crypto::sha256(&content)
    }

    /// JSON encoding carried through consensus.
    pub fn to_bytes(&self) -> Vec<u8> {
        let seblock = SeBlock {
            height: self.height,
            prev_block_hash: self.prev_block_hash.clone(),
            hash: self.hash.clone(),
            timestamp: self.timestamp.clone(),
            tx_mht_root: self.tx_mht_root.clone(),
            transactions: self.transactions.iter().map(Transaction::to_bytes).collect(),
        };
        serde_json::to_vec(&seblock).expect("block serialization cannot fail")
    }

    /// Inverse of [`Block::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Block, serde_json::Error> {
        let seblock: SeBlock = serde_json::from_slice(data)?;
        let mut transactions = Vec::with_capacity(seblock.transactions.len());
        for raw in &seblock.transactions {
            transactions.push(Transaction::from_bytes(raw)?);
        }
        Ok(Block {
            height: seblock.height,
            prev_block_hash: seblock.prev_block_hash,
            hash: seblock.hash,
            timestamp: seblock.timestamp,
            tx_mht_root: seblock.tx_mht_root,
            transactions,
        })
    }
}
