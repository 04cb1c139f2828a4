/***************************************************************************************************
Full node: inbound listener, request inbox, block packer and chain applier
***************************************************************************************************/

use std::collections::VecDeque;
use std::io::Read;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};

use crate::chain::block::Block;
use crate::chain::transaction::Transaction;
use crate::chain::Blockchain;
use crate::network::P2P;
use crate::pbft::messages::{self, Message, Request};
use crate::pbft::Pbft;
use chain_utils::crypto;

/// Pause between packer batch attempts; the natural block interval.
const BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// A full node: listener, packer and applier threads around one replica.
pub struct Fullnode {
    node_id: String,
    addr: String,
    batch_size: usize,
    /// FIFO of raw request frames awaiting packing; primary only.
    inbox: Mutex<VecDeque<Vec<u8>>>,
    p2p: Arc<P2P>,
    pbft: Pbft,
    chain: Mutex<Blockchain>,
}

impl Fullnode {
    /// Registers the node in the network, wires up its replica and starts
    /// the listener, applier and (on the primary) packer threads.
    pub fn start(node_id: &str, addr: &str, p2p: Arc<P2P>, batch_size: usize) -> Arc<Fullnode> {
        let (privkey, pubkey) = crypto::generate_keypair();
        p2p.add_full_node(node_id, addr);
        p2p.add_pubkey(node_id, pubkey.clone());
        let pbft = Pbft::new(node_id, addr, privkey, pubkey, Arc::clone(&p2p));

        let fullnode = Arc::new(Fullnode {
            node_id: node_id.to_string(),
            addr: addr.to_string(),
            batch_size,
            inbox: Mutex::new(VecDeque::new()),
            p2p,
            pbft,
            chain: Mutex::new(Blockchain::new()),
        });

        let listener = Arc::clone(&fullnode);
        thread::spawn(move || listener.listen());
        let applier = Arc::clone(&fullnode);
        thread::spawn(move || applier.apply_committed());
        if fullnode.is_primary() {
            let packer = Arc::clone(&fullnode);
            thread::spawn(move || packer.pack_blocks());
        }
        fullnode
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Height of this node's copy of the chain.
    pub fn chain_height(&self) -> i64 {
        self.chain.lock().expect("chain lock poisoned").current_height()
    }

    fn is_primary(&self) -> bool {
        self.node_id == self.p2p.primary_id()
    }

    // One connection per frame, drained synchronously before the next accept.
    fn listen(&self) {
        let listener = TcpListener::bind(&self.addr).expect("failed to bind the node listener");
        info!(target: "node", "full node {} listening on {}", self.node_id, self.addr);
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(target: "node", "accept failed on {}: {}", self.addr, e);
                    continue;
                }
            };
            let mut raw = Vec::new();
            if let Err(e) = stream.read_to_end(&mut raw) {
                warn!(target: "node", "read failed on {}: {}", self.addr, e);
                continue;
            }
            self.dispatch(raw);
        }
    }

    // The primary keeps client requests for its packer; every other frame
    // goes straight to the replica.
    fn dispatch(&self, raw: Vec<u8>) {
        let is_client_request = match messages::split_message(&raw) {
            Some((cmd, _)) => cmd == messages::CMD_REQUEST,
            None => false,
        };
        if self.is_primary() && is_client_request {
            self.enqueue_request(raw);
        } else {
            self.pbft.handle_frame(&raw);
        }
    }

    fn enqueue_request(&self, raw: Vec<u8>) {
        debug!(target: "node", "full node {} pooled a client request", self.node_id);
        self.inbox
            .lock()
            .expect("inbox lock poisoned")
            .push_back(raw);
    }

    // Primary only. Drains up to batch_size requests per interval, packs
    // them into the next block and runs the result through consensus.
    fn pack_blocks(&self) {
        let mut packed_height: i64 = 0;
        loop {
            thread::sleep(BATCH_INTERVAL);
            let batch = self.drain_batch();
            if batch.is_empty() {
                continue;
            }
            let prev_hash = self
                .chain
                .lock()
                .expect("chain lock poisoned")
                .last_block()
                .map(|block| block.hash.clone())
                .unwrap_or_default();
            let block = build_block(packed_height, prev_hash, &batch);
            info!(target: "node", "primary {} packed block {} with {} transactions", self.node_id, block.height, block.transactions.len());
            self.pbft.handle_frame(&block_to_request_frame(&block));
            packed_height += 1;
        }
    }

    // FIFO snapshot of at most batch_size pooled requests. The lock is not
    // held across packing or consensus.
    fn drain_batch(&self) -> Vec<Vec<u8>> {
        let mut inbox = self.inbox.lock().expect("inbox lock poisoned");
        let take = self.batch_size.min(inbox.len());
        inbox.drain(..take).collect()
    }

    // Sole writer of the chain: awaits each committed message, unpacks the
    // block, acknowledges every transaction's sender and appends.
    fn apply_committed(&self) {
        loop {
            let height = self.chain_height();
            let message = self.pbft.wait_committed(height);
            let block = Block::from_bytes(&message.content)
                .expect("committed message must carry a block");
            self.reply_clients(&block);
            let new_height = self
                .chain
                .lock()
                .expect("chain lock poisoned")
                .add_block(block);
            info!(target: "node", "full node {} appended block {}, chain height is now {}", self.node_id, height, new_height);
        }
    }

    // Best-effort acknowledgement to each transaction's origin; a dead
    // client never rolls back the applied block.
    fn reply_clients(&self, block: &Block) {
        for tx in &block.transactions {
            if tx.sender.is_empty() {
                continue;
            }
            let info = format!(
                "node {} stored msg {} in block {}: {}",
                self.node_id,
                tx.tx_id,
                block.height,
                String::from_utf8_lossy(&tx.content)
            );
            self.p2p.send(info.as_bytes(), &tx.sender);
        }
    }
}

/// Packs a batch of raw request frames into a block. Each frame's body
/// becomes one transaction, indexed in batch order.
pub fn build_block(height: i64, prev_hash: Vec<u8>, batch: &[Vec<u8>]) -> Block {
    let mut transactions = Vec::with_capacity(batch.len());
    for (i, raw) in batch.iter().enumerate() {
        let (_, content) =
            messages::split_message(raw).expect("pooled frames carry a command tag");
        transactions.push(Transaction::new(i as i64, content.to_vec()));
    }
    Block::new(height, prev_hash, transactions)
}

/// Wraps a packed block as a synthetic client request, framed for the
/// replica's dispatch. The block height doubles as the message id; there is
/// no client to reply to.
pub fn block_to_request_frame(block: &Block) -> Vec<u8> {
    let request = Request {
        message: Message {
            content: block.to_bytes(),
            id: block.height,
        },
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        client_addr: String::new(),
    };
    let body = serde_json::to_vec(&request).expect("request serialization cannot fail");
    messages::joint_message(messages::CMD_REQUEST, &body)
}
