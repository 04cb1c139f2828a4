/***************************************************************************************************
Peer bookkeeping and the TCP transport: unicast send plus broadcast-except-self
***************************************************************************************************/

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;

use log::{debug, warn};

/// Address and public-key tables shared by every node in the process, plus
/// the designated primary. One frame per connection; closing the stream
/// terminates the frame.
#[derive(Debug, Default)]
pub struct P2P {
    node_table: Mutex<HashMap<String, String>>,
    client_table: Mutex<HashMap<String, String>>,
    pubkey_table: Mutex<HashMap<String, Vec<u8>>>,
    primary_id: Mutex<String>,
}

impl P2P {
    pub fn new() -> Self {
        Default::default()
    }

    /// Fixes the designated primary for the lifetime of the cluster.
    pub fn set_primary(&self, node_id: &str) {
        *self.primary_id.lock().expect("primary lock poisoned") = node_id.to_string();
    }

    pub fn primary_id(&self) -> String {
        self.primary_id.lock().expect("primary lock poisoned").clone()
    }

    /// Registers a full node's listen address.
    pub fn add_full_node(&self, node_id: &str, addr: &str) {
        self.node_table
            .lock()
            .expect("node table lock poisoned")
            .insert(node_id.to_string(), addr.to_string());
    }

    /// Registers a client's reply address.
    pub fn add_client(&self, client_id: &str, addr: &str) {
        self.client_table
            .lock()
            .expect("client table lock poisoned")
            .insert(client_id.to_string(), addr.to_string());
    }

    /// Registers the public key of a node or client.
    pub fn add_pubkey(&self, id: &str, pubkey: Vec<u8>) {
        self.pubkey_table
            .lock()
            .expect("pubkey table lock poisoned")
            .insert(id.to_string(), pubkey);
    }

    /// Number of full nodes in the cluster, including the caller.
    pub fn node_count(&self) -> usize {
        self.node_table.lock().expect("node table lock poisoned").len()
    }

    pub fn node_pubkey(&self, id: &str) -> Option<Vec<u8>> {
        self.pubkey_table
            .lock()
            .expect("pubkey table lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn primary_pubkey(&self) -> Option<Vec<u8>> {
        self.node_pubkey(&self.primary_id())
    }

    pub fn primary_addr(&self) -> Option<String> {
        self.node_table
            .lock()
            .expect("node table lock poisoned")
            .get(&self.primary_id())
            .cloned()
    }

    /// Sends `context` to every full node except `node_id`.
    pub fn broadcast(&self, node_id: &str, context: &[u8]) {
        let peers: Vec<(String, String)> = self
            .node_table
            .lock()
            .expect("node table lock poisoned")
            .iter()
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect();
        for (id, addr) in peers {
            if id != node_id {
                self.send(context, &addr);
            }
        }
    }

    /// Best-effort unicast: connect, write the frame, close. Failures are
    /// logged and swallowed; peers recover by replaying on later rounds.
    pub fn send(&self, context: &[u8], addr: &str) {
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "node", "connect to {} failed: {}", addr, e);
                return;
            }
        };
        if let Err(e) = stream.write_all(context) {
            warn!(target: "node", "write to {} failed: {}", addr, e);
            return;
        }
        debug!(target: "node", "sent {} bytes to {}", context.len(), addr);
    }
}
