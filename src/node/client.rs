/***************************************************************************************************
Client: replays an input file as requests to the primary and listens for replies
***************************************************************************************************/

use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use log::{info, warn};
use rand::Rng;

use crate::network::P2P;
use crate::pbft::messages::{self, Message, Request};
use chain_utils::crypto;
use chain_utils::filehelper::FileHelper;

/// A client node. Requests are read from `data/testRequest_<id>`, one
/// payload per line; acknowledgements arrive on the client's own listener.
pub struct Client {
    client_id: String,
    addr: String,
    pub rsa_privkey: Vec<u8>,
    pub rsa_pubkey: Vec<u8>,
    p2p: Arc<P2P>,
}

impl Client {
    /// Registers the client in the network and starts its reply listener.
    pub fn start(client_id: &str, addr: &str, p2p: Arc<P2P>) -> Arc<Client> {
        let (privkey, pubkey) = crypto::generate_keypair();
        p2p.add_client(client_id, addr);
        p2p.add_pubkey(client_id, pubkey.clone());
        let client = Arc::new(Client {
            client_id: client_id.to_string(),
            addr: addr.to_string(),
            rsa_privkey: privkey,
            rsa_pubkey: pubkey,
            p2p,
        });
        let listener = Arc::clone(&client);
        thread::spawn(move || listener.listen());
        client
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // Replies arrive as plain text, one per connection.
    fn listen(&self) {
        let listener = TcpListener::bind(&self.addr).expect("failed to bind the client listener");
        info!(target: "node", "client {} listening on {}", self.client_id, self.addr);
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
            info!(target: "node", "client {} received: {}", self.client_id, String::from_utf8_lossy(&raw));
        }
    }

    /// Reads this client's input file and sends one request per line to the
    /// primary. A missing input file is fatal.
    pub fn send_requests_from_file(&self) {
        let path = format!("data/testRequest_{}", self.client_id);
        let content = FileHelper::read_file_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read client input {}: {}", path, e));
        let primary_addr = self.p2p.primary_addr().expect("no primary registered");
        let mut rng = rand::thread_rng();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let request = Request {
                message: Message {
                    content: line.as_bytes().to_vec(),
                    id: random_message_id(&mut rng),
                },
                timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                client_addr: self.addr.clone(),
            };
            let body = serde_json::to_vec(&request).expect("request serialization cannot fail");
            self.p2p
                .send(&messages::joint_message(messages::CMD_REQUEST, &body), &primary_addr);
        }
    }
}

// Ten-digit message id, mirroring what real clients stamp on requests.
fn random_message_id<R: Rng>(rng: &mut R) -> i64 {
    rng.gen_range(1_000_000_001..10_000_000_000)
}
