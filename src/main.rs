extern crate pbft_chain;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chain_utils::ini::env2var;
use pbft_chain::config::{initialize_ini, initialize_logging, load_cluster};
use pbft_chain::network::P2P;
use pbft_chain::node::client::Client;
use pbft_chain::node::fullnode::Fullnode;
use pbft_chain::node::NodeRole;

fn main() {
    // read settings from the ini
    initialize_ini();
    // initialize logger
    initialize_logging();

    let batch_size: usize = env2var("node.batch_size");
    let cluster_file: String = env2var("node.cluster");

    let entries = load_cluster(&cluster_file);
    let p2p = Arc::new(P2P::new());

    // the first fullnode line is the designated primary
    let primary = entries
        .iter()
        .find(|entry| entry.role == NodeRole::Fullnode)
        .expect("cluster file declares no fullnode");
    p2p.set_primary(&primary.id);

    let mut fullnodes = Vec::new();
    let mut clients = Vec::new();
    for entry in &entries {
        match entry.role {
            NodeRole::Fullnode => {
                fullnodes.push(Fullnode::start(&entry.id, &entry.addr, Arc::clone(&p2p), batch_size))
            }
            NodeRole::Client => {
                clients.push(Client::start(&entry.id, &entry.addr, Arc::clone(&p2p)))
            }
        }
    }

    // give the listeners a moment before the clients start replaying input
    thread::sleep(Duration::from_millis(500));

    for client in &clients {
        client.send_requests_from_file();
    }

    // consensus threads run until the process is killed
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
