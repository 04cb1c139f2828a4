/***************************************************************************************************
PBFT replica: three-phase agreement with signed messages and quorum tracking
***************************************************************************************************/

pub mod messages;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, info, warn};

use self::messages::{Commit, Frame, Message, PrePrepare, Prepare, Request};
use crate::network::P2P;
use chain_utils::crypto;

/// Everything the three-phase protocol mutates, kept behind one lock so
/// concurrent frame deliveries cannot race the maps.
#[derive(Debug, Default)]
struct ReplicaState {
    /// Next sequence number awaiting commit application.
    seq_low: i64,
    /// Primary-assigned sequence counter for accepted client requests.
    next_seq: i64,
    /// Request bodies by digest.
    message_pool: HashMap<String, Request>,
    /// Distinct Prepare senders by digest.
    prepare_votes: HashMap<String, HashSet<String>>,
    /// Distinct Commit senders by digest.
    commit_votes: HashMap<String, HashSet<String>>,
    /// Digests this replica has already answered with its own Commit.
    commit_broadcast: HashSet<String>,
    /// Digests whose commit result has been released downstream.
    replied: HashSet<String>,
    /// Quorum-complete commits waiting for the sequence gap to close.
    pending_commits: HashMap<i64, Commit>,
    /// Committed messages in strict sequence order.
    committed_log: Vec<Message>,
}

/// A PBFT replica bound to one node identity. Frame handlers hold the state
/// lock across their body; the condvar wakes appliers when `seq_low` moves.
#[derive(Debug)]
pub struct Pbft {
    node_id: String,
    rsa_privkey: Vec<u8>,
    rsa_pubkey: Vec<u8>,
    p2p: Arc<P2P>,
    state: Mutex<ReplicaState>,
    committed: Condvar,
}

impl Pbft {
    /// Creates a replica for the node registered as `node_id` at `addr`.
    pub fn new(
        node_id: &str,
        addr: &str,
        rsa_privkey: Vec<u8>,
        rsa_pubkey: Vec<u8>,
        p2p: Arc<P2P>,
    ) -> Self {
        info!(target: "consensus", "replica {} ready at {}", node_id, addr);
        Pbft {
            node_id: node_id.to_string(),
            rsa_privkey,
            rsa_pubkey,
            p2p,
            state: Mutex::new(ReplicaState::default()),
            committed: Condvar::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// PEM public key this replica signs under.
    pub fn pubkey(&self) -> &[u8] {
        &self.rsa_pubkey
    }

    fn is_primary(&self) -> bool {
        self.node_id == self.p2p.primary_id()
    }

    // Prepare quorum size. The primary never sends a Prepare and counts
    // itself through its pre-prepare, so it waits for one more peer vote.
    fn prepare_threshold(&self) -> usize {
        let quorum = self.p2p.node_count() / 3 * 2;
        if self.is_primary() {
            quorum
        } else {
            quorum - 1
        }
    }

    fn commit_threshold(&self) -> usize {
        self.p2p.node_count() / 3 * 2
    }

    /// Entry point for every raw frame addressed to the replica.
    pub fn handle_frame(&self, raw: &[u8]) {
        match messages::decode_frame(raw) {
            Some(Frame::Request(request)) => self.handle_client_request(request),
            Some(Frame::PrePrepare(pre_prepare)) => self.handle_pre_prepare(pre_prepare),
            Some(Frame::Prepare(prepare)) => self.handle_prepare(prepare),
            Some(Frame::Commit(commit)) => self.handle_commit(commit),
            None => {}
        }
    }

    // Primary only: pool the request, assign the next sequence number and
    // broadcast the pre-prepare.
    fn handle_client_request(&self, request: Request) {
        if !self.is_primary() {
            warn!(target: "consensus", "replica {} is not the primary, ignoring client request", self.node_id);
            return;
        }
        let digest = messages::get_digest(&request);
        let digest_bytes = hex::decode(&digest).expect("own digest is hex");
        let sign = crypto::sign_sha256(&digest_bytes, &self.rsa_privkey);

        let mut state = self.state.lock().expect("replica lock poisoned");
        let sequence_id = state.next_seq;
        state.next_seq += 1;
        state.message_pool.insert(digest.clone(), request.clone());
        let pre_prepare = PrePrepare {
            request,
            digest,
            sequence_id,
            sign,
        };
        debug!(target: "consensus", "replica {} broadcasting pre-prepare for seq {}", self.node_id, sequence_id);
        let body = serde_json::to_vec(&pre_prepare).expect("pre-prepare serialization cannot fail");
        self.p2p
            .broadcast(&self.node_id, &messages::joint_message(messages::CMD_PREPREPARE, &body));
    }

    // Backup path: validate the primary's pre-prepare, pool the request and
    // answer with a signed prepare.
    fn handle_pre_prepare(&self, pre_prepare: PrePrepare) {
        if messages::get_digest(&pre_prepare.request) != pre_prepare.digest {
            warn!(target: "consensus", "replica {}: digest mismatch, refusing prepare broadcast", self.node_id);
            return;
        }
        let digest_bytes = hex::decode(&pre_prepare.digest).expect("matched digest is hex");
        let primary_pubkey = match self.p2p.primary_pubkey() {
            Some(pubkey) => pubkey,
            None => {
                warn!(target: "consensus", "replica {}: no primary key registered, dropping pre-prepare", self.node_id);
                return;
            }
        };
        if !crypto::valid_sig_sha256(&digest_bytes, &pre_prepare.sign, &primary_pubkey) {
            warn!(target: "consensus", "replica {}: signature verification failed, refusing prepare broadcast", self.node_id);
            return;
        }

        let sign = crypto::sign_sha256(&digest_bytes, &self.rsa_privkey);
        let prepare = Prepare {
            digest: pre_prepare.digest.clone(),
            sequence_id: pre_prepare.sequence_id,
            node_id: self.node_id.clone(),
            sign,
        };

        let mut state = self.state.lock().expect("replica lock poisoned");
        state
            .message_pool
            .insert(pre_prepare.digest, pre_prepare.request);
        debug!(target: "consensus", "replica {} broadcasting prepare for seq {}", self.node_id, prepare.sequence_id);
        let body = serde_json::to_vec(&prepare).expect("prepare serialization cannot fail");
        self.p2p
            .broadcast(&self.node_id, &messages::joint_message(messages::CMD_PREPARE, &body));
    }

    // Counts a peer prepare; on quorum, broadcasts this replica's commit.
    fn handle_prepare(&self, prepare: Prepare) {
        let mut state = self.state.lock().expect("replica lock poisoned");
        if !state.message_pool.contains_key(&prepare.digest) {
            warn!(target: "consensus", "replica {}: unknown digest in prepare, refusing commit broadcast", self.node_id);
            return;
        }
        let digest_bytes = hex::decode(&prepare.digest).expect("pooled digest is hex");
        let peer_pubkey = match self.p2p.node_pubkey(&prepare.node_id) {
            Some(pubkey) => pubkey,
            None => {
                warn!(target: "consensus", "replica {}: prepare from unknown node {}, dropping", self.node_id, prepare.node_id);
                return;
            }
        };
        if !crypto::valid_sig_sha256(&digest_bytes, &prepare.sign, &peer_pubkey) {
            warn!(target: "consensus", "replica {}: signature verification failed, refusing commit broadcast", self.node_id);
            return;
        }

        state
            .prepare_votes
            .entry(prepare.digest.clone())
            .or_default()
            .insert(prepare.node_id.clone());
        let votes = state.prepare_votes[&prepare.digest].len();
        if votes >= self.prepare_threshold() && !state.commit_broadcast.contains(&prepare.digest) {
            debug!(target: "consensus", "replica {} reached the prepare quorum for seq {}", self.node_id, prepare.sequence_id);
            let sign = crypto::sign_sha256(&digest_bytes, &self.rsa_privkey);
            let commit = Commit {
                digest: prepare.digest.clone(),
                sequence_id: prepare.sequence_id,
                node_id: self.node_id.clone(),
                sign,
            };
            let body = serde_json::to_vec(&commit).expect("commit serialization cannot fail");
            self.p2p
                .broadcast(&self.node_id, &messages::joint_message(messages::CMD_COMMIT, &body));
            state.commit_broadcast.insert(prepare.digest);
        }
    }

    // Counts a peer commit; on quorum, releases the message in sequence
    // order, parking out-of-order commits until the gap closes.
    fn handle_commit(&self, commit: Commit) {
        let mut state = self.state.lock().expect("replica lock poisoned");
        if !state.prepare_votes.contains_key(&commit.digest) {
            warn!(target: "consensus", "replica {}: no prepare seen for committed digest, dropping", self.node_id);
            return;
        }
        let digest_bytes = hex::decode(&commit.digest).expect("voted digest is hex");
        let peer_pubkey = match self.p2p.node_pubkey(&commit.node_id) {
            Some(pubkey) => pubkey,
            None => {
                warn!(target: "consensus", "replica {}: commit from unknown node {}, dropping", self.node_id, commit.node_id);
                return;
            }
        };
        if !crypto::valid_sig_sha256(&digest_bytes, &commit.sign, &peer_pubkey) {
            warn!(target: "consensus", "replica {}: signature verification failed, dropping commit", self.node_id);
            return;
        }

        state
            .commit_votes
            .entry(commit.digest.clone())
            .or_default()
            .insert(commit.node_id.clone());
        let votes = state.commit_votes[&commit.digest].len();
        if votes >= self.commit_threshold()
            && !state.replied.contains(&commit.digest)
            && state.commit_broadcast.contains(&commit.digest)
        {
            if commit.sequence_id == state.seq_low {
                self.release(&mut state, &commit.digest);
                // close the gap with any parked successors
                loop {
                    let seq = state.seq_low;
                    match state.pending_commits.remove(&seq) {
                        Some(parked) => self.release(&mut state, &parked.digest),
                        None => break,
                    }
                }
                self.committed.notify_all();
            } else if commit.sequence_id > state.seq_low {
                debug!(target: "consensus", "replica {} parking commit for seq {} while awaiting {}", self.node_id, commit.sequence_id, state.seq_low);
                state.pending_commits.insert(commit.sequence_id, commit);
            }
            // a sequence below seq_low is a late duplicate of a released entry
        }
    }

    // Appends the pooled message to the committed log and advances seq_low.
    // Callers hold the state lock.
    fn release(&self, state: &mut ReplicaState, digest: &str) {
        let message = state.message_pool[digest].message.clone();
        info!(target: "consensus", "replica {} committed msg {} at seq {}", self.node_id, message.id, state.seq_low);
        state.committed_log.push(message);
        state.replied.insert(digest.to_string());
        state.seq_low += 1;
    }

    /// Blocks until the message at sequence `seq` is committed, then returns
    /// a copy of it.
    pub fn wait_committed(&self, seq: i64) -> Message {
        let mut state = self.state.lock().expect("replica lock poisoned");
        while state.seq_low <= seq {
            state = self.committed.wait(state).expect("replica lock poisoned");
        }
        state.committed_log[seq as usize].clone()
    }

    /// Next sequence number awaiting commit application.
    pub fn seq_low(&self) -> i64 {
        self.state.lock().expect("replica lock poisoned").seq_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPeer {
        id: String,
        privkey: Vec<u8>,
        pubkey: Vec<u8>,
    }

    // Four-node cluster (f = 1, quorum 2) with N0 as the primary. Peer
    // addresses are unreachable, so broadcasts fail fast and get dropped,
    // the same path a dead peer takes.
    fn cluster(own: &str) -> (Pbft, Vec<TestPeer>) {
        let p2p = Arc::new(P2P::new());
        let mut peers = Vec::new();
        for i in 0..4 {
            let id = format!("N{}", i);
            let (privkey, pubkey) = crypto::generate_keypair();
            p2p.add_full_node(&id, "127.0.0.1:1");
            p2p.add_pubkey(&id, pubkey.clone());
            peers.push(TestPeer { id, privkey, pubkey });
        }
        p2p.set_primary("N0");
        let me = peers.iter().find(|peer| peer.id == own).unwrap();
        let pbft = Pbft::new(own, "127.0.0.1:1", me.privkey.clone(), me.pubkey.clone(), p2p);
        (pbft, peers)
    }

    fn request(payload: &str, id: i64) -> Request {
        Request {
            message: Message {
                content: payload.as_bytes().to_vec(),
                id,
            },
            timestamp: 1,
            client_addr: "127.0.0.1:8100".to_string(),
        }
    }

    fn frame_of<T: serde::Serialize>(cmd: &str, body: &T) -> Vec<u8> {
        messages::joint_message(cmd, &serde_json::to_vec(body).unwrap())
    }

    fn signed_pre_prepare(request: Request, sequence_id: i64, primary: &TestPeer) -> PrePrepare {
        let digest = messages::get_digest(&request);
        let sign = crypto::sign_sha256(&hex::decode(&digest).unwrap(), &primary.privkey);
        PrePrepare {
            request,
            digest,
            sequence_id,
            sign,
        }
    }

    fn signed_prepare(digest: &str, sequence_id: i64, peer: &TestPeer) -> Prepare {
        Prepare {
            digest: digest.to_string(),
            sequence_id,
            node_id: peer.id.clone(),
            sign: crypto::sign_sha256(&hex::decode(digest).unwrap(), &peer.privkey),
        }
    }

    fn signed_commit(digest: &str, sequence_id: i64, peer: &TestPeer) -> Commit {
        Commit {
            digest: digest.to_string(),
            sequence_id,
            node_id: peer.id.clone(),
            sign: crypto::sign_sha256(&hex::decode(digest).unwrap(), &peer.privkey),
        }
    }

    // Drives a follower through pre-prepare and its own commit broadcast for
    // one request, returning the digest.
    fn prepared(pbft: &Pbft, peers: &[TestPeer], req: Request, seq: i64) -> String {
        let pre_prepare = signed_pre_prepare(req, seq, &peers[0]);
        let digest = pre_prepare.digest.clone();
        pbft.handle_frame(&frame_of(messages::CMD_PREPREPARE, &pre_prepare));
        pbft.handle_frame(&frame_of(messages::CMD_PREPARE, &signed_prepare(&digest, seq, &peers[2])));
        digest
    }

    #[test]
    /// A client request at a non-primary replica is ignored
    fn follower_ignores_client_request() {
        let (pbft, _) = cluster("N1");
        pbft.handle_frame(&frame_of(messages::CMD_REQUEST, &request("hello", 42)));
        assert!(pbft.state.lock().unwrap().message_pool.is_empty());
    }

    #[test]
    /// The primary pools the request and assigns monotonic sequence numbers
    fn primary_assigns_sequence_numbers() {
        let (pbft, _) = cluster("N0");
        pbft.handle_frame(&frame_of(messages::CMD_REQUEST, &request("first", 9_999)));
        pbft.handle_frame(&frame_of(messages::CMD_REQUEST, &request("second", 1)));
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.next_seq, 2);
        assert_eq!(state.message_pool.len(), 2);
    }

    #[test]
    /// A pre-prepare with an altered digest never enters the pool
    fn pre_prepare_digest_mismatch_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let mut pre_prepare = signed_pre_prepare(request("hello", 42), 0, &peers[0]);
        pre_prepare.digest = messages::get_digest(&request("other", 43));
        pbft.handle_frame(&frame_of(messages::CMD_PREPREPARE, &pre_prepare));
        assert!(pbft.state.lock().unwrap().message_pool.is_empty());
    }

    #[test]
    /// A pre-prepare not signed by the primary never enters the pool
    fn pre_prepare_forged_signature_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let mut pre_prepare = signed_pre_prepare(request("hello", 42), 0, &peers[0]);
        pre_prepare.sign = vec![0; 32];
        pbft.handle_frame(&frame_of(messages::CMD_PREPREPARE, &pre_prepare));
        assert!(pbft.state.lock().unwrap().message_pool.is_empty());
    }

    #[test]
    /// A valid pre-prepare pools the request under its digest
    fn pre_prepare_pools_the_request() {
        let (pbft, peers) = cluster("N1");
        let pre_prepare = signed_pre_prepare(request("hello", 42), 0, &peers[0]);
        let digest = pre_prepare.digest.clone();
        pbft.handle_frame(&frame_of(messages::CMD_PREPREPARE, &pre_prepare));
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.message_pool[&digest].message.id, 42);
    }

    #[test]
    /// A prepare ahead of its pre-prepare is dropped, not buffered
    fn early_prepare_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let digest = messages::get_digest(&request("hello", 42));
        pbft.handle_frame(&frame_of(messages::CMD_PREPARE, &signed_prepare(&digest, 0, &peers[2])));
        assert!(pbft.state.lock().unwrap().prepare_votes.is_empty());
    }

    #[test]
    /// A forged prepare signature counts no vote and triggers no commit
    fn forged_prepare_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let pre_prepare = signed_pre_prepare(request("hello", 42), 0, &peers[0]);
        let digest = pre_prepare.digest.clone();
        pbft.handle_frame(&frame_of(messages::CMD_PREPREPARE, &pre_prepare));
        let mut prepare = signed_prepare(&digest, 0, &peers[2]);
        prepare.sign = vec![0; 32];
        pbft.handle_frame(&frame_of(messages::CMD_PREPARE, &prepare));
        let state = pbft.state.lock().unwrap();
        assert!(state.prepare_votes.get(&digest).is_none());
        assert!(!state.commit_broadcast.contains(&digest));
    }

    #[test]
    /// A follower commits after one peer prepare, the primary only after two
    fn prepare_threshold_off_by_one() {
        let (follower, peers) = cluster("N1");
        let digest = prepared(&follower, &peers, request("hello", 42), 0);
        assert!(follower.state.lock().unwrap().commit_broadcast.contains(&digest));

        let (primary, peers) = cluster("N0");
        let req = request("hello", 42);
        let digest = messages::get_digest(&req);
        primary.handle_frame(&frame_of(messages::CMD_REQUEST, &req));
        primary.handle_frame(&frame_of(messages::CMD_PREPARE, &signed_prepare(&digest, 0, &peers[1])));
        assert!(!primary.state.lock().unwrap().commit_broadcast.contains(&digest));
        primary.handle_frame(&frame_of(messages::CMD_PREPARE, &signed_prepare(&digest, 0, &peers[2])));
        assert!(primary.state.lock().unwrap().commit_broadcast.contains(&digest));
    }

    #[test]
    /// Replayed prepares are idempotent on the vote set
    fn duplicate_prepare_counts_once() {
        let (pbft, peers) = cluster("N0");
        let req = request("hello", 42);
        let digest = messages::get_digest(&req);
        pbft.handle_frame(&frame_of(messages::CMD_REQUEST, &req));
        let prepare = signed_prepare(&digest, 0, &peers[1]);
        pbft.handle_frame(&frame_of(messages::CMD_PREPARE, &prepare));
        pbft.handle_frame(&frame_of(messages::CMD_PREPARE, &prepare));
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.prepare_votes[&digest].len(), 1);
        assert!(!state.commit_broadcast.contains(&digest));
    }

    #[test]
    /// An in-order commit quorum releases the message and advances seq_low
    fn commit_quorum_releases_in_order() {
        let (pbft, peers) = cluster("N1");
        let digest = prepared(&pbft, &peers, request("hello", 42), 0);
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[2])));
        assert_eq!(pbft.seq_low(), 0);
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[3])));
        assert_eq!(pbft.seq_low(), 1);
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.committed_log.len(), 1);
        assert_eq!(state.committed_log[0].id, 42);
        assert!(state.replied.contains(&digest));
    }

    #[test]
    /// Duplicate commits neither inflate the vote set nor release twice
    fn duplicate_commit_counts_once() {
        let (pbft, peers) = cluster("N1");
        let digest = prepared(&pbft, &peers, request("hello", 42), 0);
        let commit = signed_commit(&digest, 0, &peers[2]);
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &commit));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &commit));
        assert_eq!(pbft.state.lock().unwrap().commit_votes[&digest].len(), 1);
        assert_eq!(pbft.seq_low(), 0);
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[3])));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[2])));
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.committed_log.len(), 1);
        assert_eq!(state.seq_low, 1);
    }

    #[test]
    /// A forged commit signature counts no vote
    fn forged_commit_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let digest = prepared(&pbft, &peers, request("hello", 42), 0);
        let mut commit = signed_commit(&digest, 0, &peers[2]);
        commit.sign = vec![0; 32];
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &commit));
        assert!(pbft.state.lock().unwrap().commit_votes.get(&digest).is_none());
    }

    #[test]
    /// A commit for a digest with no prepare history is dropped
    fn commit_without_prepare_is_dropped() {
        let (pbft, peers) = cluster("N1");
        let digest = messages::get_digest(&request("hello", 42));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[2])));
        assert!(pbft.state.lock().unwrap().commit_votes.is_empty());
    }

    #[test]
    /// A quorum ahead of seq_low is parked and drained once the gap closes
    fn out_of_order_commit_waits_for_the_gap() {
        let (pbft, peers) = cluster("N1");
        let digest_0 = prepared(&pbft, &peers, request("block-0", 0), 0);
        let digest_1 = prepared(&pbft, &peers, request("block-1", 1), 1);

        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest_1, 1, &peers[2])));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest_1, 1, &peers[3])));
        {
            let state = pbft.state.lock().unwrap();
            assert_eq!(state.seq_low, 0);
            assert!(state.committed_log.is_empty());
            assert!(state.pending_commits.contains_key(&1));
        }

        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest_0, 0, &peers[2])));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest_0, 0, &peers[3])));
        let state = pbft.state.lock().unwrap();
        assert_eq!(state.seq_low, 2);
        assert_eq!(state.pending_commits.len(), 0);
        let ids: Vec<i64> = state.committed_log.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(state.replied.contains(&digest_0) && state.replied.contains(&digest_1));
    }

    #[test]
    /// wait_committed returns the released message without blocking
    fn wait_committed_returns_released_message() {
        let (pbft, peers) = cluster("N1");
        let digest = prepared(&pbft, &peers, request("hello", 42), 0);
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[2])));
        pbft.handle_frame(&frame_of(messages::CMD_COMMIT, &signed_commit(&digest, 0, &peers[3])));
        let message = pbft.wait_committed(0);
        assert_eq!(message.id, 42);
        assert_eq!(message.content, b"hello".to_vec());
    }
}
