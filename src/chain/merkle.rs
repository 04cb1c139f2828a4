/***************************************************************************************************
Merkle hash tree over transaction hashes, kept as a flat arena with parent indices
***************************************************************************************************/

use chain_utils::crypto::sha256;

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof: the sibling hash and the side it sits on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofPair {
    pub side: Side,
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
}

/// Binary hash tree. Leaves hold `sha256(data_i)`, internal nodes
/// `sha256(left + right)`. An unpaired trailing node of a level is carried
/// forward unchanged to the next level.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    leaves: Vec<usize>,
    data_list: Vec<Vec<u8>>,
    root: usize,
}

// Recomputes a node's hash from its children.
fn hash_children(nodes: &[Node], left: Option<usize>, right: Option<usize>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(l) = left {
        buf.extend_from_slice(&nodes[l].data);
    }
    if let Some(r) = right {
        buf.extend_from_slice(&nodes[r].data);
    }
    sha256(&buf)
}

impl MerkleTree {
    /// Builds a tree over `data`. At least one leaf is required.
    pub fn new(data: &[Vec<u8>]) -> Self {
        assert!(!data.is_empty(), "cannot build a Merkle tree without leaves");
        let mut nodes = Vec::with_capacity(2 * data.len());
        let mut leaves = Vec::with_capacity(data.len());
        for item in data {
            nodes.push(Node {
                data: sha256(item),
                left: None,
                right: None,
                parent: None,
            });
            leaves.push(nodes.len() - 1);
        }
        let root = Self::build_levels(&mut nodes, &leaves);
        MerkleTree {
            nodes,
            leaves,
            data_list: data.to_vec(),
            root,
        }
    }

    // Pairs nodes left-to-right level by level until one root remains.
    fn build_levels(nodes: &mut Vec<Node>, base: &[usize]) -> usize {
        let mut level: Vec<usize> = base.to_vec();
        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                if let [left, right] = *pair {
                    let data = hash_children(nodes, Some(left), Some(right));
                    nodes.push(Node {
                        data,
                        left: Some(left),
                        right: Some(right),
                        parent: None,
                    });
                    let parent = nodes.len() - 1;
                    nodes[left].parent = Some(parent);
                    nodes[right].parent = Some(parent);
                    next.push(parent);
                } else {
                    // odd leftover, promoted unchanged
                    next.push(pair[0]);
                }
            }
            level = next;
        }
        level[0]
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Hash at the apex of the tree.
    pub fn root_hash(&self) -> &[u8] {
        &self.nodes[self.root].data
    }

    /// Replaces the data under leaf `i` and rehashes the path to the root.
    /// Returns the new root hash. Panics on an out-of-range index.
    pub fn update(&mut self, i: usize, data: Vec<u8>) -> Vec<u8> {
        let leaf = self.leaves[i];
        self.nodes[leaf].data = sha256(&data);
        self.data_list[i] = data;
        let mut cursor = self.nodes[leaf].parent;
        while let Some(node) = cursor {
            self.nodes[node].data =
                hash_children(&self.nodes, self.nodes[node].left, self.nodes[node].right);
            cursor = self.nodes[node].parent;
        }
        self.root_hash().to_vec()
    }

    /// Appends a leaf and rebuilds the tree. Returns the new root hash.
    pub fn append(&mut self, data: Vec<u8>) -> Vec<u8> {
        let mut data_list = std::mem::take(&mut self.data_list);
        data_list.push(data);
        *self = MerkleTree::new(&data_list);
        self.root_hash().to_vec()
    }

    /// Inclusion proof for leaf `i`, ordered bottom-up. Each pair names the
    /// sibling hash and whether it sits left or right of the running hash.
    /// Panics on an out-of-range index.
    pub fn proof(&self, i: usize) -> Vec<ProofPair> {
        let mut proof = Vec::new();
        let mut node = self.leaves[i];
        while let Some(parent) = self.nodes[node].parent {
            let pair = if self.nodes[parent].left == Some(node) {
                let sibling = self.nodes[parent]
                    .right
                    .expect("paired node must have a right child");
                ProofPair {
                    side: Side::Right,
                    hash: self.nodes[sibling].data.clone(),
                }
            } else {
                let sibling = self.nodes[parent]
                    .left
                    .expect("paired node must have a left child");
                ProofPair {
                    side: Side::Left,
                    hash: self.nodes[sibling].data.clone(),
                }
            };
            proof.push(pair);
            node = parent;
        }
        proof
    }
}

/// Replays `proof` upward from `data` and compares the result against `root`.
pub fn verify_proof(data: &[u8], proof: &[ProofPair], root: &[u8]) -> bool {
    let mut acc = sha256(data);
    for pair in proof {
        let mut buf = Vec::with_capacity(acc.len() + pair.hash.len());
        match pair.side {
            Side::Left => {
                buf.extend_from_slice(&pair.hash);
                buf.extend_from_slice(&acc);
            }
            Side::Right => {
                buf.extend_from_slice(&acc);
                buf.extend_from_slice(&pair.hash);
            }
        }
        acc = sha256(&buf);
    }
    acc == root
}
