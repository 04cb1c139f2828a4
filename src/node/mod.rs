/***************************************************************************************************
Node roles: full nodes carry consensus and the chain, clients replay input files
***************************************************************************************************/

pub mod client;
pub mod fullnode;

/// Roles a cluster-file line can declare.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeRole {
    Fullnode,
    Client,
}
