extern crate chrono;
extern crate hex;
extern crate log;
extern crate log4rs;
extern crate rand;
extern crate serde;
extern crate serde_json;

extern crate chain_utils;

pub mod chain;
pub mod config;
pub mod network;
pub mod node;
pub mod pbft;
