/***************************************************************************************************
Configuration abstractions: ini import, logging setup and the cluster topology file
***************************************************************************************************/

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::node::NodeRole;
use chain_utils::filehelper::FileHelper;
use chain_utils::ini::env2var;

/// One line of the cluster topology file.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub role: NodeRole,
    pub id: String,
    pub addr: String,
}

pub fn initialize_ini() {
    let ini = chain_utils::ini::get_ini("chain.ini");
    chain_utils::ini::ini2env("node", "batch_size", &ini, None);
    chain_utils::ini::ini2env("node", "cluster", &ini, None);
    chain_utils::ini::ini2env("log", "debug", &ini, None);
}

pub fn initialize_logging() {
    let stdout = ConsoleAppender::builder().build();

    let log_node = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
        .append(false)
        .build("log/node.log")
        .unwrap();

    let log_consensus = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
        .append(false)
        .build("log/consensus.log")
        .unwrap();

    let mut config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)));

    if env2var::<bool>("log.debug") {
        config = config
            .appender(Appender::builder().build("log_node", Box::new(log_node)))
            .appender(Appender::builder().build("log_consensus", Box::new(log_consensus)))
            .logger(
                Logger::builder()
                    .appender("log_node")
                    .additive(false)
                    .build("node", LevelFilter::Debug),
            )
            .logger(
                Logger::builder()
                    .appender("log_consensus")
                    .additive(false)
                    .build("consensus", LevelFilter::Debug),
            )
    }

    let config = config
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .unwrap();

    log4rs::init_config(config).unwrap();
}

/// Parses the line-oriented cluster file: `role,id,address` per line.
/// Unreadable files and malformed lines are fatal.
pub fn load_cluster(path: &str) -> Vec<PeerEntry> {
    let content = FileHelper::read_file_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read cluster file {}: {}", path, e));
    parse_cluster(&content)
}

fn parse_cluster(content: &str) -> Vec<PeerEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 {
            panic!("malformed cluster line '{}', expected role,id,address", line);
        }
        let role = match fields[0] {
            "fullnode" => NodeRole::Fullnode,
            "client" => NodeRole::Client,
            other => panic!(
                "unknown role '{}' in cluster file, allowed are 'fullnode' and 'client'",
                other
            ),
        };
        entries.push(PeerEntry {
            role,
            id: fields[1].to_string(),
            addr: fields[2].to_string(),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Roles, ids and addresses come out line by line, blanks skipped
    fn parses_roles_and_addresses() {
        let entries = parse_cluster("fullnode,N0,127.0.0.1:8000\n\nclient,C1,127.0.0.1:8100\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, NodeRole::Fullnode);
        assert_eq!(entries[0].id, "N0");
        assert_eq!(entries[1].role, NodeRole::Client);
        assert_eq!(entries[1].addr, "127.0.0.1:8100");
    }

    #[test]
    #[should_panic]
    /// An unknown role is fatal
    fn rejects_unknown_role() {
        parse_cluster("gateway,G0,127.0.0.1:8000\n");
    }

    #[test]
    #[should_panic]
    /// A line without three fields is fatal
    fn rejects_malformed_line() {
        parse_cluster("fullnode,N0\n");
    }
}
