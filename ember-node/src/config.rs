use std::path::PathBuf;

use clap::Parser;

/// Node configuration: CLI flags, each with a matching environment
/// variable fallback.
#[derive(Debug, Clone, Parser)]
#[command(name = "ember-node", version, about = "emberchain proof-of-work node")]
pub struct NodeConfig {
    /// HTTP API listen port
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Gossip listen port
    #[arg(long = "port", env = "P2P_PORT", default_value_t = 6000)]
    pub p2p_port: u16,

    /// Block archive directory
    #[arg(long, env = "DB_PATH", default_value = "./data")]
    pub db_path: PathBuf,

    /// Bootstrap peers, comma separated host:port pairs
    #[arg(long = "peers", env = "BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Mine continuously in the background
    #[arg(long, env = "ENABLE_MINING")]
    pub mining: bool,

    /// Address credited with block rewards when mining
    #[arg(long, env = "MINER_ADDRESS")]
    pub miner_address: Option<String>,

    /// Required count of leading zero hex characters in block hashes
    #[arg(long, env = "DIFFICULTY", default_value_t = 4)]
    pub difficulty: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = NodeConfig::try_parse_from(["ember-node"]).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.p2p_port, 6000);
        assert_eq!(config.db_path, PathBuf::from("./data"));
        assert!(config.peers.is_empty());
        assert!(!config.mining);
        assert_eq!(config.difficulty, 4);
    }

    #[test]
    fn peers_flag_splits_on_commas() {
        let config = NodeConfig::try_parse_from([
            "ember-node",
            "--peers",
            "10.0.0.1:6000,10.0.0.2:6000",
        ])
        .unwrap();
        assert_eq!(
            config.peers,
            vec!["10.0.0.1:6000".to_string(), "10.0.0.2:6000".to_string()]
        );
    }
}
