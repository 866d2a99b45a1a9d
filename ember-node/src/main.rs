use clap::Parser;

use ember_node::{run_node, NodeConfig};

#[tokio::main]
async fn main() {
    let config = NodeConfig::parse();
    if let Err(e) = run_node(config).await {
        eprintln!("node failed: {e:?}");
        std::process::exit(1);
    }
}
