use std::net::SocketAddr;

use clap::Parser;

use crate::relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Maximum number of simultaneously connected peers.
    #[arg(long, default_value_t = 1024)]
    pub max_connections: usize,

    /// Maximum bytes one peer may buffer without sending a newline.
    #[arg(long, default_value_t = 65536)]
    pub max_buffered_bytes: usize,
}

impl Cli {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_connections: self.max_connections,
            max_buffered_bytes: self.max_buffered_bytes,
        }
    }
}
