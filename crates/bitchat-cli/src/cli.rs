//! Command-line argument parsing.

use clap::Parser;

#[derive(Parser)]
#[command(author, version, about = "BitChat reference terminal client", long_about = None)]
pub struct Cli {
    /// Display name announced to the mesh
    #[arg(short, long)]
    pub nickname: Option<String>,

    /// Address to listen on for incoming links, e.g. 0.0.0.0:7878
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Address of a peer to connect to; repeatable
    #[arg(short, long = "peer")]
    pub peers: Vec<String>,

    /// Configuration/data directory (identity, saved channel passwords)
    #[arg(short, long)]
    pub data_dir: Option<String>,
}
