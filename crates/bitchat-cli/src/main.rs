//! BitChat CLI entry point

use clap::Parser;
use tracing::info;

use bitchat_cli::{app, cli::Cli, config::default_config_path, config::CliConfig, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging();

    let config_path = default_config_path()?;
    let mut config = CliConfig::load(&config_path)?;

    if let Some(nickname) = cli.nickname {
        config.nickname = nickname;
    }
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if !cli.peers.is_empty() {
        config.peer_addrs = cli.peers;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = Some(data_dir);
    }

    config.save(&config_path)?;

    info!("starting bitchat node as '{}'", config.nickname);
    app::run(config).await
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
