//! BitChat CLI library
//!
//! A thin terminal binding over `bitchat-runtime`: a TCP [`Link`] for local
//! testing, persisted configuration, and a REPL implementing the reference
//! command surface (`/j`, `/m`, `/w`, `/rooms`, `/pass`, `/transfer`, `/clear`).

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod tcp_link;

pub use cli::Cli;
pub use config::{default_config_path, CliConfig};
pub use error::{CliError, Result};
