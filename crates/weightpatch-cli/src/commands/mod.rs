//! CLI command implementations

pub mod config;
pub mod keys;
pub mod rank;
pub mod resolve;

pub use config::ConfigAction;
pub use keys::KeysCommand;
pub use rank::RankCommand;
pub use resolve::ResolveCommand;

use clap::ValueEnum;

/// How a command prints its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
