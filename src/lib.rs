#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod broker;
pub mod config;
pub mod gateway;
pub mod simulator;
pub mod store;
pub mod sync;

pub use broker::{Broker, BrokerError, Envelope, ReplyStream};
pub use config::Config;

/// Token management subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenCommands {
    /// Issue a fresh agent token for a project (created on first use)
    Issue {
        /// Project the token belongs to
        #[arg(long)]
        project: String,
    },
    /// List issued tokens and their persisted presence
    List,
}
