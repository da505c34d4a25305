//! Binary entrypoint argument parsing (spec §1 ambient stack): `--config`,
//! `--base-dir`, `--port`, with `serve` as the (and only, for now) subcommand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "methings", version, about = "On-device agent control plane")]
pub struct Cli {
    /// Path to the TOML config file. Defaults to `$METHINGS_CONFIG` or
    /// `~/.methings/config.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the config's `base_dir` (database + sandboxed workspace root).
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Overrides the config's `bind_port`.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the local HTTP gateway (default if no subcommand is given).
    Serve,
}
