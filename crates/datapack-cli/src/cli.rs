//! CLI argument definitions for `datapack`.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `collect` | Run a collection for one industry and write its datapack |
//! | `runs` | List recent collection runs |
//! | `blocks` | Inspect and manage per-domain block records |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--settings` | none | Collector settings JSON file |
//! | `--log-format` | `text` | Log formatter (text, json) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! datapack collect oil-majors --config industries/oil-majors.json --focal SHEL
//! datapack runs --limit 5 --pretty
//! RUST_LOG=datapack_core=debug datapack blocks list
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Collect provenance-tracked financial datapacks for an industry.
#[derive(Debug, Parser)]
#[command(
    name = "datapack",
    author,
    version,
    about = "Financial datapack collector",
    long_about = "Collects valuation, financial, operational and macro datapoints from public \
sources, records where every value came from, validates completeness with the gate and writes \
one datapack per run.\n\
\n\
Use 'datapack <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Collector settings file (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Log formatter. `RUST_LOG` controls the filter.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Collect one industry and print the collection result.
    ///
    /// Exit codes: 0 complete, 3 partial, 4 failed.
    Collect(CollectArgs),
    /// List recent collection runs, newest first.
    Runs(RunsArgs),
    /// Manage per-domain block records.
    Blocks(BlocksArgs),
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Industry identifier.
    pub industry_id: String,

    /// Industry configuration: a JSON file, or a directory of `<id>.json` files.
    #[arg(long)]
    pub config: PathBuf,

    /// Additional focal ticker (repeatable).
    #[arg(long = "focal")]
    pub focal: Vec<String>,

    /// Companies per batch; overrides the settings file.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Reclaim memory between batches.
    #[arg(long, default_value_t = false)]
    pub memory_management: bool,

    /// Who triggered the run, for the run log.
    #[arg(long)]
    pub actor: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunsArgs {
    /// Maximum runs to list.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct BlocksArgs {
    #[command(subcommand)]
    pub command: BlocksCommand,
}

#[derive(Debug, Subcommand)]
pub enum BlocksCommand {
    /// Show throttle block records and blocked sources.
    List,
    /// Delete records whose block window has ended.
    Prune,
    /// Forget every block record for one domain.
    Clear {
        /// Domain (host name), e.g. `www.reuters.com`.
        domain: String,
    },
}
