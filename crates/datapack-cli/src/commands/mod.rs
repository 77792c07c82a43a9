mod blocks;
mod collect;
mod runs;

use std::sync::Arc;

use datapack_core::{CollectionStatus, CollectorConfig, DuckDbStore};
use datapack_warehouse::{Warehouse, WarehouseConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub struct CommandOutput {
    pub data: Value,
    pub exit_code: u8,
}

impl CommandOutput {
    pub fn ok(data: Value) -> Self {
        Self { data, exit_code: 0 }
    }

    pub fn for_status(data: Value, status: CollectionStatus) -> Self {
        Self {
            data,
            exit_code: status_exit_code(status),
        }
    }
}

/// 0 complete, 3 partial, 4 failed.
pub const fn status_exit_code(status: CollectionStatus) -> u8 {
    match status {
        CollectionStatus::Complete => 0,
        CollectionStatus::Partial => 3,
        CollectionStatus::Failed | CollectionStatus::Pending | CollectionStatus::Running => 4,
    }
}

/// Settings plus the DuckDB-backed stores shared by every command.
pub struct Runtime {
    pub config: CollectorConfig,
    pub store: Arc<DuckDbStore>,
}

impl Runtime {
    fn open(cli: &Cli) -> Result<Self, CliError> {
        let config = CollectorConfig::load(cli.settings.as_deref())?;
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: config.db_path(),
            ..WarehouseConfig::default()
        })?;
        Ok(Self {
            config,
            store: Arc::new(DuckDbStore::new(warehouse)),
        })
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutput, CliError> {
    let runtime = Runtime::open(cli)?;
    match &cli.command {
        Command::Collect(args) => collect::run(args, &runtime).await,
        Command::Runs(args) => runs::run(args, &runtime),
        Command::Blocks(args) => blocks::run(args, &runtime),
    }
}
