use datapack_core::{BlockStateStore, BlockedSourceRegistry, DomainBlockState, UtcDateTime};
use serde::Serialize;
use tracing::info;

use crate::cli::{BlocksArgs, BlocksCommand};
use crate::error::CliError;

use super::{CommandOutput, Runtime};

#[derive(Debug, Serialize)]
struct BlockedSourceView {
    domain: String,
    blocked_until: UtcDateTime,
    active: bool,
}

#[derive(Debug, Serialize)]
struct BlocksListData {
    throttle: Vec<DomainBlockState>,
    blocked_sources: Vec<BlockedSourceView>,
}

#[derive(Debug, Serialize)]
struct BlocksChangeData {
    throttle_rows: usize,
    blocked_sources: usize,
}

pub fn run(args: &BlocksArgs, runtime: &Runtime) -> Result<CommandOutput, CliError> {
    let store = runtime.store.as_ref();
    let now = UtcDateTime::now();

    let data = match &args.command {
        BlocksCommand::List => {
            let blocked_sources = BlockedSourceRegistry::list(store)?
                .into_iter()
                .map(|(domain, blocked_until)| BlockedSourceView {
                    domain,
                    blocked_until,
                    active: blocked_until > now,
                })
                .collect();
            serde_json::to_value(BlocksListData {
                throttle: BlockStateStore::list(store)?,
                blocked_sources,
            })?
        }
        BlocksCommand::Prune => {
            let change = BlocksChangeData {
                throttle_rows: store.delete_expired(now)?,
                blocked_sources: store.prune(now)?,
            };
            info!(
                throttle_rows = change.throttle_rows,
                blocked_sources = change.blocked_sources,
                "pruned expired blocks"
            );
            serde_json::to_value(change)?
        }
        BlocksCommand::Clear { domain } => {
            let domain = domain.trim().to_ascii_lowercase();
            let change = BlocksChangeData {
                throttle_rows: usize::from(store.delete(&domain)?),
                blocked_sources: usize::from(store.unblock(&domain)?),
            };
            info!(domain = %domain, "cleared block records");
            serde_json::to_value(change)?
        }
    };

    Ok(CommandOutput::ok(data))
}
