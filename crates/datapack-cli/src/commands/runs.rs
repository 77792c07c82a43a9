use datapack_core::{CollectionRun, RunStore};
use serde::Serialize;

use crate::cli::RunsArgs;
use crate::error::CliError;

use super::{CommandOutput, Runtime};

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    #[serde(flatten)]
    run: &'a CollectionRun,
    recorded_errors: usize,
}

#[derive(Debug, Serialize)]
struct RunsResponseData<'a> {
    runs: Vec<RunSummary<'a>>,
}

pub fn run(args: &RunsArgs, runtime: &Runtime) -> Result<CommandOutput, CliError> {
    let stored = runtime.store.recent_runs(args.limit)?;
    let runs = stored
        .iter()
        .map(|stored| RunSummary {
            run: &stored.run,
            recorded_errors: stored.errors.len(),
        })
        .collect();
    Ok(CommandOutput::ok(serde_json::to_value(RunsResponseData { runs })?))
}
