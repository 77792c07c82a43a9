use std::sync::Arc;

use datapack_core::{
    CollectRequest, CollectionOrchestrator, CollectorServices, DirectoryStorageFactory,
    HttpClient, JsonIndustryConfigProvider, ProcessMemoryGauge, ReqwestHttpClient,
};

use crate::cli::CollectArgs;
use crate::error::CliError;

use super::{CommandOutput, Runtime};

pub async fn run(args: &CollectArgs, runtime: &Runtime) -> Result<CommandOutput, CliError> {
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
    let alerts = Arc::new(runtime.config.alert_dispatcher(Arc::clone(&http))?);

    let services = CollectorServices {
        industries: Arc::new(JsonIndustryConfigProvider::at(&args.config)),
        http,
        block_states: runtime.store.clone(),
        blocked_sources: runtime.store.clone(),
        runs: runtime.store.clone(),
        storage: Arc::new(DirectoryStorageFactory::new(runtime.config.intermediate_dir())),
        memory: Arc::new(ProcessMemoryGauge),
        alerts,
    };
    let orchestrator = CollectionOrchestrator::new(&runtime.config, services);

    let request = CollectRequest {
        industry_id: args.industry_id.clone(),
        actor_id: args.actor.clone(),
        batch_size: args.batch_size,
        memory_management: args.memory_management.then_some(true),
        focal_tickers: args.focal.clone(),
    };
    let result = orchestrator.collect(request).await?;
    let status = result.status;

    Ok(CommandOutput::for_status(serde_json::to_value(&result)?, status))
}
