//! Handlers registered by the host at boot.

use std::sync::Arc;

use async_trait::async_trait;
use gutpunch_scheduler::{JobHandler, Parameters, SchedulerEngine};
use tracing::info;

/// Logs its parameters and succeeds.
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn handle(&self, parameters: Parameters) -> anyhow::Result<()> {
        info!(parameters = %serde_json::Value::Object(parameters), "log job");
        Ok(())
    }
}

/// Always fails. Uses `parameters.reason` as the error message when present.
pub struct FailHandler;

#[async_trait]
impl JobHandler for FailHandler {
    async fn handle(&self, parameters: Parameters) -> anyhow::Result<()> {
        let reason = parameters
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("fail handler invoked");
        anyhow::bail!("{reason}")
    }
}

pub fn register_builtin(engine: &SchedulerEngine) {
    engine.register_handler("log", Arc::new(LogHandler));
    engine.register_handler("fail", Arc::new(FailHandler));
}
