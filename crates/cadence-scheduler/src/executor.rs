use async_trait::async_trait;
use cadence_core::Node;

/// Runs a job's script on behalf of the scheduler.
///
/// Called on the scheduler's own task, one script at a time; the scheduler
/// imposes no timeout. `Err` carries a human-readable failure detail, which
/// is reported but never stops the job from being rearmed.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(&self, job: &str, script: &Node) -> Result<(), String>;
}
