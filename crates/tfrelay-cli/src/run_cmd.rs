//! One-shot workflow commands (`tfrelay init`, `tfrelay plan`, ...).
//!
//! These run the same workflows as the HTTP routes, directly from the
//! terminal, and print the same success message or failure detail.

use anyhow::{Result, bail};

use tfrelay_core::exec::CommandRunner;
use tfrelay_core::workflow::{self, Terraform, Workflow};

use crate::config::RelayConfig;

/// Run `workflow` with the configured terraform and process runner.
pub async fn run_workflow_command(config: &RelayConfig, workflow: Workflow) -> Result<()> {
    let message = run_with(&config.terraform(), &config.runner(), &workflow).await?;
    println!("{message}");
    Ok(())
}

async fn run_with(
    tf: &Terraform,
    runner: &dyn CommandRunner,
    workflow: &Workflow,
) -> Result<&'static str> {
    match workflow::execute(tf, runner, workflow).await {
        Ok(()) => Ok(workflow.success_message()),
        Err(e) => bail!("{}", workflow.failure_detail(&e)),
    }
}
