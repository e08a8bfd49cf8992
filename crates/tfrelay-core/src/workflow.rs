//! The four terraform workflows and their execution.
//!
//! Each workflow is an ordered list of [`Step`]s built from a [`Terraform`]
//! context. [`execute`] runs the list through a [`CommandRunner`] and stops
//! at the first failure. `plan` rewrites the variables file before its step
//! runs; no other workflow touches it.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::exec::{self, CommandRunner, Step, StepError};
use crate::layout::Layout;
use crate::tfvars::{self, TfvarsError};

/// Variables applied to `terraform.tfvars` before a plan.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlanVars {
    pub instance_type: String,
    pub num_replicas: i64,
}

/// How to invoke terraform: binary, directory layout and extra environment.
#[derive(Debug, Clone)]
pub struct Terraform {
    binary: String,
    layout: Layout,
    env: Vec<(String, String)>,
}

impl Terraform {
    /// Default executable name, resolved through `PATH`.
    pub const DEFAULT_BINARY: &str = "terraform";

    pub fn new(binary: impl Into<String>, layout: Layout) -> Self {
        Self {
            binary: binary.into(),
            layout,
            env: Vec::new(),
        }
    }

    /// Set an environment variable on every terraform child process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn step(&self, dir: impl Into<PathBuf>, args: &[&str]) -> Step {
        self.env.iter().fold(
            Step::new(&self.binary, dir).args(args.iter().copied()),
            |step, (k, v)| step.env(k, v),
        )
    }

    fn init(&self, dir: impl Into<PathBuf>) -> Step {
        self.step(dir, &["init"])
    }

    fn plan(&self, dir: impl Into<PathBuf>) -> Step {
        self.step(dir, &["plan"])
    }

    fn apply(&self, dir: impl Into<PathBuf>) -> Step {
        self.step(dir, &["apply", "-auto-approve"])
    }
}

/// One of the operations the relay can perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workflow {
    /// `init`, `plan`, `apply -auto-approve` in the backend directory.
    SetupS3Backend,
    /// `init` in the configuration root.
    Init,
    /// Rewrite the variables file, then `plan` in the configuration root.
    Plan(PlanVars),
    /// `apply -auto-approve` in the configuration root.
    Apply,
}

impl Workflow {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupS3Backend => "setup-s3-backend",
            Self::Init => "init",
            Self::Plan(_) => "plan",
            Self::Apply => "apply",
        }
    }

    /// Message returned when every step succeeded.
    pub fn success_message(&self) -> &'static str {
        match self {
            Self::SetupS3Backend => "S3 backend setup successfully.",
            Self::Init => "Terraform initialized successfully.",
            Self::Plan(_) => "Terraform plan executed successfully.",
            Self::Apply => "Terraform apply executed successfully.",
        }
    }

    /// Prefix put in front of the failure detail.
    pub fn failure_prefix(&self) -> &'static str {
        match self {
            Self::SetupS3Backend => "Terraform command failed",
            Self::Init => "Terraform init failed",
            Self::Plan(_) => "Terraform plan failed",
            Self::Apply => "Terraform apply failed",
        }
    }

    /// The user-facing failure text for `err`.
    pub fn failure_detail(&self, err: &WorkflowError) -> String {
        format!("{}: {err}", self.failure_prefix())
    }

    /// The child processes this workflow runs, in order.
    pub fn steps(&self, tf: &Terraform) -> Vec<Step> {
        let layout = tf.layout();
        match self {
            Self::SetupS3Backend => {
                let dir = layout.backend_dir();
                vec![tf.init(&dir), tf.plan(&dir), tf.apply(&dir)]
            }
            Self::Init => vec![tf.init(layout.root())],
            Self::Plan(_) => vec![tf.plan(layout.root())],
            Self::Apply => vec![tf.apply(layout.root())],
        }
    }
}

/// Why a workflow stopped.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Vars(#[from] TfvarsError),

    #[error(transparent)]
    Step(#[from] StepError),
}

/// Run `workflow` to completion or to its first failure.
///
/// Nothing is rolled back on failure: a variables file rewritten for a plan
/// that then fails stays rewritten, and resources created by earlier steps
/// stay created.
pub async fn execute(
    tf: &Terraform,
    runner: &dyn CommandRunner,
    workflow: &Workflow,
) -> Result<(), WorkflowError> {
    let run_id = Uuid::new_v4();
    let steps = workflow.steps(tf);
    tracing::info!(
        run_id = %run_id,
        workflow = workflow.name(),
        steps = steps.len(),
        "workflow started"
    );

    let result = run(tf, runner, workflow, &steps).await;
    match &result {
        Ok(()) => {
            tracing::info!(run_id = %run_id, workflow = workflow.name(), "workflow succeeded")
        }
        Err(e) => tracing::warn!(
            run_id = %run_id,
            workflow = workflow.name(),
            error = %e,
            "workflow failed"
        ),
    }
    result
}

async fn run(
    tf: &Terraform,
    runner: &dyn CommandRunner,
    workflow: &Workflow,
    steps: &[Step],
) -> Result<(), WorkflowError> {
    if let Workflow::Plan(vars) = workflow {
        tfvars::update_tfvars(
            &tf.layout().tfvars_path(),
            &vars.instance_type,
            vars.num_replicas,
        )
        .await?;
    }
    exec::run_steps(runner, steps).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf() -> Terraform {
        Terraform::new("terraform", Layout::new("/srv/tf"))
    }

    fn rendered(steps: &[Step]) -> Vec<(String, PathBuf)> {
        steps
            .iter()
            .map(|s| (s.to_string(), s.working_dir.clone()))
            .collect()
    }

    #[test]
    fn setup_backend_runs_three_steps_in_backend_dir() {
        let steps = Workflow::SetupS3Backend.steps(&tf());
        let backend = PathBuf::from("/srv/tf/backend");
        assert_eq!(
            rendered(&steps),
            vec![
                ("terraform init".to_string(), backend.clone()),
                ("terraform plan".to_string(), backend.clone()),
                ("terraform apply -auto-approve".to_string(), backend),
            ]
        );
    }

    #[test]
    fn single_step_workflows_run_in_root() {
        let root = PathBuf::from("/srv/tf");
        let vars = PlanVars {
            instance_type: "t2.micro".into(),
            num_replicas: 1,
        };
        assert_eq!(
            rendered(&Workflow::Init.steps(&tf())),
            vec![("terraform init".to_string(), root.clone())]
        );
        assert_eq!(
            rendered(&Workflow::Plan(vars).steps(&tf())),
            vec![("terraform plan".to_string(), root.clone())]
        );
        assert_eq!(
            rendered(&Workflow::Apply.steps(&tf())),
            vec![("terraform apply -auto-approve".to_string(), root)]
        );
    }

    #[test]
    fn env_is_attached_to_every_step() {
        let tf = tf()
            .with_env("AWS_PROFILE", "ops")
            .with_env("AWS_REGION", "us-east-1");
        for step in Workflow::SetupS3Backend.steps(&tf) {
            assert_eq!(
                step.env,
                vec![
                    ("AWS_PROFILE".to_string(), "ops".to_string()),
                    ("AWS_REGION".to_string(), "us-east-1".to_string()),
                ]
            );
        }
    }

    #[test]
    fn custom_binary_is_used() {
        let tf = Terraform::new("/opt/bin/tofu", Layout::new("/srv/tf"));
        let steps = Workflow::Init.steps(&tf);
        assert_eq!(steps[0].program, "/opt/bin/tofu");
    }

    #[test]
    fn messages_match_routes() {
        assert_eq!(
            Workflow::SetupS3Backend.success_message(),
            "S3 backend setup successfully."
        );
        assert_eq!(Workflow::Init.failure_prefix(), "Terraform init failed");
        assert_eq!(Workflow::Apply.name(), "apply");
    }

    #[test]
    fn failure_detail_prefixes_step_error() {
        let step = Step::new("terraform", "/srv/tf").arg("init");
        let err = WorkflowError::from(StepError::exit(&step, 1));
        assert_eq!(
            Workflow::Init.failure_detail(&err),
            "Terraform init failed: command 'terraform init' in /srv/tf returned non-zero exit status 1"
        );
    }

    #[test]
    fn plan_vars_deserialize_from_json_body() {
        let vars: PlanVars =
            serde_json::from_str(r#"{"instance_type": "t2.micro", "num_replicas": 3}"#).unwrap();
        assert_eq!(vars.instance_type, "t2.micro");
        assert_eq!(vars.num_replicas, 3);
    }
}
