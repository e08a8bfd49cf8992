mod config;
mod run_cmd;
mod serve_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tfrelay_core::workflow::{PlanVars, Workflow};

use config::{CliOverrides, RelayConfig};

#[derive(Parser)]
#[command(name = "tfrelay", about = "HTTP relay for terraform init, plan and apply")]
struct Cli {
    /// Terraform configuration root (overrides TFRELAY_TERRAFORM_DIR env var)
    #[arg(long, global = true)]
    terraform_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the terraform HTTP routes
    Serve {
        /// Address to bind (overrides TFRELAY_BIND env var)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides TFRELAY_PORT env var)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a tfrelay config file
    Config {
        /// AWS profile passed to terraform as AWS_PROFILE
        #[arg(long)]
        aws_profile: Option<String>,
        /// AWS region passed to terraform as AWS_REGION
        #[arg(long)]
        aws_region: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run `terraform init` in the configuration root
    Init,
    /// Update terraform.tfvars, then run `terraform plan`
    Plan {
        /// Value written to `instance_type`
        #[arg(long)]
        instance_type: String,
        /// Value written to `num_replicas`
        #[arg(long, allow_negative_numbers = true)]
        num_replicas: i64,
    },
    /// Run `terraform apply -auto-approve` in the configuration root
    Apply,
    /// Run init, plan and apply in the backend directory
    SetupS3Backend,
}

/// Execute the `tfrelay config` command: write config file.
fn cmd_config(
    terraform_dir: Option<PathBuf>,
    aws_profile: Option<String>,
    aws_region: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let terraform_dir = match terraform_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?.join(RelayConfig::DEFAULT_TERRAFORM_DIR),
    };

    let cfg = config::ConfigFile {
        server: config::ServerSection {
            bind: Some(RelayConfig::DEFAULT_BIND.to_string()),
            port: Some(RelayConfig::DEFAULT_PORT),
        },
        terraform: config::TerraformSection {
            dir: Some(terraform_dir.clone()),
            binary: None,
            step_timeout_secs: None,
        },
        aws: config::AwsSection {
            profile: aws_profile,
            region: aws_region,
        },
    };

    config::save_config_to(&cfg, &path)?;

    println!("Config written to {}", path.display());
    println!("  terraform.dir = {}", terraform_dir.display());
    println!(
        "  server = {}:{}",
        RelayConfig::DEFAULT_BIND,
        RelayConfig::DEFAULT_PORT
    );
    println!();
    println!("Next: run `tfrelay serve` to start the HTTP relay.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut overrides = CliOverrides {
        terraform_dir: cli.terraform_dir.clone(),
        ..Default::default()
    };

    match cli.command {
        Commands::Serve { bind, port } => {
            overrides.bind = bind;
            overrides.port = port;
            let resolved = RelayConfig::resolve(&overrides)?;
            serve_cmd::run_serve(&resolved).await?;
        }
        Commands::Config {
            aws_profile,
            aws_region,
            force,
        } => {
            cmd_config(cli.terraform_dir, aws_profile, aws_region, force)?;
        }
        Commands::Init => {
            let resolved = RelayConfig::resolve(&overrides)?;
            run_cmd::run_workflow_command(&resolved, Workflow::Init).await?;
        }
        Commands::Plan {
            instance_type,
            num_replicas,
        } => {
            let resolved = RelayConfig::resolve(&overrides)?;
            let vars = PlanVars {
                instance_type,
                num_replicas,
            };
            run_cmd::run_workflow_command(&resolved, Workflow::Plan(vars)).await?;
        }
        Commands::Apply => {
            let resolved = RelayConfig::resolve(&overrides)?;
            run_cmd::run_workflow_command(&resolved, Workflow::Apply).await?;
        }
        Commands::SetupS3Backend => {
            let resolved = RelayConfig::resolve(&overrides)?;
            run_cmd::run_workflow_command(&resolved, Workflow::SetupS3Backend).await?;
        }
    }

    Ok(())
}
