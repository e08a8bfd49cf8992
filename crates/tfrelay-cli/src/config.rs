//! Configuration file management for tfrelay.
//!
//! Provides a TOML-based config file at `~/.config/tfrelay/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::fmt::Display;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tfrelay_core::exec::ProcessRunner;
use tfrelay_core::layout::Layout;
use tfrelay_core::workflow::Terraform;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub terraform: TerraformSection,
    pub aws: AwsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraformSection {
    /// Configuration root holding `backend/` and `terraform.tfvars`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Executable to invoke instead of `terraform` from `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Kill a step that runs longer than this. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

/// Passed to terraform as `AWS_PROFILE` / `AWS_REGION` when set.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tfrelay config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tfrelay` or `~/.config/tfrelay`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tfrelay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tfrelay")
}

/// Return the path to the tfrelay config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at `path`. A missing file is `Ok(None)`; a file that
/// exists but does not parse is an error.
pub fn load_config_from(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file to `path`, creating parent dirs as
/// needed. Sets file permissions to 0600 on Unix.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Set permissions to 0600 (owner read/write only) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub terraform_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub terraform_dir: PathBuf,
    pub terraform_bin: String,
    pub step_timeout: Option<Duration>,
    pub aws_profile: Option<String>,
    pub aws_region: Option<String>,
}

impl RelayConfig {
    pub const DEFAULT_BIND: &str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_TERRAFORM_DIR: &str = "terraform";

    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - bind: `--bind` > `TFRELAY_BIND` > `server.bind` > `0.0.0.0`
    /// - port: `--port` > `TFRELAY_PORT` > `server.port` > `8000`
    /// - terraform dir: `--terraform-dir` > `TFRELAY_TERRAFORM_DIR` > `terraform.dir` > `./terraform`
    /// - binary: `TFRELAY_TERRAFORM_BIN` > `terraform.binary` > `terraform`
    /// - step timeout: `TFRELAY_STEP_TIMEOUT_SECS` > `terraform.step_timeout_secs` > none
    /// - AWS: `TFRELAY_AWS_PROFILE` / `TFRELAY_AWS_REGION` > `[aws]` > none
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file_config = load_config_from(&config_path())?;
        Self::resolve_with(cli, file_config.unwrap_or_default())
    }

    fn resolve_with(cli: &CliOverrides, file: ConfigFile) -> Result<Self> {
        let bind = cli
            .bind
            .clone()
            .or_else(|| env_var("TFRELAY_BIND"))
            .or(file.server.bind)
            .unwrap_or_else(|| Self::DEFAULT_BIND.to_string());

        let port = match cli.port {
            Some(port) => port,
            None => env_parse("TFRELAY_PORT")?
                .or(file.server.port)
                .unwrap_or(Self::DEFAULT_PORT),
        };

        let terraform_dir = cli
            .terraform_dir
            .clone()
            .or_else(|| env_var("TFRELAY_TERRAFORM_DIR").map(PathBuf::from))
            .or(file.terraform.dir)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_TERRAFORM_DIR));

        let terraform_bin = env_var("TFRELAY_TERRAFORM_BIN")
            .or(file.terraform.binary)
            .unwrap_or_else(|| Terraform::DEFAULT_BINARY.to_string());

        let step_timeout = env_parse::<u64>("TFRELAY_STEP_TIMEOUT_SECS")?
            .or(file.terraform.step_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            bind,
            port,
            terraform_dir,
            terraform_bin,
            step_timeout,
            aws_profile: env_var("TFRELAY_AWS_PROFILE").or(file.aws.profile),
            aws_region: env_var("TFRELAY_AWS_REGION").or(file.aws.region),
        })
    }

    /// The terraform invocation context for this configuration.
    pub fn terraform(&self) -> Terraform {
        let mut tf = Terraform::new(&self.terraform_bin, Layout::new(&self.terraform_dir));
        if let Some(ref profile) = self.aws_profile {
            tf = tf.with_env("AWS_PROFILE", profile);
        }
        if let Some(ref region) = self.aws_region {
            tf = tf.with_env("AWS_REGION", region);
        }
        tf
    }

    /// The process runner for this configuration.
    pub fn runner(&self) -> ProcessRunner {
        match self.step_timeout {
            Some(limit) => ProcessRunner::new().with_timeout(limit),
            None => ProcessRunner::new(),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env_var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key} has invalid value {raw:?}: {e}"))
        })
        .transpose()
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
