//! Rewriting of the `terraform.tfvars` variables file.
//!
//! Only two keys are managed: [`INSTANCE_TYPE_KEY`] and [`NUM_REPLICAS_KEY`].
//! Every other line is passed through untouched and in order. The file is
//! rewritten whole (read, mutate, overwrite); the write is neither atomic nor
//! locked, so two concurrent updates can lose one of them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Key holding the instance type, written as a quoted string.
pub const INSTANCE_TYPE_KEY: &str = "instance_type";
/// Key holding the replica count, written as a bare integer.
pub const NUM_REPLICAS_KEY: &str = "num_replicas";

/// Errors raised while updating a variables file.
#[derive(Debug, Error)]
pub enum TfvarsError {
    #[error("failed to read variables file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write variables file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Set `instance_type` and `num_replicas` in the file at `path`.
///
/// A missing file is created with exactly the two assignments. The parent
/// directory must already exist.
pub async fn update_tfvars(
    path: &Path,
    instance_type: &str,
    num_replicas: i64,
) -> Result<(), TfvarsError> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(source) => {
            return Err(TfvarsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let updated = apply_vars(existing.as_deref().unwrap_or(""), instance_type, num_replicas);
    tokio::fs::write(path, updated)
        .await
        .map_err(|source| TfvarsError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    tracing::info!(
        path = %path.display(),
        created = existing.is_none(),
        instance_type,
        num_replicas,
        "updated variables file"
    );
    Ok(())
}

/// Return `existing` with both managed keys set.
///
/// The first line assigning a managed key is replaced in place and any later
/// duplicates are dropped. Keys that never appear are appended, instance
/// type first. Every output line ends with `\n`.
pub fn apply_vars(existing: &str, instance_type: &str, num_replicas: i64) -> String {
    let instance_line = format!("{INSTANCE_TYPE_KEY} = {}", hcl_string(instance_type));
    let replicas_line = format!("{NUM_REPLICAS_KEY} = {num_replicas}");

    let mut out =
        String::with_capacity(existing.len() + instance_line.len() + replicas_line.len() + 2);
    let mut seen_instance = false;
    let mut seen_replicas = false;

    for line in existing.lines() {
        let line = if assigns(line, INSTANCE_TYPE_KEY) {
            if std::mem::replace(&mut seen_instance, true) {
                continue;
            }
            instance_line.as_str()
        } else if assigns(line, NUM_REPLICAS_KEY) {
            if std::mem::replace(&mut seen_replicas, true) {
                continue;
            }
            replicas_line.as_str()
        } else {
            line
        };
        out.push_str(line);
        out.push('\n');
    }

    if !seen_instance {
        out.push_str(&instance_line);
        out.push('\n');
    }
    if !seen_replicas {
        out.push_str(&replicas_line);
        out.push('\n');
    }
    out
}

/// Whether `line` is an assignment to exactly `key` (not a longer key that
/// merely starts with it).
fn assigns(line: &str, key: &str) -> bool {
    line.trim_start()
        .strip_prefix(key)
        .is_some_and(|rest| rest.trim_start().starts_with('='))
}

/// Quote `value` as an HCL string literal.
fn hcl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // `${` and `%{` open template sequences; doubling the sigil
            // makes them literal.
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
