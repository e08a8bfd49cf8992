use std::path::{Path, PathBuf};

/// Name of the backend bootstrap directory under the configuration root.
pub const BACKEND_DIR: &str = "backend";
/// Name of the variables file at the configuration root.
pub const TFVARS_FILE: &str = "terraform.tfvars";

/// Where the terraform configuration lives on disk.
///
/// ```text
/// <root>/
///   backend/            S3 state-bucket bootstrap configuration
///   terraform.tfvars    variables rewritten before each plan
///   *.tf                main configuration
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend_dir(&self) -> PathBuf {
        self.root.join(BACKEND_DIR)
    }

    pub fn tfvars_path(&self) -> PathBuf {
        self.root.join(TFVARS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_relative_to_root() {
        let layout = Layout::new("/srv/terraform");
        assert_eq!(layout.root(), Path::new("/srv/terraform"));
        assert_eq!(layout.backend_dir(), PathBuf::from("/srv/terraform/backend"));
        assert_eq!(
            layout.tfvars_path(),
            PathBuf::from("/srv/terraform/terraform.tfvars")
        );
    }
}
