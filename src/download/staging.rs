//! Staging-directory routing and lifecycle.
//!
//! Downloads are written under a staging base and moved to the final
//! library afterwards, so the library (and anything indexing it) never
//! sees half-written files. The staging base is either an externally
//! configured path (cross-filesystem temp) or a hidden directory under
//! the final base (same-filesystem atomic moves).

use std::path::{Component, Path, PathBuf};

use crate::core::error::AppResult;

/// Name of the hidden staging directory used when no external staging
/// path is configured.
const HIDDEN_STAGING_DIR: &str = ".grabarr-staging";

#[derive(Debug, Clone)]
pub struct PathStager {
    final_base: PathBuf,
    staging_override: Option<PathBuf>,
    use_external_staging: bool,
}

impl PathStager {
    pub fn new(final_base: impl Into<PathBuf>, staging_override: Option<PathBuf>, use_external_staging: bool) -> Self {
        Self {
            final_base: final_base.into(),
            staging_override,
            use_external_staging,
        }
    }

    pub fn final_base(&self) -> &Path {
        &self.final_base
    }

    /// Where in-flight files live for this configuration.
    pub fn base_path_for_staging(&self) -> PathBuf {
        match (&self.staging_override, self.use_external_staging) {
            (Some(path), true) => path.clone(),
            _ => self.final_base.join(HIDDEN_STAGING_DIR),
        }
    }

    /// Component-wise prefix check. `/a/bc` is not under `/a/b`, and
    /// trailing separators do not matter.
    fn is_under(path: &Path, base: &Path) -> bool {
        let path_components: Vec<Component> = path.components().collect();
        let base_components: Vec<Component> = base.components().collect();
        path_components.len() >= base_components.len()
            && path_components[..base_components.len()] == base_components[..]
    }

    pub fn is_staging_path(&self, path: &Path) -> bool {
        Self::is_under(path, &self.base_path_for_staging())
    }

    /// Re-root a staging path under the final base. Non-staging paths are
    /// returned unchanged.
    pub fn to_final_path(&self, path: &Path) -> PathBuf {
        let staging_base = self.base_path_for_staging();
        match path.strip_prefix(&staging_base) {
            Ok(relative) => self.final_base.join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Re-root a final path under the staging base. Paths already in
    /// staging, or outside the final base, are returned unchanged.
    pub fn to_staging_path(&self, path: &Path) -> PathBuf {
        if self.is_staging_path(path) {
            return path.to_path_buf();
        }
        match path.strip_prefix(&self.final_base) {
            Ok(relative) => self.base_path_for_staging().join(relative),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Recursively delete and recreate the staging base. Runs before every
    /// job so a crashed prior run cannot leave half-written files behind.
    /// Errors are fatal for the job that requested staging.
    pub async fn reset_staging_directory(&self) -> AppResult<()> {
        let base = self.base_path_for_staging();

        match tokio::fs::remove_dir_all(&base).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&base).await?;

        log::debug!("Reset staging directory {}", base.display());
        Ok(())
    }
}
