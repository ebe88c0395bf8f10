//! Working-directory validation and confinement.
//!
//! Resolves `project_path` joined with an optional relative sub-path,
//! canonicalizes it (which also resolves symlinks), and, when confinement
//! is enabled, requires the result to lie under the user's home directory
//! or under the project itself.

use std::path::{Path, PathBuf};

use crate::{AppError, Result};

/// Resolve and validate the directory a worker will run in.
///
/// `home` is the confinement root besides the project; pass
/// `dirs::home_dir()` in production.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - The project path does not exist.
/// - The sub-path is absolute.
/// - The joined path does not exist or is not a directory.
/// - Confinement is enabled and the resolved path lies outside both roots.
pub fn resolve_workdir(
    project_path: &Path,
    sub_path: Option<&Path>,
    restricted: bool,
    home: Option<&Path>,
) -> Result<PathBuf> {
    let project = project_path.canonicalize().map_err(|err| {
        AppError::PathViolation(format!(
            "project path {} invalid: {err}",
            project_path.display()
        ))
    })?;

    let joined = match sub_path {
        Some(sub) if sub.is_absolute() => {
            return Err(AppError::PathViolation(format!(
                "sub-project path {} must be relative",
                sub.display()
            )));
        }
        Some(sub) => project.join(sub),
        None => project.clone(),
    };

    let resolved = joined.canonicalize().map_err(|err| {
        AppError::PathViolation(format!(
            "working directory {} invalid: {err}",
            joined.display()
        ))
    })?;

    if !resolved.is_dir() {
        return Err(AppError::PathViolation(format!(
            "working directory {} is not a directory",
            resolved.display()
        )));
    }

    if restricted {
        let under_home = home
            .and_then(|h| h.canonicalize().ok())
            .is_some_and(|h| resolved.starts_with(h));
        if !under_home && !resolved.starts_with(&project) {
            return Err(AppError::PathViolation(format!(
                "working directory {} is outside the home directory and project",
                resolved.display()
            )));
        }
    }

    Ok(resolved)
}
