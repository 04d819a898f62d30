//! Backend executable discovery

use crate::error::{LocalModelError, Result};
use std::path::{Path, PathBuf};

/// Install locations checked after PATH, relative to the home directory
const HOME_FALLBACKS: &[&str] = &[
    ".npm-global/bin",
    ".local/bin",
    "node_modules/.bin",
    ".yarn/bin",
];

const SYSTEM_FALLBACKS: &[&str] = &["/usr/local/bin"];

/// Resolve the backend program to an executable path
///
/// A program containing a path separator must exist as given. A bare name is
/// searched on `PATH`, then in the conventional node install locations.
pub fn locate_backend(program: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH");
    let mut search: Vec<PathBuf> = path_var
        .as_deref()
        .map(|p| std::env::split_paths(p).collect())
        .unwrap_or_default();
    if let Some(home) = dirs::home_dir() {
        search.extend(HOME_FALLBACKS.iter().map(|rel| home.join(rel)));
    }
    search.extend(SYSTEM_FALLBACKS.iter().map(PathBuf::from));
    locate_in(program, &search)
}

/// Resolve against an explicit search list
pub fn locate_in(program: &str, search_dirs: &[PathBuf]) -> Result<PathBuf> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        if is_executable(as_path) {
            return Ok(as_path.to_path_buf());
        }
        return Err(LocalModelError::BackendUnavailable {
            program: program.to_string(),
            searched: as_path.display().to_string(),
        });
    }

    for dir in search_dirs {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            tracing::debug!(path = %candidate.display(), "Located backend executable");
            return Ok(candidate);
        }
    }

    Err(LocalModelError::BackendUnavailable {
        program: program.to_string(),
        searched: search_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(":"),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
