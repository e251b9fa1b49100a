//! Locating the external tunnel executable.
//!
//! Search order:
//!
//! 1. Explicit override (`SANDLINK_TUNNEL_BINARY` / [`ClientConfig::tunnel_binary`])
//! 2. Directory of the running executable (bundled installs)
//! 3. Every entry of `PATH`
//! 4. Common install directories
//!
//! [`ClientConfig::tunnel_binary`]: crate::config::ClientConfig::tunnel_binary

use crate::error::{CoreError, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Finds an executable by searching configured directories in order.
#[derive(Debug, Clone, Default)]
pub struct TunnelBinaryFinder {
    explicit: Option<PathBuf>,
    search_paths: Vec<PathBuf>,
}

impl TunnelBinaryFinder {
    /// Create an empty finder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this exact file before searching anything else.
    pub fn with_explicit(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    /// Append a directory to search.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Finder with the standard search order.
    pub fn standard(explicit: Option<PathBuf>) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self::search_order(
            explicit,
            exe_dir,
            std::env::var_os("PATH").as_deref(),
            dirs::home_dir(),
        )
    }

    /// Build the standard order from explicit inputs.
    fn search_order(
        explicit: Option<PathBuf>,
        exe_dir: Option<PathBuf>,
        path_var: Option<&OsStr>,
        home: Option<PathBuf>,
    ) -> Self {
        let mut finder = Self::new();
        if let Some(path) = explicit {
            finder = finder.with_explicit(path);
        }
        if let Some(dir) = exe_dir {
            finder = finder.with_path(dir);
        }
        if let Some(path_var) = path_var {
            for dir in std::env::split_paths(path_var) {
                if !dir.as_os_str().is_empty() {
                    finder = finder.with_path(dir);
                }
            }
        }
        for dir in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"] {
            finder = finder.with_path(dir);
        }
        if let Some(home) = home {
            finder = finder
                .with_path(home.join(".local").join("bin"))
                .with_path(home.join(".cargo").join("bin"));
        }
        finder
    }

    /// Find `name`, returning the first match in search order.
    pub fn find(&self, name: &str) -> Result<PathBuf> {
        let mut searched = Vec::new();

        if let Some(explicit) = &self.explicit {
            if is_executable(explicit) {
                tracing::debug!(binary = %explicit.display(), "Using explicit tunnel binary");
                return Ok(explicit.clone());
            }
            searched.push(explicit.clone());
        }

        let file_name = executable_name(name);
        for dir in &self.search_paths {
            let candidate = dir.join(&file_name);
            tracing::trace!(candidate = %candidate.display(), "Checking for tunnel binary");
            if is_executable(&candidate) {
                tracing::debug!(binary = %candidate.display(), "Found tunnel binary");
                return Ok(candidate);
            }
            searched.push(candidate);
        }

        Err(CoreError::ExecutableNotFound {
            name: name.to_string(),
            searched,
        })
    }
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
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
