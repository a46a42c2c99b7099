//! Shell detection for locally hosted sessions.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Resolve an executable by name.
///
/// Absolute paths are taken as-is if they exist; anything else is looked up
/// on `PATH` via `which`.
#[must_use]
pub fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which::which(executable).ok()
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Arguments for an interactive shell that skips user rc files, so
    /// prompts and aliases stay predictable.
    #[must_use]
    pub const fn interactive_args(&self) -> &'static [&'static str] {
        match self {
            Self::Bash(_) => &["--noprofile", "--norc", "-i"],
            Self::Zsh(_) => &["-f", "-i"],
            Self::Sh(_) | Self::Other(_) => &["-i"],
        }
    }

    /// The user's shell from `$SHELL`, else bash, else `/bin/sh`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Some(shell) = std::env::var_os("SHELL")
            .and_then(|shell| Self::from_path(Path::new(&shell)))
        {
            return shell;
        }
        resolve_executable_path("bash")
            .and_then(|bash| Self::from_path(&bash))
            .unwrap_or_else(|| Self::Sh(PathBuf::from("/bin/sh")))
    }

    /// Classify an existing absolute path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        Some(match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        })
    }
}
