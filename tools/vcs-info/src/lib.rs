/*!
Probes the source control system for the information that identifies a
build: repository name, branch, commit id, commit count, and whether the
working tree carries local modifications.

Only git is supported. When the working directory is not inside a git
repository (or git is not installed), callers should fall back to
[`VcsInfo::fallback`], which yields stable placeholder values so a build
can still proceed.
*/

use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = std::result::Result<T, error::Error>;

/// Source control facts injected into every build container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsInfo {
    /// Repository name, e.g. the basename of the checkout directory.
    pub name: String,
    /// Current branch name.
    pub branch: String,
    /// Number of commits reachable from HEAD.
    pub number: String,
    /// Full commit id of HEAD.
    pub id: String,
    /// Abbreviated commit id of HEAD.
    pub short_id: String,
    /// Nearest tag description, e.g. `v1.2.0-3-gabc1234`.
    pub release: String,
    /// Epoch seconds at which local modifications were observed; empty
    /// when the working tree is clean.
    pub modified: String,
}

impl VcsInfo {
    /// Probe the repository containing `dir`.
    pub fn detect<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let toplevel = git(dir, &["rev-parse", "--show-toplevel"])?;
        let name = repo_name(&toplevel);
        let branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let number = git(dir, &["rev-list", "--count", "HEAD"])?;
        let id = git(dir, &["rev-parse", "HEAD"])?;
        let short_id = git(dir, &["rev-parse", "--short=7", "HEAD"])?;
        let release = git(dir, &["describe", "--tags", "--always"])?;
        let status = git(dir, &["status", "--porcelain"])?;
        let modified = if status.is_empty() {
            String::new()
        } else {
            epoch_now().to_string()
        };

        Ok(Self {
            name,
            branch,
            number,
            id,
            short_id,
            release,
            modified,
        })
    }

    /// Placeholder values for builds outside of source control.
    pub fn fallback<P: AsRef<Path>>(dir: P) -> Self {
        let name = dir
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            name,
            branch: "unknown".to_string(),
            number: "0".to_string(),
            id: "0".repeat(40),
            short_id: "0".repeat(7),
            release: "0".to_string(),
            modified: String::new(),
        }
    }

    /// Whether the working tree carried local modifications when probed.
    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = duct::cmd("git", args)
        .dir(dir)
        .stderr_null()
        .read()
        .context(error::GitSnafu {
            args: args.join(" "),
        })?;
    Ok(output.trim().to_string())
}

fn repo_name(toplevel: &str) -> String {
    PathBuf::from(toplevel)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to run 'git {}': {}", args, source))]
        Git {
            args: String,
            source: std::io::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repo_name_from_toplevel() {
        assert_eq!(repo_name("/home/user/checkouts/widget"), "widget");
    }

    #[test]
    fn fallback_values() {
        let info = VcsInfo::fallback("/tmp/myproject");
        assert_eq!(info.name, "myproject");
        assert_eq!(info.branch, "unknown");
        assert_eq!(info.short_id.len(), 7);
        assert!(!info.is_modified());
    }
}
