/*!
The source snapshot backing every `/source` mount.

The working tree, minus the patterns in `.buildrunnerignore`, is copied
once per invocation into a content-addressed directory under the scratch
space. The primary container of each step mounts it read-write; services
mount it read-only. Because the snapshot lives on the host, artifact
globs are evaluated directly against this tree after a step's primary
container exits.
*/

use anyhow::{Context, Result};
use glob::Pattern;
use log::debug;
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const IGNORE_FILE: &str = ".buildrunnerignore";

/// Paths never included in a snapshot, regardless of the ignore file.
const ALWAYS_IGNORED: [&str; 3] = [".git", "buildrunner.results", IGNORE_FILE];

#[derive(Debug)]
pub(crate) struct SourceSnapshot {
    /// Host directory bound into containers as `/source`.
    pub(crate) root: PathBuf,

    /// Content digest of the captured tree.
    pub(crate) digest: String,
}

impl SourceSnapshot {
    /// Capture `build_dir` into `scratch`. Called at most once per
    /// invocation; the result is shared by every step.
    pub(crate) fn create(build_dir: &Path, scratch: &Path) -> Result<Self> {
        let ignore = load_ignore_patterns(build_dir)?;
        let entries = collect_entries(build_dir, &ignore)?;
        let digest = tree_digest(build_dir, &entries)?;

        let root = scratch.join(format!("source-{}", &digest[..12]));
        fs::create_dir_all(&root).context(format!(
            "Unable to create snapshot directory '{}'",
            root.display()
        ))?;

        for relative in &entries {
            let from = build_dir.join(relative);
            let to = root.join(relative);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).context(format!(
                    "Unable to create snapshot directory '{}'",
                    parent.display()
                ))?;
            }
            let metadata = fs::symlink_metadata(&from)
                .context(format!("Unable to stat '{}'", from.display()))?;
            if metadata.file_type().is_symlink() {
                let target = fs::read_link(&from)
                    .context(format!("Unable to read link '{}'", from.display()))?;
                std::os::unix::fs::symlink(&target, &to).context(format!(
                    "Unable to recreate link '{}'",
                    to.display()
                ))?;
            } else {
                fs::copy(&from, &to).context(format!(
                    "Unable to copy '{}' into the snapshot",
                    from.display()
                ))?;
            }
        }

        debug!(
            "Snapshot {} captured {} files at '{}'",
            &digest[..12],
            entries.len(),
            root.display()
        );
        Ok(Self { root, digest })
    }
}

/// Relative file and symlink paths included in the snapshot, sorted.
fn collect_entries(build_dir: &Path, ignore: &[Pattern]) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(build_dir)
        .follow_links(false)
        .same_file_system(true)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry
                .path()
                .strip_prefix(build_dir)
                .unwrap_or(entry.path());
            !is_ignored(relative, ignore)
        });
    for entry in walker {
        let entry = entry.context("Unable to walk the working tree")?;
        if entry.file_type().is_file() || entry.file_type().is_symlink() {
            let relative = entry
                .path()
                .strip_prefix(build_dir)
                .context("Walked outside the working tree")?
                .to_path_buf();
            entries.push(relative);
        }
    }
    entries.sort();
    Ok(entries)
}

fn is_ignored(relative: &Path, ignore: &[Pattern]) -> bool {
    let text = relative.to_string_lossy();
    if ALWAYS_IGNORED
        .iter()
        .any(|fixed| text == *fixed || text.starts_with(&format!("{}/", fixed)))
    {
        return true;
    }
    ignore
        .iter()
        .any(|pattern| pattern.matches(&text) || pattern.matches_path(relative))
}

fn load_ignore_patterns(build_dir: &Path) -> Result<Vec<Pattern>> {
    let path = build_dir.join(IGNORE_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(&path)
        .context(format!("Unable to read '{}'", path.display()))?;
    let mut patterns = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let pattern = Pattern::new(line)
            .context(format!("Invalid ignore pattern '{}' in '{}'", line, path.display()))?;
        patterns.push(pattern);
    }
    Ok(patterns)
}

/// Digest over the sorted entry list with sizes and mtimes; identical trees
/// produce identical snapshot names.
fn tree_digest(build_dir: &Path, entries: &[PathBuf]) -> Result<String> {
    let mut d = Sha256::new();
    for relative in entries {
        let path = build_dir.join(relative);
        let metadata = fs::symlink_metadata(&path)
            .context(format!("Unable to stat '{}'", path.display()))?;
        d.update(relative.to_string_lossy().as_bytes());
        d.update(metadata.len().to_le_bytes());
        d.update(metadata.mtime().to_le_bytes());
        d.update(metadata.mtime_nsec().to_le_bytes());
    }
    Ok(hex::encode(d.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn snapshot_copies_tree() {
        let tree = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        write(tree.path(), "Makefile", "all:\n");
        write(tree.path(), "src/main.c", "int main() {}\n");

        let snapshot = SourceSnapshot::create(tree.path(), scratch.path()).unwrap();
        assert!(snapshot.root.join("Makefile").is_file());
        assert!(snapshot.root.join("src/main.c").is_file());
        assert_eq!(
            fs::read_to_string(snapshot.root.join("src/main.c")).unwrap(),
            "int main() {}\n"
        );
    }

    #[test]
    fn ignore_file_filters_patterns() {
        let tree = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        write(tree.path(), ".buildrunnerignore", "*.log\ntarget/*\n");
        write(tree.path(), "keep.txt", "keep");
        write(tree.path(), "noisy.log", "drop");
        write(tree.path(), "target/out.bin", "drop");

        let snapshot = SourceSnapshot::create(tree.path(), scratch.path()).unwrap();
        assert!(snapshot.root.join("keep.txt").is_file());
        assert!(!snapshot.root.join("noisy.log").exists());
        assert!(!snapshot.root.join("target").exists());
        assert!(!snapshot.root.join(IGNORE_FILE).exists());
    }

    #[test]
    fn fixed_ignores_always_apply() {
        let tree = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        write(tree.path(), ".git/config", "[core]");
        write(tree.path(), "buildrunner.results/old/artifacts.json", "{}");
        write(tree.path(), "code.py", "pass");

        let snapshot = SourceSnapshot::create(tree.path(), scratch.path()).unwrap();
        assert!(snapshot.root.join("code.py").is_file());
        assert!(!snapshot.root.join(".git").exists());
        assert!(!snapshot.root.join("buildrunner.results").exists());
    }

    #[test]
    fn digest_is_stable_for_same_tree() {
        let tree = tempfile::TempDir::new().unwrap();
        write(tree.path(), "a.txt", "content");

        let scratch1 = tempfile::TempDir::new().unwrap();
        let scratch2 = tempfile::TempDir::new().unwrap();
        let first = SourceSnapshot::create(tree.path(), scratch1.path()).unwrap();
        let second = SourceSnapshot::create(tree.path(), scratch2.path()).unwrap();
        assert_eq!(first.digest, second.digest);
    }
}
