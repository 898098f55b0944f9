/*!
Host-side cache archives shared across builds.

Each cache is a plain tar archive under the caches root, keyed by name.
Restores walk an ordered key list: the first exact match wins, otherwise
the most recently modified archive whose name starts with a key, otherwise
the target stays empty. Saves go through a sibling temp file and a rename
so concurrent builds never observe a half-written archive.
*/

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

const CACHE_EXTENSION: &str = "tar";

#[derive(Debug, Clone)]
pub(crate) struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub(crate) fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Archive the contents of `dir` under `key`, replacing any previous
    /// archive with that name.
    pub(crate) fn save(&self, key: &str, dir: &Path) -> Result<PathBuf> {
        validate_key(key)?;
        fs::create_dir_all(&self.root).context(format!(
            "Unable to create caches root '{}'",
            self.root.display()
        ))?;

        let destination = self.archive_path(key);
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".partial")
            .tempfile_in(&self.root)
            .context("Unable to create a temporary cache archive")?;

        let mut builder = Builder::new(temp.as_file());
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", dir)
            .context(format!("Unable to archive cache from '{}'", dir.display()))?;
        builder.finish().context("Unable to finish cache archive")?;
        drop(builder);

        temp.persist(&destination).context(format!(
            "Unable to move cache archive into place at '{}'",
            destination.display()
        ))?;
        debug!("Saved cache '{}' from '{}'", key, dir.display());
        Ok(destination)
    }

    /// Populate `target` from the best archive for `keys`, returning the
    /// archive file name used, if any. On no match the target is created
    /// empty.
    pub(crate) fn restore(&self, keys: &[String], target: &Path) -> Result<Option<String>> {
        fs::create_dir_all(target).context(format!(
            "Unable to create cache target '{}'",
            target.display()
        ))?;

        let Some(archive) = self.locate(keys)? else {
            debug!(
                "No cache archive for keys [{}]; starting empty",
                keys.join(", ")
            );
            return Ok(None);
        };

        let file = File::open(&archive).context(format!(
            "Unable to open cache archive '{}'",
            archive.display()
        ))?;
        Archive::new(file).unpack(target).context(format!(
            "Unable to unpack cache archive '{}'",
            archive.display()
        ))?;

        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!("Restored cache '{}' into '{}'", name, target.display());
        Ok(Some(name))
    }

    /// Remove every file under the caches root.
    pub(crate) fn wipe(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.root).context(format!(
            "Unable to read caches root '{}'",
            self.root.display()
        ))? {
            let entry = entry.context("Unable to read caches root entry")?;
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .context(format!("Unable to remove '{}'", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn archive_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, CACHE_EXTENSION))
    }

    /// First exact match wins; otherwise the newest prefix match, walking
    /// the keys in order.
    fn locate(&self, keys: &[String]) -> Result<Option<PathBuf>> {
        for key in keys {
            validate_key(key)?;
            let exact = self.archive_path(key);
            if exact.is_file() {
                return Ok(Some(exact));
            }
        }
        for key in keys {
            if let Some(found) = self.newest_with_prefix(key)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    fn newest_with_prefix(&self, prefix: &str) -> Result<Option<PathBuf>> {
        if !self.root.is_dir() {
            return Ok(None);
        }
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&self.root).context(format!(
            "Unable to read caches root '{}'",
            self.root.display()
        ))? {
            let entry = entry.context("Unable to read caches root entry")?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file()
                || !name.starts_with(prefix)
                || !name.ends_with(&format!(".{}", CACHE_EXTENSION))
            {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .context(format!("Unable to read mtime of '{}'", path.display()))?;
            let replace = match &newest {
                Some((time, _)) => modified > *time,
                None => true,
            };
            if replace {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

fn validate_key(key: &str) -> Result<()> {
    ensure!(
        !key.is_empty() && !key.contains(['/', '\\']) && !key.starts_with('.'),
        "Invalid cache key '{}': keys must be plain file names",
        key
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn read_tree(root: &Path) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .to_string();
                entries.push((rel, fs::read_to_string(entry.path()).unwrap()));
            }
        }
        entries.sort();
        entries
    }

    #[test]
    fn save_then_restore_round_trips() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());

        let source = tempfile::TempDir::new().unwrap();
        write_tree(
            source.path(),
            &[("a.txt", "alpha"), ("sub/b.txt", "bravo")],
        );
        store.save("m2repo", source.path()).unwrap();

        let target = tempfile::TempDir::new().unwrap();
        let used = store
            .restore(&["m2repo".to_string()], target.path())
            .unwrap();
        assert_eq!(used.as_deref(), Some("m2repo.tar"));
        assert_eq!(read_tree(source.path()), read_tree(target.path()));
    }

    #[test]
    fn restore_prefers_exact_match_over_prefix() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());

        let exact = tempfile::TempDir::new().unwrap();
        write_tree(exact.path(), &[("which", "exact")]);
        store.save("cargo-abc", exact.path()).unwrap();

        let other = tempfile::TempDir::new().unwrap();
        write_tree(other.path(), &[("which", "prefix")]);
        store.save("cargo-def", other.path()).unwrap();

        let target = tempfile::TempDir::new().unwrap();
        store
            .restore(&["cargo-abc".to_string(), "cargo-".to_string()], target.path())
            .unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("which")).unwrap(),
            "exact"
        );
    }

    #[test]
    fn prefix_match_picks_newest_by_mtime() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());

        let older = tempfile::TempDir::new().unwrap();
        write_tree(older.path(), &[("which", "older")]);
        let older_archive = store.save("m2repo-abc", older.path()).unwrap();

        let newer = tempfile::TempDir::new().unwrap();
        write_tree(newer.path(), &[("which", "newer")]);
        let newer_archive = store.save("m2repo-def", newer.path()).unwrap();

        set_file_mtime(&older_archive, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        set_file_mtime(&newer_archive, FileTime::from_unix_time(2_000_000, 0)).unwrap();

        let target = tempfile::TempDir::new().unwrap();
        let used = store
            .restore(
                &["m2repo-zzz".to_string(), "m2repo-".to_string()],
                target.path(),
            )
            .unwrap();
        assert_eq!(used.as_deref(), Some("m2repo-def.tar"));
        assert_eq!(
            fs::read_to_string(target.path().join("which")).unwrap(),
            "newer"
        );
    }

    #[test]
    fn no_match_leaves_target_empty() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());
        let target = tempfile::TempDir::new().unwrap();
        let used = store
            .restore(&["absent".to_string()], target.path())
            .unwrap();
        assert!(used.is_none());
        assert!(target.path().is_dir());
        assert!(fs::read_dir(target.path()).unwrap().next().is_none());
    }

    #[test]
    fn wipe_removes_everything() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());

        let source = tempfile::TempDir::new().unwrap();
        write_tree(source.path(), &[("f", "x")]);
        store.save("one", source.path()).unwrap();
        store.save("two", source.path()).unwrap();

        assert_eq!(store.wipe().unwrap(), 2);
        assert_eq!(store.wipe().unwrap(), 0);
    }

    #[test]
    fn path_like_keys_are_rejected() {
        let caches = tempfile::TempDir::new().unwrap();
        let store = CacheStore::new(caches.path());
        let source = tempfile::TempDir::new().unwrap();
        assert!(store.save("../escape", source.path()).is_err());
        assert!(store.save(".hidden", source.path()).is_err());
    }
}
