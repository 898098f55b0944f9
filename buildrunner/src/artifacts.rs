/*!
Extracts build artifacts into the per-step results tree.

Artifacts are globbed against the host-side snapshot backing `/source`,
so capture never has to re-enter a stopped container. Single files are
copied out (optionally renamed); directories become `tar` archives with a
configurable compression codec, `zip` archives, or a verbatim mirror.
Every produced file is recorded in the step's `artifacts.json` sidecar
unless its spec opts out with `push: false`.
*/

use crate::manifest::{ArchiveType, ArtifactFormat, ArtifactSpec};
use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use log::info;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

pub(crate) const METADATA_FILE: &str = "artifacts.json";

/// The mount point the patterns are resolved against.
const SOURCE_MOUNT: &str = "/source";

pub(crate) struct CaptureRequest<'a> {
    /// Host tree representing the container's `/source`.
    pub(crate) source_root: &'a Path,

    /// The step's working directory inside the container.
    pub(crate) container_cwd: &'a str,

    /// The step's results directory.
    pub(crate) results_dir: &'a Path,

    pub(crate) artifacts: &'a IndexMap<String, Option<ArtifactSpec>>,
}

/// Glob-expand every pattern, apply the format rules, and write the
/// metadata sidecar. Returns the sidecar content keyed by output name.
pub(crate) fn capture(request: &CaptureRequest<'_>) -> Result<IndexMap<String, serde_json::Value>> {
    fs::create_dir_all(request.results_dir).context(format!(
        "Unable to create results directory '{}'",
        request.results_dir.display()
    ))?;

    let mut sidecar = IndexMap::new();
    for (pattern, spec) in request.artifacts {
        let default_spec = ArtifactSpec::default();
        let spec = spec.as_ref().unwrap_or(&default_spec);
        let relative = resolve_pattern(request.container_cwd, pattern)?;
        let full_pattern = request.source_root.join(&relative);

        let mut hits: Vec<PathBuf> = glob::glob(&full_pattern.to_string_lossy())
            .context(format!("Invalid artifact pattern '{}'", pattern))?
            .collect::<std::result::Result<_, _>>()
            .context(format!("Unable to expand artifact pattern '{}'", pattern))?;
        hits.sort();

        for hit in hits {
            // Globs cannot introduce an escape after resolution, but a
            // symlinked hit could point anywhere; re-check the real path.
            let real = hit
                .canonicalize()
                .context(format!("Unable to resolve artifact '{}'", hit.display()))?;
            let source_real = request
                .source_root
                .canonicalize()
                .context("Unable to resolve the source root")?;
            if !real.starts_with(&source_real) {
                bail!(
                    "Artifact '{}' resolves outside of {}",
                    hit.display(),
                    SOURCE_MOUNT
                );
            }

            let produced = if hit.is_dir() {
                archive_directory(&hit, spec, request.results_dir)?
            } else {
                copy_file(&hit, spec, request.results_dir)?
            };
            info!("Captured artifact '{}'", produced);

            if spec.push.unwrap_or(true) {
                sidecar.insert(produced, metadata_entry(spec)?);
            }
        }
    }

    let sidecar_path = request.results_dir.join(METADATA_FILE);
    let json = serde_json::to_string_pretty(&sidecar)
        .context("Unable to serialize artifact metadata")?;
    fs::write(&sidecar_path, json).context(format!(
        "Unable to write '{}'",
        sidecar_path.display()
    ))?;

    Ok(sidecar)
}

/// Resolve a pattern against the step's working directory, normalizing away
/// `.` and `..`. Anything that leaves `/source` is fatal.
fn resolve_pattern(container_cwd: &str, pattern: &str) -> Result<String> {
    let combined = if let Some(absolute) = pattern.strip_prefix('/') {
        absolute.to_string()
    } else {
        let cwd = container_cwd.trim_start_matches('/');
        if cwd.is_empty() {
            pattern.to_string()
        } else {
            format!("{}/{}", cwd, pattern)
        }
    };

    let source = SOURCE_MOUNT.trim_start_matches('/');
    let mut components: Vec<&str> = Vec::new();
    for component in combined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    bail!(
                        "Artifact pattern '{}' escapes {}",
                        pattern,
                        SOURCE_MOUNT
                    );
                }
            }
            other => components.push(other),
        }
    }

    match components.split_first() {
        Some((first, rest)) if *first == source && !rest.is_empty() => Ok(rest.join("/")),
        _ => bail!(
            "Artifact pattern '{}' resolves outside of {}",
            pattern,
            SOURCE_MOUNT
        ),
    }
}

fn copy_file(hit: &Path, spec: &ArtifactSpec, results_dir: &Path) -> Result<String> {
    let name = output_name(hit, spec, None)?;
    let destination = results_dir.join(&name);
    fs::copy(hit, &destination).context(format!(
        "Unable to copy artifact '{}' to '{}'",
        hit.display(),
        destination.display()
    ))?;
    Ok(name)
}

fn archive_directory(hit: &Path, spec: &ArtifactSpec, results_dir: &Path) -> Result<String> {
    if spec.format == Some(ArtifactFormat::Uncompressed) {
        let name = output_name(hit, spec, None)?;
        let destination = results_dir.join(&name);
        mirror_tree(hit, &destination)?;
        return Ok(name);
    }

    if spec.archive_type == Some(ArchiveType::Zip) {
        let name = output_name(hit, spec, Some("zip"))?;
        let destination = results_dir.join(&name);
        zip_directory(hit, &destination)?;
        return Ok(name);
    }

    let codec = spec.compression.as_deref().unwrap_or("gz");
    let name = output_name(hit, spec, Some(&tar_extension(codec)))?;
    let destination = results_dir.join(&name);
    match codec {
        "gz" => tar_gz_directory(hit, &destination)?,
        other => tar_external_codec(hit, &destination, other)?,
    }
    Ok(name)
}

fn output_name(hit: &Path, spec: &ArtifactSpec, extension: Option<&str>) -> Result<String> {
    let base = match &spec.rename {
        Some(rename) => rename.clone(),
        None => hit
            .file_name()
            .context(format!("Artifact '{}' has no file name", hit.display()))?
            .to_string_lossy()
            .to_string(),
    };
    Ok(match extension {
        Some(ext) => format!("{}.{}", base, ext),
        None => base,
    })
}

fn tar_extension(codec: &str) -> String {
    let suffix = match codec {
        "lzip" => "lz",
        "lzop" => "lzo",
        "z" => "Z",
        other => other,
    };
    format!("tar.{}", suffix)
}

fn tar_gz_directory(dir: &Path, destination: &Path) -> Result<()> {
    let file = File::create(destination).context(format!(
        "Unable to create archive '{}'",
        destination.display()
    ))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(dir_base(dir)?, dir)
        .context(format!("Unable to archive '{}'", dir.display()))?;
    let encoder = builder
        .into_inner()
        .context("Unable to finish tar archive")?;
    encoder.finish().context("Unable to finish gz stream")?;
    Ok(())
}

/// For codecs without a native implementation, produce a plain tar and pipe
/// it through the system compressor.
fn tar_external_codec(dir: &Path, destination: &Path, codec: &str) -> Result<()> {
    let program = match codec {
        "bz2" => "bzip2",
        "xz" => "xz",
        "lzma" => "lzma",
        "lzip" => "lzip",
        "lzop" => "lzop",
        "z" => "compress",
        other => bail!("Unsupported compression codec '{}'", other),
    };
    which::which(program).context(format!(
        "Compression codec '{}' needs the '{}' program, which was not found",
        codec, program
    ))?;

    let temp = tempfile::NamedTempFile::new_in(
        destination.parent().unwrap_or_else(|| Path::new(".")),
    )
    .context("Unable to create temporary tar file")?;
    {
        let mut builder = tar::Builder::new(temp.as_file());
        builder.follow_symlinks(false);
        builder
            .append_dir_all(dir_base(dir)?, dir)
            .context(format!("Unable to archive '{}'", dir.display()))?;
        builder.finish().context("Unable to finish tar archive")?;
    }

    let tar_in = File::open(temp.path()).context("Unable to reopen temporary tar file")?;
    let out = File::create(destination).context(format!(
        "Unable to create archive '{}'",
        destination.display()
    ))?;
    let status = Command::new(program)
        .arg("-c")
        .stdin(Stdio::from(tar_in))
        .stdout(Stdio::from(out))
        .status()
        .context(format!("Unable to run '{}'", program))?;
    if !status.success() {
        bail!(
            "'{}' failed with exit code {} while compressing '{}'",
            program,
            status.code().unwrap_or(1),
            destination.display()
        );
    }
    Ok(())
}

fn zip_directory(dir: &Path, destination: &Path) -> Result<()> {
    let file = File::create(destination).context(format!(
        "Unable to create archive '{}'",
        destination.display()
    ))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let base = dir_base(dir)?;

    for entry in WalkDir::new(dir).follow_links(false).min_depth(1) {
        let entry = entry.context("Unable to walk artifact directory")?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("Walked outside the artifact directory")?;
        let archived = format!("{}/{}", base, relative.to_string_lossy());
        if entry.file_type().is_dir() {
            writer
                .add_directory(archived, options)
                .context("Unable to add directory to zip archive")?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(archived, options)
                .context("Unable to add file to zip archive")?;
            let data = fs::read(entry.path())
                .context(format!("Unable to read '{}'", entry.path().display()))?;
            writer
                .write_all(&data)
                .context("Unable to write file to zip archive")?;
        }
    }
    writer.finish().context("Unable to finish zip archive")?;
    Ok(())
}

fn mirror_tree(dir: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.context("Unable to walk artifact directory")?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("Walked outside the artifact directory")?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .context(format!("Unable to create '{}'", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .context(format!("Unable to create '{}'", parent.display()))?;
            }
            fs::copy(entry.path(), &target).context(format!(
                "Unable to copy '{}' to '{}'",
                entry.path().display(),
                target.display()
            ))?;
        }
    }
    Ok(())
}

fn dir_base(dir: &Path) -> Result<String> {
    Ok(dir
        .file_name()
        .context(format!("Artifact '{}' has no file name", dir.display()))?
        .to_string_lossy()
        .to_string())
}

fn metadata_entry(spec: &ArtifactSpec) -> Result<serde_json::Value> {
    let mut entry = serde_json::Map::new();
    entry.insert("push".to_string(), serde_json::Value::Bool(true));
    for (key, value) in &spec.metadata {
        let value = serde_json::to_value(value)
            .context(format!("Unable to serialize artifact metadata '{}'", key))?;
        entry.insert(key.clone(), value);
    }
    Ok(serde_json::Value::Object(entry))
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn artifacts(entries: &[(&str, Option<ArtifactSpec>)]) -> IndexMap<String, Option<ArtifactSpec>> {
        entries
            .iter()
            .map(|(pattern, spec)| (pattern.to_string(), spec.clone()))
            .collect()
    }

    #[test]
    fn resolve_relative_to_cwd() {
        assert_eq!(
            resolve_pattern("/source", "target/*.jar").unwrap(),
            "target/*.jar"
        );
        assert_eq!(
            resolve_pattern("/source/sub", "dist").unwrap(),
            "sub/dist"
        );
        assert_eq!(
            resolve_pattern("/source", "/source/out/a.bin").unwrap(),
            "out/a.bin"
        );
    }

    #[test]
    fn escapes_are_fatal() {
        assert!(resolve_pattern("/source", "../etc/passwd").is_err());
        assert!(resolve_pattern("/source", "/etc/passwd").is_err());
        assert!(resolve_pattern("/source", "a/../../b").is_err());
        assert!(resolve_pattern("/tmp", "anything").is_err());
    }

    #[test]
    fn single_file_copy_and_rename() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "out/widget.bin", "binary");

        let spec = ArtifactSpec {
            rename: Some("widget-1.0.bin".to_string()),
            ..Default::default()
        };
        let sidecar = capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("out/widget.bin", Some(spec))]),
        })
        .unwrap();

        assert!(results.path().join("widget-1.0.bin").is_file());
        assert!(sidecar.contains_key("widget-1.0.bin"));
        assert!(results.path().join(METADATA_FILE).is_file());
    }

    #[test]
    fn directory_defaults_to_tar_gz() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "dist/a.txt", "a");
        write(source.path(), "dist/sub/b.txt", "b");

        let sidecar = capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("dist", None)]),
        })
        .unwrap();

        let archive = results.path().join("dist.tar.gz");
        assert!(archive.is_file());
        assert!(sidecar.contains_key("dist.tar.gz"));

        // The archive holds the directory under its own name.
        let file = File::open(archive).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut seen = Vec::new();
        for entry in tar::Archive::new(decoder).entries().unwrap() {
            seen.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert!(seen.iter().any(|p| p == "dist/a.txt"));
        assert!(seen.iter().any(|p| p == "dist/sub/b.txt"));
    }

    #[test]
    fn directory_uncompressed_mirrors_tree() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "dist/a.txt", "alpha");

        let spec = ArtifactSpec {
            format: Some(ArtifactFormat::Uncompressed),
            ..Default::default()
        };
        capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("dist", Some(spec))]),
        })
        .unwrap();

        assert_eq!(
            fs::read_to_string(results.path().join("dist/a.txt")).unwrap(),
            "alpha"
        );
    }

    #[test]
    fn directory_zip() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "dist/a.txt", "alpha");

        let spec = ArtifactSpec {
            archive_type: Some(ArchiveType::Zip),
            ..Default::default()
        };
        let sidecar = capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("dist", Some(spec))]),
        })
        .unwrap();
        assert!(results.path().join("dist.zip").is_file());
        assert!(sidecar.contains_key("dist.zip"));
    }

    #[test]
    fn push_false_omitted_from_sidecar() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "a.txt", "a");
        write(source.path(), "b.txt", "b");

        let hidden = ArtifactSpec {
            push: Some(false),
            ..Default::default()
        };
        let sidecar = capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("a.txt", None), ("b.txt", Some(hidden))]),
        })
        .unwrap();

        assert!(sidecar.contains_key("a.txt"));
        assert!(!sidecar.contains_key("b.txt"));
        // The file itself is still produced.
        assert!(results.path().join("b.txt").is_file());
    }

    #[test]
    fn capture_is_idempotent() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "out/one.jar", "1");
        write(source.path(), "out/two.jar", "2");

        let request = CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("out/*.jar", None)]),
        };
        let first = capture(&request).unwrap();
        let first_json = fs::read_to_string(results.path().join(METADATA_FILE)).unwrap();
        let second = capture(&request).unwrap();
        let second_json = fs::read_to_string(results.path().join(METADATA_FILE)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_json, second_json);
        let names: Vec<&String> = first.keys().collect();
        assert_eq!(names, ["one.jar", "two.jar"]);
    }

    #[test]
    fn metadata_merged_into_sidecar() {
        let source = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        write(source.path(), "app.war", "war");

        let mut metadata = IndexMap::new();
        metadata.insert(
            "classifier".to_string(),
            serde_yaml::Value::String("dist".to_string()),
        );
        let spec = ArtifactSpec {
            metadata,
            ..Default::default()
        };
        let sidecar = capture(&CaptureRequest {
            source_root: source.path(),
            container_cwd: "/source",
            results_dir: results.path(),
            artifacts: &artifacts(&[("app.war", Some(spec))]),
        })
        .unwrap();

        let entry = &sidecar["app.war"];
        assert_eq!(entry["classifier"], "dist");
        assert_eq!(entry["push"], true);
    }
}
