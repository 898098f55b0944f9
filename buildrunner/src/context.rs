use crate::config::GlobalConfig;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use vcs_info::VcsInfo;

/// Environment variable prefix recognized as a build environment overlay.
const ENV_OVERLAY_PREFIX: &str = "BUILDRUNNER_";

/// An image a completed step published for downstream steps.
#[derive(Debug, Clone)]
pub(crate) struct StepImage {
    pub(crate) reference: String,
    pub(crate) platforms: Vec<String>,
}

/// Shared state for one invocation. Created before the first step runs and
/// torn down after global cleanup; steps publish into it only on success.
#[derive(Debug)]
pub(crate) struct BuildContext {
    pub(crate) build_number: String,
    pub(crate) build_id: String,
    pub(crate) build_time: u64,
    pub(crate) docker_tag: String,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) build_dir: PathBuf,
    pub(crate) results_dir: PathBuf,
    pub(crate) config: GlobalConfig,
    pub(crate) vcs: VcsInfo,
    pub(crate) step_names: Vec<String>,

    /// `BUILDRUNNER_*` variables from the process environment, overlaid on
    /// the injected set.
    pub(crate) env_overlay: BTreeMap<String, String>,

    /// Remote build host aliases, global config merged with the manifest.
    pub(crate) build_servers: BTreeMap<String, String>,

    /// Local-file aliases, global config merged with the manifest.
    pub(crate) local_files: BTreeMap<String, String>,

    pub(crate) push_enabled: bool,
    pub(crate) local_images: bool,
    pub(crate) publish_ports: bool,
    pub(crate) cleanup_images: bool,
    pub(crate) keep_step_artifacts: bool,

    /// Per-invocation scratch space, removed on drop.
    scratch: TempDir,

    /// Short token that keeps container and image names unique across
    /// concurrent builds on the same daemon.
    token: String,

    images: BTreeMap<String, StepImage>,
    artifact_dirs: BTreeMap<String, PathBuf>,
}

pub(crate) struct ContextOptions {
    pub(crate) build_dir: PathBuf,
    pub(crate) config: GlobalConfig,
    pub(crate) vcs: VcsInfo,
    pub(crate) build_number: Option<u64>,
    pub(crate) step_names: Vec<String>,
    pub(crate) push_enabled: bool,
    pub(crate) local_images: bool,
    pub(crate) publish_ports: bool,
    pub(crate) cleanup_images: bool,
    pub(crate) keep_step_artifacts: bool,
}

impl BuildContext {
    pub(crate) fn new(opts: ContextOptions) -> Result<Self> {
        let build_time = epoch_secs();
        let build_number = opts
            .build_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| build_time.to_string());
        let build_id = format!("{}-{}-{}", opts.vcs.name, build_number, build_time);
        let docker_tag = derive_docker_tag(&opts.vcs, build_time);
        let token = name_token(&build_id);

        let scratch = tempfile::Builder::new()
            .prefix("buildrunner-")
            .tempdir_in(opts.config.temp_root())
            .context("Unable to create the invocation scratch directory")?;
        restrict_permissions(scratch.path())?;

        let results_dir = opts.build_dir.join("buildrunner.results");

        Ok(Self {
            build_number,
            build_id,
            build_time,
            docker_tag,
            uid: invoking_uid(),
            gid: invoking_gid(),
            build_dir: opts.build_dir,
            results_dir,
            config: opts.config,
            vcs: opts.vcs,
            step_names: opts.step_names,
            env_overlay: env_overlay(),
            build_servers: BTreeMap::new(),
            local_files: BTreeMap::new(),
            push_enabled: opts.push_enabled,
            local_images: opts.local_images,
            publish_ports: opts.publish_ports,
            cleanup_images: opts.cleanup_images,
            keep_step_artifacts: opts.keep_step_artifacts,
            scratch,
            token,
            images: BTreeMap::new(),
            artifact_dirs: BTreeMap::new(),
        })
    }

    pub(crate) fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// Unique daemon-level name for a step resource.
    pub(crate) fn container_name(&self, step: &str, role: &str) -> String {
        format!(
            "buildrunner-{}-{}-{}",
            self.token,
            sanitize_name(step),
            role
        )
    }

    /// Record the image a step published. Called only after the step's
    /// commit/push stage succeeds.
    pub(crate) fn register_image(&mut self, step: &str, image: StepImage) {
        self.images.insert(step.to_string(), image);
    }

    pub(crate) fn produced_image(&self, step: &str) -> Option<&StepImage> {
        self.images.get(step)
    }

    pub(crate) fn images(&self) -> &BTreeMap<String, StepImage> {
        &self.images
    }

    /// Whether a reference points at an image produced earlier in this
    /// build, by step name or by published repository.
    pub(crate) fn is_local_reference(&self, reference: &str) -> bool {
        let repository = reference.rsplit_once(':').map_or(reference, |(repo, tag)| {
            // A colon inside the last path segment separates the tag; a
            // colon before a slash belongs to a registry port.
            if tag.contains('/') {
                reference
            } else {
                repo
            }
        });
        self.images.values().any(|image| {
            image.reference == reference
                || image
                    .reference
                    .rsplit_once(':')
                    .map(|(repo, _)| repo == repository)
                    .unwrap_or(false)
        }) || self.images.contains_key(repository)
    }

    /// Record a step's results subdirectory. Called only after artifact
    /// capture succeeds.
    pub(crate) fn register_artifacts(&mut self, step: &str, dir: PathBuf) {
        self.artifact_dirs.insert(step.to_string(), dir);
    }

    pub(crate) fn step_results_dir(&self, step: &str) -> PathBuf {
        self.results_dir.join(step)
    }

    /// The environment injected into every container of a step.
    pub(crate) fn injected_env(&self, step_name: &str, step_index: usize) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("BUILDRUNNER_BUILD_NUMBER".into(), self.build_number.clone());
        env.insert("BUILDRUNNER_BUILD_ID".into(), self.build_id.clone());
        env.insert(
            "BUILDRUNNER_BUILD_DOCKER_TAG".into(),
            self.docker_tag.clone(),
        );
        env.insert("BUILDRUNNER_BUILD_TIME".into(), self.build_time.to_string());
        env.insert("BUILDRUNNER_STEP_ID".into(), step_index.to_string());
        env.insert("BUILDRUNNER_STEP_NAME".into(), step_name.to_string());
        env.insert("BUILDRUNNER_INVOKING_UID".into(), self.uid.to_string());
        env.insert("BUILDRUNNER_INVOKING_GID".into(), self.gid.to_string());
        env.insert(
            "BUILDRUNNER_ARCH".into(),
            std::env::consts::ARCH.to_string(),
        );
        env.insert("BUILDRUNNER_STEPS".into(), self.step_names.join(" "));

        env.insert("VCSINFO_NAME".into(), self.vcs.name.clone());
        env.insert("VCSINFO_BRANCH".into(), self.vcs.branch.clone());
        env.insert("VCSINFO_NUMBER".into(), self.vcs.number.clone());
        env.insert("VCSINFO_ID".into(), self.vcs.id.clone());
        env.insert("VCSINFO_SHORT_ID".into(), self.vcs.short_id.clone());
        env.insert("VCSINFO_RELEASE".into(), self.vcs.release.clone());
        env.insert("VCSINFO_MODIFIED".into(), self.vcs.modified.clone());

        // The process environment overlay wins.
        for (key, value) in &self.env_overlay {
            env.insert(key.clone(), value.clone());
        }
        env
    }
}

/// Branch, short commit id, modified marker, and epoch seconds, sanitized
/// into a valid image tag.
fn derive_docker_tag(vcs: &VcsInfo, build_time: u64) -> String {
    let modified = if vcs.is_modified() { "-M" } else { "" };
    sanitize_tag(&format!(
        "{}-{}{}-{}",
        vcs.branch, vcs.short_id, modified, build_time
    ))
}

/// Replace characters docker tags reject and bound the length.
pub(crate) fn sanitize_tag(raw: &str) -> String {
    let mut tag: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while tag.starts_with(['.', '-']) {
        tag.remove(0);
    }
    tag.truncate(128);
    if tag.is_empty() {
        tag.push_str("latest");
    }
    tag
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn name_token(seed: &str) -> String {
    let mut d = Sha256::new();
    d.update(seed.as_bytes());
    let digest = hex::encode(d.finalize());
    digest[..12].to_string()
}

fn env_overlay() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_OVERLAY_PREFIX))
        .collect()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn invoking_uid() -> u32 {
    // Effective ids; getuid cannot fail.
    unsafe { libc::getuid() }
}

fn invoking_gid() -> u32 {
    unsafe { libc::getgid() }
}

fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o700);
    std::fs::set_permissions(path, perms).context(format!(
        "Unable to restrict permissions on '{}'",
        path.display()
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_context() -> BuildContext {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = GlobalConfig::default();
        config.temp_dir = Some(dir.path().to_path_buf());
        let ctx = BuildContext::new(ContextOptions {
            build_dir: dir.path().to_path_buf(),
            config,
            vcs: VcsInfo::fallback(dir.path()),
            build_number: Some(7),
            step_names: vec!["a".into(), "b".into()],
            push_enabled: false,
            local_images: false,
            publish_ports: false,
            cleanup_images: false,
            keep_step_artifacts: false,
        })
        .unwrap();
        // Keep the backing tempdir alive for the duration of the test.
        std::mem::forget(dir);
        ctx
    }

    #[test]
    fn sanitize_tag_rules() {
        assert_eq!(sanitize_tag("feature/login"), "feature-login");
        assert_eq!(sanitize_tag("-leading"), "leading");
        assert_eq!(sanitize_tag(""), "latest");
        let long = "x".repeat(200);
        assert_eq!(sanitize_tag(&long).len(), 128);
    }

    #[test]
    fn docker_tag_contains_branch_and_commit() {
        let vcs = VcsInfo::fallback("/tmp/widget");
        let tag = derive_docker_tag(&vcs, 1700000000);
        assert!(tag.contains("unknown"));
        assert!(tag.contains("0000000"));
        assert!(tag.ends_with("1700000000"));
    }

    #[test]
    fn injected_env_has_fixed_sets() {
        let ctx = test_context();
        let env = ctx.injected_env("compile", 1);
        assert_eq!(env["BUILDRUNNER_BUILD_NUMBER"], "7");
        assert_eq!(env["BUILDRUNNER_STEP_NAME"], "compile");
        assert_eq!(env["BUILDRUNNER_STEP_ID"], "1");
        assert_eq!(env["BUILDRUNNER_STEPS"], "a b");
        assert!(env.contains_key("VCSINFO_BRANCH"));
        assert!(env.contains_key("VCSINFO_SHORT_ID"));
    }

    #[test]
    fn image_registry_round_trip() {
        let mut ctx = test_context();
        assert!(ctx.produced_image("base").is_none());
        ctx.register_image(
            "base",
            StepImage {
                reference: "acme/base:build-1".into(),
                platforms: vec![],
            },
        );
        assert!(ctx.produced_image("base").is_some());
        assert!(ctx.is_local_reference("acme/base:build-1"));
        assert!(ctx.is_local_reference("acme/base:other"));
        assert!(ctx.is_local_reference("base"));
        assert!(!ctx.is_local_reference("debian:bookworm"));
    }

    #[test]
    fn container_names_are_scoped() {
        let ctx = test_context();
        let name = ctx.container_name("unit tests", "primary");
        assert!(name.starts_with("buildrunner-"));
        assert!(name.ends_with("unit-tests-primary"));
        assert_eq!(name, ctx.container_name("unit tests", "primary"));
    }
}
