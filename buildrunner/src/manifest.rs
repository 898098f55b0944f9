/*!
The normalized build manifest.

Buildrunner receives the manifest fully materialized: templating, file
merging, and schema checks happen in the loader front-end, so the types
here deserialize plain YAML values and validate only the semantic rules
the engine depends on (unique references, dependency versions, coherent
commit/push configuration).
*/

use anyhow::{bail, ensure, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Default seconds to wait for a `wait_for` port to accept connections.
pub(crate) const DEFAULT_WAIT_FOR_TIMEOUT: u64 = 600;

/// Manifest versions below this cannot use `depends`.
const DEPENDS_MIN_VERSION: f64 = 2.0;

const SUPPORTED_COMPRESSION: [&str; 7] = ["gz", "bz2", "xz", "lzma", "lzip", "lzop", "z"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Manifest {
    pub(crate) version: Option<f64>,

    /// Remote build hosts declared by the project, merged over the global
    /// config's aliases.
    #[serde(rename = "build-servers", default)]
    pub(crate) build_servers: BTreeMap<String, String>,

    /// File aliases declared by the project, merged over the global
    /// config's aliases.
    #[serde(rename = "local-files", default)]
    pub(crate) local_files: BTreeMap<String, String>,

    pub(crate) steps: IndexMap<String, StepConfig>,
}

impl Manifest {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .context(format!("Unable to read manifest '{}'", path.display()))?;
        let manifest: Manifest = serde_yaml::from_str(&data).context(format!(
            "Unable to deserialize manifest '{}'",
            path.display()
        ))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub(crate) fn version(&self) -> f64 {
        self.version.unwrap_or(1.0)
    }

    /// Check the semantic rules the engine depends on. Violations are
    /// configuration errors: nothing has run yet.
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(!self.steps.is_empty(), "Manifest contains no steps");

        for (name, step) in &self.steps {
            if let Some(depends) = &step.depends {
                ensure!(
                    self.version() >= DEPENDS_MIN_VERSION,
                    "Step '{}' uses 'depends', which requires manifest version {} or later",
                    name,
                    DEPENDS_MIN_VERSION,
                );
                for dep in depends {
                    ensure!(
                        self.steps.contains_key(dep),
                        "Step '{}' depends on '{}', which is not defined",
                        name,
                        dep,
                    );
                }
            }

            if step.remote.is_some() {
                ensure!(
                    step.build.is_none()
                        && step.run.is_none()
                        && step.commit.is_none()
                        && step.push.is_none(),
                    "Step '{}' is remote and cannot also build, run, commit, or push",
                    name,
                );
                continue;
            }

            ensure!(
                step.build.is_some() || step.run.is_some(),
                "Step '{}' does nothing: it needs a build, run, or remote section",
                name,
            );

            if step.commit.is_some() || step.push.is_some() {
                let has_image_source = step.build.is_some()
                    || step
                        .run
                        .as_ref()
                        .map(|r| r.container.image.is_some())
                        .unwrap_or(false);
                ensure!(
                    has_image_source,
                    "Step '{}' commits or pushes but produces no image to commit",
                    name,
                );
            }

            for spec in step.commit_specs().iter().chain(step.push_specs().iter()) {
                ensure!(
                    spec.add_build_tag || !spec.tags.is_empty(),
                    "Step '{}' disables the build tag for '{}' without providing any tags",
                    name,
                    spec.repository,
                );
            }

            if let Some(build) = &step.build {
                let spec = build.spec();
                ensure!(
                    spec.import.is_some()
                        || spec.path.is_some()
                        || spec.dockerfile.is_some()
                        || !spec.inject.is_empty(),
                    "Step '{}' has an empty build section",
                    name,
                );
                if spec.platform.is_some() && !spec.platforms.is_empty() {
                    bail!(
                        "Step '{}' sets both 'platform' and 'platforms' in its build section",
                        name
                    );
                }
            }

            if let Some(run) = &step.run {
                for (service_name, service) in &run.services {
                    ensure!(
                        service.container.image.is_some() != service.build.is_some(),
                        "Service '{}' of step '{}' must set exactly one of 'image' or 'build'",
                        service_name,
                        name,
                    );
                    // volumes_from may only reference services declared earlier.
                    for source in &service.container.volumes_from {
                        let earlier = run
                            .services
                            .keys()
                            .take_while(|k| *k != service_name)
                            .any(|k| k == source);
                        ensure!(
                            earlier,
                            "Service '{}' of step '{}' takes volumes from '{}', \
                             which is not an earlier service",
                            service_name,
                            name,
                            source,
                        );
                    }
                }
                for source in &run.container.volumes_from {
                    ensure!(
                        run.services.contains_key(source),
                        "Step '{}' takes volumes from '{}', which is not a service",
                        name,
                        source,
                    );
                }
                validate_artifacts(name, &run.artifacts)?;
            }

            if let Some(remote) = &step.remote {
                validate_artifacts(name, &remote.artifacts)?;
            }
        }

        Ok(())
    }
}

fn validate_artifacts(
    step: &str,
    artifacts: &IndexMap<String, Option<ArtifactSpec>>,
) -> Result<()> {
    for (pattern, spec) in artifacts {
        let Some(spec) = spec else { continue };
        if let Some(compression) = &spec.compression {
            ensure!(
                SUPPORTED_COMPRESSION.contains(&compression.as_str()),
                "Step '{}' artifact '{}' uses unsupported compression '{}'",
                step,
                pattern,
                compression,
            );
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StepConfig {
    pub(crate) depends: Option<Vec<String>>,
    pub(crate) build: Option<BuildConfig>,
    pub(crate) run: Option<RunConfig>,
    pub(crate) commit: Option<ImageDest>,
    pub(crate) push: Option<ImageDest>,
    pub(crate) remote: Option<RemoteConfig>,
    #[serde(rename = "pypi-push")]
    pub(crate) pypi_push: Option<PypiPush>,
}

impl StepConfig {
    pub(crate) fn commit_specs(&self) -> Vec<ImageDestSpec> {
        self.commit.as_ref().map(ImageDest::normalize).unwrap_or_default()
    }

    pub(crate) fn push_specs(&self) -> Vec<ImageDestSpec> {
        self.push.as_ref().map(ImageDest::normalize).unwrap_or_default()
    }

    /// Repositories this step publishes, used for implicit dependency edges.
    pub(crate) fn produced_repositories(&self) -> Vec<String> {
        self.commit_specs()
            .into_iter()
            .chain(self.push_specs())
            .map(|spec| spec.repository)
            .collect()
    }

    /// Image references this step consumes, used for implicit dependency
    /// edges.
    pub(crate) fn referenced_images(&self) -> Vec<String> {
        let mut images = Vec::new();
        if let Some(run) = &self.run {
            if let Some(image) = &run.container.image {
                images.push(image.clone());
            }
            for service in run.services.values() {
                if let Some(image) = &service.container.image {
                    images.push(image.clone());
                }
            }
        }
        images
    }
}

/// The build section: a bare string is a context path.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum BuildConfig {
    Path(String),
    Spec(Box<BuildSpec>),
}

impl BuildConfig {
    pub(crate) fn spec(&self) -> BuildSpec {
        match self {
            BuildConfig::Path(path) => BuildSpec {
                path: Some(path.clone()),
                ..Default::default()
            },
            BuildConfig::Spec(spec) => (**spec).clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct BuildSpec {
    /// Directory whose tree seeds the build context.
    pub(crate) path: Option<String>,

    /// Dockerfile path, or inline content when the value contains a newline.
    pub(crate) dockerfile: Option<String>,

    /// Glob-to-destination file injections overlaid on `path`.
    pub(crate) inject: IndexMap<String, String>,

    #[serde(rename = "no-cache", alias = "no_cache")]
    pub(crate) no_cache: bool,

    pub(crate) cache_from: Vec<String>,
    pub(crate) cache_to: Vec<String>,

    /// Overrides the pull-policy default.
    pub(crate) pull: Option<bool>,

    pub(crate) platform: Option<String>,
    pub(crate) platforms: Vec<String>,

    pub(crate) buildargs: IndexMap<String, EnvValue>,

    /// Load this image archive verbatim instead of building.
    pub(crate) import: Option<String>,

    /// Dockerfile stage to build.
    pub(crate) target: Option<String>,
}

impl BuildSpec {
    pub(crate) fn is_multi_platform(&self) -> bool {
        !self.platforms.is_empty()
    }
}

/// Commit and push destinations accept a bare repository string, a spec, or
/// a list of either for multi-repository publishing.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ImageDest {
    Single(ImageDestEntry),
    Multi(Vec<ImageDestEntry>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ImageDestEntry {
    Repo(String),
    Spec(ImageDestSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ImageDestSpec {
    pub(crate) repository: String,

    #[serde(default)]
    pub(crate) tags: Vec<String>,

    #[serde(default = "default_true")]
    pub(crate) add_build_tag: bool,
}

impl ImageDest {
    pub(crate) fn normalize(&self) -> Vec<ImageDestSpec> {
        let entries: Vec<&ImageDestEntry> = match self {
            ImageDest::Single(entry) => vec![entry],
            ImageDest::Multi(entries) => entries.iter().collect(),
        };
        entries
            .into_iter()
            .map(|entry| match entry {
                ImageDestEntry::Repo(repository) => ImageDestSpec {
                    repository: repository.clone(),
                    tags: Vec::new(),
                    add_build_tag: true,
                },
                ImageDestEntry::Spec(spec) => spec.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RunConfig {
    #[serde(flatten)]
    pub(crate) container: ContainerConfig,

    #[serde(default)]
    pub(crate) services: IndexMap<String, ServiceConfig>,

    #[serde(default)]
    pub(crate) artifacts: IndexMap<String, Option<ArtifactSpec>>,

    /// Invert the success sense of the primary command.
    #[serde(default)]
    pub(crate) xfail: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ServiceConfig {
    #[serde(flatten)]
    pub(crate) container: ContainerConfig,

    /// Inline image build for this service; mutually exclusive with `image`.
    pub(crate) build: Option<BuildConfig>,
}

/// The per-container configuration surface shared by the primary container
/// and services.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ContainerConfig {
    pub(crate) image: Option<String>,

    pub(crate) cmd: Option<String>,
    pub(crate) cmds: Vec<String>,
    pub(crate) provisioners: Option<Provisioners>,

    /// Interpreter for override scripts.
    pub(crate) shell: Option<String>,

    /// Working directory inside the container.
    pub(crate) cwd: Option<String>,

    pub(crate) user: Option<String>,
    pub(crate) hostname: Option<String>,
    pub(crate) dns: Vec<String>,
    pub(crate) dns_search: Option<String>,

    /// Hostname to address entries added to the container.
    pub(crate) extra_hosts: BTreeMap<String, String>,

    pub(crate) env: IndexMap<String, EnvValue>,

    /// Local-file alias or relative source path to `<target>[:rw]`.
    pub(crate) files: IndexMap<String, String>,

    pub(crate) caches: IndexMap<String, CacheKeys>,

    /// Container to host port mappings, honored only with
    /// `--publish-ports`.
    pub(crate) ports: BTreeMap<u16, u16>,

    pub(crate) volumes_from: Vec<String>,

    #[serde(rename = "ssh-keys")]
    pub(crate) ssh_keys: Vec<String>,

    pub(crate) wait_for: Vec<WaitFor>,

    /// Run with systemd as init. When unset, inferred from the image's
    /// `BUILDRUNNER_SYSTEMD` label.
    pub(crate) systemd: Option<bool>,

    pub(crate) cap_add: Vec<String>,
    pub(crate) privileged: bool,
    pub(crate) platform: Option<String>,

    #[serde(rename = "inject-ssh-agent")]
    pub(crate) inject_ssh_agent: bool,

    /// Extra container names the command may create, registered for
    /// cleanup.
    pub(crate) containers: Vec<String>,

    /// Overrides the pull-policy default for `image`.
    pub(crate) pull: Option<bool>,
}

impl ContainerConfig {
    pub(crate) fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("/bin/sh")
    }

    pub(crate) fn cwd(&self) -> &str {
        self.cwd.as_deref().unwrap_or("/source")
    }

    pub(crate) fn has_command_override(&self) -> bool {
        self.cmd.is_some() || !self.cmds.is_empty() || self.provisioners.is_some()
    }

    /// Normalize the two accepted cache forms to target path to key list.
    pub(crate) fn normalized_caches(&self) -> IndexMap<String, Vec<String>> {
        self.caches
            .iter()
            .map(|(target, keys)| (target.clone(), keys.keys()))
            .collect()
    }
}

/// Environment and build-arg values may be YAML strings, numbers, or bools.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum EnvValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

impl Display for EnvValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::String(s) => write!(f, "{}", s),
            EnvValue::Number(n) => write!(f, "{}", n),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Cache keys accept a single string or an ordered list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum CacheKeys {
    One(String),
    Many(Vec<String>),
}

impl CacheKeys {
    pub(crate) fn keys(&self) -> Vec<String> {
        match self {
            CacheKeys::One(key) => vec![key.clone()],
            CacheKeys::Many(keys) => keys.clone(),
        }
    }
}

/// A readiness gate: a bare port, or a port with its own timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WaitFor {
    Port(u16),
    Spec { port: u16, timeout: Option<u64> },
}

impl WaitFor {
    pub(crate) fn port(&self) -> u16 {
        match self {
            WaitFor::Port(port) => *port,
            WaitFor::Spec { port, .. } => *port,
        }
    }

    pub(crate) fn timeout_secs(&self) -> u64 {
        match self {
            WaitFor::Port(_) => DEFAULT_WAIT_FOR_TIMEOUT,
            WaitFor::Spec { timeout, .. } => timeout.unwrap_or(DEFAULT_WAIT_FOR_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Provisioners {
    pub(crate) shell: Option<ShellProvisioner>,

    /// Inline salt state tree, applied with `salt-call --local`.
    pub(crate) salt: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ShellProvisioner {
    Path(String),
    Spec {
        path: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ArtifactSpec {
    pub(crate) format: Option<ArtifactFormat>,

    #[serde(rename = "type")]
    pub(crate) archive_type: Option<ArchiveType>,

    pub(crate) compression: Option<String>,

    pub(crate) rename: Option<String>,

    /// When false, the artifact is produced but omitted from the metadata
    /// sidecar.
    pub(crate) push: Option<bool>,

    /// Arbitrary metadata recorded in the sidecar.
    #[serde(flatten)]
    pub(crate) metadata: IndexMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ArtifactFormat {
    Archive,
    Uncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ArchiveType {
    Tar,
    Zip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RemoteConfig {
    /// A `build-servers` alias, or a literal `user@host`.
    pub(crate) host: String,

    pub(crate) cmd: String,

    #[serde(default)]
    pub(crate) artifacts: IndexMap<String, Option<ArtifactSpec>>,
}

/// Package-index upload request. Parsed and recorded, but delegated to the
/// external uploader contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum PypiPush {
    Repository(String),
    Spec {
        repository: String,
        username: Option<String>,
        password: Option<String>,
    },
}

impl PypiPush {
    pub(crate) fn repository(&self) -> &str {
        match self {
            PypiPush::Repository(repository) => repository,
            PypiPush::Spec { repository, .. } => repository,
        }
    }
}

fn default_true() -> bool {
    true
}
