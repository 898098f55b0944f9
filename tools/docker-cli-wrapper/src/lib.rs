//! Container runtime client for buildrunner, implemented by shelling out to
//! the `docker` command line.
//!
//! The engine talks to the runtime exclusively through the [`RuntimeClient`]
//! trait so that tests can substitute a recording fake. The production
//! implementation, [`DockerCli`], honors `DOCKER_HOST`, `DOCKER_TLS_VERIFY`,
//! and `DOCKER_CERT_PATH` implicitly since those are consumed by the docker
//! binary itself.

use async_trait::async_trait;
use regex::Regex;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use which::which;

mod cli;

use cli::CommandLine;

pub type Result<T> = std::result::Result<T, error::Error>;

/// Options for a single `docker build` invocation.
#[derive(Debug, Default, Clone)]
pub struct BuildOptions {
    /// Directory sent to the daemon as the build context.
    pub context_dir: PathBuf,
    /// Path of the Dockerfile, normally inside the context.
    pub dockerfile: PathBuf,
    /// Tag applied to the built image.
    pub tag: String,
    /// `--build-arg` key/value pairs, in order.
    pub build_args: Vec<(String, String)>,
    /// Optional `--target` stage.
    pub target: Option<String>,
    /// Optional `--platform` value.
    pub platform: Option<String>,
    /// Optional buildx builder instance.
    pub builder: Option<String>,
    /// `--cache-from` references, in order.
    pub cache_from: Vec<String>,
    /// `--cache-to` references, in order.
    pub cache_to: Vec<String>,
    /// Disable the layer cache.
    pub no_cache: bool,
    /// Always attempt to pull newer versions of base images.
    pub pull: bool,
    /// Push the result to its registry instead of loading it locally.
    /// Only meaningful for buildx builds.
    pub push: bool,
}

impl BuildOptions {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.builder.is_some() || self.platform.is_some() {
            args.push("buildx".to_string());
        }
        args.push("build".to_string());
        if let Some(builder) = &self.builder {
            args.push(format!("--builder={}", builder));
        }
        if let Some(platform) = &self.platform {
            args.push(format!("--platform={}", platform));
        }
        args.push("--file".to_string());
        args.push(self.dockerfile.display().to_string());
        args.push("--tag".to_string());
        args.push(self.tag.clone());
        for (key, value) in &self.build_args {
            args.push(format!("--build-arg={}={}", key, value));
        }
        if let Some(target) = &self.target {
            args.push(format!("--target={}", target));
        }
        for reference in &self.cache_from {
            args.push(format!("--cache-from={}", reference));
        }
        for reference in &self.cache_to {
            args.push(format!("--cache-to={}", reference));
        }
        if self.no_cache {
            args.push("--no-cache".to_string());
        }
        if self.pull {
            args.push("--pull".to_string());
        }
        if self.push {
            args.push("--push".to_string());
        }
        args.push(self.context_dir.display().to_string());
        args
    }
}

/// The operations buildrunner needs from a container runtime.
#[async_trait]
pub trait RuntimeClient: Debug + Send + Sync + 'static {
    /// Build an image from a context directory.
    async fn build(&self, opts: &BuildOptions) -> Result<()>;
    /// Load an image archive, returning the loaded reference or digest.
    async fn load_archive(&self, path: &Path) -> Result<String>;
    /// Pull an image from its registry.
    async fn pull(&self, image: &str) -> Result<()>;
    /// Apply an additional tag to a local image.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;
    /// Upload a local tag to its registry.
    async fn push(&self, image: &str) -> Result<()>;
    /// Remove a local image, ignoring containers that still reference it.
    async fn remove_image(&self, image: &str) -> Result<()>;
    /// Whether an image is present in the local daemon.
    async fn image_exists(&self, image: &str) -> Result<bool>;
    /// Labels recorded in the image config, if the image is local.
    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>>;
    /// Create a container; `args` is everything after `create`.
    async fn create_container(&self, args: &[String]) -> Result<()>;
    /// Start a created container without attaching.
    async fn start_container(&self, name: &str) -> Result<()>;
    /// Block until a container exits and return its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64>;
    /// Follow a container's output to the user until it exits.
    async fn stream_logs(&self, name: &str) -> Result<()>;
    /// Commit a container's filesystem to a new image reference.
    async fn commit_container(&self, name: &str, image: &str) -> Result<()>;
    /// Force-remove a container. Not an error if it is already gone.
    async fn remove_container(&self, name: &str) -> Result<()>;
    /// Address of a container on its attached network.
    async fn container_ip(&self, name: &str) -> Result<String>;
    /// Copy a path out of a container to a local destination.
    async fn copy_out(&self, name: &str, src: &str, dest: &Path) -> Result<()>;
    /// Copy a local path into a container.
    async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> Result<()>;
    /// Create a bridge network.
    async fn create_network(&self, name: &str) -> Result<()>;
    /// Remove a network. Not an error if it is already gone.
    async fn remove_network(&self, name: &str) -> Result<()>;
    /// Run a detached container; `args` is everything after `run -d`.
    async fn run_detached(&self, args: &[String]) -> Result<()>;
    /// Create a manifest list from per-platform image references.
    async fn manifest_create(&self, list: &str, images: &[String]) -> Result<()>;
    /// Push a manifest list and remove the local copy.
    async fn manifest_push(&self, list: &str) -> Result<()>;
}

/// Production [`RuntimeClient`] backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    cli: CommandLine,
}

impl DockerCli {
    /// Locate `docker` in the search path.
    pub fn from_environment() -> Result<Self> {
        let path = which("docker").context(error::NotFoundSnafu { name: "docker" })?;
        Ok(Self {
            cli: CommandLine { path },
        })
    }
}

#[async_trait]
impl RuntimeClient for DockerCli {
    async fn build(&self, opts: &BuildOptions) -> Result<()> {
        let args = opts.to_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.cli
            .spawn(&args, format!("failed to build image '{}'", opts.tag))
            .await
    }

    async fn load_archive(&self, path: &Path) -> Result<String> {
        let input = format!("--input={}", path.display());
        let out = self
            .cli
            .output(
                &["load", &input],
                format!("could not load archive from {}", path.display()),
            )
            .await?;
        let out = String::from_utf8_lossy(&out);
        // `docker load` prints either `Loaded image: <ref>` or
        // `Loaded image ID: <digest>`.
        let loaded = Regex::new(r"Loaded image(?: ID)?:\s*(?<reference>\S+)")
            .context(error::RegexSnafu)?;
        let caps = loaded.captures(&out).context(error::NoLoadedImageSnafu)?;
        Ok(caps["reference"].to_string())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.cli
            .spawn(&["pull", image], format!("failed to pull image '{image}'"))
            .await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.cli
            .output(
                &["tag", source, target],
                format!("could not tag image '{source}' as '{target}'"),
            )
            .await?;
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<()> {
        self.cli
            .spawn(&["push", image], format!("failed to push image '{image}'"))
            .await
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.cli
            .output(
                &["rmi", "--force", image],
                format!("could not remove image '{image}'"),
            )
            .await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.cli
            .succeeds(
                &["image", "inspect", image],
                format!("could not inspect image '{image}'"),
            )
            .await
    }

    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        let bytes = self
            .cli
            .output(
                &[
                    "image",
                    "inspect",
                    image,
                    "--format",
                    "{{ json .Config.Labels }}",
                ],
                format!("could not fetch labels of image '{image}'"),
            )
            .await?;
        let labels: Option<HashMap<String, String>> =
            serde_json::from_slice(&bytes).context(error::InspectDeserializeSnafu)?;
        Ok(labels.unwrap_or_default())
    }

    async fn create_container(&self, args: &[String]) -> Result<()> {
        let mut full = vec!["create"];
        full.extend(args.iter().map(String::as_str));
        self.cli
            .output(&full, "could not create container".to_string())
            .await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.cli
            .output(
                &["start", name],
                format!("could not start container '{name}'"),
            )
            .await?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let out = self
            .cli
            .output(
                &["wait", name],
                format!("could not wait for container '{name}'"),
            )
            .await?;
        let text = String::from_utf8_lossy(&out);
        text.trim()
            .parse()
            .ok()
            .context(error::ExitCodeSnafu { name })
    }

    async fn stream_logs(&self, name: &str) -> Result<()> {
        self.cli
            .spawn(
                &["logs", "--follow", name],
                format!("could not stream logs of container '{name}'"),
            )
            .await
    }

    async fn commit_container(&self, name: &str, image: &str) -> Result<()> {
        self.cli
            .output(
                &["commit", name, image],
                format!("could not commit container '{name}' to '{image}'"),
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let removed = self
            .cli
            .succeeds(
                &["rm", "--force", "--volumes", name],
                format!("could not remove container '{name}'"),
            )
            .await?;
        if !removed {
            log::debug!("Container '{}' was already gone", name);
        }
        Ok(())
    }

    async fn container_ip(&self, name: &str) -> Result<String> {
        let bytes = self
            .cli
            .output(
                &[
                    "inspect",
                    "--format",
                    "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                    name,
                ],
                format!("could not inspect address of container '{name}'"),
            )
            .await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    async fn copy_out(&self, name: &str, src: &str, dest: &Path) -> Result<()> {
        let from = format!("{}:{}", name, src);
        let to = dest.display().to_string();
        self.cli
            .output(
                &["cp", &from, &to],
                format!("could not copy '{src}' out of container '{name}'"),
            )
            .await?;
        Ok(())
    }

    async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> Result<()> {
        let from = src.display().to_string();
        let to = format!("{}:{}", name, dest);
        self.cli
            .output(
                &["cp", &from, &to],
                format!("could not copy '{}' into container '{name}'", src.display()),
            )
            .await?;
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.cli
            .output(
                &["network", "create", name],
                format!("could not create network '{name}'"),
            )
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let removed = self
            .cli
            .succeeds(
                &["network", "rm", name],
                format!("could not remove network '{name}'"),
            )
            .await?;
        if !removed {
            log::debug!("Network '{}' was already gone", name);
        }
        Ok(())
    }

    async fn run_detached(&self, args: &[String]) -> Result<()> {
        let mut full = vec!["run", "--detach"];
        full.extend(args.iter().map(String::as_str));
        self.cli
            .output(&full, "could not run detached container".to_string())
            .await?;
        Ok(())
    }

    async fn manifest_create(&self, list: &str, images: &[String]) -> Result<()> {
        let mut args = vec!["manifest", "create", list];
        args.extend(images.iter().map(String::as_str));
        self.cli
            .output(&args, format!("could not create manifest list '{list}'"))
            .await?;
        Ok(())
    }

    async fn manifest_push(&self, list: &str) -> Result<()> {
        self.cli
            .output(
                &["manifest", "push", list],
                format!("could not push manifest list '{list}'"),
            )
            .await?;
        self.cli
            .output(
                &["manifest", "rm", list],
                format!("could not delete manifest list '{list}'"),
            )
            .await?;
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to execute docker, {message}: {source}"))]
        CommandFailed {
            message: String,
            source: std::io::Error,
        },

        #[snafu(display("Container '{}' reported a non-numeric exit code", name))]
        ExitCode { name: String },

        #[snafu(display("Failed to deserialize inspect output: {source}"))]
        InspectDeserialize { source: serde_json::Error },

        #[snafu(display("No image reference reported by `docker load`"))]
        NoLoadedImage,

        #[snafu(display(
            "Unable to find '{}' in the current environment: {}",
            name,
            source
        ))]
        NotFound { name: String, source: which::Error },

        #[snafu(display("Failed to run operation with docker: {message}\n command: {} {}", program.display(), args.join(" ")))]
        OperationFailed {
            message: String,
            program: PathBuf,
            args: Vec<String>,
        },

        #[snafu(display("Failed to compile output pattern: {source}"))]
        Regex { source: regex::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_args_single_platform() {
        let opts = BuildOptions {
            context_dir: PathBuf::from("/tmp/ctx"),
            dockerfile: PathBuf::from("/tmp/ctx/Dockerfile"),
            tag: "widget:latest".to_string(),
            build_args: vec![("A".to_string(), "1".to_string())],
            no_cache: true,
            pull: true,
            ..Default::default()
        };
        let args = opts.to_args();
        assert_eq!(args[0], "build");
        assert!(args.contains(&"--build-arg=A=1".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(args.contains(&"--pull".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/ctx");
    }

    #[test]
    fn build_args_buildx_platform() {
        let opts = BuildOptions {
            context_dir: PathBuf::from("."),
            dockerfile: PathBuf::from("Dockerfile"),
            tag: "widget:amd64".to_string(),
            platform: Some("linux/amd64".to_string()),
            builder: Some("b1".to_string()),
            push: true,
            ..Default::default()
        };
        let args = opts.to_args();
        assert_eq!(args[0], "buildx");
        assert_eq!(args[1], "build");
        assert!(args.contains(&"--builder=b1".to_string()));
        assert!(args.contains(&"--platform=linux/amd64".to_string()));
        assert!(args.contains(&"--push".to_string()));
    }
}
