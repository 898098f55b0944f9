use crate::cache::CacheStore;
use crate::config::GlobalConfig;
use crate::context::{BuildContext, ContextOptions};
use crate::errors::FailureKind;
use crate::manifest::Manifest;
use crate::scheduler;
use crate::session::BuildSession;
use anyhow::{Context, Result};
use clap::Parser;
use docker_cli_wrapper::{DockerCli, RuntimeClient};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use vcs_info::VcsInfo;

/// Run the steps of a build manifest.
#[derive(Debug, Parser)]
pub(crate) struct Build {
    /// Path to the build manifest.
    #[clap(short = 'f', long = "file", default_value = "buildrunner.yaml")]
    manifest: PathBuf,

    /// Path to the global config file. Defaults to ~/.buildrunner.toml when
    /// present.
    #[clap(short = 'c', long = "global-config")]
    global_config: Option<PathBuf>,

    /// Directory containing the project to build.
    #[clap(short = 'd', long = "directory", default_value = ".")]
    directory: PathBuf,

    /// Build number recorded in the build id. Defaults to the epoch time.
    #[clap(long = "build-number")]
    build_number: Option<u64>,

    /// Comma-separated subset of steps to run, plus their dependencies.
    #[clap(long = "steps", value_delimiter = ',')]
    steps: Option<Vec<String>>,

    /// Push committed images to their registries.
    #[clap(long = "push")]
    push: bool,

    /// Remove built images during the final teardown.
    #[clap(long = "cleanup-images")]
    cleanup_images: bool,

    /// Never pull images; use what the local daemon already has.
    #[clap(long = "local-images")]
    local_images: bool,

    /// Publish the primary container's configured ports on the host.
    #[clap(long = "publish-ports")]
    publish_ports: bool,

    /// Wipe the caches root before running.
    #[clap(long = "clean-cache")]
    clean_cache: bool,

    /// Keep results of steps that are not selected this run.
    #[clap(long = "keep-step-artifacts")]
    keep_step_artifacts: bool,

    /// Skip the image vulnerability scan.
    #[clap(long = "disable-security-scan")]
    disable_security_scan: bool,

    /// Scanner image override for the vulnerability scan.
    #[clap(long = "security-scan-image")]
    security_scan_image: Option<String>,
}

impl Build {
    pub(super) async fn run(&self) -> Result<()> {
        let config = GlobalConfig::load(self.global_config.as_deref())
            .context(FailureKind::Config)?;
        let manifest = Manifest::load(&self.manifest).context(FailureKind::Config)?;

        let order = scheduler::execution_order(&manifest, self.steps.as_deref())
            .context(FailureKind::Config)?;
        debug!("Execution order: [{}]", order.join(", "));

        let build_dir = self
            .directory
            .canonicalize()
            .context(format!(
                "Unable to resolve build directory '{}'",
                self.directory.display()
            ))
            .context(FailureKind::Config)?;

        let vcs = match VcsInfo::detect(&build_dir) {
            Ok(vcs) => vcs,
            Err(e) => {
                debug!("No usable source control information: {}", e);
                VcsInfo::fallback(&build_dir)
            }
        };

        let mut ctx = BuildContext::new(ContextOptions {
            build_dir,
            config,
            vcs,
            build_number: self.build_number,
            step_names: order.clone(),
            push_enabled: self.push,
            local_images: self.local_images,
            publish_ports: self.publish_ports,
            cleanup_images: self.cleanup_images,
            keep_step_artifacts: self.keep_step_artifacts,
        })?;

        // Project-level aliases extend the global config's pools.
        ctx.build_servers = ctx.config.build_servers.clone();
        ctx.build_servers
            .extend(manifest.build_servers.clone());
        ctx.local_files = ctx.config.local_files.clone();
        ctx.local_files.extend(manifest.local_files.clone());

        if self.clean_cache {
            let removed = CacheStore::new(ctx.config.caches_root())
                .wipe()
                .context("Unable to clean the cache")?;
            info!("Removed {} cache entries", removed);
        }

        if self.security_scan_image.is_some() && !self.disable_security_scan {
            // The scan itself is an external collaborator.
            warn!("No image vulnerability scanner is configured; images will not be scanned");
        }

        let runtime: Arc<dyn RuntimeClient> = Arc::new(
            DockerCli::from_environment()
                .context("A working docker client is required")
                .context(FailureKind::Config)?,
        );

        info!(
            "Starting build {} (docker tag {})",
            ctx.build_id, ctx.docker_tag
        );
        BuildSession::new(runtime, ctx, manifest, order).run().await
    }
}
