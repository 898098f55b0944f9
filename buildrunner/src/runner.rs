/*!
Executes a single step.

A step moves through build, run, capture, commit, and push phases; any of
them may be absent, and a remote step replaces them all. Every phase
funnels errors to one failure path, and the step's cleanup stack is
unwound no matter how the step ends. Images are deferred to the session
stack so cross-step reuse works and `--cleanup-images` can reap them at
the end of the build.
*/

use crate::artifacts::{self, CaptureRequest};
use crate::cache::CacheStore;
use crate::cleanup::{CleanupAction, CleanupStack};
use crate::context::{sanitize_tag, BuildContext, StepImage};
use crate::image::{self, BuilderChooser, BuiltImage};
use crate::manifest::StepConfig;
use crate::remote::{self, RemoteRequest};
use crate::session::CancelFlag;
use crate::snapshot::SourceSnapshot;
use crate::workload::{self, WorkloadRequest};
use anyhow::{bail, Context, Result};
use docker_cli_wrapper::RuntimeClient;
use log::{info, warn};
use std::sync::Arc;

pub(crate) struct StepRunner<'a> {
    pub(crate) runtime: &'a Arc<dyn RuntimeClient>,
    pub(crate) ctx: &'a mut BuildContext,
    pub(crate) chooser: &'a dyn BuilderChooser,
    pub(crate) cache_store: &'a CacheStore,
    pub(crate) snapshot: Option<&'a SourceSnapshot>,
    pub(crate) cancel: &'a CancelFlag,
}

impl StepRunner<'_> {
    /// Drive the step to completion. The step's own resources are released
    /// before this returns; images are deferred to `session_cleanup`.
    pub(crate) async fn run_step(
        &mut self,
        name: &str,
        index: usize,
        step: &StepConfig,
        session_cleanup: &mut CleanupStack,
    ) -> Result<()> {
        let mut cleanup = CleanupStack::new();
        let result = self.execute(name, index, step, &mut cleanup).await;
        cleanup.defer_images(session_cleanup);
        cleanup.unwind(self.runtime.as_ref(), false).await;
        result
    }

    async fn execute(
        &mut self,
        name: &str,
        index: usize,
        step: &StepConfig,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        self.cancel.check()?;

        if let Some(remote_config) = &step.remote {
            remote::run(
                &RemoteRequest {
                    ctx: self.ctx,
                    step_name: name,
                    config: remote_config,
                    snapshot: self.snapshot,
                    cancel: self.cancel,
                },
                cleanup,
            )
            .await?;
            if !remote_config.artifacts.is_empty() {
                let results_dir = self.ctx.step_results_dir(name);
                self.ctx.register_artifacts(name, results_dir);
            }
            return Ok(());
        }

        let built = match &step.build {
            Some(build) => {
                self.cancel.check()?;
                info!("Step '{}': building", name);
                Some(
                    image::build_step_image(
                        self.runtime.as_ref(),
                        self.ctx,
                        self.chooser,
                        cleanup,
                        name,
                        &build.spec(),
                    )
                    .await?,
                )
            }
            None => None,
        };

        let mut ran = false;
        if let Some(run_config) = &step.run {
            self.cancel.check()?;
            let snapshot = self
                .snapshot
                .context("The source snapshot was not prepared for a run step")?;
            let result = workload::run(
                &WorkloadRequest {
                    runtime: self.runtime,
                    ctx: self.ctx,
                    chooser: self.chooser,
                    step_name: name,
                    step_index: index,
                    run: run_config,
                    build_image: built.as_ref(),
                    snapshot,
                    cancel: self.cancel,
                },
                cleanup,
                self.cache_store,
            )
            .await?;
            ran = true;

            let succeeded = (result.exit_code == 0) != run_config.xfail;
            if !succeeded {
                if run_config.xfail {
                    bail!(
                        "Step '{}' was expected to fail, but its command exited 0",
                        name
                    );
                }
                bail!(
                    "Step '{}' command failed with exit code {}",
                    name,
                    result.exit_code
                );
            }
            if run_config.xfail {
                info!(
                    "Step '{}': command failed as expected (exit code {})",
                    name, result.exit_code
                );
            }

            // Cache save failures degrade later builds but do not fail a
            // step that already succeeded.
            for (key, dir) in &result.caches_to_save {
                if let Err(e) = self.cache_store.save(key, dir) {
                    warn!("Step '{}': unable to save cache '{}': {}", name, key, e);
                }
            }

            if !run_config.artifacts.is_empty() {
                self.cancel.check()?;
                info!("Step '{}': capturing artifacts", name);
                let results_dir = self.ctx.step_results_dir(name);
                artifacts::capture(&CaptureRequest {
                    source_root: &snapshot.root,
                    container_cwd: run_config.container.cwd(),
                    results_dir: &results_dir,
                    artifacts: &run_config.artifacts,
                })?;
                self.ctx.register_artifacts(name, results_dir);
            }
        }

        self.commit_and_push(name, step, built, ran, cleanup).await?;

        if let Some(pypi) = &step.pypi_push {
            // Package-index upload is delegated to an external uploader;
            // the request is recorded in build.json.
            warn!(
                "Step '{}': no package index uploader is configured; skipping upload to '{}'",
                name,
                pypi.repository()
            );
        }

        Ok(())
    }

    async fn commit_and_push(
        &mut self,
        name: &str,
        step: &StepConfig,
        built: Option<BuiltImage>,
        ran: bool,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        let commit_specs = step.commit_specs();
        let push_specs = step.push_specs();

        if commit_specs.is_empty() && push_specs.is_empty() {
            // A pure-build step still gets the build tag locally under
            // --push, so later steps can reference it by name.
            if self.ctx.push_enabled && ran {
                return Ok(());
            }
            if let (true, Some(built)) = (self.ctx.push_enabled, &built) {
                let local = format!(
                    "{}:{}",
                    sanitize_tag(&name.to_lowercase()),
                    self.ctx.docker_tag
                );
                self.runtime
                    .tag(&built.reference, &local)
                    .await
                    .context(format!("Step '{}': unable to apply the build tag", name))?;
                cleanup.push(CleanupAction::Image {
                    reference: local.clone(),
                });
                self.ctx.register_image(
                    name,
                    StepImage {
                        reference: local,
                        platforms: built.platforms.clone(),
                    },
                );
            }
            return Ok(());
        }

        self.cancel.check()?;

        // The result image is the run container's final state when a run
        // happened, else the build stage's image.
        let source = if ran {
            let primary = self.ctx.container_name(name, "primary");
            let committed = format!(
                "buildrunner-{}-{}-commit:{}",
                self.ctx.token(),
                sanitize_tag(&name.to_lowercase()),
                self.ctx.docker_tag
            );
            self.runtime
                .commit_container(&primary, &committed)
                .await
                .context(format!("Step '{}': unable to commit the run container", name))?;
            cleanup.push(CleanupAction::Image {
                reference: committed.clone(),
            });
            BuiltImage::single(committed)
        } else {
            built.context(format!("Step '{}' has no image to commit", name))?
        };

        let mut registered = None;
        if !commit_specs.is_empty() {
            info!("Step '{}': committing", name);
            registered = image::publish(
                self.runtime.as_ref(),
                self.ctx,
                cleanup,
                name,
                &source,
                &commit_specs,
                false,
            )
            .await?;
        }
        if !push_specs.is_empty() {
            info!("Step '{}': tagging for push", name);
            let pushed = image::publish(
                self.runtime.as_ref(),
                self.ctx,
                cleanup,
                name,
                &source,
                &push_specs,
                self.ctx.push_enabled,
            )
            .await?;
            registered = pushed.or(registered);
        }

        // The cross-step registry is written only when the whole stage
        // succeeded.
        if let Some(image) = registered {
            self.ctx.register_image(name, image);
        }
        Ok(())
    }
}
