/*!
Image operations: build context staging, single and multi-platform
builds, pull policy, and the tag/push loop.

Multi-platform builds pick a buildx builder per platform from the
`platform-builders` mapping. When several builders serve one platform the
choice is uniformly random to spread load; the chooser is a trait so
tests can inject a deterministic one. When buildrunner itself runs inside
a container and no external build registry is configured, a short-lived
local registry container carries the intermediate per-platform manifests.
*/

use crate::cleanup::{CleanupAction, CleanupStack};
use crate::context::{sanitize_tag, BuildContext, StepImage};
use crate::manifest::{BuildSpec, ImageDestSpec};
use anyhow::{bail, ensure, Context, Result};
use docker_cli_wrapper::{BuildOptions, RuntimeClient};
use log::{debug, info, warn};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

/// Picks a buildx builder from the candidates configured for a platform.
pub(crate) trait BuilderChooser: Send + Sync {
    fn choose<'a>(&self, builders: &'a [String]) -> Option<&'a String>;
}

/// Uniformly random choice; the production chooser.
pub(crate) struct RandomChooser;

impl BuilderChooser for RandomChooser {
    fn choose<'a>(&self, builders: &'a [String]) -> Option<&'a String> {
        if builders.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..builders.len());
        builders.get(index)
    }
}

/// An image produced by a step's build stage (or commit).
#[derive(Debug, Clone)]
pub(crate) struct BuiltImage {
    /// Local reference, `repository:tag`.
    pub(crate) reference: String,

    /// Platforms covered by a multi-platform build; empty otherwise.
    pub(crate) platforms: Vec<String>,

    /// Per-platform references produced by a multi-platform build.
    pub(crate) platform_images: Vec<(String, String)>,
}

impl BuiltImage {
    pub(crate) fn single(reference: String) -> Self {
        Self {
            reference,
            platforms: Vec::new(),
            platform_images: Vec::new(),
        }
    }

    fn is_multi_platform(&self) -> bool {
        !self.platforms.is_empty()
    }
}

/// A staged build context on disk.
#[derive(Debug)]
pub(crate) struct StagedContext {
    pub(crate) dir: PathBuf,
    pub(crate) dockerfile: PathBuf,
    pub(crate) dockerfile_content: String,
}

/// Whether an image reference should be pulled before use.
pub(crate) fn should_pull(
    explicit: Option<bool>,
    reference_is_local: bool,
    local_images: bool,
) -> bool {
    if let Some(pull) = explicit {
        return pull;
    }
    if local_images {
        return false;
    }
    !reference_is_local
}

/// Run the build stage for a step.
pub(crate) async fn build_step_image(
    runtime: &dyn RuntimeClient,
    ctx: &BuildContext,
    chooser: &dyn BuilderChooser,
    cleanup: &mut CleanupStack,
    step: &str,
    spec: &BuildSpec,
) -> Result<BuiltImage> {
    if let Some(import) = &spec.import {
        // An imported archive is loaded verbatim; every other build field
        // is ignored.
        let archive = ctx.build_dir.join(import);
        let reference = runtime
            .load_archive(&archive)
            .await
            .context(format!("Unable to import image archive '{}'", import))?;
        info!("Step '{}': imported image '{}'", step, reference);
        return Ok(BuiltImage::single(reference));
    }

    let staged = stage_build_context(spec, &ctx.build_dir, ctx.scratch_dir(), step)?;
    cleanup.push(CleanupAction::Path {
        path: staged.dir.clone(),
    });

    let repository = format!(
        "buildrunner-{}-{}",
        ctx.token(),
        sanitize_tag(&step.to_lowercase())
    );
    let reference = format!("{}:{}", repository, ctx.docker_tag);

    // References already produced in this build default to "no pull".
    let base_is_local = dockerfile_references_local_image(&staged.dockerfile_content, ctx);
    let pull = should_pull(spec.pull, base_is_local, ctx.local_images);

    // Make cache_from references available locally when we can; a failed
    // pull just means the reference passes through to the daemon's cache.
    for cache_ref in &spec.cache_from {
        if should_pull(None, ctx.is_local_reference(cache_ref), ctx.local_images) {
            if let Err(e) = runtime.pull(cache_ref).await {
                debug!("cache_from '{}' not pullable: {}", cache_ref, e);
            }
        }
    }

    let build_args: Vec<(String, String)> = spec
        .buildargs
        .iter()
        .map(|(key, value)| (key.clone(), value.to_string()))
        .collect();

    if spec.is_multi_platform() && !ctx.config.disable_multi_platform {
        return build_multi_platform(
            runtime, ctx, chooser, cleanup, step, spec, &staged, &repository, build_args,
        )
        .await;
    }

    let platform = if spec.is_multi_platform() {
        // Multi-platform disabled by config; build the first platform only.
        warn!(
            "Step '{}': multi-platform builds are disabled, building {} only",
            step, spec.platforms[0]
        );
        Some(spec.platforms[0].clone())
    } else {
        spec.platform.clone()
    };

    runtime
        .build(&BuildOptions {
            context_dir: staged.dir.clone(),
            dockerfile: staged.dockerfile.clone(),
            tag: reference.clone(),
            build_args,
            target: spec.target.clone(),
            platform,
            builder: None,
            cache_from: spec.cache_from.clone(),
            cache_to: spec.cache_to.clone(),
            no_cache: spec.no_cache,
            pull,
            push: false,
        })
        .await
        .context(format!("Step '{}': image build failed", step))?;
    cleanup.push(CleanupAction::Image {
        reference: reference.clone(),
    });

    info!("Step '{}': built image '{}'", step, reference);
    Ok(BuiltImage::single(reference))
}

#[allow(clippy::too_many_arguments)]
async fn build_multi_platform(
    runtime: &dyn RuntimeClient,
    ctx: &BuildContext,
    chooser: &dyn BuilderChooser,
    cleanup: &mut CleanupStack,
    step: &str,
    spec: &BuildSpec,
    staged: &StagedContext,
    repository: &str,
    build_args: Vec<(String, String)>,
) -> Result<BuiltImage> {
    let registry = intermediate_registry(runtime, ctx, cleanup, step).await?;
    let mut platform_images = Vec::new();

    for platform in &spec.platforms {
        let builder = ctx
            .config
            .platform_builders
            .get(platform)
            .and_then(|candidates| chooser.choose(candidates))
            .cloned();

        let platform_tag = format!(
            "{}:{}-{}",
            repository,
            ctx.docker_tag,
            sanitize_tag(platform)
        );
        let (tag, push) = match &registry {
            Some(registry) => (format!("{}/{}", registry, platform_tag), true),
            None => (platform_tag, false),
        };

        runtime
            .build(&BuildOptions {
                context_dir: staged.dir.clone(),
                dockerfile: staged.dockerfile.clone(),
                tag: tag.clone(),
                build_args: build_args.clone(),
                target: spec.target.clone(),
                platform: Some(platform.clone()),
                builder,
                cache_from: spec.cache_from.clone(),
                cache_to: spec.cache_to.clone(),
                no_cache: spec.no_cache,
                pull: should_pull(spec.pull, false, ctx.local_images),
                push,
            })
            .await
            .context(format!(
                "Step '{}': image build failed for platform {}",
                step, platform
            ))?;
        if !push {
            cleanup.push(CleanupAction::Image {
                reference: tag.clone(),
            });
        }
        platform_images.push((platform.clone(), tag));
    }

    info!(
        "Step '{}': built image '{}:{}' for platforms [{}]",
        step,
        repository,
        ctx.docker_tag,
        spec.platforms.join(", ")
    );
    Ok(BuiltImage {
        reference: format!("{}:{}", repository, ctx.docker_tag),
        platforms: spec.platforms.clone(),
        platform_images,
    })
}

/// The registry used to exchange per-platform manifests: the configured
/// build registry, or a short-lived local registry container when running
/// inside a container ourselves, or none (build with `--load`).
async fn intermediate_registry(
    runtime: &dyn RuntimeClient,
    ctx: &BuildContext,
    cleanup: &mut CleanupStack,
    step: &str,
) -> Result<Option<String>> {
    if let Some(registry) = &ctx.config.build_registry {
        return Ok(Some(registry.clone()));
    }
    if !running_in_container() {
        return Ok(None);
    }

    let name = ctx.container_name(step, "registry");
    let port: u16 = rand::thread_rng().gen_range(20000..40000);
    runtime
        .run_detached(&[
            "--publish".to_string(),
            format!("127.0.0.1:{}:5000", port),
            "--name".to_string(),
            name.clone(),
            "registry:2".to_string(),
        ])
        .await
        .context("Unable to start the shadow registry container")?;
    cleanup.push(CleanupAction::Container { name });
    Ok(Some(format!("localhost:{}", port)))
}

fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Apply the tag/push loop of a commit or push section to a result image.
/// Returns the registry entry for the cross-step image registry; `None`
/// when no destination produced a tag.
pub(crate) async fn publish(
    runtime: &dyn RuntimeClient,
    ctx: &BuildContext,
    cleanup: &mut CleanupStack,
    step: &str,
    source: &BuiltImage,
    dests: &[ImageDestSpec],
    do_push: bool,
) -> Result<Option<StepImage>> {
    let mut first_reference: Option<String> = None;

    for dest in dests {
        let mut tags = Vec::new();
        if dest.add_build_tag {
            tags.push(ctx.docker_tag.clone());
        }
        tags.extend(dest.tags.iter().cloned());
        ensure!(
            !tags.is_empty(),
            "Step '{}': destination '{}' has no tags to apply",
            step,
            dest.repository
        );

        for tag in tags {
            let full = format!("{}:{}", dest.repository, tag);
            if source.is_multi_platform() {
                publish_manifest_list(runtime, source, &full, do_push).await?;
            } else {
                runtime
                    .tag(&source.reference, &full)
                    .await
                    .context(format!("Step '{}': unable to tag '{}'", step, full))?;
                if do_push {
                    runtime
                        .push(&full)
                        .await
                        .context(format!("Step '{}': unable to push '{}'", step, full))?;
                    info!("Step '{}': pushed '{}'", step, full);
                } else {
                    // Only unpushed tags are candidates for removal during
                    // the final teardown.
                    cleanup.push(CleanupAction::Image {
                        reference: full.clone(),
                    });
                    info!("Step '{}': tagged '{}'", step, full);
                }
            }
            first_reference.get_or_insert(full);
        }
    }

    Ok(first_reference.map(|reference| StepImage {
        reference,
        platforms: source.platforms.clone(),
    }))
}

/// Assemble one manifest list per destination tag from the per-platform
/// images of a multi-platform build.
async fn publish_manifest_list(
    runtime: &dyn RuntimeClient,
    source: &BuiltImage,
    dest: &str,
    do_push: bool,
) -> Result<()> {
    if !do_push {
        // Without a push there is no registry to hold a manifest list;
        // apply per-platform local tags for inspection instead.
        for (platform, image) in &source.platform_images {
            let local = format!("{}-{}", dest, sanitize_tag(platform));
            runtime
                .tag(image, &local)
                .await
                .context(format!("Unable to tag platform image '{}'", local))?;
        }
        return Ok(());
    }

    let mut pushed = Vec::new();
    for (platform, image) in &source.platform_images {
        let platform_dest = format!("{}-{}", dest, sanitize_tag(platform));
        runtime
            .tag(image, &platform_dest)
            .await
            .context(format!("Unable to tag platform image '{}'", platform_dest))?;
        runtime
            .push(&platform_dest)
            .await
            .context(format!("Unable to push platform image '{}'", platform_dest))?;
        pushed.push(platform_dest);
    }
    runtime
        .manifest_create(dest, &pushed)
        .await
        .context(format!("Unable to create manifest list '{}'", dest))?;
    runtime
        .manifest_push(dest)
        .await
        .context(format!("Unable to push manifest list '{}'", dest))?;
    info!("Pushed manifest list '{}'", dest);
    Ok(())
}

/// Assemble the build context: the optional `path` tree first, then the
/// injected files on top, then the Dockerfile.
pub(crate) fn stage_build_context(
    spec: &BuildSpec,
    build_dir: &Path,
    scratch: &Path,
    step: &str,
) -> Result<StagedContext> {
    let dir = scratch.join(format!("build-{}", sanitize_tag(step)));
    if dir.exists() {
        fs::remove_dir_all(&dir).context("Unable to reset the staged build context")?;
    }
    fs::create_dir_all(&dir).context(format!(
        "Unable to create build context '{}'",
        dir.display()
    ))?;

    if let Some(path) = &spec.path {
        let source = resolve_in_build_dir(build_dir, path)?;
        copy_tree(&source, &dir)?;
    }

    for (pattern, destination) in &spec.inject {
        inject_files(build_dir, &dir, pattern, destination)?;
    }

    let dockerfile = dir.join("Dockerfile");
    match &spec.dockerfile {
        Some(content) if content.contains('\n') => {
            fs::write(&dockerfile, content).context("Unable to write the inline Dockerfile")?;
        }
        Some(path) => {
            let source = resolve_in_build_dir(build_dir, path)?;
            fs::copy(&source, &dockerfile).context(format!(
                "Unable to copy Dockerfile from '{}'",
                source.display()
            ))?;
        }
        None => {
            ensure!(
                dockerfile.is_file(),
                "Step '{}': no Dockerfile found in the build context",
                step
            );
        }
    }

    let dockerfile_content = fs::read_to_string(&dockerfile)
        .context("Unable to read the staged Dockerfile")?;
    Ok(StagedContext {
        dir,
        dockerfile,
        dockerfile_content,
    })
}

/// Overlay files matching `pattern` at `destination` inside the context.
/// A destination is a directory when it ends in a separator or is `.`;
/// injected files override path files with the same destination.
fn inject_files(build_dir: &Path, context_dir: &Path, pattern: &str, destination: &str) -> Result<()> {
    let source_pattern = resolve_in_build_dir(build_dir, pattern)?;
    let hits: Vec<PathBuf> = glob::glob(&source_pattern.to_string_lossy())
        .context(format!("Invalid inject pattern '{}'", pattern))?
        .collect::<std::result::Result<_, _>>()
        .context(format!("Unable to expand inject pattern '{}'", pattern))?;
    ensure!(
        !hits.is_empty(),
        "Inject pattern '{}' matched no files",
        pattern
    );

    let is_directory = destination.ends_with('/')
        || destination.ends_with("/.")
        || destination == "."
        || hits.len() > 1;
    let destination = destination.trim_start_matches('/').trim_end_matches('.');
    let destination = destination.trim_end_matches('/');

    for hit in hits {
        let target = if is_directory {
            let name = hit
                .file_name()
                .context(format!("Inject source '{}' has no file name", hit.display()))?;
            if destination.is_empty() {
                context_dir.join(name)
            } else {
                context_dir.join(destination).join(name)
            }
        } else {
            context_dir.join(destination)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .context(format!("Unable to create '{}'", parent.display()))?;
        }
        if hit.is_dir() {
            copy_tree(&hit, &target)?;
        } else {
            fs::copy(&hit, &target).context(format!(
                "Unable to inject '{}' at '{}'",
                hit.display(),
                target.display()
            ))?;
        }
    }
    Ok(())
}

/// Resolve a project-relative path, rejecting escapes from the build
/// directory.
pub(crate) fn resolve_in_build_dir(build_dir: &Path, relative: &str) -> Result<PathBuf> {
    let mut depth: i32 = 0;
    for component in Path::new(relative).components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                ensure!(
                    depth >= 0,
                    "Path '{}' escapes the build directory",
                    relative
                );
            }
            std::path::Component::Normal(_) => depth += 1,
            std::path::Component::CurDir => {}
            _ => bail!("Path '{}' must be relative to the build directory", relative),
        }
    }
    Ok(build_dir.join(relative))
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    ensure!(
        source.is_dir(),
        "'{}' is not a directory",
        source.display()
    );
    for entry in walkdir::WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.context("Unable to walk the build context source")?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("Walked outside the build context source")?;
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
                "Unable to copy '{}' into the build context",
                entry.path().display()
            ))?;
        }
    }
    Ok(())
}

/// Whether any `FROM` reference in the Dockerfile resolves to an image
/// produced earlier in this build.
fn dockerfile_references_local_image(dockerfile: &str, ctx: &BuildContext) -> bool {
    dockerfile
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("FROM ").or_else(|| line.strip_prefix("from "))?;
            rest.split_whitespace().find(|token| !token.starts_with("--"))
        })
        .any(|reference| ctx.is_local_reference(reference))
}
