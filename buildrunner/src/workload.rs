/*!
Assembles the per-step container graph: linked services in declaration
order, then the primary container, all on a private network.

Services must be observable before the primary starts, so each service
with a `wait_for` list is polled until its ports accept connections.
Every container, the network, and all supporting mounts are registered on
the step's cleanup stack as they are created, so teardown is complete on
any exit path.
*/

use crate::cache::CacheStore;
use crate::cleanup::{CleanupAction, CleanupStack};
use crate::context::BuildContext;
use crate::image::{self, BuilderChooser, BuiltImage};
use crate::manifest::{ContainerConfig, RunConfig, WaitFor};
use crate::provision;
use crate::session::CancelFlag;
use crate::snapshot::SourceSnapshot;
use crate::sshagent::{self, SshAgent};
use anyhow::{bail, ensure, Context, Result};
use docker_cli_wrapper::RuntimeClient;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Label applied to every container so stray resources can be traced back
/// to their build.
const BUILD_LABEL: &str = "buildrunner.build-id";

/// Image label that switches a container to systemd mode.
const SYSTEMD_LABEL: &str = "BUILDRUNNER_SYSTEMD";

const WAIT_FOR_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const WAIT_FOR_MAX_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct WorkloadRequest<'a> {
    pub(crate) runtime: &'a Arc<dyn RuntimeClient>,
    pub(crate) ctx: &'a BuildContext,
    pub(crate) chooser: &'a dyn BuilderChooser,
    pub(crate) step_name: &'a str,
    pub(crate) step_index: usize,
    pub(crate) run: &'a RunConfig,
    pub(crate) build_image: Option<&'a BuiltImage>,
    pub(crate) snapshot: &'a SourceSnapshot,
    pub(crate) cancel: &'a CancelFlag,
}

/// What the step runner needs to know after the primary exits.
pub(crate) struct WorkloadResult {
    pub(crate) exit_code: i64,

    /// Primary cache target directories to save back, as (first key, host
    /// directory) pairs.
    pub(crate) caches_to_save: Vec<(String, PathBuf)>,
}

/// Provision the workload, run the primary to completion, and return its
/// exit status. All resources are registered on `cleanup`.
pub(crate) async fn run(
    request: &WorkloadRequest<'_>,
    cleanup: &mut CleanupStack,
    cache_store: &CacheStore,
) -> Result<WorkloadResult> {
    let ctx = request.ctx;
    let runtime = request.runtime.as_ref();
    let step = request.step_name;

    let network = ctx.container_name(step, "net");
    runtime
        .create_network(&network)
        .await
        .context(format!("Step '{}': unable to create network", step))?;
    cleanup.push(CleanupAction::Network {
        name: network.clone(),
    });

    let agent = start_agent_if_needed(request, cleanup).await?;

    // Service name to container name, for volumes_from resolution.
    let mut name_table: BTreeMap<String, String> = BTreeMap::new();

    for (position, (service_name, service)) in request.run.services.iter().enumerate() {
        request.cancel.check()?;
        let container_name = ctx.container_name(step, &format!("svc-{}", service_name));
        name_table.insert(service_name.clone(), container_name.clone());

        let image = match &service.build {
            Some(build) => {
                let spec = build.spec();
                let built = image::build_step_image(
                    runtime,
                    ctx,
                    request.chooser,
                    cleanup,
                    &format!("{}-{}", step, service_name),
                    &spec,
                )
                .await?;
                built.reference
            }
            None => {
                let image = service.container.image.clone().context(format!(
                    "Service '{}' of step '{}' has no image",
                    service_name, step
                ))?;
                ensure_image_available(runtime, ctx, &image, service.container.pull).await?;
                image
            }
        };

        let mut args = base_container_args(
            request,
            &service.container,
            container_name.clone(),
            image,
            &network,
        )?;
        args.network_aliases.push(service_name.clone());
        args.hostname
            .get_or_insert_with(|| service_name.clone());
        // Services see the snapshot read-only.
        args.binds
            .push((request.snapshot.root.clone(), "/source".to_string(), false));
        if service.container.inject_ssh_agent {
            attach_agent(&mut args, &agent, step, service_name)?;
        }
        restore_caches(
            cache_store,
            ctx,
            &service.container,
            &mut args,
            &format!("{}-svc-{}", step, position),
        )?;
        resolve_volumes_from(&mut args, &service.container, &name_table)?;

        runtime
            .create_container(&args.to_create_args())
            .await
            .context(format!(
                "Step '{}': unable to create service '{}'",
                step, service_name
            ))?;
        cleanup.push(CleanupAction::Container {
            name: container_name.clone(),
        });
        register_extra_containers(cleanup, &service.container);

        runtime
            .start_container(&container_name)
            .await
            .context(format!(
                "Step '{}': unable to start service '{}'",
                step, service_name
            ))?;
        info!("Step '{}': service '{}' started", step, service_name);

        wait_for_ports(
            runtime,
            &container_name,
            service_name,
            &service.container.wait_for,
            request.cancel,
        )
        .await?;
    }

    request.cancel.check()?;
    run_primary(request, cleanup, cache_store, &network, &name_table, agent).await
}

async fn run_primary(
    request: &WorkloadRequest<'_>,
    cleanup: &mut CleanupStack,
    cache_store: &CacheStore,
    network: &str,
    name_table: &BTreeMap<String, String>,
    agent: Option<SshAgent>,
) -> Result<WorkloadResult> {
    let ctx = request.ctx;
    let runtime = request.runtime.as_ref();
    let step = request.step_name;
    let config = &request.run.container;

    let image = match (request.build_image, &config.image) {
        (Some(built), _) => built.reference.clone(),
        (None, Some(image)) => {
            ensure_image_available(runtime, ctx, image, config.pull).await?;
            image.clone()
        }
        (None, None) => bail!("Step '{}' has neither a build image nor a run image", step),
    };

    let container_name = ctx.container_name(step, "primary");
    let mut args = base_container_args(
        request,
        config,
        container_name.clone(),
        image.clone(),
        network,
    )?;

    // The primary owns the snapshot read-write and sees prior results.
    args.binds
        .push((request.snapshot.root.clone(), "/source".to_string(), true));

    if let Some(agent) = &agent {
        args.binds.push((
            agent.socket_dir.clone(),
            sshagent::CONTAINER_SOCKET_DIR.to_string(),
            true,
        ));
        args.env.push((
            "SSH_AUTH_SOCK".to_string(),
            sshagent::CONTAINER_SOCKET_PATH.to_string(),
        ));
    }

    if ctx.publish_ports {
        for (container_port, host_port) in &config.ports {
            args.ports.push((*host_port, *container_port));
        }
    }

    args.systemd = match config.systemd {
        Some(explicit) => explicit,
        None => runtime
            .image_labels(&image)
            .await
            .map(|labels| labels.contains_key(SYSTEMD_LABEL))
            .unwrap_or(false),
    };

    let caches_to_save = restore_caches(
        cache_store,
        ctx,
        config,
        &mut args,
        &format!("{}-primary", step),
    )?;
    resolve_volumes_from(&mut args, config, name_table)?;

    if let Some(plan) = provision::plan(config, ctx.scratch_dir(), &container_name)? {
        for mount in &plan.mounts {
            args.binds.push(mount.clone());
        }
        args.command = Some(plan.command_override(config.shell()));
    }

    runtime
        .create_container(&args.to_create_args())
        .await
        .context(format!("Step '{}': unable to create the primary container", step))?;
    cleanup.push(CleanupAction::Container {
        name: container_name.clone(),
    });
    register_extra_containers(cleanup, config);

    request.cancel.check()?;
    runtime
        .start_container(&container_name)
        .await
        .context(format!("Step '{}': unable to start the primary container", step))?;
    info!("Step '{}': running", step);

    // Stream output while waiting for the exit status; the log follower
    // terminates on its own when the container exits, and we join it before
    // moving on.
    let log_task = tokio::spawn({
        let runtime = Arc::clone(request.runtime);
        let name = container_name.clone();
        async move { runtime.stream_logs(&name).await }
    });
    let exit_code = runtime
        .wait_container(&container_name)
        .await
        .context(format!("Step '{}': unable to wait for the primary container", step))?;
    match log_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Log stream for '{}' ended with: {}", container_name, e),
        Err(e) => warn!("Log stream task for '{}' panicked: {}", container_name, e),
    }

    Ok(WorkloadResult {
        exit_code,
        caches_to_save,
    })
}

async fn start_agent_if_needed(
    request: &WorkloadRequest<'_>,
    cleanup: &mut CleanupStack,
) -> Result<Option<SshAgent>> {
    let aliases = &request.run.container.ssh_keys;
    if aliases.is_empty() {
        return Ok(None);
    }
    let pool = request.ctx.config.ssh_key_pool();
    let agent = SshAgent::start(
        aliases,
        &pool,
        request.ctx.scratch_dir(),
        &request.ctx.container_name(request.step_name, "agent"),
    )
    .await?;
    cleanup.push(CleanupAction::SshAgent {
        pid: agent.pid,
        socket_dir: agent.socket_dir.clone(),
    });
    Ok(Some(agent))
}

fn attach_agent(
    args: &mut ContainerArgs,
    agent: &Option<SshAgent>,
    step: &str,
    service: &str,
) -> Result<()> {
    let Some(agent) = agent else {
        bail!(
            "Service '{}' of step '{}' requests the SSH agent, but the step has no ssh-keys",
            service,
            step
        );
    };
    args.binds.push((
        agent.socket_dir.clone(),
        sshagent::CONTAINER_SOCKET_DIR.to_string(),
        true,
    ));
    args.env.push((
        "SSH_AUTH_SOCK".to_string(),
        sshagent::CONTAINER_SOCKET_PATH.to_string(),
    ));
    Ok(())
}

/// Configuration shared by services and the primary container.
fn base_container_args(
    request: &WorkloadRequest<'_>,
    config: &ContainerConfig,
    name: String,
    image: String,
    network: &str,
) -> Result<ContainerArgs> {
    let ctx = request.ctx;
    let mut args = ContainerArgs {
        name,
        image,
        network: Some(network.to_string()),
        workdir: Some(config.cwd().to_string()),
        ..Default::default()
    };

    args.labels
        .push((BUILD_LABEL.to_string(), ctx.build_id.clone()));

    for (key, value) in ctx.injected_env(request.step_name, request.step_index) {
        args.env.push((key, value));
    }
    for (key, value) in &config.env {
        args.env.push((key.clone(), value.to_string()));
    }

    args.hostname = config.hostname.clone();
    args.user = config.user.clone();
    args.dns = config.dns.clone();
    args.dns_search = config.dns_search.clone();
    for (host, address) in &config.extra_hosts {
        args.extra_hosts.push((host.clone(), address.clone()));
    }
    args.cap_add = config.cap_add.clone();
    args.privileged = config.privileged;
    args.platform = config.platform.clone();

    // Results from completed steps, read-only.
    args.binds
        .push((ctx.results_dir.clone(), "/artifacts".to_string(), false));

    for (source, target) in &config.files {
        args.binds.push(resolve_file_mount(ctx, source, target)?);
    }

    Ok(args)
}

/// Map a `files` entry to a bind mount. The source is a local-file alias
/// (possibly inline content), or a path relative to the build directory.
fn resolve_file_mount(
    ctx: &BuildContext,
    source: &str,
    target: &str,
) -> Result<(PathBuf, String, bool)> {
    let (container_path, read_write) = match target.rsplit_once(':') {
        Some((path, "rw")) => (path.to_string(), true),
        Some((path, "ro")) => (path.to_string(), false),
        _ => (target.to_string(), false),
    };

    let host_path = match ctx.local_files.get(source) {
        Some(value) if value.contains('\n') => {
            // Inline content; materialize it under the scratch space.
            let path = ctx.scratch_dir().join(format!("file-{}", crate::context::sanitize_tag(source)));
            if !path.exists() {
                std::fs::write(&path, value)
                    .context(format!("Unable to write inline file alias '{}'", source))?;
            }
            path
        }
        Some(value) => PathBuf::from(value),
        None => image::resolve_in_build_dir(&ctx.build_dir, source)?,
    };

    Ok((host_path, container_path, read_write))
}

/// Restore each configured cache into a host directory and bind it at the
/// target path. Returns the (first key, host dir) pairs for saving after a
/// successful run.
fn restore_caches(
    cache_store: &CacheStore,
    ctx: &BuildContext,
    config: &ContainerConfig,
    args: &mut ContainerArgs,
    scope: &str,
) -> Result<Vec<(String, PathBuf)>> {
    let mut to_save = Vec::new();
    for (position, (target, keys)) in config.normalized_caches().iter().enumerate() {
        ensure!(
            !keys.is_empty(),
            "Cache for '{}' has no keys",
            target
        );
        let host_dir = ctx
            .scratch_dir()
            .join(format!("cache-{}-{}", crate::context::sanitize_tag(scope), position));
        cache_store.restore(keys, &host_dir)?;
        args.binds.push((host_dir.clone(), target.clone(), true));
        to_save.push((keys[0].clone(), host_dir));
    }
    Ok(to_save)
}

fn resolve_volumes_from(
    args: &mut ContainerArgs,
    config: &ContainerConfig,
    name_table: &BTreeMap<String, String>,
) -> Result<()> {
    for service in &config.volumes_from {
        let container = name_table
            .get(service)
            .context(format!("volumes_from references unknown service '{}'", service))?;
        args.volumes_from.push(container.clone());
    }
    Ok(())
}

fn register_extra_containers(cleanup: &mut CleanupStack, config: &ContainerConfig) {
    for name in &config.containers {
        cleanup.push(CleanupAction::Container { name: name.clone() });
    }
}

/// Pull an image when the pull policy says so, honoring the configured
/// registry mirror for images that need fetching.
async fn ensure_image_available(
    runtime: &dyn RuntimeClient,
    ctx: &BuildContext,
    image: &str,
    explicit_pull: Option<bool>,
) -> Result<()> {
    let pull = image::should_pull(explicit_pull, ctx.is_local_reference(image), ctx.local_images);
    if !pull {
        debug!("Using local image '{}'", image);
        return Ok(());
    }
    match &ctx.config.docker_registry {
        Some(mirror) if !image.contains('/') => {
            let mirrored = format!("{}/{}", mirror, image);
            runtime
                .pull(&mirrored)
                .await
                .context(format!("Unable to pull '{}'", mirrored))?;
            runtime
                .tag(&mirrored, image)
                .await
                .context(format!("Unable to tag mirrored image as '{}'", image))?;
        }
        _ => {
            runtime
                .pull(image)
                .await
                .context(format!("Unable to pull '{}'", image))?;
        }
    }
    Ok(())
}

/// Poll each `wait_for` port until it accepts a connection, with
/// exponential backoff capped at one second. A timeout is a fatal step
/// error naming the port.
async fn wait_for_ports(
    runtime: &dyn RuntimeClient,
    container: &str,
    service: &str,
    waits: &[WaitFor],
    cancel: &CancelFlag,
) -> Result<()> {
    if waits.is_empty() {
        return Ok(());
    }
    let ip = runtime
        .container_ip(container)
        .await
        .context(format!("Unable to resolve the address of '{}'", container))?;
    ensure!(
        !ip.is_empty(),
        "Container '{}' has no address on the workload network",
        container
    );

    for wait in waits {
        let port = wait.port();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait.timeout_secs());
        let mut backoff = WAIT_FOR_INITIAL_BACKOFF;
        debug!(
            "Waiting up to {}s for {}:{}",
            wait.timeout_secs(),
            service,
            port
        );
        loop {
            cancel.check()?;
            let attempt = tokio::time::timeout(
                WAIT_FOR_MAX_BACKOFF,
                TcpStream::connect((ip.as_str(), port)),
            )
            .await;
            if matches!(attempt, Ok(Ok(_))) {
                debug!("Service '{}' is accepting connections on {}", service, port);
                break;
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                bail!(
                    "Timed out waiting for service '{}' to accept connections on port {}",
                    service,
                    port
                );
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, WAIT_FOR_MAX_BACKOFF);
        }
    }
    Ok(())
}

/// Everything needed to compose a `docker create` invocation. Kept as data
/// so argument assembly is testable without a daemon.
#[derive(Debug, Default)]
pub(crate) struct ContainerArgs {
    pub(crate) name: String,
    pub(crate) image: String,
    pub(crate) network: Option<String>,
    pub(crate) network_aliases: Vec<String>,
    pub(crate) hostname: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) workdir: Option<String>,
    pub(crate) env: Vec<(String, String)>,
    /// (host path, container path, read-write)
    pub(crate) binds: Vec<(PathBuf, String, bool)>,
    /// (host port, container port)
    pub(crate) ports: Vec<(u16, u16)>,
    pub(crate) dns: Vec<String>,
    pub(crate) dns_search: Option<String>,
    pub(crate) extra_hosts: Vec<(String, String)>,
    pub(crate) volumes_from: Vec<String>,
    pub(crate) cap_add: Vec<String>,
    pub(crate) privileged: bool,
    pub(crate) platform: Option<String>,
    pub(crate) systemd: bool,
    pub(crate) labels: Vec<(String, String)>,
    pub(crate) command: Option<Vec<String>>,
}

impl ContainerArgs {
    /// The arguments following `docker create`.
    pub(crate) fn to_create_args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.name.clone()];
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for alias in &self.network_aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if let Some(hostname) = &self.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if let Some(user) = &self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(workdir) = &self.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (host, container, read_write) in &self.binds {
            args.push("--volume".to_string());
            let suffix = if *read_write { "" } else { ":ro" };
            args.push(format!("{}:{}{}", host.display(), container, suffix));
        }
        for (host, container) in &self.ports {
            args.push("--publish".to_string());
            args.push(format!("{}:{}", host, container));
        }
        for dns in &self.dns {
            args.push("--dns".to_string());
            args.push(dns.clone());
        }
        if let Some(search) = &self.dns_search {
            args.push("--dns-search".to_string());
            args.push(search.clone());
        }
        for (host, address) in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(format!("{}:{}", host, address));
        }
        for container in &self.volumes_from {
            args.push("--volumes-from".to_string());
            args.push(container.clone());
        }
        for cap in &self.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(platform) = &self.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        if self.systemd {
            // Requirements for running systemd as the init process.
            args.push("--security-opt".to_string());
            args.push("seccomp=unconfined".to_string());
            args.push("--volume".to_string());
            args.push("/sys/fs/cgroup:/sys/fs/cgroup:ro".to_string());
            args.push("--tmpfs".to_string());
            args.push("/run".to_string());
            args.push("--tmpfs".to_string());
            args.push("/run/lock".to_string());
        }
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        if let Some(command) = &self.command {
            args.extend(command.iter().cloned());
        }
        args
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_args_basic_shape() {
        let args = ContainerArgs {
            name: "c1".to_string(),
            image: "alpine:3".to_string(),
            network: Some("net1".to_string()),
            workdir: Some("/source".to_string()),
            env: vec![("A".to_string(), "1".to_string())],
            binds: vec![
                (PathBuf::from("/host/src"), "/source".to_string(), true),
                (PathBuf::from("/host/results"), "/artifacts".to_string(), false),
            ],
            command: Some(vec![
                "/bin/sh".to_string(),
                "-ec".to_string(),
                "make test".to_string(),
            ]),
            ..Default::default()
        };
        let rendered = args.to_create_args();
        assert_eq!(rendered[0], "--name");
        assert_eq!(rendered[1], "c1");
        assert!(rendered.contains(&"--network".to_string()));
        assert!(rendered.contains(&"/host/src:/source".to_string()));
        assert!(rendered.contains(&"/host/results:/artifacts:ro".to_string()));
        // The image comes before the command override.
        let image_at = rendered.iter().position(|a| a == "alpine:3").unwrap();
        assert_eq!(rendered[image_at + 1], "/bin/sh");
        assert_eq!(rendered.last().unwrap(), "make test");
    }

    #[test]
    fn create_args_systemd_flags() {
        let args = ContainerArgs {
            name: "c1".to_string(),
            image: "systemd-image".to_string(),
            systemd: true,
            ..Default::default()
        };
        let rendered = args.to_create_args();
        assert!(rendered.contains(&"seccomp=unconfined".to_string()));
        assert!(rendered.contains(&"/sys/fs/cgroup:/sys/fs/cgroup:ro".to_string()));
        assert!(rendered.contains(&"/run/lock".to_string()));
    }

    #[test]
    fn create_args_ports_and_hosts() {
        let args = ContainerArgs {
            name: "c1".to_string(),
            image: "img".to_string(),
            ports: vec![(8080, 80)],
            extra_hosts: vec![("db".to_string(), "10.0.0.2".to_string())],
            volumes_from: vec!["svc-db".to_string()],
            privileged: true,
            ..Default::default()
        };
        let rendered = args.to_create_args();
        assert!(rendered.contains(&"8080:80".to_string()));
        assert!(rendered.contains(&"db:10.0.0.2".to_string()));
        assert!(rendered.contains(&"--volumes-from".to_string()));
        assert!(rendered.contains(&"--privileged".to_string()));
    }
}
