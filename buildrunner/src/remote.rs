/*!
Delegates a step to a remote SSH host.

The snapshot is uploaded with rsync into a per-step working directory,
the command runs over ssh with its output streamed, and artifact globs
are fetched back and run through the archiver for metadata. The remote
directory is removed at teardown.
*/

use crate::artifacts::{self, CaptureRequest};
use crate::cleanup::{CleanupAction, CleanupStack};
use crate::common;
use crate::context::{sanitize_tag, BuildContext};
use crate::manifest::RemoteConfig;
use crate::session::CancelFlag;
use crate::snapshot::SourceSnapshot;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use tokio::process::Command;

pub(crate) struct RemoteRequest<'a> {
    pub(crate) ctx: &'a BuildContext,
    pub(crate) step_name: &'a str,
    pub(crate) config: &'a RemoteConfig,
    pub(crate) snapshot: Option<&'a SourceSnapshot>,
    pub(crate) cancel: &'a CancelFlag,
}

/// Run the remote stage to completion, capturing artifacts on success.
pub(crate) async fn run(request: &RemoteRequest<'_>, cleanup: &mut CleanupStack) -> Result<()> {
    let ctx = request.ctx;
    let step = request.step_name;

    // Aliases first, then the literal user@host.
    let target = ctx
        .build_servers
        .get(&request.config.host)
        .cloned()
        .unwrap_or_else(|| ctx.config.resolve_build_server(&request.config.host));

    let workdir = format!(
        "buildrunner-{}-{}",
        ctx.token(),
        sanitize_tag(step)
    );

    common::exec(
        Command::new("ssh")
            .arg(&target)
            .arg(format!("mkdir -p {}", workdir)),
        true,
    )
    .await
    .context(format!(
        "Step '{}': unable to create '{}' on {}",
        step, workdir, target
    ))?;
    cleanup.push(CleanupAction::RemoteDir {
        target: target.clone(),
        path: workdir.clone(),
    });

    if let Some(snapshot) = request.snapshot {
        request.cancel.check()?;
        debug!("Step '{}': uploading source to {}", step, target);
        common::exec(
            Command::new("rsync")
                .arg("-a")
                .arg("--delete")
                .arg(format!("{}/", snapshot.root.display()))
                .arg(format!("{}:{}/", target, workdir)),
            true,
        )
        .await
        .context(format!("Step '{}': unable to upload source to {}", step, target))?;
    }

    request.cancel.check()?;
    info!("Step '{}': running on {}", step, target);
    let exit_code = common::exec_status(
        Command::new("ssh")
            .arg(&target)
            .arg(format!("cd {} && {}", workdir, request.config.cmd)),
    )
    .await
    .context(format!("Step '{}': unable to run the remote command", step))?;
    if exit_code != 0 {
        bail!(
            "Step '{}': remote command failed on {} with exit code {}",
            step,
            target,
            exit_code
        );
    }

    if !request.config.artifacts.is_empty() {
        request.cancel.check()?;
        let fetch_dir = ctx
            .scratch_dir()
            .join(format!("remote-{}", sanitize_tag(step)));
        std::fs::create_dir_all(&fetch_dir)
            .context("Unable to create the remote fetch directory")?;

        for pattern in request.config.artifacts.keys() {
            // `/./` anchors rsync's --relative so the fetched tree mirrors
            // the remote working directory.
            common::exec(
                Command::new("rsync")
                    .arg("-a")
                    .arg("--relative")
                    .arg(format!("{}:{}/./{}", target, workdir, pattern))
                    .arg(format!("{}/", fetch_dir.display())),
                true,
            )
            .await
            .context(format!(
                "Step '{}': unable to fetch artifact '{}' from {}",
                step, pattern, target
            ))?;
        }

        let results_dir = ctx.step_results_dir(step);
        artifacts::capture(&CaptureRequest {
            source_root: &fetch_dir,
            container_cwd: "/source",
            results_dir: &results_dir,
            artifacts: &request.config.artifacts,
        })?;
    }

    Ok(())
}
