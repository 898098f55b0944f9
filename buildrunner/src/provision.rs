/*!
Turns a container's `cmd`/`cmds`/`provisioners` configuration into the
shell invocation that overrides the image's default command, plus any
mounts the provisioners need.
*/

use crate::manifest::{ContainerConfig, ShellProvisioner};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Mount point for the rendered salt tree.
const SALT_MOUNT: &str = "/buildrunner-salt";

/// The name of the applied salt state.
const SALT_STATE: &str = "buildrunner";

#[derive(Debug, Default)]
pub(crate) struct ProvisionPlan {
    /// Commands executed in order by the configured shell.
    pub(crate) commands: Vec<String>,

    /// Extra (host path, container path, read-write) binds.
    pub(crate) mounts: Vec<(PathBuf, String, bool)>,
}

impl ProvisionPlan {
    /// The argv that replaces the image's default command.
    pub(crate) fn command_override(&self, shell: &str) -> Vec<String> {
        vec![
            shell.to_string(),
            "-ec".to_string(),
            self.commands.join("\n"),
        ]
    }
}

/// Build the override plan for a container, or `None` when the image's
/// default command should run unmodified.
pub(crate) fn plan(
    config: &ContainerConfig,
    scratch: &Path,
    role: &str,
) -> Result<Option<ProvisionPlan>> {
    if !config.has_command_override() {
        return Ok(None);
    }

    let mut plan = ProvisionPlan::default();
    if let Some(cmd) = &config.cmd {
        plan.commands.push(cmd.clone());
    }
    plan.commands.extend(config.cmds.iter().cloned());

    if let Some(provisioners) = &config.provisioners {
        if let Some(shell) = &provisioners.shell {
            plan.commands.push(shell_command(config.shell(), shell));
        }
        if let Some(states) = &provisioners.salt {
            let host_dir = render_salt_tree(states, scratch, role)?;
            plan.mounts
                .push((host_dir, SALT_MOUNT.to_string(), false));
            plan.commands.push(format!(
                "salt-call --local --config-dir {} state.apply {}",
                SALT_MOUNT, SALT_STATE
            ));
        }
    }

    Ok(Some(plan))
}

fn shell_command(shell: &str, provisioner: &ShellProvisioner) -> String {
    match provisioner {
        ShellProvisioner::Path(path) => format!("{} {}", shell, path),
        ShellProvisioner::Spec { path, args } => {
            if args.is_empty() {
                format!("{} {}", shell, path)
            } else {
                format!("{} {} {}", shell, path, shell_words::join(args))
            }
        }
    }
}

/// Write the inline state tree and a minimal minion config to the scratch
/// space so `salt-call --local` can apply it inside the container.
fn render_salt_tree(
    states: &serde_yaml::Value,
    scratch: &Path,
    role: &str,
) -> Result<PathBuf> {
    let root = scratch.join(format!("salt-{}", role));
    let states_dir = root.join("states");
    std::fs::create_dir_all(&states_dir).context(format!(
        "Unable to create salt state directory '{}'",
        states_dir.display()
    ))?;

    let minion = format!(
        "file_client: local\nfile_roots:\n  base:\n    - {}/states\n",
        SALT_MOUNT
    );
    std::fs::write(root.join("minion"), minion)
        .context("Unable to write the salt minion config")?;

    let top = format!("base:\n  '*':\n    - {}\n", SALT_STATE);
    std::fs::write(states_dir.join("top.sls"), top)
        .context("Unable to write the salt top file")?;

    let rendered =
        serde_yaml::to_string(states).context("Unable to render the inline salt states")?;
    std::fs::write(states_dir.join(format!("{}.sls", SALT_STATE)), rendered)
        .context("Unable to write the salt state file")?;

    Ok(root)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::RunConfig;

    fn run_config(yaml: &str) -> ContainerConfig {
        let run: RunConfig = serde_yaml::from_str(yaml).unwrap();
        run.container
    }

    #[test]
    fn no_override_without_commands() {
        let config = run_config("image: alpine");
        let scratch = tempfile::TempDir::new().unwrap();
        assert!(plan(&config, scratch.path(), "primary").unwrap().is_none());
    }

    #[test]
    fn cmd_then_cmds_in_order() {
        let config = run_config(
            r#"
            image: alpine
            cmd: make configure
            cmds:
              - make build
              - make test
        "#,
        );
        let scratch = tempfile::TempDir::new().unwrap();
        let plan = plan(&config, scratch.path(), "primary").unwrap().unwrap();
        assert_eq!(
            plan.commands,
            vec!["make configure", "make build", "make test"]
        );
        let argv = plan.command_override("/bin/bash");
        assert_eq!(argv[0], "/bin/bash");
        assert_eq!(argv[1], "-ec");
        assert_eq!(argv[2], "make configure\nmake build\nmake test");
    }

    #[test]
    fn shell_provisioner_with_args_is_quoted() {
        let config = run_config(
            r#"
            image: alpine
            provisioners:
              shell:
                path: scripts/setup.sh
                args: ["--flag", "a value"]
        "#,
        );
        let scratch = tempfile::TempDir::new().unwrap();
        let plan = plan(&config, scratch.path(), "primary").unwrap().unwrap();
        assert_eq!(
            plan.commands,
            vec!["/bin/sh scripts/setup.sh --flag 'a value'"]
        );
    }

    #[test]
    fn salt_provisioner_renders_tree_and_mount() {
        let config = run_config(
            r#"
            image: alpine
            provisioners:
              salt:
                httpd:
                  pkg.installed: []
        "#,
        );
        let scratch = tempfile::TempDir::new().unwrap();
        let plan = plan(&config, scratch.path(), "primary").unwrap().unwrap();

        assert_eq!(plan.mounts.len(), 1);
        let (host, container, rw) = &plan.mounts[0];
        assert_eq!(container, SALT_MOUNT);
        assert!(!rw);
        assert!(host.join("minion").is_file());
        assert!(host.join("states/top.sls").is_file());
        let state = std::fs::read_to_string(host.join("states/buildrunner.sls")).unwrap();
        assert!(state.contains("httpd"));
        assert!(plan.commands[0].contains("salt-call --local"));
    }
}
