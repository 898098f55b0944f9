/*!
Forwards selected SSH identities into containers.

A dedicated `ssh-agent` is started per workload, holding exactly the keys
the step requested by alias. Containers see only the agent's UNIX socket,
bind-mounted from a per-workload directory with 0700 permissions; private
key bytes stay on the host. The agent is killed and its socket directory
removed at step teardown.
*/

use crate::common;
use crate::config::SshKeyEntry;
use anyhow::{bail, Context, Result};
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Socket path inside containers; `SSH_AUTH_SOCK` points here.
pub(crate) const CONTAINER_SOCKET_DIR: &str = "/buildrunner-ssh";
pub(crate) const CONTAINER_SOCKET_PATH: &str = "/buildrunner-ssh/agent.sock";

#[derive(Debug)]
pub(crate) struct SshAgent {
    pub(crate) pid: u32,
    pub(crate) socket_dir: PathBuf,
    pub(crate) socket_path: PathBuf,
}

impl SshAgent {
    /// Start an agent holding the keys behind `aliases`.
    pub(crate) async fn start(
        aliases: &[String],
        pool: &BTreeMap<String, SshKeyEntry>,
        scratch: &Path,
        workload: &str,
    ) -> Result<Self> {
        let socket_dir = scratch.join(format!("ssh-{}", workload));
        std::fs::create_dir_all(&socket_dir).context(format!(
            "Unable to create agent socket directory '{}'",
            socket_dir.display()
        ))?;
        std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(0o700))
            .context("Unable to restrict the agent socket directory")?;
        let socket_path = socket_dir.join("agent.sock");

        let output = common::output(
            Command::new("ssh-agent")
                .arg("-a")
                .arg(&socket_path),
        )
        .await
        .context("Unable to start ssh-agent")?;
        let pid = parse_agent_pid(&String::from_utf8_lossy(&output))
            .context("ssh-agent did not report its pid")?;
        debug!("Started ssh-agent pid {} at '{}'", pid, socket_path.display());

        let agent = Self {
            pid,
            socket_dir,
            socket_path,
        };

        for alias in aliases {
            let Some(entry) = pool.get(alias) else {
                bail!("No SSH key configured for alias '{}'", alias);
            };
            agent.add_key(alias, entry).await?;
        }

        Ok(agent)
    }

    async fn add_key(&self, alias: &str, entry: &SshKeyEntry) -> Result<()> {
        let key_path = match (&entry.file, &entry.key) {
            (Some(file), _) => expand_home(file),
            (None, Some(material)) => {
                // Inline keys are written under the 0700 socket directory
                // and removed with it; they are never mounted.
                let path = self.socket_dir.join(format!("key-{}", alias));
                std::fs::write(&path, ensure_trailing_newline(material))
                    .context(format!("Unable to write key for alias '{}'", alias))?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                    .context("Unable to restrict key file permissions")?;
                path
            }
            (None, None) => bail!(
                "SSH key alias '{}' has neither a file nor inline key material",
                alias
            ),
        };

        let mut cmd = Command::new("ssh-add");
        cmd.arg(&key_path)
            .env("SSH_AUTH_SOCK", &self.socket_path);

        if let Some(password) = &entry.password {
            // A one-shot askpass helper keeps the passphrase out of the
            // command line and the logs.
            let askpass = self.socket_dir.join("askpass.sh");
            std::fs::write(&askpass, "#!/bin/sh\nprintf '%s' \"$BUILDRUNNER_KEY_PASSPHRASE\"\n")
                .context("Unable to write askpass helper")?;
            std::fs::set_permissions(&askpass, std::fs::Permissions::from_mode(0o700))
                .context("Unable to mark askpass helper executable")?;
            cmd.env("SSH_ASKPASS", &askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", ":0")
                .env("BUILDRUNNER_KEY_PASSPHRASE", password);
        } else if entry.prompt_password {
            // Leave stdio attached so ssh-add can prompt on the terminal.
            return common::exec(&mut cmd, false)
                .await
                .context(format!("Unable to add key for alias '{}'", alias));
        }

        common::exec(&mut cmd, true)
            .await
            .context(format!("Unable to add key for alias '{}'", alias))
    }
}

fn parse_agent_pid(output: &str) -> Option<u32> {
    let pattern = Regex::new(r"SSH_AGENT_PID=(\d+)").ok()?;
    pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn ensure_trailing_newline(material: &str) -> String {
    if material.ends_with('\n') {
        material.to_string()
    } else {
        format!("{}\n", material)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_pid_from_agent_output() {
        let output = "SSH_AUTH_SOCK=/tmp/x/agent.sock; export SSH_AUTH_SOCK;\n\
                      SSH_AGENT_PID=4242; export SSH_AGENT_PID;\n\
                      echo Agent pid 4242;\n";
        assert_eq!(parse_agent_pid(output), Some(4242));
        assert_eq!(parse_agent_pid("no agent here"), None);
    }

    #[test]
    fn trailing_newline_added_once() {
        assert_eq!(ensure_trailing_newline("KEY"), "KEY\n");
        assert_eq!(ensure_trailing_newline("KEY\n"), "KEY\n");
    }

    #[test]
    fn home_expansion() {
        let expanded = expand_home(Path::new("~/.ssh/id_ed25519"));
        assert!(!expanded.starts_with("~"));
        let absolute = expand_home(Path::new("/etc/key"));
        assert_eq!(absolute, PathBuf::from("/etc/key"));
    }
}
