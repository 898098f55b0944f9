/*!
Explicit, typed cleanup actions.

Every resource a step or the session creates is pushed onto a stack and
released in LIFO order. The stack is unwound unconditionally: on success,
failure, and cancellation. Failures during unwind are logged at warning
level and never promoted, so teardown cannot mask the build's primary
outcome.
*/

use crate::common;
use docker_cli_wrapper::RuntimeClient;
use log::{debug, warn};
use std::path::PathBuf;
use tokio::process::Command;

#[derive(Debug)]
pub(crate) enum CleanupAction {
    /// Force-remove a container, running or not.
    Container { name: String },

    /// Remove a built image. Honored only when `--cleanup-images` was
    /// given; otherwise images are left for inspection and reuse.
    Image { reference: String },

    /// Remove a workload network.
    Network { name: String },

    /// Kill an ssh-agent and remove its socket directory.
    SshAgent { pid: u32, socket_dir: PathBuf },

    /// Remove a file or directory created under the scratch space.
    Path { path: PathBuf },

    /// Remove a working directory on a remote build host.
    RemoteDir { target: String, path: String },
}

#[derive(Debug, Default)]
pub(crate) struct CleanupStack {
    actions: Vec<CleanupAction>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, action: CleanupAction) {
        debug!("Registered cleanup: {:?}", action);
        self.actions.push(action);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Move image actions onto the session stack. Images outlive their step
    /// for cross-step reuse; whether they are removed at the end is decided
    /// by `--cleanup-images` during the session unwind.
    pub(crate) fn defer_images(&mut self, session: &mut CleanupStack) {
        let mut kept = Vec::with_capacity(self.actions.len());
        for action in self.actions.drain(..) {
            match action {
                CleanupAction::Image { .. } => session.actions.push(action),
                other => kept.push(other),
            }
        }
        self.actions = kept;
    }

    /// Release everything, newest first. Never fails.
    pub(crate) async fn unwind(&mut self, runtime: &dyn RuntimeClient, remove_images: bool) {
        while let Some(action) = self.actions.pop() {
            match action {
                CleanupAction::Container { name } => {
                    if let Err(e) = runtime.remove_container(&name).await {
                        warn!("Unable to remove container '{}': {}", name, e);
                    }
                }
                CleanupAction::Image { reference } => {
                    if !remove_images {
                        debug!("Keeping image '{}'", reference);
                        continue;
                    }
                    if let Err(e) = runtime.remove_image(&reference).await {
                        warn!("Unable to remove image '{}': {}", reference, e);
                    }
                }
                CleanupAction::Network { name } => {
                    if let Err(e) = runtime.remove_network(&name).await {
                        warn!("Unable to remove network '{}': {}", name, e);
                    }
                }
                CleanupAction::SshAgent { pid, socket_dir } => {
                    // SIGTERM is what `ssh-agent -k` sends.
                    let killed = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                    if killed != 0 {
                        warn!("Unable to stop ssh-agent pid {}", pid);
                    }
                    if let Err(e) = std::fs::remove_dir_all(&socket_dir) {
                        warn!(
                            "Unable to remove agent socket directory '{}': {}",
                            socket_dir.display(),
                            e
                        );
                    }
                }
                CleanupAction::Path { path } => {
                    let result = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    if let Err(e) = result {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Unable to remove '{}': {}", path.display(), e);
                        }
                    }
                }
                CleanupAction::RemoteDir { target, path } => {
                    let result = common::exec(
                        Command::new("ssh")
                            .arg(&target)
                            .arg(format!("rm -rf {}", path)),
                        true,
                    )
                    .await;
                    if let Err(e) = result {
                        warn!(
                            "Unable to remove remote directory '{}' on {}: {}",
                            path, target, e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use async_trait::async_trait;
    use docker_cli_wrapper::{BuildOptions, Result as DockerResult};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records runtime calls in order so tests can assert LIFO unwinding.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingRuntime {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RuntimeClient for RecordingRuntime {
        async fn build(&self, opts: &BuildOptions) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("build {}", opts.tag));
            Ok(())
        }
        async fn load_archive(&self, path: &Path) -> DockerResult<String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("load {}", path.display()));
            Ok("loaded:latest".to_string())
        }
        async fn pull(&self, image: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("pull {image}"));
            Ok(())
        }
        async fn tag(&self, source: &str, target: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("tag {source} {target}"));
            Ok(())
        }
        async fn push(&self, image: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("push {image}"));
            Ok(())
        }
        async fn remove_image(&self, image: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("rmi {image}"));
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> DockerResult<bool> {
            Ok(false)
        }
        async fn image_labels(&self, _image: &str) -> DockerResult<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        async fn create_container(&self, args: &[String]) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {}", args.join(" ")));
            Ok(())
        }
        async fn start_container(&self, name: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("start {name}"));
            Ok(())
        }
        async fn wait_container(&self, name: &str) -> DockerResult<i64> {
            self.calls.lock().unwrap().push(format!("wait {name}"));
            Ok(0)
        }
        async fn stream_logs(&self, name: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("logs {name}"));
            Ok(())
        }
        async fn commit_container(&self, name: &str, image: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("commit {name} {image}"));
            Ok(())
        }
        async fn remove_container(&self, name: &str) -> DockerResult<()> {
            self.calls.lock().unwrap().push(format!("rm {name}"));
            Ok(())
        }
        async fn container_ip(&self, name: &str) -> DockerResult<String> {
            self.calls.lock().unwrap().push(format!("inspect ip {name}"));
            Ok("127.0.0.1".to_string())
        }
        async fn copy_out(&self, name: &str, src: &str, dest: &Path) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cp {name}:{src} {}", dest.display()));
            Ok(())
        }
        async fn copy_in(&self, name: &str, src: &Path, dest: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cp {} {name}:{dest}", src.display()));
            Ok(())
        }
        async fn create_network(&self, name: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("network create {name}"));
            Ok(())
        }
        async fn remove_network(&self, name: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("network rm {name}"));
            Ok(())
        }
        async fn run_detached(&self, args: &[String]) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("run -d {}", args.join(" ")));
            Ok(())
        }
        async fn manifest_create(&self, list: &str, images: &[String]) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("manifest create {list} {}", images.join(" ")));
            Ok(())
        }
        async fn manifest_push(&self, list: &str) -> DockerResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("manifest push {list}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn unwind_is_lifo() {
        let runtime = RecordingRuntime::default();
        let mut stack = CleanupStack::new();
        stack.push(CleanupAction::Network {
            name: "net".to_string(),
        });
        stack.push(CleanupAction::Container {
            name: "svc".to_string(),
        });
        stack.push(CleanupAction::Container {
            name: "primary".to_string(),
        });
        stack.unwind(&runtime, false).await;
        let calls = runtime.calls.lock().unwrap();
        assert_eq!(*calls, vec!["rm primary", "rm svc", "network rm net"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn images_kept_unless_requested() {
        let runtime = RecordingRuntime::default();
        let mut stack = CleanupStack::new();
        stack.push(CleanupAction::Image {
            reference: "kept:1".to_string(),
        });
        stack.unwind(&runtime, false).await;
        assert!(runtime.calls.lock().unwrap().is_empty());

        let mut stack = CleanupStack::new();
        stack.push(CleanupAction::Image {
            reference: "gone:1".to_string(),
        });
        stack.unwind(&runtime, true).await;
        assert_eq!(*runtime.calls.lock().unwrap(), vec!["rmi gone:1"]);
    }

    #[tokio::test]
    async fn path_cleanup_removes_files_and_dirs() {
        let runtime = RecordingRuntime::default();
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f");
        let subdir = dir.path().join("d");
        std::fs::write(&file, "x").unwrap();
        std::fs::create_dir(&subdir).unwrap();

        let mut stack = CleanupStack::new();
        stack.push(CleanupAction::Path { path: file.clone() });
        stack.push(CleanupAction::Path {
            path: subdir.clone(),
        });
        stack.unwind(&runtime, false).await;
        assert!(!file.exists());
        assert!(!subdir.exists());
    }
}
