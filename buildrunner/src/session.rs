/*!
Top-level orchestration of one build invocation.

The session walks the scheduled step order, delegating each step to the
runner, and stops scheduling at the first failed step. Cancellation is a
flag set from the signal handler and observed before each phase; teardown
runs in full on every exit path, and its failures never mask the build's
primary outcome.
*/

use crate::cache::CacheStore;
use crate::cleanup::CleanupStack;
use crate::context::BuildContext;
use crate::errors::FailureKind;
use crate::image::RandomChooser;
use crate::manifest::Manifest;
use crate::runner::StepRunner;
use crate::snapshot::SourceSnapshot;
use anyhow::{Context, Result};
use docker_cli_wrapper::RuntimeClient;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const BUILD_REPORT: &str = "build.json";

/// Set from the signal handler, observed before each phase transition and
/// inside blocking loops.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Watch for SIGINT and SIGTERM for the life of the process.
    pub(crate) fn install_signal_handler(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!("Unable to watch for SIGTERM: {}", e);
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            warn!("Cancellation requested; finishing teardown before exit");
            flag.set();
        });
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail the current phase when cancellation was requested.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow::Error::new(FailureKind::Cancelled));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Serialize)]
struct StepReport {
    status: StepStatus,
    #[serde(rename = "duration-seconds")]
    duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "pypi-push", skip_serializing_if = "Option::is_none")]
    pypi_push: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageReport {
    reference: String,
    platforms: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BuildReport {
    #[serde(rename = "build-id")]
    build_id: String,
    #[serde(rename = "build-number")]
    build_number: String,
    #[serde(rename = "docker-tag")]
    docker_tag: String,
    #[serde(rename = "build-time")]
    build_time: u64,
    #[serde(rename = "duration-seconds")]
    duration_seconds: u64,
    steps: BTreeMap<String, StepReport>,
    images: BTreeMap<String, ImageReport>,
}

pub(crate) struct BuildSession {
    runtime: Arc<dyn RuntimeClient>,
    ctx: BuildContext,
    manifest: Manifest,
    order: Vec<String>,
    cache_store: CacheStore,
    cancel: CancelFlag,
}

impl BuildSession {
    pub(crate) fn new(
        runtime: Arc<dyn RuntimeClient>,
        ctx: BuildContext,
        manifest: Manifest,
        order: Vec<String>,
    ) -> Self {
        let cache_store = CacheStore::new(ctx.config.caches_root());
        Self {
            runtime,
            ctx,
            manifest,
            order,
            cache_store,
            cancel: CancelFlag::new(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        self.prepare_results_dir()?;
        self.cancel.install_signal_handler();

        // The snapshot is built at most once per invocation and shared by
        // every step that runs containers.
        let needs_snapshot = self
            .order
            .iter()
            .any(|name| self.manifest.steps[name].run.is_some() || self.manifest.steps[name].remote.is_some());
        let snapshot = if needs_snapshot {
            info!("Capturing the source snapshot");
            Some(SourceSnapshot::create(
                &self.ctx.build_dir,
                self.ctx.scratch_dir(),
            )?)
        } else {
            None
        };

        let started = Instant::now();
        let mut session_cleanup = CleanupStack::new();
        let mut reports: BTreeMap<String, StepReport> = BTreeMap::new();
        let mut first_failure: Option<String> = None;
        let mut cancelled = false;

        for (index, name) in self.order.clone().iter().enumerate() {
            let step = self.manifest.steps[name].clone();

            if self.cancel.is_cancelled() {
                cancelled = true;
            }
            if cancelled || first_failure.is_some() {
                // First failure stops scheduling; the rest are skipped.
                reports.insert(
                    name.clone(),
                    StepReport {
                        status: StepStatus::Skipped,
                        duration_seconds: 0,
                        error: None,
                        pypi_push: step.pypi_push.as_ref().map(|p| p.repository().to_string()),
                    },
                );
                continue;
            }

            info!("=== Step '{}' ({}/{})", name, index + 1, self.order.len());
            let step_started = Instant::now();
            let mut runner = StepRunner {
                runtime: &self.runtime,
                ctx: &mut self.ctx,
                chooser: &RandomChooser,
                cache_store: &self.cache_store,
                snapshot: snapshot.as_ref(),
                cancel: &self.cancel,
            };
            let result = runner
                .run_step(name, index, &step, &mut session_cleanup)
                .await;
            let duration_seconds = step_started.elapsed().as_secs();

            let (status, error_text) = match result {
                Ok(()) => {
                    info!("Step '{}' succeeded in {}s", name, duration_seconds);
                    (StepStatus::Succeeded, None)
                }
                Err(e) => {
                    error!("Step '{}' failed: {:?}", name, e);
                    if self.cancel.is_cancelled() {
                        cancelled = true;
                    }
                    first_failure.get_or_insert_with(|| name.clone());
                    (StepStatus::Failed, Some(format!("{:#}", e)))
                }
            };
            reports.insert(
                name.clone(),
                StepReport {
                    status,
                    duration_seconds,
                    error: error_text,
                    pypi_push: step.pypi_push.as_ref().map(|p| p.repository().to_string()),
                },
            );
        }

        if let Err(e) = self.write_report(&reports, started.elapsed().as_secs()) {
            warn!("Unable to write the build report: {}", e);
        }

        // Global teardown always runs and never changes the outcome.
        session_cleanup
            .unwind(self.runtime.as_ref(), self.ctx.cleanup_images)
            .await;

        if cancelled {
            return Err(anyhow::Error::new(FailureKind::Cancelled));
        }
        if let Some(failed) = first_failure {
            return Err(anyhow::anyhow!("Step '{}' failed", failed))
                .context(FailureKind::Step);
        }
        info!(
            "Build {} finished; results in '{}'",
            self.ctx.build_id,
            self.ctx.results_dir.display()
        );
        Ok(())
    }

    /// The results directory starts empty unless `--keep-step-artifacts`
    /// preserves the subdirectories of steps not selected this run.
    fn prepare_results_dir(&self) -> Result<()> {
        let results = &self.ctx.results_dir;
        if results.exists() && !self.ctx.keep_step_artifacts {
            std::fs::remove_dir_all(results).context(format!(
                "Unable to reset results directory '{}'",
                results.display()
            ))?;
        }
        std::fs::create_dir_all(results).context(format!(
            "Unable to create results directory '{}'",
            results.display()
        ))?;
        if self.ctx.keep_step_artifacts {
            for name in &self.order {
                let step_dir = self.ctx.step_results_dir(name);
                if step_dir.exists() {
                    std::fs::remove_dir_all(&step_dir).context(format!(
                        "Unable to reset step results '{}'",
                        step_dir.display()
                    ))?;
                }
            }
        }
        Ok(())
    }

    fn write_report(
        &self,
        reports: &BTreeMap<String, StepReport>,
        duration_seconds: u64,
    ) -> Result<()> {
        let report = BuildReport {
            build_id: self.ctx.build_id.clone(),
            build_number: self.ctx.build_number.clone(),
            docker_tag: self.ctx.docker_tag.clone(),
            build_time: self.ctx.build_time,
            duration_seconds,
            steps: reports
                .iter()
                .map(|(name, report)| {
                    (
                        name.clone(),
                        StepReport {
                            status: report.status,
                            duration_seconds: report.duration_seconds,
                            error: report.error.clone(),
                            pypi_push: report.pypi_push.clone(),
                        },
                    )
                })
                .collect(),
            images: self
                .ctx
                .images()
                .iter()
                .map(|(step, image)| {
                    (
                        step.clone(),
                        ImageReport {
                            reference: image.reference.clone(),
                            platforms: image.platforms.clone(),
                        },
                    )
                })
                .collect(),
        };
        let path = self.ctx.results_dir.join(BUILD_REPORT);
        let json = serde_json::to_string_pretty(&report)
            .context("Unable to serialize the build report")?;
        std::fs::write(&path, json)
            .context(format!("Unable to write '{}'", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::context::ContextOptions;
    use crate::scheduler;
    use vcs_info::VcsInfo;

    use crate::cleanup::test::RecordingRuntime;

    fn session_for(yaml: &str) -> (BuildSession, Arc<RecordingRuntime>, tempfile::TempDir) {
        session_with_push(yaml, false)
    }

    fn session_with_push(
        yaml: &str,
        push_enabled: bool,
    ) -> (BuildSession, Arc<RecordingRuntime>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        manifest.validate().unwrap();
        let order = scheduler::execution_order(&manifest, None).unwrap();
        let mut config = GlobalConfig::default();
        config.temp_dir = Some(dir.path().to_path_buf());
        config.caches_root = Some(dir.path().join("caches"));
        let ctx = BuildContext::new(ContextOptions {
            build_dir: dir.path().to_path_buf(),
            config,
            vcs: VcsInfo::fallback(dir.path()),
            build_number: Some(1),
            step_names: order.clone(),
            push_enabled,
            local_images: false,
            publish_ports: false,
            cleanup_images: false,
            keep_step_artifacts: false,
        })
        .unwrap();
        let runtime = Arc::new(RecordingRuntime::default());
        let session = BuildSession::new(
            Arc::clone(&runtime) as Arc<dyn RuntimeClient>,
            ctx,
            manifest,
            order,
        );
        (session, runtime, dir)
    }

    #[tokio::test]
    async fn build_only_session_writes_report() {
        let (session, _runtime, dir) = session_for(
            r#"
            steps:
              s1:
                build:
                  dockerfile: "FROM scratch\nCMD [\"/x\"]\n"
        "#,
        );
        session.run().await.unwrap();

        let report_path = dir.path().join("buildrunner.results").join(BUILD_REPORT);
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
        assert_eq!(report["steps"]["s1"]["status"], "succeeded");
        assert!(report["build-id"].as_str().unwrap().contains("-1-"));
    }

    #[tokio::test]
    async fn cancelled_session_reports_cancellation() {
        let (session, _runtime, _dir) = session_for(
            r#"
            steps:
              s1:
                build:
                  dockerfile: "FROM scratch\nCMD [\"/x\"]\n"
        "#,
        );
        session.cancel.set();
        let err = session.run().await.unwrap_err();
        assert_eq!(crate::errors::exit_code(&err), 130);
    }

    #[tokio::test]
    async fn xfail_step_fails_when_command_succeeds() {
        // The recording runtime reports exit code 0, so an xfail step must
        // fail the build.
        let (session, _runtime, dir) = session_for(
            r#"
            steps:
              expects-failure:
                run:
                  image: alpine
                  cmd: "exit 3"
                  xfail: true
        "#,
        );
        let err = session.run().await.unwrap_err();
        assert_eq!(crate::errors::exit_code(&err), 1);

        let report_path = dir.path().join("buildrunner.results").join(BUILD_REPORT);
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
        assert_eq!(report["steps"]["expects-failure"]["status"], "failed");
        assert!(report["steps"]["expects-failure"]["error"]
            .as_str()
            .unwrap()
            .contains("expected to fail"));
    }

    #[tokio::test]
    async fn failure_skips_downstream_steps() {
        let (session, _runtime, dir) = session_for(
            r#"
            version: 2.0
            steps:
              first:
                run:
                  image: alpine
                  cmd: "true"
                  xfail: true
              second:
                depends: [first]
                run:
                  image: alpine
                  cmd: "true"
        "#,
        );
        let err = session.run().await.unwrap_err();
        assert_eq!(crate::errors::exit_code(&err), 1);

        let report_path = dir.path().join("buildrunner.results").join(BUILD_REPORT);
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
        assert_eq!(report["steps"]["first"]["status"], "failed");
        assert_eq!(report["steps"]["second"]["status"], "skipped");
    }

    #[tokio::test]
    async fn push_uploads_the_build_tag() {
        let yaml = r#"
            steps:
              s1:
                build:
                  dockerfile: "FROM scratch\nCMD [\"/x\"]\n"
                push: myrepo/img
        "#;

        // Without --push the tag exists locally only.
        let (session, runtime, _dir) = session_with_push(yaml, false);
        let expected_tag = format!("myrepo/img:{}", session.ctx.docker_tag);
        session.run().await.unwrap();
        {
            let calls = runtime.calls.lock().unwrap();
            assert!(calls.iter().any(|c| c.ends_with(&expected_tag) && c.starts_with("tag ")));
            assert!(!calls.contains(&format!("push {}", expected_tag)));
        }

        // With --push the same tag is uploaded.
        let (session, runtime, _dir) = session_with_push(yaml, true);
        let expected_tag = format!("myrepo/img:{}", session.ctx.docker_tag);
        session.run().await.unwrap();
        let calls = runtime.calls.lock().unwrap();
        assert!(calls.contains(&format!("push {}", expected_tag)));
    }

    #[tokio::test]
    async fn run_step_commits_the_container_before_publishing() {
        let (session, runtime, _dir) = session_for(
            r#"
            steps:
              assemble:
                run:
                  image: alpine
                  cmd: "make dist"
                commit: acme/assembled
        "#,
        );
        session.run().await.unwrap();
        let calls = runtime.calls.lock().unwrap();
        let committed = calls.iter().position(|c| c.starts_with("commit "));
        let tagged = calls
            .iter()
            .position(|c| c.starts_with("tag ") && c.contains("acme/assembled:"));
        assert!(committed.is_some(), "expected a commit call: {calls:?}");
        assert!(tagged.is_some(), "expected a tag call: {calls:?}");
        assert!(committed < tagged);
    }
}
