use anyhow::{ensure, Context, Result};
use log::debug;
use tokio::process::Command;

/// Run a `tokio::process::Command` and return a `Result` letting us know whether or not it worked.
/// `quiet` determines whether or not the command output will be piped to `stdout/stderr`. When
/// `quiet=true`, no output will be shown.
pub(crate) async fn exec(cmd: &mut Command, quiet: bool) -> Result<()> {
    debug!("Running: {:?}", cmd);
    if quiet {
        // For quiet levels of logging we capture stdout and stderr
        let output = cmd.output().await.context("Unable to start command")?;
        ensure!(
            output.status.success(),
            "Command was unsuccessful, exit code {}:\n{}\n{}",
            output.status.code().unwrap_or(1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    } else {
        // For less quiet log levels we stream to stdout and stderr.
        let status = cmd.status().await.context("Unable to start command")?;

        ensure!(
            status.success(),
            "Command was unsuccessful, exit code {}",
            status.code().unwrap_or(1),
        );
    }
    Ok(())
}

/// Run a command with inherited stdio and hand back its exit code instead of
/// treating a non-zero status as an error. Used where the exit code carries
/// meaning, e.g. remote step commands.
pub(crate) async fn exec_status(cmd: &mut Command) -> Result<i32> {
    debug!("Running: {:?}", cmd);
    let status = cmd.status().await.context("Unable to start command")?;
    Ok(status.code().unwrap_or(1))
}

/// Run a command quietly and capture stdout.
pub(crate) async fn output(cmd: &mut Command) -> Result<Vec<u8>> {
    debug!("Running: {:?}", cmd);
    let output = cmd.output().await.context("Unable to start command")?;
    ensure!(
        output.status.success(),
        "Command was unsuccessful, exit code {}:\n{}\n{}",
        output.status.code().unwrap_or(1),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(output.stdout)
}
