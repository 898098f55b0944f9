use snafu::{ensure, ResultExt};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::{error, Result};

#[derive(Debug, Clone)]
pub(crate) struct CommandLine {
    pub(crate) path: PathBuf,
}

impl CommandLine {
    /// Run and capture stdout, failing when the command exits non-zero.
    pub(crate) async fn output(&self, args: &[&str], error_msg: String) -> Result<Vec<u8>> {
        let output = Command::new(&self.path)
            .args(args)
            .output()
            .await
            .context(error::CommandFailedSnafu { message: error_msg })?;
        ensure!(
            output.status.success(),
            error::OperationFailedSnafu {
                message: String::from_utf8_lossy(&output.stderr),
                program: self.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>()
            }
        );
        Ok(output.stdout)
    }

    /// Run with inherited stdio so output streams to the user, failing when
    /// the command exits non-zero.
    pub(crate) async fn spawn(&self, args: &[&str], error_msg: String) -> Result<()> {
        let status = Command::new(&self.path)
            .args(args)
            .spawn()
            .context(error::CommandFailedSnafu {
                message: error_msg.clone(),
            })?
            .wait()
            .await
            .context(error::CommandFailedSnafu {
                message: error_msg.clone(),
            })?;
        ensure!(
            status.success(),
            error::OperationFailedSnafu {
                message: error_msg,
                program: self.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>()
            }
        );
        Ok(())
    }

    /// Run and report only whether the command succeeded. Output is
    /// discarded; a non-zero exit is not an error.
    pub(crate) async fn succeeds(&self, args: &[&str], error_msg: String) -> Result<bool> {
        let status = Command::new(&self.path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context(error::CommandFailedSnafu { message: error_msg })?;
        Ok(status.success())
    }
}
