use std::fmt::{Display, Formatter};

/// Classifies a build failure so `main` can map it to an exit code. The
/// marker is attached with `anyhow::Context` and recovered by walking the
/// error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// Manifest or global configuration problem; nothing was run.
    Config,
    /// One or more steps failed.
    Step,
    /// The user interrupted the build.
    Cancelled,
}

impl FailureKind {
    fn code(self) -> i32 {
        match self {
            FailureKind::Step => 1,
            FailureKind::Config => 2,
            FailureKind::Cancelled => 130,
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Config => write!(f, "configuration error"),
            FailureKind::Step => write!(f, "build step failed"),
            FailureKind::Cancelled => write!(f, "build cancelled"),
        }
    }
}

impl std::error::Error for FailureKind {}

pub(crate) fn exit_code(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(kind) = cause.downcast_ref::<FailureKind>() {
            return kind.code();
        }
    }
    1
}
