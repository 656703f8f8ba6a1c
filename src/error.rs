// hymod/src/error.rs

use std::fmt;

/// Error categories surfaced through the CLI. Attached to anyhow chains as
/// context so the dispatcher can tell a recoverable storage failure from a
/// fatal one without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    StorageUnavailable,
    KernelProtocolMismatch,
    KernelUnavailable,
    MountFailed,
    SyncFailed,
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConfigInvalid => "configuration invalid",
            ErrorKind::StorageUnavailable => "no usable storage backend",
            ErrorKind::KernelProtocolMismatch => "kernel protocol mismatch",
            ErrorKind::KernelUnavailable => "kernel channel unavailable",
            ErrorKind::MountFailed => "mount operation failed",
            ErrorKind::SyncFailed => "module sync failed",
            ErrorKind::InvalidInput => "invalid input",
        };
        f.write_str(name)
    }
}

impl std::error::Error for ErrorKind {}

/// True when the chain carries the given kind. anyhow's downcast reaches
/// values attached via `.context()` anywhere in the chain.
pub fn is_kind(err: &anyhow::Error, kind: ErrorKind) -> bool {
    err.downcast_ref::<ErrorKind>() == Some(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_is_found_through_context_chain() {
        let err = anyhow::anyhow!("mkfs failed")
            .context(ErrorKind::StorageUnavailable)
            .context("setting up mirror");
        assert!(is_kind(&err, ErrorKind::StorageUnavailable));
        assert!(!is_kind(&err, ErrorKind::ConfigInvalid));
    }
}
