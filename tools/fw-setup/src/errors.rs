/*
 * Copyright 2024 Oxide Computer Company
 */

use std::path::PathBuf;
use thiserror::Error;

/**
 * Failures that end a setup run.  Nothing in the tool retries; every one of
 * these is reported to the operator, who fixes the environment and runs again.
 */
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("already inside a different virtual environment \
        (current {}, expected {}); deactivate it first",
        current.display(), expected.display())]
    EnvironmentConflict { current: PathBuf, expected: PathBuf },

    #[error("installing requirements from {}: {reason}",
        requirements.display())]
    DependencyInstall {
        requirements: PathBuf,
        reason: String,
        code: Option<i32>,
    },

    #[error("fetching {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("{algorithm} digest mismatch for {}: expected {expected}, \
        got {actual}", path.display())]
    DigestMismatch {
        path: PathBuf,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("extracting {}: {reason}", archive.display())]
    Extract { archive: PathBuf, reason: String },

    #[error("workspace {step}: {reason}")]
    WorkspaceInit {
        step: String,
        reason: String,
        code: Option<i32>,
    },

    #[error("toolchain at {} is incomplete ({reason}); remove it and \
        run again", dir.display())]
    ToolchainIncomplete { dir: PathBuf, reason: String },

    #[error("exec {args:?}: failed with {status}")]
    CommandFailed {
        args: Vec<String>,
        status: String,
        code: Option<i32>,
    },
}

impl SetupError {
    /**
     * The process exit status to report for this failure: that of the
     * external command which failed, if there was one.
     */
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            SetupError::DependencyInstall { code, .. }
            | SetupError::WorkspaceInit { code, .. }
            | SetupError::CommandFailed { code, .. } => *code,
            _ => None,
        };

        match code {
            Some(c) if c != 0 => c,
            _ => 1,
        }
    }
}

/**
 * Recover the exit code of a failed external command from an error produced by
 * the ensure::run family.
 */
pub fn command_code(e: &anyhow::Error) -> Option<i32> {
    match e.downcast_ref::<SetupError>() {
        Some(SetupError::CommandFailed { code, .. }) => *code,
        _ => None,
    }
}

pub fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<SetupError>().map(|se| se.exit_code()).unwrap_or(1)
}
