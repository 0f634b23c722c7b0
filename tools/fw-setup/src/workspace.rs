/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{Context, Result};
use ini::Ini;
use slog::{info, Logger};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::common::exists_file;
use crate::config::Config;
use crate::ensure;
use crate::errors::{command_code, SetupError};
use crate::venv::EnvironmentContext;

pub const BUILD_DIR_FMT: &str = "build/{board}/{source_dir}";

/**
 * The west workspace is the directory above the project, which holds the
 * manifest repository alongside every module west fetches.
 */
pub fn west_config(project: &Path) -> PathBuf {
    project.join("..").join(".west").join("config")
}

fn west(
    log: &Logger,
    ctx: &EnvironmentContext,
    project: &Path,
    step: &str,
    args: &[&OsStr],
) -> Result<()> {
    let mut cmd = vec![OsStr::new("west")];
    cmd.extend_from_slice(args);

    ensure::run_ctx(log, ctx, Some(project), &cmd).map_err(|e| {
        SetupError::WorkspaceInit {
            step: step.to_string(),
            reason: format!("{:#}", e),
            code: command_code(&e),
        }
        .into()
    })
}

/**
 * Set the build directory layout and default board in a freshly created
 * workspace configuration.  Everything else in the file is left as west wrote
 * it.
 */
pub fn configure_build(log: &Logger, config: &Path, board: &str) -> Result<()> {
    let fail = |reason: String| SetupError::WorkspaceInit {
        step: "configure".into(),
        reason,
        code: None,
    };

    let mut ini = Ini::load_from_file(config)
        .map_err(|e| fail(format!("reading {}: {}", config.display(), e)))?;

    ini.with_section(Some("build"))
        .set("dir-fmt", BUILD_DIR_FMT)
        .set("board", board);

    ini.write_to_file(config)
        .map_err(|e| fail(format!("writing {}: {}", config.display(), e)))?;

    info!(log, "updated {} with build directory and board", config.display();
        "board" => board);
    Ok(())
}

/**
 * Initialise the west workspace the first time through, then bring every
 * module up to date with the manifest.
 */
pub fn ensure_workspace(
    log: &Logger,
    ctx: &EnvironmentContext,
    project: &Path,
    config: &Config,
) -> Result<()> {
    let wc = west_config(project);

    if !exists_file(&wc)? {
        info!(log, "initialising west workspace");
        west(log, ctx, project, "init",
            &[OsStr::new("init"), OsStr::new("-l"), OsStr::new(".")])?;

        if !exists_file(&wc)? {
            return Err(SetupError::WorkspaceInit {
                step: "init".into(),
                reason: format!("west did not create {}", wc.display()),
                code: None,
            }
            .into());
        }
        configure_build(log, &wc, &config.board)?;
    } else {
        info!(log, "west workspace already initialised");
    }

    let mut args = vec![OsStr::new("update")];
    args.extend(config.update_args.iter().map(OsStr::new));
    west(log, ctx, project, "update", &args)?;

    Ok(())
}

/**
 * Link the lint script in as the git pre-commit hook, unless the project is
 * not a git checkout or already has a hook of its own.
 */
pub fn install_hook(log: &Logger, project: &Path) -> Result<bool> {
    let hooks = project.join(".git").join("hooks");
    if ensure::check(&hooks)?.is_none() {
        info!(log, "no git hooks directory, skipping pre-commit hook");
        return Ok(false);
    }

    let hook = hooks.join("pre-commit");
    if ensure::check(&hook)?.is_some() {
        info!(log, "pre-commit hook present, leaving it alone");
        return Ok(false);
    }

    info!(log, "installing pre-commit hook");
    let lint = project.join("scripts").join("lint.py");
    ensure::symlink(log, &hook, &lint)
        .with_context(|| format!("installing {}", hook.display()))
}
