/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::Result;
use slog::{info, Logger};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::common::exists_dir;
use crate::ensure;
use crate::errors::{command_code, SetupError};

pub const VIRTUAL_ENV: &str = "VIRTUAL_ENV";

/**
 * The environment in which we run external commands.  Activating a virtual
 * environment produces a new context rather than changing the environment of
 * this process, so every command we run is handed the context explicitly.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentContext {
    path: Option<OsString>,
    virtual_env: Option<PathBuf>,
    active: bool,
}

impl EnvironmentContext {
    pub fn from_env() -> EnvironmentContext {
        EnvironmentContext::from_vars(
            std::env::var_os("PATH"),
            std::env::var_os(VIRTUAL_ENV),
        )
    }

    pub fn from_vars(
        path: Option<OsString>,
        virtual_env: Option<OsString>,
    ) -> EnvironmentContext {
        /*
         * An empty VIRTUAL_ENV is what a shell leaves behind after some
         * deactivation scripts; treat it as unset.
         */
        let virtual_env =
            virtual_env.filter(|v| !v.is_empty()).map(PathBuf::from);
        let active = virtual_env.is_some();

        EnvironmentContext { path, virtual_env, active }
    }

    pub fn virtual_env(&self) -> Option<&Path> {
        self.virtual_env.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn search_path(&self) -> Option<&OsStr> {
        self.path.as_deref()
    }

    /**
     * Produce the context in which the virtual environment at "venv" is
     * active: its executable directory comes first in the search path.
     */
    pub fn activated(&self, venv: &Path) -> EnvironmentContext {
        let mut dirs = vec![bin_dir(venv)];
        if let Some(path) = self.path.as_ref() {
            dirs.extend(std::env::split_paths(path));
        }

        /*
         * join_paths() only fails if a directory contains the separator
         * character, in which case we fall back to the venv directory alone.
         */
        let path = std::env::join_paths(&dirs)
            .unwrap_or_else(|_| bin_dir(venv).into_os_string());

        EnvironmentContext {
            path: Some(path),
            virtual_env: Some(venv.to_path_buf()),
            active: true,
        }
    }

    pub fn apply(&self, cmd: &mut Command) {
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }
        match self.virtual_env.as_ref() {
            Some(venv) if self.is_active() => {
                cmd.env(VIRTUAL_ENV, venv);
            }
            _ => {
                cmd.env_remove(VIRTUAL_ENV);
            }
        }
    }

    /**
     * Resolve a bare program name against the active virtual environment.
     * Anything else is left for the search path to resolve.
     */
    pub fn program(&self, name: &OsStr) -> PathBuf {
        let bare = Path::new(name).components().count() == 1;
        if let (true, true, Some(venv)) =
            (bare, self.is_active(), self.virtual_env())
        {
            let mut candidate = bin_dir(venv).join(name);
            if cfg!(windows) {
                candidate.set_extension("exe");
            }
            if candidate.is_file() {
                return candidate;
            }
        }
        PathBuf::from(name)
    }
}

pub fn bin_dir(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

fn resolve(p: &Path) -> PathBuf {
    /*
     * The directory we are asked to activate might not exist yet; compare
     * absolute paths in that case.
     */
    std::fs::canonicalize(p).unwrap_or_else(|_| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(p))
                .unwrap_or_else(|_| p.to_path_buf())
        }
    })
}

/**
 * Make sure the virtual environment at "venv" exists and is active in the
 * returned context.  If some other virtual environment is already active we
 * refuse to continue rather than mixing two sets of dependencies.
 */
pub fn ensure_active(
    log: &Logger,
    ctx: &EnvironmentContext,
    python: &str,
    prompt: &str,
    venv: &Path,
) -> Result<EnvironmentContext> {
    if let Some(current) = ctx.virtual_env() {
        let current = resolve(current);
        let expected = resolve(venv);

        if current == expected {
            info!(log, "already in the correct virtual environment";
                "venv" => %expected.display());
            return Ok(ctx.clone());
        }

        return Err(SetupError::EnvironmentConflict { current, expected }.into());
    }

    if !exists_dir(bin_dir(venv))? {
        info!(log, "initialising venv at {}", venv.display());
        let venv_arg = venv.as_os_str();
        let args: Vec<&OsStr> = vec![
            OsStr::new(python),
            OsStr::new("-m"),
            OsStr::new("venv"),
            venv_arg,
            OsStr::new("--prompt"),
            OsStr::new(prompt),
        ];
        ensure::run_ctx(log, ctx, None, &args)?;
    }

    info!(log, "activating venv at {}", venv.display());
    Ok(ctx.activated(venv))
}

pub fn install_requirements(
    log: &Logger,
    ctx: &EnvironmentContext,
    requirements: &Path,
) -> Result<()> {
    info!(log, "installing requirements from {}", requirements.display());

    let args: Vec<&OsStr> = vec![
        OsStr::new("pip"),
        OsStr::new("install"),
        OsStr::new("-r"),
        requirements.as_os_str(),
    ];

    ensure::run_ctx(log, ctx, None, &args).map_err(|e| {
        SetupError::DependencyInstall {
            requirements: requirements.to_path_buf(),
            reason: format!("{:#}", e),
            code: command_code(&e),
        }
    })?;

    Ok(())
}
