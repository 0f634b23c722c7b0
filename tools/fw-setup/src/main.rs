/*
 * Copyright 2024 Oxide Computer Company
 */

mod common;
use common::*;

mod archive;
mod config;
mod ensure;
mod errors;
mod fetch;
mod platform;
mod provision;
mod venv;
mod verify;
mod workspace;

use anyhow::{bail, Context, Result};
use slog::Logger;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use config::Config;
use fetch::HttpFetcher;
use provision::{Outcome, Provisioner, ToolchainLayout};
use venv::EnvironmentContext;

fn baseopts() -> getopts::Options {
    let mut opts = getopts::Options::new();

    /*
     * We should always have a --help flag everywhere.
     */
    opts.optflag("", "help", "usage information");

    opts
}

/**
 * Options for commands that operate on a firmware project.
 */
fn projectopts() -> getopts::Options {
    let mut opts = baseopts();
    opts.optopt("", "project", "firmware project directory (default: .)",
        "DIR");
    opts
}

/**
 * The firmware project, and the west workspace directory that contains it.
 */
struct Project {
    dir: PathBuf,
    workspace: PathBuf,
    config: Config,
}

impl Project {
    fn locate(res: &getopts::Matches) -> Result<Project> {
        let dir = match res.opt_str("project") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };
        let dir = std::fs::canonicalize(&dir)
            .with_context(|| format!("project directory {}", dir.display()))?;
        if !exists_dir(&dir)? {
            bail!("project {} is not a directory", dir.display());
        }

        let Some(workspace) = dir.parent().map(Path::to_path_buf) else {
            bail!("project {} has no parent to hold the workspace",
                dir.display());
        };

        let config = Config::load(&dir)?;

        Ok(Project { dir, workspace, config })
    }

    fn venv(&self) -> PathBuf {
        self.dir.join(".venv")
    }
}

fn provision_toolchain(log: &Logger, project: &Project) -> Result<()> {
    let fetcher = HttpFetcher::new()?;
    let layout = ToolchainLayout::in_workspace(&project.workspace);

    match Provisioner::for_host(log, &fetcher, layout).provision()? {
        Outcome::Linked(sdk) => {
            info!(log, "toolchain linked to {}", sdk.display());
        }
        Outcome::AlreadyPresent => (),
        Outcome::Provisioned(sdk) => {
            info!(log, "toolchain installed in {}", sdk.display());
        }
    }

    Ok(())
}

/**
 * Bring the project to the point where it can be built: virtual environment,
 * Python requirements, west workspace, toolchain, and git hook.  Returns the
 * context in which to run the project's tools.
 */
fn bootstrap(log: &Logger, project: &Project) -> Result<EnvironmentContext> {
    let c = &project.config;

    info!(log, "setting up {}", project.dir.display());

    let ctx = venv::ensure_active(log, &EnvironmentContext::from_env(),
        &c.python, &c.venv_prompt, &project.venv())?;

    venv::install_requirements(log, &ctx, &project.dir.join(&c.requirements))?;

    workspace::ensure_workspace(log, &ctx, &project.dir, c)?;

    provision_toolchain(log, project)?;

    workspace::install_hook(log, &project.dir)?;

    info!(log, "environment setup completed");
    Ok(ctx)
}

fn cmd_setup(log: &Logger, args: &[&str]) -> Result<()> {
    let opts = projectopts();

    let usage = || {
        println!("{}", opts.usage("Usage: fw-setup [OPTIONS] setup [OPTIONS]"));
    };

    let res = opts.parse(args)?;

    if res.opt_present("help") {
        usage();
        return Ok(());
    }

    if !res.free.is_empty() {
        bail!("unexpected arguments: {:?}", res.free);
    }

    let project = Project::locate(&res)?;
    bootstrap(log, &project)?;

    Ok(())
}

fn cmd_setup_toolchain(log: &Logger, args: &[&str]) -> Result<()> {
    let mut opts = projectopts();
    opts.optopt("o", "optional", "accepted for compatibility; ignored",
        "VALUE");

    let usage = || {
        println!("{}", opts.usage(
            "Usage: fw-setup [OPTIONS] setup-toolchain [OPTIONS]"));
    };

    let res = opts.parse(args)?;

    if res.opt_present("help") {
        usage();
        return Ok(());
    }

    if !res.free.is_empty() {
        bail!("unexpected arguments: {:?}", res.free);
    }

    if let Some(v) = res.opt_str("optional") {
        debug!(log, "ignoring --optional {}", v);
    }

    let project = Project::locate(&res)?;
    provision_toolchain(log, &project)
}

fn cmd_build(log: &Logger, args: &[&str]) -> Result<()> {
    let mut opts = projectopts();
    opts.optflag("p", "pristine", "start from an empty build directory");

    let usage = || {
        println!("{}", opts.usage("Usage: fw-setup [OPTIONS] build [OPTIONS]"));
    };

    let res = opts.parse(args)?;

    if res.opt_present("help") {
        usage();
        return Ok(());
    }

    if !res.free.is_empty() {
        bail!("unexpected arguments: {:?}", res.free);
    }

    let project = Project::locate(&res)?;
    let ctx = bootstrap(log, &project)?;

    let mut west = vec![
        OsStr::new("west"),
        OsStr::new("build"),
        OsStr::new("-b"),
        OsStr::new(&project.config.board),
        OsStr::new("app/"),
    ];
    if res.opt_present("pristine") {
        west.push(OsStr::new("-p"));
    }
    ensure::run_ctx(log, &ctx, Some(&project.dir), &west)
}

struct CommandInfo {
    name: String,
    desc: String,
    func: fn(&Logger, &[&str]) -> Result<()>,
}

fn run(log: &Logger) -> Result<()> {
    let mut opts = baseopts();
    opts.parsing_style(getopts::ParsingStyle::StopAtFirstFree);

    let handlers = vec![
        CommandInfo {
            name: "setup".into(),
            desc: "set up the development environment".into(),
            func: cmd_setup,
        },
        CommandInfo {
            name: "setup-toolchain".into(),
            desc: "install the Zephyr SDK and compiler only".into(),
            func: cmd_setup_toolchain,
        },
        CommandInfo {
            name: "build".into(),
            desc: "set up, then build the firmware".into(),
            func: cmd_build,
        },
    ];

    let usage = || {
        let mut out = String::new();
        out += "Usage: fw-setup [OPTIONS] COMMAND [OPTIONS] [ARGS...]\n\n";
        for ci in handlers.iter() {
            out += &format!("    {:<16} {}\n", ci.name, ci.desc);
        }
        println!("{}", opts.usage(&out));
    };

    let res = opts.parse(std::env::args().skip(1))?;
    if res.opt_present("help") {
        usage();
        return Ok(());
    }

    if res.free.is_empty() {
        usage();
        bail!("choose a command");
    }

    let args = res.free[1..].iter().map(|s| s.as_str()).collect::<Vec<_>>();

    for ci in handlers.iter() {
        if ci.name != res.free[0] {
            continue;
        }

        return (ci.func)(log, args.as_slice());
    }

    bail!("command \"{}\" not understood", res.free[0]);
}

fn main() {
    let log = init_log();

    if let Err(e) = run(&log) {
        error!(log, "{:#}", e);
        std::process::exit(errors::exit_code(&e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_refuse_stray_arguments() {
        let log = test_log();
        let cmds: [fn(&Logger, &[&str]) -> Result<()>; 3] =
            [cmd_setup, cmd_setup_toolchain, cmd_build];

        for cmd in cmds.iter() {
            let e = cmd(&log, &["--project", "/nonexistent", "extra"])
                .unwrap_err();
            assert!(e.to_string().contains("unexpected arguments"), "{}", e);
        }
    }
}
