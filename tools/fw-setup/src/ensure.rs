/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{bail, Result};
use slog::{error, info, warn, Logger};
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::errors::SetupError;
use crate::venv::EnvironmentContext;

#[derive(Debug, PartialEq)]
pub enum FileType {
    Directory,
    File,
    Link,
}

#[derive(Debug, PartialEq)]
pub struct FileInfo {
    pub filetype: FileType,
    pub target: Option<PathBuf>, /* for symbolic links */
}

/**
 * Look at a path without following symbolic links.
 */
pub fn check<P: AsRef<Path>>(p: P) -> Result<Option<FileInfo>> {
    let p = p.as_ref();
    let md = match std::fs::symlink_metadata(p) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => bail!("lstat({}): {}", p.display(), e),
    };

    let ft = md.file_type();
    let filetype = if ft.is_symlink() {
        FileType::Link
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_file() {
        FileType::File
    } else {
        bail!("lstat({}): unexpected file type: {:?}", p.display(), ft);
    };

    let target = if filetype == FileType::Link {
        Some(std::fs::read_link(p)?)
    } else {
        None
    };

    Ok(Some(FileInfo { filetype, target }))
}

pub fn directory<P: AsRef<Path>>(log: &Logger, dir: P) -> Result<bool> {
    let dir = dir.as_ref();

    if let Some(fi) = check(dir)? {
        /*
         * The path exists already.  Make sure it is a directory.
         */
        if fi.filetype != FileType::Directory {
            bail!("{} is {:?}, not a directory", dir.display(), fi.filetype);
        }
        return Ok(false);
    }

    /*
     * Create the directory, and all missing parents:
     */
    info!(log, "creating directory: {}", dir.display());
    std::fs::create_dir_all(dir)?;

    Ok(true)
}

/**
 * Remove a directory tree if it exists.  Used to discard the debris of an
 * interrupted run; anything that is not a directory is left alone.
 */
pub fn removed_dir<P: AsRef<Path>>(log: &Logger, dir: P) -> Result<bool> {
    let dir = dir.as_ref();

    match check(dir)? {
        None => Ok(false),
        Some(fi) if fi.filetype == FileType::Directory => {
            warn!(log, "removing leftover directory {}", dir.display());
            std::fs::remove_dir_all(dir)?;
            Ok(true)
        }
        Some(fi) => {
            bail!(
                "{} exists as {:?}, unexpected type",
                dir.display(),
                fi.filetype
            );
        }
    }
}

#[cfg(unix)]
fn make_link(target: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(windows)]
fn make_link(target: &Path, dst: &Path) -> std::io::Result<()> {
    /*
     * Windows links are either for a directory or for a file.  A relative
     * target is relative to the directory holding the link.
     */
    let full = match dst.parent() {
        Some(parent) => parent.join(target),
        None => target.to_path_buf(),
    };
    if full.is_dir() {
        std::os::windows::fs::symlink_dir(target, dst)
    } else {
        std::os::windows::fs::symlink_file(target, dst)
    }
}

pub fn symlink<P1: AsRef<Path>, P2: AsRef<Path>>(
    log: &Logger,
    dst: P1,
    target: P2,
) -> Result<bool> {
    let dst = dst.as_ref();
    let target = target.as_ref();

    let do_link = if let Some(fi) = check(dst)? {
        match fi.filetype {
            FileType::Link => {
                let fitarget = fi.target.unwrap_or_default();
                if fitarget == target {
                    info!(log, "link target ok ({})", target.display());
                    false
                } else {
                    warn!(
                        log,
                        "link target wrong: want {}, got {}; unlinking",
                        target.display(),
                        fitarget.display()
                    );
                    remove_link(dst)?;
                    true
                }
            }
            FileType::File => {
                warn!(log, "file {} exists, unlinking", dst.display());
                std::fs::remove_file(dst)?;
                true
            }
            FileType::Directory => {
                bail!(
                    "{} is a directory, will not replace it with a link",
                    dst.display()
                );
            }
        }
    } else {
        info!(log, "link {} does not exist", dst.display());
        true
    };

    if do_link {
        info!(log, "linking {} -> {} ...", dst.display(), target.display());
        make_link(target, dst)?;
    }

    Ok(do_link)
}

fn remove_link(dst: &Path) -> std::io::Result<()> {
    /*
     * A directory symlink on Windows must be removed as a directory.
     */
    match std::fs::remove_file(dst) {
        Ok(()) => Ok(()),
        Err(e) if cfg!(windows) => std::fs::remove_dir(dst).map_err(|_| e),
        Err(e) => Err(e),
    }
}

fn spawn_reader<T>(
    log: &Logger,
    name: &str,
    stream: Option<T>,
) -> Option<std::thread::JoinHandle<()>>
where
    T: Read + Send + 'static,
{
    let name = name.to_string();
    let stream = match stream {
        Some(stream) => stream,
        None => return None,
    };

    let log = log.clone();

    Some(std::thread::spawn(move || {
        let mut r = BufReader::new(stream);

        loop {
            let mut buf: Vec<u8> = Vec::new();

            /*
             * We have no particular control over the output from the child
             * processes we run, so we read until a newline character without
             * relying on totally valid UTF-8 output.
             */
            match r.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    /*
                     * EOF.
                     */
                    return;
                }
                Ok(_) => {
                    let s = String::from_utf8_lossy(&buf);
                    let s = s.trim();

                    if !s.is_empty() {
                        info!(log, "{}| {}", name, s);
                    }
                }
                Err(e) => {
                    error!(log, "failed to read {}: {}", name, e);
                    return;
                }
            }
        }
    }))
}

fn run_common(log: &Logger, cmd: &mut Command, args: &[&OsStr]) -> Result<()> {
    info!(log, "exec: {:?}", &args; "pwd" => ?cmd.get_current_dir());

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let printable = || {
        args.iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect::<Vec<_>>()
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Err(SetupError::CommandFailed {
                args: printable(),
                status: format!("could not start: {}", e),
                code: None,
            }
            .into());
        }
    };

    let readout = spawn_reader(log, "O", child.stdout.take());
    let readerr = spawn_reader(log, "E", child.stderr.take());

    if let Some(t) = readout {
        t.join().expect("join stdout thread");
    }
    if let Some(t) = readerr {
        t.join().expect("join stderr thread");
    }

    let es = child.wait()?;
    if !es.success() {
        return Err(SetupError::CommandFailed {
            args: printable(),
            status: es.to_string(),
            code: es.code(),
        }
        .into());
    }

    Ok(())
}

pub fn scrub_env(cmd: &mut Command, utf8: bool) {
    if utf8 {
        cmd.env("LANG", "en_US.UTF-8");
    } else {
        cmd.env_remove("LANG");
    }
    cmd.env_remove("LC_CTYPE");
    cmd.env_remove("LC_NUMERIC");
    cmd.env_remove("LC_TIME");
    cmd.env_remove("LC_COLLATE");
    cmd.env_remove("LC_MONETARY");
    cmd.env_remove("LC_MESSAGES");
    cmd.env_remove("LC_ALL");
}

/**
 * Run a program in the given environment context, optionally from a specific
 * working directory.  The program is looked up in the context's search path
 * first, so that tools installed in an activated virtual environment win over
 * those found on the system.
 */
pub fn run_ctx<S: AsRef<OsStr>>(
    log: &Logger,
    ctx: &EnvironmentContext,
    pwd: Option<&Path>,
    args: &[S],
) -> Result<()> {
    let args: Vec<&OsStr> = args.iter().map(|s| s.as_ref()).collect();
    if args.is_empty() {
        bail!("no program to run");
    }

    let mut cmd = Command::new(ctx.program(args[0]));
    if let Some(pwd) = pwd {
        cmd.current_dir(pwd);
    }

    scrub_env(&mut cmd, true);
    ctx.apply(&mut cmd);

    if args.len() > 1 {
        cmd.args(&args[1..]);
    }

    run_common(log, &mut cmd, args.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_log;

    #[test]
    fn directory_is_idempotent() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let d = tmp.path().join("a").join("b");

        assert!(directory(&log, &d)?);
        assert!(!directory(&log, &d)?);

        let f = tmp.path().join("file");
        std::fs::write(&f, b"x")?;
        assert!(directory(&log, &f).is_err());
        Ok(())
    }

    #[test]
    fn removed_dir_clears_tree() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let d = tmp.path().join("staging");
        std::fs::create_dir_all(d.join("sdk").join("half"))?;
        std::fs::write(d.join("sdk").join("half").join("f"), b"x")?;

        assert!(removed_dir(&log, &d)?);
        assert!(check(&d)?.is_none());
        assert!(!removed_dir(&log, &d)?);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_replaces_wrong_target() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let dst = tmp.path().join("tc");

        assert!(symlink(&log, &dst, "sdk/one")?);
        assert!(!symlink(&log, &dst, "sdk/one")?);
        assert!(symlink(&log, &dst, "sdk/two")?);

        let fi = check(&dst)?.expect("link exists");
        assert_eq!(fi.filetype, FileType::Link);
        assert_eq!(fi.target, Some(PathBuf::from("sdk/two")));
        Ok(())
    }

    #[test]
    fn symlink_refuses_to_replace_directory() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let dst = tmp.path().join("tc");
        std::fs::create_dir(&dst)?;

        assert!(symlink(&log, &dst, "sdk/one").is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_reports_exit_code() -> Result<()> {
        let log = test_log();
        let ctx = EnvironmentContext::from_vars(
            std::env::var_os("PATH"),
            None,
        );

        run_ctx(&log, &ctx, None, &["sh", "-c", "exit 0"])?;

        let e = run_ctx(&log, &ctx, None, &["sh", "-c", "exit 7"])
            .unwrap_err();
        assert_eq!(crate::errors::command_code(&e), Some(7));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_sees_context_variables() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let ctx = EnvironmentContext::from_vars(
            std::env::var_os("PATH"),
            None,
        )
        .activated(tmp.path());

        let script = format!(
            "test \"$VIRTUAL_ENV\" = \"{}\"",
            tmp.path().display()
        );
        run_ctx(&log, &ctx, Some(tmp.path()), &["sh", "-c", script.as_str()])?;
        Ok(())
    }
}
