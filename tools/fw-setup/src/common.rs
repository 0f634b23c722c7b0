/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{bail, Context, Result};
use atty::Stream;
use serde::Deserialize;
use slog::{Drain, Logger};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Mutex;

pub use slog::{debug, error, info, o};

/**
 * Initialise a logger which writes to stdout, and which does the right thing on
 * both an interactive terminal and when stdout is not a tty.
 */
pub fn init_log() -> Logger {
    let dec = slog_term::TermDecorator::new().stdout().build();
    if atty::is(Stream::Stdout) {
        let dr = Mutex::new(slog_term::CompactFormat::new(dec).build()).fuse();
        slog::Logger::root(dr, o!())
    } else {
        let dr = Mutex::new(
            slog_term::FullFormat::new(dec).use_original_order().build(),
        )
        .fuse();
        slog::Logger::root(dr, o!())
    }
}

#[cfg(test)]
pub fn test_log() -> Logger {
    slog::Logger::root(slog::Discard, o!())
}

pub fn read_toml<P, O>(path: P) -> Result<O>
where
    P: AsRef<Path>,
    for<'de> O: Deserialize<'de>,
{
    let p = path.as_ref();
    let f = File::open(p)
        .with_context(|| format!("opening \"{}\"", p.display()))?;
    let mut buf: Vec<u8> = Vec::new();
    let mut r = BufReader::new(f);
    r.read_to_end(&mut buf)?;
    toml::from_slice(&buf)
        .with_context(|| format!("parsing \"{}\"", p.display()))
}

/*
 * Note that these follow symbolic links: a "tc" link to a directory counts as
 * a directory.  Use ensure::check() to look at the link itself.
 */
fn exists<P: AsRef<Path>>(path: P) -> Result<Option<std::fs::Metadata>> {
    let p = path.as_ref();
    match std::fs::metadata(p) {
        Ok(m) => Ok(Some(m)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => bail!("checking for path {}: {}", p.display(), e),
    }
}

pub fn exists_file<P: AsRef<Path>>(path: P) -> Result<bool> {
    let p = path.as_ref();

    if let Some(m) = exists(p)? {
        if m.is_file() {
            Ok(true)
        } else {
            bail!("path {} exists but is not a file", p.display());
        }
    } else {
        Ok(false)
    }
}

pub fn exists_dir<P: AsRef<Path>>(path: P) -> Result<bool> {
    let p = path.as_ref();

    if let Some(m) = exists(p)? {
        if m.is_dir() {
            Ok(true)
        } else {
            bail!("path {} exists but is not a directory", p.display());
        }
    } else {
        Ok(false)
    }
}

/**
 * Is this a regular file we would be able to execute?  On Windows there is no
 * mode to check, so any regular file will do.
 */
pub fn is_executable<P: AsRef<Path>>(path: P) -> Result<bool> {
    let Some(m) = exists(path)? else {
        return Ok(false);
    };

    if !m.is_file() {
        return Ok(false);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(m.permissions().mode() & 0o111 != 0)
    }

    #[cfg(not(unix))]
    {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_checks_distinguish_types() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let f = tmp.path().join("file");
        std::fs::write(&f, b"x")?;

        assert!(exists_dir(tmp.path())?);
        assert!(exists_file(&f)?);
        assert!(!exists_file(tmp.path().join("missing"))?);
        assert!(exists_dir(&f).is_err());
        assert!(exists_file(tmp.path()).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn executable_needs_mode_bits() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir()?;
        let f = tmp.path().join("gcc");
        std::fs::write(&f, b"#!/bin/sh\n")?;
        std::fs::set_permissions(&f, std::fs::Permissions::from_mode(0o644))?;
        assert!(!is_executable(&f)?);

        std::fs::set_permissions(&f, std::fs::Permissions::from_mode(0o755))?;
        assert!(is_executable(&f)?);

        assert!(!is_executable(tmp.path())?);
        assert!(!is_executable(tmp.path().join("missing"))?);
        Ok(())
    }
}
