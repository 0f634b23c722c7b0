/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{anyhow, bail, Result};
use slog::{info, o, warn, Logger};
use std::path::{Path, PathBuf};

use crate::archive;
use crate::common::{exists_dir, is_executable};
use crate::ensure::{self, FileType};
use crate::errors::SetupError;
use crate::fetch::Fetcher;
use crate::platform::{
    host_compiler, system_sdk_root, Platform, ProvisioningTarget,
    ToolchainPlan,
};
use crate::verify;

/**
 * Where the toolchain lives on disk.  Everything is assembled in "staging"
 * and renamed to "root" as the very last step, so "root" exists only once
 * provisioning has completed.  Archives are downloaded into "downloads", which
 * is removed after a successful provision and otherwise kept, along with any
 * archive that failed to extract.
 */
#[derive(Debug, Clone)]
pub struct ToolchainLayout {
    pub root: PathBuf,
    pub staging: PathBuf,
    pub downloads: PathBuf,
}

impl ToolchainLayout {
    /**
     * The toolchain sits beside the project, in the workspace directory that
     * also holds the west configuration.
     */
    pub fn in_workspace(workspace: &Path) -> ToolchainLayout {
        ToolchainLayout {
            root: workspace.join("toolchain"),
            staging: workspace.join("toolchain.staging"),
            downloads: workspace.join("toolchain.downloads"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolchainState {
    /**
     * A system-wide SDK has the compiler, and we have no toolchain of our
     * own yet.
     */
    External(PathBuf),
    Local,
    /**
     * Nothing usable.  A staging directory may remain from an interrupted run.
     */
    Absent { leftover: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Linked(PathBuf),
    AlreadyPresent,
    Provisioned(PathBuf),
}

pub struct Provisioner<'a> {
    log: Logger,
    fetcher: &'a dyn Fetcher,
    layout: ToolchainLayout,
    compiler: PathBuf,
    system_sdk: PathBuf,
    plan: Option<ToolchainPlan>,
}

impl<'a> Provisioner<'a> {
    /**
     * Use the pinned plan for this host, if there is one.  Without one we can
     * still recognise a toolchain that is already there.
     */
    pub fn for_host(
        log: &Logger,
        fetcher: &'a dyn Fetcher,
        layout: ToolchainLayout,
    ) -> Provisioner<'a> {
        match Platform::detect() {
            Ok(p) => {
                Provisioner::with_plan(log, fetcher, layout,
                    ToolchainPlan::for_platform(p))
            }
            Err(e) => {
                warn!(log, "{}", e);
                Provisioner {
                    log: log.new(o!("component" => "toolchain")),
                    fetcher,
                    layout,
                    compiler: host_compiler(),
                    system_sdk: system_sdk_root(),
                    plan: None,
                }
            }
        }
    }

    pub fn with_plan(
        log: &Logger,
        fetcher: &'a dyn Fetcher,
        layout: ToolchainLayout,
        plan: ToolchainPlan,
    ) -> Provisioner<'a> {
        Provisioner {
            log: log.new(o!("component" => "toolchain")),
            fetcher,
            layout,
            compiler: plan.compiler.clone(),
            system_sdk: plan.system_sdk.clone(),
            plan: Some(plan),
        }
    }

    pub fn state(&self) -> Result<ToolchainState> {
        let have_root = ensure::check(&self.layout.root)?.is_some();

        if !have_root && is_executable(self.system_sdk.join(&self.compiler))? {
            return Ok(ToolchainState::External(self.system_sdk.clone()));
        }

        if have_root {
            return Ok(ToolchainState::Local);
        }

        let leftover = ensure::check(&self.layout.staging)?.is_some();
        Ok(ToolchainState::Absent { leftover })
    }

    pub fn provision(&self) -> Result<Outcome> {
        let log = &self.log;

        match self.state()? {
            ToolchainState::External(sdk) => {
                info!(log, "linking to toolchain found in {}", sdk.display());
                self.commit(|staging| {
                    ensure::symlink(log, staging.join("tc"), &sdk)?;
                    Ok(())
                })?;
                Ok(Outcome::Linked(sdk))
            }
            ToolchainState::Local => {
                info!(log, "toolchain already set up";
                    "dir" => %self.layout.root.display());
                self.check_toolchain()?;
                Ok(Outcome::AlreadyPresent)
            }
            ToolchainState::Absent { leftover } => {
                if leftover {
                    warn!(log, "a previous toolchain install was interrupted");
                }
                let sdk = self.download_toolchain()?;
                ensure::removed_dir(log, &self.layout.downloads)?;
                Ok(Outcome::Provisioned(sdk))
            }
        }
    }

    /**
     * Confirm the compiler is reachable through the "tc" link.
     */
    pub fn check_toolchain(&self) -> Result<()> {
        self.check_compiler(&self.layout.root)
    }

    fn check_compiler(&self, dir: &Path) -> Result<()> {
        let tc = dir.join("tc");
        let incomplete = |reason: String| SetupError::ToolchainIncomplete {
            dir: dir.to_path_buf(),
            reason,
        };

        match ensure::check(&tc)? {
            Some(fi) if fi.filetype == FileType::Link => (),
            Some(fi) => {
                return Err(incomplete(
                    format!("tc is {:?}, not a link", fi.filetype)).into());
            }
            None => return Err(incomplete("no tc link".into()).into()),
        }

        let gcc = tc.join(&self.compiler);
        if !is_executable(&gcc)? {
            return Err(incomplete(
                format!("{} is missing or not executable", gcc.display()))
                .into());
        }

        info!(self.log, "compiler ok"; "path" => %gcc.display());
        Ok(())
    }

    /**
     * Build a fresh staging directory with the supplied function, then move
     * it into place as the toolchain directory.  Any debris from an earlier
     * attempt is removed first.
     */
    fn commit<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let log = &self.log;
        let staging = &self.layout.staging;

        ensure::removed_dir(log, staging)?;
        ensure::directory(log, staging)?;

        build(staging)?;

        info!(log, "moving {} to {}", staging.display(),
            self.layout.root.display());
        std::fs::rename(staging, &self.layout.root).map_err(|e| {
            anyhow!("renaming {} to {}: {}", staging.display(),
                self.layout.root.display(), e)
        })?;

        Ok(())
    }

    /**
     * Fetch one artifact and check its digest.  A download that fails the
     * check is removed, never extracted.
     */
    fn fetch_verified(&self, what: &str, t: &ProvisioningTarget)
        -> Result<PathBuf>
    {
        let log = &self.log;

        info!(log, "downloading {}", what);
        ensure::directory(log, &self.layout.downloads)?;
        let file = self.fetcher.fetch(log, &t.url, &self.layout.downloads)?;

        if let Err(e) =
            verify::verify(log, &file, t.digest.algorithm, &t.digest.hex)
        {
            warn!(log, "discarding {}", file.display());
            if let Err(re) = std::fs::remove_file(&file) {
                warn!(log, "could not remove {}: {}", file.display(), re);
            }
            return Err(e);
        }

        Ok(file)
    }

    fn download_toolchain(&self) -> Result<PathBuf> {
        let log = &self.log;
        let Some(plan) = self.plan.as_ref() else {
            bail!(
                "no pinned toolchain for {} on {}",
                std::env::consts::OS,
                std::env::consts::ARCH
            );
        };

        let mut sdk_name = String::new();

        self.commit(|staging| {
            let sdk_dir = staging.join("sdk");
            ensure::directory(log, &sdk_dir)?;

            let file = self.fetch_verified("minimal SDK", &plan.sdk)?;
            sdk_name = archive::root_folder(&file, plan.sdk.format)?;
            info!(log, "extracting minimal SDK {}", sdk_name);
            archive::extract(log, &file, plan.sdk.format, &sdk_dir)?;

            let sdk_root = sdk_dir.join(&sdk_name);
            if !exists_dir(&sdk_root)? {
                bail!("SDK archive did not produce {}", sdk_root.display());
            }

            let file = self.fetch_verified("toolchain", &plan.toolchain)?;
            info!(log, "extracting toolchain");
            archive::extract(log, &file, plan.toolchain.format, &sdk_root)?;

            /*
             * The link is relative so that it survives the rename out of the
             * staging directory.
             */
            ensure::symlink(log, staging.join("tc"),
                Path::new("sdk").join(&sdk_name))?;

            self.check_compiler(staging)
        })?;

        Ok(self.layout.root.join("sdk").join(&sdk_name))
    }
}
