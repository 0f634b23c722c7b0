/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::common::{exists_file, read_toml};

pub const CONFIG_FILE: &str = "setup.toml";

/**
 * Per-project settings, read from "setup.toml" in the project directory.  The
 * file is optional and every key has a default that suits the DB1 board.
 */
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub board: String,
    pub venv_prompt: String,
    pub python: String,
    pub requirements: PathBuf,
    pub update_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            board: "db1/mcxn947/cpu0".into(),
            venv_prompt: "db1-bringup".into(),
            python: "python".into(),
            requirements: ["scripts", "requirements.txt"].iter().collect(),
            /*
             * A treeless clone keeps the module checkouts small.
             */
            update_args: vec!["--fetch-opt=--filter=tree:0".into()],
        }
    }
}

impl Config {
    pub fn load(project: &Path) -> Result<Config> {
        let p = project.join(CONFIG_FILE);
        if exists_file(&p)? {
            read_toml(&p)
        } else {
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;

        let c = Config::load(tmp.path())?;
        assert_eq!(c, Config::default());
        assert_eq!(c.board, "db1/mcxn947/cpu0");
        assert_eq!(c.requirements, Path::new("scripts/requirements.txt"));
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "board = \"db1/mcxn947/cpu1\"\nupdate_args = []\n",
        )?;

        let c = Config::load(tmp.path())?;
        assert_eq!(c.board, "db1/mcxn947/cpu1");
        assert!(c.update_args.is_empty());
        assert_eq!(c.venv_prompt, "db1-bringup");
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::write(tmp.path().join(CONFIG_FILE), "bord = \"x\"\n")?;

        let e = Config::load(tmp.path()).unwrap_err();
        assert!(format!("{:#}", e).contains("setup.toml"), "{:#}", e);
        Ok(())
    }
}
