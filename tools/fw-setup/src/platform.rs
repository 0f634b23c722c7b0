/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{bail, Result};
use std::fmt;
use std::path::PathBuf;

use crate::archive::ArchiveFormat;
use crate::verify::ExpectedDigest;

/*
 * To move to a new SDK release, see the tags at
 * https://github.com/zephyrproject-rtos/sdk-ng/tags and take the "minimal"
 * bundle and the arm-zephyr-eabi toolchain for each host, along with their
 * entries in the release's sha256.sum.
 */
pub const SDK_VERSION: &str = "0.17.1-rc1";

const LINUX_SDK_URL: &str = "https://github.com/zephyrproject-rtos/sdk-ng/\
    releases/download/v0.17.1-rc1/\
    zephyr-sdk-0.17.1-rc1_linux-x86_64_minimal.tar.xz";
const LINUX_SDK_SHA256: &str =
    "bd9c7c916a37e8e305a7203d7cce90d7acfa0d7d798c7244c70a6dbc04949b1d";
const LINUX_TOOLCHAIN_URL: &str = "https://github.com/zephyrproject-rtos/\
    sdk-ng/releases/download/v0.17.1-rc1/\
    toolchain_linux-x86_64_arm-zephyr-eabi.tar.xz";
const LINUX_TOOLCHAIN_SHA256: &str =
    "99af1bdcbc01fd451b180d0a546a773cfec6a5ea797caab64c4316717f8ccaa4";

const WINDOWS_SDK_URL: &str = "https://github.com/zephyrproject-rtos/sdk-ng/\
    releases/download/v0.17.1-rc1/\
    zephyr-sdk-0.17.1-rc1_windows-x86_64_minimal.7z";
const WINDOWS_SDK_SHA256: &str =
    "cf66c9182468e6b25a918c19d134a6441ffe93f9cd2889890c2b3daf0b49157e";
const WINDOWS_TOOLCHAIN_URL: &str = "https://github.com/zephyrproject-rtos/\
    sdk-ng/releases/download/v0.17.1-rc1/\
    toolchain_windows-x86_64_arm-zephyr-eabi.7z";
const WINDOWS_TOOLCHAIN_SHA256: &str =
    "0d6da84628b86feb9166c6bbf7a50d8ffa9bb9497c37c937f50181b1664e28dc";

/*
 * Container images used for CI ship the SDK here.
 */
const SYSTEM_SDK_BASE: &str = "/opt/zephyr-sdk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    LinuxX64,
    WindowsX64,
}

impl Platform {
    pub fn detect() -> Result<Platform> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Ok(Platform::LinuxX64),
            ("windows", "x86_64") => Ok(Platform::WindowsX64),
            (os, arch) => {
                bail!(
                    "no pinned toolchain for {} on {}; supported hosts are \
                    linux-x86_64 and windows-x86_64",
                    os,
                    arch
                );
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::LinuxX64 => "linux-x86_64",
            Platform::WindowsX64 => "windows-x86_64",
        }
    }

    pub fn executable_extension(self) -> &'static str {
        match self {
            Platform::LinuxX64 => "",
            Platform::WindowsX64 => ".exe",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * One external artifact: where it comes from, what it must hash to, and how
 * it is packed.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningTarget {
    pub url: String,
    pub digest: ExpectedDigest,
    pub format: ArchiveFormat,
}

/**
 * Everything needed to provision the toolchain on one host: the minimal SDK,
 * the compiler toolchain that is unpacked inside it, the compiler binary that
 * shows the result is usable, and where a pre-provisioned SDK would be found.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ToolchainPlan {
    pub sdk: ProvisioningTarget,
    pub toolchain: ProvisioningTarget,
    pub compiler: PathBuf,
    pub system_sdk: PathBuf,
}

fn compiler_path(ext: &str) -> PathBuf {
    ["arm-zephyr-eabi", "bin"]
        .iter()
        .collect::<PathBuf>()
        .join(format!("arm-zephyr-eabi-gcc{}", ext))
}

/**
 * The SDK root a CI image would provide, whether or not this host could
 * download the toolchain itself.
 */
pub fn system_sdk_root() -> PathBuf {
    PathBuf::from(SYSTEM_SDK_BASE).join(format!("zephyr-sdk-{}", SDK_VERSION))
}

pub fn host_compiler() -> PathBuf {
    compiler_path(std::env::consts::EXE_SUFFIX)
}

impl ToolchainPlan {
    pub fn for_platform(p: Platform) -> ToolchainPlan {
        let (sdk, toolchain) = match p {
            Platform::LinuxX64 => (
                ProvisioningTarget {
                    url: LINUX_SDK_URL.to_string(),
                    digest: ExpectedDigest::sha256(LINUX_SDK_SHA256),
                    format: ArchiveFormat::TarXz,
                },
                ProvisioningTarget {
                    url: LINUX_TOOLCHAIN_URL.to_string(),
                    digest: ExpectedDigest::sha256(LINUX_TOOLCHAIN_SHA256),
                    format: ArchiveFormat::TarXz,
                },
            ),
            Platform::WindowsX64 => (
                ProvisioningTarget {
                    url: WINDOWS_SDK_URL.to_string(),
                    digest: ExpectedDigest::sha256(WINDOWS_SDK_SHA256),
                    format: ArchiveFormat::SevenZip,
                },
                ProvisioningTarget {
                    url: WINDOWS_TOOLCHAIN_URL.to_string(),
                    digest: ExpectedDigest::sha256(WINDOWS_TOOLCHAIN_SHA256),
                    format: ArchiveFormat::SevenZip,
                },
            ),
        };

        ToolchainPlan {
            sdk,
            toolchain,
            compiler: compiler_path(p.executable_extension()),
            system_sdk: system_sdk_root(),
        }
    }
}
