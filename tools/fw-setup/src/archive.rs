/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::Result;
use slog::{info, warn, Logger};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use crate::errors::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarXz,
    SevenZip,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::SevenZip => "7z",
        }
    }
}

fn fail(archive: &Path, reason: String) -> SetupError {
    SetupError::Extract { archive: archive.to_path_buf(), reason }
}

/**
 * Make sure an entry name stays inside the directory we extract into, and
 * return it without any leading "./".
 */
fn confined(archive: &Path, name: &Path) -> Result<PathBuf, SetupError> {
    let mut out = PathBuf::new();

    for c in name.components() {
        match c {
            Component::Normal(c) => out.push(c),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(fail(
                    archive,
                    format!("refusing entry {:?} outside the destination",
                        name),
                ));
            }
        }
    }

    Ok(out)
}

fn open_tar_xz(
    archive: &Path,
) -> Result<tar::Archive<xz2::bufread::XzDecoder<BufReader<File>>>, SetupError>
{
    let f = File::open(archive)
        .map_err(|e| fail(archive, format!("opening: {}", e)))?;
    Ok(tar::Archive::new(xz2::bufread::XzDecoder::new(BufReader::new(f))))
}

/**
 * The names of all entries in the archive, in archive order.
 */
pub fn entries(archive: &Path, format: ArchiveFormat) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    match format {
        ArchiveFormat::TarXz => {
            let mut tar = open_tar_xz(archive)?;
            let ents = tar
                .entries()
                .map_err(|e| fail(archive, format!("reading entries: {}", e)))?;
            for ent in ents {
                let ent = ent.map_err(|e| {
                    fail(archive, format!("reading entry: {}", e))
                })?;
                let path = ent.path().map_err(|e| {
                    fail(archive, format!("entry path: {}", e))
                })?;
                out.push(path.into_owned());
            }
        }
        ArchiveFormat::SevenZip => {
            let rdr = sevenz_rust::SevenZReader::open(
                archive,
                sevenz_rust::Password::empty(),
            )
            .map_err(|e| fail(archive, format!("reading 7z: {:?}", e)))?;
            for f in rdr.archive().files.iter() {
                out.push(PathBuf::from(f.name().replace('\\', "/")));
            }
        }
    }

    Ok(out)
}

/**
 * Determine the single directory at the top of an archive, which is where its
 * contents will land once extracted.  An archive that spreads itself across
 * several top-level entries has no such root and is an error.
 */
pub fn root_folder(archive: &Path, format: ArchiveFormat) -> Result<String> {
    let mut roots = BTreeSet::new();
    let mut nested = false;

    for name in entries(archive, format)? {
        let name = confined(archive, &name)?;
        let mut comps = name.components();
        let Some(first) = comps.next() else {
            continue;
        };
        if comps.next().is_some() {
            nested = true;
        }
        roots.insert(first.as_os_str().to_string_lossy().to_string());
    }

    if roots.len() != 1 || !nested {
        return Err(fail(
            archive,
            format!("expected a single top-level directory, found {:?}",
                roots),
        )
        .into());
    }

    Ok(roots.into_iter().next().unwrap_or_default())
}

fn unpack_tar_xz(archive: &Path, dst: &Path) -> Result<(), SetupError> {
    let mut tar = open_tar_xz(archive)?;
    tar.set_preserve_permissions(true);

    let ents = tar
        .entries()
        .map_err(|e| fail(archive, format!("reading entries: {}", e)))?;
    for ent in ents {
        let mut ent =
            ent.map_err(|e| fail(archive, format!("reading entry: {}", e)))?;
        let name = ent
            .path()
            .map_err(|e| fail(archive, format!("entry path: {}", e)))?
            .into_owned();
        confined(archive, &name)?;

        let ok = ent.unpack_in(dst).map_err(|e| {
            fail(archive, format!("unpacking {}: {}", name.display(), e))
        })?;
        if !ok {
            return Err(fail(
                archive,
                format!("entry {} escapes the destination", name.display()),
            ));
        }
    }

    Ok(())
}

fn unpack_7z(archive: &Path, dst: &Path) -> Result<(), SetupError> {
    /*
     * Check every name before writing anything.
     */
    for name in entries(archive, ArchiveFormat::SevenZip)
        .map_err(|e| fail(archive, format!("{:#}", e)))?
    {
        confined(archive, &name)?;
    }

    sevenz_rust::decompress_file(archive, dst)
        .map_err(|e| fail(archive, format!("{:?}", e)))
}

/**
 * Extract a verified archive into "dst", creating it if needed.  The archive
 * is removed once extraction succeeds; on failure it is left where it is so
 * that it can be examined.
 */
pub fn extract(
    log: &Logger,
    archive: &Path,
    format: ArchiveFormat,
    dst: &Path,
) -> Result<()> {
    info!(log, "extracting {} into {}", archive.display(), dst.display();
        "format" => format.extension());

    std::fs::create_dir_all(dst).map_err(|e| {
        fail(archive, format!("creating {}: {}", dst.display(), e))
    })?;

    let res = match format {
        ArchiveFormat::TarXz => unpack_tar_xz(archive, dst),
        ArchiveFormat::SevenZip => unpack_7z(archive, dst),
    };

    if let Err(e) = res {
        warn!(log, "extraction failed, keeping {}", archive.display());
        return Err(e.into());
    }

    std::fs::remove_file(archive).map_err(|e| {
        fail(archive, format!("removing after extraction: {}", e))
    })?;

    info!(log, "extracted {}", archive.display());
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::common::test_log;
    use std::io::Write;

    /**
     * Build a tar.xz archive holding the given files; names ending in "/" are
     * directories.
     */
    pub fn make_tar_xz(path: &Path, files: &[(&str, &str)]) {
        let f = File::create(path).unwrap();
        let xz = xz2::write::XzEncoder::new(f, 6);
        let mut tar = tar::Builder::new(xz);

        for (name, data) in files {
            let mut h = tar::Header::new_gnu();
            if name.ends_with('/') {
                h.set_entry_type(tar::EntryType::Directory);
                h.set_mode(0o755);
                h.set_size(0);
                h.set_cksum();
                tar.append_data(&mut h, name, std::io::empty()).unwrap();
            } else {
                h.set_entry_type(tar::EntryType::Regular);
                h.set_mode(0o755);
                h.set_size(data.len() as u64);
                h.set_cksum();
                tar.append_data(&mut h, name, data.as_bytes()).unwrap();
            }
        }

        let xz = tar.into_inner().unwrap();
        let mut f = xz.finish().unwrap();
        f.flush().unwrap();
    }

    #[test]
    fn extract_tar_xz_and_remove_archive() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let a = tmp.path().join("sdk_linux-x86_64_minimal.tar.xz");
        make_tar_xz(&a, &[
            ("zephyr-sdk-1.0/", ""),
            ("zephyr-sdk-1.0/setup.sh", "#!/bin/sh\n"),
            ("zephyr-sdk-1.0/cmake/zephyr.cmake", "set(X 1)\n"),
        ]);
        let dst = tmp.path().join("out");

        extract(&log, &a, ArchiveFormat::TarXz, &dst)?;

        assert_eq!(
            std::fs::read(dst.join("zephyr-sdk-1.0").join("setup.sh"))?,
            b"#!/bin/sh\n"
        );
        assert!(dst.join("zephyr-sdk-1.0/cmake/zephyr.cmake").is_file());
        assert!(!a.exists());
        Ok(())
    }

    #[test]
    fn extract_7z_and_remove_archive() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let sdk = src.join("zephyr-sdk-1.0");
        std::fs::create_dir_all(sdk.join("cmake"))?;
        std::fs::write(sdk.join("sdk_version"), b"1.0\n")?;
        std::fs::write(sdk.join("cmake").join("zephyr.cmake"), b"set(X 1)\n")?;

        let a = tmp.path().join("sdk_windows-x86_64_minimal.7z");
        sevenz_rust::compress_to_path(&src, &a).unwrap();

        assert_eq!(
            root_folder(&a, ArchiveFormat::SevenZip)?,
            "zephyr-sdk-1.0"
        );

        let dst = tmp.path().join("out");
        extract(&log, &a, ArchiveFormat::SevenZip, &dst)?;

        assert_eq!(
            std::fs::read(dst.join("zephyr-sdk-1.0").join("sdk_version"))?,
            b"1.0\n"
        );
        assert!(dst.join("zephyr-sdk-1.0/cmake/zephyr.cmake").is_file());
        assert!(!a.exists());
        Ok(())
    }

    #[test]
    fn root_folder_from_listing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let a = tmp.path().join("renamed-by-someone.tar.xz");
        make_tar_xz(&a, &[
            ("./zephyr-sdk-0.17.1-rc1/", ""),
            ("./zephyr-sdk-0.17.1-rc1/sdk_version", "0.17.1-rc1\n"),
        ]);

        assert_eq!(
            root_folder(&a, ArchiveFormat::TarXz)?,
            "zephyr-sdk-0.17.1-rc1"
        );
        Ok(())
    }

    #[test]
    fn root_folder_needs_exactly_one_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;

        let a = tmp.path().join("two.tar.xz");
        make_tar_xz(&a, &[("a/x", "1"), ("b/y", "2")]);
        assert!(root_folder(&a, ArchiveFormat::TarXz).is_err());

        let a = tmp.path().join("flat.tar.xz");
        make_tar_xz(&a, &[("README", "1")]);
        assert!(root_folder(&a, ArchiveFormat::TarXz).is_err());

        let a = tmp.path().join("empty.tar.xz");
        make_tar_xz(&a, &[]);
        assert!(root_folder(&a, ArchiveFormat::TarXz).is_err());
        Ok(())
    }

    #[test]
    fn corrupt_archive_is_kept() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let dst = tmp.path().join("out");

        for (name, format) in &[
            ("bad.tar.xz", ArchiveFormat::TarXz),
            ("bad.7z", ArchiveFormat::SevenZip),
        ] {
            let a = tmp.path().join(name);
            std::fs::write(&a, b"this is not an archive")?;

            let e = extract(&log, &a, *format, &dst).unwrap_err();
            assert!(
                matches!(
                    e.downcast_ref::<SetupError>(),
                    Some(SetupError::Extract { .. })
                ),
                "{:?}",
                e
            );
            assert!(a.is_file());
        }
        Ok(())
    }

    #[test]
    fn parent_references_are_refused() {
        let a = Path::new("evil.tar.xz");
        assert!(confined(a, Path::new("../etc/passwd")).is_err());
        assert!(confined(a, Path::new("/etc/passwd")).is_err());
        assert_eq!(
            confined(a, Path::new("./sdk/bin")).unwrap(),
            PathBuf::from("sdk/bin")
        );
    }
}
