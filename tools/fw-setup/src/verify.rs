/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::{Context, Result};
use digest::Digest;
use slog::{info, Logger};
use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::path::Path;

use crate::errors::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }

    /**
     * Length of a digest from this algorithm, in hex digits.
     */
    pub fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * An expected content digest, pinned alongside the URL it applies to.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub algorithm: Algorithm,
    pub hex: Cow<'static, str>,
}

impl ExpectedDigest {
    pub const fn sha256(hex: &'static str) -> ExpectedDigest {
        ExpectedDigest { algorithm: Algorithm::Sha256, hex: Cow::Borrowed(hex) }
    }
}

fn hash_reader<D: Digest, R: Read>(mut r: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/**
 * Compute the digest of a file, returned as lower case hex.
 */
pub fn digest_file(path: &Path, algorithm: Algorithm) -> Result<String> {
    let f = std::fs::File::open(path).with_context(|| {
        format!("opening {} for {}", path.display(), algorithm)
    })?;

    let res = match algorithm {
        Algorithm::Sha256 => hash_reader::<sha2::Sha256, _>(f),
    };

    res.with_context(|| format!("reading {} for {}", path.display(), algorithm))
}

/**
 * Check that the file at "path" has the expected digest.  A mismatch is a
 * DigestMismatch error; there is no partial acceptance.
 */
pub fn verify(
    log: &Logger,
    path: &Path,
    algorithm: Algorithm,
    expected: &str,
) -> Result<()> {
    info!(log, "checking {} of {}", algorithm, path.display());

    let actual = digest_file(path, algorithm)?;
    let expected_lc = expected.trim().to_ascii_lowercase();

    /*
     * A malformed expected value can never match, but say so explicitly
     * rather than leave the operator comparing digests by eye.
     */
    let well_formed = expected_lc.len() == algorithm.hex_len()
        && expected_lc.chars().all(|c| c.is_ascii_hexdigit());

    if !well_formed || actual != expected_lc {
        return Err(SetupError::DigestMismatch {
            path: path.to_path_buf(),
            algorithm: algorithm.to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }

    info!(log, "{} ok", algorithm);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_log;

    const HELLO_SHA256: &str =
        "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    fn hello(dir: &Path) -> std::path::PathBuf {
        let p = dir.join("hello.txt");
        std::fs::write(&p, b"hello world\n").unwrap();
        p
    }

    #[test]
    fn digest_matches_known_value() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let p = hello(tmp.path());

        assert_eq!(digest_file(&p, Algorithm::Sha256)?, HELLO_SHA256);
        Ok(())
    }

    #[test]
    fn verify_accepts_either_case() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let p = hello(tmp.path());

        verify(&log, &p, Algorithm::Sha256, HELLO_SHA256)?;
        verify(&log, &p, Algorithm::Sha256, &HELLO_SHA256.to_uppercase())?;
        Ok(())
    }

    #[test]
    fn verify_reports_mismatch() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let p = hello(tmp.path());
        let wrong =
            "bd9c7c916a37e8e305a7203d7cce90d7acfa0d7d798c7244c70a6dbc04949b1d";

        let e = verify(&log, &p, Algorithm::Sha256, wrong).unwrap_err();
        match e.downcast_ref::<SetupError>() {
            Some(SetupError::DigestMismatch { expected, actual, .. }) => {
                assert_eq!(expected, wrong);
                assert_eq!(actual, HELLO_SHA256);
            }
            other => panic!("unexpected error {:?}", other),
        }

        /*
         * Verification must not consume the file.
         */
        assert!(p.is_file());
        Ok(())
    }

    #[test]
    fn verify_rejects_malformed_expected_value() -> Result<()> {
        let log = test_log();
        let tmp = tempfile::tempdir()?;
        let p = hello(tmp.path());

        assert!(verify(&log, &p, Algorithm::Sha256, "").is_err());
        assert!(verify(&log, &p, Algorithm::Sha256, &HELLO_SHA256[..40])
            .is_err());
        let mut not_hex = HELLO_SHA256.to_string();
        not_hex.replace_range(..1, "g");
        assert!(verify(&log, &p, Algorithm::Sha256, &not_hex).is_err());
        Ok(())
    }

    #[test]
    fn missing_file_is_not_a_mismatch() {
        let log = test_log();
        let e = verify(
            &log,
            Path::new("/nonexistent/fw-setup/file"),
            Algorithm::Sha256,
            HELLO_SHA256,
        )
        .unwrap_err();
        assert!(e.downcast_ref::<SetupError>().is_none());
    }
}
