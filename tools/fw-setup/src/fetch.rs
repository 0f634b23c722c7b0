/*
 * Copyright 2024 Oxide Computer Company
 */

use anyhow::Result;
use slog::{info, Logger};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::errors::SetupError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/**
 * Retrieve a remote file into a local directory.  Implementations must never
 * leave a partially written file under the final name.
 */
pub trait Fetcher {
    fn fetch(&self, log: &Logger, url: &str, dir: &Path) -> Result<PathBuf>;
}

/**
 * The last path segment of a URL, which we keep as the local file name.
 */
pub fn file_name(url: &str) -> Result<String> {
    let fail = |reason: &str| SetupError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let Some((proto, rest)) = url.split_once("://") else {
        return Err(fail("no protocol in URL").into());
    };
    if proto != "http" && proto != "https" {
        return Err(fail(&format!("unsupported protocol {:?}", proto)).into());
    }

    let path = rest.split(|c| c == '?' || c == '#').next().unwrap_or("");
    match path.split_once('/') {
        Some((_, path)) => match path.rsplit('/').next() {
            Some(name)
                if !name.is_empty() && name != "." && name != ".." =>
            {
                Ok(name.to_string())
            }
            _ => Err(fail("URL does not name a file").into()),
        },
        None => Err(fail("URL does not name a file").into()),
    }
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<HttpFetcher> {
        HttpFetcher::with_timeout(READ_TIMEOUT)
    }

    /**
     * The blocking client applies "timeout" to each wait: for the response
     * head, then for every read of the body.  A large archive may take as
     * long as it needs, but a server that goes quiet for longer than this
     * fails the fetch.
     */
    pub fn with_timeout(timeout: Duration) -> Result<HttpFetcher> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;

        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, log: &Logger, url: &str, dir: &Path) -> Result<PathBuf> {
        let name = file_name(url)?;
        let fail = |reason: String| SetupError::Fetch {
            url: url.to_string(),
            reason,
        };

        info!(log, "downloading {}", url);

        let mut res = self
            .client
            .get(url)
            .send()
            .map_err(|e| fail(format!("{}", e)))?;

        if !res.status().is_success() {
            return Err(fail(format!("HTTP {}", res.status())).into());
        }

        /*
         * Write the body into an anonymous temporary file in the target
         * directory, so that it is only given its final name once complete.
         */
        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(dir)
            .map_err(|e| {
                fail(format!("creating temporary file in {}: {}",
                    dir.display(), e))
            })?;

        let total = res.content_length();
        let mut done: u64 = 0;
        let mut buf = vec![0u8; 256 * 1024];
        let mut last = Instant::now();

        loop {
            let n = res
                .read(&mut buf)
                .map_err(|e| fail(format!("reading body: {}", e)))?;
            if n == 0 {
                break;
            }

            tmp.write_all(&buf[..n])
                .map_err(|e| fail(format!("writing download: {}", e)))?;
            done += n as u64;

            if last.elapsed() >= PROGRESS_INTERVAL {
                progress(log, &name, done, total);
                last = Instant::now();
            }
        }
        progress(log, &name, done, total);

        if let Some(total) = total {
            if done != total {
                return Err(fail(format!(
                    "short read: {} of {} bytes",
                    done, total
                ))
                .into());
            }
        }

        tmp.as_file()
            .sync_all()
            .map_err(|e| fail(format!("syncing download: {}", e)))?;

        let dst = dir.join(&name);
        tmp.persist(&dst).map_err(|e| {
            fail(format!("renaming download to {}: {}", dst.display(), e))
        })?;

        info!(log, "downloaded {} bytes to {}", done, dst.display());
        Ok(dst)
    }
}

fn progress(log: &Logger, name: &str, done: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => {
            info!(log, "{}: {} of {} bytes ({}%)", name, done, total,
                done * 100 / total);
        }
        _ => {
            info!(log, "{}: {} bytes", name, done);
        }
    }
}
