// src/repository/download.rs

//! Package archive downloads
//!
//! The commit orchestrator never blocks on the network. It starts a
//! [`Download`] and polls it; [`HttpDownloader`] does the transfer on a
//! thread of its own and publishes byte counters as it goes.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Done,
    Failed(String),
}

/// An in-flight download
pub trait Download {
    /// Check progress without blocking
    fn poll(&mut self) -> DownloadState;

    fn bytes_done(&self) -> u64;

    /// Size of the transfer, once the transport knows it
    fn bytes_total(&self) -> Option<u64>;
}

/// Starts downloads
pub trait Downloader {
    fn start(&mut self, url: &str, dest: &Path) -> Result<Box<dyn Download>>;
}

#[derive(Debug, Default)]
struct Counters {
    done: AtomicU64,
    total: Mutex<Option<u64>>,
}

impl Counters {
    fn reset(&self, total: Option<u64>) {
        self.done.store(0, Ordering::Relaxed);
        if let Ok(mut slot) = self.total.lock() {
            *slot = total;
        }
    }
}

/// Downloads from `http(s)://` and `file://` URLs and plain paths
pub struct HttpDownloader {
    timeout: Duration,
    retries: u32,
}

impl HttpDownloader {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries: retries.max(1),
        }
    }
}

impl Downloader for HttpDownloader {
    fn start(&mut self, url: &str, dest: &Path) -> Result<Box<dyn Download>> {
        info!("Downloading {} to {}", url, dest.display());

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let counters = Arc::new(Counters::default());
        let job = Job {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            timeout: self.timeout,
            retries: self.retries,
            counters: Arc::clone(&counters),
        };

        let worker = thread::Builder::new()
            .name("stevedore-download".to_string())
            .spawn(move || job.run())
            .map_err(|e| Error::DownloadError(format!("Failed to start download: {}", e)))?;

        Ok(Box::new(HttpDownload {
            counters,
            worker: Some(worker),
            finished: None,
        }))
    }
}

struct Job {
    url: String,
    dest: PathBuf,
    timeout: Duration,
    retries: u32,
    counters: Arc<Counters>,
}

impl Job {
    fn run(self) -> Result<()> {
        let part = partial_path(&self.dest);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transfer(&part) {
                Ok(()) => {
                    fs::rename(&part, &self.dest).map_err(|e| {
                        Error::IoError(format!(
                            "Failed to move {} to {}: {}",
                            part.display(),
                            self.dest.display(),
                            e
                        ))
                    })?;
                    info!("Successfully downloaded to {}", self.dest.display());
                    return Ok(());
                }
                Err(e) => {
                    let _ = fs::remove_file(&part);
                    if attempt >= self.retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download {} after {} attempts: {}",
                            self.url, attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn transfer(&self, part: &Path) -> Result<()> {
        let (reader, total): (Box<dyn Read>, Option<u64>) =
            if self.url.starts_with("http://") || self.url.starts_with("https://") {
                let client = Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;
                let response = client
                    .get(&self.url)
                    .send()
                    .map_err(|e| Error::DownloadError(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        response.status(),
                        self.url
                    )));
                }
                let total = response.content_length();
                (Box::new(response), total)
            } else {
                let path = local_path(&self.url);
                let file = File::open(&path).map_err(|e| {
                    Error::DownloadError(format!("Failed to open {}: {}", path.display(), e))
                })?;
                let total = file.metadata().ok().map(|m| m.len());
                (Box::new(file), total)
            };

        self.counters.reset(total);
        copy_counted(reader, part, &self.counters)
    }
}

fn copy_counted(mut reader: Box<dyn Read>, part: &Path, counters: &Counters) -> Result<()> {
    let mut out = File::create(part)
        .map_err(|e| Error::IoError(format!("Failed to create file {}: {}", part.display(), e)))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::DownloadError(e.to_string())),
        };
        out.write_all(&buf[..n])
            .map_err(|e| Error::IoError(format!("Failed to write downloaded data: {}", e)))?;
        counters.done.fetch_add(n as u64, Ordering::Relaxed);
    }
    out.sync_all()?;
    Ok(())
}

struct HttpDownload {
    counters: Arc<Counters>,
    worker: Option<JoinHandle<Result<()>>>,
    finished: Option<DownloadState>,
}

impl Download for HttpDownload {
    fn poll(&mut self) -> DownloadState {
        if let Some(state) = &self.finished {
            return state.clone();
        }

        let worker = match self.worker.take() {
            Some(worker) if worker.is_finished() => worker,
            Some(worker) => {
                self.worker = Some(worker);
                return DownloadState::InProgress;
            }
            None => return DownloadState::Failed("download was never started".to_string()),
        };

        let state = match worker.join() {
            Ok(Ok(())) => DownloadState::Done,
            Ok(Err(e)) => DownloadState::Failed(e.to_string()),
            Err(_) => DownloadState::Failed("download thread panicked".to_string()),
        };
        debug!("Download finished: {:?}", state);
        self.finished = Some(state.clone());
        state
    }

    fn bytes_done(&self) -> u64 {
        self.counters.done.load(Ordering::Relaxed)
    }

    fn bytes_total(&self) -> Option<u64> {
        self.counters.total.lock().ok().and_then(|t| *t)
    }
}

/// Filesystem path for a `file://` URL or plain path
pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
