// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reading daily PBS accounting log files.
//!
//! PBS writes one file per day under `PBS_HOME/server_priv/accounting`, named `YYYYMMDD`. A
//! [`LogSource`] reads one of them and, when it follows the current day, keeps tailing it and
//! moves on to the next file once the wall-clock day is over.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::errors::SourceError;
use crate::parser::is_diagnostic;

pub const DEFAULT_PBS_CONF: &str = "/etc/pbs.conf";
pub const LOG_FILE_FORMAT: &str = "%Y%m%d";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// How a source behaves at the end of its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Follows the current day and rotates with it.
    Live,
    /// Reads a past day once.
    Manual,
    /// Was reading a past day that turned out to be today; now behaves like `Live`.
    ManualWaiting,
    /// The requested day has no log file.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSettings {
    /// Wait between reads at the end of a file that is still being written.
    pub poll_interval: Duration,
    /// Wait before looking again for a log file that doesn't exist yet.
    pub open_retry_interval: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            open_retry_interval: DEFAULT_OPEN_RETRY_INTERVAL,
        }
    }
}

pub struct LogSource {
    dir: PathBuf,
    current_day: NaiveDate,
    mode: SourceMode,
    clock: Arc<dyn Clock>,
    settings: SourceSettings,
    reader: Option<BufReader<File>>,
    buffer: Vec<u8>,
    rotation: Option<NaiveDate>,
    finished: bool,
}

impl LogSource {
    /// A live source for the clock's current day.
    pub fn today(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>, settings: SourceSettings) -> Self {
        let day = clock.today();
        info!("Initialising log source: accounting log file for {}", day.format(LOG_FILE_FORMAT));
        Self::new(dir.into(), day, SourceMode::Live, clock, settings)
    }

    /// A source reading a single past day. If that day has no log file the source is empty.
    pub fn for_day(
        dir: impl Into<PathBuf>,
        day: NaiveDate,
        clock: Arc<dyn Clock>,
        settings: SourceSettings,
    ) -> Self {
        let dir = dir.into();
        let mode = if log_path(&dir, day).is_file() {
            info!("Initialising log source: accounting log file for {}", day.format(LOG_FILE_FORMAT));
            SourceMode::Manual
        } else {
            debug!("No accounting log file for {}", day.format(LOG_FILE_FORMAT));
            SourceMode::None
        };
        Self::new(dir, day, mode, clock, settings)
    }

    fn new(
        dir: PathBuf,
        current_day: NaiveDate,
        mode: SourceMode,
        clock: Arc<dyn Clock>,
        settings: SourceSettings,
    ) -> Self {
        LogSource {
            dir,
            current_day,
            mode,
            clock,
            settings,
            reader: None,
            buffer: Vec::new(),
            rotation: None,
            finished: false,
        }
    }

    #[must_use]
    pub fn current_day(&self) -> NaiveDate {
        self.current_day
    }

    #[must_use]
    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    /// Returns the day completed by the last rotation, if it wasn't taken yet.
    pub fn take_rotation(&mut self) -> Option<NaiveDate> {
        self.rotation.take()
    }

    /// Returns the next complete line, without its line terminator.
    ///
    /// Waits while the current day's file is still being written, and switches to the next day's
    /// file when the wall-clock day is over. Returns `Ok(None)` once a past day is fully read.
    ///
    /// # Errors
    ///
    /// [`SourceError::Cancelled`] if `cancel` fires while waiting or between lines,
    /// [`SourceError::Io`] when the file can't be read.
    pub async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, SourceError> {
        loop {
            if self.finished || self.mode == SourceMode::None {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            if self.reader.is_none() && !self.open(cancel).await? {
                self.finished = true;
                return Ok(None);
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            reader
                .read_until(b'\n', &mut self.buffer)
                .map_err(|source| SourceError::Io {
                    path: log_path(&self.dir, self.current_day),
                    source,
                })?;

            if self.buffer.ends_with(b"\n") {
                let line = self.take_buffer();
                if is_diagnostic(&line) {
                    info!("{}", line);
                    continue;
                }
                return Ok(Some(line));
            }

            // end of file, anything left in the buffer is an incomplete line
            let today = self.clock.today();
            if self.current_day >= today {
                if self.mode == SourceMode::Manual {
                    info!("Processed past logs, waiting for today's information");
                    self.mode = SourceMode::ManualWaiting;
                }
                pause(self.settings.poll_interval, cancel).await?;
                continue;
            }

            // the day is over, the file is complete
            if !self.buffer.is_empty() {
                let line = self.take_buffer();
                if !is_diagnostic(&line) {
                    return Ok(Some(line));
                }
                info!("{}", line);
            }
            info!(
                "Finished processing {} log.",
                self.current_day.format(LOG_FILE_FORMAT)
            );
            self.reader = None;
            match self.mode {
                SourceMode::Manual | SourceMode::None => {
                    self.finished = true;
                    return Ok(None);
                }
                SourceMode::Live | SourceMode::ManualWaiting => {
                    self.rotation = Some(self.current_day);
                    self.current_day = today;
                    info!(
                        "Switching to accounting log {}",
                        today.format(LOG_FILE_FORMAT)
                    );
                }
            }
        }
    }

    /// Opens the file of `current_day`. Returns false when a past day has no file.
    async fn open(&mut self, cancel: &CancellationToken) -> Result<bool, SourceError> {
        loop {
            let path = log_path(&self.dir, self.current_day);
            match File::open(&path) {
                Ok(file) => {
                    debug!("Opened accounting log {}", path.display());
                    self.reader = Some(BufReader::new(file));
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    error!("Accounting log file not found - {}", path.display());
                    if self.mode == SourceMode::Manual {
                        return Ok(false);
                    }
                    info!(
                        "Sleeping for {} secs and trying again",
                        self.settings.open_retry_interval.as_secs()
                    );
                    pause(self.settings.open_retry_interval, cancel).await?;
                    let today = self.clock.today();
                    if today > self.current_day {
                        info!(
                            "Date changed while waiting, looking for {} instead",
                            today.format(LOG_FILE_FORMAT)
                        );
                        self.current_day = today;
                    }
                }
                Err(source) => return Err(SourceError::Io { path, source }),
            }
        }
    }

    fn take_buffer(&mut self) -> String {
        let bytes = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&bytes);
        line.trim_end_matches(&['\r', '\n'][..]).to_string()
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), SourceError> {
    tokio::select! {
        () = cancel.cancelled() => Err(SourceError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Path of the accounting log for `day`.
#[must_use]
pub fn log_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(day.format(LOG_FILE_FORMAT).to_string())
}

/// Reads `PBS_HOME` from a PBS configuration file and returns the accounting directory under it.
///
/// # Errors
///
/// [`SourceError::PbsConfig`] when the file can't be read or doesn't set `PBS_HOME`.
pub fn accounting_dir_from_pbs_conf(path: &Path) -> Result<PathBuf, SourceError> {
    let contents = std::fs::read_to_string(path).map_err(|e| SourceError::PbsConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "PBS_HOME")
        .map(|(_, home)| {
            PathBuf::from(home.trim())
                .join("server_priv")
                .join("accounting")
        })
        .ok_or_else(|| SourceError::PbsConfig {
            path: path.to_path_buf(),
            reason: "PBS_HOME is not set".to_string(),
        })
}

/// The earliest day with an accounting log in `dir`.
///
/// # Errors
///
/// [`SourceError::NoLogs`] when no file in `dir` is named like a log day,
/// [`SourceError::Io`] when the directory can't be listed.
pub fn first_log_day(dir: &Path) -> Result<NaiveDate, SourceError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if name.len() != 8 {
                return None;
            }
            NaiveDate::parse_from_str(name, LOG_FILE_FORMAT).ok()
        })
        .min()
        .ok_or_else(|| SourceError::NoLogs(dir.to_path_buf()))
}
