// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tracing setup and the daily log files.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const LOG_PREFIX: &str = "mudband-";
const LOG_SUFFIX: &str = ".log";

pub fn init_tracing(verbose: bool, log_file: Option<DailyFile>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let file_layer = log_file.map(|w| fmt::layer().with_ansi(false).with_writer(w));

    #[cfg(distribute)]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .with(file_layer)
            .init();
    }

    #[cfg(not(distribute))]
    {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(io::stderr))
            .with(file_layer)
            .init();
    }
}

pub fn log_file_name(date: NaiveDate) -> String {
    format!("{LOG_PREFIX}{}{LOG_SUFFIX}", date.format("%Y-%m-%d"))
}

fn parse_log_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Appends to `mudband-YYYY-MM-DD.log`, switching files when the local date changes.
pub struct DailyFile {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl DailyFile {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    fn open(&self, date: NaiveDate) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(self.dir.join(log_file_name(date)))
    }

    fn write_dated(&self, date: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        if current.as_ref().is_none_or(|(d, _)| *d != date) {
            *current = Some((date, self.open(date)?));
        }
        match current.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(0),
        }
    }
}

pub struct DailyWriter<'a>(&'a DailyFile);

impl Write for DailyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_dated(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.current.lock() {
            Ok(mut current) => match current.as_mut() {
                Some((_, file)) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyWriter(self)
    }
}

/// Deletes log files dated more than `retention_days` before `today`.
pub fn purge_expired(dir: &Path, retention_days: u32, today: NaiveDate) -> io::Result<usize> {
    let cutoff = today - chrono::Days::new(u64::from(retention_days));
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(parse_log_date) else {
            continue;
        };
        if date < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(file = ?name, "removed expired log file");
                    removed += 1;
                }
                Err(e) => warn!(file = ?name, error = %e, "failed to remove expired log file"),
            }
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, retention_days, "purged expired log files");
    }
    Ok(removed)
}
