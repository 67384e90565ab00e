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

//! On-disk enrollment, configuration and admin records.
//!
//! Layout under the state directory:
//!
//! ```text
//! enroll/band_<uuid>.json
//! enroll/conf_<uuid>.json
//! admin/admin_<uuid>.json
//! default_band
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mudband_types::conf::BandConfig;
use mudband_types::{BandAdmin, Enrollment, EnrollmentSummary};

const ENROLL_DIR: &str = "enroll";
const ADMIN_DIR: &str = "admin";
const DEFAULT_BAND_FILE: &str = "default_band";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid band uuid: {0:?}")]
    InvalidBandUuid(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Handle to the client's local state. Clones share one lock, so there is a
/// single writer for every file and for the in-memory configuration cache.
#[derive(Debug, Clone)]
pub struct BandStore {
    root: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    default_band: Option<String>,
    cached: Option<(String, BandConfig)>,
}

impl BandStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(ENROLL_DIR), root.join(ADMIN_DIR)] {
            tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
        }

        let default_path = root.join(DEFAULT_BAND_FILE);
        let default_band = match tokio::fs::read_to_string(&default_path).await {
            Ok(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&default_path)(e)),
        };

        info!(
            root = %root.display(),
            default_band = default_band.as_deref().unwrap_or("-"),
            "opened band store"
        );
        Ok(Self {
            root,
            inner: Arc::new(Mutex::new(Inner {
                default_band,
                cached: None,
            })),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enrollment_path(&self, band_uuid: &str) -> PathBuf {
        self.root.join(ENROLL_DIR).join(format!("band_{band_uuid}.json"))
    }

    pub fn config_path(&self, band_uuid: &str) -> PathBuf {
        self.root.join(ENROLL_DIR).join(format!("conf_{band_uuid}.json"))
    }

    pub fn admin_path(&self, band_uuid: &str) -> PathBuf {
        self.root.join(ADMIN_DIR).join(format!("admin_{band_uuid}.json"))
    }

    fn default_band_path(&self) -> PathBuf {
        self.root.join(DEFAULT_BAND_FILE)
    }

    pub async fn default_band_uuid(&self) -> Option<String> {
        self.inner.lock().await.default_band.clone()
    }

    pub async fn list_enrollments(&self) -> Result<Vec<EnrollmentSummary>, StoreError> {
        let inner = self.inner.lock().await;
        let mut summaries: Vec<EnrollmentSummary> = self
            .read_enrollments()
            .await?
            .into_iter()
            .map(|e| EnrollmentSummary {
                is_default: inner.default_band.as_deref() == Some(e.band_uuid.as_str()),
                band_uuid: e.band_uuid,
                band_name: e.band_name,
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.band_name
                .cmp(&b.band_name)
                .then_with(|| a.band_uuid.cmp(&b.band_uuid))
        });
        Ok(summaries)
    }

    pub async fn load_enrollment(&self, band_uuid: &str) -> Result<Option<Enrollment>, StoreError> {
        check_uuid(band_uuid)?;
        let _inner = self.inner.lock().await;
        read_json(&self.enrollment_path(band_uuid)).await
    }

    pub async fn default_enrollment(&self) -> Result<Option<Enrollment>, StoreError> {
        let inner = self.inner.lock().await;
        match inner.default_band.as_deref() {
            Some(uuid) => read_json(&self.enrollment_path(uuid)).await,
            None => Ok(None),
        }
    }

    /// Stores a new enrollment, makes it the default and drops any stale
    /// configuration cached for the same band.
    pub async fn persist_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        check_uuid(&enrollment.band_uuid)?;
        let mut inner = self.inner.lock().await;
        let uuid = enrollment.band_uuid.as_str();

        write_json(&self.enrollment_path(uuid), enrollment).await?;
        remove_if_exists(&self.config_path(uuid)).await?;
        self.write_default(&mut inner, Some(uuid)).await?;
        inner.cached = None;

        info!(band_uuid = uuid, band_name = %enrollment.band_name, "persisted enrollment");
        Ok(())
    }

    /// Switches the default band. Returns `false` when no enrollment exists for it.
    pub async fn set_default(&self, band_uuid: &str) -> Result<bool, StoreError> {
        check_uuid(band_uuid)?;
        let mut inner = self.inner.lock().await;
        let path = self.enrollment_path(band_uuid);
        if !tokio::fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Ok(false);
        }
        self.write_default(&mut inner, Some(band_uuid)).await?;
        inner.cached = None;
        info!(band_uuid, "default band changed");
        Ok(true)
    }

    /// Cached configuration for a band, reading from disk on a cache miss.
    pub async fn load_config(&self, band_uuid: &str) -> Result<Option<BandConfig>, StoreError> {
        check_uuid(band_uuid)?;
        let mut inner = self.inner.lock().await;
        if let Some((_, conf)) = inner.cached.as_ref().filter(|(uuid, _)| uuid == band_uuid) {
            return Ok(Some(conf.clone()));
        }

        let conf: Option<BandConfig> = read_json(&self.config_path(band_uuid)).await?;
        if let Some(conf) = &conf {
            debug!(band_uuid, peers = conf.peers.len(), "loaded configuration from disk");
            inner.cached = Some((band_uuid.to_string(), conf.clone()));
        }
        Ok(conf)
    }

    pub async fn persist_config(&self, band_uuid: &str, config: &BandConfig) -> Result<(), StoreError> {
        check_uuid(band_uuid)?;
        let mut inner = self.inner.lock().await;
        write_json(&self.config_path(band_uuid), config).await?;
        inner.cached = Some((band_uuid.to_string(), config.clone()));
        debug!(
            band_uuid,
            etag = config.etag.as_deref().unwrap_or("-"),
            peers = config.peers.len(),
            "persisted configuration"
        );
        Ok(())
    }

    /// Deletes the enrollment, cached configuration and admin record of a band.
    /// When it was the default, the first remaining enrollment by name takes over.
    pub async fn remove_band(&self, band_uuid: &str) -> Result<(), StoreError> {
        check_uuid(band_uuid)?;
        let mut inner = self.inner.lock().await;

        remove_if_exists(&self.enrollment_path(band_uuid)).await?;
        remove_if_exists(&self.config_path(band_uuid)).await?;
        remove_if_exists(&self.admin_path(band_uuid)).await?;

        if inner
            .cached
            .as_ref()
            .is_some_and(|(uuid, _)| uuid == band_uuid)
        {
            inner.cached = None;
        }

        if inner.default_band.as_deref() == Some(band_uuid) {
            let mut remaining = self.read_enrollments().await?;
            remaining.sort_by(|a, b| a.band_name.cmp(&b.band_name));
            let next = remaining.first().map(|e| e.band_uuid.clone());
            self.write_default(&mut inner, next.as_deref()).await?;
            if let Some(next) = &next {
                info!(band_uuid = %next, "promoted remaining enrollment to default");
            }
        }

        info!(band_uuid, "removed local band state");
        Ok(())
    }

    pub async fn save_admin(&self, admin: &BandAdmin) -> Result<(), StoreError> {
        check_uuid(&admin.band_uuid)?;
        let _inner = self.inner.lock().await;
        write_json(&self.admin_path(&admin.band_uuid), admin).await?;
        info!(band_uuid = %admin.band_uuid, "saved band admin credential");
        Ok(())
    }

    pub async fn load_admin(&self, band_uuid: &str) -> Result<Option<BandAdmin>, StoreError> {
        check_uuid(band_uuid)?;
        let _inner = self.inner.lock().await;
        read_json(&self.admin_path(band_uuid)).await
    }

    async fn write_default(&self, inner: &mut Inner, band_uuid: Option<&str>) -> Result<(), StoreError> {
        let path = self.default_band_path();
        match band_uuid {
            Some(uuid) => write_atomic(&path, uuid.as_bytes()).await?,
            None => remove_if_exists(&path).await?,
        }
        inner.default_band = band_uuid.map(str::to_string);
        Ok(())
    }

    /// Reads every enrollment file. Unreadable files are skipped with a warning.
    async fn read_enrollments(&self) -> Result<Vec<Enrollment>, StoreError> {
        let dir = self.root.join(ENROLL_DIR);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with("band_") && name.ends_with(".json")) {
                continue;
            }
            match read_json::<Enrollment>(&entry.path()).await {
                Ok(Some(e)) => out.push(e),
                Ok(None) => {}
                Err(e) => warn!(file = name, error = %e, "skipping unreadable enrollment"),
            }
        }
        Ok(out)
    }
}

fn check_uuid(band_uuid: &str) -> Result<(), StoreError> {
    let valid = !band_uuid.is_empty()
        && band_uuid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidBandUuid(band_uuid.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Writes through a temporary sibling and renames it into place, owner-only on unix.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await.map_err(io_err(&tmp))?;
    file.write_all(bytes).await.map_err(io_err(&tmp))?;
    file.sync_all().await.map_err(io_err(&tmp))?;
    drop(file);

    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}
