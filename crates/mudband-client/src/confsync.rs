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

//! Keeps the default band's configuration in sync with the control plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mudband_types::api::{
    ConfInterface, ConfRequest, FetchType, STATUS_MFA_REQUIRED, STATUS_OK,
};
use mudband_types::conf::BandConfig;

use crate::api::{ApiClient, ApiError, ConfReply};
use crate::engine::{EngineError, TunnelEngine};
use crate::error::ErrorKind;
use crate::status::{ConnectionStatus, MfaState, StatusCell};
use crate::store::{BandStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no band is enrolled")]
    NotEnrolled,

    #[error("{msg}")]
    Rejected { status: i64, msg: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine rejected configuration: {0}")]
    Engine(#[from] EngineError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. } => ErrorKind::ServerRejected,
            Self::Api(e) => e.kind(),
            Self::NotEnrolled | Self::Store(_) | Self::Engine(_) => ErrorKind::LocalState,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// A new configuration was stored and handed to the engine.
    Updated(BandConfig),
    /// The server answered 304; nothing changed.
    NotModified,
    /// The server wants the user to complete MFA first.
    MfaRequired { sso_url: String },
    /// A fetch started later has already been applied.
    Superseded,
}

/// Fetches band configuration. Clones share state.
pub struct ConfigSync<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ConfigSync<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E> {
    api: ApiClient,
    store: BandStore,
    engine: Arc<E>,
    status: StatusCell,
    mfa: MfaState,
    next_seq: AtomicU64,
    applied_seq: Mutex<u64>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<E: TunnelEngine> ConfigSync<E> {
    pub fn new(
        api: ApiClient,
        store: BandStore,
        engine: Arc<E>,
        status: StatusCell,
        mfa: MfaState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                engine,
                status,
                mfa,
                next_seq: AtomicU64::new(0),
                applied_seq: Mutex::new(0),
                worker: std::sync::Mutex::new(None),
            }),
        }
    }

    fn build_request(&self, fetch_type: FetchType) -> ConfRequest {
        let engine = &self.inner.engine;
        let mapped = engine.stun_mapped_address();
        let mut addresses = engine.local_interface_addresses();
        if let Some(mapped) = &mapped {
            addresses.push(mapped.clone());
        }
        ConfRequest {
            fetch_type,
            stun_mapped_addr: mapped.unwrap_or_default(),
            stun_nattype: engine.stun_nat_type().as_i32(),
            interface: ConfInterface {
                listen_port: engine.listen_port(),
                addresses,
            },
        }
    }

    /// Fetches the default band's configuration once.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_config(&self, fetch_type: FetchType) -> Result<FetchOutcome, ConfigError> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let enrollment = inner
            .store
            .default_enrollment()
            .await?
            .ok_or(ConfigError::NotEnrolled)?;
        let band_uuid = enrollment.band_uuid.as_str();
        let cached_etag = inner
            .store
            .load_config(band_uuid)
            .await?
            .and_then(|c| c.etag);

        let request = self.build_request(fetch_type);
        debug!(seq, band_uuid, addresses = request.interface.addresses.len(), "fetching configuration");
        let reply = inner
            .api
            .fetch_conf(&enrollment.jwt, cached_etag.as_deref(), &request)
            .await?;

        let mut applied = inner.applied_seq.lock().await;
        if *applied > seq {
            info!(seq, applied = *applied, "discarding result of superseded fetch");
            return Ok(FetchOutcome::Superseded);
        }
        *applied = seq;

        let (etag, response) = match reply {
            ConfReply::NotModified => {
                debug!(band_uuid, "cached configuration is current");
                return Ok(FetchOutcome::NotModified);
            }
            ConfReply::Fetched { etag, response } => (etag, response),
        };

        match response.status {
            STATUS_OK => {
                let Some(mut conf) = response.conf else {
                    return Err(ConfigError::Rejected {
                        status: response.status,
                        msg: "response did not include a configuration".into(),
                    });
                };
                conf.etag = etag;
                inner.store.persist_config(band_uuid, &conf).await?;
                inner.mfa.clear();
                self.apply_to_engine(&conf).await?;
                info!(
                    band_uuid,
                    peers = conf.peers.len(),
                    links = conf.links.len(),
                    "configuration updated"
                );
                Ok(FetchOutcome::Updated(conf))
            }
            STATUS_MFA_REQUIRED => {
                let sso_url = response.sso_url.unwrap_or_default();
                info!(band_uuid, sso_url = %sso_url, "MFA authentication required");
                inner.mfa.set(sso_url.clone());
                Ok(FetchOutcome::MfaRequired { sso_url })
            }
            status => {
                let msg = response.msg.unwrap_or_else(|| format!("status {status}"));
                warn!(band_uuid, status, msg = %msg, "configuration fetch rejected");
                Err(ConfigError::Rejected { status, msg })
            }
        }
    }

    /// Re-applies a configuration to a running engine. Nothing happens while
    /// the tunnel is not up; the session starts the engine with the stored copy.
    async fn apply_to_engine(&self, conf: &BandConfig) -> Result<(), ConfigError> {
        let status = &self.inner.status;
        if status
            .transition(&[ConnectionStatus::Connected], ConnectionStatus::Reasserting)
            .is_err()
        {
            return Ok(());
        }

        match self.inner.engine.update_config(conf).await {
            Ok(()) => {
                status.transition(&[ConnectionStatus::Reasserting], ConnectionStatus::Connected)
                    .ok();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "engine rejected configuration");
                status.transition(&[ConnectionStatus::Reasserting], ConnectionStatus::Invalid)
                    .ok();
                Err(e.into())
            }
        }
    }

    /// Runs a fetch on the worker task, aborting any fetch still in flight.
    pub fn request_fetch(&self, fetch_type: FetchType) {
        let this = self.clone();
        let mut worker = match self.inner.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = worker.take() {
            previous.abort();
        }
        *worker = Some(tokio::spawn(async move {
            match this.fetch_config(fetch_type).await {
                Ok(outcome) => debug!(?outcome, "background fetch finished"),
                Err(e) => warn!(error = %e, kind = %e.kind(), "background fetch failed"),
            }
        }));
    }

    /// Aborts the in-flight worker, if any.
    pub fn cancel(&self) {
        let mut worker = match self.inner.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = worker.take() {
            handle.abort();
            debug!("cancelled configuration worker");
        }
    }
}
