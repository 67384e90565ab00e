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

//! Enrollment lifecycle: joining, switching and leaving bands.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tracing::{info, warn};

use mudband_types::api::{
    AnonymousBandRequest, EnrollRequest, STATUS_BAND_NOT_FOUND, STATUS_DEVICE_NOT_FOUND,
    STATUS_MFA_REQUIRED, STATUS_OK,
};
use mudband_types::{BandAdmin, Enrollment, EnrollmentSummary};

use crate::api::{ApiClient, ApiError};
use crate::engine::{EngineError, TunnelEngine};
use crate::error::{ErrorKind, LOCAL_FAILURE_MESSAGE};
use crate::status::{ConnectionStatus, LifecycleGate, StatusCell};
use crate::store::{BandStore, StoreError};

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("another enrollment or connect operation is in progress")]
    InProgress,

    #[error("enrollments cannot change while the tunnel is {0}")]
    Busy(ConnectionStatus),

    #[error("no band is enrolled")]
    NotEnrolled,

    #[error("band {0} is not public")]
    NotPublic(String),

    #[error("this device is not an administrator of band {0}")]
    NotAdmin(String),

    #[error("{msg}")]
    Rejected { status: i64, msg: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl EnrollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. } => ErrorKind::ServerRejected,
            Self::Api(e) => e.kind(),
            Self::InProgress
            | Self::Busy(_)
            | Self::NotEnrolled
            | Self::NotPublic(_)
            | Self::NotAdmin(_)
            | Self::Store(_)
            | Self::Engine(_) => ErrorKind::LocalState,
        }
    }

    /// Text suitable for the user. Store and engine details stay in the log.
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Engine(_) => LOCAL_FAILURE_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }

    fn rejected(status: i64, msg: Option<String>) -> Self {
        Self::Rejected {
            status,
            msg: msg.unwrap_or_else(|| format!("request failed with status {status}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollOutcome {
    Enrolled(Enrollment),
    MfaRequired { sso_url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnenrollOutcome {
    /// The server acknowledged and local state was deleted.
    Removed,
    /// Nothing was stored for the band.
    NotEnrolled,
}

pub struct EnrollmentManager<E> {
    api: ApiClient,
    store: BandStore,
    engine: Arc<E>,
    status: StatusCell,
    gate: LifecycleGate,
}

impl<E: TunnelEngine> EnrollmentManager<E> {
    pub fn new(
        api: ApiClient,
        store: BandStore,
        engine: Arc<E>,
        status: StatusCell,
        gate: LifecycleGate,
    ) -> Self {
        Self {
            api,
            store,
            engine,
            status,
            gate,
        }
    }

    /// Takes the lifecycle gate and checks the tunnel is idle. While the gate
    /// is held the session cannot leave Disconnected.
    fn enter(&self) -> Result<MutexGuard<'_, ()>, EnrollError> {
        let Some(guard) = self.gate.try_enter() else {
            let status = self.status.get();
            if status.locks_enrollment() {
                return Err(EnrollError::Busy(status));
            }
            return Err(EnrollError::InProgress);
        };
        self.ensure_idle()?;
        Ok(guard)
    }

    fn ensure_idle(&self) -> Result<(), EnrollError> {
        let status = self.status.get();
        if status.locks_enrollment() {
            warn!(%status, "enrollment change refused while tunnel is active");
            return Err(EnrollError::Busy(status));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, token, secret))]
    pub async fn enroll(
        &self,
        token: &str,
        device_name: &str,
        secret: Option<&str>,
    ) -> Result<EnrollOutcome, EnrollError> {
        let _gate = self.enter()?;
        self.enroll_locked(token, device_name, secret).await
    }

    async fn enroll_locked(
        &self,
        token: &str,
        device_name: &str,
        secret: Option<&str>,
    ) -> Result<EnrollOutcome, EnrollError> {
        let keys = self.engine.create_key_pair()?;
        let request = EnrollRequest {
            token: token.trim().to_string(),
            name: device_name.to_string(),
            wireguard_pubkey: keys.public_key.clone(),
            secret: secret.unwrap_or_default().to_string(),
        };
        let response = self.api.enroll(&request).await?;

        match response.status {
            STATUS_OK => {
                let Some(band) = response.band else {
                    return Err(EnrollError::rejected(
                        response.status,
                        Some("response did not include a band".into()),
                    ));
                };
                let Some(jwt) = response.jwt.or(band.jwt) else {
                    return Err(EnrollError::rejected(
                        response.status,
                        Some("response did not include a credential".into()),
                    ));
                };

                let enrollment = Enrollment {
                    band_uuid: band.uuid,
                    band_name: band.name,
                    jwt,
                    wireguard_privkey: keys.private_key,
                    opt_public: band.opt_public,
                    device_name: device_name.to_string(),
                    enrolled_at: Utc::now(),
                };
                self.store.persist_enrollment(&enrollment).await?;
                info!(
                    band_uuid = %enrollment.band_uuid,
                    band_name = %enrollment.band_name,
                    "enrolled"
                );
                Ok(EnrollOutcome::Enrolled(enrollment))
            }
            STATUS_MFA_REQUIRED => {
                let sso_url = response.sso_url.unwrap_or_default();
                info!(sso_url = %sso_url, "enrollment requires MFA authentication");
                Ok(EnrollOutcome::MfaRequired { sso_url })
            }
            status => {
                warn!(status, msg = ?response.msg, "enrollment rejected");
                Err(EnrollError::rejected(status, response.msg))
            }
        }
    }

    /// Makes another stored enrollment the default. `Ok(false)` when the band
    /// is not enrolled on this device.
    pub async fn change_enrollment(&self, band_uuid: &str) -> Result<bool, EnrollError> {
        let _gate = self.enter()?;
        if self.store.set_default(band_uuid).await? {
            Ok(true)
        } else {
            warn!(band_uuid, "cannot switch to a band that is not enrolled");
            Ok(false)
        }
    }

    /// Leaves a band. Local state is only deleted after the server agrees.
    #[tracing::instrument(skip(self))]
    pub async fn unenroll(&self, band_uuid: &str) -> Result<UnenrollOutcome, EnrollError> {
        let _gate = self.enter()?;

        let Some(enrollment) = self.store.load_enrollment(band_uuid).await? else {
            info!("band not enrolled, nothing to do");
            return Ok(UnenrollOutcome::NotEnrolled);
        };

        let reply = self.api.unenroll(&enrollment.jwt).await?;
        match reply.status {
            STATUS_OK | STATUS_BAND_NOT_FOUND | STATUS_DEVICE_NOT_FOUND => {
                if reply.status != STATUS_OK {
                    info!(status = reply.status, "server no longer knows this device, removing");
                }
                self.store.remove_band(band_uuid).await?;
                info!("unenrolled");
                Ok(UnenrollOutcome::Removed)
            }
            status => {
                warn!(status, msg = ?reply.msg, "unenroll rejected");
                Err(EnrollError::rejected(status, reply.msg))
            }
        }
    }

    pub async fn list_enrollments(&self) -> Result<Vec<EnrollmentSummary>, EnrollError> {
        Ok(self.store.list_enrollments().await?)
    }

    /// Sign-in URL for the web CLI of the default band.
    #[tracing::instrument(skip(self))]
    pub async fn webcli_url(&self) -> Result<String, EnrollError> {
        let enrollment = self
            .store
            .default_enrollment()
            .await?
            .ok_or(EnrollError::NotEnrolled)?;
        if !enrollment.opt_public {
            return Err(EnrollError::NotPublic(enrollment.band_uuid));
        }

        let reply = self.api.webcli_signin(&enrollment.jwt).await?;
        match (reply.status, reply.url) {
            (STATUS_OK, Some(url)) => Ok(url),
            (STATUS_OK, None) => Err(EnrollError::rejected(
                STATUS_OK,
                Some("response did not include a sign-in URL".into()),
            )),
            (status, _) => Err(EnrollError::rejected(status, reply.msg)),
        }
    }

    /// Creates an anonymous band administered by this device and enrolls into it.
    #[tracing::instrument(skip(self, description))]
    pub async fn create_band_as_guest(
        &self,
        name: &str,
        description: &str,
        device_name: &str,
    ) -> Result<EnrollOutcome, EnrollError> {
        let _gate = self.enter()?;

        let created = self
            .api
            .create_anonymous_band(&AnonymousBandRequest {
                name: name.to_string(),
                description: description.to_string(),
            })
            .await?;
        let (band_uuid, admin_jwt) = match (created.status, created.band_uuid, created.jwt) {
            (STATUS_OK, Some(uuid), Some(jwt)) => (uuid, jwt),
            (status, _, _) => return Err(EnrollError::rejected(status, created.msg)),
        };

        self.store
            .save_admin(&BandAdmin {
                band_uuid: band_uuid.clone(),
                jwt: admin_jwt.clone(),
            })
            .await?;
        info!(band_uuid = %band_uuid, "created guest band");

        let issued = self.api.create_enrollment_token(&admin_jwt).await?;
        let token = match (issued.status, issued.token) {
            (STATUS_OK, Some(token)) => token,
            (status, _) => return Err(EnrollError::rejected(status, issued.msg)),
        };

        self.enroll_locked(&token, device_name, None).await
    }

    /// A shareable enrollment token for the default band. Requires this device
    /// to hold the band's admin credential.
    #[tracing::instrument(skip(self))]
    pub async fn issue_enrollment_token(&self) -> Result<String, EnrollError> {
        let band_uuid = self
            .store
            .default_band_uuid()
            .await
            .ok_or(EnrollError::NotEnrolled)?;
        let admin = self
            .store
            .load_admin(&band_uuid)
            .await?
            .ok_or_else(|| EnrollError::NotAdmin(band_uuid.clone()))?;

        let reply = self.api.enrollment_token(&admin.jwt).await?;
        match (reply.status, reply.token_uuid) {
            (STATUS_OK, Some(token)) => Ok(token),
            (status, _) => Err(EnrollError::rejected(status, reply.msg)),
        }
    }
}
